use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use ember_core::chat_template::{ChatMessage, Role};
use ember_infer::grammar::{json_schema, Grammar};
use ember_infer::{
    AdapterSpec, CompletionInput, CompletionParams, CompletionResult, GrammarSpec, LoadConfig,
    Session,
};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser)]
#[command(name = "ember")]
#[command(about = "Local LLM inference over GGUF models")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Complete a prompt and stream the result to stdout
    Run {
        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        sampling: SamplingArgs,

        /// Prompt text
        #[arg(short, long)]
        prompt: String,

        /// Restore a saved KV cache before completing
        #[arg(long)]
        load_session: Option<PathBuf>,

        /// Save the KV cache after completing
        #[arg(long)]
        save_session: Option<PathBuf>,

        /// Print the final result as JSON instead of streaming text
        #[arg(long)]
        json: bool,
    },

    /// Interactive chat using the model's chat template
    Chat {
        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        sampling: SamplingArgs,

        /// System prompt
        #[arg(long)]
        system: Option<String>,
    },

    /// Show model metadata
    Inspect {
        /// Path to model file (.gguf)
        model: PathBuf,

        /// Print every metadata key
        #[arg(long)]
        all: bool,
    },

    /// Tokenize text and print ids
    Tokenize {
        /// Path to model file (.gguf)
        model: PathBuf,

        text: String,

        /// Prepend BOS
        #[arg(long)]
        bos: bool,

        /// Do not map special-token text to special tokens
        #[arg(long)]
        no_special: bool,
    },

    /// Print the embedding of a text as JSON
    Embed {
        #[command(flatten)]
        model: ModelArgs,

        text: String,

        /// -1 session default, 0 raw, 1 L2
        #[arg(long, default_value = "-1", allow_hyphen_values = true)]
        normalize: i32,
    },

    /// Measure prompt processing and generation throughput
    Bench {
        #[command(flatten)]
        model: ModelArgs,

        /// Prompt tokens
        #[arg(long, default_value = "128")]
        pp: usize,

        /// Generated tokens
        #[arg(long, default_value = "32")]
        tg: usize,

        /// Parallel sequences
        #[arg(long, default_value = "1")]
        pl: usize,

        /// Repetitions
        #[arg(long, default_value = "3")]
        nr: usize,
    },

    /// Check a GBNF grammar, or convert a JSON schema to GBNF
    Grammar {
        /// Grammar (.gbnf) or schema (.json) file
        file: PathBuf,
    },
}

#[derive(Args)]
struct ModelArgs {
    /// Path to model file (.gguf)
    model: PathBuf,

    /// Load settings as JSON; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Context size (0 = model default)
    #[arg(short = 'c', long)]
    ctx: Option<u32>,

    /// Worker threads (0 = all cores)
    #[arg(short = 't', long)]
    threads: Option<u32>,

    /// LoRA adapter as PATH or PATH:SCALE, repeatable
    #[arg(long)]
    lora: Vec<String>,

    /// Read the whole file instead of mapping it
    #[arg(long)]
    no_mmap: bool,
}

#[derive(Args)]
struct SamplingArgs {
    /// Completion parameters as JSON; flags below override it
    #[arg(long)]
    params: Option<PathBuf>,

    /// Tokens to generate (-1 = until a stop condition)
    #[arg(short = 'n', long, allow_hyphen_values = true)]
    n_predict: Option<i32>,

    #[arg(long)]
    temperature: Option<f32>,

    /// RNG seed (-1 = random)
    #[arg(long, allow_hyphen_values = true)]
    seed: Option<i64>,

    #[arg(long)]
    top_k: Option<i32>,

    #[arg(long)]
    top_p: Option<f32>,

    #[arg(long)]
    min_p: Option<f32>,

    /// Stop word, repeatable
    #[arg(long)]
    stop: Vec<String>,

    /// GBNF grammar file
    #[arg(long)]
    grammar_file: Option<PathBuf>,

    /// JSON schema file the output must satisfy
    #[arg(long)]
    json_schema: Option<PathBuf>,

    #[arg(long)]
    ignore_eos: bool,
}

fn parse_lora(spec: &str) -> anyhow::Result<AdapterSpec> {
    let (path, scale) = match spec.rsplit_once(':') {
        Some((p, s)) if s.parse::<f32>().is_ok() => (p, s.parse::<f32>()?),
        _ => (spec, 1.0),
    };
    Ok(AdapterSpec {
        path: PathBuf::from(path),
        scale,
    })
}

impl ModelArgs {
    fn load_config(&self, embedding: bool) -> anyhow::Result<LoadConfig> {
        let mut config = match &self.config {
            Some(path) => LoadConfig::from_json_file(path)
                .with_context(|| format!("reading {}", path.display()))?,
            None => LoadConfig::default(),
        };
        if let Some(ctx) = self.ctx {
            config.n_ctx = ctx;
        }
        if let Some(threads) = self.threads {
            config.n_threads = threads;
        }
        for spec in &self.lora {
            config.lora.push(parse_lora(spec)?);
        }
        if self.no_mmap {
            config.use_mmap = false;
        }
        config.embedding |= embedding;
        Ok(config)
    }

    fn open(&self, embedding: bool) -> anyhow::Result<Session> {
        let config = self.load_config(embedding)?;
        let start = Instant::now();
        let session = Session::load(&self.model, config)
            .with_context(|| format!("loading {}", self.model.display()))?;
        let info = session.model_info()?;
        eprintln!(
            "loaded: {} (ctx {}) in {:.1}ms",
            info.description,
            session.n_ctx(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(session)
    }
}

impl SamplingArgs {
    fn completion_params(&self) -> anyhow::Result<CompletionParams> {
        let mut params = match &self.params {
            Some(path) => CompletionParams::from_json_file(path)
                .with_context(|| format!("reading {}", path.display()))?,
            None => CompletionParams::default(),
        };
        if let Some(n) = self.n_predict {
            params.n_predict = n;
        }
        if let Some(t) = self.temperature {
            params.sampling.temperature = t;
        }
        if let Some(s) = self.seed {
            params.sampling.seed = s;
        }
        if let Some(k) = self.top_k {
            params.sampling.top_k = k;
        }
        if let Some(p) = self.top_p {
            params.sampling.top_p = p;
        }
        if let Some(p) = self.min_p {
            params.sampling.min_p = p;
        }
        params.stop.extend(self.stop.iter().cloned());
        params.sampling.ignore_eos |= self.ignore_eos;
        if let Some(path) = &self.grammar_file {
            params.grammar = GrammarSpec {
                grammar: Some(std::fs::read_to_string(path)?),
                ..Default::default()
            };
        } else if let Some(path) = &self.json_schema {
            let schema = serde_json::from_str(&std::fs::read_to_string(path)?)?;
            params.grammar = GrammarSpec {
                json_schema: Some(schema),
                ..Default::default()
            };
        }
        Ok(params)
    }
}

fn main() {
    let cli = Cli::parse();
    ember_core::logging::init("warn");

    let result = match cli.command {
        Commands::Run {
            model,
            sampling,
            prompt,
            load_session,
            save_session,
            json,
        } => cmd_run(&model, &sampling, &prompt, load_session, save_session, json),
        Commands::Chat {
            model,
            sampling,
            system,
        } => cmd_chat(&model, &sampling, system),
        Commands::Inspect { model, all } => cmd_inspect(&model, all),
        Commands::Tokenize {
            model,
            text,
            bos,
            no_special,
        } => cmd_tokenize(&model, &text, bos, !no_special),
        Commands::Embed {
            model,
            text,
            normalize,
        } => cmd_embed(&model, &text, normalize),
        Commands::Bench {
            model,
            pp,
            tg,
            pl,
            nr,
        } => cmd_bench(&model, pp, tg, pl, nr),
        Commands::Grammar { file } => cmd_grammar(&file),
    };
    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

/// Stream tokens to stdout and return the final result.
fn stream_completion(
    session: &Session,
    input: CompletionInput,
    params: CompletionParams,
    echo: bool,
) -> anyhow::Result<CompletionResult> {
    let stream = session.complete(input, params)?;
    let mut stdout = std::io::stdout().lock();
    let result = stream.collect_with(|token| {
        if echo {
            let _ = stdout.write_all(token.text.as_bytes());
            let _ = stdout.flush();
        }
    })?;
    if echo {
        writeln!(stdout)?;
    }
    Ok(result)
}

fn print_timings(result: &CompletionResult) {
    let t = &result.timings;
    eprintln!(
        "prompt: {} tokens ({} cached) in {:.1}ms, {:.1} tok/s",
        t.prompt_n, result.tokens_cached, t.prompt_ms, t.prompt_per_second
    );
    eprintln!(
        "generation: {} tokens in {:.1}ms, {:.1} tok/s, stop: {:?}",
        t.predicted_n, t.predicted_ms, t.predicted_per_second, result.stop_reason
    );
}

fn cmd_run(
    model: &ModelArgs,
    sampling: &SamplingArgs,
    prompt: &str,
    load_session: Option<PathBuf>,
    save_session: Option<PathBuf>,
    json: bool,
) -> anyhow::Result<()> {
    let session = model.open(false)?;
    let params = sampling.completion_params()?;
    if let Some(path) = &load_session {
        let (n, _) = session.load_session(path)?;
        eprintln!("session: restored {n} tokens from {}", path.display());
    }

    let result = stream_completion(&session, CompletionInput::Prompt(prompt.to_string()), params, !json)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_timings(&result);
    }

    if let Some(path) = &save_session {
        let n = session.save_session(path, 0)?;
        eprintln!("session: saved {n} tokens to {}", path.display());
    }
    Ok(())
}

fn cmd_chat(model: &ModelArgs, sampling: &SamplingArgs, system: Option<String>) -> anyhow::Result<()> {
    let session = model.open(false)?;
    if !session.chat_template_available() {
        eprintln!("warning: no chat template for this model, messages are joined as plain text");
    }
    let params = sampling.completion_params()?;
    let mut messages: Vec<ChatMessage> = system
        .map(|s| ChatMessage::new(Role::System, s))
        .into_iter()
        .collect();

    eprintln!("type /exit to quit");
    let stdin = std::io::stdin();
    loop {
        eprint!("> ");
        std::io::stderr().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/exit" {
            break;
        }
        messages.push(ChatMessage::new(Role::User, line));
        let result = stream_completion(&session, CompletionInput::Chat(messages.clone()), params.clone(), true)?;
        messages.push(ChatMessage::new(Role::Assistant, result.text));
    }
    Ok(())
}

fn cmd_inspect(model: &Path, all: bool) -> anyhow::Result<()> {
    let info = ember_core::read_model_info(model)?;
    let meta = &info.metadata;
    println!("  description:  {}", info.description);
    if let Some(name) = &meta.name {
        println!("  name:         {name}");
    }
    println!("  architecture: {:?}", meta.architecture);
    println!("  parameters:   {}", format_params(meta.parameters));
    println!("  context:      {}", meta.context_length);
    println!("  embedding:    {}", meta.embedding_dim);
    println!("  heads:        {} (kv: {})", meta.head_count, meta.head_count_kv);
    println!("  layers:       {}", meta.layer_count);
    println!("  vocab:        {}", meta.vocab_size);
    if let Some(rope) = meta.rope_freq_base {
        println!("  rope base:    {rope}");
    }
    println!("  tensors:      {}", info.tensor_count);
    println!("  size:         {}", format_bytes(info.size_bytes));
    println!(
        "  chat template: {}",
        if info.chat_template.is_some() { "embedded" } else { "none" }
    );

    if all {
        println!();
        println!("metadata ({} keys):", info.kv.len());
        for (key, value) in &info.kv {
            let value = if value.len() > 80 {
                let cut = (0..=77).rev().find(|&i| value.is_char_boundary(i)).unwrap_or(0);
                format!("{}...", &value[..cut])
            } else {
                value.clone()
            };
            println!("  {key}: {value}");
        }
    }
    Ok(())
}

fn cmd_tokenize(model: &Path, text: &str, bos: bool, parse_special: bool) -> anyhow::Result<()> {
    let config = LoadConfig {
        vocab_only: true,
        ..Default::default()
    };
    let session = Session::load(model, config)?;
    let tokens = session.tokenize(text, bos, parse_special)?;
    for &t in &tokens {
        println!("{t:>8} {:?}", session.detokenize(&[t])?);
    }
    eprintln!("{} tokens", tokens.len());
    Ok(())
}

fn cmd_embed(model: &ModelArgs, text: &str, normalize: i32) -> anyhow::Result<()> {
    let session = model.open(true)?;
    let embedding = session.embed(text, normalize)?;
    println!("{}", serde_json::to_string(&embedding)?);
    Ok(())
}

fn cmd_bench(model: &ModelArgs, pp: usize, tg: usize, pl: usize, nr: usize) -> anyhow::Result<()> {
    let session = model.open(false)?;
    let report = session.bench(pp, tg, pl, nr)?;
    println!("| model | size | params | test | t/s |");
    println!("| --- | ---: | ---: | --- | ---: |");
    let row = |test: String, avg: f64, dev: f64| {
        println!(
            "| {} | {} | {} | {test} | {avg:.2} ± {dev:.2} |",
            report.model,
            format_bytes(report.size_bytes),
            format_params(report.parameters)
        )
    };
    row(format!("pp{}", report.pp), report.pp_avg, report.pp_std);
    if report.tg > 0 {
        row(format!("tg{} x{}", report.tg, report.pl), report.tg_avg, report.tg_std);
    }
    Ok(())
}

fn cmd_grammar(file: &Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let gbnf = if file.extension().is_some_and(|e| e == "json") {
        let schema = serde_json::from_str(&text)?;
        json_schema::schema_to_gbnf(&schema)?
    } else {
        text
    };
    let grammar = Grammar::parse(&gbnf)?;
    if grammar.rules().is_empty() {
        bail!("grammar has no rules");
    }
    eprintln!("ok: {} rules", grammar.rules().len());
    if file.extension().is_some_and(|e| e == "json") {
        println!("{gbnf}");
    }
    Ok(())
}

fn format_params(n: u64) -> String {
    if n >= 1_000_000_000 {
        format!("{:.1}B", n as f64 / 1_000_000_000.0)
    } else if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.1}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

fn format_bytes(n: u64) -> String {
    if n >= 1024 * 1024 * 1024 {
        format!("{:.2} GB", n as f64 / (1024.0 * 1024.0 * 1024.0))
    } else if n >= 1024 * 1024 {
        format!("{:.2} MB", n as f64 / (1024.0 * 1024.0))
    } else if n >= 1024 {
        format!("{:.2} KB", n as f64 / 1024.0)
    } else {
        format!("{n} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lora_specs() {
        let a = parse_lora("adapters/q.gguf:0.5").unwrap();
        assert_eq!(a.path, PathBuf::from("adapters/q.gguf"));
        assert_eq!(a.scale, 0.5);
        let b = parse_lora("C:/models/q.gguf").unwrap();
        assert_eq!(b.path, PathBuf::from("C:/models/q.gguf"));
        assert_eq!(b.scale, 1.0);
    }

    #[test]
    fn human_sizes() {
        assert_eq!(format_params(15_200_000), "15.2M");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
        let cli = Cli::try_parse_from(["ember", "run", "m.gguf", "-p", "hi", "-n", "-1", "--lora", "a.gguf:0.3"]).unwrap();
        let Commands::Run { model, sampling, .. } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(sampling.n_predict, Some(-1));
        assert_eq!(model.lora, vec!["a.gguf:0.3".to_string()]);
    }
}
