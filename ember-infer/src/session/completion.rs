use super::stop::{find_stop, TextAssembler};
use super::{Session, SessionInner};
use crate::adapter::AdapterStack;
use crate::grammar::GrammarState;
use crate::params::{CompletionParams, GrammarSpec};
use crate::sampler::{SamplerPipeline, TokenConstraint};
use ember_core::chat_template::{ChatMessage, ChatOptions};
use ember_core::error::{EmberError, Result};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

#[derive(Debug, Clone)]
pub enum CompletionInput {
    Prompt(String),
    /// Rendered through the model's chat template.
    Chat(Vec<ChatMessage>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Cancelled,
    Eos,
    Word,
    Limit,
    ContextFull,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenProbability {
    pub token: u32,
    pub piece: String,
    pub prob: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenProbabilities {
    pub token: u32,
    pub piece: String,
    pub top: Vec<TokenProbability>,
}

/// One generated token. `text` is whatever became safe to show with it and
/// may be empty while a stop word or a split character is pending.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenOutput {
    pub token: u32,
    pub text: String,
    pub probs: Option<TokenProbabilities>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Timings {
    pub prompt_n: usize,
    pub prompt_ms: f64,
    pub prompt_per_second: f64,
    pub predicted_n: usize,
    pub predicted_ms: f64,
    pub predicted_per_second: f64,
}

fn rate(n: usize, ms: f64) -> f64 {
    if ms > 0.0 {
        n as f64 * 1000.0 / ms
    } else {
        0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionResult {
    pub text: String,
    pub tokens: Vec<u32>,
    pub stop_reason: StopReason,
    pub stopped_eos: bool,
    pub stopped_word: bool,
    /// Set for both `n_predict` and a full context.
    pub stopped_limit: bool,
    pub stopping_word: String,
    pub truncated: bool,
    pub tokens_evaluated: usize,
    pub tokens_predicted: usize,
    pub tokens_cached: usize,
    pub timings: Timings,
    pub probs: Vec<TokenProbabilities>,
    pub seed: u64,
}

#[derive(Debug)]
pub enum CompletionEvent {
    Token(TokenOutput),
    Done(Box<CompletionResult>),
    Error(EmberError),
}

/// Events of one completion in generation order. The stream always ends
/// with exactly one `Done` or `Error`.
#[derive(Debug)]
pub struct CompletionStream {
    rx: Receiver<CompletionEvent>,
    finished: bool,
}

impl Iterator for CompletionStream {
    type Item = CompletionEvent;

    fn next(&mut self) -> Option<CompletionEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.recv().unwrap_or_else(|_| {
            CompletionEvent::Error(EmberError::PredictionFailed(
                "completion worker exited without a result".into(),
            ))
        });
        if !matches!(event, CompletionEvent::Token(_)) {
            self.finished = true;
        }
        Some(event)
    }
}

impl CompletionStream {
    /// Drain the stream, handing each token to `on_token`.
    pub fn collect_with(self, mut on_token: impl FnMut(&TokenOutput)) -> Result<CompletionResult> {
        for event in self {
            match event {
                CompletionEvent::Token(t) => on_token(&t),
                CompletionEvent::Done(result) => return Ok(*result),
                CompletionEvent::Error(e) => return Err(e),
            }
        }
        Err(EmberError::PredictionFailed("completion stream ended early".into()))
    }

    pub fn wait(self) -> Result<CompletionResult> {
        self.collect_with(|_| {})
    }
}

/// Everything decided before the worker starts.
struct Job {
    prompt: Vec<u32>,
    params: CompletionParams,
    grammar: Option<GrammarState>,
    truncated: bool,
    adapters: Arc<AdapterStack>,
    generation: u64,
}

/// Fit `tokens` into `n_ctx` by keeping the first `n_keep` and erasing whole
/// blocks of half the remaining window after them.
pub(crate) fn truncate_prompt(tokens: &[u32], n_ctx: usize, n_keep: i32) -> Result<(Vec<u32>, bool)> {
    if tokens.len() < n_ctx {
        return Ok((tokens.to_vec(), false));
    }
    let n_keep = if n_keep < 0 { tokens.len() } else { n_keep as usize };
    let n_keep = n_keep.min(n_ctx.saturating_sub(4));
    let n_block = (n_ctx - n_keep) / 2;
    if n_block == 0 {
        return Err(EmberError::PredictionFailed(format!(
            "context of {n_ctx} is too small for a {} token prompt",
            tokens.len()
        )));
    }
    let erased = (tokens.len() - n_keep - n_block) / n_block;
    let mut out = tokens[..n_keep].to_vec();
    out.extend_from_slice(&tokens[n_keep + erased * n_block..]);
    tracing::debug!(
        "prompt truncated: {} -> {} tokens (kept {n_keep}, erased {} blocks of {n_block})",
        tokens.len(),
        out.len(),
        erased
    );
    Ok((out, true))
}

fn common_prefix(a: &[u32], b: &[u32]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn plain_chat(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

impl Session {
    /// Start a completion. Tokenization, chat rendering and grammar
    /// compilation happen here; decoding runs on a worker thread.
    pub fn complete(&self, input: CompletionInput, params: CompletionParams) -> Result<CompletionStream> {
        let inner = &self.inner;
        inner.compute()?;
        let job = prepare(inner, input, params)?;
        inner.begin_exclusive()?;

        let (tx, rx) = mpsc::sync_channel(0);
        let worker = Arc::clone(inner);
        let spawned = thread::Builder::new()
            .name("ember-completion".into())
            .spawn(move || {
                let dispatch = worker.dispatch.clone();
                tracing::dispatcher::with_default(&dispatch, || {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        run(&worker, job, &mut |t| tx.send(CompletionEvent::Token(t)).is_ok())
                    }));
                    let event = match outcome {
                        Ok(Ok(result)) => CompletionEvent::Done(Box::new(result)),
                        Ok(Err(e)) => {
                            tracing::warn!("completion failed: {e}");
                            CompletionEvent::Error(e)
                        }
                        Err(_) => CompletionEvent::Error(EmberError::PredictionFailed(
                            "completion worker panicked".into(),
                        )),
                    };
                    worker.end_exclusive();
                    let _ = tx.send(event);
                })
            });
        if let Err(e) = spawned {
            inner.end_exclusive();
            return Err(EmberError::PredictionFailed(format!("failed to spawn completion worker: {e}")));
        }
        Ok(CompletionStream { rx, finished: false })
    }
}

fn prepare(inner: &SessionInner, input: CompletionInput, mut params: CompletionParams) -> Result<Job> {
    let vocab = &inner.weights.vocab;
    let text = match input {
        CompletionInput::Prompt(p) => p,
        CompletionInput::Chat(messages) => {
            let Some(renderer) = inner.renderer.as_ref() else {
                tracing::warn!("no chat template for this model, joining messages");
                return prepare(inner, CompletionInput::Prompt(plain_chat(&messages)), params);
            };
            let options = ChatOptions {
                add_generation_prompt: params.add_generation_prompt,
                grammar: params.grammar.grammar.clone(),
            };
            let rendered = renderer.render(&messages, &options);
            params.stop.extend(rendered.additional_stops);
            if params.grammar.is_empty() && rendered.grammar.is_some() {
                params.grammar = GrammarSpec {
                    grammar: rendered.grammar,
                    json_schema: None,
                    lazy: rendered.grammar_lazy,
                    triggers: rendered.grammar_triggers,
                    preserved_tokens: rendered.preserved_tokens,
                };
            }
            rendered.prompt
        }
    };

    let mut tokens = vocab.tokenize(&text, vocab.add_bos_default(), params.parse_special)?;
    // a template that spells out BOS plus the implicit one
    let double_bos = vocab
        .bos()
        .is_some_and(|b| tokens.len() > 1 && tokens[0] == b && tokens[1] == b);
    if double_bos {
        tokens.remove(0);
    }
    if tokens.is_empty() {
        return Err(EmberError::PredictionFailed("prompt is empty".into()));
    }
    let (prompt, truncated) = truncate_prompt(&tokens, inner.n_ctx, params.n_keep)?;
    let grammar = GrammarState::compile(&params.grammar, vocab, Arc::clone(&inner.pieces))?;
    let (adapters, generation) = inner.adapter_snapshot();
    Ok(Job {
        prompt,
        params,
        grammar,
        truncated,
        adapters,
        generation,
    })
}

fn run(inner: &SessionInner, job: Job, emit: &mut dyn FnMut(TokenOutput) -> bool) -> Result<CompletionResult> {
    let compute = inner.compute()?;
    let transformer = &compute.transformer;
    let vocab = &inner.weights.vocab;
    let pieces = &inner.pieces;
    let params = &job.params;
    let n_ctx = inner.n_ctx;
    let cancelled = || inner.cancelled();

    let mut state = compute.state.lock();
    let state = &mut *state;
    if state.generation != job.generation {
        tracing::debug!("adapters changed, dropping cached prefix");
        state.cache.clear();
        state.generation = job.generation;
    }
    let cache = &mut state.cache;
    let scratch = &mut state.scratch;

    let mut common = common_prefix(cache.history(), &job.prompt);
    if common == job.prompt.len() {
        // the last prompt token is re-run to get fresh logits
        common -= 1;
    }
    cache.truncate(common);

    let constraint = job.grammar.map(|g| Box::new(g) as Box<dyn TokenConstraint>);
    let mut sampler = SamplerPipeline::new(&params.sampling, vocab, pieces, n_ctx, constraint);
    let mut result = CompletionResult {
        text: String::new(),
        tokens: Vec::new(),
        stop_reason: StopReason::Cancelled,
        stopped_eos: false,
        stopped_word: false,
        stopped_limit: false,
        stopping_word: String::new(),
        truncated: job.truncated,
        tokens_evaluated: job.prompt.len(),
        tokens_predicted: 0,
        tokens_cached: common,
        timings: Timings::default(),
        probs: Vec::new(),
        seed: sampler.seed(),
    };

    let prompt_start = Instant::now();
    let pending = &job.prompt[common..];
    let n_batch = inner.config.n_batch.max(1) as usize;
    let mut done = 0;
    for batch in pending.chunks(n_batch) {
        if cancelled() {
            tracing::debug!("completion cancelled during prompt ingestion");
            return Ok(result);
        }
        let batch_start = cache.len();
        for &tok in batch {
            done += 1;
            let last = done == pending.len();
            if let Err(e) = transformer.forward(tok, cache, scratch, &job.adapters, last) {
                cache.truncate(batch_start);
                return Err(e);
            }
        }
    }
    let prompt_ms = prompt_start.elapsed().as_secs_f64() * 1000.0;
    result.timings.prompt_n = pending.len();
    result.timings.prompt_ms = prompt_ms;
    result.timings.prompt_per_second = rate(pending.len(), prompt_ms);
    sampler.prime(&job.prompt);

    let decode_start = Instant::now();
    let mut text = TextAssembler::new();
    let n_keep = if params.n_keep < 0 {
        job.prompt.len()
    } else {
        params.n_keep as usize
    };
    let mut overrun = 0;
    let mut stop = (params.n_predict == 0).then_some(StopReason::Limit);

    while stop.is_none() {
        if cancelled() {
            tracing::debug!("completion cancelled after {} tokens", result.tokens.len());
            stop = Some(StopReason::Cancelled);
            break;
        }
        let sampled = sampler.sample(&scratch.logits)?;
        let token = sampled.token;
        sampler.accept(token)?;
        result.tokens.push(token);

        let piece = &pieces[token as usize];
        let eos = vocab.is_eog(token) && !params.sampling.ignore_eos;
        if !eos {
            text.push(piece);
        }

        let n_decoded = result.tokens.len();
        // a shift keeps one extra slot for BOS
        let keep = (n_keep + 1).min(cache.len());
        let can_shift = params.context_shift && (cache.len() - keep) / 2 > 0;
        if eos {
            stop = Some(StopReason::Eos);
        } else if let Some((at, word)) = find_stop(text.text(), &params.stop, piece.len()) {
            text.truncate(at);
            result.stopping_word = word;
            stop = Some(StopReason::Word);
        } else if params.n_predict > 0 && n_decoded >= params.n_predict as usize {
            if !text.has_pending_bytes() || overrun >= 3 {
                stop = Some(StopReason::Limit);
            } else {
                overrun += 1;
            }
        }
        if stop.is_none() && cache.is_full() && !can_shift {
            stop = Some(StopReason::ContextFull);
        }

        let chunk = if stop.is_some() {
            text.flush()
        } else {
            text.release(&params.stop)
        };
        let probs = (params.sampling.n_probs > 0).then(|| {
            let piece_of = |t: u32| String::from_utf8_lossy(&pieces[t as usize]).into_owned();
            TokenProbabilities {
                token,
                piece: piece_of(token),
                top: sampled
                    .top
                    .iter()
                    .map(|c| TokenProbability {
                        token: c.token,
                        piece: piece_of(c.token),
                        prob: c.prob,
                    })
                    .collect(),
            }
        });
        if let Some(p) = &probs {
            result.probs.push(p.clone());
        }
        if !emit(TokenOutput {
            token,
            text: chunk,
            probs,
        }) {
            tracing::debug!("completion receiver dropped");
            stop = Some(StopReason::Cancelled);
        }
        if stop.is_some() {
            break;
        }

        if cache.is_full() {
            let n_discard = (cache.len() - keep) / 2;
            cache.discard(keep, n_discard, transformer.rope());
            result.truncated = true;
        }
        transformer.forward(token, cache, scratch, &job.adapters, true)?;
    }

    text.flush();
    let stop = stop.unwrap_or(StopReason::Cancelled);
    let predicted_ms = decode_start.elapsed().as_secs_f64() * 1000.0;
    result.text = text.text().to_string();
    result.stop_reason = stop;
    result.stopped_eos = stop == StopReason::Eos;
    result.stopped_word = stop == StopReason::Word;
    result.stopped_limit = matches!(stop, StopReason::Limit | StopReason::ContextFull);
    result.tokens_predicted = result.tokens.len();
    result.timings.predicted_n = result.tokens.len();
    result.timings.predicted_ms = predicted_ms;
    result.timings.predicted_per_second = rate(result.tokens.len(), predicted_ms);
    tracing::debug!(
        "completion finished: {:?}, {} prompt + {} generated tokens",
        stop,
        result.tokens_evaluated,
        result.tokens_predicted
    );
    Ok(result)
}
