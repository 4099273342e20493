//! Tiny llama-shaped GGUF models written on the fly for session tests.

#![allow(dead_code)]

use ember_core::gguf::{GgufValue, GgufWriter};
use ember_infer::{CompletionParams, LoadConfig, SamplingParams, Session};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const DIM: u64 = 16;
pub const FF: u64 = 32;
pub const LAYERS: u32 = 2;
pub const HEADS: u32 = 2;
pub const CONTEXT: u32 = 64;

/// Byte tokens, `▁`, ASCII letters and digits, a few punctuation marks.
pub fn pieces() -> Vec<(String, i32)> {
    let mut out = vec![
        ("<unk>".to_string(), 2),
        ("<s>".to_string(), 3),
        ("</s>".to_string(), 3),
    ];
    out.extend((0..=255u8).map(|b| (format!("<0x{b:02X}>"), 6)));
    out.push(("\u{2581}".to_string(), 1));
    let chars = ('a'..='z').chain('A'..='Z').chain('0'..='9').chain(".,!?".chars());
    out.extend(chars.map(|c| (c.to_string(), 1)));
    out
}

pub fn token_of(piece: &str) -> u32 {
    pieces()
        .iter()
        .position(|(p, _)| p == piece)
        .map(|i| i as u32)
        .unwrap_or_else(|| panic!("no piece {piece:?}"))
}

pub fn vocab_size() -> u64 {
    pieces().len() as u64
}

/// Deterministic values in `[-scale, scale)`.
fn noise(seed: u64, n: usize, scale: f32) -> Vec<f32> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..n)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            ((state >> 40) as f32 / (1u64 << 24) as f32 * 2.0 - 1.0) * scale
        })
        .collect()
}

fn header(w: &mut GgufWriter, arch: &str) {
    w.add_str("general.architecture", arch);
    w.add_str("general.name", "toy");
    w.add_u32(format!("{arch}.context_length"), CONTEXT);
    w.add_u32(format!("{arch}.embedding_length"), DIM as u32);
    w.add_u32(format!("{arch}.block_count"), LAYERS);
    w.add_u32(format!("{arch}.feed_forward_length"), FF as u32);
    w.add_u32(format!("{arch}.attention.head_count"), HEADS);
    w.add_u32(format!("{arch}.attention.head_count_kv"), HEADS);
    w.add_f32(format!("{arch}.rope.freq_base"), 10000.0);
    w.add_f32(format!("{arch}.attention.layer_norm_rms_epsilon"), 1e-5);
}

pub fn write_model(path: &Path) {
    let vocab = pieces();
    let n_vocab = vocab.len() as u64;
    let mut w = GgufWriter::new();
    header(&mut w, "llama");
    w.add_str("tokenizer.ggml.model", "llama");
    w.add_kv(
        "tokenizer.ggml.tokens",
        GgufValue::Array(vocab.iter().map(|(p, _)| GgufValue::String(p.clone())).collect()),
    );
    w.add_kv(
        "tokenizer.ggml.token_type",
        GgufValue::Array(vocab.iter().map(|(_, t)| GgufValue::Int32(*t)).collect()),
    );
    w.add_kv(
        "tokenizer.ggml.scores",
        GgufValue::Array(vocab.iter().map(|_| GgufValue::Float32(0.0)).collect()),
    );
    w.add_u32("tokenizer.ggml.bos_token_id", 1);
    w.add_u32("tokenizer.ggml.eos_token_id", 2);
    w.add_u32("tokenizer.ggml.unknown_token_id", 0);

    let ones = vec![1.0f32; DIM as usize];
    let mut seed = 1;
    let mut matrix = |w: &mut GgufWriter, name: String, cols: u64, rows: u64, scale: f32| {
        seed += 1;
        w.add_f32_tensor(name, &[cols, rows], &noise(seed, (cols * rows) as usize, scale));
    };
    matrix(&mut w, "token_embd.weight".into(), DIM, n_vocab, 1.0);
    for l in 0..LAYERS {
        w.add_f32_tensor(format!("blk.{l}.attn_norm.weight"), &[DIM], &ones);
        w.add_f32_tensor(format!("blk.{l}.ffn_norm.weight"), &[DIM], &ones);
        for t in ["attn_q", "attn_k", "attn_v", "attn_output"] {
            matrix(&mut w, format!("blk.{l}.{t}.weight"), DIM, DIM, 0.4);
        }
        matrix(&mut w, format!("blk.{l}.ffn_gate.weight"), DIM, FF, 0.4);
        matrix(&mut w, format!("blk.{l}.ffn_up.weight"), DIM, FF, 0.4);
        matrix(&mut w, format!("blk.{l}.ffn_down.weight"), FF, DIM, 0.3);
    }
    w.add_f32_tensor("output_norm.weight", &[DIM], &ones);
    matrix(&mut w, "output.weight".into(), DIM, n_vocab, 1.0);
    w.write_file(path).expect("write toy model");
}

/// Rank-2 adapter on every layer's query projection.
pub fn write_adapter(path: &Path, arch: &str) {
    let mut w = GgufWriter::new();
    w.add_str("general.architecture", arch);
    w.add_str("general.type", "adapter");
    w.add_f32("adapter.lora.alpha", 2.0);
    for l in 0..LAYERS {
        let base = format!("blk.{l}.attn_q.weight");
        w.add_f32_tensor(format!("{base}.lora_a"), &[DIM, 2], &noise(100 + l as u64, 32, 0.5));
        w.add_f32_tensor(format!("{base}.lora_b"), &[2, DIM], &noise(200 + l as u64, 32, 0.5));
    }
    w.write_file(path).expect("write toy adapter");
}

/// Rank-2 adapter on the output head, large enough to change greedy picks.
pub fn write_head_adapter(path: &Path) {
    let n_vocab = vocab_size();
    let mut w = GgufWriter::new();
    w.add_str("general.architecture", "llama");
    w.add_str("general.type", "adapter");
    w.add_f32("adapter.lora.alpha", 64.0);
    w.add_f32_tensor("output.weight.lora_a", &[DIM, 2], &noise(300, 2 * DIM as usize, 1.0));
    w.add_f32_tensor("output.weight.lora_b", &[2, n_vocab], &noise(301, 2 * n_vocab as usize, 1.0));
    w.write_file(path).expect("write head adapter");
}

pub struct Fixture {
    pub dir: TempDir,
    pub model: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let model = dir.path().join("toy.gguf");
        write_model(&model);
        Self { dir, model }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn session(&self, config: LoadConfig) -> Session {
        Session::load(&self.model, config).expect("load toy model")
    }

    pub fn default_session(&self) -> Session {
        self.session(LoadConfig {
            n_threads: 1,
            ..Default::default()
        })
    }
}

pub fn greedy(n_predict: i32) -> CompletionParams {
    CompletionParams {
        sampling: SamplingParams {
            temperature: 0.0,
            seed: 7,
            ignore_eos: true,
            ..Default::default()
        },
        n_predict,
        ..Default::default()
    }
}

/// Wait until the background worker has released the session.
pub fn wait_ready(session: &Session) {
    for _ in 0..500 {
        if session.state() == ember_infer::SessionState::Ready {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    panic!("session stayed busy");
}
