#![allow(clippy::needless_range_loop)]
//! CPU transformer backend for Llama-family GGUF checkpoints.

use crate::adapter::AdapterStack;
use crate::kv_cache::KvCache;
use crate::rope::RopeTable;
use crate::weights::ModelWeights;
use ember_core::dequant::{dequant_row, dot_row};
use ember_core::error::{EmberError, Result};
use ember_core::model::Architecture;
use ember_core::tensor::TensorInfo;
use rayon::prelude::*;
use std::sync::Arc;

/// Below this many multiply-adds a projection runs on the calling thread.
const PAR_THRESHOLD: usize = 1 << 14;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Activation {
    SwiGLU,
    GeGLU,
}

#[derive(Debug, Clone)]
struct RunnerConfig {
    dim: usize,
    n_layers: usize,
    n_heads: usize,
    n_kv_heads: usize,
    head_dim: usize,
    vocab_size: usize,
    ff_dim: usize,
    norm_eps: f32,
    n_ctx: usize,
    activation: Activation,
    norm_weight_offset: f32,
    embed_scale: Option<f32>,
}

struct LayerWeights {
    attn_norm: Vec<f32>,
    ffn_norm: Vec<f32>,
    q: usize,
    k: usize,
    v: usize,
    o: usize,
    gate: usize,
    up: usize,
    down: usize,
    q_bias: Option<Vec<f32>>,
    k_bias: Option<Vec<f32>>,
    v_bias: Option<Vec<f32>>,
}

/// Working buffers for one forward pass. After `forward`, `normed` holds the
/// final normalized hidden state and `logits` the output row (when asked).
pub struct Scratch {
    hidden: Vec<f32>,
    residual: Vec<f32>,
    pub normed: Vec<f32>,
    q: Vec<f32>,
    k: Vec<f32>,
    v: Vec<f32>,
    attn_out: Vec<f32>,
    attn_proj: Vec<f32>,
    scores: Vec<f32>,
    gate: Vec<f32>,
    up: Vec<f32>,
    ffn_out: Vec<f32>,
    pub logits: Vec<f32>,
}

/// Immutable compute graph over shared weights. Per-sequence state lives in
/// the `KvCache` and `Scratch` handed to each call.
pub struct Transformer {
    weights: Arc<ModelWeights>,
    cfg: RunnerConfig,
    rope: RopeTable,
    layers: Vec<LayerWeights>,
    token_embd: usize,
    output_norm: Vec<f32>,
    output: usize,
    pool: rayon::ThreadPool,
}

fn norm_vector(weights: &ModelWeights, name: &str, len: usize) -> Result<Vec<f32>> {
    let slot = weights.require_slot(name)?;
    let (info, data) = weights.by_slot(slot);
    if info.num_elements() as usize != len {
        return Err(EmberError::ModelLoadFailed(format!(
            "{name}: expected {len} elements, found {:?}",
            info.shape
        )));
    }
    let mut out = vec![0.0f32; len];
    dequant_row(info.dtype, data, &mut out)?;
    Ok(out)
}

fn optional_vector(weights: &ModelWeights, name: &str, len: usize) -> Result<Option<Vec<f32>>> {
    match weights.slot(name) {
        Some(_) => norm_vector(weights, name, len).map(Some),
        None => Ok(None),
    }
}

fn matrix(weights: &ModelWeights, name: &str, cols: usize, rows: usize) -> Result<usize> {
    let slot = weights.require_slot(name)?;
    let (info, _) = weights.by_slot(slot);
    if info.row_len() != cols || info.n_rows() != rows {
        return Err(EmberError::ModelLoadFailed(format!(
            "{name}: expected {cols}x{rows}, found {:?}",
            info.shape
        )));
    }
    Ok(slot)
}

fn matvec(info: &TensorInfo, data: &[u8], input: &[f32], out: &mut [f32]) {
    let row_bytes = info.row_bytes();
    let dtype = info.dtype;
    let row = |r: usize| &data[r * row_bytes..(r + 1) * row_bytes];
    if out.len() * input.len() < PAR_THRESHOLD {
        for (r, o) in out.iter_mut().enumerate() {
            *o = dot_row(dtype, row(r), input);
        }
    } else {
        out.par_iter_mut()
            .enumerate()
            .for_each(|(r, o)| *o = dot_row(dtype, row(r), input));
    }
}

fn rms_norm(x: &[f32], weight: &[f32], eps: f32, offset: f32, out: &mut [f32]) {
    let ss: f32 = x.iter().map(|v| v * v).sum();
    let inv = 1.0 / (ss / x.len() as f32 + eps).sqrt();
    for i in 0..x.len() {
        out[i] = x[i] * inv * (weight[i] + offset);
    }
}

fn gelu(x: f32) -> f32 {
    x * 0.5 * (1.0 + (0.797_884_6 * (x + 0.044715 * x * x * x)).tanh())
}

fn add(vec: &mut [f32], bias: &Option<Vec<f32>>) {
    if let Some(b) = bias {
        for (v, b) in vec.iter_mut().zip(b) {
            *v += b;
        }
    }
}

impl Transformer {
    pub fn new(
        weights: Arc<ModelWeights>,
        n_ctx: usize,
        rope_freq_base: Option<f32>,
        rope_freq_scale: Option<f32>,
        n_threads: usize,
    ) -> Result<Self> {
        let meta = &weights.meta;
        if !meta.architecture.is_llama_family() {
            return Err(EmberError::ModelLoadFailed(format!(
                "unsupported architecture {:?}",
                meta.architecture
            )));
        }
        let dim = meta.embedding_dim as usize;
        let n_heads = meta.head_count as usize;
        let n_kv_heads = meta.head_count_kv as usize;
        let n_layers = meta.layer_count as usize;
        if dim == 0 || n_heads == 0 || n_kv_heads == 0 || n_heads % n_kv_heads != 0 || dim % n_heads != 0 {
            return Err(EmberError::ModelLoadFailed(format!(
                "inconsistent attention geometry: dim {dim}, heads {n_heads}/{n_kv_heads}"
            )));
        }
        let head_dim = dim / n_heads;
        let kv_dim = n_kv_heads * head_dim;
        let vocab_size = weights.vocab.len();

        let ff_dim = match meta.feed_forward_dim {
            Some(ff) => ff as usize,
            None => {
                let slot = weights.require_slot("blk.0.ffn_gate.weight")?;
                weights.by_slot(slot).0.n_rows()
            }
        };

        let is_gemma = matches!(meta.architecture, Architecture::Gemma);
        let default_eps = match meta.architecture {
            Architecture::Phi | Architecture::Qwen | Architecture::Gemma => 1e-6,
            _ => 1e-5,
        };
        let cfg = RunnerConfig {
            dim,
            n_layers,
            n_heads,
            n_kv_heads,
            head_dim,
            vocab_size,
            ff_dim,
            norm_eps: meta.norm_eps.unwrap_or(default_eps),
            n_ctx,
            activation: if is_gemma {
                Activation::GeGLU
            } else {
                Activation::SwiGLU
            },
            norm_weight_offset: if is_gemma { 1.0 } else { 0.0 },
            embed_scale: is_gemma.then(|| (dim as f32).sqrt()),
        };

        let mut layers = Vec::with_capacity(n_layers);
        for l in 0..n_layers {
            let name = |t: &str| format!("blk.{l}.{t}");
            layers.push(LayerWeights {
                attn_norm: norm_vector(&weights, &name("attn_norm.weight"), dim)?,
                ffn_norm: norm_vector(&weights, &name("ffn_norm.weight"), dim)?,
                q: matrix(&weights, &name("attn_q.weight"), dim, n_heads * head_dim)?,
                k: matrix(&weights, &name("attn_k.weight"), dim, kv_dim)?,
                v: matrix(&weights, &name("attn_v.weight"), dim, kv_dim)?,
                o: matrix(&weights, &name("attn_output.weight"), n_heads * head_dim, dim)?,
                gate: matrix(&weights, &name("ffn_gate.weight"), dim, ff_dim)?,
                up: matrix(&weights, &name("ffn_up.weight"), dim, ff_dim)?,
                down: matrix(&weights, &name("ffn_down.weight"), ff_dim, dim)?,
                q_bias: optional_vector(&weights, &name("attn_q.bias"), n_heads * head_dim)?,
                k_bias: optional_vector(&weights, &name("attn_k.bias"), kv_dim)?,
                v_bias: optional_vector(&weights, &name("attn_v.bias"), kv_dim)?,
            });
        }
        let token_embd = matrix(&weights, "token_embd.weight", dim, vocab_size)?;
        let output = match weights.slot("output.weight") {
            Some(_) => matrix(&weights, "output.weight", dim, vocab_size)?,
            None => token_embd,
        };
        let output_norm = norm_vector(&weights, "output_norm.weight", dim)?;

        let rotary_dim = meta
            .rope_dimension_count
            .map(|d| d as usize)
            .filter(|&d| d > 0 && d <= head_dim)
            .unwrap_or(head_dim);
        let rope = RopeTable::new(
            n_ctx,
            rotary_dim,
            rope_freq_base.or(meta.rope_freq_base).unwrap_or(10000.0),
            rope_freq_scale.unwrap_or(1.0),
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .thread_name(|i| format!("ember-matmul-{i}"))
            .build()
            .map_err(|e| EmberError::ModelLoadFailed(format!("thread pool: {e}")))?;

        tracing::debug!(
            "runner: dim {dim}, {n_layers} layers, {n_heads}/{n_kv_heads} heads, ff {ff_dim}, ctx {n_ctx}, {} threads",
            pool.current_num_threads()
        );
        Ok(Self {
            weights,
            cfg,
            rope,
            layers,
            token_embd,
            output_norm,
            output,
            pool,
        })
    }

    pub fn weights(&self) -> &Arc<ModelWeights> {
        &self.weights
    }

    pub fn rope(&self) -> &RopeTable {
        &self.rope
    }

    pub fn n_ctx(&self) -> usize {
        self.cfg.n_ctx
    }

    pub fn dim(&self) -> usize {
        self.cfg.dim
    }

    pub fn vocab_size(&self) -> usize {
        self.cfg.vocab_size
    }

    pub fn new_cache(&self) -> KvCache {
        self.new_cache_with(self.cfg.n_ctx)
    }

    pub fn new_cache_with(&self, n_ctx: usize) -> KvCache {
        KvCache::new(self.cfg.n_layers, self.cfg.n_kv_heads, self.cfg.head_dim, n_ctx)
    }

    pub fn scratch(&self) -> Scratch {
        let c = &self.cfg;
        Scratch {
            hidden: vec![0.0; c.dim],
            residual: vec![0.0; c.dim],
            normed: vec![0.0; c.dim],
            q: vec![0.0; c.n_heads * c.head_dim],
            k: vec![0.0; c.n_kv_heads * c.head_dim],
            v: vec![0.0; c.n_kv_heads * c.head_dim],
            attn_out: vec![0.0; c.n_heads * c.head_dim],
            attn_proj: vec![0.0; c.dim],
            scores: vec![0.0; c.n_ctx],
            gate: vec![0.0; c.ff_dim],
            up: vec![0.0; c.ff_dim],
            ffn_out: vec![0.0; c.dim],
            logits: vec![0.0; c.vocab_size],
        }
    }

    fn project(&self, slot: usize, adapters: &AdapterStack, input: &[f32], out: &mut [f32]) {
        let (info, data) = self.weights.by_slot(slot);
        matvec(info, data, input, out);
        adapters.add_delta(&info.name, input, out);
    }

    /// Run `token` at slot `cache.len()` and commit it. Logits are computed
    /// only when `want_logits` is set.
    pub fn forward(
        &self,
        token: u32,
        cache: &mut KvCache,
        scratch: &mut Scratch,
        adapters: &AdapterStack,
        want_logits: bool,
    ) -> Result<()> {
        if token as usize >= self.cfg.vocab_size {
            return Err(EmberError::PredictionFailed(format!(
                "token {token} outside vocabulary of {}",
                self.cfg.vocab_size
            )));
        }
        let pos = cache.len();
        if pos >= cache.capacity() || pos >= self.rope.max_pos() {
            return Err(EmberError::PredictionFailed(format!(
                "context full at position {pos}"
            )));
        }
        self.pool
            .install(|| self.forward_inner(token, pos, cache, scratch, adapters, want_logits))?;
        cache.commit(token);
        Ok(())
    }

    fn forward_inner(
        &self,
        token: u32,
        pos: usize,
        cache: &mut KvCache,
        s: &mut Scratch,
        adapters: &AdapterStack,
        want_logits: bool,
    ) -> Result<()> {
        let c = &self.cfg;
        let (dim, hd) = (c.dim, c.head_dim);
        let eps = c.norm_eps;
        let norm_off = c.norm_weight_offset;

        let (embd_info, embd_data) = self.weights.by_slot(self.token_embd);
        let row_bytes = embd_info.row_bytes();
        let row = token as usize * row_bytes;
        dequant_row(embd_info.dtype, &embd_data[row..row + row_bytes], &mut s.hidden)?;
        if let Some(scale) = c.embed_scale {
            s.hidden.iter_mut().for_each(|h| *h *= scale);
        }

        let group = c.n_heads / c.n_kv_heads;
        let kv_stride = c.n_kv_heads * hd;
        let seq_len = pos + 1;
        let att_scale = 1.0 / (hd as f32).sqrt();

        for (l, layer) in self.layers.iter().enumerate() {
            s.residual.copy_from_slice(&s.hidden);
            rms_norm(&s.hidden, &layer.attn_norm, eps, norm_off, &mut s.normed);

            self.project(layer.q, adapters, &s.normed, &mut s.q);
            self.project(layer.k, adapters, &s.normed, &mut s.k);
            self.project(layer.v, adapters, &s.normed, &mut s.v);
            add(&mut s.q, &layer.q_bias);
            add(&mut s.k, &layer.k_bias);
            add(&mut s.v, &layer.v_bias);

            self.rope.apply(&mut s.q, pos, hd);
            self.rope.apply(&mut s.k, pos, hd);
            cache.write(l, pos, &s.k, &s.v);

            let keys = cache.keys(l);
            let values = cache.values(l);
            s.attn_out.fill(0.0);
            for h in 0..c.n_heads {
                let kv_h = h / group;
                let q_head = &s.q[h * hd..(h + 1) * hd];
                let scores = &mut s.scores[..seq_len];
                for t in 0..seq_len {
                    let off = t * kv_stride + kv_h * hd;
                    let dot: f32 = q_head.iter().zip(&keys[off..off + hd]).map(|(a, b)| a * b).sum();
                    scores[t] = dot * att_scale;
                }
                let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let mut sum = 0.0f32;
                for sc in scores.iter_mut() {
                    *sc = (*sc - max).exp();
                    sum += *sc;
                }
                let out_head = &mut s.attn_out[h * hd..(h + 1) * hd];
                for t in 0..seq_len {
                    let w = scores[t] / sum;
                    let off = t * kv_stride + kv_h * hd;
                    for d in 0..hd {
                        out_head[d] += w * values[off + d];
                    }
                }
            }

            self.project(layer.o, adapters, &s.attn_out, &mut s.attn_proj);
            for i in 0..dim {
                s.hidden[i] = s.residual[i] + s.attn_proj[i];
            }

            s.residual.copy_from_slice(&s.hidden);
            rms_norm(&s.hidden, &layer.ffn_norm, eps, norm_off, &mut s.normed);
            self.project(layer.gate, adapters, &s.normed, &mut s.gate);
            self.project(layer.up, adapters, &s.normed, &mut s.up);
            match c.activation {
                Activation::SwiGLU => {
                    for i in 0..c.ff_dim {
                        let g = s.gate[i];
                        s.gate[i] = g / (1.0 + (-g).exp()) * s.up[i];
                    }
                }
                Activation::GeGLU => {
                    for i in 0..c.ff_dim {
                        s.gate[i] = gelu(s.gate[i]) * s.up[i];
                    }
                }
            }
            self.project(layer.down, adapters, &s.gate, &mut s.ffn_out);
            for i in 0..dim {
                s.hidden[i] = s.residual[i] + s.ffn_out[i];
            }
        }

        rms_norm(&s.hidden, &self.output_norm, eps, norm_off, &mut s.normed);
        if want_logits {
            self.project(self.output, adapters, &s.normed, &mut s.logits);
            if s.logits.iter().any(|l| l.is_nan()) {
                return Err(EmberError::PredictionFailed("NaN in logits".into()));
            }
        }
        Ok(())
    }
}
