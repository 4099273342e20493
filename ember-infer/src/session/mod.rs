//! Inference sessions: one loaded model, one KV cache, one in-flight
//! completion at a time.

mod bench;
pub mod completion;
mod embed;
mod persist;
pub mod stop;

pub use bench::BenchReport;
pub use completion::{
    CompletionEvent, CompletionInput, CompletionResult, CompletionStream, StopReason, Timings,
    TokenOutput, TokenProbabilities, TokenProbability,
};

use crate::adapter::{AdapterInfo, AdapterStack};
use crate::kv_cache::KvCache;
use crate::params::{LoadConfig, PoolingType};
use crate::runner::{Scratch, Transformer};
use crate::weights::{ModelRegistry, ModelWeights};
use ember_core::chat_template::{ChatRenderer, ChatTemplate};
use ember_core::error::{EmberError, Result};
use ember_core::logging::{self, Dispatch};
use ember_core::model::ModelInfo;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

/// Progress and cancellation hooks for [`Session::load_with`].
#[derive(Debug, Default, Clone)]
pub struct LoadControl {
    /// Receives coarse milestones in `0..=100`.
    pub progress: Option<Sender<u8>>,
    /// Checked at every milestone; setting it aborts the load.
    pub cancel: Option<Arc<AtomicBool>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Ready,
    Predicting,
    Closed,
}

pub(crate) struct DecodeState {
    pub cache: KvCache,
    pub scratch: Scratch,
    /// Adapter generation the cache contents were computed with.
    pub generation: u64,
}

pub(crate) struct Compute {
    pub transformer: Transformer,
    pub state: Mutex<DecodeState>,
}

pub(crate) struct AdapterSlot {
    pub stack: Arc<AdapterStack>,
    pub generation: u64,
}

/// Single-mutator slot with a cancel bit. Claiming the slot clears any
/// stale cancel in the same step, and a cancel lands only while busy.
#[derive(Debug, Default)]
pub(crate) struct MutatorSlot(AtomicU8);

impl MutatorSlot {
    const BUSY: u8 = 1;
    const CANCEL: u8 = 2;

    pub fn claim(&self) -> bool {
        self.0
            .compare_exchange(0, Self::BUSY, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn release(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::SeqCst) & Self::BUSY != 0
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst) & Self::CANCEL != 0
    }

    /// Returns false when nothing holds the slot.
    pub fn cancel(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
                (s & Self::BUSY != 0).then_some(s | Self::CANCEL)
            })
            .is_ok()
    }
}

pub(crate) struct SessionInner {
    pub weights: Arc<ModelWeights>,
    pub config: LoadConfig,
    pub n_ctx: usize,
    pub pooling: PoolingType,
    /// `None` for vocab-only sessions.
    pub compute: Option<Compute>,
    /// `vocab.token_bytes(id)` for every id.
    pub pieces: Arc<Vec<Vec<u8>>>,
    pub adapters: RwLock<AdapterSlot>,
    slot: MutatorSlot,
    pub closed: AtomicBool,
    pub dispatch: Dispatch,
    pub renderer: Option<Arc<dyn ChatRenderer>>,
}

impl SessionInner {
    pub fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(EmberError::InvalidContext("session is closed".into()))
        } else {
            Ok(())
        }
    }

    pub fn compute(&self) -> Result<&Compute> {
        self.ensure_open()?;
        self.compute
            .as_ref()
            .ok_or_else(|| EmberError::InvalidContext("session was loaded vocab-only".into()))
    }

    pub fn adapter_snapshot(&self) -> (Arc<AdapterStack>, u64) {
        let slot = self.adapters.read();
        (Arc::clone(&slot.stack), slot.generation)
    }

    /// Claim the single mutator slot.
    pub fn begin_exclusive(&self) -> Result<()> {
        if self.slot.claim() {
            Ok(())
        } else {
            Err(EmberError::AlreadyPredicting)
        }
    }

    pub fn end_exclusive(&self) {
        self.slot.release();
    }

    pub fn is_busy(&self) -> bool {
        self.slot.is_busy()
    }

    /// True once the current mutator should wind down.
    pub fn cancelled(&self) -> bool {
        self.slot.is_cancelled() || self.closed.load(Ordering::SeqCst)
    }

    pub fn request_cancel(&self) -> bool {
        self.slot.cancel()
    }
}

/// Holds the mutator slot until dropped.
pub(crate) struct Exclusive<'a>(&'a SessionInner);

impl<'a> Exclusive<'a> {
    pub fn claim(inner: &'a SessionInner) -> Result<Self> {
        inner.begin_exclusive()?;
        Ok(Self(inner))
    }
}

impl Drop for Exclusive<'_> {
    fn drop(&mut self) {
        self.0.end_exclusive();
    }
}

/// Cancels the running completion of a session from any thread.
#[derive(Clone)]
pub struct StopHandle {
    inner: Arc<SessionInner>,
}

impl StopHandle {
    pub fn stop(&self) {
        request_stop(&self.inner);
    }
}

fn request_stop(inner: &SessionInner) {
    if inner.request_cancel() {
        tracing::debug!("stop requested");
    }
}

/// A loaded model plus its decode state.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("model", &self.inner.weights.path())
            .field("n_ctx", &self.inner.n_ctx)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub fn load(path: &Path, config: LoadConfig) -> Result<Self> {
        Self::load_with(path, config, LoadControl::default())
    }

    pub fn load_with(path: &Path, config: LoadConfig, control: LoadControl) -> Result<Self> {
        let milestone = |pct: u8| -> Result<()> {
            if let Some(tx) = &control.progress {
                let _ = tx.send(pct);
            }
            if control
                .cancel
                .as_ref()
                .is_some_and(|c| c.load(Ordering::SeqCst))
            {
                tracing::debug!("load of {} cancelled at {pct}%", path.display());
                return Err(EmberError::Cancelled);
            }
            Ok(())
        };

        milestone(0)?;
        if config.vocab_only && config.embedding {
            return Err(EmberError::ModelLoadFailed(
                "vocab_only cannot be combined with embedding".into(),
            ));
        }

        let weights = ModelRegistry::global()
            .get_or_load(path, config.use_mmap, config.use_mlock)
            .map_err(EmberError::into_load_error)?;
        milestone(10)?;

        let vocab = &weights.vocab;
        let pieces = (0..vocab.len() as u32)
            .map(|t| vocab.token_bytes(t))
            .collect::<Result<Vec<_>>>()
            .map_err(EmberError::into_load_error)?;

        let n_ctx = match config.n_ctx {
            0 => weights.meta.context_length as usize,
            n => n as usize,
        };
        if n_ctx == 0 {
            return Err(EmberError::ModelLoadFailed("context size is zero".into()));
        }
        let pooling = config
            .pooling
            .or_else(|| weights.meta.pooling_type.and_then(PoolingType::from_gguf))
            .unwrap_or(PoolingType::None);
        if config.n_gpu_layers != 0 || config.flash_attn {
            tracing::debug!(
                "n_gpu_layers {} / flash_attn {} recorded; running on the cpu",
                config.n_gpu_layers,
                config.flash_attn
            );
        }

        let mut stack = AdapterStack::default();
        let compute = if config.vocab_only {
            None
        } else {
            let override_of = |v: f32| (v > 0.0).then_some(v);
            let transformer = Transformer::new(
                Arc::clone(&weights),
                n_ctx,
                override_of(config.rope_freq_base),
                override_of(config.rope_freq_scale),
                config.n_threads as usize,
            )
            .map_err(EmberError::into_load_error)?;
            milestone(40)?;

            if !config.lora.is_empty() {
                let specs: Vec<(PathBuf, f32)> =
                    config.lora.iter().map(|a| (a.path.clone(), a.scale)).collect();
                stack = AdapterStack::load_all(&specs, &weights)
                    .map_err(|e| EmberError::ModelLoadFailed(format!("initial adapters: {e}")))?;
            }
            milestone(70)?;

            let cache = transformer.new_cache();
            cache.note_types(config.cache_type_k, config.cache_type_v);
            tracing::debug!(
                "kv cache: {n_ctx} slots, {:.1} MiB",
                cache.size_bytes() as f64 / (1024.0 * 1024.0)
            );
            let scratch = transformer.scratch();
            Some(Compute {
                transformer,
                state: Mutex::new(DecodeState {
                    cache,
                    scratch,
                    generation: 0,
                }),
            })
        };
        milestone(90)?;

        let renderer = ChatTemplate::for_architecture(&weights.meta.architecture)
            .map(|t| Arc::new(t) as Arc<dyn ChatRenderer>);
        let inner = SessionInner {
            weights,
            config,
            n_ctx,
            pooling,
            compute,
            pieces: Arc::new(pieces),
            adapters: RwLock::new(AdapterSlot {
                stack: Arc::new(stack),
                generation: 0,
            }),
            slot: MutatorSlot::default(),
            closed: AtomicBool::new(false),
            dispatch: logging::current(),
            renderer,
        };
        milestone(100)?;
        tracing::info!("session ready: {} (n_ctx {n_ctx})", path.display());
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn state(&self) -> SessionState {
        if self.inner.closed.load(Ordering::SeqCst) {
            SessionState::Closed
        } else if self.inner.is_busy() {
            SessionState::Predicting
        } else {
            SessionState::Ready
        }
    }

    pub fn n_ctx(&self) -> usize {
        self.inner.n_ctx
    }

    pub fn config(&self) -> &LoadConfig {
        &self.inner.config
    }

    /// Cooperative cancellation of the running completion. No-op when idle.
    pub fn stop(&self) {
        request_stop(&self.inner);
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Stop any completion and refuse further work. Resources are released
    /// once the worker (if any) finishes.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.request_cancel();
            tracing::debug!("session closed");
        }
    }

    pub fn tokenize(&self, text: &str, add_bos: bool, parse_special: bool) -> Result<Vec<u32>> {
        self.inner.ensure_open()?;
        self.inner.weights.vocab.tokenize(text, add_bos, parse_special)
    }

    pub fn detokenize(&self, tokens: &[u32]) -> Result<String> {
        self.inner.ensure_open()?;
        self.inner.weights.vocab.detokenize(tokens)
    }

    pub fn model_info(&self) -> Result<ModelInfo> {
        self.inner.ensure_open()?;
        let mut info = self.inner.weights.gguf.model_info();
        info.metadata.context_length = self.inner.n_ctx as u32;
        Ok(info)
    }

    pub fn chat_template_available(&self) -> bool {
        self.inner.renderer.is_some()
    }

    /// Tokens currently held in the KV cache. Fails with `AlreadyPredicting`
    /// while a completion owns the cache.
    pub fn cached_tokens(&self) -> Result<Vec<u32>> {
        let compute = self.inner.compute()?;
        let _slot = Exclusive::claim(&self.inner)?;
        let state = compute.state.lock();
        Ok(state.cache.history().to_vec())
    }

    /// Load every adapter and replace the active stack, or change nothing.
    /// Like decoding, this needs the session to be idle.
    pub fn apply_adapters(&self, adapters: &[(PathBuf, f32)]) -> Result<()> {
        self.inner.compute()?;
        let _slot = Exclusive::claim(&self.inner)?;
        let stack = AdapterStack::load_all(adapters, &self.inner.weights)?;
        let mut slot = self.inner.adapters.write();
        slot.stack = Arc::new(stack);
        slot.generation += 1;
        tracing::info!("applied {} adapters", adapters.len());
        Ok(())
    }

    pub fn remove_adapters(&self) -> Result<()> {
        self.inner.compute()?;
        let _slot = Exclusive::claim(&self.inner)?;
        let mut slot = self.inner.adapters.write();
        if !slot.stack.is_empty() {
            slot.stack = Arc::new(AdapterStack::default());
            slot.generation += 1;
            tracing::info!("adapters removed");
        }
        Ok(())
    }

    pub fn list_adapters(&self) -> Result<Vec<AdapterInfo>> {
        self.inner.ensure_open()?;
        Ok(self.inner.adapters.read().stack.list())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // a detached worker still holds the inner state; make it wind down
        self.inner.request_cancel();
    }
}
