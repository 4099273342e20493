use super::{Exclusive, Session};
use ember_core::error::{EmberError, Result};
use std::fs;
use std::path::Path;

impl Session {
    /// Write the cached tokens and their keys/values to `path`. Only the most
    /// recent `max_tokens` entries are kept; `max_tokens <= 0` saves all.
    pub fn save_session(&self, path: &Path, max_tokens: i32) -> Result<usize> {
        let inner = &self.inner;
        let compute = inner.compute()?;
        let _slot = Exclusive::claim(inner)?;

        let (saved, bytes) = {
            let state = compute.state.lock();
            if state.cache.is_empty() {
                return Err(EmberError::SessionSaveFailed("no tokens to save".into()));
            }
            let limit = max_tokens.max(0) as usize;
            let saved = match limit {
                0 => state.cache.len(),
                n => n.min(state.cache.len()),
            };
            let bytes = state
                .cache
                .serialize(inner.weights.fingerprint(), limit, compute.transformer.rope());
            (saved, bytes)
        };
        fs::write(path, &bytes)?;
        tracing::info!("saved {saved} tokens to {} ({} bytes)", path.display(), bytes.len());
        Ok(saved)
    }

    /// Replace the cache with a saved one. Returns the token count and the
    /// text of the restored history.
    pub fn load_session(&self, path: &Path) -> Result<(usize, String)> {
        let inner = &self.inner;
        let compute = inner.compute()?;
        let _slot = Exclusive::claim(inner)?;

        let bytes = fs::read(path)?;
        let (_, generation) = inner.adapter_snapshot();
        let mut state = compute.state.lock();
        let n = state.cache.deserialize(&bytes, inner.weights.fingerprint())?;
        state.generation = generation;
        let prompt = inner
            .weights
            .vocab
            .detokenize(state.cache.history())
            .map_err(|e| EmberError::SessionLoadFailed(e.to_string()))?;
        tracing::info!("loaded {n} tokens from {}", path.display());
        Ok((n, prompt))
    }
}
