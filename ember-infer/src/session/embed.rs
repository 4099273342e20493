use super::Session;
use crate::params::PoolingType;
use ember_core::error::{EmberError, Result};

/// Combine per-token hidden states into one vector.
fn pool(states: &[Vec<f32>], pooling: PoolingType) -> Vec<f32> {
    match pooling {
        PoolingType::Cls => states.first().cloned().unwrap_or_default(),
        PoolingType::None | PoolingType::Last => states.last().cloned().unwrap_or_default(),
        PoolingType::Mean => {
            let Some(first) = states.first() else {
                return Vec::new();
            };
            let mut sum = vec![0.0f32; first.len()];
            for s in states {
                for (acc, v) in sum.iter_mut().zip(s) {
                    *acc += v;
                }
            }
            let n = states.len() as f32;
            sum.iter_mut().for_each(|v| *v /= n);
            sum
        }
    }
}

fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

impl Session {
    /// Pooled hidden state for `text`. `normalize`: `-1` uses the session
    /// default, `0` returns raw values, `1` L2-normalizes.
    ///
    /// Runs on a private cache, so it does not disturb a running completion.
    pub fn embed(&self, text: &str, normalize: i32) -> Result<Vec<f32>> {
        let inner = &self.inner;
        let compute = inner.compute()?;
        if !inner.config.embedding {
            return Err(EmberError::EmbeddingFailed(
                "session was not loaded with embedding enabled".into(),
            ));
        }
        let normalize = if normalize == -1 {
            inner.config.embd_normalize
        } else {
            normalize
        };
        if !matches!(normalize, 0 | 1) {
            return Err(EmberError::EmbeddingFailed(format!(
                "unsupported normalization {normalize}"
            )));
        }

        let vocab = &inner.weights.vocab;
        let tokens = vocab
            .tokenize(text, vocab.add_bos_default(), true)
            .map_err(|e| EmberError::EmbeddingFailed(e.to_string()))?;
        if tokens.is_empty() {
            return Err(EmberError::EmbeddingFailed("input is empty".into()));
        }
        if tokens.len() > inner.n_ctx {
            return Err(EmberError::EmbeddingFailed(format!(
                "input of {} tokens exceeds the context of {}",
                tokens.len(),
                inner.n_ctx
            )));
        }

        let transformer = &compute.transformer;
        let (adapters, _) = inner.adapter_snapshot();
        let mut cache = transformer.new_cache_with(tokens.len());
        let mut scratch = transformer.scratch();
        let keep_all = inner.pooling == PoolingType::Mean;
        let mut states = Vec::with_capacity(if keep_all { tokens.len() } else { 1 });
        for (i, &tok) in tokens.iter().enumerate() {
            transformer
                .forward(tok, &mut cache, &mut scratch, &adapters, false)
                .map_err(|e| EmberError::EmbeddingFailed(e.to_string()))?;
            let wanted = keep_all
                || (i == 0 && inner.pooling == PoolingType::Cls)
                || i + 1 == tokens.len();
            if wanted {
                states.push(scratch.normed.clone());
            }
        }

        let mut out = pool(&states, inner.pooling);
        if out.iter().any(|v| !v.is_finite()) {
            return Err(EmberError::EmbeddingFailed("non-finite embedding".into()));
        }
        if normalize == 1 {
            l2_normalize(&mut out);
        }
        tracing::debug!("embedded {} tokens -> {} dims", tokens.len(), out.len());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pooling_modes() {
        let states = vec![vec![1.0, 0.0], vec![3.0, 2.0]];
        assert_eq!(pool(&states, PoolingType::Mean), vec![2.0, 1.0]);
        assert_eq!(pool(&states, PoolingType::Cls), vec![1.0, 0.0]);
        assert_eq!(pool(&states, PoolingType::Last), vec![3.0, 2.0]);
        assert_eq!(pool(&states, PoolingType::None), vec![3.0, 2.0]);
        assert!(pool(&[], PoolingType::Mean).is_empty());
    }

    #[test]
    fn l2_norm_is_unit() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.6, 0.8]);
        let mut zero = vec![0.0; 3];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0; 3]);
    }
}
