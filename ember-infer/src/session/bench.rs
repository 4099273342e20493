use super::{Exclusive, Session};
use ember_core::error::{EmberError, Result};
use serde::Serialize;
use std::time::Instant;

/// Throughput of `nr` repetitions of a `pp` token prompt followed by `tg`
/// generated tokens on each of `pl` sequences. Rates are tokens per second.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchReport {
    pub model: String,
    pub size_bytes: u64,
    pub parameters: u64,
    pub pp: usize,
    pub tg: usize,
    pub pl: usize,
    pub nr: usize,
    pub pp_avg: f64,
    pub pp_std: f64,
    pub tg_avg: f64,
    pub tg_std: f64,
}

fn mean_std(samples: &[f64]) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    if samples.len() < 2 {
        return (mean, 0.0);
    }
    let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var.sqrt())
}

impl Session {
    /// Runs on a private cache; the session's own cache is left as is.
    pub fn bench(&self, pp: usize, tg: usize, pl: usize, nr: usize) -> Result<BenchReport> {
        let inner = &self.inner;
        let compute = inner.compute()?;
        if pl == 0 || nr == 0 {
            return Err(EmberError::PredictionFailed("pl and nr must be at least 1".into()));
        }
        if pp == 0 {
            return Err(EmberError::PredictionFailed("pp must be at least 1".into()));
        }
        if pp + tg > inner.n_ctx {
            return Err(EmberError::PredictionFailed(format!(
                "pp + tg = {} exceeds the context of {}",
                pp + tg,
                inner.n_ctx
            )));
        }
        let _slot = Exclusive::claim(inner)?;

        let transformer = &compute.transformer;
        let (adapters, _) = inner.adapter_snapshot();
        let mut scratch = transformer.scratch();
        let mut pp_rates = Vec::with_capacity(nr);
        let mut tg_rates = Vec::with_capacity(nr);

        for rep in 0..nr {
            let mut prompt_cache = transformer.new_cache_with(pp + tg);
            let start = Instant::now();
            for i in 0..pp {
                transformer.forward(0, &mut prompt_cache, &mut scratch, &adapters, i + 1 == pp)?;
            }
            let pp_secs = start.elapsed().as_secs_f64();

            let mut seqs = vec![prompt_cache; pl];
            let start = Instant::now();
            for _ in 0..tg {
                if inner.cancelled() {
                    return Err(EmberError::Cancelled);
                }
                for cache in seqs.iter_mut() {
                    transformer.forward(0, cache, &mut scratch, &adapters, true)?;
                }
            }
            let tg_secs = start.elapsed().as_secs_f64();

            let (pp_rate, tg_rate) = rep_rates(pp, tg, pl, pp_secs, tg_secs);
            pp_rates.push(pp_rate);
            tg_rates.extend(tg_rate);
            tracing::debug!("bench rep {rep}: pp {:.1} ms, tg {:.1} ms", pp_secs * 1e3, tg_secs * 1e3);
        }

        let info = inner.weights.gguf.model_info();
        let (pp_avg, pp_std) = mean_std(&pp_rates);
        let (tg_avg, tg_std) = mean_std(&tg_rates);
        tracing::info!("bench pp{pp} tg{tg} pl{pl}: {pp_avg:.1} / {tg_avg:.1} tok/s");
        Ok(BenchReport {
            model: info.description,
            size_bytes: info.size_bytes,
            parameters: info.metadata.parameters,
            pp,
            tg,
            pl,
            nr,
            pp_avg,
            pp_std,
            tg_avg,
            tg_std,
        })
    }
}

/// Tokens per second for one repetition. The prompt is processed once and
/// copied into the `pl` streams, so only generation scales with `pl`.
fn rep_rates(pp: usize, tg: usize, pl: usize, pp_secs: f64, tg_secs: f64) -> (f64, Option<f64>) {
    let rate = |n: usize, secs: f64| if secs > 0.0 { n as f64 / secs } else { 0.0 };
    (rate(pp, pp_secs), (tg > 0).then(|| rate(tg * pl, tg_secs)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_rate_ignores_parallel_streams() {
        let (pp1, tg1) = rep_rates(16, 4, 1, 0.5, 1.0);
        let (pp16, tg16) = rep_rates(16, 4, 16, 0.5, 1.0);
        assert_eq!(pp1, 32.0);
        assert_eq!(pp16, pp1);
        assert_eq!(tg1, Some(4.0));
        assert_eq!(tg16, Some(64.0));
        assert_eq!(rep_rates(16, 0, 2, 0.0, 0.0), (0.0, None));
    }

    #[test]
    fn sample_statistics() {
        assert_eq!(mean_std(&[]), (0.0, 0.0));
        assert_eq!(mean_std(&[4.0]), (4.0, 0.0));
        let (m, s) = mean_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((m - 5.0).abs() < 1e-12);
        assert!((s - 2.138_089_935).abs() < 1e-6);
    }
}
