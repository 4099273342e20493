use crate::weights::ModelWeights;
use ember_core::dequant::dequant_row;
use ember_core::error::{EmberError, Result};
use ember_core::gguf::GgufParser;
use ember_core::mmap::open_model;
use ember_core::tensor::TensorInfo;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Low-rank pair for one base matrix: `delta = B · A`.
#[derive(Debug)]
struct LoraPair {
    rank: usize,
    in_dim: usize,
    /// `rank` rows of `in_dim`.
    a: Vec<f32>,
    /// `out_dim` rows of `rank`.
    b: Vec<f32>,
}

/// A LoRA adapter read from a GGUF file whose tensors are named
/// `<base tensor>.lora_a` / `<base tensor>.lora_b`.
#[derive(Debug)]
pub struct LoraAdapter {
    path: PathBuf,
    alpha: f32,
    pairs: HashMap<String, LoraPair>,
}

impl LoraAdapter {
    pub fn load(path: &Path, base: &ModelWeights) -> Result<Self> {
        let fail = |msg: String| EmberError::LoraApplyFailed(format!("{}: {msg}", path.display()));

        let image = open_model(path, false, false).map_err(|e| fail(e.to_string()))?;
        let gguf = GgufParser::new()
            .parse_bytes(&image, image.len() as u64)
            .map_err(|e| fail(e.to_string()))?;

        if let Some(arch) = gguf.get_str("general.architecture") {
            if arch != base.gguf.architecture_name() {
                return Err(fail(format!(
                    "adapter targets {arch}, model is {}",
                    base.gguf.architecture_name()
                )));
            }
        }
        let alpha = gguf.get_f32("adapter.lora.alpha").unwrap_or(0.0);

        let read = |info: &TensorInfo| -> Result<Vec<f32>> {
            let bytes = gguf.tensor_data(info, &image)?;
            let (cols, rows) = (info.row_len(), info.n_rows());
            let row_bytes = info.row_bytes();
            let mut out = vec![0.0f32; cols * rows];
            for (r, dst) in out.chunks_mut(cols.max(1)).enumerate() {
                dequant_row(info.dtype, &bytes[r * row_bytes..(r + 1) * row_bytes], dst)?;
            }
            Ok(out)
        };

        let mut pairs = HashMap::new();
        for a_info in gguf.tensors.iter().filter(|t| t.name.ends_with(".lora_a")) {
            let target = a_info.name.trim_end_matches(".lora_a");
            let b_info = gguf
                .tensor(&format!("{target}.lora_b"))
                .ok_or_else(|| fail(format!("{target}.lora_b missing")))?;
            let (base_info, _) = base
                .get(target)
                .ok_or_else(|| fail(format!("model has no tensor {target}")))?;

            let rank = a_info.n_rows();
            if a_info.row_len() != base_info.row_len()
                || b_info.n_rows() != base_info.n_rows()
                || b_info.row_len() != rank
                || rank == 0
            {
                return Err(fail(format!(
                    "{target}: lora shapes {:?} / {:?} do not fit {:?}",
                    a_info.shape, b_info.shape, base_info.shape
                )));
            }
            let pair = LoraPair {
                rank,
                in_dim: a_info.row_len(),
                a: read(a_info).map_err(|e| fail(e.to_string()))?,
                b: read(b_info).map_err(|e| fail(e.to_string()))?,
            };
            pairs.insert(target.to_string(), pair);
        }
        if pairs.is_empty() {
            return Err(fail("no lora tensors found".into()));
        }
        tracing::info!("lora adapter {} touches {} tensors", path.display(), pairs.len());
        Ok(Self {
            path: path.to_path_buf(),
            alpha,
            pairs,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `out += scale * (alpha / rank) * B (A x)` for the named base tensor.
    fn add_delta(&self, tensor: &str, input: &[f32], out: &mut [f32], scale: f32) {
        let Some(pair) = self.pairs.get(tensor) else {
            return;
        };
        let factor = if self.alpha != 0.0 {
            scale * self.alpha / pair.rank as f32
        } else {
            scale
        };
        let ax: Vec<f32> = pair
            .a
            .chunks_exact(pair.in_dim)
            .map(|row| row.iter().zip(input).map(|(w, x)| w * x).sum())
            .collect();
        for (o, row) in out.iter_mut().zip(pair.b.chunks_exact(pair.rank)) {
            *o += factor * row.iter().zip(&ax).map(|(w, x)| w * x).sum::<f32>();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdapterInfo {
    pub path: PathBuf,
    pub scale: f32,
}

/// Ordered `(adapter, scale)` pairs, applied in insertion order on top of the
/// base projections. The base weights are never touched.
#[derive(Debug, Clone, Default)]
pub struct AdapterStack {
    entries: Vec<(Arc<LoraAdapter>, f32)>,
}

impl AdapterStack {
    pub fn new(entries: Vec<(Arc<LoraAdapter>, f32)>) -> Self {
        Self { entries }
    }

    /// Load every `(path, scale)` or none of them.
    pub fn load_all(specs: &[(PathBuf, f32)], base: &ModelWeights) -> Result<Self> {
        let entries = specs
            .iter()
            .map(|(path, scale)| Ok((Arc::new(LoraAdapter::load(path, base)?), *scale)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn list(&self) -> Vec<AdapterInfo> {
        self.entries
            .iter()
            .map(|(a, scale)| AdapterInfo {
                path: a.path.clone(),
                scale: *scale,
            })
            .collect()
    }

    pub fn add_delta(&self, tensor: &str, input: &[f32], out: &mut [f32]) {
        for (adapter, scale) in &self.entries {
            if *scale != 0.0 {
                adapter.add_delta(tensor, input, out, *scale);
            }
        }
    }
}
