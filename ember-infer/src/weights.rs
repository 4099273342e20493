use ember_core::error::{EmberError, Result};
use ember_core::gguf::{GgufFile, GgufParser};
use ember_core::mmap::{open_model, ModelImage};
use ember_core::model::ModelMetadata;
use ember_core::tensor::TensorInfo;
use ember_core::vocab::TokenVocabulary;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

/// Immutable parameter store: the model file image plus its parsed header
/// and vocabulary. Shared read-only between sessions.
pub struct ModelWeights {
    path: PathBuf,
    image: ModelImage,
    pub gguf: GgufFile,
    pub meta: ModelMetadata,
    pub vocab: TokenVocabulary,
    index: HashMap<String, usize>,
    fingerprint: [u8; 32],
}

impl std::fmt::Debug for ModelWeights {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelWeights")
            .field("path", &self.path)
            .field("tensors", &self.index.len())
            .field("mapped", &self.image.is_mapped())
            .finish()
    }
}

impl ModelWeights {
    pub fn open(path: &Path, use_mmap: bool, prefault: bool) -> Result<Self> {
        let image = open_model(path, use_mmap, prefault)?;
        let gguf = GgufParser::new()
            .parse_bytes(&image, image.len() as u64)
            .map_err(EmberError::into_load_error)?;
        let meta = gguf.model_metadata();
        let vocab = TokenVocabulary::from_gguf(&gguf)?;
        let index = gguf
            .tensors
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();
        // header bytes identify the model for session files
        let fingerprint = *blake3::hash(&image[..gguf.data_offset as usize]).as_bytes();

        tracing::info!(
            "loaded {} ({} tensors, {} layers, vocab {})",
            path.display(),
            gguf.tensors.len(),
            meta.layer_count,
            vocab.len()
        );
        Ok(Self {
            path: path.to_path_buf(),
            image,
            gguf,
            meta,
            vocab,
            index,
            fingerprint,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fingerprint(&self) -> &[u8; 32] {
        &self.fingerprint
    }

    pub fn slot(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn require_slot(&self, name: &str) -> Result<usize> {
        self.slot(name)
            .ok_or_else(|| EmberError::ModelLoadFailed(format!("missing tensor: {name}")))
    }

    /// Tensor layout and bytes by slot index.
    pub fn by_slot(&self, slot: usize) -> (&TensorInfo, &[u8]) {
        let info = &self.gguf.tensors[slot];
        let start = (self.gguf.data_offset + info.offset) as usize;
        (info, &self.image[start..start + info.size_bytes as usize])
    }

    pub fn get(&self, name: &str) -> Option<(&TensorInfo, &[u8])> {
        self.slot(name).map(|s| self.by_slot(s))
    }
}

/// Weak cache of loaded models keyed by canonical path, so sessions opened on
/// the same file share one `ModelWeights`.
#[derive(Default)]
pub struct ModelRegistry {
    models: Mutex<HashMap<(PathBuf, bool), Weak<ModelWeights>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static ModelRegistry {
        static REGISTRY: OnceLock<ModelRegistry> = OnceLock::new();
        REGISTRY.get_or_init(ModelRegistry::new)
    }

    pub fn get_or_load(&self, path: &Path, use_mmap: bool, prefault: bool) -> Result<Arc<ModelWeights>> {
        let canonical = path.canonicalize()?;
        let key = (canonical, use_mmap);
        // held across the load so two sessions never map the same file twice
        let mut models = self.models.lock();
        if let Some(existing) = models.get(&key).and_then(Weak::upgrade) {
            tracing::debug!("reusing weights for {}", path.display());
            return Ok(existing);
        }
        let weights = Arc::new(ModelWeights::open(&key.0, use_mmap, prefault)?);
        models.retain(|_, w| w.strong_count() > 0);
        models.insert(key, Arc::downgrade(&weights));
        Ok(weights)
    }

    pub fn live_models(&self) -> usize {
        self.models
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::gguf::{GgufValue, GgufWriter};

    fn tiny_file(dir: &Path) -> PathBuf {
        let mut w = GgufWriter::new();
        w.add_str("general.architecture", "llama")
            .add_kv(
                "tokenizer.ggml.tokens",
                GgufValue::Array(["<unk>", "<s>", "</s>", "a"].map(|s| GgufValue::String(s.into())).to_vec()),
            )
            .add_f32_tensor("token_embd.weight", &[2, 4], &[0.25; 8]);
        let path = dir.join("tiny.gguf");
        w.write_file(&path).unwrap();
        path
    }

    #[test]
    fn tensor_bytes_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let weights = ModelWeights::open(&tiny_file(dir.path()), true, false).unwrap();
        let (info, data) = weights.get("token_embd.weight").unwrap();
        assert_eq!(info.n_rows(), 4);
        assert_eq!(&data[..4], &0.25f32.to_le_bytes());
        assert!(weights.require_slot("output.weight").is_err());
    }

    #[test]
    fn registry_shares_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = tiny_file(dir.path());
        let registry = ModelRegistry::new();
        let a = registry.get_or_load(&path, true, false).unwrap();
        let b = registry.get_or_load(&path, true, false).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.live_models(), 1);
        drop(a);
        drop(b);
        assert_eq!(registry.live_models(), 0);
    }
}
