use ember_core::chat_template::GrammarTrigger;
use ember_core::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Requested element type for cached keys/values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    #[default]
    F32,
    F16,
    Q8_0,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingType {
    /// No pooling: the last token's hidden state is the embedding.
    None,
    Mean,
    Cls,
    Last,
}

impl PoolingType {
    /// GGUF `<arch>.pooling_type` numbering.
    pub fn from_gguf(v: u32) -> Option<Self> {
        match v {
            0 => Some(PoolingType::None),
            1 => Some(PoolingType::Mean),
            2 => Some(PoolingType::Cls),
            3 => Some(PoolingType::Last),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterSpec {
    pub path: PathBuf,
    #[serde(default = "one")]
    pub scale: f32,
}

fn one() -> f32 {
    1.0
}

/// Everything fixed at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Context window; 0 uses the model's trained length.
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_ubatch: u32,
    /// Matmul worker threads; 0 lets rayon decide.
    pub n_threads: u32,
    /// Recorded only; the shipped backend runs on the CPU.
    pub n_gpu_layers: i32,
    pub flash_attn: bool,
    pub cache_type_k: CacheType,
    pub cache_type_v: CacheType,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub vocab_only: bool,
    pub lora: Vec<AdapterSpec>,
    /// 0 keeps the model's value.
    pub rope_freq_base: f32,
    /// 0 keeps the model's value (1.0 when absent).
    pub rope_freq_scale: f32,
    /// `None` uses the model's pooling type.
    pub pooling: Option<PoolingType>,
    pub embedding: bool,
    /// Default for `embed(.., -1)`: 0 raw, 1 L2.
    pub embd_normalize: i32,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            n_ctx: 0,
            n_batch: 512,
            n_ubatch: 512,
            n_threads: 0,
            n_gpu_layers: 0,
            flash_attn: false,
            cache_type_k: CacheType::F32,
            cache_type_v: CacheType::F32,
            use_mmap: true,
            use_mlock: false,
            vocab_only: false,
            lora: Vec::new(),
            rope_freq_base: 0.0,
            rope_freq_scale: 0.0,
            pooling: None,
            embedding: false,
            embd_normalize: 1,
        }
    }
}

impl LoadConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// -1 draws a fresh seed from the OS.
    pub seed: i64,
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub typical_p: f32,
    /// Disabled when <= 0.
    pub top_n_sigma: f32,
    pub xtc_threshold: f32,
    pub xtc_probability: f32,
    /// 0 disables penalties, -1 covers the whole context.
    pub penalty_last_n: i32,
    pub penalty_repeat: f32,
    pub penalty_freq: f32,
    pub penalty_present: f32,
    pub dry_multiplier: f32,
    pub dry_base: f32,
    pub dry_allowed_length: i32,
    pub dry_penalty_last_n: i32,
    pub dry_sequence_breakers: Vec<String>,
    /// 0 off, 1 mirostat, 2 mirostat v2.
    pub mirostat: u8,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    /// `(token, bias)` pairs; later entries for the same token add up.
    pub logit_bias: Vec<(u32, f32)>,
    pub ignore_eos: bool,
    /// Top candidates reported per generated token; 0 disables.
    pub n_probs: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            seed: -1,
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            typical_p: 1.0,
            top_n_sigma: -1.0,
            xtc_threshold: 0.1,
            xtc_probability: 0.0,
            penalty_last_n: 64,
            penalty_repeat: 1.0,
            penalty_freq: 0.0,
            penalty_present: 0.0,
            dry_multiplier: 0.0,
            dry_base: 1.75,
            dry_allowed_length: 2,
            dry_penalty_last_n: -1,
            dry_sequence_breakers: vec!["\n".into(), ":".into(), "\"".into(), "*".into()],
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            logit_bias: Vec::new(),
            ignore_eos: false,
            n_probs: 0,
        }
    }
}

/// Grammar constraint attached to one completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrammarSpec {
    /// GBNF source. Takes precedence over `json_schema`.
    pub grammar: Option<String>,
    pub json_schema: Option<serde_json::Value>,
    /// Stay inactive until a trigger fires.
    pub lazy: bool,
    pub triggers: Vec<GrammarTrigger>,
    /// Strings that must each tokenize to exactly one token.
    pub preserved_tokens: Vec<String>,
}

impl GrammarSpec {
    pub fn is_empty(&self) -> bool {
        self.grammar.is_none() && self.json_schema.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionParams {
    #[serde(flatten)]
    pub sampling: SamplingParams,
    /// -1 generates until another stop condition.
    pub n_predict: i32,
    /// Prompt tokens kept on truncation and context shift; -1 keeps the prompt.
    pub n_keep: i32,
    pub stop: Vec<String>,
    pub grammar: GrammarSpec,
    pub context_shift: bool,
    /// Whether special-token text in the prompt maps to special tokens.
    pub parse_special: bool,
    /// Appended to chat prompts rendered from messages.
    pub add_generation_prompt: bool,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self {
            sampling: SamplingParams::default(),
            n_predict: -1,
            n_keep: 0,
            stop: Vec::new(),
            grammar: GrammarSpec::default(),
            context_shift: true,
            parse_special: true,
            add_generation_prompt: true,
        }
    }
}

impl CompletionParams {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let p: CompletionParams =
            serde_json::from_str(r#"{"temperature":0.0,"n_predict":12,"logit_bias":[[7,-2.5]]}"#)
                .unwrap();
        assert_eq!(p.sampling.temperature, 0.0);
        assert_eq!(p.n_predict, 12);
        assert_eq!(p.sampling.logit_bias, vec![(7, -2.5)]);
        assert_eq!(p.sampling.top_k, 40);
        assert!(p.context_shift);
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("load.json");
        std::fs::write(
            &path,
            r#"{"n_ctx":64,"cache_type_k":"q8_0","pooling":"mean","lora":[{"path":"a.gguf"}]}"#,
        )
        .unwrap();
        let cfg = LoadConfig::from_json_file(&path).unwrap();
        assert_eq!(cfg.n_ctx, 64);
        assert_eq!(cfg.cache_type_k, CacheType::Q8_0);
        assert_eq!(cfg.pooling, Some(PoolingType::Mean));
        assert_eq!(cfg.lora[0].scale, 1.0);
        assert!(cfg.use_mmap);
    }
}
