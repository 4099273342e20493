use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    Llama,
    Mistral,
    Phi,
    Qwen,
    Gemma,
    Unknown(String),
}

impl Architecture {
    pub fn from_gguf_name(name: &str) -> Self {
        match name {
            "llama" => Architecture::Llama,
            "mistral" => Architecture::Mistral,
            "phi3" => Architecture::Phi,
            "qwen2" | "qwen3" => Architecture::Qwen,
            "gemma" => Architecture::Gemma,
            other => Architecture::Unknown(other.to_string()),
        }
    }

    /// Architectures whose tensor layout the CPU runner understands.
    pub fn is_llama_family(&self) -> bool {
        !matches!(self, Architecture::Unknown(_))
    }
}

/// Architecture descriptor extracted from GGUF metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub architecture: Architecture,
    pub name: Option<String>,
    pub parameters: u64,
    pub context_length: u32,
    pub embedding_dim: u32,
    pub feed_forward_dim: Option<u32>,
    pub head_count: u32,
    pub head_count_kv: u32,
    pub layer_count: u32,
    pub vocab_size: u32,
    pub rope_freq_base: Option<f32>,
    pub rope_dimension_count: Option<u32>,
    pub norm_eps: Option<f32>,
    pub pooling_type: Option<u32>,
}

impl ModelMetadata {
    pub fn head_dim(&self) -> u32 {
        if self.head_count == 0 {
            0
        } else {
            self.embedding_dim / self.head_count
        }
    }
}

/// Read-only snapshot returned by `model_info()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub metadata: ModelMetadata,
    /// Short human description, e.g. "llama 15.2M f32".
    pub description: String,
    pub size_bytes: u64,
    pub tensor_count: usize,
    /// Every GGUF key rendered as a string; long arrays are summarized.
    pub kv: BTreeMap<String, String>,
    pub chat_template: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn architecture_names() {
        assert_eq!(Architecture::from_gguf_name("llama"), Architecture::Llama);
        assert_eq!(Architecture::from_gguf_name("qwen2"), Architecture::Qwen);
        assert!(!Architecture::from_gguf_name("mamba").is_llama_family());
    }
}
