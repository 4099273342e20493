use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmberError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid magic number: expected {expected:#010x}, got {got:#010x}")]
    InvalidMagic { expected: u32, got: u32 },

    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u32),

    #[error("unsupported tensor type id {0}")]
    UnsupportedDType(u32),

    #[error("tensor '{name}' has invalid shape: {reason}")]
    InvalidTensorShape { name: String, reason: String },

    #[error("tensor '{name}' offset {offset} exceeds file bounds {file_size}")]
    TensorOutOfBounds {
        name: String,
        offset: u64,
        file_size: u64,
    },

    #[error("allocation too large: requested {requested} bytes, max {max} bytes")]
    AllocationTooLarge { requested: u64, max: u64 },

    #[error("string too long: {len} bytes, max {max} bytes")]
    StringTooLong { len: u64, max: u64 },

    #[error("model load failed: {0}")]
    ModelLoadFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),

    #[error("a completion is already running on this session")]
    AlreadyPredicting,

    #[error("tokenization failed: {0}")]
    TokenizationFailed(String),

    #[error("detokenization failed: {0}")]
    DetokenizationFailed(String),

    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("prediction failed: {0}")]
    PredictionFailed(String),

    #[error("grammar compile failed: {0}")]
    GrammarCompileFailed(String),

    #[error("session save failed: {0}")]
    SessionSaveFailed(String),

    #[error("session load failed: {0}")]
    SessionLoadFailed(String),

    #[error("lora apply failed: {0}")]
    LoraApplyFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse error classes callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ModelLoadFailed,
    InvalidContext,
    AlreadyPredicting,
    TokenizationFailed,
    DetokenizationFailed,
    EmbeddingFailed,
    PredictionFailed,
    GrammarCompileFailed,
    SessionSaveFailed,
    SessionLoadFailed,
    LoraApplyFailed,
    Cancelled,
    Io,
}

impl EmberError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EmberError::Parse(_)
            | EmberError::InvalidMagic { .. }
            | EmberError::UnsupportedVersion(_)
            | EmberError::UnsupportedDType(_)
            | EmberError::InvalidTensorShape { .. }
            | EmberError::TensorOutOfBounds { .. }
            | EmberError::AllocationTooLarge { .. }
            | EmberError::StringTooLong { .. }
            | EmberError::ModelLoadFailed(_) => ErrorKind::ModelLoadFailed,
            EmberError::InvalidContext(_) => ErrorKind::InvalidContext,
            EmberError::AlreadyPredicting => ErrorKind::AlreadyPredicting,
            EmberError::TokenizationFailed(_) => ErrorKind::TokenizationFailed,
            EmberError::DetokenizationFailed(_) => ErrorKind::DetokenizationFailed,
            EmberError::EmbeddingFailed(_) => ErrorKind::EmbeddingFailed,
            EmberError::PredictionFailed(_) => ErrorKind::PredictionFailed,
            EmberError::GrammarCompileFailed(_) | EmberError::Json(_) => {
                ErrorKind::GrammarCompileFailed
            }
            EmberError::SessionSaveFailed(_) => ErrorKind::SessionSaveFailed,
            EmberError::SessionLoadFailed(_) => ErrorKind::SessionLoadFailed,
            EmberError::LoraApplyFailed(_) => ErrorKind::LoraApplyFailed,
            EmberError::Cancelled => ErrorKind::Cancelled,
            EmberError::Io(_) => ErrorKind::Io,
        }
    }

    /// Fold a format-level error into `ModelLoadFailed`, keeping I/O and
    /// cancellation distinct.
    pub fn into_load_error(self) -> Self {
        match self {
            e @ (EmberError::Io(_) | EmberError::Cancelled | EmberError::ModelLoadFailed(_)) => e,
            other => EmberError::ModelLoadFailed(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, EmberError>;
