pub mod adapter;
pub mod grammar;
pub mod kv_cache;
pub mod params;
pub mod rope;
pub mod runner;
pub mod sampler;
pub mod session;
pub mod weights;

pub use adapter::{AdapterInfo, AdapterStack, LoraAdapter};
pub use params::{
    AdapterSpec, CacheType, CompletionParams, GrammarSpec, LoadConfig, PoolingType, SamplingParams,
};
pub use session::{
    BenchReport, CompletionEvent, CompletionInput, CompletionResult, CompletionStream, LoadControl,
    Session, SessionState, StopHandle, StopReason, Timings, TokenOutput, TokenProbabilities,
    TokenProbability,
};
