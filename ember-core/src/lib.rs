pub mod chat_template;
pub mod dequant;
pub mod dtype;
pub mod error;
pub mod gguf;
pub mod logging;
pub mod mmap;
pub mod model;
pub mod tensor;
pub mod vocab;

pub use error::{EmberError, ErrorKind, Result};
pub use gguf::read_model_info;
