//! LLM inference engine
//!
//! This module handles all interaction with llama.cpp: model lifetime, the
//! generation loop and the streaming text assembly.

pub mod assembler;
pub mod engine;
pub mod llama;
pub mod model;
pub mod runtime;
pub mod session;
pub mod streaming;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use assembler::{StopMarkers, StreamAssembler, Utf8Repair};
pub use engine::{generate_task, EngineError, GenerationFlags, LocalEngine, ModelInfo};
pub use llama::LlamaCppLoader;
pub use model::{validate_gguf, GgufHeader, ModelError, GGUF_MAGIC};
pub use runtime::{LoadParams, SamplingParams};
pub use session::{GenerationOutcome, GenerationRequest, StopReason, DEFAULT_SEED};
pub use streaming::{StreamToken, TokenStream};
