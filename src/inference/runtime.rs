//! Runtime seam between the engine and the native inference library
//!
//! The engine never calls llama.cpp directly. It drives a [`ModelLoader`],
//! whose weights hand out an [`InferenceContext`] that borrows them. The
//! borrow makes it impossible to free weights while their context is alive.
//!
//! Implementations must report failures with the matching [`EngineError`]
//! variant: `Tokenization` from [`InferenceContext::tokenize`], `PromptEval`
//! from [`InferenceContext::decode_prompt`] and `Decode` from
//! [`InferenceContext::decode_token`].

use std::path::Path;

use crate::inference::engine::EngineError;
use crate::system::default_thread_count;

/// Token id in the model vocabulary.
pub type TokenId = i32;

/// Context size used when the caller passes zero or a negative value.
pub const DEFAULT_CONTEXT_SIZE: u32 = 2048;

/// GPU layers requested when GPU use is enabled (all of them).
pub const GPU_LAYERS_ALL: u32 = 99;

/// Load options as supplied by the host application.
///
/// Non-positive values select the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadParams {
    /// Context window in tokens (default 2048)
    pub context_size: i32,
    /// Decode threads (default: hardware concurrency - 1, at least 1)
    pub threads: i32,
    /// Offload layers to the GPU if the runtime supports it
    pub use_gpu: bool,
}

impl LoadParams {
    pub fn new(context_size: i32, threads: i32) -> Self {
        Self {
            context_size,
            threads,
            use_gpu: false,
        }
    }

    /// Applies defaults and produces the concrete context configuration.
    pub fn resolve(&self) -> ContextParams {
        let n_ctx = if self.context_size > 0 {
            self.context_size as u32
        } else {
            DEFAULT_CONTEXT_SIZE
        };
        let n_threads = if self.threads > 0 {
            self.threads
        } else {
            default_thread_count()
        };

        ContextParams {
            n_ctx,
            n_threads,
            gpu_layers: if self.use_gpu { GPU_LAYERS_ALL } else { 0 },
        }
    }
}

/// Resolved configuration for weights and context allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    pub n_ctx: u32,
    pub n_threads: i32,
    pub gpu_layers: u32,
}

/// Sampler chain settings: temperature, then top-p, then a seeded draw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub seed: u32,
}

/// Entry point of a runtime: backend initialization and weight loading.
pub trait ModelLoader: Send + 'static {
    type Weights: ModelWeights;

    /// Initializes process-wide backend state. Must be idempotent.
    fn init_backend(&self) -> Result<(), EngineError>;

    /// Parses a weights file.
    fn load(&self, path: &Path, params: &ContextParams) -> Result<Self::Weights, EngineError>;
}

/// Loaded model weights.
pub trait ModelWeights {
    type Context<'a>: InferenceContext
    where
        Self: 'a;

    /// Allocates an inference context (and its token cache) for these weights.
    fn new_context(&self, params: &ContextParams) -> Result<Self::Context<'_>, EngineError>;

    /// Short human-readable description of the model.
    fn description(&self) -> String;

    fn param_count(&self) -> u64;

    fn vocab_size(&self) -> i32;
}

/// A live inference context with its token cache.
pub trait InferenceContext {
    type Sampler;

    /// Size of the token cache.
    fn n_ctx(&self) -> u32;

    /// Decode threads the context was created with.
    fn n_threads(&self) -> i32;

    /// Tokenizes `text`, adding BOS and parsing special role tokens.
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, EngineError>;

    /// Drops every cached token.
    fn clear_cache(&mut self);

    /// Decodes the prompt as a single batch.
    fn decode_prompt(&mut self, tokens: &[TokenId]) -> Result<(), EngineError>;

    /// Decodes one generated token, advancing the cache by one position.
    fn decode_token(&mut self, token: TokenId) -> Result<(), EngineError>;

    fn new_sampler(&self, params: &SamplingParams) -> Self::Sampler;

    /// Samples the next token from the logits of the last decode.
    fn sample(&mut self, sampler: &mut Self::Sampler) -> TokenId;

    /// Records `token` in the sampler's running state.
    fn accept(&self, sampler: &mut Self::Sampler, token: TokenId);

    fn is_end_of_generation(&self, token: TokenId) -> bool;

    /// Raw bytes of a token, special tokens rendered as text.
    fn token_bytes(&self, token: TokenId) -> Result<Vec<u8>, EngineError>;

    /// Serialized state size in bytes.
    fn state_size(&self) -> u64;
}
