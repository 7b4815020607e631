//! llama.cpp runtime
//!
//! Implements the runtime seam on top of `llama-cpp-2`. The backend is a
//! process-wide singleton; llama.cpp refuses a second initialization.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use once_cell::sync::OnceCell;

use crate::inference::engine::EngineError;
use crate::inference::runtime::{
    ContextParams, InferenceContext, ModelLoader, ModelWeights, SamplingParams, TokenId,
};

static BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

fn backend() -> Result<&'static LlamaBackend, EngineError> {
    BACKEND.get().ok_or(EngineError::BackendNotInitialized)
}

/// Loads GGUF weights through llama.cpp.
#[derive(Debug, Default, Clone, Copy)]
pub struct LlamaCppLoader;

impl ModelLoader for LlamaCppLoader {
    type Weights = LlamaWeights;

    fn init_backend(&self) -> Result<(), EngineError> {
        BACKEND
            .get_or_try_init(|| {
                let mut backend =
                    LlamaBackend::init().map_err(|e| EngineError::BackendInit(e.to_string()))?;
                backend.void_logs();
                tracing::info!("llama.cpp backend initialized");
                Ok(backend)
            })
            .map(|_| ())
    }

    fn load(&self, path: &Path, params: &ContextParams) -> Result<LlamaWeights, EngineError> {
        let backend = backend()?;
        let model_params = LlamaModelParams::default().with_n_gpu_layers(params.gpu_layers);

        let model = LlamaModel::load_from_file(backend, path, &model_params)
            .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

        Ok(LlamaWeights {
            model,
            path: path.to_path_buf(),
        })
    }
}

/// Weights loaded by llama.cpp.
pub struct LlamaWeights {
    model: LlamaModel,
    path: PathBuf,
}

impl ModelWeights for LlamaWeights {
    type Context<'a> = LlamaCppContext<'a>;

    fn new_context(&self, params: &ContextParams) -> Result<LlamaCppContext<'_>, EngineError> {
        let backend = backend()?;
        let n_ctx = NonZeroU32::new(params.n_ctx).ok_or_else(|| {
            EngineError::ContextCreate("context size must be non-zero".to_string())
        })?;

        // The whole prompt is submitted as one batch, so the batch must be able
        // to hold a full context.
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(params.n_ctx)
            .with_n_threads(params.n_threads)
            .with_n_threads_batch(params.n_threads);

        tracing::info!(
            "Creating context with n_ctx={}, n_threads={}",
            params.n_ctx,
            params.n_threads
        );

        let ctx = self
            .model
            .new_context(backend, ctx_params)
            .map_err(|e| EngineError::ContextCreate(e.to_string()))?;

        Ok(LlamaCppContext {
            model: &self.model,
            ctx,
            n_threads: params.n_threads,
            n_past: 0,
            logits_index: 0,
        })
    }

    fn description(&self) -> String {
        let name = self.model.meta_val_str("general.name").ok();
        let arch = self.model.meta_val_str("general.architecture").ok();
        match (arch, name) {
            (Some(arch), Some(name)) => format!("{arch} {name}"),
            (Some(label), None) | (None, Some(label)) => label,
            (None, None) => self
                .path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }

    fn param_count(&self) -> u64 {
        self.model.n_params() as u64
    }

    fn vocab_size(&self) -> i32 {
        self.model.n_vocab()
    }
}

/// llama.cpp context bound to its weights.
pub struct LlamaCppContext<'a> {
    model: &'a LlamaModel,
    ctx: LlamaContext<'a>,
    n_threads: i32,
    /// Next cache position
    n_past: i32,
    /// Batch index whose logits the sampler reads
    logits_index: i32,
}

impl InferenceContext for LlamaCppContext<'_> {
    type Sampler = LlamaSampler;

    fn n_ctx(&self) -> u32 {
        self.ctx.n_ctx()
    }

    fn n_threads(&self) -> i32 {
        self.n_threads
    }

    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, EngineError> {
        let tokens = self
            .model
            .str_to_token(text, AddBos::Always)
            .map_err(|e| EngineError::Tokenization(e.to_string()))?;

        let n_ctx = self.n_ctx() as usize;
        if tokens.len() > n_ctx {
            return Err(EngineError::Tokenization(format!(
                "prompt is {} tokens, context holds {}",
                tokens.len(),
                n_ctx
            )));
        }

        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn clear_cache(&mut self) {
        self.ctx.clear_kv_cache();
        self.n_past = 0;
        self.logits_index = 0;
    }

    fn decode_prompt(&mut self, tokens: &[TokenId]) -> Result<(), EngineError> {
        if tokens.is_empty() {
            return Err(EngineError::PromptEval("empty prompt".to_string()));
        }

        let mut batch = LlamaBatch::new(tokens.len(), 1);
        let last = tokens.len() - 1;
        for (i, token) in tokens.iter().enumerate() {
            batch
                .add(LlamaToken::new(*token), self.n_past + i as i32, &[0], i == last)
                .map_err(|e| EngineError::PromptEval(e.to_string()))?;
        }

        self.ctx
            .decode(&mut batch)
            .map_err(|e| EngineError::PromptEval(e.to_string()))?;

        self.n_past += tokens.len() as i32;
        self.logits_index = batch.n_tokens() - 1;
        Ok(())
    }

    fn decode_token(&mut self, token: TokenId) -> Result<(), EngineError> {
        let mut batch = LlamaBatch::new(1, 1);
        batch
            .add(LlamaToken::new(token), self.n_past, &[0], true)
            .map_err(|e| EngineError::Decode(e.to_string()))?;

        self.ctx
            .decode(&mut batch)
            .map_err(|e| EngineError::Decode(e.to_string()))?;

        self.n_past += 1;
        self.logits_index = 0;
        Ok(())
    }

    fn new_sampler(&self, params: &SamplingParams) -> LlamaSampler {
        LlamaSampler::chain_simple([
            LlamaSampler::temp(params.temperature),
            LlamaSampler::top_p(params.top_p, 1),
            LlamaSampler::dist(params.seed),
        ])
    }

    fn sample(&mut self, sampler: &mut LlamaSampler) -> TokenId {
        sampler.sample(&self.ctx, self.logits_index).0
    }

    fn accept(&self, sampler: &mut LlamaSampler, token: TokenId) {
        sampler.accept(LlamaToken::new(token));
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.model.is_eog_token(LlamaToken::new(token))
    }

    fn token_bytes(&self, token: TokenId) -> Result<Vec<u8>, EngineError> {
        self.model
            .token_to_bytes(LlamaToken::new(token), Special::Tokenize)
            .map_err(|e| EngineError::Decode(format!("Failed to convert token to bytes: {e}")))
    }

    fn state_size(&self) -> u64 {
        self.ctx.get_state_size() as u64
    }
}
