//! Scripted in-process runtime for tests.
//!
//! Tokens are indices into a list of byte pieces. Sampling walks the script in
//! order, or draws from it with a seeded generator in random mode. Counters
//! expose live weights and decode steps so tests can observe resource release
//! and cancellation latency.

use std::path::Path;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::inference::engine::EngineError;
use crate::inference::runtime::{
    ContextParams, InferenceContext, ModelLoader, ModelWeights, SamplingParams, TokenId,
};

pub const EOG_TOKEN: TokenId = -1;

#[derive(Debug, Clone, Default)]
pub struct MockScript {
    pieces: Vec<Vec<u8>>,
    end_after: Option<usize>,
    random: bool,
    decode_delay: Duration,
    fail_prompt: bool,
    fail_decode_at: Option<usize>,
    panic_decode_at: Option<usize>,
}

impl MockScript {
    pub fn pieces(pieces: &[&str]) -> Self {
        Self::byte_pieces(pieces.iter().map(|p| p.as_bytes().to_vec()).collect())
    }

    pub fn byte_pieces(pieces: Vec<Vec<u8>>) -> Self {
        Self {
            pieces,
            ..Self::default()
        }
    }

    /// Samples the end-of-generation token after `n` tokens.
    pub fn ending_after(mut self, n: usize) -> Self {
        self.end_after = Some(n);
        self
    }

    /// Draws pieces with a generator seeded from the sampler seed.
    pub fn random(mut self) -> Self {
        self.random = true;
        self
    }

    pub fn with_decode_delay(mut self, delay: Duration) -> Self {
        self.decode_delay = delay;
        self
    }

    pub fn failing_prompt(mut self) -> Self {
        self.fail_prompt = true;
        self
    }

    /// Fails the `n`-th single-token decode (0-based).
    pub fn failing_decode_at(mut self, n: usize) -> Self {
        self.fail_decode_at = Some(n);
        self
    }

    /// Panics inside the `n`-th single-token decode (0-based).
    pub fn panicking_decode_at(mut self, n: usize) -> Self {
        self.panic_decode_at = Some(n);
        self
    }
}

/// Shared observation counters
#[derive(Debug, Default)]
pub struct MockCounters {
    pub live_weights: AtomicUsize,
    pub loads: AtomicUsize,
    pub decode_steps: AtomicUsize,
    pub contexts: AtomicUsize,
    /// Thread count of the most recently created context
    pub context_threads: AtomicI32,
}

pub struct MockLoader {
    script: Arc<MockScript>,
    counters: Arc<MockCounters>,
    available: bool,
}

impl MockLoader {
    pub fn new(script: MockScript) -> Self {
        Self {
            script: Arc::new(script),
            counters: Arc::new(MockCounters::default()),
            available: true,
        }
    }

    /// A loader whose backend cannot be initialized.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(MockScript::default())
        }
    }

    pub fn counters(&self) -> Arc<MockCounters> {
        Arc::clone(&self.counters)
    }
}

impl ModelLoader for MockLoader {
    type Weights = MockWeights;

    fn init_backend(&self) -> Result<(), EngineError> {
        if self.available {
            Ok(())
        } else {
            Err(EngineError::BackendInit("runtime not linked".to_string()))
        }
    }

    fn load(&self, path: &Path, _params: &ContextParams) -> Result<MockWeights, EngineError> {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.contains("explode") {
            panic!("runtime aborted while parsing {name}");
        }
        if name.contains("corrupt") {
            return Err(EngineError::ModelLoad(format!("cannot parse {name}")));
        }

        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        self.counters.live_weights.fetch_add(1, Ordering::SeqCst);
        Ok(MockWeights {
            name,
            script: Arc::clone(&self.script),
            counters: Arc::clone(&self.counters),
        })
    }
}

pub struct MockWeights {
    name: String,
    script: Arc<MockScript>,
    counters: Arc<MockCounters>,
}

impl Drop for MockWeights {
    fn drop(&mut self) {
        self.counters.live_weights.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ModelWeights for MockWeights {
    type Context<'a> = MockContext<'a>;

    fn new_context(&self, params: &ContextParams) -> Result<MockContext<'_>, EngineError> {
        if self.name.contains("oversized") {
            return Err(EngineError::ContextCreate("out of memory".to_string()));
        }
        self.counters.contexts.fetch_add(1, Ordering::SeqCst);
        self.counters
            .context_threads
            .store(params.n_threads, Ordering::SeqCst);
        Ok(MockContext {
            weights: self,
            n_ctx: params.n_ctx,
            n_threads: params.n_threads,
            n_past: 0,
            step: 0,
        })
    }

    fn description(&self) -> String {
        format!("mock {}", self.name)
    }

    fn param_count(&self) -> u64 {
        1_000_000
    }

    fn vocab_size(&self) -> i32 {
        self.script.pieces.len() as i32
    }
}

pub struct MockContext<'a> {
    weights: &'a MockWeights,
    n_ctx: u32,
    n_threads: i32,
    n_past: usize,
    /// Generated tokens decoded since the last cache clear
    step: usize,
}

pub struct MockSampler {
    state: u64,
}

impl MockSampler {
    fn next(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state >> 33
    }
}

impl InferenceContext for MockContext<'_> {
    type Sampler = MockSampler;

    fn n_ctx(&self) -> u32 {
        self.n_ctx
    }

    fn n_threads(&self) -> i32 {
        self.n_threads
    }

    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, EngineError> {
        // BOS plus one token per word
        let tokens: Vec<TokenId> = std::iter::once(0)
            .chain(text.split_whitespace().map(|w| w.len() as TokenId))
            .collect();
        if tokens.len() > self.n_ctx as usize {
            return Err(EngineError::Tokenization(format!(
                "prompt is {} tokens, context holds {}",
                tokens.len(),
                self.n_ctx
            )));
        }
        Ok(tokens)
    }

    fn clear_cache(&mut self) {
        self.n_past = 0;
        self.step = 0;
    }

    fn decode_prompt(&mut self, tokens: &[TokenId]) -> Result<(), EngineError> {
        if self.weights.script.fail_prompt {
            return Err(EngineError::PromptEval("decode returned 1".to_string()));
        }
        self.n_past += tokens.len();
        Ok(())
    }

    fn decode_token(&mut self, _token: TokenId) -> Result<(), EngineError> {
        let script = &self.weights.script;
        self.weights
            .counters
            .decode_steps
            .fetch_add(1, Ordering::SeqCst);
        if !script.decode_delay.is_zero() {
            thread::sleep(script.decode_delay);
        }
        if script.panic_decode_at == Some(self.step) {
            panic!("runtime aborted in decode at step {}", self.step);
        }
        if script.fail_decode_at == Some(self.step) {
            return Err(EngineError::Decode("decode returned -1".to_string()));
        }
        self.n_past += 1;
        self.step += 1;
        Ok(())
    }

    fn new_sampler(&self, params: &SamplingParams) -> MockSampler {
        MockSampler {
            state: u64::from(params.seed) ^ params.temperature.to_bits() as u64,
        }
    }

    fn sample(&mut self, sampler: &mut MockSampler) -> TokenId {
        let script = &self.weights.script;
        if script.end_after == Some(self.step) || script.pieces.is_empty() {
            return EOG_TOKEN;
        }
        let index = if script.random {
            sampler.next() as usize % script.pieces.len()
        } else {
            self.step % script.pieces.len()
        };
        index as TokenId
    }

    fn accept(&self, sampler: &mut MockSampler, token: TokenId) {
        sampler.state ^= token as u64;
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOG_TOKEN
    }

    fn token_bytes(&self, token: TokenId) -> Result<Vec<u8>, EngineError> {
        usize::try_from(token)
            .ok()
            .and_then(|i| self.weights.script.pieces.get(i))
            .cloned()
            .ok_or_else(|| EngineError::Decode(format!("unknown token {token}")))
    }

    fn state_size(&self) -> u64 {
        u64::from(self.n_ctx) * 64 + self.n_past as u64 * 16
    }
}
