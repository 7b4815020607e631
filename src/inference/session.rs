//! Generation session controller
//!
//! Drives one generate call end-to-end against a loaded context:
//!
//! `Idle -> Tokenizing -> Prefilling -> Decoding -> {Stopped | Completed | Failed} -> Idle`
//!
//! The token cache is cleared before every prefill. Sessions never share
//! engine-level state; conversational memory lives in the prompt text.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::inference::assembler::{Assembled, StopMarkers, StreamAssembler};
use crate::inference::engine::{EngineError, GenerationFlags};
use crate::inference::runtime::{InferenceContext, SamplingParams};
use crate::truncate_str;

/// Output budget used when the request asks for zero or fewer tokens.
pub const DEFAULT_MAX_TOKENS: usize = 512;

/// Fixed sampling seed. Identical requests on an idle context produce
/// identical text.
pub const DEFAULT_SEED: u32 = 42;

/// Seed value llama.cpp replaces with a fresh random seed on every call.
pub const RANDOM_SEED: u32 = u32::MAX;

/// Parameters of one generate call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Prompt, already formatted with the model's conversational markup
    pub prompt: String,
    /// Maximum tokens to generate (<= 0 selects the default of 512)
    pub max_tokens: i32,
    /// Sampling temperature (>= 0)
    pub temperature: f32,
    /// Nucleus sampling threshold in (0, 1]
    pub top_p: f32,
    /// Seed of the final distribution draw
    pub seed: u32,
    /// Decode threads for this call only (`None` or <= 0 keeps the load setting)
    #[serde(default)]
    pub threads: Option<i32>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: DEFAULT_MAX_TOKENS as i32,
            temperature: 0.7,
            top_p: 0.9,
            seed: DEFAULT_SEED,
            threads: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: i32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_seed(mut self, seed: u32) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_threads(mut self, threads: i32) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Thread count this call asks for, if it overrides the loaded context.
    pub fn thread_override(&self) -> Option<i32> {
        self.threads.filter(|&n| n > 0)
    }

    /// Lets the runtime pick a new seed for every call.
    pub fn with_random_seed(self) -> Self {
        self.with_seed(RANDOM_SEED)
    }

    pub fn effective_max_tokens(&self) -> usize {
        if self.max_tokens > 0 {
            self.max_tokens as usize
        } else {
            DEFAULT_MAX_TOKENS
        }
    }

    /// Sampler settings with out-of-range values brought back into range.
    pub fn sampling(&self) -> SamplingParams {
        let temperature = if self.temperature.is_nan() {
            0.0
        } else {
            self.temperature.max(0.0)
        };
        let top_p = if self.top_p > 0.0 && self.top_p <= 1.0 {
            self.top_p
        } else {
            1.0
        };

        SamplingParams {
            temperature,
            top_p,
            seed: self.seed,
        }
    }
}

/// Why a generation ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// The model sampled an end-of-generation token
    EndOfGeneration,
    /// A stop marker appeared in the output
    StopMarker(String),
    /// The token budget ran out
    MaxTokens,
    /// Stop was requested or the consumer went away
    Cancelled,
    /// Decoding failed mid-generation; the text is partial
    DecodeFailed(String),
}

/// Final result of a successful generate call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutcome {
    pub id: Uuid,
    pub text: String,
    pub stop_reason: StopReason,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
}

/// Protocol states of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Tokenizing,
    Prefilling,
    Decoding,
    Stopped,
    Completed,
    Failed,
}

impl SessionState {
    fn after(stop_reason: &StopReason) -> Self {
        match stop_reason {
            StopReason::EndOfGeneration | StopReason::MaxTokens => SessionState::Completed,
            StopReason::StopMarker(_) | StopReason::Cancelled => SessionState::Stopped,
            StopReason::DecodeFailed(_) => SessionState::Failed,
        }
    }
}

fn transition(state: &mut SessionState, next: SessionState) {
    tracing::debug!("Session {:?} -> {:?}", state, next);
    *state = next;
}

/// Runs one generation on `ctx`.
///
/// `sink` receives every text increment in order and returns `false` once the
/// consumer is gone, which cancels the generation. Errors are returned only
/// for failures before decoding starts; later failures end the generation
/// with partial text and [`StopReason::DecodeFailed`].
pub fn run_session<C: InferenceContext>(
    ctx: &mut C,
    request: &GenerationRequest,
    markers: &StopMarkers,
    flags: &GenerationFlags,
    sink: &mut dyn FnMut(String) -> bool,
) -> Result<GenerationOutcome, EngineError> {
    let mut state = SessionState::Idle;
    drive_session(ctx, request, markers, flags, sink, &mut state)
}

/// Body of [`run_session`]; `state` walks the protocol and ends at `Idle`.
pub(crate) fn drive_session<C: InferenceContext>(
    ctx: &mut C,
    request: &GenerationRequest,
    markers: &StopMarkers,
    flags: &GenerationFlags,
    sink: &mut dyn FnMut(String) -> bool,
    state: &mut SessionState,
) -> Result<GenerationOutcome, EngineError> {
    let id = Uuid::new_v4();
    let span = tracing::info_span!("generation", %id);
    let _enter = span.enter();

    tracing::info!(
        "Generating response for prompt length {}: {:?}",
        request.prompt.len(),
        truncate_str(&request.prompt, 64)
    );

    transition(state, SessionState::Tokenizing);
    let tokens = match ctx.tokenize(&request.prompt) {
        Ok(tokens) => tokens,
        Err(e) => {
            transition(state, SessionState::Failed);
            tracing::error!("Tokenization failed: {}", e);
            transition(state, SessionState::Idle);
            return Err(e);
        }
    };
    tracing::debug!("Tokenized prompt into {} tokens", tokens.len());

    transition(state, SessionState::Prefilling);
    ctx.clear_cache();
    if let Err(e) = ctx.decode_prompt(&tokens) {
        transition(state, SessionState::Failed);
        tracing::error!("Prompt evaluation failed: {}", e);
        transition(state, SessionState::Idle);
        return Err(e);
    }

    transition(state, SessionState::Decoding);
    let mut sampler = ctx.new_sampler(&request.sampling());
    let mut assembler = StreamAssembler::new(markers.clone());
    let max_tokens = request.effective_max_tokens();
    let mut generated = 0;
    let mut stop_reason = StopReason::MaxTokens;

    while generated < max_tokens {
        if flags.should_stop() {
            tracing::debug!("Generation stopped by request");
            stop_reason = StopReason::Cancelled;
            break;
        }

        let token = ctx.sample(&mut sampler);
        if ctx.is_end_of_generation(token) {
            tracing::debug!("End of generation token at {}", generated);
            stop_reason = StopReason::EndOfGeneration;
            break;
        }

        let piece = match ctx.token_bytes(token) {
            Ok(piece) => piece,
            Err(e) => {
                tracing::warn!("Token to piece failed at {}: {}", generated, e);
                stop_reason = StopReason::DecodeFailed(e.to_string());
                break;
            }
        };
        generated += 1;

        match assembler.push(&piece) {
            Assembled::Text(text) => {
                if !sink(text) {
                    tracing::debug!("Receiver dropped, stopping generation");
                    flags.request_stop();
                    stop_reason = StopReason::Cancelled;
                    break;
                }
            }
            Assembled::Pending => {}
            Assembled::Stop { marker } => {
                flags.request_stop();
                stop_reason = StopReason::StopMarker(marker);
                break;
            }
        }

        ctx.accept(&mut sampler, token);
        if let Err(e) = ctx.decode_token(token) {
            tracing::warn!("Decode failed at token {}: {}", generated, e);
            stop_reason = StopReason::DecodeFailed(e.to_string());
            break;
        }
    }

    let finished = assembler.finish();
    if let Some(tail) = finished.tail {
        sink(tail);
    }

    transition(state, SessionState::after(&stop_reason));
    tracing::info!(
        "Generated {} tokens ({} bytes), stop reason: {:?}",
        generated,
        finished.text.len(),
        stop_reason
    );
    transition(state, SessionState::Idle);

    Ok(GenerationOutcome {
        id,
        text: finished.text,
        stop_reason,
        prompt_tokens: tokens.len(),
        generated_tokens: generated,
    })
}
