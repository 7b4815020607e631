//! Inference engine implementation
//!
//! Owns the model/context lifetime and serializes load, unload and generation
//! setup.
//!
//! # Architecture
//!
//! llama.cpp contexts hold raw pointers that are not `Send`, so the weights and
//! their context live on a dedicated worker thread. [`LocalEngine`] talks to it
//! over channels. At most one model is alive at a time: a new load tears the
//! previous one down on the worker before parsing the new weights.
//!
//! Cancellation is cooperative. [`GenerationFlags`] carries a should-stop flag
//! polled once per token and an is-generating flag that unload and load wait
//! on before freeing anything.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inference::assembler::StopMarkers;
use crate::inference::llama::LlamaCppLoader;
use crate::inference::model::{validate_gguf, ModelError};
use crate::inference::runtime::{
    ContextParams, InferenceContext, LoadParams, ModelLoader, ModelWeights,
};
use crate::inference::session::{run_session, GenerationOutcome, GenerationRequest};
use crate::inference::streaming::{StreamToken, TokenStream};

/// Errors that can occur during inference operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Backend not initialized")]
    BackendNotInitialized,

    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("No model loaded")]
    NoModelLoaded,

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Prompt evaluation failed: {0}")]
    PromptEval(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("A generation is already in progress")]
    Busy,

    #[error("Worker thread error: {0}")]
    WorkerError(String),
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::ModelValidation(e.to_string())
    }
}

/// Information about the loaded model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Path the weights were loaded from
    pub path: PathBuf,
    /// Short description reported by the runtime
    pub description: String,
    /// Total parameter count
    #[serde(rename = "n_params")]
    pub param_count: u64,
    /// Context length of the live context
    #[serde(rename = "n_ctx")]
    pub context_length: u32,
    /// Vocabulary size
    #[serde(rename = "n_vocab")]
    pub vocab_size: i32,
    pub loaded_at: DateTime<Utc>,
}

impl ModelInfo {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Cooperative cancellation state shared by the engine, the worker and every
/// [`TokenStream`].
#[derive(Debug, Default)]
pub struct GenerationFlags {
    should_stop: AtomicBool,
    generating: Mutex<bool>,
    idle: Condvar,
    epoch: AtomicU64,
}

impl GenerationFlags {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.generating.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Asks the running generation to stop after the current token.
    pub fn request_stop(&self) {
        self.should_stop.store(true, Ordering::SeqCst);
    }

    pub fn should_stop(&self) -> bool {
        self.should_stop.load(Ordering::SeqCst)
    }

    pub fn is_generating(&self) -> bool {
        *self.lock()
    }

    /// Claims the single generation slot and returns its epoch.
    pub(crate) fn begin(&self) -> Result<u64, EngineError> {
        let mut generating = self.lock();
        if *generating {
            return Err(EngineError::Busy);
        }
        *generating = true;
        self.should_stop.store(false, Ordering::SeqCst);
        Ok(self.epoch.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Releases the generation slot and wakes waiters.
    pub(crate) fn finish(&self) {
        let mut generating = self.lock();
        *generating = false;
        self.idle.notify_all();
    }

    /// Stops the generation started at `epoch` if it is still the running one.
    pub(crate) fn cancel(&self, epoch: u64) {
        let generating = self.lock();
        if *generating && self.epoch.load(Ordering::SeqCst) == epoch {
            self.request_stop();
        }
    }

    /// Blocks until no generation is running.
    pub(crate) fn wait_idle(&self) {
        let mut generating = self.lock();
        while *generating {
            generating = self
                .idle
                .wait(generating)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Status the worker publishes for lock-free queries.
#[derive(Debug, Default)]
struct EngineStatus {
    loaded: AtomicBool,
    memory_bytes: AtomicU64,
}

impl EngineStatus {
    fn publish(&self, loaded: bool, memory_bytes: u64) {
        self.memory_bytes.store(memory_bytes, Ordering::SeqCst);
        self.loaded.store(loaded, Ordering::SeqCst);
    }
}

/// Commands sent to the worker thread
enum WorkerCommand {
    LoadModel {
        path: PathBuf,
        params: ContextParams,
        response_tx: Sender<Result<ModelInfo, EngineError>>,
    },
    UnloadModel {
        done_tx: Sender<()>,
    },
    Generate {
        request: GenerationRequest,
        markers: StopMarkers,
        token_tx: Sender<StreamToken>,
    },
    Shutdown,
}

struct EngineState<L> {
    /// Held until `init` moves it onto the worker thread
    loader: Option<L>,
    command_tx: Option<Sender<WorkerCommand>>,
    worker_handle: Option<JoinHandle<()>>,
    model_info: Option<ModelInfo>,
}

/// Local inference engine
///
/// Every method takes `&self`; share it behind an `Arc` between the UI side
/// (stop, status) and a background worker (load, generate).
pub struct LocalEngine<L: ModelLoader = LlamaCppLoader> {
    /// Serializes load, unload and generation setup
    state: Mutex<EngineState<L>>,
    flags: Arc<GenerationFlags>,
    status: Arc<EngineStatus>,
    markers: StopMarkers,
}

impl LocalEngine {
    /// Creates an engine backed by llama.cpp.
    pub fn new() -> Self {
        Self::with_loader(LlamaCppLoader)
    }
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ModelLoader> LocalEngine<L> {
    /// Creates an uninitialized engine over `loader`.
    pub fn with_loader(loader: L) -> Self {
        Self {
            state: Mutex::new(EngineState {
                loader: Some(loader),
                command_tx: None,
                worker_handle: None,
                model_info: None,
            }),
            flags: Arc::new(GenerationFlags::new()),
            status: Arc::new(EngineStatus::default()),
            markers: StopMarkers::default(),
        }
    }

    /// Replaces the stop markers used by future generations.
    pub fn with_stop_markers(mut self, markers: StopMarkers) -> Self {
        self.markers = markers;
        self
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState<L>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Initializes the runtime backend and starts the worker thread.
    ///
    /// Idempotent. On failure the engine stays unavailable and every other
    /// operation fails or does nothing.
    pub fn init(&self) -> Result<(), EngineError> {
        let mut state = self.lock_state();
        if state.command_tx.is_some() {
            return Ok(());
        }

        let loader = state
            .loader
            .take()
            .ok_or_else(|| EngineError::WorkerError("worker thread is gone".to_string()))?;

        if let Err(e) = loader.init_backend() {
            tracing::warn!("Inference backend unavailable: {}", e);
            state.loader = Some(loader);
            return Err(e);
        }

        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let flags = Arc::clone(&self.flags);
        let status = Arc::clone(&self.status);

        let handle = thread::Builder::new()
            .name("pocket-llm-worker".to_string())
            .spawn(move || worker_thread_main(loader, command_rx, flags, status))
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        state.command_tx = Some(command_tx);
        state.worker_handle = Some(handle);
        tracing::info!("Inference worker thread started");
        Ok(())
    }

    /// Returns true once `init` has succeeded
    pub fn is_available(&self) -> bool {
        self.lock_state().command_tx.is_some()
    }

    /// Loads a GGUF model, replacing any loaded one.
    ///
    /// The file header is checked first; if that fails the current model
    /// stays loaded. Otherwise the running generation (if any) is stopped,
    /// the old context and weights are freed and the new ones are loaded. A
    /// failure from that point leaves no model loaded.
    pub fn load_model<P: AsRef<Path>>(
        &self,
        path: P,
        params: &LoadParams,
    ) -> Result<ModelInfo, EngineError> {
        let path = path.as_ref();
        let mut state = self.lock_state();
        let command_tx = state
            .command_tx
            .clone()
            .ok_or(EngineError::BackendNotInitialized)?;

        let header = validate_gguf(path)?;
        tracing::debug!("GGUF v{} header passed for {:?}", header.version, path);

        self.cancel_and_wait();

        let params = params.resolve();
        tracing::info!("Loading model from: {}", path.display());

        let (response_tx, response_rx) = mpsc::channel();
        state.model_info = None;
        command_tx
            .send(WorkerCommand::LoadModel {
                path: path.to_path_buf(),
                params,
                response_tx,
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        let info = response_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))??;

        state.model_info = Some(info.clone());
        Ok(info)
    }

    /// Stops any running generation, waits for it to finish, then frees the
    /// context and weights. Does nothing when no model is loaded.
    pub fn unload_model(&self) {
        let mut state = self.lock_state();
        self.cancel_and_wait();

        if let Some(tx) = &state.command_tx {
            let (done_tx, done_rx) = mpsc::channel();
            if tx.send(WorkerCommand::UnloadModel { done_tx }).is_ok() {
                let _ = done_rx.recv();
            }
        }

        if state.model_info.take().is_some() {
            tracing::info!("Model unloaded");
        }
    }

    /// Returns true if weights and context are both alive
    pub fn is_model_loaded(&self) -> bool {
        self.status.loaded.load(Ordering::SeqCst)
    }

    /// Returns true while a generation holds the generation slot
    pub fn is_generating(&self) -> bool {
        self.flags.is_generating()
    }

    /// Returns information about the currently loaded model
    pub fn model_info(&self) -> Option<ModelInfo> {
        if !self.is_model_loaded() {
            return None;
        }
        self.lock_state().model_info.clone()
    }

    /// Serialized state size of the live context in bytes, 0 when unloaded.
    ///
    /// Refreshed after every load and every generation.
    pub fn memory_usage(&self) -> u64 {
        if self.is_model_loaded() {
            self.status.memory_bytes.load(Ordering::SeqCst)
        } else {
            0
        }
    }

    /// Requests the running generation to stop. Never blocks.
    pub fn stop_generation(&self) {
        self.flags.request_stop();
        tracing::info!("Generation stop requested");
    }

    /// Starts a generation and returns its increments as a stream.
    ///
    /// Fails fast with [`EngineError::Busy`] if another generation is running.
    /// Dropping the stream before it ends cancels the generation.
    pub fn generate_stream(&self, request: GenerationRequest) -> Result<TokenStream, EngineError> {
        let state = self.lock_state();
        let command_tx = state
            .command_tx
            .as_ref()
            .ok_or(EngineError::BackendNotInitialized)?;

        if !self.is_model_loaded() {
            return Err(EngineError::NoModelLoaded);
        }

        let epoch = self.flags.begin()?;
        let (token_tx, token_rx) = mpsc::channel();

        if let Err(e) = command_tx.send(WorkerCommand::Generate {
            request,
            markers: self.markers.clone(),
            token_tx,
        }) {
            self.flags.finish();
            return Err(EngineError::WorkerError(e.to_string()));
        }

        Ok(TokenStream::new(token_rx, Arc::clone(&self.flags), epoch))
    }

    /// Runs a generation to completion, passing each increment to `sink`.
    pub fn generate<F>(
        &self,
        request: GenerationRequest,
        sink: F,
    ) -> Result<GenerationOutcome, EngineError>
    where
        F: FnMut(&str),
    {
        self.generate_stream(request)?.drain_into(sink)
    }

    fn cancel_and_wait(&self) {
        if self.flags.is_generating() {
            self.flags.request_stop();
            self.flags.wait_idle();
        }
    }
}

impl<L: ModelLoader> Drop for LocalEngine<L> {
    fn drop(&mut self) {
        self.flags.request_stop();
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = state.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        if let Some(handle) = state.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Runs `generate` on tokio's blocking pool.
pub async fn generate_task<L, F>(
    engine: Arc<LocalEngine<L>>,
    request: GenerationRequest,
    sink: F,
) -> Result<GenerationOutcome, EngineError>
where
    L: ModelLoader,
    F: FnMut(&str) + Send + 'static,
{
    tokio::task::spawn_blocking(move || engine.generate(request, sink))
        .await
        .map_err(|e| EngineError::WorkerError(e.to_string()))?
}

/// Worker thread main loop
///
/// Owns the loader; the weights and context of the current model live in the
/// frame of [`serve_model`].
fn worker_thread_main<L: ModelLoader>(
    loader: L,
    command_rx: Receiver<WorkerCommand>,
    flags: Arc<GenerationFlags>,
    status: Arc<EngineStatus>,
) {
    let mut next = None;

    loop {
        let command = match next.take() {
            Some(command) => command,
            None => match command_rx.recv() {
                Ok(command) => command,
                Err(_) => {
                    tracing::debug!("Command channel closed, worker exiting");
                    break;
                }
            },
        };

        match command {
            WorkerCommand::LoadModel {
                path,
                params,
                response_tx,
            } => {
                let served = panic::catch_unwind(AssertUnwindSafe(|| {
                    serve_model(
                        &loader,
                        &path,
                        &params,
                        response_tx,
                        &command_rx,
                        &flags,
                        &status,
                    )
                }));
                next = match served {
                    Ok(next) => next,
                    Err(payload) => {
                        tracing::error!("Model worker panicked: {}", panic_message(&*payload));
                        status.publish(false, 0);
                        flags.finish();
                        None
                    }
                };
            }
            WorkerCommand::UnloadModel { done_tx } => {
                let _ = done_tx.send(());
            }
            WorkerCommand::Generate { token_tx, .. } => {
                flags.finish();
                let _ = token_tx.send(StreamToken::Error(EngineError::NoModelLoaded));
            }
            WorkerCommand::Shutdown => {
                tracing::info!("Worker thread shutting down");
                break;
            }
        }
    }
}

/// Loads a model and serves generations until another lifecycle command
/// arrives. The weights and context are freed before that command is
/// returned to the main loop.
fn serve_model<L: ModelLoader>(
    loader: &L,
    path: &Path,
    params: &ContextParams,
    response_tx: Sender<Result<ModelInfo, EngineError>>,
    command_rx: &Receiver<WorkerCommand>,
    flags: &GenerationFlags,
    status: &EngineStatus,
) -> Option<WorkerCommand> {
    let weights = match loader.load(path, params) {
        Ok(weights) => weights,
        Err(e) => {
            tracing::error!("Failed to load model: {}", e);
            let _ = response_tx.send(Err(e));
            return None;
        }
    };

    let mut ctx = match weights.new_context(params) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!("Failed to create context: {}", e);
            let _ = response_tx.send(Err(e));
            return None;
        }
    };

    let info = ModelInfo {
        path: path.to_path_buf(),
        description: weights.description(),
        param_count: weights.param_count(),
        context_length: ctx.n_ctx(),
        vocab_size: weights.vocab_size(),
        loaded_at: Utc::now(),
    };
    tracing::info!(
        "Model loaded: {} ({} params, {} vocab, {} ctx)",
        info.description,
        info.param_count,
        info.vocab_size,
        info.context_length
    );

    status.publish(true, ctx.state_size());
    let _ = response_tx.send(Ok(info));

    // Set when a generation panicked; its stream is answered after teardown.
    let mut aborted = None;

    let next = loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Generate {
                request,
                markers,
                token_tx,
            }) => {
                let threads = request.thread_override().unwrap_or(params.n_threads);
                if threads != ctx.n_threads() {
                    let session_params = ContextParams {
                        n_threads: threads,
                        ..*params
                    };
                    match weights.new_context(&session_params) {
                        Ok(resized) => {
                            tracing::debug!("Recreated context with {} threads", threads);
                            ctx = resized;
                        }
                        Err(e) => {
                            tracing::error!("Failed to apply thread count {}: {}", threads, e);
                            flags.finish();
                            let _ = token_tx.send(StreamToken::Error(e));
                            continue;
                        }
                    }
                }

                let mut sink = |text: String| token_tx.send(StreamToken::Token(text)).is_ok();
                let session = panic::catch_unwind(AssertUnwindSafe(|| {
                    run_session(&mut ctx, &request, &markers, flags, &mut sink)
                }));
                let terminal = match session {
                    Ok(Ok(outcome)) => StreamToken::Done(outcome),
                    Ok(Err(e)) => StreamToken::Error(e),
                    Err(payload) => {
                        let reason = panic_message(&*payload);
                        tracing::error!("Generation panicked, releasing model: {}", reason);
                        aborted = Some((token_tx, reason));
                        break None;
                    }
                };
                status.publish(true, ctx.state_size());
                flags.finish();
                let _ = token_tx.send(terminal);
            }
            Ok(other) => break Some(other),
            Err(_) => break Some(WorkerCommand::Shutdown),
        }
    };

    status.publish(false, 0);
    drop(ctx);
    drop(weights);
    tracing::info!("Model resources released");

    if let Some((token_tx, reason)) = aborted {
        flags.finish();
        let error = EngineError::WorkerError(format!("generation panicked: {reason}"));
        let _ = token_tx.send(StreamToken::Error(error));
    }
    next
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
