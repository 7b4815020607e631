//! PocketLLM - local LLM inference from the command line
//!
//! Loads a GGUF model and streams a completion for one prompt to stdout.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pocket_llm::inference::{LocalEngine, StopReason};
use pocket_llm::storage::settings::{load_settings, save_settings, EngineSettings};

/// Run a local GGUF model on a single prompt
#[derive(Parser)]
#[command(name = "pocket-llm")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a GGUF model file
    model: PathBuf,

    /// Prompt text (read from stdin when omitted)
    #[arg(short, long)]
    prompt: Option<String>,

    /// Context window in tokens
    #[arg(long)]
    ctx: Option<i32>,

    /// Decode threads
    #[arg(short, long)]
    threads: Option<i32>,

    /// Maximum tokens to generate
    #[arg(short = 'n', long)]
    max_tokens: Option<i32>,

    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long)]
    top_p: Option<f32>,

    /// Sampling seed
    #[arg(long)]
    seed: Option<u32>,

    /// Offload layers to the GPU
    #[arg(long)]
    gpu: bool,

    /// Print model information as JSON and exit
    #[arg(long)]
    info: bool,

    /// Persist the effective settings as the new defaults
    #[arg(long)]
    save: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply_to(&self, settings: &mut EngineSettings) {
        if let Some(ctx) = self.ctx {
            settings.context_size = ctx;
        }
        if let Some(threads) = self.threads {
            settings.threads = threads;
        }
        if let Some(max_tokens) = self.max_tokens {
            settings.max_tokens = max_tokens;
        }
        if let Some(temperature) = self.temperature {
            settings.temperature = temperature;
        }
        if let Some(top_p) = self.top_p {
            settings.top_p = top_p;
        }
        if let Some(seed) = self.seed {
            settings.seed = seed;
        }
        if self.gpu {
            settings.use_gpu = true;
        }
        settings.validate();
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let directive = if cli.verbose {
        "pocket_llm=debug"
    } else {
        "pocket_llm=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();

    info!("Starting PocketLLM v{}", env!("CARGO_PKG_VERSION"));

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut settings = load_settings();
    cli.apply_to(&mut settings);

    if cli.save {
        save_settings(&settings)?;
        info!("Saved settings");
    }

    let engine = LocalEngine::new().with_stop_markers(settings.stop_markers());
    engine.init()?;

    let model = engine.load_model(&cli.model, &settings.load_params())?;
    if cli.info {
        println!("{}", model.to_json());
        return Ok(());
    }

    let prompt = match cli.prompt {
        Some(prompt) => prompt,
        None => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };

    let mut stdout = io::stdout().lock();
    let outcome = engine.generate(settings.request(prompt), |text| {
        // A closed stdout just ends the visible output
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    })?;
    writeln!(stdout)?;

    info!(
        "Generated {} tokens ({} prompt), memory {} MB",
        outcome.generated_tokens,
        outcome.prompt_tokens,
        engine.memory_usage() / (1024 * 1024)
    );

    if let StopReason::DecodeFailed(reason) = &outcome.stop_reason {
        return Err(format!("generation stopped early: {reason}").into());
    }
    Ok(())
}
