//! Configuration and CLI for the TTS gateway

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;

use crate::sweeper::RetentionConfig;
use crate::synthesis::EngineConfig;

/// Command line arguments with subcommands
///
/// Without a subcommand the gateway serves, using the top-level serve flags.
#[derive(Parser, Debug, Clone)]
#[command(name = "tts-gateway")]
#[command(about = "Real-time text-to-speech gateway over WebSocket")]
#[command(version)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, global = true, default_value = "info", env = "TTS_GATEWAY_LOG")]
    pub log: String,
}

impl Cli {
    /// The subcommand to run, `serve` when none was given
    pub fn command_or_serve(&self) -> Commands {
        self.command
            .clone()
            .unwrap_or_else(|| Commands::Serve(self.serve.clone()))
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the gateway server
    Serve(ServeArgs),
    /// Synthesize one text to a WAV file
    Synthesize(SynthesizeArgs),
    /// Delete expired artifacts once and exit
    Sweep(SweepArgs),
}

/// How the engine subprocess is launched
#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    /// Engine executable
    #[arg(long, default_value = "piper", env = "TTS_GATEWAY_ENGINE")]
    pub engine: PathBuf,

    /// Voice model passed to the engine as --model
    #[arg(long, env = "TTS_GATEWAY_MODEL")]
    pub model: Option<PathBuf>,

    /// Extra engine argument (repeatable)
    #[arg(long = "engine-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub engine_args: Vec<String>,

    /// Ask the engine for CUDA acceleration
    #[arg(long, env = "TTS_GATEWAY_CUDA")]
    pub cuda: bool,

    /// Kill an engine run that takes longer than this
    #[arg(long, env = "TTS_GATEWAY_SYNTHESIS_TIMEOUT_SECS")]
    pub synthesis_timeout_secs: Option<u64>,
}

impl EngineArgs {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            program: self.engine.clone(),
            engine_args: self.engine_args.clone(),
            model: self.model.clone(),
            cuda: self.cuda,
            timeout: self.synthesis_timeout_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Host address to bind to
    #[arg(long, default_value = "0.0.0.0", env = "TTS_GATEWAY_HOST")]
    pub host: String,

    /// Port to listen on
    #[arg(long, default_value_t = 8000, env = "TTS_GATEWAY_PORT")]
    pub port: u16,

    /// Working directory for synthesized audio
    #[arg(long, default_value = "temporary_audio_files", env = "TTS_GATEWAY_AUDIO_DIR")]
    pub audio_dir: PathBuf,

    #[command(flatten)]
    pub engine: EngineArgs,

    /// Maximum engine processes running at once
    #[arg(long, default_value_t = 4, env = "TTS_GATEWAY_MAX_CONCURRENT_JOBS")]
    pub max_concurrent_jobs: usize,

    /// Seconds between retention sweeps
    #[arg(long, default_value_t = 3600, env = "TTS_GATEWAY_SWEEP_INTERVAL_SECS")]
    pub sweep_interval_secs: u64,

    /// Artifacts older than this many seconds are deleted
    #[arg(long, default_value_t = 3600, env = "TTS_GATEWAY_MAX_AGE_SECS")]
    pub max_age_secs: u64,
}

impl ServeArgs {
    pub fn retention_config(&self) -> RetentionConfig {
        RetentionConfig {
            interval: Duration::from_secs(self.sweep_interval_secs),
            max_age: Duration::from_secs(self.max_age_secs),
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            host: self.host.clone(),
            port: self.port,
            audio_dir: self.audio_dir.clone(),
            engine: self.engine.engine_config(),
            max_concurrent_jobs: self.max_concurrent_jobs,
            retention: self.retention_config(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct SynthesizeArgs {
    /// Text to synthesize
    #[arg(short, long)]
    pub text: String,

    /// Output WAV file
    #[arg(short, long, default_value = "sample.wav")]
    pub output: PathBuf,

    /// Voice selection forwarded to the engine
    #[arg(long)]
    pub voice: Option<String>,

    /// Scratch directory for the engine output
    #[arg(long, default_value = "temporary_audio_files", env = "TTS_GATEWAY_AUDIO_DIR")]
    pub audio_dir: PathBuf,

    #[command(flatten)]
    pub engine: EngineArgs,
}

#[derive(Args, Debug, Clone)]
pub struct SweepArgs {
    /// Working directory to sweep
    #[arg(long, default_value = "temporary_audio_files", env = "TTS_GATEWAY_AUDIO_DIR")]
    pub audio_dir: PathBuf,

    /// Artifacts older than this many seconds are deleted
    #[arg(long, default_value_t = 3600, env = "TTS_GATEWAY_MAX_AGE_SECS")]
    pub max_age_secs: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("sweep interval must be greater than zero")]
    ZeroSweepInterval,

    #[error("artifact max age must be greater than zero")]
    ZeroMaxAge,

    #[error("artifact max age ({max_age_secs}s) must exceed the synthesis timeout ({timeout_secs}s)")]
    MaxAgeWithinTimeout { max_age_secs: u64, timeout_secs: u64 },

    #[error("max concurrent jobs must be greater than zero")]
    ZeroConcurrency,
}

/// Fully resolved server configuration
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub audio_dir: PathBuf,
    pub engine: EngineConfig,
    pub max_concurrent_jobs: usize,
    pub retention: RetentionConfig,
}

impl GatewayConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject settings under which an artifact could be swept while still in use
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retention.interval.is_zero() {
            return Err(ConfigError::ZeroSweepInterval);
        }
        if self.retention.max_age.is_zero() {
            return Err(ConfigError::ZeroMaxAge);
        }
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if let Some(timeout) = self.engine.timeout {
            if self.retention.max_age <= timeout {
                return Err(ConfigError::MaxAgeWithinTimeout {
                    max_age_secs: self.retention.max_age.as_secs(),
                    timeout_secs: timeout.as_secs(),
                });
            }
        }
        Ok(())
    }
}

/// Initialize tracing with given log level
pub fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Load environment variables from .env file
pub fn load_dotenv() {
    let _ = dotenvy::dotenv();
}
