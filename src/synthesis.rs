//! Synthesis job runner
//!
//! Runs the external speech-synthesis engine once per request. The engine is
//! started as a subprocess in JSON-input mode, receives one JSON object on
//! stdin (the request fields plus the destination path), and is expected to
//! write a waveform file at that path and exit with status 0.
//!
//! The runner trusts neither the exit code nor the file alone: a job succeeds
//! only if the engine exited cleanly *and* the artifact exists afterwards.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, field, instrument, warn, Span};

use crate::protocol::{ErrorCode, SynthesisRequest, OUTPUT_FILE_KEY};
use crate::store::{Artifact, ArtifactStore};

/// Captured engine stderr is cut to this many bytes before it is reported
pub const MAX_STDERR_BYTES: usize = 2048;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur while running a synthesis job
#[derive(Error, Debug, Clone)]
pub enum SynthesisError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Engine unavailable ({program}): {reason}")]
    EngineUnavailable { program: String, reason: String },

    #[error("Engine exited with {status}: {stderr}")]
    EngineFailed { status: String, stderr: String },

    #[error("Artifact missing: {}", .0.display())]
    ArtifactMissing(PathBuf),

    #[error("Synthesis timeout after {0}ms")]
    Timeout(u64),

    #[error("Admission gate closed")]
    AdmissionClosed,

    #[error("IO error: {0}")]
    IoError(String),
}

impl SynthesisError {
    /// Whether no later request on the same session can succeed either
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SynthesisError::EngineUnavailable { .. } | SynthesisError::AdmissionClosed
        )
    }

    /// Error code reported to the client
    pub fn code(&self) -> ErrorCode {
        match self {
            SynthesisError::InvalidInput(_) => ErrorCode::InvalidRequest,
            SynthesisError::EngineUnavailable { .. } => ErrorCode::EngineUnavailable,
            SynthesisError::EngineFailed { .. } => ErrorCode::SynthesisFailed,
            SynthesisError::ArtifactMissing(_) => ErrorCode::ArtifactMissing,
            SynthesisError::Timeout(_) => ErrorCode::Timeout,
            SynthesisError::AdmissionClosed | SynthesisError::IoError(_) => ErrorCode::Internal,
        }
    }
}

impl From<std::io::Error> for SynthesisError {
    fn from(err: std::io::Error) -> Self {
        SynthesisError::IoError(err.to_string())
    }
}

// =============================================================================
// Engine Configuration
// =============================================================================

/// How to invoke the external engine
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Engine executable
    pub program: PathBuf,
    /// Extra arguments placed before the generated ones
    pub engine_args: Vec<String>,
    /// Voice model passed as `--model`
    pub model: Option<PathBuf>,
    /// Ask the engine for accelerated execution (`--cuda`)
    pub cuda: bool,
    /// Upper bound on one job; a hung engine is killed afterwards
    pub timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("piper"),
            engine_args: Vec::new(),
            model: None,
            cuda: false,
            timeout: None,
        }
    }
}

impl EngineConfig {
    /// Arguments passed to the engine, in order
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.engine_args.iter().map(OsString::from).collect();
        if let Some(model) = &self.model {
            args.push("--model".into());
            args.push(model.as_os_str().to_owned());
        }
        args.push("--json-input".into());
        if self.cuda {
            args.push("--cuda".into());
        }
        args
    }

    /// The single definition of how the engine is started
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Build the JSON object written to the engine's stdin
///
/// Client parameters are forwarded verbatim; the destination path is always
/// the one allocated by the store.
pub fn engine_payload(request: &SynthesisRequest, output: &Path) -> Value {
    let mut payload: Map<String, Value> = request.params.clone();
    payload.insert("text".into(), Value::String(request.text.clone()));
    if let Some(voice) = &request.voice {
        payload.insert("voice".into(), Value::String(voice.clone()));
    }
    if let Some(format) = &request.format {
        payload.insert("format".into(), Value::String(format.clone()));
    }
    payload.insert(
        OUTPUT_FILE_KEY.into(),
        Value::String(output.to_string_lossy().into_owned()),
    );
    Value::Object(payload)
}

fn truncate_stderr(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.len() <= MAX_STDERR_BYTES {
        return text.to_string();
    }
    let mut end = MAX_STDERR_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

// =============================================================================
// Synthesizer
// =============================================================================

/// Anything that turns a request into an artifact on disk
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize one request
    ///
    /// Dropping the returned future cancels the job.
    async fn synthesize(&self, request: SynthesisRequest) -> Result<Artifact, SynthesisError>;
}

/// Runs the external engine as a subprocess, at most `limit` jobs at a time
pub struct SynthesisJobRunner {
    store: ArtifactStore,
    engine: EngineConfig,
    admission: Arc<Semaphore>,
    limit: usize,
}

impl SynthesisJobRunner {
    /// Create a runner; `max_concurrent_jobs` is clamped to at least one
    pub fn new(store: ArtifactStore, engine: EngineConfig, max_concurrent_jobs: usize) -> Self {
        let limit = max_concurrent_jobs.max(1);
        Self {
            store,
            engine,
            admission: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.engine
    }

    /// Maximum number of simultaneous engine processes
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Jobs that could still be admitted right now
    pub fn available_slots(&self) -> usize {
        self.admission.available_permits()
    }

    fn spawn_error(&self, err: std::io::Error) -> SynthesisError {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                SynthesisError::EngineUnavailable {
                    program: self.engine.program.display().to_string(),
                    reason: err.to_string(),
                }
            }
            _ => err.into(),
        }
    }

    async fn run_engine(
        &self,
        request: &SynthesisRequest,
        artifact: &Artifact,
    ) -> Result<(), SynthesisError> {
        let mut line = serde_json::to_vec(&engine_payload(request, &artifact.path))
            .map_err(|e| SynthesisError::IoError(e.to_string()))?;
        line.push(b'\n');

        let mut child = self
            .engine
            .command()
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SynthesisError::IoError("engine stdin unavailable".to_string()))?;

        // Feed stdin while stdout/stderr are drained so neither side can
        // block on a full pipe buffer.
        let feed = async move {
            stdin.write_all(&line).await?;
            stdin.shutdown().await?;
            drop(stdin);
            Ok::<(), std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;

        if !output.status.success() {
            return Err(SynthesisError::EngineFailed {
                status: output.status.to_string(),
                stderr: truncate_stderr(&output.stderr),
            });
        }
        if let Err(e) = fed {
            warn!(error = %e, "engine exited before reading the whole request");
        }
        Ok(())
    }

    async fn discard(&self, artifact: &Artifact) {
        if let Err(e) = tokio::fs::remove_file(&artifact.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %artifact.path.display(), error = %e, "failed to discard partial artifact");
            }
        }
    }
}

#[async_trait]
impl Synthesizer for SynthesisJobRunner {
    #[instrument(skip_all, fields(text_len = request.text.len(), artifact = field::Empty))]
    async fn synthesize(&self, request: SynthesisRequest) -> Result<Artifact, SynthesisError> {
        if request.is_blank() {
            return Err(SynthesisError::InvalidInput("text is empty".to_string()));
        }

        let _permit = self
            .admission
            .acquire()
            .await
            .map_err(|_| SynthesisError::AdmissionClosed)?;

        let artifact = self.store.allocate();
        Span::current().record("artifact", field::display(&artifact.id));
        let started = Instant::now();

        let job = self.run_engine(&request, &artifact);
        let outcome = match self.engine.timeout {
            Some(limit) => match tokio::time::timeout(limit, job).await {
                Ok(result) => result,
                Err(_) => Err(SynthesisError::Timeout(limit.as_millis() as u64)),
            },
            None => job.await,
        };
        if let Err(e) = outcome {
            self.discard(&artifact).await;
            return Err(e);
        }

        if !self.store.exists(&artifact.path).await {
            return Err(SynthesisError::ArtifactMissing(artifact.path));
        }

        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "synthesis complete"
        );
        Ok(artifact)
    }
}
