//! WebSocket protocol messages for the TTS gateway
//!
//! Inbound frames are plain JSON objects carrying the text to synthesize plus
//! optional engine parameters. Outbound traffic is one binary frame of audio
//! per successful request, preceded by an `audio` text frame naming the
//! artifact, or a single `error` text frame when the request failed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Payload key carrying the destination path to the engine.
///
/// Always generated by the gateway; a client-supplied value is discarded.
pub const OUTPUT_FILE_KEY: &str = "output_file";

/// Errors in what a client sent over the session channel
///
/// Any of these terminates the offending session only.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("binary frames are not accepted from clients")]
    UnexpectedBinary,
}

/// A text-to-speech request as received from a client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SynthesisRequest {
    /// The text to synthesize
    pub text: String,
    /// Voice or speaker selection, forwarded verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    /// Requested output format, forwarded verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Any other engine-specific parameters (e.g. `speaker`, `length_scale`)
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl SynthesisRequest {
    /// Create a request with only text set
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice: None,
            format: None,
            params: Map::new(),
        }
    }

    /// Set the voice
    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    /// Add an engine parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Whether there is anything to speak
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Parse one inbound text frame
pub fn parse_request(frame: &str) -> Result<SynthesisRequest, ProtocolError> {
    let mut request: SynthesisRequest =
        serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    request.params.remove(OUTPUT_FILE_KEY);
    Ok(request)
}

/// Stable error discriminant for client-side handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SynthesisFailed,
    Timeout,
    ArtifactMissing,
    InvalidRequest,
    ProtocolError,
    DuplicateSession,
    EngineUnavailable,
    Internal,
}

/// Messages sent from the server to the client as text frames
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Session registered and ready for requests
    Ready {
        /// Unique identifier of this connection
        session_id: String,
        /// Client identifier taken from the connection path
        client_id: String,
    },
    /// The next binary frame carries the audio of this artifact
    Audio {
        /// File name usable with the `/audio/{artifact}` endpoint
        artifact: String,
        /// Size of the following binary frame
        bytes: usize,
    },
    /// A request failed or the session is being refused/terminated
    Error {
        code: ErrorCode,
        /// Human-readable error message
        message: String,
    },
}

impl ServerMessage {
    /// Shorthand for an error message
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }

    /// Serialize to the JSON text of a frame
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            "{\"type\":\"error\",\"code\":\"internal\",\"message\":\"serialization failure\"}"
                .to_string()
        })
    }
}
