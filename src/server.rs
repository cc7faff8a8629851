//! HTTP and WebSocket surface of the gateway
//!
//! - `GET /healthz`: liveness probe
//! - `GET /ws/:client_id`: upgrade to a synthesis session
//! - `GET /audio/:filename`: fetch a stored artifact by its file name

use std::{future::Future, sync::Arc};

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::{
    registry::ConnectionRegistry,
    session::{run_session, SessionContext},
    store::{ArtifactError, ArtifactStore},
    synthesis::Synthesizer,
};

/// Application state shared across all connections
#[derive(Clone)]
pub struct AppState {
    /// Directory holding synthesized artifacts
    pub store: ArtifactStore,
    /// Runs synthesis jobs for every session
    pub synthesizer: Arc<dyn Synthesizer>,
    /// Live sessions by client id
    pub registry: ConnectionRegistry,
}

impl AppState {
    pub fn new(store: ArtifactStore, synthesizer: Arc<dyn Synthesizer>) -> Self {
        Self {
            store,
            synthesizer,
            registry: ConnectionRegistry::new(),
        }
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            store: self.store.clone(),
            synthesizer: self.synthesizer.clone(),
            registry: self.registry.clone(),
        }
    }
}

/// Errors returned by the plain HTTP routes
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    status: u16,
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            HttpError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            HttpError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            HttpError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        let body = ErrorBody {
            error: message,
            status: status.as_u16(),
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<ArtifactError> for HttpError {
    fn from(err: ArtifactError) -> Self {
        match err {
            ArtifactError::NotFound(name) => HttpError::NotFound(name),
            ArtifactError::InvalidName(name) => {
                HttpError::BadRequest(format!("invalid artifact name: {name}"))
            }
            other => HttpError::Internal(other.to_string()),
        }
    }
}

/// Create the Axum router with all routes
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws/:client_id", get(ws_handler))
        .route("/audio/:filename", get(audio_handler))
        .with_state(state)
}

/// Start the server with graceful shutdown support
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    state: AppState,
    shutdown: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state);
    info!("starting axum server");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("server shut down gracefully");
    Ok(())
}

/// Health check endpoint
async fn healthz() -> &'static str {
    "ok"
}

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(client_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    debug!(client_id = %client_id, "websocket upgrade requested");
    let ctx = state.session_context();
    ws.on_upgrade(move |socket| async move {
        run_session(socket, client_id, ctx).await;
    })
}

/// Serve a stored artifact as `audio/wav`
async fn audio_handler(
    Path(filename): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, HttpError> {
    let bytes = state.store.read_named(&filename).await.map_err(|e| {
        if !matches!(e, ArtifactError::NotFound(_)) {
            warn!(filename = %filename, error = %e, "artifact request failed");
        }
        HttpError::from(e)
    })?;
    Ok(([(header::CONTENT_TYPE, "audio/wav")], bytes).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SynthesisRequest;
    use crate::store::Artifact;
    use crate::synthesis::SynthesisError;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct NoopSynthesizer;

    #[async_trait]
    impl Synthesizer for NoopSynthesizer {
        async fn synthesize(&self, _req: SynthesisRequest) -> Result<Artifact, SynthesisError> {
            Err(SynthesisError::InvalidInput("unused".to_string()))
        }
    }

    async fn state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        (dir, AppState::new(store, Arc::new(NoopSynthesizer)))
    }

    async fn get_uri(state: AppState, uri: &str) -> Response {
        router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_healthz() {
        let (_dir, state) = state().await;
        let response = get_uri(state, "/healthz").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_audio_serves_stored_artifact() {
        let (_dir, state) = state().await;
        let artifact = state.store.allocate();
        std::fs::write(&artifact.path, b"RIFF....WAVE").unwrap();

        let response = get_uri(state, &format!("/audio/{}", artifact.file_name())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "audio/wav"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"RIFF....WAVE");
    }

    #[tokio::test]
    async fn test_audio_unknown_artifact_is_404() {
        let (_dir, state) = state().await;
        let response = get_uri(state, "/audio/does-not-exist.wav").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], 404);
    }

    #[tokio::test]
    async fn test_audio_rejects_traversal() {
        let (_dir, state) = state().await;
        let response = get_uri(state, "/audio/..").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_ws_route_requires_upgrade() {
        let (_dir, state) = state().await;
        let response = get_uri(state.clone(), "/ws/1").await;
        assert!(response.status().is_client_error());
        assert!(state.registry.is_empty());
    }

    #[test]
    fn test_artifact_error_mapping() {
        assert!(matches!(
            HttpError::from(ArtifactError::NotFound("a.wav".to_string())),
            HttpError::NotFound(_)
        ));
        assert!(matches!(
            HttpError::from(ArtifactError::InvalidName("../x".to_string())),
            HttpError::BadRequest(_)
        ));
        assert!(matches!(
            HttpError::from(ArtifactError::Io(std::io::Error::other("disk"))),
            HttpError::Internal(_)
        ));
    }
}
