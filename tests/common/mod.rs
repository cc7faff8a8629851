//! Shared helpers for integration tests.
//!
//! Each test starts a real gateway on an ephemeral port. The engine is a small
//! `sh` script honouring the JSON-in / file-out contract: it writes `RIFF`
//! followed by the request line to the requested output file, and fails with
//! a message on stderr when the text starts with `FAIL`.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

use tts_gateway::{
    server::{router, AppState},
    store::ArtifactStore,
    synthesis::{EngineConfig, SynthesisJobRunner},
    ServerMessage,
};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const SCRIPTED_ENGINE: &str = r#"read -r line
case "$line" in *'"text":"FAIL'*) echo 'engine exploded' >&2; exit 2;; esac
out=$(printf '%s\n' "$line" | sed -n 's/.*"output_file":"\([^"]*\)".*/\1/p')
printf 'RIFF%s' "$line" > "$out""#;

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

pub fn scripted_engine() -> EngineConfig {
    EngineConfig {
        program: PathBuf::from("sh"),
        engine_args: vec![
            "-c".to_string(),
            SCRIPTED_ENGINE.to_string(),
            "engine".to_string(),
        ],
        timeout: Some(Duration::from_secs(10)),
        ..Default::default()
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    _dir: tempfile::TempDir,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path().join("audio")).await.unwrap();
        let runner = SynthesisJobRunner::new(store.clone(), scripted_engine(), 4);
        let state = AppState::new(store, Arc::new(runner));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let app = router(state.clone());
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
        });

        Self {
            addr,
            state,
            _dir: dir,
            shutdown: Some(tx),
            handle,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.state.store
    }

    pub async fn connect(&self, client_id: &str) -> WsClient {
        let url = format!("ws://{}/ws/{}", self.addr, client_id);
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        ws
    }

    /// Connect and consume the `ready` frame
    pub async fn connect_ready(&self, client_id: &str) -> WsClient {
        let mut ws = self.connect(client_id).await;
        match recv_json(&mut ws).await {
            ServerMessage::Ready { client_id: id, .. } => assert_eq!(id, client_id),
            other => panic!("expected ready, got {other:?}"),
        }
        ws
    }

    /// Wait until the registry no longer holds `client_id`
    pub async fn wait_unregistered(&self, client_id: &str) {
        let registry = self.state.registry.clone();
        let client_id = client_id.to_string();
        tokio::time::timeout(RECV_TIMEOUT, async move {
            while registry.contains(&client_id) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session was never unregistered");
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

pub async fn send_request(ws: &mut WsClient, text: &str) {
    let frame = serde_json::json!({ "text": text }).to_string();
    ws.send(Message::Text(frame)).await.unwrap();
}

pub async fn recv(ws: &mut WsClient) -> Message {
    tokio::time::timeout(RECV_TIMEOUT, ws.next())
        .await
        .expect("timed out waiting for frame")
        .expect("connection ended")
        .unwrap()
}

pub async fn recv_json(ws: &mut WsClient) -> ServerMessage {
    match recv(ws).await {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

/// Receive an `audio` header and the binary frame that follows it
pub async fn recv_audio(ws: &mut WsClient) -> (String, Vec<u8>) {
    let (artifact, len) = match recv_json(ws).await {
        ServerMessage::Audio { artifact, bytes } => (artifact, bytes),
        other => panic!("expected audio header, got {other:?}"),
    };
    match recv(ws).await {
        Message::Binary(bytes) => {
            assert_eq!(bytes.len(), len);
            (artifact, bytes)
        }
        other => panic!("expected binary frame, got {other:?}"),
    }
}
