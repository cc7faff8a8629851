//! Registry of live client sessions
//!
//! Maps a client identifier to the outbound channel of its connection, so
//! frames can be routed to a client by id. All access goes through one mutex;
//! the raw map is never handed out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use axum::extract::ws::Message;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("client {0} already has an active session")]
    Duplicate(String),

    #[error("no active session for client {0}")]
    NotFound(String),
}

/// Connection handle stored for each session
#[derive(Clone, Debug)]
pub struct SessionHandle {
    /// Distinguishes successive connections of the same client
    pub session_id: Uuid,
    /// Frames sent here are written to the socket by the session's writer task
    pub outbound: mpsc::Sender<Message>,
    pub connected_at: SystemTime,
}

impl SessionHandle {
    pub fn new(outbound: mpsc::Sender<Message>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            outbound,
            connected_at: SystemTime::now(),
        }
    }

    /// Queue a frame for the connection; false once the connection is gone
    pub async fn send(&self, msg: Message) -> bool {
        self.outbound.send(msg).await.is_ok()
    }
}

/// Shared registry of sessions keyed by client id
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<HashMap<String, SessionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionHandle>> {
        // A panic while holding the lock cannot leave the map half-updated
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a session, rejecting a client id that is already connected
    ///
    /// The returned [`Registration`] unregisters the session when dropped.
    pub fn register(
        &self,
        client_id: &str,
        handle: SessionHandle,
    ) -> Result<Registration, RegistryError> {
        let session_id = handle.session_id;
        {
            let mut sessions = self.lock();
            if sessions.contains_key(client_id) {
                return Err(RegistryError::Duplicate(client_id.to_string()));
            }
            sessions.insert(client_id.to_string(), handle);
        }
        debug!(client_id = %client_id, session_id = %session_id, "session registered");
        Ok(Registration {
            registry: self.clone(),
            client_id: client_id.to_string(),
            session_id,
            released: false,
        })
    }

    /// Remove whatever session is registered for `client_id`
    ///
    /// Removing an absent id is a no-op.
    pub fn unregister(&self, client_id: &str) {
        if self.lock().remove(client_id).is_some() {
            debug!(client_id = %client_id, "session unregistered");
        }
    }

    /// Remove the entry only if it still belongs to `session_id`
    fn unregister_session(&self, client_id: &str, session_id: Uuid) -> bool {
        let mut sessions = self.lock();
        match sessions.get(client_id) {
            Some(handle) if handle.session_id == session_id => {
                sessions.remove(client_id);
                true
            }
            _ => false,
        }
    }

    /// Connection handle of a client
    pub fn get(&self, client_id: &str) -> Result<SessionHandle, RegistryError> {
        self.lock()
            .get(client_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(client_id.to_string()))
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.lock().contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Currently connected client ids, sorted
    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Ownership of one registry entry
///
/// Dropping it removes the entry, on every exit path of the session.
#[must_use = "dropping the registration unregisters the session immediately"]
pub struct Registration {
    registry: ConnectionRegistry,
    client_id: String,
    session_id: Uuid,
    released: bool,
}

impl Registration {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Unregister now; true if this call removed the entry
    pub fn release(mut self) -> bool {
        self.released = true;
        let removed = self
            .registry
            .unregister_session(&self.client_id, self.session_id);
        if removed {
            debug!(client_id = %self.client_id, session_id = %self.session_id, "session unregistered");
        }
        removed
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if !self.released {
            self.registry
                .unregister_session(&self.client_id, self.session_id);
        }
    }
}
