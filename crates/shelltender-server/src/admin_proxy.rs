//! Admin proxy
//!
//! Read/write attach to any live session for operators. On attach the
//! client receives the current full buffer and then joins the normal
//! broadcast path; admin input is tagged `source = admin` so pipeline
//! filters and the lock check can treat it differently.

use crate::registry::ClientRegistry;
use shelltender_core::{BufferManager, Result, SessionManager, ShelltenderError};
use shelltender_types::DataSource;
use std::sync::Arc;
use tracing::info;

pub struct AdminProxy {
    manager: SessionManager,
    buffers: Arc<BufferManager>,
    registry: Arc<ClientRegistry>,
}

impl AdminProxy {
    pub fn new(
        manager: SessionManager,
        buffers: Arc<BufferManager>,
        registry: Arc<ClientRegistry>,
    ) -> Self {
        Self {
            manager,
            buffers,
            registry,
        }
    }

    /// Attach an operator to a session. Returns the current full buffer;
    /// live frames follow through the session's broadcast path.
    pub async fn attach(&self, client_id: &str, session_id: &str) -> Result<String> {
        if !self.manager.exists(session_id).await {
            return Err(ShelltenderError::SessionNotFound(session_id.to_string()));
        }
        self.registry.subscribe(client_id, session_id);
        info!("admin {} attached to session {}", client_id, session_id);
        let snapshot = self.buffers.get_full(session_id);
        Ok(String::from_utf8_lossy(&snapshot.data).into_owned())
    }

    pub fn detach(&self, client_id: &str, session_id: &str) {
        self.registry.unsubscribe(client_id, session_id);
        info!("admin {} detached from session {}", client_id, session_id);
    }

    /// Operator input bypasses the session lock.
    pub async fn input(&self, session_id: &str, data: &[u8]) -> Result<bool> {
        self.manager
            .write_input(session_id, data, DataSource::Admin)
            .await
    }
}
