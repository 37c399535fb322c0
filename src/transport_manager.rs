//! # Transport Manager
//!
//! Owns the only strong reference to each process's [`UdsTransport`],
//! keyed by process id. Grounded in the teacher's connection-registry
//! pattern from `ipc::unix_domain_socket` (`Arc<Mutex<HashMap<...>>>`), here
//! holding one transport per child rather than per raw connection id.

use crate::error::{BrokerError, BrokerResult};
use crate::message::Message;
use crate::transport::UdsTransport;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, warn};

/// Callback invoked when a transport's read loop observes an I/O error it
/// cannot attribute to an orderly close.
pub type TransportErrorHandler = Arc<dyn Fn(&str, &BrokerError) + Send + Sync>;

pub struct TransportManager {
    socket_dir: PathBuf,
    transports: RwLock<HashMap<String, Arc<UdsTransport>>>,
    error_handler: RwLock<Option<TransportErrorHandler>>,
}

impl TransportManager {
    pub fn new(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            transports: RwLock::new(HashMap::new()),
            error_handler: RwLock::new(None),
        }
    }

    /// Install the background-error-handler callback. Replaces any
    /// previously installed handler.
    pub async fn set_error_handler(&self, handler: TransportErrorHandler) {
        *self.error_handler.write().await = Some(handler);
    }

    pub fn socket_path_for(&self, process_id: &str) -> PathBuf {
        self.socket_dir.join(format!("{process_id}.sock"))
    }

    /// Register a server-side UDS transport for `process_id` and bind its
    /// listener. Registration is idempotent-checked: re-registering while
    /// the prior entry still exists is rejected; callers must
    /// `unregister_transport` first.
    pub async fn register_uds_transport(
        &self,
        process_id: &str,
    ) -> BrokerResult<Arc<UdsTransport>> {
        let mut transports = self.transports.write().await;
        if transports.contains_key(process_id) {
            return Err(BrokerError::illegal_state(format!(
                "transport already registered for process '{process_id}'"
            )));
        }
        let path = self.socket_path_for(process_id);
        let mut transport = UdsTransport::new(&path);
        transport.set_owns_socket_file(true);
        transport.register_listener().await?;
        let transport = Arc::new(transport);
        transports.insert(process_id.to_string(), transport.clone());
        Ok(transport)
    }

    /// Close and remove the transport registered for `process_id`, if any.
    pub async fn unregister_transport(&self, process_id: &str) -> BrokerResult<()> {
        let transport = self.transports.write().await.remove(process_id);
        if let Some(transport) = transport {
            transport.close().await?;
        }
        Ok(())
    }

    pub async fn get_transport(&self, process_id: &str) -> Option<Arc<UdsTransport>> {
        self.transports.read().await.get(process_id).cloned()
    }

    /// Find the transport registered for `process_id` and send `msg` over
    /// it. Surfaces the transport error to the installed error handler
    /// before propagating it to the caller.
    pub async fn send_to_process(&self, process_id: &str, msg: &Message) -> BrokerResult<()> {
        let transport = self
            .get_transport(process_id)
            .await
            .ok_or_else(|| BrokerError::not_found(format!("no transport for '{process_id}'")))?;
        match transport.send(msg).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.report_error(process_id, &err).await;
                Err(err)
            }
        }
    }

    /// Invoked by a transport's read loop when `receive` fails outside an
    /// orderly shutdown, so the manager can notify the installed handler
    /// without the read loop owning a reference to it directly.
    pub async fn report_error(&self, process_id: &str, err: &BrokerError) {
        if let Some(handler) = self.error_handler.read().await.as_ref() {
            handler(process_id, err);
        } else {
            warn!(process_id, error = %err, "transport error with no installed handler");
        }
    }

    /// Close every registered transport. Used at broker shutdown.
    pub async fn close_all(&self) {
        let mut transports = self.transports.write().await;
        for (process_id, transport) in transports.drain() {
            if let Err(e) = transport.close().await {
                error!(process_id, error = %e, "error closing transport during shutdown");
            }
        }
    }

    pub async fn registered_process_ids(&self) -> Vec<String> {
        self.transports.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registration_is_idempotent_checked() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TransportManager::new(dir.path());
        manager.register_uds_transport("p1").await.unwrap();
        let err = manager.register_uds_transport("p1").await.unwrap_err();
        assert!(matches!(err, BrokerError::IllegalState(_)));
    }

    #[tokio::test]
    async fn unregister_removes_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TransportManager::new(dir.path());
        manager.register_uds_transport("p1").await.unwrap();
        manager.unregister_transport("p1").await.unwrap();
        assert!(manager.get_transport("p1").await.is_none());
        // Re-registration succeeds now that the prior entry is gone.
        manager.register_uds_transport("p1").await.unwrap();
    }

    #[tokio::test]
    async fn send_to_unknown_process_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TransportManager::new(dir.path());
        let msg = Message::new_event("e", "src", &serde_json::json!({})).unwrap();
        let err = manager.send_to_process("ghost", &msg).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
    }
}
