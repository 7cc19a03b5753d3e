//! Device registry: the broker's map of connected agent tunnels.
//!
//! At most one tunnel session exists per device id. Registering a new
//! tunnel for a device id that's already present closes the old one first
//! -- an agent that reconnects (after a network blip, say) displaces its
//! stale session rather than queuing up alongside it. Lookups take a
//! read-style lock so many external SSH sessions can dial the same device
//! concurrently; only add/remove take the exclusive path.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::BrokerError;
use crate::tunnel::MuxConnection;

/// A connected agent's tunnel, keyed by device id in the [`Registry`].
#[derive(Debug)]
pub struct TunnelSession {
    pub device_id: String,
    pub mux: MuxConnection,
}

impl TunnelSession {
    pub fn new(device_id: String, mux: MuxConnection) -> Self {
        Self { device_id, mux }
    }
}

/// Shared table of connected agent tunnels.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<HashMap<String, Arc<TunnelSession>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `session` under `device_id`, closing and replacing any
    /// tunnel already registered for that id.
    pub async fn add(&self, device_id: String, session: TunnelSession) {
        let session = Arc::new(session);
        let mut table = self.inner.write().await;
        if let Some(old) = table.insert(device_id.clone(), session) {
            log::info!("Replacing existing tunnel for device {device_id}");
            old.mux.close().await;
        } else {
            log::info!("Agent connected: {device_id}");
        }
    }

    /// Removes the tunnel registered for `device_id`, if any. Idempotent --
    /// removing a device id that isn't present is not an error.
    pub async fn remove(&self, device_id: &str) {
        let mut table = self.inner.write().await;
        if table.remove(device_id).is_some() {
            log::info!("Agent disconnected: {device_id}");
        }
    }

    /// Opens a new multiplexed stream into the tunnel registered for
    /// `device_id`.
    pub async fn open_stream(&self, device_id: &str) -> Result<yamux::Stream, BrokerError> {
        let table = self.inner.read().await;
        let session = table
            .get(device_id)
            .ok_or_else(|| BrokerError::NotConnected(device_id.to_string()))?;
        session.mux.open_stream().await
    }

    /// True if a tunnel is currently registered for `device_id`.
    pub async fn is_connected(&self, device_id: &str) -> bool {
        self.inner.read().await.contains_key(device_id)
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::MuxRole;

    fn dummy_mux() -> MuxConnection {
        let (io, _keep_alive) = tokio::io::duplex(1024);
        MuxConnection::new(io, MuxRole::Server)
    }

    #[tokio::test]
    async fn add_then_lookup_succeeds() {
        let reg = Registry::new();
        reg.add("default:dev-1".into(), TunnelSession::new("default:dev-1".into(), dummy_mux()))
            .await;
        assert!(reg.is_connected("default:dev-1").await);
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn remove_missing_device_is_not_an_error() {
        let reg = Registry::new();
        reg.remove("nope").await;
        assert_eq!(reg.len().await, 0);
    }

    #[tokio::test]
    async fn open_stream_on_unknown_device_fails() {
        let reg = Registry::new();
        let err = reg.open_stream("unregistered").await.unwrap_err();
        assert!(matches!(err, BrokerError::NotConnected(_)));
    }

    #[tokio::test]
    async fn re_adding_a_device_id_replaces_the_old_session() {
        let reg = Registry::new();
        reg.add("d".into(), TunnelSession::new("d".into(), dummy_mux()))
            .await;
        reg.add("d".into(), TunnelSession::new("d".into(), dummy_mux()))
            .await;
        assert_eq!(reg.len().await, 1);
    }
}
