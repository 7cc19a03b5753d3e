//! Ingress endpoint: where agents dial in from behind NAT.
//!
//! A single websocket route, `GET /ssh/connection`. The agent identifies
//! itself with an `X-Device-ID` header (`X-Device-UID` is accepted too, for
//! agents built against the older header name); anything else gets a plain
//! `400 Bad Request` and the TCP connection is dropped. Once the upgrade
//! completes the connection becomes a multiplexer session and is handed to
//! the [`Registry`] under the device's namespaced key.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

use crate::registry::{Registry, TunnelSession};
use crate::tunnel::{MuxRole, WsFramedIo};

const DEVICE_ID_HEADER: &str = "x-device-id";
const DEVICE_ID_HEADER_LEGACY: &str = "x-device-uid";

/// Listens for agent tunnel connections and registers them as they arrive.
#[derive(Debug)]
pub struct IngressServer {
    accept_handle: JoinHandle<()>,
}

impl IngressServer {
    /// Binds `addr` and spawns the accept loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn start(addr: &str, registry: Registry) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| crate::error::BrokerError::BindFailure(format!("{addr}: {e}")))?;
        log::info!("Ingress listening on {addr}");

        let accept_handle = tokio::spawn(Self::accept_loop(listener, registry));
        Ok(Self { accept_handle })
    }

    async fn accept_loop(listener: TcpListener, registry: Registry) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    log::error!("Ingress accept error: {e}");
                    continue;
                }
            };
            let registry = registry.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, registry).await {
                    log::warn!("Agent tunnel from {peer} failed: {e}");
                }
            });
        }
    }

    async fn handle_connection(stream: TcpStream, registry: Registry) -> Result<()> {
        let device_id = Arc::new(std::sync::Mutex::new(None::<String>));
        let captured = device_id.clone();

        let callback = move |req: &Request, response: Response| {
            let header = req
                .headers()
                .get(DEVICE_ID_HEADER)
                .or_else(|| req.headers().get(DEVICE_ID_HEADER_LEGACY))
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            match header {
                Some(id) if !id.is_empty() => {
                    *captured.lock().unwrap() = Some(id);
                    Ok(response)
                }
                _ => {
                    let resp = http::Response::builder()
                        .status(400)
                        .body(Some("missing X-Device-ID header".to_string()))
                        .expect("static response is well-formed");
                    Err(resp)
                }
            }
        };

        let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .context("websocket upgrade failed")?;

        let device_id = device_id
            .lock()
            .unwrap()
            .take()
            .context("device id missing after successful upgrade")?;
        let device_key = crate::sshid::SshId {
            user: String::new(),
            device: device_id.clone(),
        }
        .device_key();

        let io = WsFramedIo::new(ws);
        let mux = crate::tunnel::MuxConnection::new(io, MuxRole::Server);
        let closed = mux.watch_closed();
        registry
            .add(device_key.clone(), TunnelSession::new(device_key.clone(), mux))
            .await;

        // Keep the registry entry alive only as long as the tunnel
        // transport is; once the agent drops off, clear it out so future
        // dials fail fast instead of hanging on a dead session.
        let table = registry.clone();
        tokio::spawn(async move {
            closed.notified().await;
            table.remove(&device_key).await;
        });

        Ok(())
    }
}

impl Drop for IngressServer {
    fn drop(&mut self) {
        self.accept_handle.abort();
    }
}
