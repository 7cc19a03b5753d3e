//! Dials the broker and keeps the agent's tunnel alive.
//!
//! Mirrors the original agent's main loop: dial `/ssh/connection` with the
//! device id in a header, bring up the multiplexer on top of the
//! websocket, then just keep accepting streams and handing each one to
//! [`dispatch_stream`] until the tunnel drops -- at which point the caller
//! decides whether and when to redial.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use http::HeaderValue;
use russh::server::Config as SshConfig;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use crate::tunnel::{MuxConnection, MuxRole, WsFramedIo};

use super::auth::Authenticator;
use super::stream_dispatch::dispatch_stream;

/// Everything the agent needs to know to identify itself to the broker and
/// police access to itself.
#[derive(Debug, Clone)]
pub struct AgentClientConfig {
    pub server: String,
    pub device_id: String,
    pub private_key_path: Option<String>,
    pub single_user_password: Option<String>,
}

pub struct AgentClient {
    config: AgentClientConfig,
}

impl AgentClient {
    pub fn new(config: AgentClientConfig) -> Self {
        Self { config }
    }

    /// Dials the broker once and serves bridged sessions until the tunnel
    /// drops.
    pub async fn run_once(&self) -> Result<()> {
        let url = format!(
            "{}/ssh/connection",
            self.config.server.trim_end_matches('/')
        );
        let mut request = url
            .into_client_request()
            .context("failed to build tunnel dial request")?;
        request.headers_mut().insert(
            "X-Device-ID",
            HeaderValue::from_str(&self.config.device_id)
                .context("device id is not a valid header value")?,
        );

        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .context("failed to dial broker tunnel")?;

        log::info!("Tunnel established with {}", self.config.server);

        let io = WsFramedIo::new(ws);
        let mut mux = MuxConnection::new(io, MuxRole::Client);

        let ssh_config: Arc<SshConfig> =
            super::ssh_server::build_config(self.config.private_key_path.as_deref())?;
        let auth = Authenticator::new(self.config.single_user_password.clone());

        while let Some(stream) = mux.accept_stream().await {
            let ssh_config = ssh_config.clone();
            let auth = auth.clone();
            tokio::spawn(dispatch_stream(stream, ssh_config, auth));
        }

        log::warn!("Tunnel to {} closed", self.config.server);
        Ok(())
    }

    /// Runs [`Self::run_once`] in a loop, reconnecting with a fixed delay
    /// whenever the tunnel drops.
    pub async fn run_forever(&self) -> ! {
        loop {
            if let Err(e) = self.run_once().await {
                log::warn!("Tunnel dial failed: {e}");
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }
}
