//! Broker SSH front-end (C6): the standard SSH listener external clients
//! connect to on `:2222`.
//!
//! gliderssh (the original's server library) has a distinct
//! `BannerHandler` callback that fires once per connection, after the
//! protocol prologue and before any auth method runs, and is used there as
//! the session-construction site (parse SSHID, dial the agent, evaluate
//! policy). `russh`'s `Handler` has no equivalent standalone hook -- the
//! earliest point it hands us the client's username is inside an auth
//! callback itself. We fold session construction into the *first* auth
//! attempt instead (see [`BrokerHandler::ensure_bridge`]), which is the
//! natural once-per-connection substitute. Recorded as an Open Question
//! resolution in `DESIGN.md`.

use std::sync::Arc;

use anyhow::{Context, Result};
use russh::server::{Auth, Config, Handler, Msg, Session};
use russh::{Channel, ChannelId, Pty};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::broker::banners;
use crate::broker::session::{SessionBridge, SessionState};
use crate::registry::Registry;
use crate::sshid::SshId;

/// Builds the broker-side russh config: an ephemeral RSA-2048 host key,
/// regenerated every process start. Mirrors
/// [`crate::agent::ssh_server::build_config`]; the broker has no more
/// reason to persist a stable host identity across restarts than the
/// agent does, since the tunnel underneath it is already authenticated.
pub fn build_config() -> anyhow::Result<Arc<Config>> {
    let key = generate_host_key()?;
    Ok(Arc::new(Config {
        keys: vec![key],
        ..Default::default()
    }))
}

fn generate_host_key() -> anyhow::Result<russh::keys::PrivateKey> {
    use russh::keys::ssh_key::private::{KeypairData, RsaKeypair};
    let mut rng = rand::thread_rng();
    let rsa = RsaKeypair::random(&mut rng, 2048)?;
    Ok(russh::keys::PrivateKey::new(
        KeypairData::Rsa(rsa),
        "minibroker-ssh",
    )?)
}

/// Listens for external SSH clients on `addr` and bridges each one onto a
/// device tunnel via the [`Registry`].
pub struct BrokerSshServer {
    accept_handle: JoinHandle<()>,
}

impl BrokerSshServer {
    /// Binds `addr` and spawns the accept loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound or the host key
    /// cannot be generated.
    pub async fn start(addr: &str, registry: Registry) -> Result<Self> {
        let config = build_config().context("failed to build SSH server config")?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| crate::error::BrokerError::BindFailure(format!("{addr}: {e}")))?;
        log::info!("SSH listener on {addr}");

        let accept_handle = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::error!("SSH accept error: {e}");
                        continue;
                    }
                };
                let config = config.clone();
                let handler = BrokerHandler::new(registry.clone(), peer);
                tokio::spawn(async move {
                    if let Err(e) = russh::server::run_stream(config, stream, handler).await {
                        log::debug!("SSH connection from {peer} ended: {e}");
                    }
                });
            }
        });

        Ok(Self { accept_handle })
    }
}

impl Drop for BrokerSshServer {
    fn drop(&mut self) {
        self.accept_handle.abort();
    }
}

/// One broker-side SSH connection from an external client.
pub struct BrokerHandler {
    registry: Registry,
    peer: std::net::SocketAddr,
    bridge: Option<SessionBridge>,
    /// Set once session construction (parse/dial/evaluate) has failed, so
    /// every subsequent auth attempt on this connection is rejected
    /// without retrying a doomed dial.
    rejected: bool,
}

impl BrokerHandler {
    fn new(registry: Registry, peer: std::net::SocketAddr) -> Self {
        Self {
            registry,
            peer,
            bridge: None,
            rejected: false,
        }
    }

    /// Parses `user` as an SSHID, dials the target device and evaluates
    /// policy, the first time any auth method is attempted on this
    /// connection. Idempotent -- later auth attempts (same or different
    /// method) reuse the session already under construction.
    async fn ensure_bridge(&mut self, user: &str) -> bool {
        if self.bridge.is_some() {
            return true;
        }
        if self.rejected {
            return false;
        }

        if !SshId::is_well_formed(user) {
            log::warn!("{}: {}: login {user:?}", self.peer, banners::INVALID_SSH_ID);
        }
        let sshid = SshId::parse(user);
        log::info!("{}: new connection, login {user:?}", self.peer);

        let mut bridge = SessionBridge::new(session_uid(), sshid, self.registry.clone());

        if let Err(e) = bridge.dial().await {
            log::warn!("{}: {}: {e}", self.peer, banners::CONNECTION_FAILED);
            self.rejected = true;
            return false;
        }

        bridge.evaluate();
        if bridge.state() != SessionState::Evaluated {
            log::warn!("{}: {}", self.peer, banners::ACCESS_DENIED);
            self.rejected = true;
            return false;
        }

        self.bridge = Some(bridge);
        true
    }

    fn bridge_mut(&mut self) -> Option<&mut SessionBridge> {
        self.bridge.as_mut()
    }

    fn remote_user(&self) -> String {
        let sshid = &self.bridge.as_ref().expect("bridge present").sshid;
        if sshid.user.is_empty() {
            "root".to_string()
        } else {
            sshid.user.clone()
        }
    }
}

/// A per-session identifier, standing in for gliderssh's `ctx.SessionID()`.
/// Doesn't need to be cryptographically unique, only distinct enough that
/// two concurrent sessions never collide on the `/ssh/<uid>` handshake
/// path.
fn session_uid() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn reject() -> Auth {
    Auth::Reject {
        proceed_with_methods: None,
    }
}

impl Handler for BrokerHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if !self.ensure_bridge(user).await {
            return Ok(reject());
        }
        let remote_user = self.remote_user();
        match self
            .bridge_mut()
            .expect("just ensured")
            .authenticate_password(&remote_user, password)
            .await
        {
            Ok(()) => Ok(Auth::Accept),
            Err(_) => Ok(reject()),
        }
    }

    async fn auth_publickey_offered(
        &mut self,
        _user: &str,
        _public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        // Accept the offer so the client proceeds to sign with it; the
        // real decision (and the agent-side auth round trip) happens in
        // `auth_publickey` below.
        Ok(Auth::Accept)
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        if !self.ensure_bridge(user).await {
            return Ok(reject());
        }
        let remote_user = self.remote_user();
        // The agent's authenticator accepts any public key, but the
        // broker only speaks one auth method toward the agent: password.
        // A client authenticating with a key is let through on the agent
        // side with a fixed placeholder password.
        match self
            .bridge_mut()
            .expect("just ensured")
            .authenticate_password(&remote_user, "any")
            .await
        {
            Ok(()) => Ok(Auth::Accept),
            Err(_) => Ok(reject()),
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let channel_id = channel.id();
        let handle = session.handle();
        let Some(bridge) = self.bridge_mut() else {
            return Ok(false);
        };
        match bridge.open_session_channel(channel_id, handle).await {
            Ok(()) => Ok(true),
            Err(e) => {
                log::warn!("failed to open peer session channel: {e}");
                Ok(false)
            }
        }
    }

    /// Local port forwarding is permitted; remote port forwarding is
    /// refused entirely -- see `tcpip_forward` below.
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let channel_id = channel.id();
        let handle = session.handle();
        let Some(bridge) = self.bridge_mut() else {
            return Ok(false);
        };
        match bridge
            .open_direct_tcpip_channel(
                channel_id,
                host_to_connect,
                port_to_connect,
                originator_address,
                originator_port,
                handle,
            )
            .await
        {
            Ok(()) => Ok(true),
            Err(e) => {
                log::warn!("failed to open peer direct-tcpip channel: {e}");
                Ok(false)
            }
        }
    }

    async fn tcpip_forward(
        &mut self,
        _address: &str,
        _port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(false)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(bridge) = self.bridge_mut() {
            let _ = bridge.forward_data(channel, data).await;
        }
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let granted = match self.bridge_mut() {
            Some(bridge) => bridge
                .forward_pty_request(channel, term, col_width, row_height, pix_width, pix_height, modes)
                .await
                .unwrap_or(false),
            None => false,
        };
        if granted {
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        let granted = match self.bridge_mut() {
            Some(bridge) => bridge.forward_shell_request(channel).await.unwrap_or(false),
            None => false,
        };
        if granted {
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let granted = match self.bridge_mut() {
            Some(bridge) => bridge.forward_exec_request(channel, data).await.unwrap_or(false),
            None => false,
        };
        if granted {
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(bridge) = self.bridge_mut() {
            let _ = bridge
                .forward_window_change(channel, col_width, row_height, pix_width, pix_height)
                .await;
        }
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(bridge) = self.bridge_mut() {
            let _ = bridge.forward_eof(channel).await;
        }
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(bridge) = self.bridge_mut() {
            bridge.drop_channel(channel).await;
        }
        Ok(())
    }
}

impl Drop for BrokerHandler {
    fn drop(&mut self) {
        if let Some(mut bridge) = self.bridge.take() {
            tokio::spawn(async move {
                bridge.finish().await;
            });
        }
    }
}
