//! Agent's SSH server: runs over a single multiplexed stream already
//! handed off by the handshake in [`super::stream_dispatch`]. Supports
//! password/public-key auth per [`super::auth::Authenticator`], an
//! interactive shell over a PTY, and direct-tcpip (local port forwarding)
//! channels.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use russh::keys::PublicKey;
use russh::server::{Auth, Config, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::auth::Authenticator;
use super::pty::PtySession;

/// Builds the server-side russh config. `key_path`, when given (the
/// `MINIMAL_PRIVATE_KEY` / `--key` setting), loads an OpenSSH-format
/// private key from disk to use as the agent's stable host identity;
/// with none, an ephemeral RSA-2048 keypair is generated fresh for this
/// process, which is fine since the broker already vetted the tunnel
/// before bridging a client onto it and isn't pinning this host key
/// against anything.
pub fn build_config(key_path: Option<&str>) -> anyhow::Result<Arc<Config>> {
    let key = match key_path {
        Some(path) => russh::keys::load_secret_key(path, None)
            .with_context(|| format!("failed to load agent private key from {path}"))?,
        None => generate_host_key()?,
    };
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
        "minibroker-agent",
    )?)
}

#[derive(Default)]
struct ChannelState {
    pty: Option<PtySession>,
    term: Option<String>,
    /// `env` channel requests the client sent before `shell`/`exec`,
    /// accumulated in the order received. Per spec.md §4.5 these *are* the
    /// shell's environment -- the agent process's own environment is not
    /// inherited.
    env: Vec<(String, String)>,
}

/// One agent-side SSH connection. A fresh instance is created for every
/// stream handed to [`AgentSshHandler::run`].
pub struct AgentSshHandler {
    auth: Authenticator,
    channels: HashMap<ChannelId, ChannelState>,
}

impl AgentSshHandler {
    fn new(auth: Authenticator) -> Self {
        Self {
            auth,
            channels: HashMap::new(),
        }
    }

    /// Runs the SSH protocol to completion over `stream`, which is already
    /// known-good raw SSH bytes (the handshake line that got it here has
    /// been consumed).
    pub async fn run<S>(config: Arc<Config>, stream: S, auth: Authenticator) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handler = Self::new(auth);
        russh::server::run_stream(config, stream, handler).await?;
        Ok(())
    }

    fn pump_output(channel: ChannelId, handle: Handle, mut output_rx: tokio::sync::mpsc::Receiver<Vec<u8>>) {
        tokio::spawn(async move {
            while let Some(chunk) = output_rx.recv().await {
                if handle.data(channel, CryptoVec::from(chunk)).await.is_err() {
                    break;
                }
            }
            let _ = handle.close(channel).await;
        });
    }
}

impl Handler for AgentSshHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, _user: &str, password: &str) -> Result<Auth, Self::Error> {
        Ok(if self.auth.check_password(password) {
            Auth::Accept
        } else {
            Auth::Reject {
                proceed_with_methods: None,
            }
        })
    }

    async fn auth_publickey_offered(
        &mut self,
        _user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        // accept the offer unconditionally so the client proceeds to sign
        // with it; the actual decision happens in `auth_publickey` below.
        Ok(Auth::Accept)
    }

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(if self.auth.check_public_key() {
            Auth::Accept
        } else {
            Auth::Reject {
                proceed_with_methods: None,
            }
        })
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), ChannelState::default());
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.term = Some(term.to_string());
        }
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let term = self
            .channels
            .get(&channel)
            .and_then(|s| s.term.clone())
            .unwrap_or_else(|| "xterm".to_string());
        let env = self
            .channels
            .get(&channel)
            .map(|s| s.env.clone())
            .unwrap_or_default();
        let (pty, output_rx) = PtySession::spawn(&term, 24, 80, &env)?;
        if let Some(state) = self.channels.get_mut(&channel) {
            state.pty = Some(pty);
        }
        Self::pump_output(channel, session.handle(), output_rx);
        session.channel_success(channel)?;
        Ok(())
    }

    /// Accumulates `env` channel requests the client sends before
    /// `shell`/`exec`. Per spec.md §4.5 these entirely determine the
    /// shell's environment (plus `TERM` and `SSH_AUTH_SOCK`) -- the agent
    /// process's own environment is never inherited.
    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state
                .env
                .push((variable_name.to_string(), variable_value.to_string()));
        }
        session.channel_success(channel)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // `exec` sessions aren't modeled separately from `shell` -- the
        // agent has no way to scope a single command off from a full login
        // shell without reimplementing a shell itself, so it just starts
        // one.
        self.shell_request(channel, session).await
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(pty) = self.channels.get(&channel).and_then(|s| s.pty.as_ref()) {
            let _ = pty.resize(row_height as u16, col_width as u16);
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(pty) = self.channels.get_mut(&channel).and_then(|s| s.pty.as_mut()) {
            pty.write_input(data)?;
        }
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let target = format!("{host_to_connect}:{port_to_connect}");
        let stream = channel.into_stream();

        tokio::spawn(async move {
            match TcpStream::connect(&target).await {
                Ok(tcp) => {
                    let (mut tcp_r, mut tcp_w) = tcp.into_split();
                    let (mut ssh_r, mut ssh_w) = tokio::io::split(stream);
                    let to_tcp = tokio::io::copy(&mut ssh_r, &mut tcp_w);
                    let to_ssh = tokio::io::copy(&mut tcp_r, &mut ssh_w);
                    let _ = tokio::try_join!(to_tcp, to_ssh);
                }
                Err(e) => log::warn!("direct-tcpip dial to {target} failed: {e}"),
            }
        });

        Ok(true)
    }
}
