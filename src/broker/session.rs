//! Session bridge: the state machine that pairs one external SSH
//! connection with one agent-side SSH client connection and proxies
//! channels between them.
//!
//! ```text
//! Created --dial--> Dialed --evaluate--> Evaluated --auth ok--> Registered
//! ```
//!
//! Any failure along the way, or the external connection closing, ends in
//! `Finished`. `Evaluate` is a stub: the original performed policy checks
//! here (device lookup, namespace authorization) that this minimal broker
//! doesn't reimplement, but the state transition itself is preserved since
//! later steps assert on it.

use std::collections::HashMap;
use std::sync::Arc;

use russh::client::{self, Handle as ClientHandle};
use russh::server::Handle as ServerHandle;
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec, Pty};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};

use crate::error::BrokerError;
use crate::handshake;
use crate::registry::Registry;
use crate::sshid::SshId;

type AgentStream = BufReader<yamux::Stream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Dialed,
    Evaluated,
    Registered,
    Finished,
}

/// Accepts any host key. The tunnel itself is what vouches for the agent;
/// a second layer of host-key pinning inside it would have nothing
/// meaningful to check against.
struct TunnelHandler;

impl client::Handler for TunnelHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Integer identifier pairing one client channel with one agent channel.
/// `has_pty` is informational only, set the first time the client sends
/// `pty-req` on this seat -- nothing downstream reads it today, but it
/// mirrors the original's `Seats.SetPty` bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct Seat {
    pub id: u32,
    pub has_pty: bool,
}

/// Commands the foreground (client-request handlers) sends to the
/// per-seat actor task that owns the agent-side `Channel`. A `Channel`
/// only exposes `&mut self` methods and `wait()` needs exclusive access
/// too, so one task owns it outright; everything else reaches it through
/// this queue instead of fighting over a lock.
enum SeatCmd {
    Data(Vec<u8>, oneshot::Sender<bool>),
    PtyRequest {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
        reply: oneshot::Sender<bool>,
    },
    ShellRequest(oneshot::Sender<bool>),
    ExecRequest(Vec<u8>, oneshot::Sender<bool>),
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Close,
}

struct SeatEntry {
    seat: Seat,
    cmd_tx: mpsc::Sender<SeatCmd>,
}

/// One bridged external-SSH-session <-> agent-SSH-session pairing.
pub struct SessionBridge {
    pub uid: String,
    pub sshid: SshId,
    state: SessionState,
    registry: Registry,
    dialed_stream: Option<AgentStream>,
    agent_handle: Option<ClientHandle<TunnelHandler>>,
    // Keyed by the external client's channel id, which already carries the
    // per-connection uniqueness the original's separate seat counter gave
    // it -- seats are still minted from a monotonic counter (matching the
    // spec's "seat" concept precisely), just stored alongside the channel
    // id rather than as a second lookup key.
    seats: HashMap<ChannelId, SeatEntry>,
    next_seat: u32,
}

impl SessionBridge {
    pub fn new(uid: String, sshid: SshId, registry: Registry) -> Self {
        Self {
            uid,
            sshid,
            state: SessionState::Created,
            registry,
            dialed_stream: None,
            agent_handle: None,
            seats: HashMap::new(),
            next_seat: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Opens a fresh multiplexed stream to the target device and performs
    /// the `GET /ssh/<uid>` handshake on it.
    pub async fn dial(&mut self) -> Result<(), BrokerError> {
        let device_key = self.sshid.device_key();
        let stream = self.registry.open_stream(&device_key).await?;
        let mut reader = BufReader::new(stream);
        let request = handshake::open_request(&self.uid);
        reader
            .write_all(request.as_bytes())
            .await
            .map_err(BrokerError::Io)?;
        reader.flush().await.map_err(BrokerError::Io)?;
        handshake::read_ok(&mut reader).await?;
        self.dialed_stream = Some(reader);
        self.state = SessionState::Dialed;
        Ok(())
    }

    /// No-op beyond the state transition; see module docs.
    pub fn evaluate(&mut self) {
        self.state = SessionState::Evaluated;
    }

    /// Wraps the dialed stream in a full nested SSH client connection to
    /// the agent and authenticates it with the same password the external
    /// client presented.
    pub async fn authenticate_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> Result<(), BrokerError> {
        let stream = self.take_dialed_stream()?;

        let config = Arc::new(client::Config::default());
        let mut handle = client::connect_stream(config, stream, TunnelHandler)
            .await
            .map_err(|e| BrokerError::DialFailure(e.to_string()))?;

        let accepted = handle
            .authenticate_password(user, password)
            .await
            .map_err(|_| BrokerError::AuthRejected)?
            .success();
        if !accepted {
            return Err(BrokerError::AuthRejected);
        }

        self.agent_handle = Some(handle);
        self.state = SessionState::Registered;
        Ok(())
    }

    fn take_dialed_stream(&mut self) -> Result<AgentStream, BrokerError> {
        if self.state != SessionState::Evaluated {
            return Err(BrokerError::ProtocolError(
                "authenticate called before evaluate".into(),
            ));
        }
        self.dialed_stream
            .take()
            .ok_or_else(|| BrokerError::ProtocolError("no dialed stream".into()))
    }

    fn next_seat_id(&mut self) -> u32 {
        let id = self.next_seat;
        self.next_seat += 1;
        id
    }

    /// Opens a peer `session` channel on the agent connection and seats it
    /// against `client_channel`. Fails if a seat is already assigned to
    /// `client_channel`, or if the agent connection isn't up yet.
    pub async fn open_session_channel(
        &mut self,
        client_channel: ChannelId,
        client_handle: ServerHandle,
    ) -> Result<(), BrokerError> {
        if self.seats.contains_key(&client_channel) {
            return Err(BrokerError::ProtocolError("seat already set".into()));
        }
        let handle = self.agent_handle()?;
        let agent_channel = handle
            .channel_open_session()
            .await
            .map_err(|e| BrokerError::DialFailure(e.to_string()))?;
        self.seat_channel(client_channel, agent_channel, client_handle);
        Ok(())
    }

    /// Same as [`Self::open_session_channel`] but for `direct-tcpip`
    /// (local port forwarding) channels: the agent dials `host:port`
    /// itself, using the originator address the client reported purely
    /// for logging.
    pub async fn open_direct_tcpip_channel(
        &mut self,
        client_channel: ChannelId,
        host: &str,
        port: u32,
        originator_addr: &str,
        originator_port: u32,
        client_handle: ServerHandle,
    ) -> Result<(), BrokerError> {
        if self.seats.contains_key(&client_channel) {
            return Err(BrokerError::ProtocolError("seat already set".into()));
        }
        let handle = self.agent_handle()?;
        let agent_channel = handle
            .channel_open_direct_tcpip(host, port, originator_addr, originator_port)
            .await
            .map_err(|e| BrokerError::DialFailure(e.to_string()))?;
        self.seat_channel(client_channel, agent_channel, client_handle);
        Ok(())
    }

    fn agent_handle(&self) -> Result<&ClientHandle<TunnelHandler>, BrokerError> {
        self.agent_handle
            .as_ref()
            .ok_or_else(|| BrokerError::NotConnected(self.sshid.device.clone()))
    }

    /// Mints a seat, hands the agent channel off to a dedicated task, and
    /// records the command queue that reaches it.
    fn seat_channel(
        &mut self,
        client_channel: ChannelId,
        agent_channel: Channel<client::Msg>,
        client_handle: ServerHandle,
    ) {
        let seat = Seat {
            id: self.next_seat_id(),
            has_pty: false,
        };
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        tokio::spawn(run_seat_actor(agent_channel, cmd_rx, client_channel, client_handle));
        self.seats.insert(client_channel, SeatEntry { seat, cmd_tx });
    }

    pub fn seat(&self, client_channel: ChannelId) -> Option<Seat> {
        self.seats.get(&client_channel).map(|e| e.seat)
    }

    fn mark_pty(&mut self, client_channel: ChannelId) {
        if let Some(entry) = self.seats.get_mut(&client_channel) {
            entry.seat.has_pty = true;
        }
    }

    fn cmd_tx(&self, client_channel: ChannelId) -> Result<mpsc::Sender<SeatCmd>, BrokerError> {
        self.seats
            .get(&client_channel)
            .map(|e| e.cmd_tx.clone())
            .ok_or_else(|| BrokerError::ProtocolError("no seat for channel".into()))
    }

    /// Client-data -> agent-data. Forwards one `data` payload received on
    /// the client-side channel onto its paired agent channel.
    pub async fn forward_data(
        &mut self,
        client_channel: ChannelId,
        data: &[u8],
    ) -> Result<(), BrokerError> {
        let tx = self.cmd_tx(client_channel)?;
        let (reply, rx) = oneshot::channel();
        let _ = tx.send(SeatCmd::Data(data.to_vec(), reply)).await;
        rx.await.unwrap_or(false);
        Ok(())
    }

    /// Client-requests -> agent-requests: `pty-req`. Marks the seat's PTY
    /// flag and forwards the request, returning whether the agent granted
    /// it so the caller can reply to the client in turn.
    pub async fn forward_pty_request(
        &mut self,
        client_channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
    ) -> Result<bool, BrokerError> {
        self.mark_pty(client_channel);
        let tx = self.cmd_tx(client_channel)?;
        let (reply, rx) = oneshot::channel();
        let _ = tx
            .send(SeatCmd::PtyRequest {
                term: term.to_string(),
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes: modes.to_vec(),
                reply,
            })
            .await;
        Ok(rx.await.unwrap_or(false))
    }

    /// Client-requests -> agent-requests: `shell`.
    pub async fn forward_shell_request(&mut self, client_channel: ChannelId) -> Result<bool, BrokerError> {
        let tx = self.cmd_tx(client_channel)?;
        let (reply, rx) = oneshot::channel();
        let _ = tx.send(SeatCmd::ShellRequest(reply)).await;
        Ok(rx.await.unwrap_or(false))
    }

    /// Client-requests -> agent-requests: `exec`.
    pub async fn forward_exec_request(
        &mut self,
        client_channel: ChannelId,
        command: &[u8],
    ) -> Result<bool, BrokerError> {
        let tx = self.cmd_tx(client_channel)?;
        let (reply, rx) = oneshot::channel();
        let _ = tx.send(SeatCmd::ExecRequest(command.to_vec(), reply)).await;
        Ok(rx.await.unwrap_or(false))
    }

    /// Client-requests -> agent-requests: `window-change`. No reply is
    /// defined for this request type in the SSH protocol, so there is
    /// nothing to forward back.
    pub async fn forward_window_change(
        &mut self,
        client_channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    ) -> Result<(), BrokerError> {
        let tx = self.cmd_tx(client_channel)?;
        let _ = tx
            .send(SeatCmd::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            })
            .await;
        Ok(())
    }

    /// Client closed its write half. Half-close is *not* preserved -- per
    /// spec this collapses to a full close on the paired agent channel and
    /// tears down the seat, the same as [`Self::drop_channel`].
    pub async fn forward_eof(&mut self, client_channel: ChannelId) -> Result<(), BrokerError> {
        self.drop_channel(client_channel).await;
        Ok(())
    }

    /// Either side closing its channel closes the other and tears down the
    /// seat -- half-close is *not* preserved; the bridge collapses it to a
    /// full close per spec. Removing the seat drops the command sender,
    /// which lets the seat actor's `select!` observe the queue closing and
    /// exit even if the `Close` command race-loses to that drop.
    pub async fn drop_channel(&mut self, client_channel: ChannelId) {
        if let Some(entry) = self.seats.remove(&client_channel) {
            let _ = entry.cmd_tx.send(SeatCmd::Close).await;
        }
    }

    /// Best-effort teardown. By the time `finish` runs, the stream `dial`
    /// opened has been consumed by the nested `russh::client` connection,
    /// so the `DELETE /ssh/close/<uid>` courtesy can't be written on it
    /// directly -- writing raw bytes onto an already-framed SSH connection
    /// would corrupt it. Instead this opens a brand-new stream on the same
    /// tunnel, exactly the way `dial` opens its own, and writes the
    /// courtesy there; the agent's dispatcher (`stream_dispatch`) already
    /// expects a `Close` request on a fresh stream, never on the session's
    /// own. The nested connection itself is torn down with its own
    /// `disconnect`.
    pub async fn finish(&mut self) {
        self.seats.clear();
        self.send_close_courtesy().await;
        if let Some(handle) = self.agent_handle.take() {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "session closed", "en")
                .await;
        }
        self.state = SessionState::Finished;
    }

    /// Opens a fresh stream on the target's tunnel and writes the `DELETE
    /// /ssh/close/<uid>` courtesy on it. Best-effort: the tunnel may
    /// already be gone, in which case there's nothing left to notify.
    async fn send_close_courtesy(&self) {
        let device_key = self.sshid.device_key();
        let Ok(mut stream) = self.registry.open_stream(&device_key).await else {
            return;
        };
        let request = handshake::close_request(&self.uid);
        let _ = stream.write_all(request.as_bytes()).await;
        let _ = stream.flush().await;
    }
}

/// Owns one agent-side `Channel` for the lifetime of a seat. Runs both
/// halves of the bridge that a plain copy loop can't express because they
/// need access to the same `Channel`: client-requests -> agent-requests
/// (served from `cmd_rx`, sent by the `forward_*` methods above) and
/// agent-data/agent-requests -> client-requests (served from
/// `channel.wait()`, replayed onto `client_handle`).
async fn run_seat_actor(
    mut channel: Channel<client::Msg>,
    mut cmd_rx: mpsc::Receiver<SeatCmd>,
    client_channel: ChannelId,
    client_handle: ServerHandle,
) {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SeatCmd::Data(data, reply)) => {
                        let ok = channel.data(&data[..]).await.is_ok();
                        let _ = reply.send(ok);
                    }
                    Some(SeatCmd::PtyRequest { term, col_width, row_height, pix_width, pix_height, modes, reply }) => {
                        let ok = channel
                            .request_pty(true, &term, col_width, row_height, pix_width, pix_height, &modes)
                            .await
                            .is_ok();
                        let _ = reply.send(ok);
                    }
                    Some(SeatCmd::ShellRequest(reply)) => {
                        let ok = channel.request_shell(true).await.is_ok();
                        let _ = reply.send(ok);
                    }
                    Some(SeatCmd::ExecRequest(command, reply)) => {
                        let ok = channel.exec(true, command).await.is_ok();
                        let _ = reply.send(ok);
                    }
                    Some(SeatCmd::WindowChange { col_width, row_height, pix_width, pix_height }) => {
                        let _ = channel.window_change(col_width, row_height, pix_width, pix_height).await;
                    }
                    Some(SeatCmd::Close) => {
                        let _ = channel.close().await;
                        break;
                    }
                    None => break,
                }
            }
            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if client_handle.data(client_channel, CryptoVec::from(&data[..])).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        if client_handle.extended_data(client_channel, ext, CryptoVec::from(&data[..])).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::Eof) => {
                        // Half-close collapses to a full close per spec,
                        // same as an explicit `ChannelMsg::Close` below.
                        let _ = client_handle.close(client_channel).await;
                        break;
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        let _ = client_handle.exit_status_request(client_channel, exit_status).await;
                    }
                    Some(ChannelMsg::Close) | None => {
                        let _ = client_handle.close(client_channel).await;
                        break;
                    }
                    Some(_) => {
                        // Success/Failure/WindowAdjusted and friends: request
                        // replies are consumed synchronously above instead,
                        // and these carry nothing a client channel needs.
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_created_state() {
        let bridge = SessionBridge::new(
            "uid-1".into(),
            SshId::parse("root@dev-1"),
            Registry::new(),
        );
        assert_eq!(bridge.state(), SessionState::Created);
    }

    #[tokio::test]
    async fn dial_against_an_unregistered_device_fails() {
        let mut bridge = SessionBridge::new(
            "uid-1".into(),
            SshId::parse("root@nowhere"),
            Registry::new(),
        );
        let err = bridge.dial().await.unwrap_err();
        assert!(matches!(err, BrokerError::NotConnected(_)));
        assert_eq!(bridge.state(), SessionState::Created);
    }

    #[tokio::test]
    async fn authenticate_before_evaluate_is_rejected() {
        let mut bridge = SessionBridge::new(
            "uid-1".into(),
            SshId::parse("root@dev-1"),
            Registry::new(),
        );
        let err = bridge
            .authenticate_password("root", "x")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::ProtocolError(_)));
    }

    #[test]
    fn seats_increment_monotonically() {
        let mut bridge = SessionBridge::new(
            "uid-1".into(),
            SshId::parse("root@dev-1"),
            Registry::new(),
        );
        assert_eq!(bridge.next_seat_id(), 0);
        assert_eq!(bridge.next_seat_id(), 1);
        assert_eq!(bridge.next_seat_id(), 2);
    }
}
