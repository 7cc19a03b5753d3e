//! Stream multiplexing over the framed tunnel transport.
//!
//! A thin wrapper around the `yamux` crate. One [`MuxConnection`] is created
//! per agent tunnel; the broker side opens a new stream for every bridged
//! SSH session (`OpenStream`), the agent side accepts them as they arrive
//! (`AcceptStream`). `yamux::Connection` only makes progress while it is
//! being polled, so `MuxConnection` spawns a background task that drives it
//! continuously and forwards inbound streams over an mpsc channel; outbound
//! opens go through a cloned `yamux::Control` handle, so callers never touch
//! the `Connection` directly.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use yamux::{Config, Connection, ConnectionError, Mode};

use crate::error::BrokerError;

/// Which side of the yamux handshake this endpoint plays. The broker, which
/// is the side that opens streams, runs as [`MuxRole::Client`]; the agent,
/// which accepts them, runs as [`MuxRole::Server`]. This only affects stream
/// id parity, not which side is allowed to open or accept streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxRole {
    Client,
    Server,
}

impl From<MuxRole> for Mode {
    fn from(role: MuxRole) -> Self {
        match role {
            MuxRole::Client => Mode::Client,
            MuxRole::Server => Mode::Server,
        }
    }
}

/// A running multiplexer session over one tunnel transport.
#[derive(Debug)]
pub struct MuxConnection {
    control: yamux::Control,
    inbound: mpsc::Receiver<yamux::Stream>,
    driver: JoinHandle<()>,
    closed: Arc<Notify>,
}

impl MuxConnection {
    /// Takes ownership of `io` and spawns the background task that drives
    /// the multiplexer's frame processing for its whole lifetime.
    pub fn new<S>(io: S, role: MuxRole) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut conn = Connection::new(io, Config::default(), role.into());
        let control = conn.control();
        let (tx, rx) = mpsc::channel(32);
        let closed = Arc::new(Notify::new());
        let closed_signal = closed.clone();

        let driver = tokio::spawn(async move {
            use futures_util::StreamExt;
            while let Some(next) = conn.next().await {
                match next {
                    Ok(stream) => {
                        if tx.send(stream).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            closed_signal.notify_waiters();
        });

        Self {
            control,
            inbound: rx,
            driver,
            closed,
        }
    }

    /// Returns a handle that resolves once the tunnel's transport has gone
    /// away, without consuming the connection. Used by callers that need to
    /// react to disconnection (e.g. removing a registry entry) while still
    /// holding onto the connection elsewhere.
    pub fn watch_closed(&self) -> Arc<Notify> {
        self.closed.clone()
    }

    /// Opens a new outbound stream. Used by the broker to bridge a new
    /// external SSH session into the agent's tunnel.
    pub async fn open_stream(&self) -> Result<yamux::Stream, BrokerError> {
        self.control
            .clone()
            .open_stream()
            .await
            .map_err(mux_err_to_broker_err)
    }

    /// Waits for the next inbound stream. Used by the agent to pick up a
    /// session the broker just bridged in. Returns `None` once the tunnel
    /// has closed and no further streams will arrive.
    pub async fn accept_stream(&mut self) -> Option<yamux::Stream> {
        self.inbound.recv().await
    }

    /// Closes the multiplexer and the underlying transport.
    pub async fn close(&self) {
        let _ = self.control.clone().close().await;
    }

    /// Resolves once the background driver task has exited, which happens
    /// when the underlying transport is closed or errors out.
    pub async fn closed(self) {
        let _ = self.driver.await;
    }
}

fn mux_err_to_broker_err(e: ConnectionError) -> BrokerError {
    BrokerError::ProtocolError(format!("multiplexer error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_stream_round_trips_bytes() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (client_io, server_io) = tokio::io::duplex(8192);
        let client = MuxConnection::new(client_io, MuxRole::Client);
        let mut server = MuxConnection::new(server_io, MuxRole::Server);

        let mut opened = client.open_stream().await.unwrap();
        opened.write_all(b"ping").await.unwrap();
        opened.flush().await.unwrap();

        let mut accepted = server.accept_stream().await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
