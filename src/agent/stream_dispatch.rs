//! Dispatches each multiplexed stream the agent accepts, based on the
//! handshake request line it opens with.

use std::sync::Arc;

use russh::server::Config;
use tokio::net::TcpStream;

use crate::handshake::{self, Request};

use super::auth::Authenticator;
use super::ssh_server::AgentSshHandler;

/// Handles one stream end to end: reads the handshake line, then either
/// bridges it into an SSH server, acknowledges a close courtesy, or splices
/// it directly to a TCP connection.
pub async fn dispatch_stream(stream: yamux::Stream, config: Arc<Config>, auth: Authenticator) {
    let (request, reader) = match handshake::read_request(stream).await {
        Ok(pair) => pair,
        Err(e) => {
            log::warn!("bad handshake on bridged stream: {e}");
            return;
        }
    };

    match request {
        Request::Open { session_uid } => {
            let mut reader = reader;
            if let Err(e) = handshake::write_ok(&mut reader).await {
                log::warn!("failed to ack session {session_uid}: {e}");
                return;
            }
            if let Err(e) = AgentSshHandler::run(config, reader, auth).await {
                log::warn!("ssh session {session_uid} ended with error: {e}");
            }
        }
        Request::Close { session_uid } => {
            log::debug!("received close courtesy for session {session_uid}");
        }
        Request::Proxy { addr } => {
            let mut reader = reader;
            if let Err(e) = handshake::write_ok(&mut reader).await {
                log::warn!("failed to ack proxy to {addr}: {e}");
                return;
            }
            match TcpStream::connect(&addr).await {
                Ok(tcp) => {
                    let (mut stream_r, mut stream_w) = tokio::io::split(reader);
                    let (mut tcp_r, mut tcp_w) = tcp.into_split();
                    let to_tcp = tokio::io::copy(&mut stream_r, &mut tcp_w);
                    let to_stream = tokio::io::copy(&mut tcp_r, &mut stream_w);
                    let _ = tokio::try_join!(to_tcp, to_stream);
                }
                Err(e) => log::warn!("proxy dial to {addr} failed: {e}"),
            }
        }
    }
}
