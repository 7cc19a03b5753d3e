//! The tiny HTTP-like handshake spoken over a freshly opened multiplexer
//! stream, before it turns into raw SSH bytes.
//!
//! The broker writes one request line (plus the blank line that ends an
//! HTTP header block) to tell the agent which session a stream belongs to;
//! the agent answers with a bare `200 OK` and from then on both sides treat
//! the stream as an opaque byte pipe carrying SSH traffic. This is
//! deliberately not a real HTTP implementation -- just enough of the wire
//! format to be recognizable and easy to parse a line at a time.

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

use crate::error::BrokerError;

/// Request line the broker sends to open a bridged session on stream
/// `session_uid`.
pub fn open_request(session_uid: &str) -> String {
    format!("GET /ssh/{session_uid} HTTP/1.1\r\n\r\n")
}

/// Request line the broker sends as a courtesy when it is done with
/// `session_uid`, ahead of closing the stream outright.
pub fn close_request(session_uid: &str) -> String {
    format!("DELETE /ssh/close/{session_uid} HTTP/1.1\r\n\r\n")
}

/// The agent's acknowledgement that it accepted the stream for `GET
/// /ssh/<uid>` and is about to start speaking SSH over it.
pub const OK_RESPONSE: &str = "HTTP/1.1 200 OK\r\n\r\n";

/// A parsed request line, as seen by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `GET /ssh/<uid>` -- bridge this stream into the agent's SSH server.
    Open { session_uid: String },
    /// `DELETE /ssh/close/<uid>` -- the broker is done with this session.
    Close { session_uid: String },
    /// `CONNECT /http/proxy/<addr>` -- splice this stream directly to a TCP
    /// connection to `addr`, bypassing the agent's SSH server entirely.
    Proxy { addr: String },
}

/// Reads one request line (and the header block terminator after it) from
/// `stream` and parses it. Returns the parsed request together with a
/// buffered reader wrapping the same stream -- the request line may not be
/// the only thing already sitting in the read buffer, and whatever
/// immediately follows (the start of the SSH protocol, or proxied TCP
/// bytes) has to stay available to whoever handles the stream next rather
/// than being silently dropped.
///
/// Unrecognized methods or paths are reported as a
/// [`BrokerError::ProtocolError`] rather than causing a panic -- a stream
/// that fails the handshake is simply closed by the caller.
pub async fn read_request<R>(stream: R) -> Result<(Request, BufReader<R>), BrokerError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .await
        .map_err(BrokerError::Io)?;
    let line = line.trim_end_matches(['\r', '\n']);

    // drain the rest of the (empty) header block up to the blank line
    loop {
        let mut header_line = String::new();
        let n = reader
            .read_line(&mut header_line)
            .await
            .map_err(BrokerError::Io)?;
        if n == 0 || header_line == "\r\n" || header_line == "\n" {
            break;
        }
    }

    let request = parse_request_line(line)?;
    Ok((request, reader))
}

fn parse_request_line(line: &str) -> Result<Request, BrokerError> {
    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| BrokerError::ProtocolError("empty request line".into()))?;
    let path = parts
        .next()
        .ok_or_else(|| BrokerError::ProtocolError("missing request path".into()))?;

    match method {
        "GET" => path
            .strip_prefix("/ssh/")
            .map(|uid| Request::Open {
                session_uid: uid.to_string(),
            })
            .ok_or_else(|| BrokerError::ProtocolError(format!("unexpected GET path: {path}"))),
        "DELETE" => path
            .strip_prefix("/ssh/close/")
            .map(|uid| Request::Close {
                session_uid: uid.to_string(),
            })
            .ok_or_else(|| BrokerError::ProtocolError(format!("unexpected DELETE path: {path}"))),
        "CONNECT" => path
            .strip_prefix("/http/proxy/")
            .map(|addr| Request::Proxy {
                addr: addr.to_string(),
            })
            .ok_or_else(|| BrokerError::ProtocolError(format!("unexpected CONNECT path: {path}"))),
        other => Err(BrokerError::ProtocolError(format!(
            "unsupported method: {other}"
        ))),
    }
}

/// Writes the agent's `200 OK` acknowledgement.
pub async fn write_ok<W>(mut stream: W) -> Result<(), BrokerError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    stream
        .write_all(OK_RESPONSE.as_bytes())
        .await
        .map_err(BrokerError::Io)?;
    stream.flush().await.map_err(BrokerError::Io)
}

/// The other half of [`write_ok`]: reads exactly `OK_RESPONSE` back off
/// `stream` and errors if the bytes don't match. Used by whichever side
/// sent `open_request` to confirm the peer accepted it before treating the
/// stream as raw SSH bytes.
pub async fn read_ok<R>(mut stream: R) -> Result<(), BrokerError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = vec![0u8; OK_RESPONSE.len()];
    stream.read_exact(&mut buf).await.map_err(BrokerError::Io)?;
    if buf == OK_RESPONSE.as_bytes() {
        Ok(())
    } else {
        Err(BrokerError::ProtocolError(
            "peer did not acknowledge session open".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_request_matches_wire_format() {
        assert_eq!(
            open_request("abc123"),
            "GET /ssh/abc123 HTTP/1.1\r\n\r\n"
        );
    }

    #[test]
    fn close_request_matches_wire_format() {
        assert_eq!(
            close_request("abc123"),
            "DELETE /ssh/close/abc123 HTTP/1.1\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn reads_open_request() {
        let raw = open_request("sess-1");
        let (req, _rest) = read_request(raw.as_bytes()).await.unwrap();
        assert_eq!(
            req,
            Request::Open {
                session_uid: "sess-1".into()
            }
        );
    }

    #[tokio::test]
    async fn reads_close_request() {
        let raw = close_request("sess-1");
        let (req, _rest) = read_request(raw.as_bytes()).await.unwrap();
        assert_eq!(
            req,
            Request::Close {
                session_uid: "sess-1".into()
            }
        );
    }

    #[tokio::test]
    async fn reads_proxy_connect() {
        let raw = "CONNECT /http/proxy/127.0.0.1:9000 HTTP/1.1\r\n\r\n";
        let (req, _rest) = read_request(raw.as_bytes()).await.unwrap();
        assert_eq!(
            req,
            Request::Proxy {
                addr: "127.0.0.1:9000".into()
            }
        );
    }

    #[tokio::test]
    async fn unsupported_method_is_a_protocol_error() {
        let raw = "PUT /ssh/1 HTTP/1.1\r\n\r\n";
        assert!(read_request(raw.as_bytes()).await.is_err());
    }
}
