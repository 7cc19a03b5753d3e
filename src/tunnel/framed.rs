//! Adapts a message-framed websocket into a byte stream.
//!
//! The agent and broker exchange multiplexer frames over a websocket
//! connection. A websocket only ever hands back whole messages, but the
//! multiplexer above it (see [`super::mux`]) wants a plain
//! `AsyncRead + AsyncWrite` byte stream. `WsFramedIo` bridges the two: each
//! `poll_write` call is sent as exactly one binary message, and `poll_read`
//! drains a residual buffer left over from the last message before blocking
//! on the next one.
//!
//! Only binary frames carry multiplexer data; anything else (text, an
//! unexpected control frame) is a protocol violation and surfaces as an
//! `InvalidData` io error. A close frame, or the underlying connection
//! going away, reads as a clean EOF.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Byte-stream view over a websocket carrying binary-framed multiplexer
/// traffic.
///
/// A single `WsFramedIo` must not be read from two tasks concurrently, nor
/// written from two tasks concurrently -- exactly one in-flight read and one
/// in-flight write is supported, mirroring the `&mut self` signatures below.
/// Reading and writing concurrently from two different tasks (e.g. a
/// half-duplex copy loop) is fine.
#[derive(Debug)]
pub struct WsFramedIo<S> {
    inner: WebSocketStream<S>,
    residual: Vec<u8>,
    residual_pos: usize,
}

impl<S> WsFramedIo<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            residual: Vec::new(),
            residual_pos: 0,
        }
    }
}

impl<S> AsyncRead for WsFramedIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if self.residual_pos < self.residual.len() {
                let remaining = &self.residual[self.residual_pos..];
                let n = remaining.len().min(buf.remaining());
                buf.put_slice(&remaining[..n]);
                self.residual_pos += n;
                if self.residual_pos >= self.residual.len() {
                    self.residual.clear();
                    self.residual_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    self.residual = data;
                    self.residual_pos = 0;
                    // loop back around to drain it into `buf`
                }
                Poll::Ready(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {
                    // tokio-tungstenite answers pings itself; just keep polling.
                }
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Ok(Message::Text(_) | Message::Frame(_)))) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "expected a binary multiplexer frame",
                    )));
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e)));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WsFramedIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e))),
            Poll::Pending => return Poll::Pending,
        }
        match Pin::new(&mut self.inner).start_send(Message::Binary(buf.to_vec())) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e))),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner)
            .poll_close(cx)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    async fn paired_ws() -> (
        WebSocketStream<DuplexStream>,
        WebSocketStream<DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(4096);
        let client = tokio_tungstenite::client_async("ws://localhost/", a)
            .await
            .unwrap()
            .0;
        let server = tokio_tungstenite::accept_async(b).await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn round_trips_a_single_message() {
        let (client, server) = paired_ws().await;
        let mut writer = WsFramedIo::new(client);
        let mut reader = WsFramedIo::new(server);

        writer.write_all(b"hello").await.unwrap();
        writer.flush().await.unwrap();

        let mut buf = [0u8; 5];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn partial_reads_drain_the_residual_before_blocking() {
        let (client, server) = paired_ws().await;
        let mut writer = WsFramedIo::new(client);
        let mut reader = WsFramedIo::new(server);

        writer.write_all(b"abcdef").await.unwrap();
        writer.flush().await.unwrap();

        let mut first = [0u8; 2];
        reader.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"ab");

        let mut rest = [0u8; 4];
        reader.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"cdef");
    }

    #[tokio::test]
    async fn non_binary_frame_is_a_protocol_error() {
        let (client, server) = paired_ws().await;
        let mut client = client;
        client.send(Message::Text("nope".into())).await.unwrap();
        let mut reader = WsFramedIo::new(server);

        let mut buf = [0u8; 4];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
