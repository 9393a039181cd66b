//! The client-stream abstraction: a bidirectional byte stream bound to one
//! remote peer, carrying one or more request/response exchanges.
//!
//! Two framings implement [`ClientStream`]: the thin [`RawClientStream`]
//! wrapper here (one exchange, never reused) and the HTTP-chunked reusable
//! variant in [`super::chunked`]. The host holds trait objects and never
//! cares which one it has.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

/// The remote and local socket addresses of an accepted connection. The local
/// side is the bind endpoint whose certificate authenticated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointPair {
    pub remote: SocketAddr,
    pub local: SocketAddr,
}

impl fmt::Display for EndpointPair {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} -> {}", self.remote, self.local)
    }
}

/// A logical connection to one client.
///
/// Every exchange on a stream ends in exactly one of three ways: ownership
/// moves to a session (channel handoff), the stream is disposed, or — for a
/// reusable stream whose response has been fully written — it is handed back
/// to the host through [`ClientStream::into_reusable`] to serve the next
/// request with a fresh timeout window.
#[async_trait]
pub trait ClientStream: AsyncRead + AsyncWrite + Send + Unpin {
    fn endpoint_pair(&self) -> EndpointPair;

    /// Whether the stream may serve another exchange. Always false for the
    /// raw framing; true for the chunked framing once a complete response has
    /// been written and flushed.
    fn can_reuse(&self) -> bool;

    /// Terminate the current response body and flush it to the peer. On the
    /// raw framing this is a plain flush.
    async fn finish_response(&mut self) -> io::Result<()>;

    /// Send the pre-formatted anonymous error reply. On the chunked framing
    /// the bytes stand in for the response head, so nothing of the regular
    /// response may have been written yet.
    async fn write_anonymous_reply(&mut self, reply: &[u8]) -> io::Result<()>;

    /// Consume the stream and prepare it for the next exchange: drain any
    /// unread request data and wait for the next request to begin. `None`
    /// means the peer closed instead of sending another request, which is a
    /// normal end of the connection.
    async fn into_reusable(self: Box<Self>) -> io::Result<Option<Box<dyn ClientStream>>>;

    /// Close the stream. A graceful dispose completes the in-flight framing
    /// and shuts the transport down; an ungraceful one just drops it.
    async fn dispose(self: Box<Self>, graceful: bool);
}

/// The raw framing variant: a thin wrapper over the TLS stream. One exchange
/// per connection, no reuse.
pub struct RawClientStream<S> {
    inner: S,
    endpoints: EndpointPair,
}

impl<S> RawClientStream<S> {
    pub fn new(inner: S, endpoints: EndpointPair) -> RawClientStream<S> {
        RawClientStream { inner, endpoints }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RawClientStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RawClientStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl<S> ClientStream for RawClientStream<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn endpoint_pair(&self) -> EndpointPair {
        self.endpoints
    }

    fn can_reuse(&self) -> bool {
        false
    }

    async fn finish_response(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }

    async fn write_anonymous_reply(&mut self, reply: &[u8]) -> io::Result<()> {
        self.inner.write_all(reply).await?;
        self.inner.flush().await
    }

    async fn into_reusable(self: Box<Self>) -> io::Result<Option<Box<dyn ClientStream>>> {
        Ok(None)
    }

    async fn dispose(mut self: Box<Self>, graceful: bool) {
        if graceful {
            let _ = self.inner.shutdown().await;
        }
    }
}
