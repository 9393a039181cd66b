//! The HTTP-chunked reusable framing.
//!
//! The client speaks HTTP/1.1 inside the TLS stream: a request head with
//! `Transfer-Encoding: chunked`, then the request payload as the chunked
//! body. The server answers with a `200 OK` head and a chunked body of its
//! own. Ending the response with the zero-length chunk leaves the TLS stream
//! intact, so the same connection can carry the next request head. To a
//! middlebox the exchange is indistinguishable from ordinary HTTPS traffic.

use bytes::{Buf, BytesMut};
use futures::ready;
use std::io;
use std::pin::Pin;
use std::str;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use super::client_stream::{ClientStream, EndpointPair};

const RESPONSE_HEAD: &[u8] = b"HTTP/1.1 200 OK\r\n\
    Content-Type: application/octet-stream\r\n\
    Cache-Control: no-store\r\n\
    Transfer-Encoding: chunked\r\n\r\n";

/// Longest chunk-size line (hex digits plus extensions) we tolerate.
const MAX_CHUNK_LINE: usize = 128;

/// The interesting parts of a parsed HTTP request head.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub request_line: String,
    pub is_chunked: bool,
}

/// Read an HTTP request head (through the blank line) off `stream`.
///
/// `initial` seeds the buffer with bytes already consumed by the caller, such
/// as the sniffed `'P'` or the tail of a previous exchange. Returns `None`
/// when the peer closes before sending anything, which is how a reused
/// connection normally ends. Bytes read past the head are handed back for
/// the body decoder.
pub async fn read_request_head<S>(
    stream: &mut S,
    initial: &[u8],
    limit: usize,
) -> io::Result<Option<(RequestHead, BytesMut)>>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::from(initial);
    loop {
        if let Some(end) = find_head_end(&buffer) {
            if end + 4 > limit {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "http request head exceeds the size ceiling",
                ));
            }
            let leftover = buffer.split_off(end + 4);
            return Ok(Some((parse_head(&buffer[..end])?, leftover)));
        }
        if buffer.len() > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "http request head exceeds the size ceiling",
            ));
        }

        let mut tmp = [0u8; 1024];
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return if buffer.is_empty() {
                Ok(None)
            } else {
                Err(io::ErrorKind::UnexpectedEof.into())
            };
        }
        buffer.extend_from_slice(&tmp[..n]);
    }
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|window| window == b"\r\n")
}

fn parse_head(head: &[u8]) -> io::Result<RequestHead> {
    let text = str::from_utf8(head)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "http head is not utf-8"))?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty http request line"))?
        .to_string();

    let mut is_chunked = false;
    for line in lines {
        if let Some(colon) = line.find(':') {
            let name = line[..colon].trim();
            let value = line[colon + 1..].trim();
            if name.eq_ignore_ascii_case("transfer-encoding")
                && value.to_ascii_lowercase().contains("chunked")
            {
                is_chunked = true;
            }
        }
    }

    Ok(RequestHead {
        request_line,
        is_chunked,
    })
}

enum ReadState {
    /// Expecting a chunk-size line.
    ChunkSize,
    /// Inside a chunk's data.
    ChunkData { remaining: usize },
    /// Expecting the CRLF that closes a chunk's data.
    ChunkDataEnd,
    /// Past the zero chunk, consuming trailers until the blank line.
    Trailer,
    /// Request body fully consumed.
    Eof,
}

/// The chunked-reusable [`ClientStream`] variant. Reads decode the request's
/// chunked body; writes lazily emit the response head and encode each write
/// as one chunk.
pub struct HttpChunkedStream<S> {
    inner: S,
    endpoints: EndpointPair,
    head_limit: usize,
    read_buffer: BytesMut,
    read_state: ReadState,
    write_buffer: Vec<u8>,
    wrote_head: bool,
    response_complete: bool,
}

impl<S> HttpChunkedStream<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Wrap a transport whose request head has already been consumed;
    /// `leftover` holds any body bytes read along with the head.
    pub fn new(
        inner: S,
        endpoints: EndpointPair,
        leftover: BytesMut,
        head_limit: usize,
    ) -> HttpChunkedStream<S> {
        HttpChunkedStream {
            inner,
            endpoints,
            head_limit,
            read_buffer: leftover,
            read_state: ReadState::ChunkSize,
            write_buffer: Vec::new(),
            wrote_head: false,
            response_complete: false,
        }
    }

    /// Write as much of the pending encoded output as the transport accepts.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buffer.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.write_buffer))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buffer.drain(..n);
        }
        Poll::Ready(Ok(()))
    }

    fn ensure_response_head(&mut self) {
        if !self.wrote_head {
            self.write_buffer.extend_from_slice(RESPONSE_HEAD);
            self.wrote_head = true;
        }
    }
}

impl<S> AsyncRead for HttpChunkedStream<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            match this.read_state {
                ReadState::Eof => return Poll::Ready(Ok(())),
                ReadState::ChunkSize => {
                    if let Some(end) = find_crlf(&this.read_buffer) {
                        let size = parse_chunk_size(&this.read_buffer[..end])?;
                        this.read_buffer.advance(end + 2);
                        this.read_state = if size == 0 {
                            ReadState::Trailer
                        } else {
                            ReadState::ChunkData { remaining: size }
                        };
                        continue;
                    }
                    if this.read_buffer.len() > MAX_CHUNK_LINE {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "chunk size line too long",
                        )));
                    }
                }
                ReadState::ChunkData { remaining } => {
                    if !this.read_buffer.is_empty() {
                        let n = remaining.min(this.read_buffer.len()).min(buf.remaining());
                        buf.put_slice(&this.read_buffer[..n]);
                        this.read_buffer.advance(n);
                        this.read_state = if n == remaining {
                            ReadState::ChunkDataEnd
                        } else {
                            ReadState::ChunkData {
                                remaining: remaining - n,
                            }
                        };
                        return Poll::Ready(Ok(()));
                    }
                }
                ReadState::ChunkDataEnd => {
                    if this.read_buffer.len() >= 2 {
                        if &this.read_buffer[..2] != b"\r\n" {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "missing CRLF after chunk data",
                            )));
                        }
                        this.read_buffer.advance(2);
                        this.read_state = ReadState::ChunkSize;
                        continue;
                    }
                }
                ReadState::Trailer => {
                    if let Some(end) = find_crlf(&this.read_buffer) {
                        this.read_buffer.advance(end + 2);
                        if end == 0 {
                            this.read_state = ReadState::Eof;
                            return Poll::Ready(Ok(()));
                        }
                        continue;
                    }
                    if this.read_buffer.len() > this.head_limit {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "chunked trailer too long",
                        )));
                    }
                }
            }

            // The buffer cannot make progress; pull more from the transport.
            let mut tmp = [0u8; 4096];
            let mut tmp_buf = ReadBuf::new(&mut tmp);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut tmp_buf))?;
            if tmp_buf.filled().is_empty() {
                return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
            }
            this.read_buffer.extend_from_slice(tmp_buf.filled());
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> io::Result<usize> {
    let text = str::from_utf8(line)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk size is not utf-8"))?;
    let digits = text.split(';').next().unwrap_or("").trim();
    usize::from_str_radix(digits, 16)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))
}

impl<S> AsyncWrite for HttpChunkedStream<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        this.ensure_response_head();
        this.write_buffer
            .extend_from_slice(format!("{:x}\r\n", buf.len()).as_bytes());
        this.write_buffer.extend_from_slice(buf);
        this.write_buffer.extend_from_slice(b"\r\n");
        // Kick the write off; completion is poll_flush's job.
        let _ = this.poll_drain(cx)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        ready!(Pin::new(&mut this.inner).poll_flush(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl<S> ClientStream for HttpChunkedStream<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn endpoint_pair(&self) -> EndpointPair {
        self.endpoints
    }

    fn can_reuse(&self) -> bool {
        self.response_complete
    }

    async fn finish_response(&mut self) -> io::Result<()> {
        if self.response_complete {
            return Ok(());
        }
        self.ensure_response_head();
        self.write_buffer.extend_from_slice(b"0\r\n\r\n");
        self.flush().await?;
        self.response_complete = true;
        Ok(())
    }

    async fn write_anonymous_reply(&mut self, reply: &[u8]) -> io::Result<()> {
        if self.wrote_head {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "a response head has already been written",
            ));
        }
        self.inner.write_all(reply).await?;
        self.inner.flush().await
    }

    async fn into_reusable(mut self: Box<Self>) -> io::Result<Option<Box<dyn ClientStream>>> {
        // Whatever is left of the request body has to be consumed before the
        // next head can begin.
        let mut scratch = [0u8; 2048];
        loop {
            let n = self.read(&mut scratch).await?;
            if n == 0 {
                break;
            }
        }

        let HttpChunkedStream {
            mut inner,
            endpoints,
            head_limit,
            read_buffer,
            ..
        } = *self;
        match read_request_head(&mut inner, &read_buffer, head_limit).await? {
            None => Ok(None),
            Some((head, leftover)) => {
                if !head.is_chunked {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "follow-up request is not chunked",
                    ));
                }
                Ok(Some(Box::new(HttpChunkedStream::new(
                    inner, endpoints, leftover, head_limit,
                ))))
            }
        }
    }

    async fn dispose(mut self: Box<Self>, graceful: bool) {
        if graceful {
            if !self.response_complete {
                let _ = self.finish_response().await;
            }
            let _ = self.shutdown().await;
        }
    }
}
