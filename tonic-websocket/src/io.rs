//! Byte-stream adapter over a message-framed WebSocket.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::error::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::trace;

/// Presents a WebSocket as a stream-oriented, full-duplex byte connection.
///
/// The HTTP/2 stack on either side of a tunnel consumes this type exactly
/// like a TCP connection: reads pull bytes out of binary WebSocket
/// messages, and every write is sent as a single binary message. Message
/// boundaries carry no meaning above the adapter — a message payload is a
/// contiguous fragment of the HTTP/2 byte stream and need not align with
/// HTTP/2 frames.
///
/// Only binary messages are valid. Receiving a text message is a protocol
/// violation that fails the connection. Ping, pong and close frames are
/// handled below the adapter and never surface to the caller.
///
/// There is no deadline surface on this type; timeout semantics belong to
/// HTTP/2 keepalives and per-RPC deadlines in the layers above.
pub struct WebSocketIo<S> {
    inner: WebSocketStream<S>,
    /// Bytes left over from a message larger than the caller's read
    /// buffer. Drained in FIFO order before the next message is read.
    remainder: Bytes,
    closed: bool,
}

impl<S> WebSocketIo<S> {
    /// Wraps an established WebSocket stream.
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            remainder: Bytes::new(),
            closed: false,
        }
    }

    /// Returns a reference to the underlying WebSocket stream.
    pub fn get_ref(&self) -> &WebSocketStream<S> {
        &self.inner
    }

    /// Returns a mutable reference to the underlying WebSocket stream.
    pub fn get_mut(&mut self) -> &mut WebSocketStream<S> {
        &mut self.inner
    }

    /// Consumes the adapter, returning the underlying WebSocket stream.
    pub fn into_inner(self) -> WebSocketStream<S> {
        self.inner
    }
}

impl<S> std::fmt::Debug for WebSocketIo<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketIo")
            .field("remainder", &self.remainder.len())
            .field("closed", &self.closed)
            .finish()
    }
}

fn read_error(err: WsError) -> io::Error {
    match err {
        WsError::Io(err) => err,
        err => io::Error::other(err),
    }
}

fn write_error(err: WsError) -> io::Error {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::from(io::ErrorKind::BrokenPipe)
        }
        WsError::Io(err) => err,
        err => io::Error::other(err),
    }
}

impl<S> AsyncRead for WebSocketIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.remainder.is_empty() {
            let n = usize::min(this.remainder.len(), buf.remaining());
            buf.put_slice(&this.remainder[..n]);
            this.remainder.advance(n);
            return Poll::Ready(Ok(()));
        }

        if this.closed {
            return Poll::Ready(Ok(()));
        }

        loop {
            return match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(mut data))) => {
                    if data.is_empty() {
                        continue;
                    }
                    let n = usize::min(data.len(), buf.remaining());
                    buf.put_slice(&data[..n]);
                    data.advance(n);
                    this.remainder = data;
                    Poll::Ready(Ok(()))
                }
                Some(Ok(Message::Text(_))) => {
                    // gRPC tunnels are byte streams; a text frame means the
                    // peer is not speaking this protocol.
                    this.closed = true;
                    Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "received text frame on a binary tunnel",
                    )))
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    trace!(?frame, "websocket closed by peer");
                    this.closed = true;
                    Poll::Ready(Ok(()))
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    this.closed = true;
                    Poll::Ready(Ok(()))
                }
                Some(Err(err)) => {
                    this.closed = true;
                    Poll::Ready(Err(read_error(err)))
                }
            };
        }
    }
}

impl<S> AsyncWrite for WebSocketIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.closed {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        }

        if let Err(err) = ready!(Pin::new(&mut this.inner).poll_ready(cx)) {
            this.closed = true;
            return Poll::Ready(Err(write_error(err)));
        }

        // The entire buffer becomes exactly one binary message.
        let message = Message::Binary(Bytes::copy_from_slice(buf));
        if let Err(err) = Pin::new(&mut this.inner).start_send(message) {
            this.closed = true;
            return Poll::Ready(Err(write_error(err)));
        }

        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.closed {
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_flush(cx).map_err(write_error)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.closed {
            return Poll::Ready(Ok(()));
        }

        match ready!(Pin::new(&mut this.inner).poll_close(cx)) {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                this.closed = true;
                Poll::Ready(Ok(()))
            }
            Err(err) => {
                this.closed = true;
                Poll::Ready(Err(write_error(err)))
            }
        }
    }
}

// hyper 1.x IO for the adapter itself, so the gRPC client's transport
// consumes it without another wrapper in between.
impl<S> hyper::rt::Read for WebSocketIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        mut buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        let n = unsafe {
            let mut tbuf = ReadBuf::uninit(buf.as_mut());
            match AsyncRead::poll_read(self, cx, &mut tbuf) {
                Poll::Ready(Ok(())) => tbuf.filled().len(),
                other => return other,
            }
        };

        // SAFETY: `n` bytes of the cursor were initialized by the read
        // above.
        unsafe {
            buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S> hyper::rt::Write for WebSocketIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(self, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(self, cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(self, cx)
    }
}
