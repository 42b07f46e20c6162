//! Browser-side tunnel: the same byte-stream contract as the native
//! adapter, driven by the page's event-callback `WebSocket`.
//!
//! The host event loop is cooperative and single-threaded, so the
//! callbacks never block: inbound messages are pushed onto a bounded
//! queue with a non-blocking send (messages are dropped when the consumer
//! has already fallen over), and the blocking wait happens only in
//! `poll_read`.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_channel::{mpsc, oneshot};
use futures_util::future::{self, Either};
use futures_util::Stream;
use js_sys::{ArrayBuffer, Uint8Array};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;
use wasm_bindgen::closure::Closure;
use wasm_bindgen::JsCast;
use web_sys::{BinaryType, CloseEvent, ErrorEvent, MessageEvent, WebSocket};

use crate::uri::infer_browser_websocket_uri;
use crate::Error;

/// Queue depth for inbound messages; congestion here means the consumer
/// is already failing, and the event loop must not stall on it.
const INBOUND_QUEUE: usize = 16;

/// Connects a WebSocket and returns the adapted byte stream.
///
/// The target can be a full WebSocket URL, a `host:port`, a bare `/path`
/// (the page host is assumed), or empty (the page host and scheme are
/// used: `wss` iff the page was served over TLS).
///
/// Dropping the returned future while the socket is still connecting
/// closes it, so an abandoned dial leaves nothing established.
pub async fn connect(target: &str) -> Result<BrowserIo, Error> {
    let url = match web_sys::window() {
        Some(window) => {
            let location = window.location();
            let protocol = location.protocol().unwrap_or_default();
            let host = location.host().unwrap_or_default();
            infer_browser_websocket_uri(target, protocol == "https:", &host)
        }
        // No window (e.g. a worker without location): fall back to an
        // explicit target.
        None => infer_browser_websocket_uri(target, false, "localhost:8080"),
    };

    let socket = WebSocket::new(&url)
        .map_err(|err| Error::connect(format!("WebSocket::new failed: {err:?}")))?;
    socket.set_binary_type(BinaryType::Arraybuffer);

    let (open_tx, open_rx) = oneshot::channel::<()>();
    let onopen = Closure::once(move || {
        let _ = open_tx.send(());
    });
    socket.set_onopen(Some(onopen.as_ref().unchecked_ref()));

    let (error_tx, error_rx) = oneshot::channel::<()>();
    let onerror = Closure::once(move |_event: ErrorEvent| {
        let _ = error_tx.send(());
    });
    socket.set_onerror(Some(onerror.as_ref().unchecked_ref()));

    let mut guard = ConnectGuard {
        socket: &socket,
        armed: true,
    };

    let opened = future::select(open_rx, error_rx).await;

    guard.armed = false;
    drop(guard);
    socket.set_onopen(None);
    socket.set_onerror(None);
    drop(onopen);
    drop(onerror);

    match opened {
        Either::Left((Ok(()), _)) => {}
        Either::Left((Err(_), _)) | Either::Right(_) => {
            let _ = socket.close();
            return Err(Error::connect("websocket failed during handshake"));
        }
    }

    Ok(BrowserIo::new(socket))
}

/// Closes a socket that never finished connecting when the dial future is
/// dropped, and unregisters the one-shot handlers so a late event cannot
/// reach a dropped closure.
struct ConnectGuard<'a> {
    socket: &'a WebSocket,
    armed: bool,
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.socket.set_onopen(None);
        self.socket.set_onerror(None);
        if self.socket.ready_state() == WebSocket::CONNECTING {
            let _ = self.socket.close();
        }
    }
}

struct Callbacks {
    _onmessage: Closure<dyn FnMut(MessageEvent)>,
    _onerror: Closure<dyn FnMut(ErrorEvent)>,
    _onclose: Closure<dyn FnMut(CloseEvent)>,
}

/// Presents a browser `WebSocket` as a stream-oriented, full-duplex byte
/// connection, the same contract the native adapter provides.
///
/// A delivery larger than the destination buffer is truncated to fit; the
/// HTTP/2 client above reads with buffers larger than any realistic frame
/// payload, and one adapter serves exactly one HTTP/2 connection.
pub struct BrowserIo {
    socket: WebSocket,
    messages: mpsc::Receiver<Bytes>,
    errors: mpsc::Receiver<io::Error>,
    closed: bool,
    _callbacks: Callbacks,
}

impl BrowserIo {
    /// Wraps an already-open `WebSocket`.
    pub fn new(socket: WebSocket) -> Self {
        socket.set_binary_type(BinaryType::Arraybuffer);

        let (message_tx, messages) = mpsc::channel::<Bytes>(INBOUND_QUEUE);
        let (error_tx, errors) = mpsc::channel::<io::Error>(1);

        let mut tx = message_tx.clone();
        let onmessage = Closure::wrap(Box::new(move |event: MessageEvent| {
            if let Ok(buffer) = event.data().dyn_into::<ArrayBuffer>() {
                let data = Uint8Array::new(&buffer).to_vec();
                // Non-blocking: a full queue drops the message rather
                // than stalling the event loop.
                if tx.try_send(Bytes::from(data)).is_err() {
                    debug!("inbound queue full, dropping websocket message");
                }
            }
        }) as Box<dyn FnMut(MessageEvent)>);
        socket.set_onmessage(Some(onmessage.as_ref().unchecked_ref()));

        let mut err_tx = error_tx.clone();
        let mut msg_tx = message_tx.clone();
        let onerror = Closure::wrap(Box::new(move |_event: ErrorEvent| {
            let _ = err_tx.try_send(io::Error::from(io::ErrorKind::ConnectionReset));
            err_tx.close_channel();
            msg_tx.close_channel();
        }) as Box<dyn FnMut(ErrorEvent)>);
        socket.set_onerror(Some(onerror.as_ref().unchecked_ref()));

        let mut msg_tx = message_tx;
        let mut err_tx = error_tx;
        let onclose = Closure::wrap(Box::new(move |_event: CloseEvent| {
            msg_tx.close_channel();
            err_tx.close_channel();
        }) as Box<dyn FnMut(CloseEvent)>);
        socket.set_onclose(Some(onclose.as_ref().unchecked_ref()));

        Self {
            socket,
            messages,
            errors,
            closed: false,
            _callbacks: Callbacks {
                _onmessage: onmessage,
                _onerror: onerror,
                _onclose: onclose,
            },
        }
    }

    /// Closes the connection. Idempotent; subsequent reads see end of
    /// stream and writes fail fast.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.messages.close();
        self.errors.close();
        // Unregister before closing: the close event must not reach
        // closures that are about to be dropped with the adapter.
        self.socket.set_onmessage(None);
        self.socket.set_onerror(None);
        self.socket.set_onclose(None);
        let _ = self.socket.close();
    }
}

impl std::fmt::Debug for BrowserIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserIo")
            .field("closed", &self.closed)
            .finish()
    }
}

impl AsyncRead for BrowserIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.closed {
            return Poll::Ready(Ok(()));
        }

        match Pin::new(&mut this.messages).poll_next(cx) {
            Poll::Ready(Some(data)) => {
                let n = usize::min(data.len(), buf.remaining());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    debug!(dropped = data.len() - n, "read buffer smaller than delivery");
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => {
                this.closed = true;
                match Pin::new(&mut this.errors).poll_next(cx) {
                    Poll::Ready(Some(err)) => Poll::Ready(Err(err)),
                    _ => Poll::Ready(Ok(())),
                }
            }
            Poll::Pending => match Pin::new(&mut this.errors).poll_next(cx) {
                Poll::Ready(Some(err)) => {
                    this.closed = true;
                    Poll::Ready(Err(err))
                }
                _ => Poll::Pending,
            },
        }
    }
}

impl AsyncWrite for BrowserIo {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.closed {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        }

        // The host buffers internally; the send itself never blocks.
        match this.socket.send_with_u8_array(buf) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(err) => Poll::Ready(Err(io::Error::other(format!(
                "websocket send failed: {err:?}"
            )))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for BrowserIo {
    fn drop(&mut self) {
        self.close();
    }
}
