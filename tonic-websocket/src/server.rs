//! Server-side tunnel: WebSocket upgrade plus an in-process HTTP/2 server
//! bound to the gRPC dispatcher.

use std::convert::Infallible;
use std::fmt;
use std::future::{self, Future, Ready};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_tungstenite::WebSocketStream;
use tonic::body::{empty_body, BoxBody};
use tonic::service::Routes;
use tower_service::Service;
use tracing::{debug, trace};

use crate::io::WebSocketIo;
use crate::Error;

const DEFAULT_BUFFER_SIZE: usize = 4096;

type OriginCheck = Arc<dyn Fn(&Request<()>) -> bool + Send + Sync + 'static>;
type SessionHook = Arc<dyn Fn(&Request<()>) + Send + Sync + 'static>;

/// An HTTP handler that tunnels gRPC over WebSocket.
///
/// Each accepted request is upgraded to a WebSocket, the socket is adapted
/// into a byte stream via [`WebSocketIo`], and an in-process HTTP/2 server
/// (cleartext profile — the socket is not an HTTP/2-over-TLS channel from
/// its perspective) serves the registered gRPC routes over it. The gRPC
/// layer above is oblivious to the substitution.
///
/// The tunnel is an ordinary [`tower_service::Service`], so it can be
/// mounted at any path of an existing hyper or axum server. For dedicated
/// tunnel servers, [`serve`](WebSocketTunnel::serve) and
/// [`listen_and_serve`](WebSocketTunnel::listen_and_serve) own the accept
/// loop.
///
/// # Example
///
/// ```rust,ignore
/// use tonic::service::Routes;
/// use tonic_websocket::WebSocketTunnel;
///
/// let routes = Routes::new(GreeterServer::new(MyGreeter::default()));
///
/// WebSocketTunnel::new(routes)
///     .origin_check(|req| {
///         req.headers()
///             .get("origin")
///             .is_some_and(|origin| origin == "https://app.example.com")
///     })
///     .listen_and_serve("127.0.0.1:8080")
///     .await?;
/// ```
#[derive(Clone)]
pub struct WebSocketTunnel {
    router: axum::Router,
    origin_check: Option<OriginCheck>,
    on_connect: Option<SessionHook>,
    on_disconnect: Option<SessionHook>,
    ws_config: WebSocketConfig,
    sessions: Arc<Mutex<JoinSet<()>>>,
}

impl WebSocketTunnel {
    /// Creates a tunnel serving the given gRPC routes.
    pub fn new(routes: Routes) -> Self {
        let mut ws_config = WebSocketConfig::default();
        ws_config.read_buffer_size = DEFAULT_BUFFER_SIZE;
        ws_config.write_buffer_size = DEFAULT_BUFFER_SIZE;

        Self {
            router: routes.prepare().into_axum_router(),
            origin_check: None,
            on_connect: None,
            on_disconnect: None,
            ws_config,
            sessions: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    /// Sets a predicate consulted before every upgrade.
    ///
    /// The predicate receives the request head; returning `false` refuses
    /// the upgrade with `403 Forbidden` and no session is created. When no
    /// predicate is set, all origins are admitted — acceptable for
    /// development, production deployments should inject one.
    pub fn origin_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&Request<()>) -> bool + Send + Sync + 'static,
    {
        self.origin_check = Some(Arc::new(check));
        self
    }

    /// Sets the WebSocket read buffer size in bytes. Defaults to 4096.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.ws_config.read_buffer_size = size;
        self
    }

    /// Sets the WebSocket write buffer size in bytes. Defaults to 4096.
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.ws_config.write_buffer_size = size;
        self
    }

    /// Sets a callback invoked once per session, after a successful
    /// upgrade and before any bytes are read from the socket.
    ///
    /// Hooks are advisory and run on the session task; they should not
    /// block for longer than the application tolerates.
    pub fn on_connect<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Request<()>) + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(hook));
        self
    }

    /// Sets a callback invoked once per session when it ends, whatever the
    /// cause. It fires only for sessions whose connect hook fired.
    pub fn on_disconnect<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Request<()>) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(hook));
        self
    }

    /// Accepts connections on the listener and serves gRPC over WebSocket
    /// until the accept loop fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Error> {
        self.serve_with_shutdown(listener, future::pending()).await
    }

    /// Like [`serve`](WebSocketTunnel::serve), but stops accepting and
    /// tears down active sessions when `signal` resolves.
    pub async fn serve_with_shutdown<F>(&self, listener: TcpListener, signal: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let mut conns = JoinSet::new();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            debug!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    trace!(%peer, "accepted tunnel connection");

                    let service = TowerToHyperService::new(self.clone());
                    conns.spawn(async move {
                        let conn = hyper::server::conn::http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .with_upgrades();
                        if let Err(err) = conn.await {
                            trace!(error = %err, "http connection error");
                        }
                    });
                }
            }
        }

        conns.shutdown().await;
        self.sessions.lock().unwrap().abort_all();
        Ok(())
    }

    /// Binds `addr` and serves gRPC over WebSocket on it. The simplest
    /// one-liner for a dedicated tunnel server.
    pub async fn listen_and_serve(&self, addr: impl ToSocketAddrs) -> Result<(), Error> {
        let listener = TcpListener::bind(addr).await.map_err(Error::transport)?;
        self.serve(listener).await
    }

    fn upgrade<B>(&self, req: Request<B>) -> Response<BoxBody> {
        let (mut parts, _body) = req.into_parts();
        let on_upgrade = parts.extensions.remove::<OnUpgrade>();
        let head = Request::from_parts(parts, ());

        if let Some(check) = &self.origin_check {
            if !check(&head) {
                debug!(origin = ?head.headers().get(header::ORIGIN), "upgrade rejected by origin check");
                return response(StatusCode::FORBIDDEN);
            }
        }

        if head.method() != Method::GET {
            debug!(method = %head.method(), "upgrade requires GET");
            return response(StatusCode::METHOD_NOT_ALLOWED);
        }

        if !header_has_token(head.headers(), header::CONNECTION, "upgrade")
            || !header_has_token(head.headers(), header::UPGRADE, "websocket")
        {
            debug!("missing websocket upgrade headers");
            return response(StatusCode::BAD_REQUEST);
        }

        if head
            .headers()
            .get(header::SEC_WEBSOCKET_VERSION)
            .map(HeaderValue::as_bytes)
            != Some(b"13".as_slice())
        {
            debug!("unsupported websocket version");
            return response(StatusCode::BAD_REQUEST);
        }

        let accept = match head.headers().get(header::SEC_WEBSOCKET_KEY) {
            Some(key) => derive_accept_key(key.as_bytes()),
            None => {
                debug!("missing websocket key");
                return response(StatusCode::BAD_REQUEST);
            }
        };

        let Some(on_upgrade) = on_upgrade else {
            debug!("connection does not support upgrades");
            return response(StatusCode::BAD_REQUEST);
        };

        self.spawn_session(on_upgrade, head);

        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::CONNECTION, HeaderValue::from_static("upgrade"))
            .header(header::UPGRADE, HeaderValue::from_static("websocket"))
            .header(header::SEC_WEBSOCKET_ACCEPT, accept)
            .body(empty_body())
            .unwrap()
    }

    fn spawn_session(&self, on_upgrade: OnUpgrade, head: Request<()>) {
        let router = self.router.clone();
        let on_connect = self.on_connect.clone();
        let on_disconnect = self.on_disconnect.clone();
        let config = self.ws_config;

        let mut sessions = self.sessions.lock().unwrap();
        while sessions.try_join_next().is_some() {}
        sessions.spawn(async move {
            let upgraded = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(err) => {
                    debug!(error = %err, "websocket upgrade failed");
                    return;
                }
            };

            let socket = WebSocketStream::from_raw_socket(
                TokioIo::new(upgraded),
                Role::Server,
                Some(config),
            )
            .await;

            if let Some(hook) = &on_connect {
                hook(&head);
            }
            let _guard = DisconnectGuard {
                hook: on_disconnect,
                head,
            };

            let io = TokioIo::new(WebSocketIo::new(socket));
            let conn = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                .serve_connection(io, TowerToHyperService::new(router));
            if let Err(err) = conn.await {
                trace!(error = %err, "tunnel session ended with error");
            }
        });
    }
}

impl fmt::Debug for WebSocketTunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketTunnel")
            .field("ws_config", &self.ws_config)
            .finish()
    }
}

impl<B> Service<Request<B>> for WebSocketTunnel {
    type Response = Response<BoxBody>;
    type Error = Infallible;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        future::ready(Ok(self.upgrade(req)))
    }
}

/// Fires the disconnect hook exactly once when the session ends, whether
/// the serve loop returned or the session task was torn down.
struct DisconnectGuard {
    hook: Option<SessionHook>,
    head: Request<()>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if let Some(hook) = self.hook.take() {
            hook(&self.head);
        }
    }
}

fn response(status: StatusCode) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .body(empty_body())
        .unwrap()
}

fn header_has_token(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}
