//! Client-side tunnel: a custom dialer that hands the gRPC client a
//! WebSocket-backed byte stream in place of TCP.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::Uri;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream};
use tonic::transport::{Channel, Endpoint};
use tower_service::Service;
use tracing::debug;

use crate::io::WebSocketIo;
use crate::uri::infer_websocket_uri;
use crate::Error;

const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Connects a gRPC [`Channel`] through a WebSocket tunnel.
///
/// The target can be a WebSocket URL (`ws://host:port`, `wss://host`), a
/// `host:port`, or a bare `:port` (which assumes `localhost`).
///
/// ```rust,ignore
/// let channel = tonic_websocket::connect("ws://localhost:8080").await?;
/// let mut client = GreeterClient::new(channel);
/// ```
pub async fn connect(target: impl Into<String>) -> Result<Channel, Error> {
    WebSocketEndpoint::new(target).connect().await
}

/// A builder for gRPC channels tunneled over WebSocket, mirroring
/// [`Endpoint`].
#[derive(Debug, Clone)]
pub struct WebSocketEndpoint {
    target: String,
    tls: Option<Arc<rustls::ClientConfig>>,
    connect_timeout: Option<Duration>,
    read_buffer_size: usize,
    write_buffer_size: usize,
}

impl WebSocketEndpoint {
    /// Creates an endpoint from a target address. The WebSocket URL is
    /// inferred when [`connect`](WebSocketEndpoint::connect) is called.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            tls: None,
            connect_timeout: None,
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            write_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Uses the given TLS configuration for the WebSocket connection and
    /// switches target inference to the secure scheme.
    ///
    /// Explicit `wss://` targets get TLS with the bundled roots without
    /// this being set; gRPC-level transport security is intentionally not
    /// involved — TLS terminates at the WebSocket hop.
    pub fn tls_config(mut self, config: rustls::ClientConfig) -> Self {
        self.tls = Some(Arc::new(config));
        self
    }

    /// Applies a timeout to the WebSocket dial.
    pub fn connect_timeout(mut self, dur: Duration) -> Self {
        self.connect_timeout = Some(dur);
        self
    }

    /// Sets the WebSocket read buffer size in bytes. Defaults to 4096.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Sets the WebSocket write buffer size in bytes. Defaults to 4096.
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Establishes the channel.
    ///
    /// Every connection the channel makes (including reconnects) opens a
    /// fresh WebSocket to the inferred URL.
    pub async fn connect(self) -> Result<Channel, Error> {
        let uri = infer_websocket_uri(&self.target, self.tls.is_some())?;
        let authority = uri
            .authority()
            .ok_or_else(|| Error::invalid_uri("websocket target has no authority"))?
            .clone();

        // The gRPC layer sees a plain http endpoint; the dialer below is
        // authoritative for the actual transport, TLS included.
        let mut endpoint =
            Endpoint::from_shared(format!("http://{authority}")).map_err(Error::invalid_uri)?;
        if let Some(dur) = self.connect_timeout {
            endpoint = endpoint.connect_timeout(dur);
        }

        let mut ws_config = WebSocketConfig::default();
        ws_config.read_buffer_size = self.read_buffer_size;
        ws_config.write_buffer_size = self.write_buffer_size;

        let connector = WebSocketConnector {
            uri,
            tls: self.tls,
            ws_config,
        };

        endpoint
            .connect_with_connector(connector)
            .await
            .map_err(Error::transport)
    }
}

/// A connector service dialing WebSockets, for use with
/// [`Endpoint::connect_with_connector`].
///
/// The gRPC client supplies a destination when dialing; it is ignored
/// because the WebSocket URL carried by the connector is authoritative.
#[derive(Clone)]
pub struct WebSocketConnector {
    uri: Uri,
    tls: Option<Arc<rustls::ClientConfig>>,
    ws_config: WebSocketConfig,
}

impl WebSocketConnector {
    /// Creates a connector that dials the given WebSocket URL.
    pub fn new(uri: Uri) -> Self {
        Self {
            uri,
            tls: None,
            ws_config: WebSocketConfig::default(),
        }
    }
}

impl fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketConnector")
            .field("uri", &self.uri)
            .finish()
    }
}

impl Service<Uri> for WebSocketConnector {
    type Response = WebSocketIo<MaybeTlsStream<TcpStream>>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _dst: Uri) -> Self::Future {
        let uri = self.uri.clone();
        let connector = self.tls.clone().map(Connector::Rustls);
        let ws_config = self.ws_config;

        Box::pin(async move {
            debug!(%uri, "dialing websocket tunnel");
            let (socket, _response) =
                connect_async_tls_with_config(uri.to_string(), Some(ws_config), false, connector)
                    .await
                    .map_err(Error::connect)?;

            Ok(WebSocketIo::new(socket))
        })
    }
}
