//! WebSocket tunnel transport for [`tonic`] services and clients.
//!
//! `tonic_websocket` lets full, native gRPC — HTTP/2 framing, all four
//! call styles, metadata, trailers, cancellation, flow control — pass
//! between endpoints that cannot negotiate direct HTTP/2: chiefly browser
//! clients compiled to WebAssembly, but also any peer behind
//! infrastructure that only allows HTTP(S)/WebSocket.
//!
//! It works by wrapping an established WebSocket as the byte-stream
//! connection the standard HTTP/2 implementations already consume. Each
//! binary WebSocket message carries a contiguous fragment of the HTTP/2
//! connection byte stream; nothing above the adapter knows the tunnel
//! exists.
//!
//! # Server
//!
//! [`WebSocketTunnel`] upgrades incoming requests and serves the
//! registered gRPC routes over each socket:
//!
//! ```rust,ignore
//! use tonic::service::Routes;
//! use tonic_websocket::WebSocketTunnel;
//!
//! let routes = Routes::new(GreeterServer::new(MyGreeter::default()));
//! WebSocketTunnel::new(routes)
//!     .listen_and_serve("127.0.0.1:8080")
//!     .await?;
//! ```
//!
//! Because the tunnel is a plain tower service it can equally be mounted
//! at a path of an existing hyper or axum server.
//!
//! # Client
//!
//! [`connect`] returns an ordinary [`tonic::transport::Channel`] whose
//! connections ride a WebSocket instead of TCP:
//!
//! ```rust,ignore
//! let channel = tonic_websocket::connect("ws://localhost:8080").await?;
//! let mut client = GreeterClient::new(channel);
//! ```
//!
//! On `wasm32` the [`browser`] module dials through the page's
//! `WebSocket` and returns the adapted byte stream for an HTTP/2 client
//! to drive; the URL is inferred from `window.location` when the target
//! is empty or a bare path.
//!
//! # Limitations
//!
//! * Every payload frame must be binary; a text frame terminates the
//!   session as a protocol violation.
//! * The adapter enforces no deadlines of its own. HTTP/2 keepalives and
//!   per-RPC deadlines in the layers above provide timeout semantics.
//! * TLS belongs to the WebSocket hop (`wss://`); the tunnel never layers
//!   gRPC transport security inside it.
//!
//! [`tonic`]: https://github.com/hyperium/tonic
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod error;
mod uri;

pub use error::Error;

#[cfg(not(target_arch = "wasm32"))]
mod io;
#[cfg(not(target_arch = "wasm32"))]
pub use io::WebSocketIo;

#[cfg(not(target_arch = "wasm32"))]
pub mod client;
#[cfg(not(target_arch = "wasm32"))]
pub use client::{connect, WebSocketConnector, WebSocketEndpoint};

#[cfg(not(target_arch = "wasm32"))]
pub mod server;
#[cfg(not(target_arch = "wasm32"))]
pub use server::WebSocketTunnel;

#[cfg(target_arch = "wasm32")]
pub mod browser;
