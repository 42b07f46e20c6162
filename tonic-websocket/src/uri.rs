//! Target-to-WebSocket-URL normalization.

use http::Uri;

use crate::error::Error;

/// Normalizes a user-supplied target into a complete WebSocket URI.
///
/// Accepted forms:
///   - `ws://...` / `wss://...` — used unchanged
///   - `:8080` — bare port, `localhost` is assumed
///   - `host:port` — prefixed with `ws://`, or `wss://` when TLS was
///     configured
#[cfg_attr(target_arch = "wasm32", allow(dead_code))]
pub(crate) fn infer_websocket_uri(target: &str, use_tls: bool) -> Result<Uri, Error> {
    let url = if target.starts_with("ws://") || target.starts_with("wss://") {
        target.to_owned()
    } else {
        let scheme = if use_tls { "wss" } else { "ws" };
        if target.starts_with(':') {
            format!("{scheme}://localhost{target}")
        } else {
            format!("{scheme}://{target}")
        }
    };

    url.parse::<Uri>().map_err(Error::invalid_uri)
}

/// Browser variant of [`infer_websocket_uri`]: the scheme and host come
/// from the page location when the target does not spell them out.
///
/// Accepted forms, checked in order:
///   - `ws://...` / `wss://...` — used unchanged
///   - `` (empty) — the current host, `wss` iff the page is TLS
///   - `/path` — the current host plus the path
///   - `:8080` — bare port on `localhost`
///   - `host:port` — the page scheme is applied
#[cfg_attr(not(target_arch = "wasm32"), allow(dead_code))]
pub(crate) fn infer_browser_websocket_uri(target: &str, page_is_tls: bool, page_host: &str) -> String {
    if target.starts_with("ws://") || target.starts_with("wss://") {
        return target.to_owned();
    }

    let scheme = if page_is_tls { "wss" } else { "ws" };

    if target.is_empty() {
        return format!("{scheme}://{page_host}");
    }
    if target.starts_with('/') {
        return format!("{scheme}://{page_host}{target}");
    }
    if target.starts_with(':') {
        return format!("{scheme}://localhost{target}");
    }

    format!("{scheme}://{target}")
}
