use std::{error::Error as StdError, fmt};

type Source = Box<dyn StdError + Send + Sync + 'static>;

/// Errors raised by the tunnel client and server.
///
/// Every failure here has a concrete cause — a socket error, a rejected
/// handshake, a malformed target — carried as the source, so callers
/// diagnose through the standard error chain.
#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Source,
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    /// Accepting or serving failed after the tunnel was up.
    Transport,
    /// The WebSocket never reached its open state.
    Connect,
    /// The target could not be normalized into a WebSocket URL.
    InvalidUri,
}

impl Error {
    pub(crate) fn transport(source: impl Into<Source>) -> Self {
        Self {
            kind: Kind::Transport,
            source: source.into(),
        }
    }

    pub(crate) fn connect(source: impl Into<Source>) -> Self {
        Self {
            kind: Kind::Connect,
            source: source.into(),
        }
    }

    pub(crate) fn invalid_uri(source: impl Into<Source>) -> Self {
        Self {
            kind: Kind::InvalidUri,
            source: source.into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Kind::Transport => f.write_str("tunnel transport error"),
            Kind::Connect => f.write_str("websocket connect failed"),
            Kind::InvalidUri => f.write_str("invalid websocket target"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}
