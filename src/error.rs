//! Crate-wide error types.

use thiserror::Error;

use crate::tls::TlsError;

/// Boxed error produced by application callbacks (channel subscribers,
/// open hooks, factories).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type for hosting and channel operations.
#[derive(Debug, Error)]
pub enum HostingError {
    /// Operation is not valid in the current state (send on a broken
    /// channel, send after close, overriding an existing fallback
    /// application, ...).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A request handler is already registered for this path.
    #[error("path '{0}' is already bound")]
    PathAlreadyBound(String),

    /// The listening socket could not be bound or served.
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Certificate or TLS configuration failure.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// The underlying websocket transport rejected a frame.
    #[error("transport error: {0}")]
    Transport(String),

    /// An application callback failed.
    #[error("application error: {0}")]
    Application(#[source] BoxError),
}

impl HostingError {
    /// Wrap an arbitrary application error.
    pub fn application<E: Into<BoxError>>(err: E) -> Self {
        HostingError::Application(err.into())
    }

    pub(crate) fn invalid_operation(message: impl Into<String>) -> Self {
        HostingError::InvalidOperation(message.into())
    }
}
