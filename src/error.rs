//! Error types.
//!
//! Request-level failures never surface as `Error`s: handlers answer with a
//! [`Response`](crate::Response), and the context pipeline degrades to
//! fallbacks instead of failing. What remains are infrastructure failures
//! (binding a port, registering a route) and the collaborator failures the
//! pipeline contains internally.

use std::time::Duration;

use thiserror::Error;

/// Boxed error returned by external collaborators (context factories, body
/// parsers, plugins, plugin managers).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The error type returned by kindle's fallible setup and serving operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid socket address `{addr}`: {source}")]
    Addr {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("invalid route `{path}`: {source}")]
    Route {
        path: String,
        #[source]
        source: matchit::InsertError,
    },

    #[error(transparent)]
    Plugin(#[from] PluginError),
}

/// A guarded operation did not settle before its deadline.
#[derive(Debug, Clone, Error)]
#[error("{operation} timed out after {}ms", after.as_millis())]
pub struct TimeoutError {
    pub operation: String,
    pub after: Duration,
}

/// Failures raised by or about plugins.
#[derive(Debug, Error)]
pub enum PluginError {
    /// A custom plugin tried to register under a built-in name.
    #[error("`{0}` is reserved for a built-in plugin")]
    ReservedName(String),

    /// The plugin could not describe its dependencies or priority.
    #[error("invalid metadata for plugin `{plugin}`: {reason}")]
    Metadata { plugin: String, reason: String },
}
