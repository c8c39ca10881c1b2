//! Error types surfaced across the crate's public boundary.

use thiserror::Error;

/// Failure modes the facade can report to a caller.
///
/// Per-message and per-send-destination failures are never represented here
/// — those are silently dropped or logged (see the crate's module docs) —
/// this type only covers construction, option validation, and bind-time
/// failures.
#[derive(Debug, Error)]
pub enum DiscoverError {
    #[error("unable to create socket: {0}")]
    Socket(#[source] std::io::Error),

    #[error("unable to bind socket to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to set socket option {name}: {source}")]
    SocketOption {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid value for option {0}")]
    InvalidOption(&'static str),

    #[error("unable to determine local hostname: {0}")]
    Hostname(#[source] std::io::Error),

    #[error("instance already started")]
    AlreadyStarted,

    #[error("instance not started")]
    NotStarted,

    #[error("peer address list for unicast mode must not be empty")]
    EmptyUnicastTargets,
}

pub type Result<T> = std::result::Result<T, DiscoverError>;
