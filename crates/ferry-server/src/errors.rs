//! Error types, one enum per concern.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::connection::ConnectionId;

/// Startup and listener failures. Every variant here is fatal to the
/// process: an IPC endpoint that cannot bind or enforce its access control
/// has no safe degraded mode.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The handoff socket path could not be bound.
    #[error("failed to bind handoff socket {path}: {source}")]
    SocketBind {
        /// Configured socket path.
        path: PathBuf,
        /// Underlying bind error.
        source: io::Error,
    },
    /// The configured socket path exists and is not a socket; refusing to
    /// clobber whatever it is.
    #[error("refusing to replace non-socket path {0}")]
    NotASocket(PathBuf),
    /// The configured socket group does not exist on this system.
    #[error("unknown socket group '{0}'")]
    UnknownGroup(String),
    /// Ownership or mode could not be applied to the socket file.
    #[error("failed to set permissions on {path}: {source}")]
    Permissions {
        /// Socket path being restricted.
        path: PathBuf,
        /// Underlying chown/chmod error.
        source: io::Error,
    },
    /// The HTTP listener address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    TcpBind {
        /// Configured host:port.
        addr: String,
        /// Underlying bind error.
        source: io::Error,
    },
    /// Other I/O during startup.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Registry contract violations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// An insert collided with a live entry. Constructing two live
    /// connections with one identity is a programming-contract violation;
    /// the existing entry is never overwritten.
    #[error("connection {0} is already registered")]
    Duplicate(ConnectionId),
}

/// Transport failures from either WebSocket stack, unified so the session
/// handler is indifferent to a connection's origin.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Error on a directly-accepted (axum) connection.
    #[error("websocket error: {0}")]
    Direct(#[from] axum::Error),
    /// Error on a handed-off (tokio-tungstenite) connection.
    #[error("websocket error: {0}")]
    Handoff(#[from] tokio_tungstenite::tungstenite::Error),
}
