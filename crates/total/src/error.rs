//! Error types for the total-order layer

use ordercast_transport::TransportError;
use thiserror::Error;

/// Result type for total-order operations
pub type Result<T> = std::result::Result<T, TotalError>;

/// Errors surfaced by construction, configuration and frame decoding
///
/// Message handling itself never returns these to callers; it logs and
/// carries on.
#[derive(Debug, Error)]
pub enum TotalError {
    /// Frame could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Header carried a kind byte outside the known set
    #[error("Unknown header kind: {0}")]
    UnknownHeaderKind(u8),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// No tokio runtime to run timers on
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Metrics registration failure
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}
