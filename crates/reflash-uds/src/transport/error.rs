//! Errors raised at the raw CAN boundary.

use thiserror::Error;

/// Adapter failures, normalized so the session layer can treat every bus
/// implementation the same way.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("cannot open CAN interface: {0}")]
    Open(String),

    #[error("CAN adapter disconnected")]
    Disconnected,

    #[error("frame send failed: {0}")]
    Send(String),

    #[error("frame receive failed: {0}")]
    Receive(String),

    #[error("invalid transport configuration: {0}")]
    Config(String),

    #[error("transport not supported: {0}")]
    Unsupported(String),
}
