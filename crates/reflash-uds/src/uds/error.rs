//! UDS protocol errors

use std::time::Duration;

use thiserror::Error;

use crate::frame::FrameCodecError;
use crate::transport::TransportError;

use super::NegativeResponseCode;

#[derive(Debug, Error, Clone)]
pub enum UdsError {
    #[error("negative response {nrc} (0x{nrc:02X}) to service 0x{service:02X}")]
    NegativeResponse {
        service: u8,
        nrc: NegativeResponseCode,
    },

    #[error("malformed response: {0}")]
    InvalidResponse(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("frame codec: {0}")]
    Codec(#[from] FrameCodecError),

    #[error("security access failed: {0}")]
    SecurityAccessFailed(String),

    #[error("precondition not met: {0}")]
    Precondition(String),

    #[error("routine 0x{rid:04X} reported status 0x{status:02X}")]
    RoutineFailed { rid: u16, status: u8 },
}

impl UdsError {
    /// The NRC carried by a negative response, if this is one.
    pub fn nrc(&self) -> Option<NegativeResponseCode> {
        match self {
            UdsError::NegativeResponse { nrc, .. } => Some(*nrc),
            _ => None,
        }
    }
}
