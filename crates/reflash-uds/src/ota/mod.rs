//! OTA reflash orchestration
//!
//! [`OtaFlasher`] drives a firmware image onto an ECU through the strictly
//! ordered reflash sequence: wake-up, session setup, bus quieting, security
//! access, fingerprint, erase, download, verification and restart. Progress
//! and log lines are published on the client's event bus; a failure carries
//! the name of the step that ended the run.

mod flasher;
mod plan;

pub use flasher::OtaFlasher;
pub use plan::FlashPlan;

use thiserror::Error;

use crate::uds::UdsError;

/// Errors terminating a reflash run.
#[derive(Debug, Error)]
pub enum OtaError {
    #[error("Step '{step}' failed: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: UdsError,
    },

    #[error("Cancelled before step '{step}'")]
    Cancelled { step: &'static str },

    #[error("Firmware image is empty")]
    EmptyImage,
}

impl OtaError {
    fn step(step: &'static str, source: UdsError) -> Self {
        Self::Step { step, source }
    }

    /// Name of the step the run stopped in, if it got that far.
    pub fn step_name(&self) -> Option<&'static str> {
        match self {
            OtaError::Step { step, .. } | OtaError::Cancelled { step } => Some(step),
            OtaError::EmptyImage => None,
        }
    }
}
