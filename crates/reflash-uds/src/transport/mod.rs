//! CAN transport layer
//!
//! Adapters move raw frames on and off the bus. Two implementations exist:
//! SocketCAN against a real interface (Linux only) and an in-memory mock for
//! tests and dry runs. [`create_adapter`] picks one from the `[transport]`
//! section of the configuration.
//!
//! ```ignore
//! let bus = create_adapter(&TransportConfig::Mock(Default::default())).await?;
//! bus.send(CanFrame::padded(0x713, &[0x02, 0x10, 0x03])).await?;
//! ```

mod adapter;
pub mod error;
pub mod mock;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

pub use adapter::{CanAdapter, IncomingFrame};
pub use error::TransportError;

use std::sync::Arc;

use crate::config::TransportConfig;

/// Build the adapter selected by the transport configuration.
pub async fn create_adapter(
    config: &TransportConfig,
) -> Result<Arc<dyn CanAdapter>, TransportError> {
    match config {
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        TransportConfig::SocketCan(cfg) => {
            Ok(Arc::new(socketcan::SocketCanAdapter::open(cfg).await?))
        }
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        TransportConfig::SocketCan(_) => Err(TransportError::Unsupported(
            "SocketCAN needs Linux and the 'socketcan' feature".to_string(),
        )),
        TransportConfig::Mock(cfg) => Ok(Arc::new(mock::MockCanAdapter::from_config(cfg))),
    }
}
