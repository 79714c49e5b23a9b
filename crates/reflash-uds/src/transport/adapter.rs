//! CAN adapter trait shared by the real and mock transports

use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::frame::CanFrame;
use crate::transport::TransportError;

/// A frame observed on the bus, stamped on arrival.
#[derive(Debug, Clone, Copy)]
pub struct IncomingFrame {
    pub timestamp: Instant,
    pub frame: CanFrame,
}

/// Abstraction over a raw CAN interface.
///
/// Adapters transmit single frames and fan all received traffic out through
/// a broadcast channel. Segmentation, addressing and response matching live
/// above this trait, so an adapter never interprets payload bytes.
#[async_trait]
pub trait CanAdapter: Send + Sync {
    /// Transmit a single frame.
    async fn send(&self, frame: CanFrame) -> Result<(), TransportError>;

    /// Subscribe to every frame received on the interface.
    ///
    /// Subscribers must be registered before the request that triggers the
    /// traffic they want to observe, otherwise fast responses can be lost.
    fn subscribe(&self) -> broadcast::Receiver<IncomingFrame>;

    /// Whether the underlying interface is currently open.
    async fn is_open(&self) -> bool;

    /// Reopen the underlying interface after a failure.
    async fn reconnect(&self) -> Result<(), TransportError>;
}
