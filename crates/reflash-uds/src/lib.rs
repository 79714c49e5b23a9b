//! reflash-uds - UDS/CAN diagnostic and OTA reflash client
//!
//! This crate talks to ECUs over raw CAN using UDS (ISO 14229) service
//! requests, segmented into 8-byte frames by a lightweight multi-frame
//! codec. On top of the service client sit two long-running drivers: the
//! OTA flasher, which pushes a firmware image through the full reflash
//! sequence, and the scenario runner, which repeats a diagnostic smoke
//! sequence for regression runs.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │        OtaFlasher / ScenarioRunner            │
//! │   (step sequencing, progress, cancellation)   │
//! └──────────────────────┬────────────────────────┘
//!                        │
//! ┌──────────────────────┴────────────────────────┐
//! │  UdsClient - services, session and security   │
//! └──────────────────────┬────────────────────────┘
//!                        │
//! ┌──────────────────────┴────────────────────────┐
//! │  UdsChannel - send, wait, addressing filter   │──► EventBus
//! └──────────────────────┬────────────────────────┘
//!                        │
//! ┌──────────────────────┴────────────────────────┐
//! │  Frame codec - SF/FF/CF segmentation          │
//! └──────────────────────┬────────────────────────┘
//!                        │
//! ┌──────────────────────┴────────────────────────┐
//! │  CanAdapter - SocketCAN or mock               │
//! └───────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod event;
pub mod frame;
pub mod ota;
pub mod scenario;
pub mod security;
pub mod session;
pub mod transport;
pub mod uds;
pub mod worker;

pub use config::{ClientConfig, ConfigError};
pub use event::{ClientEvent, Direction, EventBus, LogLevel};
pub use frame::CanFrame;
pub use ota::{FlashPlan, OtaError, OtaFlasher};
pub use scenario::{ScenarioError, ScenarioRunner};
pub use session::{
    Addressing, AddressingMode, DiagnosticSession, ResponsePolicy, SecurityState, UdsChannel,
};
pub use transport::{create_adapter, CanAdapter, IncomingFrame, TransportError};
pub use uds::{NegativeResponseCode, UdsClient, UdsError};
pub use worker::{submit, CancelFlag, TaskHandle};
