//! UDS (ISO 14229) service layer
//!
//! Everything the reflash and scenario flows are built on: service ID
//! constants, negative response codes, the shared error type, and the
//! client that assembles requests and validates responses.

mod client;
mod error;
mod nrc;

pub use client::UdsClient;
pub use error::UdsError;
pub use nrc::NegativeResponseCode;

/// Added to a service ID to form its positive response SID.
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// Sub-function bit that asks the ECU not to send a positive response.
pub const SUPPRESS_POSITIVE_RESPONSE: u8 = 0x80;

/// Service identifiers used by this client
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const CLEAR_DIAGNOSTIC_INFO: u8 = 0x14;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const COMMUNICATION_CONTROL: u8 = 0x28;
    pub const WRITE_DATA_BY_ID: u8 = 0x2E;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const CONTROL_DTC_SETTING: u8 = 0x85;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// RoutineControl (0x31) sub-functions
pub mod routine_sub_function {
    pub const START_ROUTINE: u8 = 0x01;
    pub const STOP_ROUTINE: u8 = 0x02;
    pub const REQUEST_ROUTINE_RESULTS: u8 = 0x03;
}

/// ECUReset (0x11) sub-functions
pub mod reset_type {
    /// Full power-on reset
    pub const HARD_RESET: u8 = 0x01;
    /// Ignition off/on cycle
    pub const KEY_OFF_ON_RESET: u8 = 0x02;
    /// Application restart without dropping power
    pub const SOFT_RESET: u8 = 0x03;
}

/// CommunicationControl (0x28) sub-functions and communication types
pub mod comm_control {
    /// Enable both reception and transmission
    pub const ENABLE_RX_AND_TX: u8 = 0x00;
    /// Disable both reception and transmission
    pub const DISABLE_RX_AND_TX: u8 = 0x03;
    /// Normal communication and network management messages
    pub const NORMAL_AND_NM_MESSAGES: u8 = 0x03;
}

/// ControlDTCSetting (0x85) sub-functions
pub mod dtc_setting {
    /// Resume updating DTC status bits
    pub const ON: u8 = 0x01;
    /// Stop updating DTC status bits
    pub const OFF: u8 = 0x02;
}

/// ClearDiagnosticInformation (0x14) group selectors
pub mod dtc_group {
    /// All DTC groups, 0xFFFFFF on the wire
    pub const ALL: [u8; 3] = [0xFF, 0xFF, 0xFF];
}

/// Data identifiers (ISO 14229-1 Annex C) the client touches
pub mod standard_did {
    /// Application software fingerprint, written before erasing
    pub const APP_SOFTWARE_FINGERPRINT: u16 = 0xF184;
    /// Active diagnostic session
    pub const ACTIVE_DIAGNOSTIC_SESSION: u16 = 0xF186;
    /// Vehicle identification number
    pub const VIN: u16 = 0xF190;
}
