//! Diagnostic session primitives
//!
//! This module holds the resolved addressing scheme, the diagnostic
//! session and security state machines, and the request/response
//! channel that moves logical messages over a CAN adapter.

mod channel;

pub use channel::{ResponsePolicy, UdsChannel};

use std::fmt;

use crate::config::{parse_hex_id, AddressingConfig, ConfigError};

/// How a request is addressed on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    /// Point-to-point exchange with a single ECU
    Physical,
    /// Broadcast to every ECU listening on the functional ID
    Functional,
}

impl fmt::Display for AddressingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressingMode::Physical => write!(f, "physical"),
            AddressingMode::Functional => write!(f, "functional"),
        }
    }
}

/// Arbitration IDs resolved from configuration.
///
/// The physical response ID is derived from the request ID by a fixed
/// offset; gateways that answer on their own IDs are covered by the
/// extra allow-lists.
#[derive(Debug, Clone)]
pub struct Addressing {
    physical_request: u32,
    physical_response: u32,
    physical_extra: Vec<u32>,
    functional_request: u32,
    functional_response_start: u32,
    functional_response_end: u32,
    functional_extra: Vec<u32>,
}

impl Addressing {
    pub fn from_config(config: &AddressingConfig) -> Result<Self, ConfigError> {
        let physical_request = parse_hex_id(&config.physical_request_id)?;
        let physical_extra = config
            .physical_extra_response_ids
            .iter()
            .map(|id| parse_hex_id(id))
            .collect::<Result<Vec<_>, _>>()?;
        let functional_extra = config
            .functional_extra_response_ids
            .iter()
            .map(|id| parse_hex_id(id))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            physical_request,
            physical_response: physical_request + config.physical_response_offset,
            physical_extra,
            functional_request: parse_hex_id(&config.functional_request_id)?,
            functional_response_start: parse_hex_id(&config.functional_response_start)?,
            functional_response_end: parse_hex_id(&config.functional_response_end)?,
            functional_extra,
        })
    }

    /// Request ID used for the given addressing mode.
    pub fn request_id(&self, mode: AddressingMode) -> u32 {
        match mode {
            AddressingMode::Physical => self.physical_request,
            AddressingMode::Functional => self.functional_request,
        }
    }

    /// Expected response ID for physical requests.
    pub fn physical_response_id(&self) -> u32 {
        self.physical_response
    }

    /// Whether a frame received on `id` belongs to a request sent in
    /// the given mode. The functional range excludes its upper bound.
    pub fn accepts(&self, mode: AddressingMode, id: u32) -> bool {
        match mode {
            AddressingMode::Physical => {
                id == self.physical_response || self.physical_extra.contains(&id)
            }
            AddressingMode::Functional => {
                (self.functional_response_start..self.functional_response_end).contains(&id)
                    || self.functional_extra.contains(&id)
            }
        }
    }
}

/// Diagnostic session kinds used by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticSession {
    /// Default session (0x01)
    Default,
    /// Programming session (0x02)
    Programming,
    /// Extended diagnostic session (0x03)
    Extended,
}

impl Default for DiagnosticSession {
    fn default() -> Self {
        Self::Default
    }
}

impl DiagnosticSession {
    /// Session control sub-function, without the suppress bit.
    pub fn sub_function(self) -> u8 {
        match self {
            DiagnosticSession::Default => 0x01,
            DiagnosticSession::Programming => 0x02,
            DiagnosticSession::Extended => 0x03,
        }
    }
}

impl fmt::Display for DiagnosticSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticSession::Default => write!(f, "default"),
            DiagnosticSession::Programming => write!(f, "programming"),
            DiagnosticSession::Extended => write!(f, "extended"),
        }
    }
}

/// Security access progress for the active session.
///
/// Any session change invalidates a previous unlock, so the client
/// resets this to [`SecurityState::Locked`] whenever the session
/// switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityState {
    /// No seed requested, or a session change revoked the unlock
    Locked,
    /// Seed received, matching key not yet accepted
    SeedIssued { level: u8, seed: Vec<u8> },
    /// Key accepted at the given seed level
    Unlocked { level: u8 },
}

impl Default for SecurityState {
    fn default() -> Self {
        Self::Locked
    }
}

impl SecurityState {
    pub fn is_unlocked(&self) -> bool {
        matches!(self, SecurityState::Unlocked { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_addressing() -> Addressing {
        Addressing::from_config(&AddressingConfig::default()).unwrap()
    }

    #[test]
    fn test_physical_response_derived_from_offset() {
        let addressing = default_addressing();
        assert_eq!(addressing.request_id(AddressingMode::Physical), 0x713);
        assert_eq!(addressing.physical_response_id(), 0x71B);
        assert!(addressing.accepts(AddressingMode::Physical, 0x71B));
        assert!(!addressing.accepts(AddressingMode::Physical, 0x71C));
    }

    #[test]
    fn test_physical_extra_ids_accepted() {
        let addressing = default_addressing();
        assert!(addressing.accepts(AddressingMode::Physical, 0x3C1));
        assert!(!addressing.accepts(AddressingMode::Functional, 0x3C1));
    }

    #[test]
    fn test_functional_range_excludes_upper_bound() {
        let addressing = default_addressing();
        assert_eq!(addressing.request_id(AddressingMode::Functional), 0x7DF);
        assert!(addressing.accepts(AddressingMode::Functional, 0x7E8));
        assert!(addressing.accepts(AddressingMode::Functional, 0x7EF));
        assert!(!addressing.accepts(AddressingMode::Functional, 0x7F0));
        assert!(!addressing.accepts(AddressingMode::Functional, 0x7E7));
    }

    #[test]
    fn test_session_sub_functions() {
        assert_eq!(DiagnosticSession::Default.sub_function(), 0x01);
        assert_eq!(DiagnosticSession::Programming.sub_function(), 0x02);
        assert_eq!(DiagnosticSession::Extended.sub_function(), 0x03);
    }

    #[test]
    fn test_security_state_default_is_locked() {
        assert_eq!(SecurityState::default(), SecurityState::Locked);
        assert!(!SecurityState::Locked.is_unlocked());
        assert!(SecurityState::Unlocked { level: 0x11 }.is_unlocked());
    }

    #[test]
    fn test_invalid_id_rejected() {
        let config = AddressingConfig {
            physical_request_id: "0xZZZ".to_string(),
            ..AddressingConfig::default()
        };
        assert!(Addressing::from_config(&config).is_err());
    }
}
