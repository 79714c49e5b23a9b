//! Client configuration
//!
//! All tunables live here: transport selection, CAN addressing, response
//! deadlines, the security access algorithm and the reflash sequence
//! parameters. Everything has a default matching the reference ECU wiring,
//! so an empty TOML file yields a working mock setup.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level configuration for the reflash client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,
    /// CAN addressing
    #[serde(default)]
    pub addressing: AddressingConfig,
    /// Response deadlines
    #[serde(default)]
    pub timing: TimingConfig,
    /// Security access
    #[serde(default)]
    pub security: SecurityConfig,
    /// Reflash sequence parameters
    #[serde(default)]
    pub flash: FlashConfig,
    /// Diagnostic scenario parameters
    #[serde(default)]
    pub scenario: ScenarioConfig,
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::Io(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            ConfigError::Parse(format!("Failed to parse config file '{}': {}", path.display(), e))
        })
    }
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// SocketCAN raw interface (Linux only)
    SocketCan(SocketCanConfig),
    /// Mock transport for testing
    Mock(MockConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Mock(MockConfig::default())
    }
}

/// SocketCAN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketCanConfig {
    /// CAN interface name (e.g., "can0")
    pub interface: String,
    /// Idle sleep between receive polls in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for SocketCanConfig {
    fn default() -> Self {
        Self {
            interface: "can0".to_string(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

fn default_poll_interval() -> u64 {
    100
}

/// Mock transport configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    /// Simulated response latency in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
}

// =============================================================================
// Addressing Configuration
// =============================================================================

/// CAN arbitration IDs for physical and functional exchanges
///
/// Physical responses are expected on `request ID + physical_response_offset`,
/// plus any IDs in the extra list for ECUs that answer on unconventional
/// addresses. Functional responses are accepted from the whole configured
/// range because any number of ECUs may answer a broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressingConfig {
    /// Tester-to-ECU request ID for physical addressing (hex, e.g., "0x713")
    #[serde(default = "default_physical_request_id")]
    pub physical_request_id: String,
    /// Offset added to the request ID to form the expected response ID
    #[serde(default = "default_physical_response_offset")]
    pub physical_response_offset: u32,
    /// Additional accepted physical response IDs
    #[serde(default = "default_physical_extra_response_ids")]
    pub physical_extra_response_ids: Vec<String>,
    /// Broadcast request ID for functional addressing
    #[serde(default = "default_functional_request_id")]
    pub functional_request_id: String,
    /// First accepted functional response ID
    #[serde(default = "default_functional_response_start")]
    pub functional_response_start: String,
    /// Exclusive upper bound of the functional response range
    #[serde(default = "default_functional_response_end")]
    pub functional_response_end: String,
    /// Additional accepted functional response IDs
    #[serde(default)]
    pub functional_extra_response_ids: Vec<String>,
}

impl Default for AddressingConfig {
    fn default() -> Self {
        Self {
            physical_request_id: default_physical_request_id(),
            physical_response_offset: default_physical_response_offset(),
            physical_extra_response_ids: default_physical_extra_response_ids(),
            functional_request_id: default_functional_request_id(),
            functional_response_start: default_functional_response_start(),
            functional_response_end: default_functional_response_end(),
            functional_extra_response_ids: Vec::new(),
        }
    }
}

fn default_physical_request_id() -> String {
    "0x713".to_string()
}

fn default_physical_response_offset() -> u32 {
    0x8
}

fn default_physical_extra_response_ids() -> Vec<String> {
    vec!["0x3C1".to_string()]
}

fn default_functional_request_id() -> String {
    "0x7DF".to_string()
}

fn default_functional_response_start() -> String {
    "0x7E8".to_string()
}

fn default_functional_response_end() -> String {
    "0x7F0".to_string()
}

// =============================================================================
// Timing Configuration
// =============================================================================

/// Response deadlines per service class
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Deadline for session, security, DID and transfer services (ms)
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
    /// Deadline for routine control, communication control and DTC
    /// setting services, which routinely run longer on the ECU (ms)
    #[serde(default = "default_routine_timeout")]
    pub routine_timeout_ms: u64,
    /// Pause between consecutive frames of a segmented request (ms)
    #[serde(default)]
    pub inter_frame_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout(),
            routine_timeout_ms: default_routine_timeout(),
            inter_frame_delay_ms: 0,
        }
    }
}

fn default_response_timeout() -> u64 {
    1000
}

fn default_routine_timeout() -> u64 {
    2000
}

// =============================================================================
// Security Configuration
// =============================================================================

/// Security access configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Key derivation algorithm
    #[serde(default)]
    pub algorithm: SecurityAlgorithm,
    /// Security level requested during the flash unlock step
    #[serde(default = "default_security_level")]
    pub request_level: u8,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            algorithm: SecurityAlgorithm::default(),
            request_level: default_security_level(),
        }
    }
}

fn default_security_level() -> u8 {
    0x11
}

/// Seed-to-key derivation algorithm selector
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SecurityAlgorithm {
    /// AES-128-CFB keystream derivation, 4-byte key
    #[default]
    Cfb,
    /// AES-CMAC over the seed, 8-byte key
    Cmac,
}

// =============================================================================
// Flash Configuration
// =============================================================================

/// Reflash sequence parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Memory address the image is downloaded to (hex, e.g., "0x08000000")
    #[serde(default = "default_base_address")]
    pub base_address: String,
    /// TransferData block payload size in bytes
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// First block sequence counter value
    #[serde(default = "default_block_counter_start")]
    pub block_counter_start: u8,
    /// The block sequence counter wraps modulo this value
    #[serde(default = "default_block_counter_wrap")]
    pub block_counter_wrap: u8,
    /// Flash sections to erase before download. When empty, a single
    /// section covering the image at the base address is erased.
    #[serde(default)]
    pub erase_sections: Vec<EraseSection>,
    /// Routine ID for the programming precondition check (hex)
    #[serde(default = "default_precondition_routine")]
    pub precondition_routine: String,
    /// Routine ID for memory erase (hex)
    #[serde(default = "default_erase_routine")]
    pub erase_routine: String,
    /// Routine ID for the memory integrity check (hex)
    #[serde(default = "default_integrity_routine")]
    pub integrity_routine: String,
    /// Routine ID for the program compatibility check (hex)
    #[serde(default = "default_compatibility_routine")]
    pub compatibility_routine: String,
    /// DID the programming fingerprint is written to (hex)
    #[serde(default = "default_fingerprint_did")]
    pub fingerprint_did: String,
    /// Tool signature embedded in the fingerprint; the first six bytes
    /// are used, shorter values get a space terminator and zero padding
    #[serde(default = "default_tester_signature")]
    pub tester_signature: String,
    /// Arbitration ID of the wake-up frame (hex)
    #[serde(default = "default_wakeup_id")]
    pub wakeup_id: String,
    /// Gap between the two wake-up frames (ms)
    #[serde(default = "default_wakeup_gap")]
    pub wakeup_gap_ms: u64,
    /// Settle time after entering the programming session (ms)
    #[serde(default = "default_programming_settle")]
    pub programming_settle_ms: u64,
    /// Settle time after the ECU reset at the end of the run (ms)
    #[serde(default = "default_reset_settle")]
    pub reset_settle_ms: u64,
    /// Pause between orchestrator steps (ms)
    #[serde(default = "default_step_delay")]
    pub step_delay_ms: u64,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            base_address: default_base_address(),
            block_size: default_block_size(),
            block_counter_start: default_block_counter_start(),
            block_counter_wrap: default_block_counter_wrap(),
            erase_sections: Vec::new(),
            precondition_routine: default_precondition_routine(),
            erase_routine: default_erase_routine(),
            integrity_routine: default_integrity_routine(),
            compatibility_routine: default_compatibility_routine(),
            fingerprint_did: default_fingerprint_did(),
            tester_signature: default_tester_signature(),
            wakeup_id: default_wakeup_id(),
            wakeup_gap_ms: default_wakeup_gap(),
            programming_settle_ms: default_programming_settle(),
            reset_settle_ms: default_reset_settle(),
            step_delay_ms: default_step_delay(),
        }
    }
}

/// One flash section passed to the erase routine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EraseSection {
    /// Section start address (hex, e.g., "0x08000000")
    pub address: String,
    /// Section size in bytes
    pub size: u32,
}

fn default_base_address() -> String {
    "0x08000000".to_string()
}

fn default_block_size() -> usize {
    1024
}

fn default_block_counter_start() -> u8 {
    1
}

fn default_block_counter_wrap() -> u8 {
    16
}

fn default_precondition_routine() -> String {
    "0xFF00".to_string()
}

fn default_erase_routine() -> String {
    "0xFF00".to_string()
}

fn default_integrity_routine() -> String {
    "0x0201".to_string()
}

fn default_compatibility_routine() -> String {
    "0x0203".to_string()
}

fn default_fingerprint_did() -> String {
    "0xF184".to_string()
}

fn default_tester_signature() -> String {
    "ABCDEXY".to_string()
}

fn default_wakeup_id() -> String {
    "0x33C".to_string()
}

fn default_wakeup_gap() -> u64 {
    500
}

fn default_programming_settle() -> u64 {
    500
}

fn default_reset_settle() -> u64 {
    2000
}

fn default_step_delay() -> u64 {
    10
}

// =============================================================================
// Scenario Configuration
// =============================================================================

/// Diagnostic scenario parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// How many times the scenario runs; a negative count repeats until
    /// stopped
    #[serde(default = "default_repeat_count")]
    pub repeat_count: i32,
    /// DID read during the identification step (hex)
    #[serde(default = "default_identification_did")]
    pub identification_did: String,
    /// Security level whose seed is requested
    #[serde(default = "default_scenario_level")]
    pub security_level: u8,
    /// Key bytes sent in the probe step
    #[serde(default = "default_probe_key")]
    pub probe_key: Vec<u8>,
    /// Pause between scenario steps (ms)
    #[serde(default = "default_scenario_step_delay")]
    pub step_delay_ms: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            repeat_count: default_repeat_count(),
            identification_did: default_identification_did(),
            security_level: default_scenario_level(),
            probe_key: default_probe_key(),
            step_delay_ms: default_scenario_step_delay(),
        }
    }
}

fn default_repeat_count() -> i32 {
    1
}

fn default_identification_did() -> String {
    "0xF190".to_string()
}

fn default_scenario_level() -> u8 {
    0x01
}

fn default_probe_key() -> Vec<u8> {
    vec![0xA5, 0xA5, 0xA5, 0xA5]
}

fn default_scenario_step_delay() -> u64 {
    100
}

// =============================================================================
// Helpers
// =============================================================================

/// Parse a CAN ID or memory address from string (hex with 0x prefix, or
/// decimal)
pub fn parse_hex_id(s: &str) -> Result<u32, ConfigError> {
    let trimmed = s.trim();
    let (digits, radix) = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Some(rest) => (rest, 16),
        None => (trimmed, 10),
    };

    u32::from_str_radix(digits, radix).map_err(|_| ConfigError::InvalidId(s.to_string()))
}

/// Parse a 16-bit identifier (DID or RID) from string
pub fn parse_hex_id_u16(s: &str) -> Result<u16, ConfigError> {
    let value = parse_hex_id(s)?;
    u16::try_from(value).map_err(|_| ConfigError::InvalidId(s.to_string()))
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid identifier '{0}'")]
    InvalidId(String),
}
