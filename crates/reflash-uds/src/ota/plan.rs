//! Resolved flash parameters
//!
//! [`FlashPlan`] is the numeric form of [`FlashConfig`]: every address,
//! routine identifier and delay is parsed up front so the orchestrator
//! never touches configuration strings mid-run.

use std::time::Duration;

use chrono::{Datelike, NaiveDate};

use crate::config::{parse_hex_id, parse_hex_id_u16, ConfigError, FlashConfig};

/// Flash parameters with all identifiers resolved.
#[derive(Debug, Clone)]
pub struct FlashPlan {
    /// Download base address in ECU memory.
    pub base_address: u32,
    /// TransferData chunk size in bytes.
    pub block_size: usize,
    /// First block sequence counter value.
    pub block_counter_start: u8,
    /// Modulus for the block sequence counter.
    pub block_counter_wrap: u8,
    /// Configured erase sections as `(address, size)` pairs.
    pub erase_sections: Vec<(u32, u32)>,
    pub precondition_routine: u16,
    pub erase_routine: u16,
    pub integrity_routine: u16,
    pub compatibility_routine: u16,
    pub fingerprint_did: u16,
    pub tester_signature: String,
    /// CAN ID of the raw wake-up frame.
    pub wakeup_id: u32,
    pub wakeup_gap: Duration,
    pub programming_settle: Duration,
    pub reset_settle: Duration,
    pub step_delay: Duration,
}

impl FlashPlan {
    pub fn from_config(config: &FlashConfig) -> Result<Self, ConfigError> {
        if config.block_size == 0 {
            return Err(ConfigError::Parse(
                "flash.block_size must be nonzero".to_string(),
            ));
        }
        if config.block_counter_wrap == 0 {
            return Err(ConfigError::Parse(
                "flash.block_counter_wrap must be nonzero".to_string(),
            ));
        }

        let erase_sections = config
            .erase_sections
            .iter()
            .map(|section| Ok((parse_hex_id(&section.address)?, section.size)))
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Self {
            base_address: parse_hex_id(&config.base_address)?,
            block_size: config.block_size,
            block_counter_start: config.block_counter_start,
            block_counter_wrap: config.block_counter_wrap,
            erase_sections,
            precondition_routine: parse_hex_id_u16(&config.precondition_routine)?,
            erase_routine: parse_hex_id_u16(&config.erase_routine)?,
            integrity_routine: parse_hex_id_u16(&config.integrity_routine)?,
            compatibility_routine: parse_hex_id_u16(&config.compatibility_routine)?,
            fingerprint_did: parse_hex_id_u16(&config.fingerprint_did)?,
            tester_signature: config.tester_signature.clone(),
            wakeup_id: parse_hex_id(&config.wakeup_id)?,
            wakeup_gap: Duration::from_millis(config.wakeup_gap_ms),
            programming_settle: Duration::from_millis(config.programming_settle_ms),
            reset_settle: Duration::from_millis(config.reset_settle_ms),
            step_delay: Duration::from_millis(config.step_delay_ms),
        })
    }

    /// Sections to erase for an image of `image_len` bytes. Without
    /// configured sections the image footprint at the base address is
    /// erased as a single section.
    pub fn sections_for(&self, image_len: usize) -> Vec<(u32, u32)> {
        if self.erase_sections.is_empty() {
            vec![(self.base_address, image_len as u32)]
        } else {
            self.erase_sections.clone()
        }
    }

    /// Block sequence counter for the `index`-th transfer block.
    pub fn block_counter(&self, index: usize) -> u8 {
        let wrap = self.block_counter_wrap as usize;
        ((self.block_counter_start as usize + index) % wrap) as u8
    }
}

/// Fingerprint record: programming date as `[year-2000, month, day]`
/// followed by the tool signature with its 0x20 terminator, cut or
/// zero-padded to six bytes.
pub(crate) fn fingerprint_payload(date: NaiveDate, signature: &str) -> Vec<u8> {
    let mut payload = vec![
        date.year().wrapping_sub(2000) as u8,
        date.month() as u8,
        date.day() as u8,
    ];
    let mut sig: Vec<u8> = signature.bytes().collect();
    sig.push(0x20);
    sig.resize(6, 0x00);
    payload.extend_from_slice(&sig);
    payload
}
