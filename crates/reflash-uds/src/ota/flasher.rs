//! Reflash sequence driver

use std::sync::Arc;

use bytes::Bytes;
use chrono::Local;
use crc::{Crc, CRC_32_ISO_HDLC};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{ClientConfig, ConfigError};
use crate::event::{EventBus, LogLevel};
use crate::frame::CanFrame;
use crate::session::{AddressingMode, DiagnosticSession};
use crate::uds::{dtc_setting, reset_type, UdsClient};
use crate::worker::CancelFlag;

use super::plan::{fingerprint_payload, FlashPlan};
use super::OtaError;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Drives the firmware reflash sequence against a single ECU.
///
/// The flasher owns no bus state of its own: every service goes through
/// the shared [`UdsClient`], and observers follow the run on the client's
/// event bus.
pub struct OtaFlasher {
    client: Arc<UdsClient>,
    plan: FlashPlan,
    security_level: u8,
    events: EventBus,
}

impl OtaFlasher {
    /// Build a flasher from the loaded configuration. Fails when a flash
    /// parameter or hex identifier in the configuration is invalid.
    pub fn new(client: Arc<UdsClient>, config: &ClientConfig) -> Result<Self, ConfigError> {
        let plan = FlashPlan::from_config(&config.flash)?;
        let events = client.channel().events().clone();
        Ok(Self {
            client,
            plan,
            security_level: config.security.request_level,
            events,
        })
    }

    pub fn plan(&self) -> &FlashPlan {
        &self.plan
    }

    /// Run the complete reflash sequence for `image`.
    ///
    /// Progress percentages are published on the event bus and never
    /// decrease; the final value is 100 whether the run succeeds or not.
    /// `cancel` is honoured between steps and between transfer blocks.
    #[instrument(skip(self, image, cancel))]
    pub async fn run(&self, image: Bytes, cancel: &CancelFlag) -> Result<(), OtaError> {
        if image.is_empty() {
            self.events
                .log(LogLevel::Error, "Refusing to flash an empty image");
            self.events.progress(100);
            return Err(OtaError::EmptyImage);
        }

        let run_id = Uuid::new_v4();
        let checksum = CRC32.checksum(&image);
        info!(%run_id, len = image.len(), checksum = format!("0x{checksum:08X}"), "Starting reflash run");
        self.events.log(
            LogLevel::Info,
            format!(
                "Reflashing {} bytes (CRC32 0x{checksum:08X}), run {run_id}",
                image.len()
            ),
        );

        let mut progress = ProgressReporter::new(&self.events);
        let result = self.execute(&image, cancel, &mut progress).await;
        match &result {
            Ok(()) => self.events.log(LogLevel::Info, "Reflash complete"),
            Err(e) => {
                error!(%run_id, error = %e, "Reflash run aborted");
                self.events
                    .log(LogLevel::Error, format!("Reflash aborted: {e}"));
                // Observers waiting for completion are released by the
                // final 100 even when the run dies early.
                progress.set(100);
            }
        }
        result
    }

    async fn execute(
        &self,
        image: &Bytes,
        cancel: &CancelFlag,
        progress: &mut ProgressReporter<'_>,
    ) -> Result<(), OtaError> {
        let client = &self.client;
        let plan = &self.plan;

        // =====================================================================
        // Wake-up and session setup
        // =====================================================================

        self.wake_ecu().await?;

        self.pace(cancel, "extended session").await?;
        client
            .start_session(DiagnosticSession::Extended, AddressingMode::Physical, false)
            .await
            .map_err(|e| OtaError::step("extended session", e))?;
        progress.set(3);

        self.pace(cancel, "extended session broadcast").await?;
        client
            .start_session(DiagnosticSession::Extended, AddressingMode::Functional, true)
            .await
            .map_err(|e| OtaError::step("extended session broadcast", e))?;
        progress.set(9);
        self.events
            .log(LogLevel::Info, "Extended diagnostic session active");

        self.pace(cancel, "programming preconditions").await?;
        client
            .start_routine(plan.precondition_routine, &[])
            .await
            .map_err(|e| OtaError::step("programming preconditions", e))?;
        progress.set(10);
        self.events
            .log(LogLevel::Info, "Programming preconditions satisfied");

        // =====================================================================
        // Bus quieting, tolerated failures
        // =====================================================================

        self.pace(cancel, "disable dtc logging").await?;
        if let Err(e) = client
            .control_dtc_setting(dtc_setting::OFF, AddressingMode::Functional, true)
            .await
        {
            warn!(error = %e, "ControlDTCSetting rejected, continuing");
            self.events.log(
                LogLevel::Warning,
                format!("Could not disable DTC logging: {e}"),
            );
        }
        progress.set(12);

        self.pace(cancel, "disable communication").await?;
        if let Err(e) = client.disable_normal_communication().await {
            warn!(error = %e, "CommunicationControl rejected, continuing");
            self.events.log(
                LogLevel::Warning,
                format!("Could not disable normal communication: {e}"),
            );
        }
        progress.set(15);

        // =====================================================================
        // Programming session and unlock
        // =====================================================================

        self.pace(cancel, "programming session").await?;
        client
            .start_session(DiagnosticSession::Programming, AddressingMode::Physical, false)
            .await
            .map_err(|e| OtaError::step("programming session", e))?;
        progress.set(18);

        info!("Waiting for the bootloader to come up");
        tokio::time::sleep(plan.programming_settle).await;
        progress.set(21);

        self.pace(cancel, "security access").await?;
        client
            .unlock(self.security_level)
            .await
            .map_err(|e| OtaError::step("security access", e))?;
        progress.set(24);
        self.events.log(
            LogLevel::Info,
            format!("Security access granted at level 0x{:02X}", self.security_level),
        );

        self.pace(cancel, "fingerprint").await?;
        let fingerprint = fingerprint_payload(Local::now().date_naive(), &plan.tester_signature);
        client
            .write_data_by_id(plan.fingerprint_did, &fingerprint)
            .await
            .map_err(|e| OtaError::step("fingerprint", e))?;
        progress.set(27);

        // =====================================================================
        // Erase and download
        // =====================================================================

        self.pace(cancel, "erase memory").await?;
        for (address, size) in plan.sections_for(image.len()) {
            let mut args = Vec::with_capacity(8);
            args.extend_from_slice(&address.to_be_bytes());
            args.extend_from_slice(&size.to_be_bytes());
            client
                .start_routine(plan.erase_routine, &args)
                .await
                .map_err(|e| OtaError::step("erase memory", e))?;
            self.events.log(
                LogLevel::Info,
                format!("Erased section 0x{address:08X} ({size} bytes)"),
            );
        }
        progress.set(30);

        self.pace(cancel, "request download").await?;
        client
            .request_download(plan.base_address, image.len() as u32)
            .await
            .map_err(|e| OtaError::step("request download", e))?;
        progress.set(35);
        self.events.log(
            LogLevel::Info,
            format!(
                "Download window open at 0x{:08X} for {} bytes",
                plan.base_address,
                image.len()
            ),
        );

        self.pace(cancel, "data transfer").await?;
        let total = image.len().div_ceil(plan.block_size);
        for (index, block) in image.chunks(plan.block_size).enumerate() {
            if cancel.is_cancelled() {
                return Err(OtaError::Cancelled {
                    step: "data transfer",
                });
            }
            let counter = plan.block_counter(index);
            client
                .transfer_data(counter, block)
                .await
                .map_err(|e| OtaError::step("data transfer", e))?;
            debug!(block = index + 1, total, counter, "Block transferred");
            progress.set(transfer_progress(index + 1, total));
        }
        self.events
            .log(LogLevel::Info, format!("Transferred {total} blocks"));

        self.pace(cancel, "transfer exit").await?;
        client
            .request_transfer_exit()
            .await
            .map_err(|e| OtaError::step("transfer exit", e))?;
        progress.set(70);

        // =====================================================================
        // Verification and restart
        // =====================================================================

        self.pace(cancel, "integrity check").await?;
        client
            .start_routine(plan.integrity_routine, &[])
            .await
            .map_err(|e| OtaError::step("integrity check", e))?;
        progress.set(83);
        self.events.log(LogLevel::Info, "Memory integrity verified");

        self.pace(cancel, "compatibility check").await?;
        client
            .start_routine(plan.compatibility_routine, &[])
            .await
            .map_err(|e| OtaError::step("compatibility check", e))?;
        progress.set(86);
        self.events
            .log(LogLevel::Info, "Program compatibility verified");

        self.pace(cancel, "ecu reset").await?;
        client
            .ecu_reset(reset_type::HARD_RESET)
            .await
            .map_err(|e| OtaError::step("ecu reset", e))?;
        progress.set(89);

        info!("Waiting for the ECU to restart");
        tokio::time::sleep(plan.reset_settle).await;
        progress.set(92);

        self.pace(cancel, "default session").await?;
        client
            .start_session(DiagnosticSession::Default, AddressingMode::Functional, true)
            .await
            .map_err(|e| OtaError::step("default session", e))?;
        progress.set(95);

        self.pace(cancel, "clear dtcs").await?;
        client
            .clear_all_dtc()
            .await
            .map_err(|e| OtaError::step("clear dtcs", e))?;
        progress.set(100);
        self.events.log(LogLevel::Info, "DTC memory cleared");

        Ok(())
    }

    /// Two raw wake-up frames pull the ECU out of low power before any
    /// diagnostic traffic.
    async fn wake_ecu(&self) -> Result<(), OtaError> {
        let frame = CanFrame::padded(self.plan.wakeup_id, &[0x02]);
        self.events.log(
            LogLevel::Info,
            format!("Waking ECU on 0x{:03X}", self.plan.wakeup_id),
        );
        let channel = self.client.channel();
        channel
            .send_raw(frame)
            .await
            .map_err(|e| OtaError::step("wake-up", e.into()))?;
        tokio::time::sleep(self.plan.wakeup_gap).await;
        channel
            .send_raw(frame)
            .await
            .map_err(|e| OtaError::step("wake-up", e.into()))?;
        Ok(())
    }

    /// Cancellation gate plus the fixed pause between steps.
    async fn pace(&self, cancel: &CancelFlag, next: &'static str) -> Result<(), OtaError> {
        if cancel.is_cancelled() {
            return Err(OtaError::Cancelled { step: next });
        }
        tokio::time::sleep(self.plan.step_delay).await;
        Ok(())
    }
}

/// Publishes progress percentages, clamped so the reported value never
/// moves backwards.
struct ProgressReporter<'a> {
    events: &'a EventBus,
    last: u8,
}

impl<'a> ProgressReporter<'a> {
    fn new(events: &'a EventBus) -> Self {
        Self { events, last: 0 }
    }

    fn set(&mut self, percent: u8) {
        let clamped = percent.clamp(self.last, 100);
        self.last = clamped;
        self.events.progress(clamped);
    }
}

/// Percentage for `done` of `total` transfer blocks, mapping the transfer
/// phase onto the 35 to 70 range.
fn transfer_progress(done: usize, total: usize) -> u8 {
    (35 + 35 * done / total.max(1)) as u8
}
