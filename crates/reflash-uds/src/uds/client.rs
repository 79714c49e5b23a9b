//! UDS service layer
//!
//! One method per diagnostic service, each building the request bytes,
//! running the round trip through the channel and validating the
//! response shape. The client also tracks the active diagnostic
//! session and the security access state; a session change always
//! drops a previous unlock.

use parking_lot::RwLock;
use tracing::{debug, info};

use super::{
    comm_control, dtc_group, service_id, UdsError, SUPPRESS_POSITIVE_RESPONSE,
};
use crate::config::SecurityAlgorithm;
use crate::security;
use crate::session::{
    AddressingMode, DiagnosticSession, ResponsePolicy, SecurityState, UdsChannel,
};

/// Stateful UDS client for one ECU connection.
pub struct UdsClient {
    channel: UdsChannel,
    algorithm: SecurityAlgorithm,
    session: RwLock<DiagnosticSession>,
    security: RwLock<SecurityState>,
}

impl UdsClient {
    pub fn new(channel: UdsChannel, algorithm: SecurityAlgorithm) -> Self {
        Self {
            channel,
            algorithm,
            session: RwLock::new(DiagnosticSession::default()),
            security: RwLock::new(SecurityState::default()),
        }
    }

    /// The currently active diagnostic session.
    pub fn session(&self) -> DiagnosticSession {
        *self.session.read()
    }

    /// The current security access state.
    pub fn security(&self) -> SecurityState {
        self.security.read().clone()
    }

    pub fn channel(&self) -> &UdsChannel {
        &self.channel
    }

    /// DiagnosticSessionControl (0x10)
    ///
    /// The positive response must echo the full sub-function byte,
    /// suppress bit included. Session and security state only change
    /// after a validated response.
    pub async fn start_session(
        &self,
        session: DiagnosticSession,
        mode: AddressingMode,
        suppress: bool,
    ) -> Result<(), UdsError> {
        let sub = if suppress {
            session.sub_function() | SUPPRESS_POSITIVE_RESPONSE
        } else {
            session.sub_function()
        };
        let request = vec![service_id::DIAGNOSTIC_SESSION_CONTROL, sub];
        let response = self
            .channel
            .request(mode, &request, ResponsePolicy::RequirePositive)
            .await?;

        if response.get(1).copied() != Some(sub) {
            return Err(UdsError::InvalidResponse(format!(
                "session control echoed 0x{:02X?}, expected 0x{sub:02X}",
                response.get(1)
            )));
        }

        *self.session.write() = session;
        *self.security.write() = SecurityState::Locked;
        info!(%session, %mode, "Diagnostic session active");
        Ok(())
    }

    /// SecurityAccess (0x27), seed request.
    ///
    /// The sub-function is the security level itself; the response
    /// echoes it ahead of the seed bytes.
    pub async fn security_access_request_seed(&self, level: u8) -> Result<Vec<u8>, UdsError> {
        let request = vec![service_id::SECURITY_ACCESS, level];
        let response = self
            .channel
            .request(
                AddressingMode::Physical,
                &request,
                ResponsePolicy::RequirePositive,
            )
            .await?;

        if response.get(1).copied() != Some(level) {
            return Err(UdsError::InvalidResponse(format!(
                "seed response echoed level 0x{:02X?}, expected 0x{level:02X}",
                response.get(1)
            )));
        }

        let seed = response[2..].to_vec();
        debug!(level = format!("0x{level:02X}"), seed = ?seed, "Seed received");
        *self.security.write() = SecurityState::SeedIssued {
            level,
            seed: seed.clone(),
        };
        Ok(seed)
    }

    /// SecurityAccess (0x27), key submission at `level + 1`.
    ///
    /// Some bootloaders echo the seed sub-function instead of the key
    /// sub-function, so the echo is compared with the low bit masked.
    pub async fn security_access_send_key(&self, level: u8, key: &[u8]) -> Result<(), UdsError> {
        let sub = level.wrapping_add(1);
        let mut request = vec![service_id::SECURITY_ACCESS, sub];
        request.extend_from_slice(key);
        let response = self
            .channel
            .request(
                AddressingMode::Physical,
                &request,
                ResponsePolicy::RequirePositive,
            )
            .await?;

        match response.get(1) {
            Some(echo) if echo & 0xFE == sub & 0xFE => {}
            other => {
                return Err(UdsError::InvalidResponse(format!(
                    "key response echoed 0x{other:02X?}, expected 0x{sub:02X}"
                )));
            }
        }

        *self.security.write() = SecurityState::Unlocked { level };
        info!(level = format!("0x{level:02X}"), "Security access granted");
        Ok(())
    }

    /// Full seed/key handshake at the given level.
    ///
    /// An all-zero seed means the level is already unlocked and no key
    /// is derived or sent.
    pub async fn unlock(&self, level: u8) -> Result<(), UdsError> {
        let seed = self.security_access_request_seed(level).await?;

        if security::is_unlocked_seed(&seed) {
            info!(
                level = format!("0x{level:02X}"),
                "ECU reports level already unlocked"
            );
            *self.security.write() = SecurityState::Unlocked { level };
            return Ok(());
        }

        let key = security::derive_key(self.algorithm, &seed);
        self.security_access_send_key(level, &key).await
    }

    /// ReadDataByIdentifier (0x22); returns the record payload.
    pub async fn read_data_by_id(&self, did: u16) -> Result<Vec<u8>, UdsError> {
        let mut request = vec![service_id::READ_DATA_BY_ID];
        request.extend_from_slice(&did.to_be_bytes());
        let response = self
            .channel
            .request(
                AddressingMode::Physical,
                &request,
                ResponsePolicy::RequirePositive,
            )
            .await?;

        if response.len() < 3 || response[1..3] != did.to_be_bytes() {
            return Err(UdsError::InvalidResponse(format!(
                "read response does not echo DID 0x{did:04X}"
            )));
        }
        Ok(response[3..].to_vec())
    }

    /// WriteDataByIdentifier (0x2E)
    pub async fn write_data_by_id(&self, did: u16, data: &[u8]) -> Result<(), UdsError> {
        let mut request = vec![service_id::WRITE_DATA_BY_ID];
        request.extend_from_slice(&did.to_be_bytes());
        request.extend_from_slice(data);
        let response = self
            .channel
            .request(
                AddressingMode::Physical,
                &request,
                ResponsePolicy::RequirePositive,
            )
            .await?;

        if response.len() < 3 || response[1..3] != did.to_be_bytes() {
            return Err(UdsError::InvalidResponse(format!(
                "write response does not echo DID 0x{did:04X}"
            )));
        }
        Ok(())
    }

    /// RoutineControl (0x31) with sub-function startRoutine.
    ///
    /// A status record is optional; when present its first byte must
    /// be zero or the routine counts as failed. The bytes after the
    /// routine ID echo are returned to the caller.
    pub async fn start_routine(&self, rid: u16, args: &[u8]) -> Result<Vec<u8>, UdsError> {
        let mut request = vec![
            service_id::ROUTINE_CONTROL,
            super::routine_sub_function::START_ROUTINE,
        ];
        request.extend_from_slice(&rid.to_be_bytes());
        request.extend_from_slice(args);
        let response = self
            .channel
            .request(
                AddressingMode::Physical,
                &request,
                ResponsePolicy::RequirePositive,
            )
            .await?;

        if response.get(1).copied() != Some(super::routine_sub_function::START_ROUTINE)
            || response.len() < 4
            || response[2..4] != rid.to_be_bytes()
        {
            return Err(UdsError::InvalidResponse(format!(
                "routine response does not echo routine 0x{rid:04X}"
            )));
        }

        if let Some(&status) = response.get(4) {
            if status != 0x00 {
                return Err(UdsError::RoutineFailed { rid, status });
            }
        }
        Ok(response[4..].to_vec())
    }

    /// RequestDownload (0x34)
    ///
    /// Uses the address-and-length format 0x44 with 4-byte fields.
    /// Only allowed in the programming session; several supported
    /// bootloaders accept the request without ever sending a positive
    /// response, so silence counts as acceptance here.
    pub async fn request_download(&self, address: u32, size: u32) -> Result<(), UdsError> {
        if self.session() != DiagnosticSession::Programming {
            return Err(UdsError::Precondition(
                "download requires an active programming session".to_string(),
            ));
        }

        let mut request = vec![service_id::REQUEST_DOWNLOAD, 0x44];
        request.extend_from_slice(&address.to_be_bytes());
        request.extend_from_slice(&size.to_be_bytes());
        self.channel
            .request(
                AddressingMode::Physical,
                &request,
                ResponsePolicy::AbsenceOfNegative,
            )
            .await?;
        Ok(())
    }

    /// TransferData (0x36)
    pub async fn transfer_data(&self, counter: u8, chunk: &[u8]) -> Result<(), UdsError> {
        let mut request = vec![service_id::TRANSFER_DATA, counter];
        request.extend_from_slice(chunk);
        let response = self
            .channel
            .request(
                AddressingMode::Physical,
                &request,
                ResponsePolicy::RequirePositive,
            )
            .await?;

        if response.get(1).copied() != Some(counter) {
            return Err(UdsError::InvalidResponse(format!(
                "transfer response echoed counter 0x{:02X?}, expected 0x{counter:02X}",
                response.get(1)
            )));
        }
        Ok(())
    }

    /// RequestTransferExit (0x37); silence counts as acceptance.
    pub async fn request_transfer_exit(&self) -> Result<(), UdsError> {
        let request = vec![service_id::REQUEST_TRANSFER_EXIT];
        self.channel
            .request(
                AddressingMode::Physical,
                &request,
                ResponsePolicy::AbsenceOfNegative,
            )
            .await?;
        Ok(())
    }

    /// CommunicationControl (0x28)
    pub async fn communication_control(
        &self,
        control: u8,
        comm_type: u8,
        mode: AddressingMode,
        suppress: bool,
    ) -> Result<(), UdsError> {
        let sub = if suppress {
            control | SUPPRESS_POSITIVE_RESPONSE
        } else {
            control
        };
        let request = vec![service_id::COMMUNICATION_CONTROL, sub, comm_type];
        let response = self
            .channel
            .request(mode, &request, ResponsePolicy::RequirePositive)
            .await?;

        if response.get(1).copied() != Some(sub) {
            return Err(UdsError::InvalidResponse(format!(
                "communication control echoed 0x{:02X?}, expected 0x{sub:02X}",
                response.get(1)
            )));
        }
        Ok(())
    }

    /// Disable normal and network management traffic bus-wide.
    pub async fn disable_normal_communication(&self) -> Result<(), UdsError> {
        self.communication_control(
            comm_control::DISABLE_RX_AND_TX,
            comm_control::NORMAL_AND_NM_MESSAGES,
            AddressingMode::Functional,
            true,
        )
        .await
    }

    /// ControlDTCSetting (0x85)
    pub async fn control_dtc_setting(
        &self,
        setting: u8,
        mode: AddressingMode,
        suppress: bool,
    ) -> Result<(), UdsError> {
        let sub = if suppress {
            setting | SUPPRESS_POSITIVE_RESPONSE
        } else {
            setting
        };
        let request = vec![service_id::CONTROL_DTC_SETTING, sub];
        let response = self
            .channel
            .request(mode, &request, ResponsePolicy::RequirePositive)
            .await?;

        if response.get(1).copied() != Some(sub) {
            return Err(UdsError::InvalidResponse(format!(
                "DTC setting echoed 0x{:02X?}, expected 0x{sub:02X}",
                response.get(1)
            )));
        }
        Ok(())
    }

    /// ECUReset (0x11)
    pub async fn ecu_reset(&self, reset: u8) -> Result<(), UdsError> {
        let request = vec![service_id::ECU_RESET, reset];
        let response = self
            .channel
            .request(
                AddressingMode::Physical,
                &request,
                ResponsePolicy::RequirePositive,
            )
            .await?;

        if response.get(1).copied() != Some(reset) {
            return Err(UdsError::InvalidResponse(format!(
                "reset response echoed 0x{:02X?}, expected 0x{reset:02X}",
                response.get(1)
            )));
        }
        Ok(())
    }

    /// ClearDiagnosticInformation (0x14) for all DTC groups, broadcast
    /// so every ECU on the bus clears its memory.
    pub async fn clear_all_dtc(&self) -> Result<(), UdsError> {
        let mut request = vec![service_id::CLEAR_DIAGNOSTIC_INFO];
        request.extend_from_slice(&dtc_group::ALL);
        self.channel
            .request(
                AddressingMode::Functional,
                &request,
                ResponsePolicy::RequirePositive,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{AddressingConfig, TimingConfig};
    use crate::event::EventBus;
    use crate::frame::CanFrame;
    use crate::session::Addressing;
    use crate::transport::mock::MockCanAdapter;
    use crate::uds::NegativeResponseCode;

    fn test_client() -> (Arc<MockCanAdapter>, UdsClient) {
        let mock = Arc::new(MockCanAdapter::new());
        let addressing = Addressing::from_config(&AddressingConfig::default()).unwrap();
        let timing = TimingConfig {
            response_timeout_ms: 100,
            routine_timeout_ms: 200,
            inter_frame_delay_ms: 0,
        };
        let channel = UdsChannel::new(mock.clone(), addressing, &timing, EventBus::new());
        (mock, UdsClient::new(channel, SecurityAlgorithm::Cfb))
    }

    fn positive(data: &[u8]) -> Vec<CanFrame> {
        vec![CanFrame::new(0x71B, data)]
    }

    #[tokio::test]
    async fn test_start_session_updates_state() {
        let (mock, client) = test_client();
        mock.add_rule(0x713, &[0x02, 0x10, 0x03], positive(&[0x02, 0x50, 0x03]));

        client
            .start_session(DiagnosticSession::Extended, AddressingMode::Physical, false)
            .await
            .unwrap();
        assert_eq!(client.session(), DiagnosticSession::Extended);
    }

    #[tokio::test]
    async fn test_session_change_drops_unlock() {
        let (mock, client) = test_client();
        mock.add_rule(
            0x713,
            &[0x02, 0x27, 0x11],
            positive(&[0x06, 0x67, 0x11, 0x10, 0x20, 0x30, 0x40]),
        );
        mock.add_rule(0x713, &[0x06, 0x27, 0x12], positive(&[0x02, 0x67, 0x12]));
        mock.add_rule(0x713, &[0x02, 0x10, 0x03], positive(&[0x02, 0x50, 0x03]));

        client.unlock(0x11).await.unwrap();
        assert!(client.security().is_unlocked());

        client
            .start_session(DiagnosticSession::Extended, AddressingMode::Physical, false)
            .await
            .unwrap();
        assert_eq!(client.security(), SecurityState::Locked);
    }

    #[tokio::test]
    async fn test_session_echo_mismatch_rejected() {
        let (mock, client) = test_client();
        mock.add_rule(0x713, &[0x02, 0x10, 0x03], positive(&[0x02, 0x50, 0x01]));

        let err = client
            .start_session(DiagnosticSession::Extended, AddressingMode::Physical, false)
            .await
            .unwrap_err();
        assert!(matches!(err, UdsError::InvalidResponse(_)));
        assert_eq!(client.session(), DiagnosticSession::Default);
    }

    #[tokio::test]
    async fn test_suppressed_functional_session_echoes_full_sub() {
        let (mock, client) = test_client();
        mock.add_rule(
            0x7DF,
            &[0x02, 0x10, 0x83],
            vec![CanFrame::new(0x7E8, &[0x02, 0x50, 0x83])],
        );

        client
            .start_session(DiagnosticSession::Extended, AddressingMode::Functional, true)
            .await
            .unwrap();
        assert_eq!(client.session(), DiagnosticSession::Extended);
    }

    #[tokio::test]
    async fn test_zero_seed_skips_key_exchange() {
        let (mock, client) = test_client();
        mock.add_rule(
            0x713,
            &[0x02, 0x27, 0x11],
            positive(&[0x06, 0x67, 0x11, 0x00, 0x00, 0x00, 0x00]),
        );

        client.unlock(0x11).await.unwrap();
        assert!(client.security().is_unlocked());

        let key_frames: Vec<_> = mock
            .sent_frames()
            .into_iter()
            .filter(|f| f.data()[1] == 0x27 && f.data()[2] == 0x12)
            .collect();
        assert!(key_frames.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_key_leaves_state_locked() {
        let (mock, client) = test_client();
        mock.add_rule(
            0x713,
            &[0x02, 0x27, 0x11],
            positive(&[0x06, 0x67, 0x11, 0x10, 0x20, 0x30, 0x40]),
        );
        mock.add_rule(
            0x713,
            &[0x06, 0x27, 0x12],
            positive(&[0x03, 0x7F, 0x27, 0x35]),
        );

        let err = client.unlock(0x11).await.unwrap_err();
        assert_eq!(err.nrc(), Some(NegativeResponseCode::InvalidKey));
        assert!(!client.security().is_unlocked());
    }

    #[tokio::test]
    async fn test_read_data_by_id_returns_payload() {
        let (mock, client) = test_client();
        mock.add_rule(
            0x713,
            &[0x03, 0x22, 0xF1, 0x90],
            positive(&[0x06, 0x62, 0xF1, 0x90, 0x56, 0x49, 0x4E]),
        );

        let payload = client.read_data_by_id(0xF190).await.unwrap();
        assert_eq!(payload, b"VIN");
    }

    #[tokio::test]
    async fn test_read_data_by_id_rejects_wrong_did_echo() {
        let (mock, client) = test_client();
        mock.add_rule(
            0x713,
            &[0x03, 0x22, 0xF1, 0x90],
            positive(&[0x04, 0x62, 0xF1, 0x91, 0x00]),
        );

        let err = client.read_data_by_id(0xF190).await.unwrap_err();
        assert!(matches!(err, UdsError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_routine_with_zero_status_succeeds() {
        let (mock, client) = test_client();
        mock.add_rule(
            0x713,
            &[0x04, 0x31, 0x01, 0xFF, 0x00],
            positive(&[0x05, 0x71, 0x01, 0xFF, 0x00, 0x00]),
        );

        let record = client.start_routine(0xFF00, &[]).await.unwrap();
        assert_eq!(record, vec![0x00]);
    }

    #[tokio::test]
    async fn test_routine_with_nonzero_status_fails() {
        let (mock, client) = test_client();
        mock.add_rule(
            0x713,
            &[0x04, 0x31, 0x01, 0x02, 0x01],
            positive(&[0x05, 0x71, 0x01, 0x02, 0x01, 0x07]),
        );

        let err = client.start_routine(0x0201, &[]).await.unwrap_err();
        assert!(matches!(
            err,
            UdsError::RoutineFailed {
                rid: 0x0201,
                status: 0x07,
            }
        ));
    }

    #[tokio::test]
    async fn test_routine_without_status_record_succeeds() {
        let (mock, client) = test_client();
        mock.add_rule(
            0x713,
            &[0x04, 0x31, 0x01, 0xFF, 0x00],
            positive(&[0x04, 0x71, 0x01, 0xFF, 0x00]),
        );

        let record = client.start_routine(0xFF00, &[]).await.unwrap();
        assert!(record.is_empty());
    }

    #[tokio::test]
    async fn test_download_outside_programming_session_blocked() {
        let (mock, client) = test_client();

        let err = client.request_download(0x0800_0000, 0x1000).await.unwrap_err();
        assert!(matches!(err, UdsError::Precondition(_)));
        assert!(mock.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn test_download_accepts_silence_in_programming_session() {
        let (mock, client) = test_client();
        mock.add_rule(0x713, &[0x02, 0x10, 0x02], positive(&[0x02, 0x50, 0x02]));

        client
            .start_session(
                DiagnosticSession::Programming,
                AddressingMode::Physical,
                false,
            )
            .await
            .unwrap();
        client.request_download(0x0800_0000, 0x3000).await.unwrap();

        let sent = mock.sent_frames();
        // Session request plus the two frames of the download request.
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1].data()[..6], [0x10, 0x0A, 0x34, 0x44, 0x08, 0x00]);
        assert_eq!(sent[2].data()[..5], [0x21, 0x00, 0x00, 0x30, 0x00]);
    }

    #[tokio::test]
    async fn test_transfer_data_validates_counter_echo() {
        let (mock, client) = test_client();
        mock.add_rule(0x713, &[0x10], positive(&[0x02, 0x76, 0x06]));

        let chunk = vec![0xAB; 32];
        let err = client.transfer_data(0x05, &chunk).await.unwrap_err();
        assert!(matches!(err, UdsError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_clear_all_dtc_broadcast() {
        let (mock, client) = test_client();
        mock.add_rule(
            0x7DF,
            &[0x04, 0x14, 0xFF, 0xFF, 0xFF],
            vec![CanFrame::new(0x7E8, &[0x01, 0x54])],
        );

        client.clear_all_dtc().await.unwrap();
    }
}
