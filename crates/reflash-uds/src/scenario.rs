//! Automated diagnostic regression scenario
//!
//! [`ScenarioRunner`] repeats a fixed smoke sequence against the ECU:
//! default session, extended session, identification read, security
//! handshake. The handshake deliberately sends the configured probe key
//! verbatim when one is present, so the log shows how the ECU treats an
//! unexpected key; without a probe key the key is derived from the seed.
//! A round count below zero repeats until the run is stopped.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, instrument};

use crate::config::{parse_hex_id_u16, ClientConfig, ConfigError, SecurityAlgorithm};
use crate::event::{EventBus, LogLevel};
use crate::security;
use crate::session::{AddressingMode, DiagnosticSession};
use crate::uds::{UdsClient, UdsError};
use crate::worker::CancelFlag;

const TOTAL_STEPS: u32 = 4;

/// Errors ending a scenario run.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("Step '{step}' failed: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: UdsError,
    },
}

impl ScenarioError {
    fn step(step: &'static str, source: UdsError) -> Self {
        Self::Step { step, source }
    }
}

/// Runs the regression sequence and publishes progress per step.
pub struct ScenarioRunner {
    client: Arc<UdsClient>,
    algorithm: SecurityAlgorithm,
    identification_did: u16,
    security_level: u8,
    probe_key: Vec<u8>,
    repeat_count: i32,
    step_delay: Duration,
    events: EventBus,
}

impl ScenarioRunner {
    pub fn new(client: Arc<UdsClient>, config: &ClientConfig) -> Result<Self, ConfigError> {
        let events = client.channel().events().clone();
        Ok(Self {
            client,
            algorithm: config.security.algorithm,
            identification_did: parse_hex_id_u16(&config.scenario.identification_did)?,
            security_level: config.scenario.security_level,
            probe_key: config.scenario.probe_key.clone(),
            repeat_count: config.scenario.repeat_count,
            step_delay: Duration::from_millis(config.scenario.step_delay_ms),
            events,
        })
    }

    /// Run the configured number of rounds, or until `cancel` fires for a
    /// negative round count. Returns the number of completed rounds.
    ///
    /// Progress restarts from zero each round; 100 is published when the
    /// run ends, stop requests included.
    #[instrument(skip(self, cancel))]
    pub async fn run(&self, cancel: &CancelFlag) -> Result<u32, ScenarioError> {
        let result = self.execute(cancel).await;
        self.events.progress(100);
        match &result {
            Ok(rounds) => self
                .events
                .log(LogLevel::Info, format!("Scenario finished after {rounds} round(s)")),
            Err(e) => self
                .events
                .log(LogLevel::Error, format!("Scenario aborted: {e}")),
        }
        result
    }

    async fn execute(&self, cancel: &CancelFlag) -> Result<u32, ScenarioError> {
        let mut completed: u32 = 0;
        loop {
            if self.repeat_count >= 0 && completed >= self.repeat_count as u32 {
                break;
            }
            if cancel.is_cancelled() {
                info!(completed, "Scenario stopped");
                break;
            }

            let round = completed + 1;
            self.events
                .log(LogLevel::Info, format!("Scenario round {round} starting"));
            if !self.run_round(cancel).await? {
                info!(round, "Scenario stopped mid-round");
                break;
            }
            completed = round;
            self.events
                .log(LogLevel::Info, format!("Scenario round {round} complete"));
        }
        Ok(completed)
    }

    /// One full round. Returns `Ok(false)` when a stop request interrupted
    /// the round before it finished.
    async fn run_round(&self, cancel: &CancelFlag) -> Result<bool, ScenarioError> {
        if !self.gate(cancel).await {
            return Ok(false);
        }
        self.client
            .start_session(DiagnosticSession::Default, AddressingMode::Physical, false)
            .await
            .map_err(|e| ScenarioError::step("default session", e))?;
        self.step_done(1);

        if !self.gate(cancel).await {
            return Ok(false);
        }
        self.client
            .start_session(DiagnosticSession::Extended, AddressingMode::Physical, false)
            .await
            .map_err(|e| ScenarioError::step("extended session", e))?;
        self.step_done(2);

        if !self.gate(cancel).await {
            return Ok(false);
        }
        let payload = self
            .client
            .read_data_by_id(self.identification_did)
            .await
            .map_err(|e| ScenarioError::step("identification read", e))?;
        self.events.log(
            LogLevel::Info,
            format!(
                "DID 0x{:04X}: {}",
                self.identification_did,
                hex::encode_upper(&payload)
            ),
        );
        self.step_done(3);

        if !self.gate(cancel).await {
            return Ok(false);
        }
        self.security_handshake().await?;
        self.step_done(4);

        Ok(true)
    }

    /// Seed request followed by the probe key, or a derived key when no
    /// probe key is configured. A rejected seed request ends the round
    /// before any key leaves the tester.
    async fn security_handshake(&self) -> Result<(), ScenarioError> {
        let seed = self
            .client
            .security_access_request_seed(self.security_level)
            .await
            .map_err(|e| ScenarioError::step("security access", e))?;

        let key = if self.probe_key.is_empty() {
            security::derive_key(self.algorithm, &seed)
        } else {
            self.probe_key.clone()
        };
        self.client
            .security_access_send_key(self.security_level, &key)
            .await
            .map_err(|e| ScenarioError::step("security access", e))?;
        self.events
            .log(LogLevel::Info, "Security handshake accepted");
        Ok(())
    }

    async fn gate(&self, cancel: &CancelFlag) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        if !self.step_delay.is_zero() {
            tokio::time::sleep(self.step_delay).await;
        }
        true
    }

    fn step_done(&self, step: u32) {
        self.events.progress((step * 100 / TOTAL_STEPS) as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AddressingConfig, TimingConfig};
    use crate::event::ClientEvent;
    use crate::frame::CanFrame;
    use crate::session::{Addressing, UdsChannel};
    use crate::transport::mock::MockCanAdapter;
    use crate::uds::NegativeResponseCode;

    fn test_runner(config: &ClientConfig) -> (Arc<MockCanAdapter>, ScenarioRunner) {
        let adapter = Arc::new(MockCanAdapter::new());
        let addressing = Addressing::from_config(&AddressingConfig::default()).unwrap();
        let channel = UdsChannel::new(
            adapter.clone(),
            addressing,
            &TimingConfig::default(),
            EventBus::new(),
        );
        let client = Arc::new(UdsClient::new(channel, config.security.algorithm));
        let runner = ScenarioRunner::new(client, config).unwrap();
        (adapter, runner)
    }

    fn fast_config() -> ClientConfig {
        let mut config = ClientConfig::default();
        config.scenario.step_delay_ms = 0;
        config
    }

    fn script_happy_path(adapter: &MockCanAdapter) {
        adapter.add_rule(
            0x713,
            &[0x02, 0x10, 0x01],
            vec![CanFrame::padded(0x71B, &[0x02, 0x50, 0x01])],
        );
        adapter.add_rule(
            0x713,
            &[0x02, 0x10, 0x03],
            vec![CanFrame::padded(0x71B, &[0x02, 0x50, 0x03])],
        );
        adapter.add_rule(
            0x713,
            &[0x03, 0x22, 0xF1, 0x90],
            vec![CanFrame::padded(0x71B, &[0x07, 0x62, 0xF1, 0x90, b'E', b'C', b'U', b'1'])],
        );
        adapter.add_rule(
            0x713,
            &[0x02, 0x27, 0x01],
            vec![CanFrame::padded(0x71B, &[0x06, 0x67, 0x01, 0x11, 0x22, 0x33, 0x44])],
        );
        adapter.add_rule(
            0x713,
            &[0x06, 0x27, 0x02],
            vec![CanFrame::padded(0x71B, &[0x02, 0x67, 0x02])],
        );
    }

    #[tokio::test]
    async fn test_single_round_sends_probe_key_verbatim() {
        let (adapter, runner) = test_runner(&fast_config());
        script_happy_path(&adapter);

        let rounds = runner.run(&CancelFlag::new()).await.unwrap();
        assert_eq!(rounds, 1);

        let key_frames: Vec<_> = adapter
            .sent_frames()
            .into_iter()
            .filter(|f| f.data().starts_with(&[0x06, 0x27, 0x02]))
            .collect();
        assert_eq!(key_frames.len(), 1);
        assert_eq!(
            key_frames[0].data(),
            &[0x06, 0x27, 0x02, 0xA5, 0xA5, 0xA5, 0xA5, 0x00]
        );
    }

    #[tokio::test]
    async fn test_empty_probe_key_derives_from_seed() {
        let mut config = fast_config();
        config.scenario.probe_key = Vec::new();
        let (adapter, runner) = test_runner(&config);
        script_happy_path(&adapter);

        runner.run(&CancelFlag::new()).await.unwrap();

        let expected = security::derive_key(SecurityAlgorithm::Cfb, &[0x11, 0x22, 0x33, 0x44]);
        let key_frame = adapter
            .sent_frames()
            .into_iter()
            .find(|f| f.data().starts_with(&[0x06, 0x27, 0x02]))
            .unwrap();
        assert_eq!(&key_frame.data()[3..7], expected.as_slice());
    }

    #[tokio::test]
    async fn test_negative_seed_stops_run_without_key_send() {
        let (adapter, runner) = test_runner(&fast_config());
        adapter.add_rule(
            0x713,
            &[0x02, 0x10, 0x01],
            vec![CanFrame::padded(0x71B, &[0x02, 0x50, 0x01])],
        );
        adapter.add_rule(
            0x713,
            &[0x02, 0x10, 0x03],
            vec![CanFrame::padded(0x71B, &[0x02, 0x50, 0x03])],
        );
        adapter.add_rule(
            0x713,
            &[0x03, 0x22, 0xF1, 0x90],
            vec![CanFrame::padded(0x71B, &[0x04, 0x62, 0xF1, 0x90, 0x01])],
        );
        adapter.add_rule(
            0x713,
            &[0x02, 0x27, 0x01],
            vec![CanFrame::padded(0x71B, &[0x03, 0x7F, 0x27, 0x35])],
        );

        let mut events = runner.events.subscribe();
        let result = runner.run(&CancelFlag::new()).await;

        match result {
            Err(ScenarioError::Step { step, source }) => {
                assert_eq!(step, "security access");
                assert_eq!(source.nrc(), Some(NegativeResponseCode::InvalidKey));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        // No key frame followed the rejected seed request.
        assert!(!adapter
            .sent_frames()
            .iter()
            .any(|f| f.data().starts_with(&[0x06, 0x27, 0x02])));

        // The run still closes with progress 100.
        let mut last = None;
        while let Ok(event) = events.try_recv() {
            if let ClientEvent::Progress { percent } = event {
                last = Some(percent);
            }
        }
        assert_eq!(last, Some(100));
    }

    #[tokio::test]
    async fn test_repeat_count_runs_multiple_rounds() {
        let mut config = fast_config();
        config.scenario.repeat_count = 3;
        let (adapter, runner) = test_runner(&config);
        script_happy_path(&adapter);

        let rounds = runner.run(&CancelFlag::new()).await.unwrap();
        assert_eq!(rounds, 3);

        let session_requests = adapter
            .sent_frames()
            .iter()
            .filter(|f| f.data().starts_with(&[0x02, 0x10, 0x01]))
            .count();
        assert_eq!(session_requests, 3);
    }

    #[tokio::test]
    async fn test_cancelled_run_completes_no_rounds() {
        let mut config = fast_config();
        config.scenario.repeat_count = -1;
        let (adapter, runner) = test_runner(&config);

        let cancel = CancelFlag::new();
        cancel.cancel();
        let rounds = runner.run(&cancel).await.unwrap();

        assert_eq!(rounds, 0);
        assert!(adapter.sent_frames().is_empty());
    }
}
