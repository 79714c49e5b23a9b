//! Request/response channel over a CAN adapter
//!
//! The channel owns the round-trip logic: segment a logical request,
//! put the frames on the bus, then collect and reassemble frames from
//! every ID the addressing scheme accepts until a decision is reached.
//!
//! A negative response on a physical exchange ends the wait at once.
//! On a functional broadcast a negative response only rules out one
//! responder, so the wait continues until a positive response or the
//! deadline. What a silent deadline means depends on the
//! [`ResponsePolicy`] of the request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use super::{Addressing, AddressingMode};
use crate::config::TimingConfig;
use crate::event::{Direction, EventBus};
use crate::frame::{segment, CanFrame, Reassembler, Reassembly};
use crate::transport::{CanAdapter, TransportError};
use crate::uds::{service_id, NegativeResponseCode, UdsError, POSITIVE_RESPONSE_OFFSET};

/// What the caller needs from the ECU before the deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponsePolicy {
    /// A positive response must arrive; silence is a timeout error.
    RequirePositive,
    /// Silence until the deadline counts as success. Used for services
    /// where some bootloaders skip the positive response entirely.
    AbsenceOfNegative,
}

enum Verdict {
    Positive,
    Negative(NegativeResponseCode),
    Unrelated,
}

/// Round-trip channel binding an adapter to an addressing scheme.
pub struct UdsChannel {
    bus: Arc<dyn CanAdapter>,
    addressing: Addressing,
    response_timeout: Duration,
    routine_timeout: Duration,
    inter_frame_delay: Duration,
    events: EventBus,
}

impl UdsChannel {
    pub fn new(
        bus: Arc<dyn CanAdapter>,
        addressing: Addressing,
        timing: &TimingConfig,
        events: EventBus,
    ) -> Self {
        let channel = Self {
            bus,
            addressing,
            response_timeout: Duration::from_millis(timing.response_timeout_ms),
            routine_timeout: Duration::from_millis(timing.routine_timeout_ms),
            inter_frame_delay: Duration::from_millis(timing.inter_frame_delay_ms),
            events,
        };
        channel.spawn_frame_monitor();
        channel
    }

    /// Republish every inbound frame as an Rx event, so subscribers see
    /// bus traffic even while no request is outstanding. The task ends
    /// when the adapter drops its side of the broadcast. Without a
    /// running runtime there is nobody to watch; the monitor is skipped.
    fn spawn_frame_monitor(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let mut rx = self.bus.subscribe();
        let events = self.events.clone();
        handle.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(incoming) => events.frame(Direction::Rx, incoming.frame),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Frame monitor lagged behind bus traffic");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub fn addressing(&self) -> &Addressing {
        &self.addressing
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Send one logical request and wait for the outcome.
    ///
    /// The deadline is picked per service: routine-class services get
    /// the longer routine timeout, everything else the response
    /// timeout.
    pub async fn request(
        &self,
        mode: AddressingMode,
        request: &[u8],
        policy: ResponsePolicy,
    ) -> Result<Vec<u8>, UdsError> {
        let service = *request
            .first()
            .ok_or_else(|| UdsError::InvalidResponse("empty request".to_string()))?;
        let timeout = self.timeout_for(service);

        // Subscribe before the first frame leaves so a fast responder
        // cannot slip in between send and listen.
        let mut rx = self.bus.subscribe();

        let frames = segment(self.addressing.request_id(mode), request)?;
        debug!(
            service = format!("0x{:02X}", service),
            %mode,
            frames = frames.len(),
            "Sending request"
        );
        for (index, frame) in frames.iter().enumerate() {
            if index > 0 && !self.inter_frame_delay.is_zero() {
                tokio::time::sleep(self.inter_frame_delay).await;
            }
            self.bus.send(*frame).await?;
            self.events.frame(Direction::Tx, *frame);
        }

        self.await_response(&mut rx, mode, service, timeout, policy)
            .await
    }

    /// Put a single raw frame on the bus without waiting for anything.
    pub async fn send_raw(&self, frame: CanFrame) -> Result<(), TransportError> {
        self.bus.send(frame).await?;
        self.events.frame(Direction::Tx, frame);
        Ok(())
    }

    fn timeout_for(&self, service: u8) -> Duration {
        match service {
            service_id::ROUTINE_CONTROL
            | service_id::COMMUNICATION_CONTROL
            | service_id::CONTROL_DTC_SETTING => self.routine_timeout,
            _ => self.response_timeout,
        }
    }

    async fn await_response(
        &self,
        rx: &mut broadcast::Receiver<crate::transport::IncomingFrame>,
        mode: AddressingMode,
        service: u8,
        timeout: Duration,
        policy: ResponsePolicy,
    ) -> Result<Vec<u8>, UdsError> {
        let expected_positive = service.wrapping_add(POSITIVE_RESPONSE_OFFSET);
        let deadline = Instant::now() + timeout;
        // One reassembler per responder so interleaved multi-frame
        // answers from different ECUs do not corrupt each other.
        let mut assemblers: HashMap<u32, Reassembler> = HashMap::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return match policy {
                    ResponsePolicy::AbsenceOfNegative => {
                        debug!(
                            service = format!("0x{:02X}", service),
                            "No negative response before deadline, treating as accepted"
                        );
                        Ok(Vec::new())
                    }
                    ResponsePolicy::RequirePositive => Err(UdsError::Timeout(timeout)),
                };
            }

            let incoming = match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(incoming)) => incoming,
                Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                    warn!(missed, "Receiver lagged behind bus traffic");
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(
                        TransportError::Receive("frame stream closed".to_string()).into(),
                    );
                }
                // Deadline is re-checked at the top of the loop.
                Err(_) => continue,
            };

            let frame = incoming.frame;
            if !self.addressing.accepts(mode, frame.id()) {
                trace!(%frame, "Ignoring frame from unexpected ID");
                continue;
            }

            let outcome = assemblers.entry(frame.id()).or_default().feed(&frame);
            let message = match outcome {
                Ok(Reassembly::Complete(message)) => message,
                Ok(Reassembly::Incomplete) => continue,
                Err(e) => {
                    warn!(%frame, error = %e, "Dropping undecodable frame");
                    assemblers.remove(&frame.id());
                    continue;
                }
            };

            match Self::classify(service, expected_positive, &message) {
                Verdict::Positive => return Ok(message),
                Verdict::Negative(nrc) => match mode {
                    AddressingMode::Physical => {
                        return Err(UdsError::NegativeResponse { service, nrc });
                    }
                    AddressingMode::Functional => {
                        // Another ECU may still answer the broadcast.
                        debug!(
                            id = format!("0x{:03X}", frame.id()),
                            %nrc,
                            "Negative response to functional request, still waiting"
                        );
                    }
                },
                Verdict::Unrelated => {
                    trace!(
                        id = format!("0x{:03X}", frame.id()),
                        "Ignoring unrelated message"
                    );
                }
            }
        }
    }

    fn classify(service: u8, expected_positive: u8, message: &[u8]) -> Verdict {
        match message.first().copied() {
            Some(sid) if sid == expected_positive => Verdict::Positive,
            Some(service_id::NEGATIVE_RESPONSE) if message.get(1).copied() == Some(service) => {
                let nrc = NegativeResponseCode::from(message.get(2).copied().unwrap_or(0x10));
                Verdict::Negative(nrc)
            }
            _ => Verdict::Unrelated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AddressingConfig;
    use crate::transport::mock::MockCanAdapter;

    fn test_timing() -> TimingConfig {
        TimingConfig {
            response_timeout_ms: 100,
            routine_timeout_ms: 200,
            inter_frame_delay_ms: 0,
        }
    }

    fn channel_with(mock: Arc<MockCanAdapter>) -> UdsChannel {
        let addressing = Addressing::from_config(&AddressingConfig::default()).unwrap();
        UdsChannel::new(mock, addressing, &test_timing(), EventBus::new())
    }

    #[tokio::test]
    async fn test_single_frame_round_trip() {
        let mock = Arc::new(MockCanAdapter::new());
        mock.add_rule(
            0x713,
            &[0x02, 0x10],
            vec![CanFrame::new(0x71B, &[0x02, 0x50, 0x03])],
        );
        let channel = channel_with(mock.clone());

        let response = channel
            .request(
                AddressingMode::Physical,
                &[0x10, 0x03],
                ResponsePolicy::RequirePositive,
            )
            .await
            .unwrap();
        assert_eq!(response, vec![0x50, 0x03]);

        let sent = mock.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id(), 0x713);
        assert_eq!(sent[0].data()[..3], [0x02, 0x10, 0x03]);
    }

    #[tokio::test]
    async fn test_multi_frame_response_reassembled() {
        let mock = Arc::new(MockCanAdapter::new());
        // 20-byte logical response split into FF + 2 CFs.
        mock.add_rule(
            0x713,
            &[0x03, 0x22, 0xF1, 0x90],
            vec![
                CanFrame::new(0x71B, &[0x10, 0x14, 0x62, 0xF1, 0x90, 0x41, 0x42, 0x43]),
                CanFrame::new(0x71B, &[0x21, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49, 0x4A]),
                CanFrame::new(0x71B, &[0x22, 0x4B, 0x4C, 0x4D, 0x4E, 0x4F, 0x50, 0x51]),
            ],
        );
        let channel = channel_with(mock);

        let response = channel
            .request(
                AddressingMode::Physical,
                &[0x22, 0xF1, 0x90],
                ResponsePolicy::RequirePositive,
            )
            .await
            .unwrap();
        assert_eq!(response.len(), 20);
        assert_eq!(response[..3], [0x62, 0xF1, 0x90]);
        assert_eq!(response[3..], *b"ABCDEFGHIJKLMNOPQ");
    }

    #[tokio::test]
    async fn test_multi_frame_request_segmented() {
        let mock = Arc::new(MockCanAdapter::new());
        // 12-byte write request arrives as FF + CF; scripted positive
        // response fires on the First Frame.
        mock.add_rule(
            0x713,
            &[0x10, 0x0C, 0x2E],
            vec![CanFrame::new(0x71B, &[0x03, 0x6E, 0xF1, 0x84])],
        );
        let channel = channel_with(mock.clone());

        let request = [
            0x2E, 0xF1, 0x84, 0x19, 0x05, 0x16, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46,
        ];
        let response = channel
            .request(
                AddressingMode::Physical,
                &request,
                ResponsePolicy::RequirePositive,
            )
            .await
            .unwrap();
        assert_eq!(response, vec![0x6E, 0xF1, 0x84]);

        let sent = mock.sent_frames();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].data()[0], 0x10);
        assert_eq!(sent[1].data()[0], 0x21);
    }

    #[tokio::test]
    async fn test_physical_negative_fails_fast() {
        let mock = Arc::new(MockCanAdapter::new());
        mock.add_rule(
            0x713,
            &[0x02, 0x10, 0x02],
            vec![CanFrame::new(0x71B, &[0x03, 0x7F, 0x10, 0x22])],
        );
        let channel = channel_with(mock);

        let err = channel
            .request(
                AddressingMode::Physical,
                &[0x10, 0x02],
                ResponsePolicy::RequirePositive,
            )
            .await
            .unwrap_err();
        match err {
            UdsError::NegativeResponse { service, nrc } => {
                assert_eq!(service, 0x10);
                assert_eq!(nrc, NegativeResponseCode::ConditionsNotCorrect);
            }
            other => panic!("expected negative response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_functional_negative_then_positive_succeeds() {
        let mock = Arc::new(MockCanAdapter::new());
        // Two ECUs answer the broadcast: one rejects, one accepts.
        mock.add_rule(
            0x7DF,
            &[0x02, 0x10],
            vec![
                CanFrame::new(0x7E9, &[0x03, 0x7F, 0x10, 0x7F]),
                CanFrame::new(0x7E8, &[0x02, 0x50, 0x01]),
            ],
        );
        let channel = channel_with(mock);

        let response = channel
            .request(
                AddressingMode::Functional,
                &[0x10, 0x01],
                ResponsePolicy::RequirePositive,
            )
            .await
            .unwrap();
        assert_eq!(response, vec![0x50, 0x01]);
    }

    #[tokio::test]
    async fn test_silence_times_out_when_positive_required() {
        let mock = Arc::new(MockCanAdapter::new());
        let channel = channel_with(mock);

        let err = channel
            .request(
                AddressingMode::Physical,
                &[0x10, 0x03],
                ResponsePolicy::RequirePositive,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UdsError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_silence_accepted_under_absence_of_negative() {
        let mock = Arc::new(MockCanAdapter::new());
        let channel = channel_with(mock);

        let response = channel
            .request(
                AddressingMode::Physical,
                &[0x37],
                ResponsePolicy::AbsenceOfNegative,
            )
            .await
            .unwrap();
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn test_negative_still_fails_under_absence_of_negative() {
        let mock = Arc::new(MockCanAdapter::new());
        mock.add_rule(
            0x713,
            &[0x01, 0x37],
            vec![CanFrame::new(0x71B, &[0x03, 0x7F, 0x37, 0x24])],
        );
        let channel = channel_with(mock);

        let err = channel
            .request(
                AddressingMode::Physical,
                &[0x37],
                ResponsePolicy::AbsenceOfNegative,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UdsError::NegativeResponse {
                service: 0x37,
                nrc: NegativeResponseCode::RequestSequenceError,
            }
        ));
    }

    #[tokio::test]
    async fn test_unrelated_traffic_skipped() {
        let mock = Arc::new(MockCanAdapter::new());
        // A stray message on the gateway ID precedes the real answer.
        mock.add_rule(
            0x713,
            &[0x02, 0x10],
            vec![
                CanFrame::new(0x3C1, &[0x02, 0x99, 0x01]),
                CanFrame::new(0x71B, &[0x02, 0x50, 0x03]),
            ],
        );
        let channel = channel_with(mock);

        let response = channel
            .request(
                AddressingMode::Physical,
                &[0x10, 0x03],
                ResponsePolicy::RequirePositive,
            )
            .await
            .unwrap();
        assert_eq!(response, vec![0x50, 0x03]);
    }

    #[tokio::test]
    async fn test_response_from_foreign_id_ignored() {
        let mock = Arc::new(MockCanAdapter::new());
        // Correct payload but from an ID outside the physical
        // allow-list; must not satisfy the request.
        mock.add_rule(
            0x713,
            &[0x02, 0x10],
            vec![CanFrame::new(0x7E8, &[0x02, 0x50, 0x03])],
        );
        let channel = channel_with(mock);

        let err = channel
            .request(
                AddressingMode::Physical,
                &[0x10, 0x03],
                ResponsePolicy::RequirePositive,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UdsError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_send_raw_records_frame() {
        let mock = Arc::new(MockCanAdapter::new());
        let channel = channel_with(mock.clone());

        let frame = CanFrame::padded(0x33C, &[0x02]);
        channel.send_raw(frame).await.unwrap();

        let sent = mock.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id(), 0x33C);
    }
}
