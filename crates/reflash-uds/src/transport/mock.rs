//! Mock CAN adapter for testing
//!
//! Simulates a bus without hardware. Responses are produced either from
//! scripted rules (a frame matching an arbitration ID and payload prefix
//! triggers a canned sequence of response frames) or from a dynamic
//! responder closure that computes responses per received frame. Scripted
//! rules win over the responder, so individual requests can be overridden
//! while a simulated ECU handles the rest.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::config::MockConfig;
use crate::frame::CanFrame;
use crate::transport::{CanAdapter, IncomingFrame, TransportError};

type Responder = Box<dyn Fn(CanFrame) -> Vec<CanFrame> + Send + Sync>;

struct MockRule {
    id: u32,
    prefix: Vec<u8>,
    responses: Vec<CanFrame>,
}

/// Mock CAN adapter with scripted responses
pub struct MockCanAdapter {
    open: AtomicBool,
    incoming_tx: broadcast::Sender<IncomingFrame>,
    rules: RwLock<Vec<MockRule>>,
    responder: RwLock<Option<Responder>>,
    sent: RwLock<Vec<CanFrame>>,
    latency: Duration,
}

impl MockCanAdapter {
    pub fn new() -> Self {
        let (incoming_tx, _) = broadcast::channel(256);

        Self {
            open: AtomicBool::new(true),
            incoming_tx,
            rules: RwLock::new(Vec::new()),
            responder: RwLock::new(None),
            sent: RwLock::new(Vec::new()),
            latency: Duration::ZERO,
        }
    }

    pub fn from_config(config: &MockConfig) -> Self {
        Self {
            latency: Duration::from_millis(config.latency_ms),
            ..Self::new()
        }
    }

    /// Script a response: when a sent frame carries `id` and its payload
    /// starts with `prefix`, every frame in `responses` is delivered back.
    pub fn add_rule(&self, id: u32, prefix: &[u8], responses: Vec<CanFrame>) {
        self.rules.write().push(MockRule {
            id,
            prefix: prefix.to_vec(),
            responses,
        });
    }

    /// Install a closure that computes responses for frames no rule matched.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(CanFrame) -> Vec<CanFrame> + Send + Sync + 'static,
    {
        *self.responder.write() = Some(Box::new(responder));
    }

    /// Deliver a frame to subscribers as if it arrived from the bus.
    pub fn inject_frame(&self, frame: CanFrame) {
        let _ = self.incoming_tx.send(IncomingFrame {
            timestamp: Instant::now(),
            frame,
        });
    }

    /// Simulate losing or regaining the interface.
    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    /// Every frame sent through this adapter, in transmission order.
    pub fn sent_frames(&self) -> Vec<CanFrame> {
        self.sent.read().clone()
    }

    fn responses_for(&self, frame: CanFrame) -> Vec<CanFrame> {
        let rules = self.rules.read();
        for rule in rules.iter() {
            if rule.id == frame.id() && frame.data().starts_with(&rule.prefix) {
                return rule.responses.clone();
            }
        }
        drop(rules);

        if let Some(responder) = self.responder.read().as_ref() {
            return responder(frame);
        }

        Vec::new()
    }
}

impl Default for MockCanAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CanAdapter for MockCanAdapter {
    async fn send(&self, frame: CanFrame) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }

        self.sent.write().push(frame);

        let responses = self.responses_for(frame);
        if responses.is_empty() {
            return Ok(());
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        for response in responses {
            self.inject_frame(response);
        }

        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<IncomingFrame> {
        self.incoming_tx.subscribe()
    }

    async fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_rule_delivers_responses() {
        let bus = MockCanAdapter::new();
        bus.add_rule(
            0x713,
            &[0x02, 0x10],
            vec![CanFrame::padded(0x71B, &[0x06, 0x50, 0x03, 0x00, 0x32, 0x01, 0xF4])],
        );

        let mut rx = bus.subscribe();
        bus.send(CanFrame::padded(0x713, &[0x02, 0x10, 0x03]))
            .await
            .unwrap();

        let incoming = rx.recv().await.unwrap();
        assert_eq!(incoming.frame.id(), 0x71B);
        assert_eq!(incoming.frame.data()[1], 0x50);
    }

    #[tokio::test]
    async fn test_unmatched_frame_stays_silent() {
        let bus = MockCanAdapter::new();
        bus.add_rule(0x713, &[0x02, 0x10], vec![CanFrame::padded(0x71B, &[0x01, 0x50])]);

        let mut rx = bus.subscribe();
        bus.send(CanFrame::padded(0x713, &[0x03, 0x22, 0xF1, 0x90]))
            .await
            .unwrap();

        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_rule_wins_over_responder() {
        let bus = MockCanAdapter::new();
        bus.set_responder(|_| vec![CanFrame::padded(0x71B, &[0x01, 0xAA])]);
        bus.add_rule(0x713, &[0x02, 0x10], vec![CanFrame::padded(0x71B, &[0x01, 0xBB])]);

        let mut rx = bus.subscribe();
        bus.send(CanFrame::padded(0x713, &[0x02, 0x10, 0x01]))
            .await
            .unwrap();

        let incoming = rx.recv().await.unwrap();
        assert_eq!(incoming.frame.data()[1], 0xBB);
    }

    #[tokio::test]
    async fn test_responder_computes_response() {
        let bus = MockCanAdapter::new();
        bus.set_responder(|frame| {
            if frame.id() == 0x713 {
                vec![CanFrame::padded(0x71B, &[0x02, frame.data()[1] | 0x40, 0x00])]
            } else {
                Vec::new()
            }
        });

        let mut rx = bus.subscribe();
        bus.send(CanFrame::padded(0x713, &[0x02, 0x11, 0x02]))
            .await
            .unwrap();

        let incoming = rx.recv().await.unwrap();
        assert_eq!(incoming.frame.data()[1], 0x51);
    }

    #[tokio::test]
    async fn test_send_fails_when_closed() {
        let bus = MockCanAdapter::new();
        bus.set_open(false);

        let result = bus.send(CanFrame::padded(0x713, &[0x02, 0x10, 0x01])).await;
        assert!(matches!(result, Err(TransportError::Disconnected)));

        bus.reconnect().await.unwrap();
        assert!(bus.is_open().await);
    }

    #[tokio::test]
    async fn test_sent_frames_are_recorded_in_order() {
        let bus = MockCanAdapter::new();
        bus.send(CanFrame::padded(0x33C, &[0x02])).await.unwrap();
        bus.send(CanFrame::padded(0x713, &[0x02, 0x10, 0x03]))
            .await
            .unwrap();

        let sent = bus.sent_frames();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].id(), 0x33C);
        assert_eq!(sent[1].id(), 0x713);
    }

    #[tokio::test]
    async fn test_injected_frame_reaches_subscriber() {
        let bus = MockCanAdapter::new();
        let mut rx = bus.subscribe();

        bus.inject_frame(CanFrame::padded(0x7E8, &[0x03, 0x7F, 0x10, 0x11]));

        let incoming = rx.recv().await.unwrap();
        assert_eq!(incoming.frame.id(), 0x7E8);
    }
}
