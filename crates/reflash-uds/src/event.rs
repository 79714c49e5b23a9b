//! Client event stream
//!
//! Long-running operations publish progress, log lines and observed frames
//! to a broadcast channel so a frontend can follow along without being
//! wired into the orchestration code. Publishing never blocks and never
//! fails: with no subscribers the events are simply dropped.

use tokio::sync::broadcast;

use crate::frame::CanFrame;

/// Severity of a published log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Direction of a frame event relative to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

/// Events published by the client and its background operations.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Free-form log line
    Log { level: LogLevel, message: String },
    /// Overall progress of a flash or scenario run, in percent
    Progress { percent: u8 },
    /// Raw frame observed on the bus
    Frame { direction: Direction, frame: CanFrame },
}

/// Broadcast hub for [`ClientEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ClientEvent) {
        let _ = self.tx.send(event);
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.publish(ClientEvent::Log {
            level,
            message: message.into(),
        });
    }

    pub fn progress(&self, percent: u8) {
        self.publish(ClientEvent::Progress { percent });
    }

    pub fn frame(&self, direction: Direction, frame: CanFrame) {
        self.publish(ClientEvent::Frame { direction, frame });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.progress(42);
        bus.log(LogLevel::Info, "step done");

        match rx.recv().await.unwrap() {
            ClientEvent::Progress { percent } => assert_eq!(percent, 42),
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            ClientEvent::Log { level, message } => {
                assert_eq!(level, LogLevel::Info);
                assert_eq!(message, "step done");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        bus.progress(100);
    }
}
