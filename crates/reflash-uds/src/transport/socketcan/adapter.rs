//! Raw SocketCAN adapter
//!
//! Opens a classic CAN socket on a named interface and runs a blocking
//! listener thread that fans every received data frame out to subscribers.
//! No kernel filters are installed: responses can arrive on physical IDs,
//! on the whole functional response range or on configured extra IDs, so
//! filtering happens in the session layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use socketcan::{CanFrame as SocketFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame, Socket, StandardId};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::SocketCanConfig;
use crate::frame::CanFrame;
use crate::transport::{CanAdapter, IncomingFrame, TransportError};

/// Highest valid 11-bit arbitration ID.
const MAX_STANDARD_ID: u32 = 0x7FF;

pub struct SocketCanAdapter {
    config: SocketCanConfig,
    socket: Arc<Mutex<CanSocket>>,
    open: Arc<AtomicBool>,
    frames_tx: broadcast::Sender<IncomingFrame>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SocketCanAdapter {
    pub async fn open(config: &SocketCanConfig) -> Result<Self, TransportError> {
        let socket = Self::create_socket(config)?;

        // Drain frames left over from previous sessions on the interface
        Self::drain_socket(&socket);

        let (frames_tx, _) = broadcast::channel(1024);
        let adapter = Self {
            config: config.clone(),
            socket: Arc::new(Mutex::new(socket)),
            open: Arc::new(AtomicBool::new(true)),
            frames_tx,
            listener: Mutex::new(None),
        };
        adapter.start_listener();
        Ok(adapter)
    }

    fn create_socket(config: &SocketCanConfig) -> Result<CanSocket, TransportError> {
        let socket = CanSocket::open(&config.interface).map_err(|e| {
            TransportError::Open(format!(
                "Failed to open CAN socket on {}: {}",
                config.interface, e
            ))
        })?;

        socket.set_nonblocking(true).map_err(|e| {
            TransportError::Config(format!("Failed to set non-blocking: {}", e))
        })?;

        Ok(socket)
    }

    fn drain_socket(socket: &CanSocket) {
        while let Ok(frame) = socket.read_frame() {
            tracing::debug!(
                can_id = format!("0x{:X}", frame.raw_id()),
                "Drained stale frame from socket"
            );
        }
    }

    fn start_listener(&self) {
        let socket = self.socket.clone();
        let frames_tx = self.frames_tx.clone();
        let open = self.open.clone();
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(1));

        let handle = tokio::task::spawn_blocking(move || {
            while open.load(Ordering::SeqCst) {
                let result = {
                    let guard = socket.lock();
                    guard.read_frame()
                };

                match result {
                    Ok(SocketFrame::Data(data_frame)) => {
                        let frame = CanFrame::new(data_frame.raw_id(), data_frame.data());
                        tracing::trace!(frame = %frame, "Frame received");

                        let incoming = IncomingFrame {
                            timestamp: Instant::now(),
                            frame,
                        };
                        if frames_tx.send(incoming).is_err() {
                            // No receivers right now, keep listening
                        }
                    }
                    Ok(_) => {
                        // Remote and error frames carry no diagnostic payload
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(poll_interval);
                    }
                    Err(e) => {
                        tracing::error!(?e, "CAN socket read failed");
                        std::thread::sleep(poll_interval);
                    }
                }
            }
            tracing::debug!("CAN listener thread exiting");
        });

        *self.listener.lock() = Some(handle);
    }
}

#[async_trait]
impl CanAdapter for SocketCanAdapter {
    async fn send(&self, frame: CanFrame) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }

        let socket = self.socket.clone();

        tokio::task::spawn_blocking(move || {
            let raw = to_socket_frame(&frame)?;
            let guard = socket.lock();
            guard
                .write_frame(&raw)
                .map_err(|e| TransportError::Send(e.to_string()))
        })
        .await
        .map_err(|e| TransportError::Send(format!("Task join error: {}", e)))??;

        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<IncomingFrame> {
        self.frames_tx.subscribe()
    }

    async fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        let socket = Self::create_socket(&self.config)?;
        *self.socket.lock() = socket;
        self.open.store(true, Ordering::SeqCst);

        // The listener keeps running across reconnects because it reads
        // through the shared socket handle. Restart it only if it exited.
        let needs_listener = self
            .listener
            .lock()
            .as_ref()
            .map_or(true, |handle| handle.is_finished());
        if needs_listener {
            self.start_listener();
        }

        Ok(())
    }
}

impl Drop for SocketCanAdapter {
    fn drop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

fn to_socket_frame(frame: &CanFrame) -> Result<SocketFrame, TransportError> {
    let raw = if frame.id() <= MAX_STANDARD_ID {
        let id = StandardId::new(frame.id() as u16).ok_or_else(|| {
            TransportError::Send(format!("Invalid standard CAN ID: 0x{:X}", frame.id()))
        })?;
        SocketFrame::new(id, frame.data())
    } else {
        let id = ExtendedId::new(frame.id()).ok_or_else(|| {
            TransportError::Send(format!("Invalid extended CAN ID: 0x{:X}", frame.id()))
        })?;
        SocketFrame::new(id, frame.data())
    };

    raw.ok_or_else(|| {
        TransportError::Send(format!(
            "Frame for 0x{:X} rejected by socket layer",
            frame.id()
        ))
    })
}
