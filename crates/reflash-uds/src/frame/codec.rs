//! Segmentation codec: logical message ⇄ Single/First/Consecutive frames.

use thiserror::Error;

use super::{pci, CanFrame};

/// Longest logical message expressible in a 12-bit First Frame length field.
pub const MAX_MESSAGE_LEN: usize = 4095;

/// Payload capacity of a Single Frame.
pub const SINGLE_FRAME_CAPACITY: usize = 7;

const FIRST_FRAME_DATA: usize = 6;
const CONSECUTIVE_FRAME_DATA: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameCodecError {
    #[error("cannot encode an empty message")]
    EmptyMessage,

    #[error("message of {0} bytes exceeds the {MAX_MESSAGE_LEN}-byte segmentation limit")]
    MessageTooLong(usize),

    #[error("frame carries no PCI byte")]
    EmptyFrame,

    #[error("unknown PCI frame type 0x{0:X}")]
    UnknownPci(u8),

    #[error("single frame declares {declared} bytes but carries {available}")]
    TruncatedSingleFrame { declared: usize, available: usize },

    #[error("first frame declares {0} bytes, below the multi-frame minimum")]
    DeclaredLengthTooSmall(usize),

    #[error("consecutive frame received without a first frame")]
    UnexpectedConsecutive,

    #[error("flow control frame received; flow control is not part of this transport")]
    UnexpectedFlowControl,
}

/// Iterator turning one logical message into wire frames.
///
/// A message of up to 7 bytes becomes one Single Frame; anything longer
/// becomes a First Frame carrying 6 bytes followed by Consecutive Frames of
/// up to 7 bytes each, sequence numbers cycling 1..15 then wrapping to 0.
/// All emitted frames are zero-padded to DLC 8.
pub struct Segmenter<'a> {
    id: u32,
    message: &'a [u8],
    offset: usize,
    sequence: u8,
    started: bool,
}

impl<'a> Segmenter<'a> {
    pub fn new(id: u32, message: &'a [u8]) -> Result<Self, FrameCodecError> {
        if message.is_empty() {
            return Err(FrameCodecError::EmptyMessage);
        }
        if message.len() > MAX_MESSAGE_LEN {
            return Err(FrameCodecError::MessageTooLong(message.len()));
        }
        Ok(Self {
            id,
            message,
            offset: 0,
            sequence: 0,
            started: false,
        })
    }

    /// Number of frames this message will occupy.
    pub fn frame_count(&self) -> usize {
        let len = self.message.len();
        if len <= SINGLE_FRAME_CAPACITY {
            1
        } else {
            1 + (len - FIRST_FRAME_DATA).div_ceil(CONSECUTIVE_FRAME_DATA)
        }
    }
}

impl Iterator for Segmenter<'_> {
    type Item = CanFrame;

    fn next(&mut self) -> Option<CanFrame> {
        let len = self.message.len();

        if !self.started {
            self.started = true;

            if len <= SINGLE_FRAME_CAPACITY {
                let mut buf = [0u8; 8];
                buf[0] = len as u8;
                buf[1..1 + len].copy_from_slice(self.message);
                self.offset = len;
                return Some(CanFrame::padded(self.id, &buf));
            }

            let mut buf = [0u8; 8];
            buf[0] = (pci::FIRST_FRAME << 4) | ((len >> 8) & 0x0F) as u8;
            buf[1] = (len & 0xFF) as u8;
            buf[2..2 + FIRST_FRAME_DATA].copy_from_slice(&self.message[..FIRST_FRAME_DATA]);
            self.offset = FIRST_FRAME_DATA;
            self.sequence = 1;
            return Some(CanFrame::padded(self.id, &buf));
        }

        if self.offset >= len {
            return None;
        }

        let chunk = (len - self.offset).min(CONSECUTIVE_FRAME_DATA);
        let mut buf = [0u8; 8];
        buf[0] = (pci::CONSECUTIVE_FRAME << 4) | (self.sequence & 0x0F);
        buf[1..1 + chunk].copy_from_slice(&self.message[self.offset..self.offset + chunk]);
        self.offset += chunk;
        self.sequence = (self.sequence + 1) & 0x0F;
        Some(CanFrame::padded(self.id, &buf))
    }
}

/// Segment a message into a vector of frames.
pub fn segment(id: u32, message: &[u8]) -> Result<Vec<CanFrame>, FrameCodecError> {
    Ok(Segmenter::new(id, message)?.collect())
}

/// Outcome of feeding one frame to the [`Reassembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// More Consecutive Frames are expected.
    Incomplete,
    /// The logical message completed with this frame.
    Complete(Vec<u8>),
}

/// Receive-side state machine rebuilding logical messages from frames.
///
/// Consecutive Frame sequence numbers are accepted in whatever order they
/// arrive; payload is appended until the First Frame's declared length is
/// reached. That mirrors the tolerant receive behavior this transport has
/// always had. ECUs that interleave responses on one identifier are not
/// supported.
#[derive(Debug, Default)]
pub struct Reassembler {
    expected: usize,
    buffer: Vec<u8>,
    receiving: bool,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any partially assembled message.
    pub fn reset(&mut self) {
        self.expected = 0;
        self.buffer.clear();
        self.receiving = false;
    }

    pub fn feed(&mut self, frame: &CanFrame) -> Result<Reassembly, FrameCodecError> {
        let data = frame.data();
        let first = *data.first().ok_or(FrameCodecError::EmptyFrame)?;

        match first >> 4 {
            pci::SINGLE_FRAME => {
                let declared = (first & 0x0F) as usize;
                if declared == 0 {
                    return Err(FrameCodecError::EmptyMessage);
                }
                let available = data.len() - 1;
                if declared > available {
                    return Err(FrameCodecError::TruncatedSingleFrame {
                        declared,
                        available,
                    });
                }
                // A Single Frame replaces any half-finished message.
                self.reset();
                Ok(Reassembly::Complete(data[1..1 + declared].to_vec()))
            }

            pci::FIRST_FRAME => {
                if data.len() < 2 {
                    return Err(FrameCodecError::EmptyFrame);
                }
                let declared = (((first & 0x0F) as usize) << 8) | data[1] as usize;
                if declared <= FIRST_FRAME_DATA {
                    return Err(FrameCodecError::DeclaredLengthTooSmall(declared));
                }
                self.reset();
                let take = FIRST_FRAME_DATA.min(data.len() - 2);
                self.buffer.extend_from_slice(&data[2..2 + take]);
                self.expected = declared;
                self.receiving = true;
                Ok(Reassembly::Incomplete)
            }

            pci::CONSECUTIVE_FRAME => {
                if !self.receiving {
                    return Err(FrameCodecError::UnexpectedConsecutive);
                }
                let remaining = self.expected - self.buffer.len();
                let take = remaining.min(data.len() - 1);
                self.buffer.extend_from_slice(&data[1..1 + take]);
                if self.buffer.len() == self.expected {
                    self.receiving = false;
                    self.expected = 0;
                    Ok(Reassembly::Complete(std::mem::take(&mut self.buffer)))
                } else {
                    Ok(Reassembly::Incomplete)
                }
            }

            pci::FLOW_CONTROL => Err(FrameCodecError::UnexpectedFlowControl),

            other => Err(FrameCodecError::UnknownPci(other)),
        }
    }
}
