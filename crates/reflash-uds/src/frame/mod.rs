//! CAN frame types and the ISO-TP-style segmentation codec.
//!
//! Everything on the wire is an 8-byte classic CAN frame with an 11-bit
//! identifier. Logical UDS messages longer than 7 bytes are split into
//! First/Consecutive frames by [`codec`]; no Flow-Control frames are
//! exchanged in either direction (see crate docs for the deviation note).

mod codec;

pub use codec::{segment, FrameCodecError, Reassembly, Reassembler, Segmenter};

/// Protocol Control Information frame types (high nibble of byte 0).
pub mod pci {
    pub const SINGLE_FRAME: u8 = 0x0;
    pub const FIRST_FRAME: u8 = 0x1;
    pub const CONSECUTIVE_FRAME: u8 = 0x2;
    pub const FLOW_CONTROL: u8 = 0x3;
}

/// One classic CAN frame: 11-bit identifier, up to 8 payload bytes.
///
/// Frames are value types; a received frame is a read-only snapshot and a
/// sent frame is never mutated after hand-off to the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: u32,
    dlc: u8,
    data: [u8; 8],
}

impl CanFrame {
    /// Build a frame from a payload slice. Panics if `payload` exceeds 8
    /// bytes; callers handing in raw payloads own that bound.
    pub fn new(id: u32, payload: &[u8]) -> Self {
        assert!(payload.len() <= 8, "CAN payload exceeds 8 bytes");
        let mut data = [0u8; 8];
        data[..payload.len()].copy_from_slice(payload);
        Self {
            id,
            dlc: payload.len() as u8,
            data,
        }
    }

    /// Build a full 8-byte frame, zero-padded. The tester side always pads
    /// its transmissions to DLC 8.
    pub fn padded(id: u32, payload: &[u8]) -> Self {
        assert!(payload.len() <= 8, "CAN payload exceeds 8 bytes");
        let mut data = [0u8; 8];
        data[..payload.len()].copy_from_slice(payload);
        Self { id, dlc: 8, data }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    /// Payload bytes up to the DLC.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    /// PCI frame type nibble, if the frame is long enough to carry one.
    pub fn pci_type(&self) -> Option<u8> {
        self.data().first().map(|b| b >> 4)
    }
}

impl std::fmt::Display for CanFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:03X} [{}] {}", self.id, self.dlc, hex::encode_upper(self.data()))
    }
}
