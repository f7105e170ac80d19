use crate::packet::{Packet, PacketWireError};
use crc32fast::Hasher as Crc32Hasher;

/// sequence(u64) + body_len(u32) + crc32(u32)
const FRAME_HEADER_LEN: usize = 8 + 4 + 4;

/// A packet plus its spill sequence number, framed as a length-prefixed,
/// CRC-checked record inside a spill file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillRecord {
    pub sequence: u64,
    pub packet: Packet,
}

impl SpillRecord {
    pub fn new(sequence: u64, packet: Packet) -> Self {
        Self { sequence, packet }
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.packet.wire_len()
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_frame(self.sequence, &self.packet)
    }

    /// Decodes one frame from the front of `bytes`, returning the record and
    /// the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), RecordError> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(RecordError::TooShort);
        }
        let sequence = u64::from_le_bytes(bytes[0..8].try_into().expect("length checked"));
        let body_len =
            u32::from_le_bytes(bytes[8..12].try_into().expect("length checked")) as usize;
        let crc = u32::from_le_bytes(bytes[12..16].try_into().expect("length checked"));
        let body_end = FRAME_HEADER_LEN + body_len;
        if bytes.len() < body_end {
            return Err(RecordError::TooShort);
        }
        let body = &bytes[FRAME_HEADER_LEN..body_end];
        let mut hasher = Crc32Hasher::new();
        hasher.update(&sequence.to_le_bytes());
        hasher.update(body);
        if hasher.finalize() != crc {
            return Err(RecordError::CrcMismatch);
        }
        let (packet, used) = Packet::decode_wire(body)?;
        if used != body.len() {
            return Err(RecordError::TrailingBytes);
        }
        Ok((SpillRecord { sequence, packet }, body_end))
    }
}

/// Frames a packet as a spill record without taking ownership of it.
pub fn encode_frame(sequence: u64, packet: &Packet) -> Vec<u8> {
    let mut body = Vec::with_capacity(packet.wire_len());
    packet.encode_wire(&mut body);
    let mut hasher = Crc32Hasher::new();
    hasher.update(&sequence.to_le_bytes());
    hasher.update(&body);
    let crc = hasher.finalize();

    let mut bytes = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    bytes.extend_from_slice(&sequence.to_le_bytes());
    bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&crc.to_le_bytes());
    bytes.extend_from_slice(&body);
    bytes
}

#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum RecordError {
    #[error("spill frame too short")]
    TooShort,
    #[error("spill frame CRC mismatch")]
    CrcMismatch,
    #[error("spill frame has trailing bytes after packet")]
    TrailingBytes,
    #[error("packet wire error: {0}")]
    Packet(#[from] PacketWireError),
}
