//! Fixed-size package frames.
//!
//! A package is the unit exchanged with the peer in one data half-frame.
//! Wire format (frame size fixed by the transport):
//! ```text
//! ┌────────────────┬─────────┬──────────────┬─────────────┬──────────────┐
//! │ Length (2B BE) │ Id (1B) │ Packets ...  │ Fill = 0xFF │ CRC32 (4B LE)│
//! └────────────────┴─────────┴──────────────┴─────────────┴──────────────┘
//! ```
//! The id is a nonzero wrapping sequence used by the receiver to suppress
//! duplicated packages after a lost acknowledgement.

use crate::crc32::Crc32;
use crate::error::{Result, WireError};
use crate::packet::{write_packet, PACKET_HEADER_SIZE};

/// Payload length field size in bytes.
const PAYLOAD_LEN_FIELD: usize = 2;
/// Package id field size in bytes.
const ID_FIELD: usize = 1;
/// CRC trailer size in bytes.
const CRC_FIELD: usize = 4;
/// Offset of the first payload byte.
const PAYLOAD_OFFSET: usize = PAYLOAD_LEN_FIELD + ID_FIELD;

/// Fixed package overhead: length + id + CRC.
pub const PACKAGE_OVERHEAD: usize = PAYLOAD_LEN_FIELD + ID_FIELD + CRC_FIELD;

/// Smallest frame that can carry one minimal packet.
pub const MIN_PACKAGE_SIZE: usize = PACKAGE_OVERHEAD + PACKET_HEADER_SIZE + 1;

/// Unused payload bytes carry this value.
pub const FILL_BYTE: u8 = 0xFF;

/// Positive acknowledgement byte.
pub const ACK_BYTE: u8 = 0xD0;

/// Negative acknowledgement byte. Any value other than [`ACK_BYTE`] is
/// treated as NACK by the receiver; this one is what we send.
pub const NACK_BYTE: u8 = 0xE1;

/// First package id after initialization; ids wrap around skipping zero.
pub const INITIAL_PACKAGE_ID: u8 = 1;

/// Next package id in sequence. Zero is reserved and never produced.
pub fn next_package_id(id: u8) -> u8 {
    match id.wrapping_add(1) {
        0 => INITIAL_PACKAGE_ID,
        next => next,
    }
}

/// One outbound package owning its frame buffer.
#[derive(Debug, Clone)]
pub struct Package {
    data: Vec<u8>,
}

impl Package {
    /// Allocate a finalized empty package of `frame_size` bytes.
    pub fn new_empty(id: u8, frame_size: usize, crc: &Crc32) -> Result<Self> {
        if frame_size < MIN_PACKAGE_SIZE {
            return Err(WireError::FrameTooShort {
                len: frame_size,
                min: MIN_PACKAGE_SIZE,
            });
        }
        let mut package = Self {
            data: vec![0u8; frame_size],
        };
        package.make_empty(id, crc);
        Ok(package)
    }

    /// Total frame size in bytes.
    pub fn frame_size(&self) -> usize {
        self.data.len()
    }

    /// Size of the payload area (occupied or not).
    pub fn payload_room(&self) -> usize {
        self.data.len() - PACKAGE_OVERHEAD
    }

    /// Declared payload length, `None` when it exceeds the payload room.
    pub fn payload_len(&self) -> Option<usize> {
        let declared = usize::from(u16::from_be_bytes([self.data[0], self.data[1]]));
        (declared <= self.payload_room()).then_some(declared)
    }

    /// Unoccupied payload bytes.
    pub fn free_space(&self) -> usize {
        self.payload_room() - self.payload_len().unwrap_or(self.payload_room())
    }

    /// Package sequence id.
    pub fn id(&self) -> u8 {
        self.data[PAYLOAD_LEN_FIELD]
    }

    /// Full frame bytes (valid for xfer only after [`Self::finalize`]).
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// The occupied payload slice.
    pub fn payload(&self) -> &[u8] {
        let len = self.payload_len().unwrap_or(0);
        &self.data[PAYLOAD_OFFSET..PAYLOAD_OFFSET + len]
    }

    /// Append as much of `payload` as fits into the free payload area,
    /// wrapped in a single packet on `channel`.
    ///
    /// The packet's complete flag is set when the whole remainder fits.
    /// Returns the number of consumer bytes consumed; zero means the package
    /// has no room for even a one-byte packet and a new package is needed.
    /// The package must be re-finalized afterwards.
    pub fn add_packet(&mut self, payload: &[u8], channel: u16) -> usize {
        let used = match self.payload_len() {
            Some(len) => len,
            None => return 0,
        };
        let free = self.payload_room() - used;
        if free <= PACKET_HEADER_SIZE {
            return 0;
        }

        let write_size = (free - PACKET_HEADER_SIZE).min(payload.len());
        let complete = write_size == payload.len();
        let start = PAYLOAD_OFFSET + used;
        let written = write_packet(
            &mut self.data[start..],
            channel,
            complete,
            &payload[..write_size],
        );
        self.set_payload_len(used + written);
        write_size
    }

    /// Fill the unused payload area and recompute the CRC trailer.
    ///
    /// After this call the frame is valid and ready to be xfered. More
    /// packets may still be appended later followed by another finalize.
    pub fn finalize(&mut self, crc: &Crc32) {
        let used = self.payload_len().unwrap_or(0);
        let crc_offset = self.data.len() - CRC_FIELD;
        for byte in &mut self.data[PAYLOAD_OFFSET + used..crc_offset] {
            *byte = FILL_BYTE;
        }
        let checksum = crc.checksum(&self.data[..crc_offset]);
        self.data[crc_offset..].copy_from_slice(&checksum.to_le_bytes());
    }

    /// Reset to an empty finalized frame carrying `id`.
    pub fn make_empty(&mut self, id: u8, crc: &Crc32) {
        self.set_payload_len(0);
        self.data[PAYLOAD_LEN_FIELD] = id;
        self.finalize(crc);
    }

    fn set_payload_len(&mut self, len: usize) {
        self.data[0..2].copy_from_slice(&(len as u16).to_be_bytes());
    }
}

/// Validate a received frame: declared length, fill bytes, then CRC.
///
/// Structural checks run before the CRC so malformed frames do not spend
/// cycles on checksum computation. Pure; returns the declared payload length.
pub fn validate(frame: &[u8], crc: &Crc32) -> Result<usize> {
    if frame.len() < PACKAGE_OVERHEAD {
        return Err(WireError::FrameTooShort {
            len: frame.len(),
            min: PACKAGE_OVERHEAD,
        });
    }

    let room = frame.len() - PACKAGE_OVERHEAD;
    let declared = usize::from(u16::from_be_bytes([frame[0], frame[1]]));
    if declared > room {
        return Err(WireError::PayloadTooLarge { declared, room });
    }

    let crc_offset = frame.len() - CRC_FIELD;
    for (i, &byte) in frame[PAYLOAD_OFFSET + declared..crc_offset].iter().enumerate() {
        if byte != FILL_BYTE {
            return Err(WireError::FillCorrupted {
                offset: PAYLOAD_OFFSET + declared + i,
            });
        }
    }

    let stored = u32::from_le_bytes([
        frame[crc_offset],
        frame[crc_offset + 1],
        frame[crc_offset + 2],
        frame[crc_offset + 3],
    ]);
    let computed = crc.checksum(&frame[..crc_offset]);
    if stored != computed {
        return Err(WireError::CrcMismatch { stored, computed });
    }

    Ok(declared)
}

/// Package id of a received frame. Caller must have validated the frame.
pub fn frame_id(frame: &[u8]) -> u8 {
    frame[PAYLOAD_LEN_FIELD]
}

/// Payload slice of a received frame with the given validated length.
pub fn frame_payload(frame: &[u8], payload_len: usize) -> &[u8] {
    &frame[PAYLOAD_OFFSET..PAYLOAD_OFFSET + payload_len]
}

/// True iff `frame` is an ack-sized frame carrying the positive ACK byte.
pub fn is_ack(frame: &[u8]) -> bool {
    frame.len() == 1 && frame[0] == ACK_BYTE
}
