//! Packet records carried inside a package payload.
//!
//! Wire format:
//! ```text
//! ┌────────────────┬─────────┬──────────────────────┬──────────────────┐
//! │ Length (2B BE) │ LUN (1B)│ complete:1 | CID:7   │ Payload           │
//! └────────────────┴─────────┴──────────────────────┴──────────────────┘
//! ```
//! The channel id is `(LUN << 7) | CID`; the high bit of the fourth byte
//! marks the final fragment of a message. Bit operations are explicit, the
//! layout never relies on compiler bitfields.

use crate::error::{Result, WireError};

/// Packet header size: length (2) + LUN (1) + complete/CID (1).
pub const PACKET_HEADER_SIZE: usize = 4;

/// Minimum total packet size; the payload carries at least one byte.
pub const PACKET_MIN_SIZE: usize = PACKET_HEADER_SIZE + 1;

const COMPLETE_BIT: u8 = 0x80;
const CID_MASK: u8 = 0x7F;

/// A parsed packet borrowing its payload from the package frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    /// Channel the packet belongs to.
    pub channel: u16,
    /// True when this packet carries the last fragment of its message.
    pub complete: bool,
    /// The packet payload bytes.
    pub payload: &'a [u8],
}

impl<'a> Packet<'a> {
    /// Parse one packet from the start of `window`.
    ///
    /// `window` is the remaining package payload area. Fails when the window
    /// cannot hold a minimal packet or the declared payload overruns it.
    pub fn parse(window: &'a [u8]) -> Result<Packet<'a>> {
        if window.len() < PACKET_MIN_SIZE {
            return Err(WireError::PacketWindowTooSmall {
                window: window.len(),
                min: PACKET_MIN_SIZE,
            });
        }

        let declared = usize::from(u16::from_be_bytes([window[0], window[1]]));
        if declared == 0 {
            return Err(WireError::PacketEmptyPayload);
        }
        if PACKET_HEADER_SIZE + declared > window.len() {
            return Err(WireError::PacketTruncated {
                declared,
                window: window.len(),
            });
        }

        let lun = window[2];
        let cid_complete = window[3];

        Ok(Packet {
            channel: lun_cid_channel(lun, cid_complete & CID_MASK),
            complete: cid_complete & COMPLETE_BIT != 0,
            payload: &window[PACKET_HEADER_SIZE..PACKET_HEADER_SIZE + declared],
        })
    }

    /// Total wire size of this packet (header + payload).
    pub fn wire_size(&self) -> usize {
        PACKET_HEADER_SIZE + self.payload.len()
    }
}

/// Write a packet (header + payload) into `dst`.
///
/// `dst` must hold at least `PACKET_HEADER_SIZE + payload.len()` bytes.
/// Returns the number of bytes written.
pub fn write_packet(dst: &mut [u8], channel: u16, complete: bool, payload: &[u8]) -> usize {
    let len = payload.len() as u16;
    dst[0..2].copy_from_slice(&len.to_be_bytes());
    dst[2] = channel_lun(channel);
    dst[3] = channel_cid(channel) | if complete { COMPLETE_BIT } else { 0 };
    dst[PACKET_HEADER_SIZE..PACKET_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    PACKET_HEADER_SIZE + payload.len()
}

/// LUN part of a channel id (bits 7..15).
pub fn channel_lun(channel: u16) -> u8 {
    (channel >> 7) as u8
}

/// CID part of a channel id (bits 0..7).
pub fn channel_cid(channel: u16) -> u8 {
    (channel as u8) & CID_MASK
}

/// Reconstruct a channel id from its LUN and CID wire parts.
pub fn lun_cid_channel(lun: u8, cid: u8) -> u16 {
    (u16::from(lun) << 7) | u16::from(cid & CID_MASK)
}
