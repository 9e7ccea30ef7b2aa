//! Wire-level codecs for the ICCom inter-chip communication protocol.
//!
//! ICCom exchanges fixed-size *packages* over a symmetric full-duplex link.
//! Every package is framed with:
//! - A 2-byte big-endian payload length
//! - A 1-byte nonzero wrapping package id
//! - Payload area carrying back-to-back *packets*, padded with `0xFF`
//! - A 4-byte little-endian CRC32 trailer
//!
//! Packets are the variable-length sub-records inside a package payload;
//! each one belongs to a single 15-bit channel and may finalize a message.

pub mod channel;
pub mod crc32;
pub mod error;
pub mod package;
pub mod packet;

pub use channel::{is_valid_channel, ChannelFilter, MAX_CHANNEL};
pub use crc32::Crc32;
pub use error::{Result, WireError};
pub use package::{
    frame_id, frame_payload, is_ack, next_package_id, validate, Package, ACK_BYTE, FILL_BYTE,
    INITIAL_PACKAGE_ID, MIN_PACKAGE_SIZE, NACK_BYTE, PACKAGE_OVERHEAD,
};
pub use packet::{write_packet, Packet, PACKET_HEADER_SIZE, PACKET_MIN_SIZE};
