/// Errors that can occur while encoding or decoding ICCom wire data.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    /// The frame is smaller than the fixed package overhead.
    #[error("frame too short ({len} bytes, minimum {min})")]
    FrameTooShort { len: usize, min: usize },

    /// The declared payload length exceeds the payload room of the frame.
    #[error("declared payload length {declared} exceeds payload room {room}")]
    PayloadTooLarge { declared: usize, room: usize },

    /// A byte in the unused payload area is not the fill value.
    #[error("unused payload byte at offset {offset} is not 0xFF")]
    FillCorrupted { offset: usize },

    /// The CRC trailer does not match the recomputed checksum.
    #[error("crc mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    CrcMismatch { stored: u32, computed: u32 },

    /// The remaining payload window is too small to hold a packet.
    #[error("packet window too small ({window} bytes, minimum {min})")]
    PacketWindowTooSmall { window: usize, min: usize },

    /// A packet declares more payload than the remaining window holds.
    #[error("packet payload {declared} bytes overruns remaining window {window}")]
    PacketTruncated { declared: usize, window: usize },

    /// A packet declares an empty payload.
    #[error("packet declares empty payload")]
    PacketEmptyPayload,
}

pub type Result<T> = std::result::Result<T, WireError>;
