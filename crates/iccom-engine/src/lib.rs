//! ICCom protocol engine.
//!
//! Reliable, multi-channel, message-oriented transport on top of a
//! symmetric full-duplex byte-exchange link (typified by a symmetric SPI
//! link between two chips). Multiple logical channels share one link;
//! messages are fragmented into packets, packed into fixed-size CRC-guarded
//! packages and delivered at-least-once with duplicate suppression.
//!
//! ## Protocol frame
//!
//! ```text
//! Side A                                   Side B
//!   |--- data package (id=N) --------------->|
//!   |<-------------- data package (id=M) ----|   one data half-frame
//!   |--- ACK/NACK --------------------------->|
//!   |<--------------------------- ACK/NACK ---|   one ack half-frame
//! ```
//!
//! A NACKed package is resent in the next frame; a package repeated with
//! the id of the last accepted one is ACKed but dropped. A package either
//! applies to the receive storage in full or not at all.
//!
//! ## Execution contexts
//!
//! - consumer threads drive the public API ([`Engine::post`],
//!   [`Engine::read`], callbacks registry);
//! - the transport callback context runs the frame state machine;
//! - one dispatcher thread invokes consumer callbacks, off the xfer path.

mod dispatch;
pub mod engine;
pub mod error;
pub mod governor;
pub mod stats;
pub mod store;
pub mod txq;

pub use engine::{Engine, EngineConfig, ACK_XFER_SIZE, DEFAULT_DATA_XFER_SIZE};
pub use error::{EngineError, Result};
pub use governor::{ErrorKind, ErrorRateGovernor, Report, Severity};
pub use stats::StatsSnapshot;
pub use store::{Delivery, MessageReadyCallback, MessageStore};

pub use iccom_wire::{ChannelFilter, MAX_CHANNEL};
