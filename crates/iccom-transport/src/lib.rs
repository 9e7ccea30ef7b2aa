//! Transport abstraction for ICCom.
//!
//! ICCom runs on top of a *symmetric full-duplex* byte-exchange device
//! (typified by a symmetric SPI link): within one xfer both sides send and
//! receive exactly the same number of bytes, and either side may start the
//! xfer. The protocol engine consumes the [`SymmetricDuplex`] trait and
//! feeds the device through an [`XferHandler`]; it never owns the timing of
//! the link.
//!
//! [`WireLink`] is an in-process implementation joining two endpoints, used
//! by the test suite and the loopback demo.

pub mod error;
pub mod traits;
pub mod wire;

pub use error::{Result, TransportError};
pub use traits::{SymmetricDuplex, XferDecision, XferDone, XferHandler};
pub use wire::{wire_pair, Peer, WireEnd, WireLink};
