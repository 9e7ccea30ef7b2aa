use std::sync::Arc;

use crate::error::{Result, TransportError};

/// A completed symmetric xfer as seen from one side.
#[derive(Debug, Clone, Copy)]
pub struct XferDone<'a> {
    /// The bytes this side sent.
    pub sent: &'a [u8],
    /// The bytes received from the other side. Same length as `sent`.
    pub received: &'a [u8],
}

/// What the protocol layer wants the device to do after an xfer completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XferDecision {
    /// Replace the current xfer data with `tx`; when `start_immediately`
    /// is set the device starts the next xfer without waiting for either
    /// side to trigger it.
    Next {
        tx: Vec<u8>,
        start_immediately: bool,
    },
    /// Stop the device. Returned while the protocol layer is shutting down.
    Halt,
}

impl XferDecision {
    /// Convenience constructor for the common case.
    pub fn next(tx: Vec<u8>, start_immediately: bool) -> Self {
        Self::Next {
            tx,
            start_immediately,
        }
    }
}

/// Protocol-side callbacks invoked by the transport device.
///
/// The device guarantees these are never invoked concurrently: all calls
/// happen on one serialized transport context.
pub trait XferHandler: Send + Sync {
    /// An xfer finished; decide the next one.
    fn xfer_done(&self, done: XferDone<'_>) -> XferDecision;

    /// An xfer failed on the device; decide how to resume framing.
    fn xfer_failed(&self, error: &TransportError) -> XferDecision;
}

/// A symmetric full-duplex byte-exchange device.
///
/// Both sides of the link always exchange the same number of bytes per
/// xfer, and either side may initiate one. Implementations keep a current
/// outbound buffer so a peer-initiated xfer always has data to send.
pub trait SymmetricDuplex {
    /// Attach the protocol handler and arm the device with its first
    /// outbound xfer. Must be called exactly once before any exchange.
    fn init(&mut self, initial_tx: Vec<u8>, handler: Arc<dyn XferHandler>) -> Result<()>;

    /// Ask the device to start an xfer of the current outbound data if it
    /// is idle. Returns [`TransportError::Busy`] when an xfer is already
    /// running, which callers may ignore.
    fn trigger(&self) -> Result<()>;

    /// Re-arm the device with a fresh outbound xfer after an external
    /// fault. The protocol layer recovers line errors through its own
    /// NACK framing and never calls this; it exists for integrators.
    fn reset(&mut self, initial_tx: Vec<u8>) -> Result<()>;

    /// True while the device is initialized and not closed.
    fn is_running(&self) -> bool;

    /// Stop the device. Idempotent; pending xfers are abandoned.
    fn close(&mut self);
}
