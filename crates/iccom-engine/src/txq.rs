//! TX package queue.
//!
//! Outbound messages are fragmented into packets and packed into the queue
//! of fixed-size packages. The head package is the one currently handed to
//! the transport; its bytes are never mutated in place, the frame machine
//! takes a copy for each xfer and the head is only replaced after the peer
//! acknowledged it.
//!
//! Invariants between operations:
//! - the queue always holds at least one package;
//! - every package is finalized (valid frame, correct CRC);
//! - new data is only appended to the tail, never to the head.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use iccom_wire::{next_package_id, Crc32, Package, Result, INITIAL_PACKAGE_ID};

struct TxInner {
    packages: VecDeque<Package>,
    next_id: u8,
}

impl TxInner {
    fn allocate_id(&mut self) -> u8 {
        let id = self.next_id;
        self.next_id = next_package_id(id);
        id
    }
}

/// Ordered queue of outbound packages.
pub struct TxQueue {
    inner: Mutex<TxInner>,
    frame_size: usize,
    crc: Arc<Crc32>,
}

impl TxQueue {
    /// Create the queue seeded with one empty package, so the frame machine
    /// always has a well-defined next data xfer.
    pub fn new(frame_size: usize, crc: Arc<Crc32>) -> Result<Self> {
        let mut inner = TxInner {
            packages: VecDeque::new(),
            next_id: INITIAL_PACKAGE_ID,
        };
        let id = inner.allocate_id();
        inner.packages.push_back(Package::new_empty(id, frame_size, &crc)?);
        Ok(Self {
            inner: Mutex::new(inner),
            frame_size,
            crc,
        })
    }

    /// Fragment `data` into packets appended to the queue tail, spilling
    /// into new packages as needed, and finalize the resulting tail.
    ///
    /// The head is assumed to be in active xfer, so when it is the only
    /// package a fresh tail is started instead of touching it.
    pub fn append_message(&self, data: &[u8], channel: u16) -> Result<()> {
        let mut inner = self.lock();

        if inner.packages.len() == 1 {
            self.enqueue_tail(&mut inner)?;
        }

        let mut written = 0;
        while written < data.len() {
            let consumed = match inner.packages.back_mut() {
                Some(tail) => tail.add_packet(&data[written..], channel),
                None => 0,
            };
            if consumed == 0 {
                // tail ran out of room for even a minimal packet
                self.enqueue_tail(&mut inner)?;
                continue;
            }
            written += consumed;
        }

        if let Some(tail) = inner.packages.back_mut() {
            tail.finalize(&self.crc);
        }
        trace!(channel, bytes = data.len(), depth = inner.packages.len(), "message queued");
        Ok(())
    }

    /// Step the queue forward after the head package was acknowledged.
    ///
    /// With more than one package the delivered head is dropped; a single
    /// package is instead reused in place: emptied, re-identified and
    /// re-finalized, which keeps the queue non-empty without allocating on
    /// the hot path. Returns true when real pending data remained beyond
    /// the delivered head.
    pub fn advance_on_ack(&self) -> bool {
        let mut inner = self.lock();
        if inner.packages.len() > 1 {
            inner.packages.pop_front();
            return true;
        }

        let id = inner.allocate_id();
        if let Some(head) = inner.packages.front_mut() {
            head.make_empty(id, &self.crc);
        }
        false
    }

    /// Copy of the head frame bytes for the next data xfer. Empty only
    /// after [`Self::drain`] during teardown.
    pub fn head_frame(&self) -> Vec<u8> {
        let inner = self.lock();
        inner
            .packages
            .front()
            .map(|head| head.as_bytes().to_vec())
            .unwrap_or_default()
    }

    /// Number of packages currently queued.
    pub fn depth(&self) -> usize {
        self.lock().packages.len()
    }

    /// Drop all queued packages. Only valid during engine teardown; the
    /// never-empty invariant is deliberately released here.
    pub fn drain(&self) -> usize {
        let mut inner = self.lock();
        let dropped = inner.packages.len();
        inner.packages.clear();
        dropped
    }

    fn enqueue_tail(&self, inner: &mut MutexGuard<'_, TxInner>) -> Result<()> {
        if let Some(tail) = inner.packages.back_mut() {
            tail.finalize(&self.crc);
        }
        let id = inner.allocate_id();
        let package = Package::new_empty(id, self.frame_size, &self.crc)?;
        inner.packages.push_back(package);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, TxInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
