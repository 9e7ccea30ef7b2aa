//! Operational counters.
//!
//! Statistics are best-effort: increments are relaxed atomics and no
//! cross-counter consistency is guaranteed. They exist for monitoring and
//! debugging, not for precise measurement, so they add no synchronization
//! cost to the xfer path.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters owned by the engine.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub(crate) transport_xfers_done: AtomicU64,
    pub(crate) transport_bytes_xfered: AtomicU64,
    pub(crate) packages_xfered: AtomicU64,
    pub(crate) packages_sent_ok: AtomicU64,
    pub(crate) packages_received_ok: AtomicU64,
    pub(crate) packages_bad_data_received: AtomicU64,
    pub(crate) packages_duplicated_received: AtomicU64,
    pub(crate) packages_parsing_failed: AtomicU64,
    pub(crate) packages_in_tx_queue: AtomicU64,
    pub(crate) packets_received_ok: AtomicU64,
    pub(crate) messages_received_ok: AtomicU64,
    pub(crate) messages_ready: AtomicU64,
    pub(crate) consumer_bytes_received: AtomicU64,
}

impl EngineStats {
    pub(crate) fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub(crate) fn sub(counter: &AtomicU64, value: u64) {
        counter.fetch_sub(value, Ordering::Relaxed);
    }

    pub(crate) fn set(counter: &AtomicU64, value: u64) {
        counter.store(value, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            transport_xfers_done: read(&self.transport_xfers_done),
            transport_bytes_xfered: read(&self.transport_bytes_xfered),
            packages_xfered: read(&self.packages_xfered),
            packages_sent_ok: read(&self.packages_sent_ok),
            packages_received_ok: read(&self.packages_received_ok),
            packages_bad_data_received: read(&self.packages_bad_data_received),
            packages_duplicated_received: read(&self.packages_duplicated_received),
            packages_parsing_failed: read(&self.packages_parsing_failed),
            packages_in_tx_queue: read(&self.packages_in_tx_queue),
            packets_received_ok: read(&self.packets_received_ok),
            messages_received_ok: read(&self.messages_received_ok),
            messages_ready: read(&self.messages_ready),
            consumer_bytes_received: read(&self.consumer_bytes_received),
        }
    }
}

/// Point-in-time statistics view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub transport_xfers_done: u64,
    pub transport_bytes_xfered: u64,
    pub packages_xfered: u64,
    pub packages_sent_ok: u64,
    pub packages_received_ok: u64,
    pub packages_bad_data_received: u64,
    pub packages_duplicated_received: u64,
    pub packages_parsing_failed: u64,
    pub packages_in_tx_queue: u64,
    pub packets_received_ok: u64,
    pub messages_received_ok: u64,
    pub messages_ready: u64,
    pub consumer_bytes_received: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "transport: xfers done:  {}", self.transport_xfers_done)?;
        writeln!(f, "transport: bytes xfered:  {}", self.transport_bytes_xfered)?;
        writeln!(f, "packages: xfered total:  {}", self.packages_xfered)?;
        writeln!(f, "packages: sent ok:  {}", self.packages_sent_ok)?;
        writeln!(f, "packages: received ok:  {}", self.packages_received_ok)?;
        writeln!(
            f,
            "packages: received corrupted:  {}",
            self.packages_bad_data_received
        )?;
        writeln!(
            f,
            "packages: received duplicated:  {}",
            self.packages_duplicated_received
        )?;
        writeln!(
            f,
            "packages: parsing failed:  {}",
            self.packages_parsing_failed
        )?;
        writeln!(f, "packages: in tx queue:  {}", self.packages_in_tx_queue)?;
        writeln!(f, "packets: received ok:  {}", self.packets_received_ok)?;
        writeln!(f, "messages: received ok:  {}", self.messages_received_ok)?;
        writeln!(f, "messages: ready rx:  {}", self.messages_ready)?;
        write!(
            f,
            "bandwidth: consumer bytes received:  {}",
            self.consumer_bytes_received
        )
    }
}
