//! Engine façade and frame state machine.
//!
//! The protocol alternates two half-frames on the underlying transport:
//! a data xfer carrying one package in each direction, then an ack xfer
//! carrying one acknowledgement byte in each direction. The state machine
//! runs entirely in the transport callback context; consumer threads only
//! touch the TX queue and the RX store through the public API.
//!
//! ```text
//! DataStage:  validate rx package -> ACK/NACK decision, schedule delivery
//! AckStage:   peer ACK -> advance TX queue; otherwise resend the head
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use iccom_transport::{SymmetricDuplex, TransportError, XferDecision, XferDone, XferHandler};
use iccom_wire::{
    frame_id, frame_payload, is_ack, is_valid_channel, validate, ChannelFilter, Crc32, Packet,
    ACK_BYTE, NACK_BYTE,
};

use crate::dispatch::Dispatcher;
use crate::error::{EngineError, Result};
use crate::governor::{ErrorKind, ErrorRateGovernor, Severity};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::store::{MessageReadyCallback, MessageStore};
use crate::txq::TxQueue;

/// Size of one data xfer (and thus one package frame) by default.
pub const DEFAULT_DATA_XFER_SIZE: usize = 256;

/// Size of one ack xfer in bytes. Fixed by the protocol.
pub const ACK_XFER_SIZE: usize = 1;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Size of one data xfer in bytes; both sides must agree on it.
    pub data_xfer_size: usize,
}

impl EngineConfig {
    /// Override the data xfer size.
    pub fn with_data_xfer_size(mut self, data_xfer_size: usize) -> Self {
        self.data_xfer_size = data_xfer_size;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_xfer_size: DEFAULT_DATA_XFER_SIZE,
        }
    }
}

/// Frame machine state. Only the transport callback context touches it.
struct FrameState {
    /// True while the next completed xfer is a data xfer.
    data_stage: bool,
    /// Id of the last accepted package; 0 until the first acceptance
    /// (package ids are never 0).
    last_rx_id: u8,
}

pub(crate) struct EngineCore {
    crc: Arc<Crc32>,
    tx_queue: TxQueue,
    rx_store: Arc<MessageStore>,
    stats: Arc<EngineStats>,
    governor: ErrorRateGovernor,
    dispatcher: Dispatcher,
    frame: Mutex<FrameState>,
    closing: AtomicBool,
}

impl EngineCore {
    /// Process a received data frame; returns true to ACK, false to NACK.
    fn handle_data_frame(&self, frame: &mut FrameState, received: &[u8]) -> bool {
        let payload_len = match validate(received, &self.crc) {
            Ok(len) => len,
            Err(err) => {
                debug!(%err, "received package failed validation");
                EngineStats::add(&self.stats.packages_bad_data_received, 1);
                return false;
            }
        };

        let id = frame_id(received);
        if id == frame.last_rx_id {
            // already received and processed; ack again, drop the payload
            debug!(id, "duplicated package");
            EngineStats::add(&self.stats.packages_duplicated_received, 1);
            return true;
        }

        match self.apply_package_payload(frame_payload(received, payload_len)) {
            Ok(()) => {
                EngineStats::add(&self.stats.packages_received_ok, 1);
                frame.last_rx_id = id;
                true
            }
            Err(()) => {
                self.rx_store.rollback_all();
                EngineStats::add(&self.stats.packages_parsing_failed, 1);
                false
            }
        }
    }

    /// Tentatively apply every packet of one package payload to the RX
    /// store, then commit. Parsing ends cleanly only when exactly zero
    /// bytes remain; any shorter leftover is an error.
    fn apply_package_payload(&self, payload: &[u8]) -> std::result::Result<(), ()> {
        let mut window = payload;
        let mut packets = 0u64;
        let mut consumer_bytes = 0u64;

        while !window.is_empty() {
            let packet = match Packet::parse(window) {
                Ok(packet) => packet,
                Err(err) => {
                    debug!(%err, offset = payload.len() - window.len(), "broken packet");
                    return Err(());
                }
            };

            let msg_id = self
                .rx_store
                .last_unfinalized(packet.channel)
                .unwrap_or_else(|| self.rx_store.create_message(packet.channel));
            if let Err(err) = self.rx_store.append_to_message(
                packet.channel,
                msg_id,
                packet.payload,
                packet.complete,
            ) {
                debug!(%err, channel = packet.channel, "packet apply failed");
                return Err(());
            }

            packets += 1;
            consumer_bytes += packet.payload.len() as u64;
            window = &window[packet.wire_size()..];
        }

        let finalized = self.rx_store.commit_all() as u64;
        EngineStats::add(&self.stats.packets_received_ok, packets);
        EngineStats::add(&self.stats.messages_received_ok, finalized);
        EngineStats::add(&self.stats.consumer_bytes_received, consumer_bytes);
        EngineStats::add(&self.stats.messages_ready, finalized);
        if finalized > 0 {
            self.dispatcher.schedule();
        }
        Ok(())
    }

    fn report(&self, kind: ErrorKind) {
        let Some(report) = self.governor.record(kind) else {
            return;
        };
        match report.severity {
            Severity::Error => error!(
                rate_per_sec = report.rate_per_sec,
                suppressed = report.suppressed,
                total = report.total,
                "{}",
                kind.message()
            ),
            Severity::Warning => warn!(
                rate_per_sec = report.rate_per_sec,
                suppressed = report.suppressed,
                total = report.total,
                "{}",
                kind.message()
            ),
        }
    }

    fn sync_queue_gauge(&self) {
        EngineStats::set(&self.stats.packages_in_tx_queue, self.tx_queue.depth() as u64);
    }

    fn lock_frame(&self) -> MutexGuard<'_, FrameState> {
        self.frame
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl XferHandler for EngineCore {
    fn xfer_done(&self, done: XferDone<'_>) -> XferDecision {
        if self.closing.load(Ordering::Acquire) {
            return XferDecision::Halt;
        }

        EngineStats::add(&self.stats.transport_xfers_done, 1);
        EngineStats::add(&self.stats.transport_bytes_xfered, done.received.len() as u64);

        let mut frame = self.lock_frame();
        if frame.data_stage {
            EngineStats::add(&self.stats.packages_xfered, 1);
            let ack = self.handle_data_frame(&mut frame, done.received);
            frame.data_stage = false;
            // the ack half always follows without waiting for a trigger
            XferDecision::next(vec![if ack { ACK_BYTE } else { NACK_BYTE }], true)
        } else {
            let start_immediately = if is_ack(done.received) {
                EngineStats::add(&self.stats.packages_sent_ok, 1);
                let had_pending = self.tx_queue.advance_on_ack();
                self.sync_queue_gauge();
                had_pending
            } else {
                // NACK or garbled ack byte: resend the head immediately
                debug!("peer nacked, resending head package");
                true
            };
            frame.data_stage = true;
            XferDecision::next(self.tx_queue.head_frame(), start_immediately)
        }
    }

    fn xfer_failed(&self, error: &TransportError) -> XferDecision {
        if self.closing.load(Ordering::Acquire) {
            return XferDecision::Halt;
        }

        self.report(ErrorKind::Transport);
        debug!(%error, "transport failure, forcing nack half");

        // Drive the frame forward even on failure so the halves stay
        // aligned with the peer: answer the data half with a NACK.
        let mut frame = self.lock_frame();
        frame.data_stage = false;
        XferDecision::next(vec![NACK_BYTE], true)
    }
}

/// The ICCom protocol engine bound to one transport device.
pub struct Engine<T: SymmetricDuplex> {
    transport: Mutex<T>,
    core: Arc<EngineCore>,
}

impl<T: SymmetricDuplex> Engine<T> {
    /// Initialize the engine and arm `transport` with the first xfer.
    pub fn start(mut transport: T, config: EngineConfig) -> Result<Self> {
        let crc = Arc::new(Crc32::new());
        let tx_queue = TxQueue::new(config.data_xfer_size, Arc::clone(&crc))?;
        let rx_store = Arc::new(MessageStore::new());
        let stats = Arc::new(EngineStats::default());
        let dispatcher = Dispatcher::spawn(Arc::clone(&rx_store), Arc::clone(&stats));

        let core = Arc::new(EngineCore {
            crc,
            tx_queue,
            rx_store,
            stats,
            governor: ErrorRateGovernor::new(),
            dispatcher,
            frame: Mutex::new(FrameState {
                data_stage: true,
                last_rx_id: 0,
            }),
            closing: AtomicBool::new(false),
        });
        core.sync_queue_gauge();

        let initial = core.tx_queue.head_frame();
        let handler: Arc<dyn XferHandler> = Arc::clone(&core) as Arc<dyn XferHandler>;
        if let Err(err) = transport.init(initial, handler) {
            core.dispatcher.shutdown();
            return Err(EngineError::Transport(err));
        }

        info!(data_xfer_size = config.data_xfer_size, "iccom engine started");
        Ok(Self {
            transport: Mutex::new(transport),
            core,
        })
    }

    /// Queue `data` for transmission on `channel` and kick the transport.
    ///
    /// Messages posted to one channel are serialized in call order.
    pub fn post(&self, channel: u16, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        Self::check_channel(channel)?;
        if data.is_empty() {
            return Err(EngineError::EmptyMessage);
        }

        self.core.tx_queue.append_message(data, channel)?;
        self.core.sync_queue_gauge();
        self.kick_transport();
        Ok(())
    }

    /// Start an xfer of the current head package even if it is empty.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.kick_transport();
        Ok(())
    }

    /// Pop the oldest ready message of `channel`, if any.
    pub fn read(&self, channel: u16) -> Result<Option<(Bytes, u32)>> {
        self.ensure_open()?;
        Self::check_channel(channel)?;

        let Some((id, data)) = self.core.rx_store.pop_first_ready(channel) else {
            return Ok(None);
        };
        EngineStats::sub(&self.core.stats.messages_ready, 1);
        Ok(Some((data, id)))
    }

    /// Install a message-ready callback for one channel or, with
    /// [`ChannelFilter::Any`], the global fallback. `None` clears the slot.
    pub fn set_channel_callback(
        &self,
        filter: ChannelFilter,
        callback: Option<MessageReadyCallback>,
    ) -> Result<()> {
        self.ensure_open()?;
        if let ChannelFilter::Id(channel) = filter {
            Self::check_channel(channel)?;
        }
        self.core.rx_store.set_callback(filter, callback);
        Ok(())
    }

    /// Remove the callback installed for the slot.
    pub fn remove_channel_callback(&self, filter: ChannelFilter) -> Result<()> {
        self.set_channel_callback(filter, None)
    }

    /// True when a callback is installed for the slot.
    pub fn has_channel_callback(&self, filter: ChannelFilter) -> bool {
        self.core.rx_store.has_callback(filter)
    }

    /// Point-in-time statistics.
    pub fn statistics(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }

    /// True while the engine and its transport are operational.
    pub fn is_running(&self) -> bool {
        !self.core.closing.load(Ordering::Acquire) && self.lock_transport().is_running()
    }

    /// Shut the engine down: stop consumer delivery, halt the transport,
    /// drop queued packages and stored messages. Idempotent; once closing
    /// starts every public call fails with [`EngineError::ShuttingDown`].
    ///
    /// Joins the dispatcher thread, so it must not be called from inside a
    /// message-ready callback.
    pub fn close(&self) {
        if self
            .core
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        info!("closing iccom engine");

        self.core.dispatcher.shutdown();
        self.lock_transport().close();

        let dropped = self.core.tx_queue.drain();
        if dropped > 1 {
            warn!(dropped = dropped - 1, "undelivered tx packages dropped on close");
        }
        self.core.sync_queue_gauge();
        self.core.rx_store.clear();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.core.closing.load(Ordering::Acquire) {
            return Err(EngineError::ShuttingDown);
        }
        Ok(())
    }

    fn check_channel(channel: u16) -> Result<()> {
        if !is_valid_channel(channel) {
            return Err(EngineError::InvalidChannel(channel));
        }
        Ok(())
    }

    fn kick_transport(&self) {
        match self.lock_transport().trigger() {
            Ok(()) => {}
            // an xfer is already running; the callback chain carries on
            Err(TransportError::Busy) => {}
            Err(err) => debug!(%err, "transport trigger declined"),
        }
    }

    fn lock_transport(&self) -> MutexGuard<'_, T> {
        self.transport
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: SymmetricDuplex> Drop for Engine<T> {
    fn drop(&mut self) {
        self.close();
    }
}
