//! RX message storage.
//!
//! Received messages live here while under construction (fragments still
//! arriving) and once finalized until the consumer fetches them, either by
//! polling or through a message-ready callback.
//!
//! Every mutation caused by one received package is tentative until the
//! whole package parses: `uncommitted_len` tracks the bytes appended per
//! message and [`MessageStore::rollback_all`] undoes them. The peer resends
//! a NACKed package in full, so the store must behave as if a package
//! applies atomically or not at all.
//!
//! Locking: one mutex over the channel map. The lock is released around the
//! byte-copy of an append under the invariant that the transport context is
//! the sole mutator of in-progress messages; consumers only observe
//! finalized, committed messages.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use iccom_wire::ChannelFilter;

/// Message ids are per-channel, wrap around and never take this value.
pub const INVALID_MESSAGE_ID: u32 = 0;

/// First message id assigned in a channel.
pub const INITIAL_MESSAGE_ID: u32 = 1;

/// What the consumer did with a delivered message buffer.
#[derive(Debug)]
pub enum Delivery {
    /// The consumer kept the buffer; the engine drops its reference.
    Taken,
    /// The buffer comes back to the engine and is discarded.
    Borrowed(Bytes),
}

/// Consumer callback invoked for every ready message:
/// `(channel, message_id, data) -> Delivery`.
pub type MessageReadyCallback = Arc<dyn Fn(u16, u32, Bytes) -> Delivery + Send + Sync>;

/// Errors from tentative package application; any of them aborts parsing
/// of the current package and triggers a rollback.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("no message {msg_id} in channel {channel} to extend")]
    NoSuchMessage { channel: u16, msg_id: u32 },

    #[error("message {msg_id} in channel {channel} is already finalized")]
    AlreadyFinalized { channel: u16, msg_id: u32 },
}

#[derive(Debug)]
struct Message {
    id: u32,
    data: BytesMut,
    finalized: bool,
    uncommitted_len: usize,
}

impl Message {
    fn is_ready(&self) -> bool {
        self.finalized && self.uncommitted_len == 0
    }
}

#[derive(Default)]
struct ChannelRecord {
    messages: VecDeque<Message>,
    last_message_id: u32,
    callback: Option<MessageReadyCallback>,
}

impl ChannelRecord {
    fn allocate_message_id(&mut self) -> u32 {
        let next = match self.last_message_id.wrapping_add(1) {
            INVALID_MESSAGE_ID => INITIAL_MESSAGE_ID,
            id => id,
        };
        self.last_message_id = next;
        next
    }

    fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.callback.is_none()
    }
}

#[derive(Default)]
struct StoreInner {
    channels: BTreeMap<u16, ChannelRecord>,
    global_callback: Option<MessageReadyCallback>,
    /// Messages finalized since the last commit.
    uncommitted_finalized: usize,
}

/// Per-channel ordered message lists with commit/rollback and the
/// message-ready callback registry.
#[derive(Default)]
pub struct MessageStore {
    inner: Mutex<StoreInner>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new message to `channel` and assign it an id.
    /// The channel record is created when absent.
    pub fn create_message(&self, channel: u16) -> u32 {
        let mut inner = self.lock();
        let record = inner.channels.entry(channel).or_default();
        let id = record.allocate_message_id();
        record.messages.push_back(Message {
            id,
            data: BytesMut::new(),
            finalized: false,
            uncommitted_len: 0,
        });
        id
    }

    /// Id of the youngest message in `channel` if it is not yet finalized.
    pub fn last_unfinalized(&self, channel: u16) -> Option<u32> {
        let inner = self.lock();
        let message = inner.channels.get(&channel)?.messages.back()?;
        (!message.finalized).then_some(message.id)
    }

    /// Append bytes to the named message; marks it finalized when `final_flag`
    /// is set. The appended bytes stay uncommitted until [`Self::commit_all`].
    pub fn append_to_message(
        &self,
        channel: u16,
        msg_id: u32,
        bytes: &[u8],
        final_flag: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let message = Self::find_message(&mut inner, channel, msg_id)?;
        if message.finalized {
            return Err(StoreError::AlreadyFinalized { channel, msg_id });
        }

        // Take the body out and copy outside the lock: the transport context
        // is the only mutator of unfinalized messages, and consumers never
        // observe them, so the temporarily empty body is invisible.
        let mut data = std::mem::take(&mut message.data);
        drop(inner);

        data.extend_from_slice(bytes);

        let mut inner = self.lock();
        let message = Self::find_message(&mut inner, channel, msg_id)?;
        message.data = data;
        message.uncommitted_len += bytes.len();
        if final_flag {
            message.finalized = true;
            inner.uncommitted_finalized += 1;
        }
        Ok(())
    }

    /// Commit all tentative changes. Returns how many messages were
    /// finalized since the previous commit.
    pub fn commit_all(&self) -> usize {
        let mut inner = self.lock();
        for record in inner.channels.values_mut() {
            for message in &mut record.messages {
                message.uncommitted_len = 0;
            }
        }
        std::mem::take(&mut inner.uncommitted_finalized)
    }

    /// Undo all tentative changes: shrink every touched message by its
    /// uncommitted bytes and clear its finalized flag.
    pub fn rollback_all(&self) {
        let mut inner = self.lock();
        for record in inner.channels.values_mut() {
            for message in &mut record.messages {
                if message.uncommitted_len == 0 {
                    continue;
                }
                let keep = message.data.len() - message.uncommitted_len;
                message.data.truncate(keep);
                message.finalized = false;
                message.uncommitted_len = 0;
            }
        }
        inner.uncommitted_finalized = 0;
    }

    /// Pop the oldest ready message of `channel`; ownership moves to the
    /// caller.
    pub fn pop_first_ready(&self, channel: u16) -> Option<(u32, Bytes)> {
        let mut inner = self.lock();
        let record = inner.channels.get_mut(&channel)?;
        let position = record.messages.iter().position(Message::is_ready)?;
        let message = record.messages.remove(position)?;
        Some((message.id, message.data.freeze()))
    }

    /// Install or clear a message-ready callback.
    ///
    /// `ChannelFilter::Any` addresses the global fallback used when a
    /// channel has no dedicated callback. Passing `None` clears the slot.
    pub fn set_callback(&self, filter: ChannelFilter, callback: Option<MessageReadyCallback>) {
        let mut inner = self.lock();
        match filter {
            ChannelFilter::Any => inner.global_callback = callback,
            ChannelFilter::Id(channel) => match callback {
                Some(callback) => {
                    inner.channels.entry(channel).or_default().callback = Some(callback);
                }
                None => {
                    if let Some(record) = inner.channels.get_mut(&channel) {
                        record.callback = None;
                        if record.is_empty() {
                            inner.channels.remove(&channel);
                        }
                    }
                }
            },
        }
    }

    /// True when a callback is installed for the slot.
    pub fn has_callback(&self, filter: ChannelFilter) -> bool {
        let inner = self.lock();
        match filter {
            ChannelFilter::Any => inner.global_callback.is_some(),
            ChannelFilter::Id(channel) => inner
                .channels
                .get(&channel)
                .is_some_and(|record| record.callback.is_some()),
        }
    }

    /// Deliver every ready message to its consumer callback.
    ///
    /// Per channel the dedicated callback wins over the global fallback;
    /// channels with neither keep their messages for polling. Within one
    /// channel messages are delivered oldest first. The store lock is not
    /// held while a consumer callback runs. Returns the number of messages
    /// delivered (and removed).
    pub fn deliver_ready(&self) -> usize {
        let mut delivered = 0;

        let channels: Vec<u16> = self.lock().channels.keys().copied().collect();
        for channel in channels {
            loop {
                let mut inner = self.lock();
                let per_channel = inner
                    .channels
                    .get(&channel)
                    .and_then(|record| record.callback.clone());
                let Some(callback) = per_channel.or_else(|| inner.global_callback.clone()) else {
                    break;
                };
                let Some(record) = inner.channels.get_mut(&channel) else {
                    break;
                };
                let Some(position) = record.messages.iter().position(Message::is_ready) else {
                    break;
                };
                let Some(message) = record.messages.remove(position) else {
                    break;
                };
                drop(inner);

                debug!(channel, id = message.id, len = message.data.len(), "message ready");
                match callback(channel, message.id, message.data.freeze()) {
                    Delivery::Taken => {}
                    Delivery::Borrowed(data) => drop(data),
                }
                delivered += 1;
            }
        }

        delivered
    }

    /// Drop channel records that hold neither messages nor a callback.
    pub fn collect_garbage(&self) {
        let mut inner = self.lock();
        inner.channels.retain(|_, record| !record.is_empty());
    }

    /// Drop everything, including callbacks. Used on engine close.
    pub fn clear(&self) {
        let mut inner = self.lock();
        let pending: usize = inner
            .channels
            .values()
            .map(|record| record.messages.len())
            .sum();
        if pending > 0 {
            warn!(pending, "dropping undelivered messages on close");
        }
        inner.channels.clear();
        inner.global_callback = None;
        inner.uncommitted_finalized = 0;
    }

    /// Messages currently ready across all channels (diagnostic).
    pub fn ready_count(&self) -> usize {
        let inner = self.lock();
        inner
            .channels
            .values()
            .flat_map(|record| record.messages.iter())
            .filter(|message| message.is_ready())
            .count()
    }

    fn find_message<'a>(
        inner: &'a mut MutexGuard<'_, StoreInner>,
        channel: u16,
        msg_id: u32,
    ) -> Result<&'a mut Message, StoreError> {
        inner
            .channels
            .get_mut(&channel)
            .and_then(|record| {
                record
                    .messages
                    .iter_mut()
                    .find(|message| message.id == msg_id)
            })
            .ok_or(StoreError::NoSuchMessage { channel, msg_id })
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn push(store: &MessageStore, channel: u16, bytes: &[u8], final_flag: bool) -> u32 {
        let id = store
            .last_unfinalized(channel)
            .unwrap_or_else(|| store.create_message(channel));
        store
            .append_to_message(channel, id, bytes, final_flag)
            .unwrap();
        id
    }

    #[test]
    fn append_and_pop_ready() {
        let store = MessageStore::new();
        let id = push(&store, 5, b"hello", true);
        assert_eq!(id, INITIAL_MESSAGE_ID);

        // still uncommitted, not visible
        assert!(store.pop_first_ready(5).is_none());

        assert_eq!(store.commit_all(), 1);
        let (popped_id, data) = store.pop_first_ready(5).unwrap();
        assert_eq!(popped_id, id);
        assert_eq!(data.as_ref(), b"hello");
        assert!(store.pop_first_ready(5).is_none());
    }

    #[test]
    fn fragments_accumulate_into_one_message() {
        let store = MessageStore::new();
        let id = push(&store, 1, b"abc", false);
        store.commit_all();
        assert_eq!(store.last_unfinalized(1), Some(id));

        store.append_to_message(1, id, b"def", true).unwrap();
        store.commit_all();

        let (_, data) = store.pop_first_ready(1).unwrap();
        assert_eq!(data.as_ref(), b"abcdef");
    }

    #[test]
    fn append_to_missing_message_fails() {
        let store = MessageStore::new();
        let err = store.append_to_message(1, 42, b"x", false).unwrap_err();
        assert_eq!(
            err,
            StoreError::NoSuchMessage {
                channel: 1,
                msg_id: 42
            }
        );
    }

    #[test]
    fn append_to_finalized_message_fails() {
        let store = MessageStore::new();
        let id = push(&store, 1, b"done", true);
        let err = store.append_to_message(1, id, b"more", false).unwrap_err();
        assert_eq!(
            err,
            StoreError::AlreadyFinalized {
                channel: 1,
                msg_id: id
            }
        );
    }

    #[test]
    fn rollback_undoes_uncommitted_bytes_and_finalization() {
        let store = MessageStore::new();
        // committed first fragment
        let id = push(&store, 3, b"keep-", false);
        store.commit_all();

        // tentative second fragment that would finalize
        store.append_to_message(3, id, b"drop", true).unwrap();
        store.rollback_all();

        // the message is back to its committed prefix, unfinalized
        assert_eq!(store.last_unfinalized(3), Some(id));
        assert!(store.pop_first_ready(3).is_none());

        // the retransmitted fragment applies cleanly
        store.append_to_message(3, id, b"it", true).unwrap();
        assert_eq!(store.commit_all(), 1);
        let (_, data) = store.pop_first_ready(3).unwrap();
        assert_eq!(data.as_ref(), b"keep-it");
    }

    #[test]
    fn rollback_resets_finalized_counter() {
        let store = MessageStore::new();
        push(&store, 1, b"a", true);
        store.rollback_all();
        push(&store, 2, b"b", true);
        assert_eq!(store.commit_all(), 1);
    }

    #[test]
    fn rollback_leaves_committed_messages_alone() {
        let store = MessageStore::new();
        push(&store, 1, b"stable", true);
        store.commit_all();

        push(&store, 1, b"volatile", true);
        store.rollback_all();

        let (_, data) = store.pop_first_ready(1).unwrap();
        assert_eq!(data.as_ref(), b"stable");
    }

    #[test]
    fn pop_order_is_oldest_first() {
        let store = MessageStore::new();
        push(&store, 7, b"one", true);
        push(&store, 7, b"two", true);
        store.commit_all();

        assert_eq!(store.pop_first_ready(7).unwrap().1.as_ref(), b"one");
        assert_eq!(store.pop_first_ready(7).unwrap().1.as_ref(), b"two");
    }

    #[test]
    fn ready_message_behind_open_one_is_reachable() {
        let store = MessageStore::new();
        // open (unfinalized) message first, then a completed one
        push(&store, 9, b"open", false);
        push(&store, 9, b"done", true);
        store.commit_all();

        let (_, data) = store.pop_first_ready(9).unwrap();
        assert_eq!(data.as_ref(), b"done");
        assert!(store.last_unfinalized(9).is_some());
    }

    #[test]
    fn message_ids_wrap_skipping_invalid() {
        let record = &mut ChannelRecord {
            last_message_id: u32::MAX,
            ..Default::default()
        };
        assert_eq!(record.allocate_message_id(), INITIAL_MESSAGE_ID);
        assert_eq!(record.allocate_message_id(), 2);
    }

    #[test]
    fn callbacks_prefer_channel_over_global() {
        let store = MessageStore::new();
        let hits: Arc<Mutex<Vec<(&'static str, u16, Vec<u8>)>>> = Arc::default();

        let channel_hits = Arc::clone(&hits);
        store.set_callback(
            ChannelFilter::Id(4),
            Some(Arc::new(move |channel, _, data: Bytes| {
                channel_hits
                    .lock()
                    .unwrap()
                    .push(("channel", channel, data.to_vec()));
                Delivery::Taken
            })),
        );
        let global_hits = Arc::clone(&hits);
        store.set_callback(
            ChannelFilter::Any,
            Some(Arc::new(move |channel, _, data: Bytes| {
                global_hits
                    .lock()
                    .unwrap()
                    .push(("global", channel, data.to_vec()));
                Delivery::Borrowed(data)
            })),
        );

        push(&store, 4, b"direct", true);
        push(&store, 8, b"fallback", true);
        store.commit_all();

        assert_eq!(store.deliver_ready(), 2);
        let hits = hits.lock().unwrap();
        assert!(hits.contains(&("channel", 4, b"direct".to_vec())));
        assert!(hits.contains(&("global", 8, b"fallback".to_vec())));
    }

    #[test]
    fn no_callback_keeps_messages_for_polling() {
        let store = MessageStore::new();
        push(&store, 2, b"kept", true);
        store.commit_all();

        assert_eq!(store.deliver_ready(), 0);
        assert!(store.pop_first_ready(2).is_some());
    }

    #[test]
    fn unready_messages_are_never_delivered() {
        let store = MessageStore::new();
        store.set_callback(
            ChannelFilter::Any,
            Some(Arc::new(|_, _, data| Delivery::Borrowed(data))),
        );

        push(&store, 1, b"in-progress", false);
        store.commit_all();
        assert_eq!(store.deliver_ready(), 0);

        // finalized but uncommitted: still invisible
        push(&store, 2, b"tentative", true);
        assert_eq!(store.deliver_ready(), 0);
    }

    #[test]
    fn in_channel_delivery_order_is_preserved() {
        let store = MessageStore::new();
        let order: Arc<Mutex<Vec<Vec<u8>>>> = Arc::default();
        let sink = Arc::clone(&order);
        store.set_callback(
            ChannelFilter::Id(6),
            Some(Arc::new(move |_, _, data: Bytes| {
                sink.lock().unwrap().push(data.to_vec());
                Delivery::Taken
            })),
        );

        for payload in [b"first".as_slice(), b"second", b"third"] {
            push(&store, 6, payload, true);
        }
        store.commit_all();
        store.deliver_ready();

        assert_eq!(
            order.lock().unwrap().as_slice(),
            &[b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
        );
    }

    #[test]
    fn clearing_callbacks() {
        let store = MessageStore::new();
        store.set_callback(
            ChannelFilter::Id(1),
            Some(Arc::new(|_, _, data| Delivery::Borrowed(data))),
        );
        store.set_callback(
            ChannelFilter::Any,
            Some(Arc::new(|_, _, data| Delivery::Borrowed(data))),
        );
        assert!(store.has_callback(ChannelFilter::Id(1)));
        assert!(store.has_callback(ChannelFilter::Any));

        store.set_callback(ChannelFilter::Id(1), None);
        store.set_callback(ChannelFilter::Any, None);
        assert!(!store.has_callback(ChannelFilter::Id(1)));
        assert!(!store.has_callback(ChannelFilter::Any));
    }

    #[test]
    fn garbage_collection_drops_empty_records() {
        let store = MessageStore::new();
        push(&store, 1, b"x", true);
        store.commit_all();
        store.pop_first_ready(1).unwrap();

        store.collect_garbage();
        // record is gone; a new message gets a fresh id sequence
        assert_eq!(store.create_message(1), INITIAL_MESSAGE_ID);
    }

    #[test]
    fn clear_drops_everything() {
        let store = MessageStore::new();
        push(&store, 1, b"x", true);
        store.set_callback(
            ChannelFilter::Any,
            Some(Arc::new(|_, _, data| Delivery::Borrowed(data))),
        );
        store.commit_all();

        store.clear();
        assert!(store.pop_first_ready(1).is_none());
        assert!(!store.has_callback(ChannelFilter::Any));
        assert_eq!(store.ready_count(), 0);
    }
}
