//! Consumer delivery worker.
//!
//! Consumer callbacks must never run in the transport callback context: a
//! slow consumer would stall the link. The frame machine only enqueues a
//! drain token here; a dedicated worker thread invokes
//! [`MessageStore::deliver_ready`] once per wake. One wake can deliver
//! messages scheduled by several packages; delivery is idempotent on an
//! empty store.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, trace};

use crate::stats::EngineStats;
use crate::store::MessageStore;

pub(crate) struct Dispatcher {
    wake: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Start the delivery worker.
    pub(crate) fn spawn(store: Arc<MessageStore>, stats: Arc<EngineStats>) -> Self {
        let (wake, tokens) = mpsc::channel::<()>();
        let worker = std::thread::Builder::new()
            .name("iccom-dispatch".into())
            .spawn(move || {
                while tokens.recv().is_ok() {
                    let delivered = store.deliver_ready();
                    if delivered > 0 {
                        trace!(delivered, "consumer delivery pass");
                        EngineStats::sub(&stats.messages_ready, delivered as u64);
                    }
                }
                debug!("dispatcher stopped");
            })
            .ok();

        Self {
            wake: Mutex::new(Some(wake)),
            worker: Mutex::new(worker),
        }
    }

    /// Ask the worker to run one delivery pass. No-op after shutdown.
    pub(crate) fn schedule(&self) {
        let wake = self.wake.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(sender) = wake.as_ref() {
            let _ = sender.send(());
        }
    }

    /// Stop and join the worker. Idempotent; pending wakes are drained
    /// (the worker finishes its current delivery pass first).
    pub(crate) fn shutdown(&self) {
        self.wake
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = worker {
            let _ = handle.join();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
