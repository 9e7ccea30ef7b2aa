//! In-process symmetric wire joining two transport endpoints.
//!
//! Emulates a symmetric SPI link: one [`pump`](WireLink::pump) call performs
//! exactly one full-duplex exchange, handing each side's outbound bytes to
//! the opposite handler and collecting the next xfers. Tests drive the link
//! deterministically; the loopback demo runs it from a background thread.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, trace};

use crate::error::{Result, TransportError};
use crate::traits::{SymmetricDuplex, XferDecision, XferDone, XferHandler};

/// One of the two endpoints of a [`WireLink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    A,
    B,
}

impl Peer {
    fn index(self) -> usize {
        match self {
            Peer::A => 0,
            Peer::B => 1,
        }
    }
}

type RxTap = Box<dyn FnOnce(&mut Vec<u8>) + Send>;

struct Side {
    tx: Option<Vec<u8>>,
    handler: Option<Arc<dyn XferHandler>>,
}

struct State {
    sides: [Side; 2],
    running: bool,
    kicked: bool,
    immediate: bool,
    /// One-shot mutations applied to the bytes delivered toward each side.
    rx_taps: [Option<RxTap>; 2],
    /// When set, the next pump reports a transport failure instead of
    /// exchanging data.
    fail_next: bool,
}

struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
    /// Serializes handler invocation: the transport callback context.
    pump_serial: Mutex<()>,
}

/// The shared wire; owns the exchange loop.
#[derive(Clone)]
pub struct WireLink {
    shared: Arc<Shared>,
}

/// An endpoint handed to one protocol engine.
pub struct WireEnd {
    shared: Arc<Shared>,
    index: usize,
}

/// Create a wire and its two endpoints.
pub fn wire_pair() -> (WireLink, WireEnd, WireEnd) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            sides: [
                Side {
                    tx: None,
                    handler: None,
                },
                Side {
                    tx: None,
                    handler: None,
                },
            ],
            running: true,
            kicked: false,
            immediate: false,
            rx_taps: [None, None],
            fail_next: false,
        }),
        wakeup: Condvar::new(),
        pump_serial: Mutex::new(()),
    });

    (
        WireLink {
            shared: Arc::clone(&shared),
        },
        WireEnd {
            shared: Arc::clone(&shared),
            index: 0,
        },
        WireEnd { shared, index: 1 },
    )
}

impl WireLink {
    /// Perform one full-duplex exchange if both endpoints are armed.
    ///
    /// Returns true when another exchange is already wanted (a handler
    /// requested an immediate start, or an endpoint triggered).
    pub fn pump(&self) -> Result<bool> {
        let _serial = self
            .shared
            .pump_serial
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let (tx_a, tx_b, handler_a, handler_b, taps, fail) = {
            let mut state = self.lock_state();
            if !state.running {
                return Ok(false);
            }
            let (Some(tx_a), Some(tx_b)) = (state.sides[0].tx.clone(), state.sides[1].tx.clone())
            else {
                return Ok(false);
            };
            let (Some(handler_a), Some(handler_b)) = (
                state.sides[0].handler.clone(),
                state.sides[1].handler.clone(),
            ) else {
                return Ok(false);
            };
            state.kicked = false;
            state.immediate = false;
            let taps = [state.rx_taps[0].take(), state.rx_taps[1].take()];
            let fail = std::mem::take(&mut state.fail_next);
            (tx_a, tx_b, handler_a, handler_b, taps, fail)
        };

        if fail {
            debug!("injected wire fault");
            let error = TransportError::XferFailed("injected wire fault".into());
            let decision_a = handler_a.xfer_failed(&error);
            let decision_b = handler_b.xfer_failed(&error);
            return Ok(self.apply(decision_a, decision_b));
        }

        if tx_a.len() != tx_b.len() {
            return Err(TransportError::SizeMismatch {
                local: tx_a.len(),
                remote: tx_b.len(),
            });
        }

        // Bytes as they arrive on each side, after any injected corruption.
        let mut rx_a = tx_b.clone();
        let mut rx_b = tx_a.clone();
        let [tap_a, tap_b] = taps;
        if let Some(tap) = tap_a {
            tap(&mut rx_a);
        }
        if let Some(tap) = tap_b {
            tap(&mut rx_b);
        }

        trace!(bytes = tx_a.len(), "wire exchange");

        let decision_a = handler_a.xfer_done(XferDone {
            sent: &tx_a,
            received: &rx_a,
        });
        let decision_b = handler_b.xfer_done(XferDone {
            sent: &tx_b,
            received: &rx_b,
        });

        Ok(self.apply(decision_a, decision_b))
    }

    /// Pump once, then keep pumping while either side wants another
    /// exchange, bounded by `max`. Returns the number of exchanges.
    pub fn pump_until_idle(&self, max: usize) -> Result<usize> {
        let mut count = 0;
        while count < max {
            count += 1;
            if !self.pump()? {
                break;
            }
        }
        Ok(count)
    }

    /// Mutate the next frame delivered toward `peer` (one shot).
    pub fn tamper_rx(&self, peer: Peer, tap: impl FnOnce(&mut Vec<u8>) + Send + 'static) {
        self.lock_state().rx_taps[peer.index()] = Some(Box::new(tap));
    }

    /// Make the next pump report a transport fault to both sides.
    pub fn fail_next(&self) {
        self.lock_state().fail_next = true;
    }

    /// True while neither side has halted the wire.
    pub fn is_running(&self) -> bool {
        self.lock_state().running
    }

    /// Run the exchange loop on a background thread until the wire halts.
    pub fn spawn_pump_thread(&self) -> std::io::Result<JoinHandle<()>> {
        let link = self.clone();
        std::thread::Builder::new()
            .name("iccom-wire".into())
            .spawn(move || link.pump_loop())
    }

    fn pump_loop(&self) {
        loop {
            {
                let mut state = self.lock_state();
                while state.running && !state.kicked && !state.immediate {
                    state = self
                        .shared
                        .wakeup
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                if !state.running {
                    return;
                }
            }
            match self.pump() {
                Ok(_) => {}
                Err(err) => {
                    debug!(%err, "wire pump stopped");
                    return;
                }
            }
        }
    }

    fn apply(&self, decision_a: XferDecision, decision_b: XferDecision) -> bool {
        let mut immediate = false;
        let mut halted = false;

        let mut state = self.lock_state();
        for (side, decision) in state.sides.iter_mut().zip([decision_a, decision_b]) {
            match decision {
                XferDecision::Next {
                    tx,
                    start_immediately,
                } => {
                    side.tx = Some(tx);
                    immediate |= start_immediately;
                }
                XferDecision::Halt => {
                    debug!("handler halted the wire");
                    halted = true;
                }
            }
        }
        if halted {
            state.running = false;
        }
        state.immediate |= immediate;

        let more = state.running && (state.immediate || state.kicked);
        if more {
            self.shared.wakeup.notify_all();
        }
        more
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SymmetricDuplex for WireEnd {
    fn init(&mut self, initial_tx: Vec<u8>, handler: Arc<dyn XferHandler>) -> Result<()> {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !state.running {
            return Err(TransportError::NotRunning);
        }
        let side = &mut state.sides[self.index];
        side.tx = Some(initial_tx);
        side.handler = Some(handler);
        Ok(())
    }

    fn trigger(&self) -> Result<()> {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !state.running {
            return Err(TransportError::NotRunning);
        }
        if state.sides[self.index].handler.is_none() {
            return Err(TransportError::NoDevice);
        }
        state.kicked = true;
        self.shared.wakeup.notify_all();
        Ok(())
    }

    fn reset(&mut self, initial_tx: Vec<u8>) -> Result<()> {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !state.running {
            return Err(TransportError::NotRunning);
        }
        if state.sides[self.index].handler.is_none() {
            return Err(TransportError::NoDevice);
        }
        state.sides[self.index].tx = Some(initial_tx);
        Ok(())
    }

    fn is_running(&self) -> bool {
        let state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.running && state.sides[self.index].handler.is_some()
    }

    fn close(&mut self) {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.running = false;
        self.shared.wakeup.notify_all();
    }
}
