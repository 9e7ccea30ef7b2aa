//! Frame-level scenarios driving one engine with hand-built peer frames.
//!
//! A scripted transport feeds exact byte sequences into the engine's xfer
//! callbacks, which pins down wire-format details the loopback tests cannot
//! reach: packet interleaving across channels, mid-package parse failures
//! with rollback, and the close sentinel.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use iccom_engine::{ChannelFilter, Delivery, Engine, EngineConfig, EngineError};
use iccom_transport::{SymmetricDuplex, TransportError, XferDecision, XferDone, XferHandler};
use iccom_wire::{frame_id, is_ack, validate, write_packet, Crc32, ACK_BYTE, NACK_BYTE};

const FRAME: usize = 64;

struct ScriptInner {
    handler: Option<Arc<dyn XferHandler>>,
    current_tx: Vec<u8>,
    running: bool,
}

/// Test transport: the peer is the test body.
#[derive(Clone)]
struct ScriptEnd {
    inner: Arc<Mutex<ScriptInner>>,
}

impl ScriptEnd {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ScriptInner {
                handler: None,
                current_tx: Vec::new(),
                running: true,
            })),
        }
    }

    /// Deliver `rx` to the engine; returns what the engine sent in this
    /// exchange and what it armed for the next one.
    fn exchange(&self, rx: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let (handler, sent) = {
            let inner = self.inner.lock().unwrap();
            (
                inner.handler.clone().expect("transport must be initialized"),
                inner.current_tx.clone(),
            )
        };

        let decision = handler.xfer_done(XferDone {
            sent: &sent,
            received: rx,
        });

        let mut inner = self.inner.lock().unwrap();
        match decision {
            XferDecision::Next { tx, .. } => inner.current_tx = tx.clone(),
            XferDecision::Halt => {
                inner.running = false;
                inner.current_tx.clear();
            }
        }
        (sent, inner.current_tx.clone())
    }

    fn fail(&self) -> Vec<u8> {
        let handler = self.inner.lock().unwrap().handler.clone().unwrap();
        let decision = handler.xfer_failed(&TransportError::XferFailed("scripted".into()));
        let mut inner = self.inner.lock().unwrap();
        match decision {
            XferDecision::Next { tx, .. } => inner.current_tx = tx,
            XferDecision::Halt => inner.running = false,
        }
        inner.current_tx.clone()
    }

    fn halted(&self) -> bool {
        !self.inner.lock().unwrap().running
    }
}

impl SymmetricDuplex for ScriptEnd {
    fn init(
        &mut self,
        initial_tx: Vec<u8>,
        handler: Arc<dyn XferHandler>,
    ) -> iccom_transport::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.current_tx = initial_tx;
        inner.handler = Some(handler);
        Ok(())
    }

    fn trigger(&self) -> iccom_transport::Result<()> {
        Ok(())
    }

    fn reset(&mut self, initial_tx: Vec<u8>) -> iccom_transport::Result<()> {
        self.inner.lock().unwrap().current_tx = initial_tx;
        Ok(())
    }

    fn is_running(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.running && inner.handler.is_some()
    }

    fn close(&mut self) {
        self.inner.lock().unwrap().running = false;
    }
}

/// Build a valid peer frame from raw packet descriptions.
fn build_frame(id: u8, packets: &[(u16, bool, &[u8])]) -> Vec<u8> {
    let crc = Crc32::new();
    let mut frame = vec![0u8; FRAME];
    let mut offset = 3;
    for &(channel, complete, payload) in packets {
        offset += write_packet(&mut frame[offset..], channel, complete, payload);
    }
    let payload_len = (offset - 3) as u16;
    frame[0..2].copy_from_slice(&payload_len.to_be_bytes());
    frame[2] = id;
    for byte in &mut frame[offset..FRAME - 4] {
        *byte = 0xFF;
    }
    let checksum = crc.checksum(&frame[..FRAME - 4]);
    frame[FRAME - 4..].copy_from_slice(&checksum.to_le_bytes());
    frame
}

fn scripted_engine() -> (ScriptEnd, Engine<ScriptEnd>) {
    let script = ScriptEnd::new();
    let engine = Engine::start(
        script.clone(),
        EngineConfig::default().with_data_xfer_size(FRAME),
    )
    .expect("engine should start");
    (script, engine)
}

#[test]
fn engine_arms_a_valid_empty_package() {
    let (script, _engine) = scripted_engine();
    let armed = script.inner.lock().unwrap().current_tx.clone();

    let crc = Crc32::new();
    assert_eq!(armed.len(), FRAME);
    assert_eq!(validate(&armed, &crc).unwrap(), 0);
    assert_eq!(frame_id(&armed), 1);
}

#[test]
fn interleaved_channels_finalize_independently() {
    let (script, engine) = scripted_engine();
    let (sent, received) = mpsc::channel();
    engine
        .set_channel_callback(
            ChannelFilter::Any,
            Some(Arc::new(move |channel, _, data| {
                let _ = sent.send((channel, data.to_vec()));
                Delivery::Taken
            })),
        )
        .unwrap();

    // one package: channel 7 fragment (open) then channel 8 complete
    let frame1 = build_frame(1, &[(7, false, b"first "), (8, true, b"whole")]);
    let (_, reply) = script.exchange(&frame1);
    assert!(is_ack(&reply));

    // channel 8 is ready, channel 7 still under construction
    let timeout = Duration::from_secs(5);
    assert_eq!(
        received.recv_timeout(timeout).unwrap(),
        (8, b"whole".to_vec())
    );

    // ack half, then the package that completes channel 7
    script.exchange(&[ACK_BYTE]);
    let frame2 = build_frame(2, &[(7, true, b"part")]);
    let (_, reply) = script.exchange(&frame2);
    assert!(is_ack(&reply));

    assert_eq!(
        received.recv_timeout(timeout).unwrap(),
        (7, b"first part".to_vec())
    );
}

#[test]
fn mid_package_parse_failure_rolls_back_and_retransmission_lands() {
    let (script, engine) = scripted_engine();

    // package 1: committed opening fragment on channel 3
    let frame1 = build_frame(1, &[(3, false, b"keep-")]);
    let (_, reply) = script.exchange(&frame1);
    assert!(is_ack(&reply));
    script.exchange(&[ACK_BYTE]);

    // package 2: a valid finalizing packet followed by a 2-byte leftover
    // that can not hold a packet header -> parse error mid-package
    let mut frame2 = vec![0u8; FRAME];
    let mut offset = 3;
    offset += write_packet(&mut frame2[offset..], 3, true, b"it");
    frame2[offset] = 0xAA;
    frame2[offset + 1] = 0xBB;
    offset += 2;
    frame2[0..2].copy_from_slice(&((offset - 3) as u16).to_be_bytes());
    frame2[2] = 2;
    for byte in &mut frame2[offset..FRAME - 4] {
        *byte = 0xFF;
    }
    let crc = Crc32::new();
    let checksum = crc.checksum(&frame2[..FRAME - 4]);
    frame2[FRAME - 4..].copy_from_slice(&checksum.to_le_bytes());

    let (_, reply) = script.exchange(&frame2);
    assert_eq!(reply, vec![NACK_BYTE]);
    assert_eq!(engine.statistics().packages_parsing_failed, 1);

    // nothing leaked from the failed package
    assert!(engine.read(3).unwrap().is_none());

    // ack half, then the peer retransmits the package correctly
    script.exchange(&[ACK_BYTE]);
    let frame3 = build_frame(2, &[(3, true, b"it")]);
    let (_, reply) = script.exchange(&frame3);
    assert!(is_ack(&reply));

    let (data, _) = engine.read(3).unwrap().expect("message should be intact");
    assert_eq!(data.as_ref(), b"keep-it");
    assert_eq!(engine.statistics().messages_received_ok, 1);
}

#[test]
fn oversized_declared_payload_is_nacked() {
    let (script, engine) = scripted_engine();

    let mut frame = build_frame(1, &[(1, true, b"ok")]);
    frame[0..2].copy_from_slice(&1000u16.to_be_bytes());

    let (_, reply) = script.exchange(&frame);
    assert_eq!(reply, vec![NACK_BYTE]);
    assert_eq!(engine.statistics().packages_bad_data_received, 1);
}

#[test]
fn dirty_fill_byte_is_nacked() {
    let (script, engine) = scripted_engine();

    let mut frame = build_frame(1, &[(1, true, b"ok")]);
    frame[30] = 0x00;
    let crc = Crc32::new();
    let checksum = crc.checksum(&frame[..FRAME - 4]);
    frame[FRAME - 4..].copy_from_slice(&checksum.to_le_bytes());

    let (_, reply) = script.exchange(&frame);
    assert_eq!(reply, vec![NACK_BYTE]);
    assert_eq!(engine.statistics().packages_bad_data_received, 1);
}

#[test]
fn nacked_head_package_is_resent_unchanged() {
    let (script, engine) = scripted_engine();
    engine.post(5, b"resend me").unwrap();

    // data half: exchange valid empty frames
    let (sent_first, _) = script.exchange(&build_frame(1, &[]));
    // peer nacks our package
    let (_, next_data) = script.exchange(&[NACK_BYTE]);
    assert_eq!(sent_first, next_data, "nack must resend identical bytes");

    // this time the peer acks; the engine moves to the queued message
    let (sent_again, _) = script.exchange(&build_frame(2, &[]));
    assert_eq!(sent_again, next_data);
    let (_, after_ack) = script.exchange(&[ACK_BYTE]);
    assert_ne!(after_ack, sent_again, "ack must advance the queue");
    assert_eq!(engine.statistics().packages_sent_ok, 1);
}

#[test]
fn transport_failure_forces_nack_half() {
    let (script, engine) = scripted_engine();

    let next = script.fail();
    assert_eq!(next, vec![NACK_BYTE]);

    // the frame realigns: our nack half meets the peer's ack byte, after
    // which the engine returns to the data stage with its head package
    let (_, next_data) = script.exchange(&[NACK_BYTE]);
    assert_eq!(next_data.len(), FRAME);
    assert_eq!(engine.statistics().packages_xfered, 0);
}

#[test]
fn closing_halts_the_transport_via_sentinel() {
    let (script, engine) = scripted_engine();

    let (_, reply) = script.exchange(&build_frame(1, &[]));
    assert!(is_ack(&reply));

    engine.close();
    assert!(matches!(engine.post(1, b"x"), Err(EngineError::ShuttingDown)));

    // the next callback returns the halt sentinel
    script.exchange(&[ACK_BYTE]);
    assert!(script.halted());
}
