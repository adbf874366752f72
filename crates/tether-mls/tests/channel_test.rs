use std::collections::VecDeque;
use std::time::Duration;
use tether_mls::{
    DhKeyPair, MlsChannel, MlsChannelConfig, MlsChannelEvent, MlsChannelState, MlsError,
    RsaKeyPair, RsaPublicKey,
};

const NOW: u64 = 1_700_000_000;

fn push_into(events: &mut VecDeque<MlsChannelEvent>) -> impl FnMut(MlsChannelEvent) + '_ {
    |event| events.push_back(event)
}

struct Harness {
    a_events: VecDeque<MlsChannelEvent>,
    b_events: VecDeque<MlsChannelEvent>,
    a_decoded: Vec<Vec<u8>>,
    b_decoded: Vec<Vec<u8>>,
    /// Every encoded frame a ever produced, in order
    a_frames: Vec<Vec<u8>>,
}

impl Harness {
    fn new() -> Self {
        Harness {
            a_events: VecDeque::new(),
            b_events: VecDeque::new(),
            a_decoded: Vec::new(),
            b_decoded: Vec::new(),
            a_frames: Vec::new(),
        }
    }

    /// Shuttle encoded frames between the channels until both go quiet
    fn pump(&mut self, now: u64, a: &mut MlsChannel, b: &mut MlsChannel) {
        while !self.a_events.is_empty() || !self.b_events.is_empty() {
            if let Some(event) = self.a_events.pop_front() {
                match event {
                    MlsChannelEvent::SendEncoded(frame) => {
                        self.a_frames.push(frame.clone());
                        b.receive_encoded(now, push_into(&mut self.b_events), &frame)
                            .expect("b accepts a's frame");
                    }
                    MlsChannelEvent::ReceiveDecoded(data) => self.a_decoded.push(data),
                    _ => {}
                }
            }

            if let Some(event) = self.b_events.pop_front() {
                match event {
                    MlsChannelEvent::SendEncoded(frame) => {
                        a.receive_encoded(now, push_into(&mut self.a_events), &frame)
                            .expect("a accepts b's frame");
                    }
                    MlsChannelEvent::ReceiveDecoded(data) => self.b_decoded.push(data),
                    _ => {}
                }
            }
        }
    }
}

fn channel(context: &str) -> MlsChannel {
    MlsChannel::new(MlsChannelConfig {
        local_context_id: context.into(),
        ..Default::default()
    })
}

/// Two channels keyed with a shared passphrase & mutually known signing
/// keys. Also returns a's signing public key for boundary tests.
fn passphrase_pair(harness: &mut Harness) -> (MlsChannel, MlsChannel, RsaPublicKey) {
    let a_signing = RsaKeyPair::generate().unwrap();
    let b_signing = RsaKeyPair::generate().unwrap();
    let a_signing_public = a_signing.public_key();

    let mut a = channel("context-a");
    let mut b = channel("context-b");

    a.set_receive_signing_public_key(NOW, push_into(&mut harness.a_events), b_signing.public_key());
    b.set_receive_signing_public_key(NOW, push_into(&mut harness.b_events), a_signing_public.clone());

    a.set_send_signing_key_pair(NOW, push_into(&mut harness.a_events), a_signing);
    b.set_send_signing_key_pair(NOW, push_into(&mut harness.b_events), b_signing);

    a.set_receive_passphrase(NOW, push_into(&mut harness.a_events), "hunter2".into());
    b.set_receive_passphrase(NOW, push_into(&mut harness.b_events), "hunter2".into());

    a.set_send_passphrase(NOW, push_into(&mut harness.a_events), "hunter2".into());
    b.set_send_passphrase(NOW, push_into(&mut harness.b_events), "hunter2".into());

    (a, b, a_signing_public)
}

fn next_encoded(events: &mut VecDeque<MlsChannelEvent>) -> Vec<u8> {
    loop {
        match events.pop_front() {
            Some(MlsChannelEvent::SendEncoded(frame)) => return frame,
            Some(_) => continue,
            None => panic!("no encoded frame emitted"),
        }
    }
}

#[test]
fn passphrase_keying_end_to_end() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut harness = Harness::new();
    let (mut a, mut b, _) = passphrase_pair(&mut harness);

    harness.pump(NOW, &mut a, &mut b);

    assert_eq!(a.state(), MlsChannelState::Connected);
    assert_eq!(b.state(), MlsChannelState::Connected);
    assert_eq!(a.remote_context_id(), "context-b");
    assert_eq!(b.remote_context_id(), "context-a");

    // several frames in each direction, exercising the chained IVs
    for i in 0..5u8 {
        a.write(NOW, push_into(&mut harness.a_events), &[i; 32]).unwrap();
        b.write(NOW, push_into(&mut harness.b_events), &[i; 7]).unwrap();
    }
    harness.pump(NOW, &mut a, &mut b);

    assert_eq!(
        harness.b_decoded,
        (0..5u8).map(|i| vec![i; 32]).collect::<Vec<_>>()
    );
    assert_eq!(
        harness.a_decoded,
        (0..5u8).map(|i| vec![i; 7]).collect::<Vec<_>>()
    );
}

#[test]
fn missing_material_parks_the_bundle() {
    let mut harness = Harness::new();

    let a_signing = RsaKeyPair::generate().unwrap();
    let a_signing_public = a_signing.public_key();

    let mut a = channel("a");
    let mut b = channel("b");

    a.set_send_signing_key_pair(NOW, push_into(&mut harness.a_events), a_signing);
    a.set_send_passphrase(NOW, push_into(&mut harness.a_events), "hunter2".into());

    let frame = next_encoded(&mut harness.a_events);

    // b has no signing key yet: the bundle parks
    b.receive_encoded(NOW, push_into(&mut harness.b_events), &frame).unwrap();
    assert!(b.needs_receive_keying_signing_public_key());
    assert_eq!(b.state(), MlsChannelState::WaitingForNeededInformation);

    b.set_receive_signing_public_key(NOW, push_into(&mut harness.b_events), a_signing_public);

    // now the passphrase is the missing piece
    assert!(b.needs_receive_keying());
    assert_eq!(b.state(), MlsChannelState::WaitingForNeededInformation);

    b.set_receive_passphrase(NOW, push_into(&mut harness.b_events), "hunter2".into());
    assert!(!b.needs_receive_keying());
    assert_eq!(b.error(), None);
}

#[test]
fn external_signing_handshake() {
    let mut harness = Harness::new();

    let signing = RsaKeyPair::generate().unwrap();
    let mut a = channel("a");

    a.set_send_passphrase(NOW, push_into(&mut harness.a_events), "hunter2".into());

    // the bundle is built but held back for the external signer
    assert!(a.needs_send_keying_to_be_signed());
    assert!(a.send_keying_needing_signature().is_some());
    assert_eq!(a.state(), MlsChannelState::WaitingForNeededInformation);

    a.notify_send_keying_signed(NOW, push_into(&mut harness.a_events), signing);

    assert!(!a.needs_send_keying_to_be_signed());
    assert!(harness
        .a_events
        .iter()
        .any(|event| matches!(event, MlsChannelEvent::SendEncoded(_))));
}

#[test]
fn replayed_nonce_is_rejected() {
    let mut harness = Harness::new();
    let (mut a, mut b, a_signing_public) = passphrase_pair(&mut harness);
    harness.pump(NOW, &mut a, &mut b);

    let keying_frame = harness.a_frames[0].clone();

    // a fresh channel with the very same material refuses the replay
    let mut c = channel("c");
    let mut events = VecDeque::new();
    c.set_receive_signing_public_key(NOW, push_into(&mut events), a_signing_public);
    c.set_receive_passphrase(NOW, push_into(&mut events), "hunter2".into());

    let result = c.receive_encoded(NOW, push_into(&mut events), &keying_frame);

    assert_eq!(result, Err(MlsError::Forbidden));
    assert_eq!(c.state(), MlsChannelState::Shutdown);
}

#[test]
fn keying_sequence_mismatch_is_a_timeout() {
    let mut harness = Harness::new();
    let (mut a, mut b, a_signing_public) = passphrase_pair(&mut harness);
    harness.pump(NOW, &mut a, &mut b);

    // force a rekey so a emits its sequence-1 bundle
    let rekey_at = NOW + 2 * 60 * 60;
    a.poll(rekey_at, push_into(&mut harness.a_events));

    let second_bundle = next_encoded(&mut harness.a_events);

    // b accepts it in order
    b.receive_encoded(rekey_at, push_into(&mut harness.b_events), &second_bundle)
        .unwrap();
    assert_eq!(b.error(), None);

    // a fresh channel expects sequence 0 and rejects the sequence-1 bundle
    let mut c = channel("c");
    let mut events = VecDeque::new();
    c.set_receive_signing_public_key(rekey_at, push_into(&mut events), a_signing_public);
    c.set_receive_passphrase(rekey_at, push_into(&mut events), "hunter2".into());

    let result = c.receive_encoded(rekey_at, push_into(&mut events), &second_bundle);

    assert_eq!(result, Err(MlsError::RequestTimeout));
    assert_eq!(c.state(), MlsChannelState::Shutdown);
}

#[test]
fn expired_bundle_is_a_timeout() {
    let mut harness = Harness::new();

    let a_signing = RsaKeyPair::generate().unwrap();
    let a_signing_public = a_signing.public_key();

    let mut a = MlsChannel::new(MlsChannelConfig {
        local_context_id: "a".into(),
        keying_expires: Duration::from_secs(10),
        ..Default::default()
    });

    a.set_send_signing_key_pair(NOW, push_into(&mut harness.a_events), a_signing);
    a.set_send_passphrase(NOW, push_into(&mut harness.a_events), "hunter2".into());

    let frame = next_encoded(&mut harness.a_events);

    let mut b = channel("b");
    let mut events = VecDeque::new();
    b.set_receive_signing_public_key(NOW, push_into(&mut events), a_signing_public);
    b.set_receive_passphrase(NOW, push_into(&mut events), "hunter2".into());

    // the bundle expired 90 seconds ago
    let result = b.receive_encoded(NOW + 100, push_into(&mut events), &frame);

    assert_eq!(result, Err(MlsError::RequestTimeout));
    assert_eq!(b.state(), MlsChannelState::Shutdown);
}

#[test]
fn tampered_data_frame_is_unauthorized() {
    let mut harness = Harness::new();
    let (mut a, mut b, _) = passphrase_pair(&mut harness);
    harness.pump(NOW, &mut a, &mut b);

    let mut events = VecDeque::new();
    a.write(NOW, push_into(&mut events), b"sensitive").unwrap();

    let mut frame = next_encoded(&mut events);

    // flip one ciphertext bit
    let last = frame.len() - 1;
    frame[last] ^= 0x01;

    let mut b_events = VecDeque::new();
    let result = b.receive_encoded(NOW, push_into(&mut b_events), &frame);

    assert_eq!(result, Err(MlsError::Unauthorized));
    assert_eq!(b.state(), MlsChannelState::Shutdown);
    assert_eq!(b.error(), Some(MlsError::Unauthorized));
}

#[test]
fn key_agreement_with_rolling_rekey() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut harness = Harness::new();

    let a_signing = RsaKeyPair::generate().unwrap();
    let b_signing = RsaKeyPair::generate().unwrap();
    let a_dh = DhKeyPair::generate().unwrap();
    let b_dh = DhKeyPair::generate().unwrap();
    let b_dh_public = b_dh.public_key();

    let mut a = channel("a");
    let mut b = channel("b");

    a.set_receive_signing_public_key(NOW, push_into(&mut harness.a_events), b_signing.public_key());
    b.set_receive_signing_public_key(NOW, push_into(&mut harness.b_events), a_signing.public_key());
    a.set_send_signing_key_pair(NOW, push_into(&mut harness.a_events), a_signing);
    b.set_send_signing_key_pair(NOW, push_into(&mut harness.b_events), b_signing);

    // a knows b's public value through signalling; b learns a's value from
    // the keying bundle itself
    b.set_local_key_agreement(NOW, push_into(&mut harness.b_events), b_dh, false);
    a.set_local_key_agreement(NOW, push_into(&mut harness.a_events), a_dh, false);
    a.set_remote_key_agreement(NOW, push_into(&mut harness.a_events), b_dh_public);

    harness.pump(NOW, &mut a, &mut b);

    assert_eq!(a.state(), MlsChannelState::Connected);
    assert_eq!(b.state(), MlsChannelState::Connected);

    a.write(NOW, push_into(&mut harness.a_events), b"before rekey").unwrap();
    harness.pump(NOW, &mut a, &mut b);
    assert_eq!(harness.b_decoded.last().unwrap(), b"before rekey");

    let original_remote = b
        .original_remote_key_agreement()
        .expect("b learned a's value")
        .clone();

    // rekey: a rotates its ephemeral & emits a fresh bundle, b keeps
    // decoding without interruption
    let rekey_at = NOW + 2 * 60 * 60;
    a.poll(rekey_at, push_into(&mut harness.a_events));
    harness.pump(rekey_at, &mut a, &mut b);

    a.write(rekey_at, push_into(&mut harness.a_events), b"after rekey").unwrap();
    harness.pump(rekey_at, &mut a, &mut b);

    assert_eq!(harness.b_decoded.last().unwrap(), b"after rekey");
    assert_eq!(b.error(), None);

    // the binding anchor never changes across rekeys
    assert_eq!(
        b.original_remote_key_agreement().unwrap().as_bytes(),
        original_remote.as_bytes()
    );
}

#[test]
fn shutdown_is_idempotent() {
    let mut channel = channel("a");
    let mut closed = 0;

    for _ in 0..2 {
        channel.shutdown(|event| {
            if matches!(event, MlsChannelEvent::Closed { .. }) {
                closed += 1;
            }
        });
    }

    assert_eq!(closed, 1);
    assert_eq!(channel.state(), MlsChannelState::Shutdown);
}
