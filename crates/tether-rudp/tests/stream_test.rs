use std::{
    cmp::min,
    collections::VecDeque,
    time::{Duration, Instant},
};
use tether_rudp::{RudpStream, RudpStreamConfig, RudpStreamEvent, RudpStreamState};

fn push_into(
    events: &mut VecDeque<RudpStreamEvent>,
) -> impl FnMut(RudpStreamEvent) + '_ {
    |event| events.push_back(event)
}

/// In-memory wire between two streams.
///
/// `SendExternalAckNow` is modeled like the out-of-band exchange of the
/// transport layer: the requesting side's ACK state travels to the peer,
/// the peer's ACK state travels back tagged with the request id.
struct Wire {
    now: Instant,
    a_pending: VecDeque<RudpStreamEvent>,
    b_pending: VecDeque<RudpStreamEvent>,
    a_received: Vec<u8>,
    b_received: Vec<u8>,
    /// Which of a's outgoing packets get dropped (0-based send index)
    drop_from_a: Vec<usize>,
    a_sent_count: usize,
}

enum Side {
    A,
    B,
}

impl Wire {
    fn new() -> Self {
        Wire {
            now: Instant::now(),
            a_pending: VecDeque::new(),
            b_pending: VecDeque::new(),
            a_received: Vec::new(),
            b_received: Vec::new(),
            drop_from_a: Vec::new(),
            a_sent_count: 0,
        }
    }

    fn pump(&mut self, a: &mut RudpStream, b: &mut RudpStream) {
        let mut a_events = std::mem::take(&mut self.a_pending);
        let mut b_events = std::mem::take(&mut self.b_pending);

        a.poll(self.now, push_into(&mut a_events));
        b.poll(self.now, push_into(&mut b_events));

        while !a_events.is_empty() || !b_events.is_empty() {
            if let Some(event) = a_events.pop_front() {
                self.dispatch(Side::A, event, a, b, &mut a_events, &mut b_events);
            }
            if let Some(event) = b_events.pop_front() {
                self.dispatch(Side::B, event, b, a, &mut b_events, &mut a_events);
            }
        }

        self.drain_reads(a, b);

        let timeout = match (a.timeout(self.now), b.timeout(self.now)) {
            (Some(a), Some(b)) => min(a, b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => Duration::from_millis(20),
        };
        self.now += timeout.max(Duration::from_millis(1));
    }

    fn dispatch(
        &mut self,
        side: Side,
        event: RudpStreamEvent,
        from: &mut RudpStream,
        to: &mut RudpStream,
        from_events: &mut VecDeque<RudpStreamEvent>,
        to_events: &mut VecDeque<RudpStreamEvent>,
    ) {
        match event {
            RudpStreamEvent::SendPacket(data) => {
                if let Side::A = side {
                    let index = self.a_sent_count;
                    self.a_sent_count += 1;

                    if self.drop_from_a.contains(&index) {
                        return;
                    }
                }

                to.handle_packet(self.now, push_into(to_events), &data, false);
            }
            RudpStreamEvent::SendExternalAckNow { request_id } => {
                // request leg: our ACK state reaches the peer
                let out = from.ack_state();
                from.notify_external_ack_sent();
                to.handle_external_ack(self.now, push_into(to_events), None, &out);

                // response leg: the peer's ACK state comes back
                let back = to.ack_state();
                to.notify_external_ack_sent();
                from.handle_external_ack(self.now, push_into(from_events), request_id, &back);
            }
            RudpStreamEvent::DataReadable | RudpStreamEvent::StateChanged { .. } => {}
        }
    }

    fn drain_reads(&mut self, a: &mut RudpStream, b: &mut RudpStream) {
        let mut buf = [0u8; 4096];

        loop {
            let read = a.read(&mut buf);
            if read == 0 {
                break;
            }
            self.a_received.extend_from_slice(&buf[..read]);
        }

        loop {
            let read = b.read(&mut buf);
            if read == 0 {
                break;
            }
            self.b_received.extend_from_slice(&buf[..read]);
        }
    }
}

fn create_pair(wire: &mut Wire) -> (RudpStream, RudpStream) {
    let mut a = RudpStream::new(RudpStreamConfig {
        send_channel: 10,
        receive_channel: 20,
        ..Default::default()
    });
    let mut b = RudpStream::new(RudpStreamConfig {
        send_channel: 20,
        receive_channel: 10,
        ..Default::default()
    });

    let now = wire.now;
    a.notify_socket_write_ready(now, push_into(&mut wire.a_pending));
    b.notify_socket_write_ready(now, push_into(&mut wire.b_pending));

    (a, b)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn ordered_transfer() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut wire = Wire::new();
    let (mut a, mut b) = create_pair(&mut wire);

    let data = pattern(20_000);
    let now = wire.now;
    a.write(now, push_into(&mut wire.a_pending), &data).unwrap();

    for _ in 0..1000 {
        if wire.b_received.len() == data.len() {
            break;
        }
        wire.pump(&mut a, &mut b);
    }

    assert_eq!(wire.b_received, data);
    assert_eq!(a.error(), None);
    assert_eq!(b.error(), None);
}

#[test]
fn lost_packets_are_recovered() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut wire = Wire::new();
    // the second & fifth packets a ever sends vanish on the wire
    wire.drop_from_a = vec![1, 4];

    let (mut a, mut b) = create_pair(&mut wire);

    let data = pattern(12_000);
    let now = wire.now;
    a.write(now, push_into(&mut wire.a_pending), &data).unwrap();

    for _ in 0..1000 {
        if wire.b_received.len() == data.len() {
            break;
        }
        wire.pump(&mut a, &mut b);
    }

    // delivered up-order as a contiguous prefix of what was written
    assert_eq!(wire.b_received, data);
    assert_eq!(a.error(), None);
    assert_eq!(b.error(), None);

    // the loss was noticed by the congestion controller
    assert!(a.congestion_state().bandwidth_increase_frozen);
}

#[test]
fn bidirectional_transfer() {
    let mut wire = Wire::new();
    let (mut a, mut b) = create_pair(&mut wire);

    let a_data = pattern(5000);
    let b_data: Vec<u8> = pattern(7000).into_iter().rev().collect();

    let now = wire.now;
    a.write(now, push_into(&mut wire.a_pending), &a_data).unwrap();
    b.write(now, push_into(&mut wire.b_pending), &b_data).unwrap();

    for _ in 0..1000 {
        if wire.b_received.len() == a_data.len() && wire.a_received.len() == b_data.len() {
            break;
        }
        wire.pump(&mut a, &mut b);
    }

    assert_eq!(wire.b_received, a_data);
    assert_eq!(wire.a_received, b_data);
}

#[test]
fn drain_shutdown_completes_once_acked() {
    let mut wire = Wire::new();
    let (mut a, mut b) = create_pair(&mut wire);

    let data = pattern(3000);
    let now = wire.now;
    a.write(now, push_into(&mut wire.a_pending), &data).unwrap();
    a.shutdown(now, push_into(&mut wire.a_pending), true);

    assert_eq!(a.state(), RudpStreamState::ShuttingDown);

    for _ in 0..1000 {
        if a.state() == RudpStreamState::Shutdown {
            break;
        }
        wire.pump(&mut a, &mut b);
    }

    assert_eq!(a.state(), RudpStreamState::Shutdown);
    assert_eq!(a.error(), None);
    assert_eq!(wire.b_received, data);
}
