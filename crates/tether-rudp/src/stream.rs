use crate::packet::{
    Flags, RudpPacket, VectorDecoder, VectorEncoder, VectorState, HEADER_LEN, MAX_VECTOR_LENGTH,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    cmp::{max, min},
    collections::{BTreeMap, VecDeque},
    time::{Duration, Instant},
};

/// The receive window never grows further than this many packets past GSNFR
const MAX_WINDOW_TO_NEXT_SEQUENCE_NUMBER: u64 = 256;

/// Window expansion is denied once the last delivered data is older than
/// 3 x RTT, this caps that grace period
const MAX_EXPAND_WINDOW_SINCE_LAST_DELIVERED: Duration = Duration::from_secs(10);

/// Sending is considered issue-free after this period and the bandwidth
/// increase unfreezes
const UNFREEZE_AFTER_GOOD_TRANSMISSION: Duration = Duration::from_secs(10);

const MINIMUM_BURST_TIMER: Duration = Duration::from_millis(20);
const DEFAULT_PACKETS_PER_BURST: u32 = 3;

/// State of the reliable stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RudpStreamState {
    Connected,
    /// Waiting for buffered send data to be acknowledged before shutdown
    ShuttingDown,
    Shutdown,
}

/// One direction of the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// Fatal errors of the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RudpStreamError {
    /// The peer acknowledged data in a way that contradicts what was sent
    #[error("illegal stream state")]
    IllegalStreamState,
    #[error("shutdown")]
    Shutdown,
}

impl RudpStreamError {
    pub fn code(&self) -> u16 {
        match self {
            RudpStreamError::IllegalStreamState => 400,
            RudpStreamError::Shutdown => 410,
        }
    }
}

/// Events emitted by the [`RudpStream`]
#[derive(Debug)]
pub enum RudpStreamEvent {
    /// Deliver this packet to the peer
    SendPacket(Vec<u8>),
    /// Ask the peer for an immediate ACK through the out-of-band channel.
    /// A `request_id` is present when delivery of flagged packets must be
    /// confirmed; the matching [`RudpStream::handle_external_ack`] carries
    /// it back.
    SendExternalAckNow { request_id: Option<u64> },
    /// Ordered data is ready to be read
    DataReadable,
    StateChanged {
        old: RudpStreamState,
        new: RudpStreamState,
    },
}

/// The ACK fields delivered through the out-of-band channel, produced by
/// [`RudpStream::ack_state`] and consumed by
/// [`RudpStream::handle_external_ack`] of the peer
#[derive(Debug, Clone)]
pub struct ExternalAck {
    pub next_sequence_number: u64,
    pub gsnr: u64,
    pub gsnfr: u64,
    pub vector: Vec<u8>,
    pub vector_parity: bool,
    pub gsnr_parity: bool,
    pub gsnfr_parity: bool,
    pub duplicate_received: bool,
    pub ecn_received: bool,
}

/// Configuration for a new [`RudpStream`]
#[derive(Debug, Clone)]
pub struct RudpStreamConfig {
    /// First sequence number to use for sending, must be at least 1
    pub next_send_sequence_number: u64,
    /// First sequence number expected from the peer, must be at least 1
    pub next_expected_sequence_number: u64,
    pub send_channel: u16,
    pub receive_channel: u16,
    /// Lower bound for the RTT estimation
    pub minimum_rtt: Duration,
    /// Initial RTT estimate
    pub calculated_rtt: Duration,
    /// Maximum size of a serialized packet
    pub max_packet_size: usize,
}

impl Default for RudpStreamConfig {
    fn default() -> Self {
        Self {
            next_send_sequence_number: 1,
            next_expected_sequence_number: 1,
            send_channel: 0,
            receive_channel: 0,
            minimum_rtt: Duration::from_millis(40),
            calculated_rtt: Duration::from_millis(200),
            max_packet_size: 1200,
        }
    }
}

/// Congestion controller observables, mostly useful for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CongestionState {
    pub available_burst_batons: u32,
    pub packets_per_burst: u32,
    pub add_to_available_batons_duration: Duration,
    pub bandwidth_increase_frozen: bool,
    pub calculated_rtt: Duration,
    pub total_sending_period_without_issues: Duration,
}

struct BufferedSendPacket {
    time_sent: Instant,
    /// Parity bit (PS flag) this packet was sent with
    parity: bool,
    /// XOR of the parity of every packet sent up to & including this one,
    /// checked against the XP claim of incoming ACKs
    xor_parity_to_now: bool,
    ack_required: bool,
    holds_baton: bool,
    flagged_as_failed_to_receive: bool,
    flag_for_resend_next_burst: bool,
    /// Serialized packet, cleared once the peer reported reception
    packet: Option<Vec<u8>>,
}

impl BufferedSendPacket {
    fn flag_for_resending(&mut self, total_packets_to_resend: &mut usize) {
        if self.flag_for_resend_next_burst || self.packet.is_none() {
            return;
        }

        self.flag_for_resend_next_burst = true;
        *total_packets_to_resend += 1;
    }

    fn do_not_resend(&mut self, total_packets_to_resend: &mut usize) {
        if !self.flag_for_resend_next_burst {
            return;
        }

        self.flag_for_resend_next_burst = false;
        *total_packets_to_resend -= 1;
    }

    fn consume_baton(&mut self, available_burst_batons: &mut u32) {
        if self.holds_baton || *available_burst_batons == 0 {
            return;
        }

        self.holds_baton = true;
        *available_burst_batons -= 1;
    }

    fn release_baton(&mut self, available_burst_batons: &mut u32) {
        if !self.holds_baton {
            return;
        }

        self.holds_baton = false;
        *available_burst_batons += 1;
    }

    /// The remote party has this packet, only the bookkeeping entry is kept
    /// for parity validation until GSNFR passes it
    fn flag_as_received_by_remote_party(
        &mut self,
        total_packets_to_resend: &mut usize,
        available_burst_batons: &mut u32,
    ) {
        self.do_not_resend(total_packets_to_resend);
        self.release_baton(available_burst_batons);
        self.packet = None;
    }
}

struct BufferedReceivePacket {
    time_received: Instant,
    parity: bool,
    ecn_marked: bool,
    payload: Vec<u8>,
}

/// Sequenced reliable stream over an unreliable datagram carrier
///
/// Sans io: packets are ingested with [`handle_packet`](Self::handle_packet)
/// / [`handle_external_ack`](Self::handle_external_ack), timers are driven
/// through [`poll`](Self::poll) & [`timeout`](Self::timeout) and outbound
/// packets leave through [`RudpStreamEvent`]s.
pub struct RudpStream {
    state: RudpStreamState,
    error: Option<RudpStreamError>,
    shutdown_send: bool,
    shutdown_receive: bool,

    send_channel: u16,
    receive_channel: u16,

    minimum_rtt: Duration,
    calculated_rtt: Duration,
    max_packet_size: usize,

    next_sequence_number: u64,
    xor_parity_to_now: bool,

    gsnr: u64,
    gsnfr: u64,
    gsnr_parity: bool,
    xor_parity_to_gsnfr: bool,

    wait_to_send_until_received_sequence_number: u64,

    sending_packets: BTreeMap<u64, BufferedSendPacket>,
    received_packets: BTreeMap<u64, BufferedReceivePacket>,

    send_stream: VecDeque<u8>,
    receive_stream: VecDeque<u8>,
    last_delivered_data: Option<Instant>,

    write_ready: bool,

    total_packets_to_resend: usize,
    available_burst_batons: u32,
    /// Total batons in circulation, held or available
    total_batons: u32,
    packets_per_burst: u32,
    add_to_available_batons_duration: Duration,
    bandwidth_increase_frozen: bool,
    total_sending_period_without_issues: Duration,
    started_sending_at: Option<Instant>,

    burst_timer_at: Option<Instant>,
    ensure_ack_timer_at: Option<Instant>,
    add_batons_timer_at: Option<Instant>,

    force_ack_request_id: Option<u64>,
    force_ack_up_to_sequence_number: u64,
    force_ack_next_time_possible: bool,
    next_request_id: u64,

    duplicate_received: bool,
    ecn_received: bool,

    rng: StdRng,
}

impl RudpStream {
    pub fn new(config: RudpStreamConfig) -> Self {
        debug_assert!(config.next_send_sequence_number >= 1);
        debug_assert!(config.next_expected_sequence_number >= 1);
        debug_assert!(config.max_packet_size > HEADER_LEN + MAX_VECTOR_LENGTH);

        let calculated_rtt = max(config.calculated_rtt, config.minimum_rtt);

        RudpStream {
            state: RudpStreamState::Connected,
            error: None,
            shutdown_send: false,
            shutdown_receive: false,
            send_channel: config.send_channel,
            receive_channel: config.receive_channel,
            minimum_rtt: config.minimum_rtt,
            calculated_rtt,
            max_packet_size: config.max_packet_size,
            next_sequence_number: config.next_send_sequence_number,
            xor_parity_to_now: false,
            gsnr: config.next_expected_sequence_number - 1,
            gsnfr: config.next_expected_sequence_number - 1,
            gsnr_parity: false,
            xor_parity_to_gsnfr: false,
            wait_to_send_until_received_sequence_number: 0,
            sending_packets: BTreeMap::new(),
            received_packets: BTreeMap::new(),
            send_stream: VecDeque::new(),
            receive_stream: VecDeque::new(),
            last_delivered_data: None,
            write_ready: false,
            total_packets_to_resend: 0,
            available_burst_batons: 1,
            total_batons: 1,
            packets_per_burst: DEFAULT_PACKETS_PER_BURST,
            add_to_available_batons_duration: max(
                calculated_rtt * 2,
                Duration::from_millis(200),
            ),
            bandwidth_increase_frozen: false,
            total_sending_period_without_issues: Duration::ZERO,
            started_sending_at: None,
            burst_timer_at: None,
            ensure_ack_timer_at: None,
            add_batons_timer_at: None,
            force_ack_request_id: None,
            force_ack_up_to_sequence_number: 0,
            force_ack_next_time_possible: false,
            next_request_id: 1,
            duplicate_received: false,
            ecn_received: false,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn state(&self) -> RudpStreamState {
        self.state
    }

    pub fn error(&self) -> Option<RudpStreamError> {
        self.error
    }

    pub fn gsnr(&self) -> u64 {
        self.gsnr
    }

    pub fn gsnfr(&self) -> u64 {
        self.gsnfr
    }

    pub fn congestion_state(&self) -> CongestionState {
        CongestionState {
            available_burst_batons: self.available_burst_batons,
            packets_per_burst: self.packets_per_burst,
            add_to_available_batons_duration: self.add_to_available_batons_duration,
            bandwidth_increase_frozen: self.bandwidth_increase_frozen,
            calculated_rtt: self.calculated_rtt,
            total_sending_period_without_issues: self.total_sending_period_without_issues,
        }
    }

    /// Queue application data for sequenced delivery
    pub fn write(
        &mut self,
        now: Instant,
        mut on_event: impl FnMut(RudpStreamEvent),
        data: &[u8],
    ) -> Result<(), RudpStreamError> {
        if self.state == RudpStreamState::Shutdown || self.shutdown_send {
            return Err(RudpStreamError::Shutdown);
        }

        self.send_stream.extend(data);
        self.send_now(now, &mut on_event);

        Ok(())
    }

    /// Read delivered, in-order data
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let len = min(buf.len(), self.receive_stream.len());

        for (i, byte) in self.receive_stream.drain(..len).enumerate() {
            buf[i] = byte;
        }

        len
    }

    /// Number of delivered bytes waiting to be read
    pub fn available_to_read(&self) -> usize {
        self.receive_stream.len()
    }

    /// The embedder's socket can accept packets (again)
    pub fn notify_socket_write_ready(
        &mut self,
        now: Instant,
        mut on_event: impl FnMut(RudpStreamEvent),
    ) {
        if self.write_ready {
            return;
        }

        self.write_ready = true;
        self.send_now(now, &mut on_event);
    }

    /// Do not send any packets until the peer's sending sequence number has
    /// reached `sequence_number`
    pub fn hold_sending_until_received_sequence_number(&mut self, sequence_number: u64) {
        self.wait_to_send_until_received_sequence_number = sequence_number;
    }

    /// Close one direction of the stream
    pub fn shutdown_direction(&mut self, direction: Direction) {
        match direction {
            Direction::Send => self.shutdown_send = true,
            Direction::Receive => self.shutdown_receive = true,
        }
    }

    /// Shut the stream down. With `drain` set the stream stays in
    /// `ShuttingDown` until every buffered send packet was acknowledged.
    /// Idempotent.
    pub fn shutdown(
        &mut self,
        now: Instant,
        mut on_event: impl FnMut(RudpStreamEvent),
        drain: bool,
    ) {
        if self.state == RudpStreamState::Shutdown {
            return;
        }

        self.shutdown_receive = true;
        // no new application data, buffered data still drains
        self.shutdown_send = true;

        if !drain {
            self.cancel(&mut on_event);
            return;
        }

        self.set_state(RudpStreamState::ShuttingDown, &mut on_event);
        self.send_now(now, &mut on_event);
        self.close_on_all_data_sent(&mut on_event);
    }

    /// Ingest a packet received from the wire. Returns false when the packet
    /// was not addressed to or accepted by this stream.
    pub fn handle_packet(
        &mut self,
        now: Instant,
        mut on_event: impl FnMut(RudpStreamEvent),
        data: &[u8],
        ecn_marked: bool,
    ) -> bool {
        if self.state == RudpStreamState::Shutdown {
            return false;
        }

        let packet = match RudpPacket::parse(data) {
            Ok(packet) => packet,
            Err(err) => {
                log::debug!("dropping undecodable packet: {err}");
                return false;
            }
        };

        if packet.channel != self.receive_channel {
            log::debug!(
                "incoming channel mismatch, channel={} packet channel={}",
                self.receive_channel,
                packet.channel
            );
            return false;
        }

        self.ecn_received |= ecn_marked;

        let sequence_number = packet.sequence_number(self.gsnr);

        // no longer have to hold off sending once the expected sequence
        // number has been seen
        if self.wait_to_send_until_received_sequence_number != 0
            && sequence_number >= self.wait_to_send_until_received_sequence_number
        {
            self.wait_to_send_until_received_sequence_number = 0;
        }

        if sequence_number <= self.gsnfr {
            log::debug!(
                "received duplicate packet, GSNFR={} sequence number={sequence_number}",
                self.gsnfr
            );
            self.duplicate_received = true;
            return true;
        }

        if sequence_number > self.gsnr + MAX_WINDOW_TO_NEXT_SEQUENCE_NUMBER {
            log::debug!(
                "received packet beyond allowed window, GSNR={} sequence number={sequence_number}",
                self.gsnr
            );
            return false;
        }

        // before accepting the packet, its piggybacked ACK must make sense
        let ack_result = self.handle_ack(
            now,
            sequence_number,
            packet.gsnr(self.next_sequence_number),
            packet.gsnfr(self.next_sequence_number),
            &packet.vector,
            packet.flags.is_set(Flags::VP_VECTOR_PARITY),
            packet.flags.is_set(Flags::PG_PARITY_GSNR),
            packet.flags.is_set(Flags::XP_XORED_PARITY_TO_GSNFR),
            packet.flags.is_set(Flags::DP_DUPLICATE_PACKET),
            packet.flags.is_set(Flags::EC_ECN_PACKET),
        );

        if ack_result.is_err() {
            log::warn!("received illegal ack, sequence number={sequence_number}");
            self.error.get_or_insert(RudpStreamError::IllegalStreamState);
            self.cancel(&mut on_event);
            return true;
        }

        if self.received_packets.contains_key(&sequence_number) {
            log::debug!(
                "received packet already buffered, sequence number={sequence_number}"
            );
            self.duplicate_received = true;
            return true;
        }

        // expanding the window beyond the regular size is only allowed while
        // delivered data is being read in a timely manner
        if sequence_number > self.gsnfr + MAX_WINDOW_TO_NEXT_SEQUENCE_NUMBER
            && sequence_number > self.gsnr
        {
            let grace = min(
                self.calculated_rtt * 3,
                MAX_EXPAND_WINDOW_SINCE_LAST_DELIVERED,
            );

            if let Some(last_delivered) = self.last_delivered_data {
                if last_delivered + grace < now {
                    log::debug!(
                        "last delivered data too old to expand window, dropping packet \
                         GSNR={} sequence number={sequence_number}",
                        self.gsnr
                    );
                    return false;
                }
            }
        }

        let ack_required = packet.flags.is_set(Flags::AR_ACK_REQUIRED);

        self.received_packets.insert(
            sequence_number,
            BufferedReceivePacket {
                time_received: now,
                parity: packet.flags.is_set(Flags::PS_PARITY_SENDING),
                ecn_marked,
                payload: packet.payload,
            },
        );

        if sequence_number > self.gsnr {
            self.gsnr = sequence_number;
            self.gsnr_parity = packet.flags.is_set(Flags::PS_PARITY_SENDING);
        }

        self.deliver_read_packets(&mut on_event);

        // the window may have moved, attempt to send more data which also
        // piggybacks the ACK the peer may have asked for
        let sent = self.send_now(now, &mut on_event);

        if ack_required && !sent {
            on_event(RudpStreamEvent::SendExternalAckNow { request_id: None });
        }

        true
    }

    /// Ingest ACK fields which were delivered through the out-of-band channel
    pub fn handle_external_ack(
        &mut self,
        now: Instant,
        mut on_event: impl FnMut(RudpStreamEvent),
        request_id: Option<u64>,
        ack: &ExternalAck,
    ) {
        if self.state == RudpStreamState::Shutdown {
            return;
        }

        if self.sending_packets.is_empty() {
            self.force_ack_request_id = None;
        }

        if self.wait_to_send_until_received_sequence_number != 0
            && ack.next_sequence_number >= self.wait_to_send_until_received_sequence_number
        {
            self.wait_to_send_until_received_sequence_number = 0;
        }

        let ack_result = self.handle_ack(
            now,
            ack.next_sequence_number,
            ack.gsnr,
            ack.gsnfr,
            &ack.vector,
            ack.vector_parity,
            ack.gsnr_parity,
            ack.gsnfr_parity,
            ack.duplicate_received,
            ack.ecn_received,
        );

        if ack_result.is_err() {
            log::warn!("received illegal external ack");
            self.error.get_or_insert(RudpStreamError::IllegalStreamState);
            self.cancel(&mut on_event);
            return;
        }

        if let Some(request_id) = request_id {
            if self.force_ack_request_id == Some(request_id) && !self.sending_packets.is_empty() {
                // the forced ACK came back: everything up to the forced
                // sequence number that is still buffered never arrived and
                // must be resent
                self.force_ack_request_id = None;
                self.force_ack_next_time_possible = false;

                let up_to = self.force_ack_up_to_sequence_number;
                for (sequence_number, packet) in self.sending_packets.range_mut(..=up_to) {
                    log::trace!("flagging unacked packet {sequence_number} for resend");
                    packet.flag_for_resending(&mut self.total_packets_to_resend);
                    packet.release_baton(&mut self.available_burst_batons);
                }
            }
        }

        // an ACK did arrive
        self.ensure_ack_timer_at = None;

        self.send_now(now, &mut on_event);
    }

    /// Produce the ACK fields for out-of-band delivery to the peer
    pub fn ack_state(&self) -> ExternalAck {
        let mut encoder = VectorEncoder::new(self.xor_parity_to_gsnfr, MAX_VECTOR_LENGTH);
        let mut sequence_number = self.gsnfr + 1;

        'outer: for (&packet_sequence_number, packet) in &self.received_packets {
            while sequence_number < packet_sequence_number {
                if !encoder.add(VectorState::NotReceived, false) {
                    break 'outer;
                }
                sequence_number += 1;
            }

            let state = if packet.ecn_marked {
                VectorState::ReceivedEcnMarked
            } else {
                VectorState::Received
            };

            if !encoder.add(state, packet.parity) {
                break;
            }
            sequence_number += 1;
        }

        let (vector, vector_parity) = encoder.finalize();

        ExternalAck {
            next_sequence_number: self.next_sequence_number,
            gsnr: self.gsnr,
            gsnfr: self.gsnfr,
            vector,
            vector_parity,
            gsnr_parity: self.gsnr_parity,
            gsnfr_parity: self.xor_parity_to_gsnfr,
            duplicate_received: self.duplicate_received,
            ecn_received: self.ecn_received,
        }
    }

    /// The embedder delivered an out-of-band ACK, the report latches can be
    /// cleared
    pub fn notify_external_ack_sent(&mut self) {
        self.duplicate_received = false;
        self.ecn_received = false;
    }

    /// Drive the stream's timers. Must be called after the duration returned
    /// by [`timeout`](Self::timeout).
    pub fn poll(&mut self, now: Instant, mut on_event: impl FnMut(RudpStreamEvent)) {
        if self.state == RudpStreamState::Shutdown {
            return;
        }

        if let Some(at) = self.burst_timer_at {
            if now >= at {
                self.burst_timer_at = None;
                self.send_now(now, &mut on_event);
            }
        }

        if let Some(at) = self.ensure_ack_timer_at {
            if now >= at {
                // one shot: use the force-ACK mechanism to make sure the
                // outstanding data gets acknowledged
                self.ensure_ack_timer_at = None;
                self.force_ack_next_time_possible = true;
                self.send_now(now, &mut on_event);
            }
        }

        if let Some(at) = self.add_batons_timer_at {
            if now >= at {
                self.add_batons_timer_at = Some(now + self.add_to_available_batons_duration);

                if self.rng.gen::<bool>() {
                    self.available_burst_batons += 1;
                    self.total_batons += 1;
                    log::trace!(
                        "creating a new sending burst baton, batons available={}",
                        self.available_burst_batons
                    );
                } else {
                    self.packets_per_burst += 1;
                    log::trace!(
                        "increasing the packets per burst to {}",
                        self.packets_per_burst
                    );
                }

                self.send_now(now, &mut on_event);
            }
        }
    }

    /// Returns a duration after which to call [`poll`](Self::poll)
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        if self.state == RudpStreamState::Shutdown {
            return None;
        }

        [
            self.burst_timer_at,
            self.ensure_ack_timer_at,
            self.add_batons_timer_at,
        ]
        .into_iter()
        .flatten()
        .min()
        .map(|at| at.saturating_duration_since(now))
    }

    fn set_state(&mut self, new: RudpStreamState, mut on_event: impl FnMut(RudpStreamEvent)) {
        if self.state != new {
            log::debug!("state {:?} -> {:?}", self.state, new);

            on_event(RudpStreamEvent::StateChanged {
                old: self.state,
                new,
            });
            self.state = new;
        }
    }

    fn cancel(&mut self, mut on_event: impl FnMut(RudpStreamEvent)) {
        if self.state == RudpStreamState::Shutdown {
            return;
        }

        self.burst_timer_at = None;
        self.ensure_ack_timer_at = None;
        self.add_batons_timer_at = None;
        self.force_ack_request_id = None;
        self.sending_packets.clear();
        self.send_stream.clear();
        self.received_packets.clear();
        self.total_packets_to_resend = 0;

        self.set_state(RudpStreamState::Shutdown, &mut on_event);
    }

    fn close_on_all_data_sent(&mut self, on_event: &mut impl FnMut(RudpStreamEvent)) {
        if self.state != RudpStreamState::ShuttingDown {
            return;
        }

        if !self.send_stream.is_empty() || !self.sending_packets.is_empty() {
            return;
        }

        log::trace!("all data sent, closing stream");
        self.cancel(on_event);
    }

    fn deliver_read_packets(&mut self, on_event: &mut impl FnMut(RudpStreamEvent)) {
        let mut delivered = 0usize;

        while let Some(entry) = self.received_packets.first_entry() {
            // only the next packet in the ordered series can be processed
            if *entry.key() != self.gsnfr + 1 {
                break;
            }

            let packet = entry.remove();

            self.last_delivered_data = Some(packet.time_received);

            if !packet.payload.is_empty() && !self.shutdown_receive {
                delivered += packet.payload.len();
                self.receive_stream.extend(packet.payload);
            }

            self.gsnfr += 1;
            self.xor_parity_to_gsnfr ^= packet.parity;
        }

        if delivered > 0 {
            log::trace!("delivered {delivered} in-order bytes");
            on_event(RudpStreamEvent::DataReadable);
        }
    }

    /// Process the ACK fields of a packet or an external ACK
    #[allow(clippy::too_many_arguments)]
    fn handle_ack(
        &mut self,
        now: Instant,
        remote_next_sequence_number: u64,
        gsnr: u64,
        gsnfr: u64,
        vector: &[u8],
        vp: bool,
        pg: bool,
        xp: bool,
        dp: bool,
        ec: bool,
    ) -> Result<(), ()> {
        let result = self.handle_ack_inner(
            now,
            remote_next_sequence_number,
            gsnr,
            gsnfr,
            vector,
            vp,
            pg,
            xp,
            dp,
            ec,
        );

        self.handle_unfreezing();

        if self.sending_packets.is_empty() {
            // no need to force an ACK once everything is acknowledged
            self.force_ack_request_id = None;
        }

        result
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_ack_inner(
        &mut self,
        now: Instant,
        remote_next_sequence_number: u64,
        gsnr: u64,
        gsnfr: u64,
        vector: &[u8],
        vp: bool,
        pg: bool,
        xp: bool,
        dp: bool,
        ec: bool,
    ) -> Result<(), ()> {
        if ec {
            self.handle_ecn();
        }

        if self.sending_packets.is_empty() {
            log::trace!("ignoring incoming ACK because there is no send data to ACK");
            return Ok(());
        }

        if gsnfr > gsnr {
            return Err(());
        }

        // stale or out-of-window ACKs are ignored
        if remote_next_sequence_number < self.gsnfr {
            log::debug!("ignoring ACK for already processed packet");
            return Ok(());
        }

        if remote_next_sequence_number > self.gsnr + MAX_WINDOW_TO_NEXT_SEQUENCE_NUMBER {
            log::debug!("ignoring ACK too far outside window");
            return Ok(());
        }

        // the remote party claims it received a packet that was never sent
        if gsnr > self.next_sequence_number {
            log::debug!("ignoring ACK for a packet that was never sent");
            return Ok(());
        }

        if let Some(gsnfr_packet) = self.sending_packets.get(&gsnfr) {
            // the parity up to the fully received point must match
            if xp != gsnfr_packet.xor_parity_to_now {
                log::warn!("ACK parity up to GSNFR is not correct");
                return Err(());
            }
        }

        if let Some(gsnr_packet) = self.sending_packets.get(&gsnr) {
            if gsnr_packet.ack_required && !gsnr_packet.flagged_as_failed_to_receive {
                // RTT can be measured since this ACK covers a first delivery
                let sample = now.duration_since(gsnr_packet.time_sent);
                let old_rtt = self.calculated_rtt;

                // move halfway between the previous calculation and the new one
                self.calculated_rtt = if sample > old_rtt {
                    old_rtt + (sample - old_rtt) / 2
                } else {
                    old_rtt - (old_rtt - sample) / 2
                };

                if self.calculated_rtt < self.minimum_rtt {
                    self.calculated_rtt = self.minimum_rtt;
                }

                log::trace!("calculated RTT {:?}", self.calculated_rtt);

                if self.calculated_rtt > self.add_to_available_batons_duration {
                    self.add_to_available_batons_duration = self.calculated_rtt * 2;

                    if self.add_batons_timer_at.is_some() {
                        self.add_batons_timer_at =
                            Some(now + self.add_to_available_batons_duration);
                    }
                }
            }

            if pg != gsnr_packet.parity {
                log::warn!("ACK parity of GSNR packet is not correct");
                return Err(());
            }
        }

        let mut had_packets = !self.sending_packets.is_empty();

        // acknowledge & clean out everything up to and including the GSNFR
        while let Some(entry) = self.sending_packets.first_entry() {
            if *entry.key() > gsnfr {
                break;
            }

            log::trace!("cleaning ACKed packet {}", entry.key());

            let mut packet = entry.remove();
            packet.flag_as_received_by_remote_party(
                &mut self.total_packets_to_resend,
                &mut self.available_burst_batons,
            );
        }

        if self.sending_packets.is_empty() && had_packets && !ec {
            if let Some(started) = self.started_sending_at.take() {
                self.total_sending_period_without_issues += now.duration_since(started);
            }
            had_packets = false;
        }

        // there is no vector if these are equal
        if gsnr == gsnfr {
            return Ok(());
        }

        let mut vector_sequence_number = gsnfr + 1;
        let mut decoder = VectorDecoder::new(vector);

        let mut xored_parity = xp;
        let mut found_ecn = false;
        let mut found_loss = false;
        let mut could_not_calculate_vector_parity = false;

        let buffered: Vec<u64> = self
            .sending_packets
            .range(vector_sequence_number..)
            .map(|(sequence_number, _)| *sequence_number)
            .collect();

        'outer: for sequence_number in buffered {
            // skip vector entries for packets no longer buffered
            while vector_sequence_number < sequence_number {
                match decoder.next() {
                    Some(VectorState::Received) | Some(VectorState::ReceivedEcnMarked) => {
                        could_not_calculate_vector_parity = true;
                    }
                    Some(VectorState::NotReceived) => {}
                    None => break 'outer,
                }
                vector_sequence_number += 1;
            }

            let Some(state) = decoder.next() else {
                break;
            };

            let packet = self
                .sending_packets
                .get_mut(&sequence_number)
                .expect("buffered keys are valid");

            match state {
                VectorState::Received | VectorState::ReceivedEcnMarked => {
                    xored_parity ^= packet.parity;

                    log::trace!("marking packet {sequence_number} as received by vector ACK");
                    packet.flag_as_received_by_remote_party(
                        &mut self.total_packets_to_resend,
                        &mut self.available_burst_batons,
                    );
                }
                VectorState::NotReceived => {
                    if !packet.flagged_as_failed_to_receive {
                        // first report of this packet being lost, it needs to
                        // be resent right away
                        packet.flagged_as_failed_to_receive = true;
                        packet.flag_for_resending(&mut self.total_packets_to_resend);
                        found_loss = true;
                    }
                }
            }

            if state == VectorState::ReceivedEcnMarked {
                found_ecn = true;
            }

            vector_sequence_number += 1;
        }

        // the GSNR packet itself is known to be received
        if let Some(gsnr_packet) = self.sending_packets.get_mut(&gsnr) {
            gsnr_packet.flag_as_received_by_remote_party(
                &mut self.total_packets_to_resend,
                &mut self.available_burst_batons,
            );
        }

        if self.sending_packets.is_empty() && had_packets && !ec {
            if let Some(started) = self.started_sending_at.take() {
                self.total_sending_period_without_issues += now.duration_since(started);
            }
        }

        if found_ecn && !ec {
            self.handle_ecn();
        }

        if dp {
            self.handle_duplicate();
        }

        if found_loss {
            self.handle_packet_loss(now);
        }

        // the reconstructed vector parity must match the claim
        if !could_not_calculate_vector_parity && xored_parity != vp {
            log::warn!("ACK vector parity is not correct");
            return Err(());
        }

        Ok(())
    }

    fn handle_ecn(&self) {
        log::trace!("handling ECN congestion hint");
    }

    fn handle_duplicate(&self) {
        log::trace!("peer reported receiving duplicate packets");
    }

    fn handle_packet_loss(&mut self, now: Instant) {
        log::debug!("handling packet loss");

        let was_frozen = self.bandwidth_increase_frozen;

        // freeze any increase of the sending rate
        self.bandwidth_increase_frozen = true;
        self.started_sending_at = Some(now);
        self.total_sending_period_without_issues = Duration::ZERO;
        self.add_batons_timer_at = None;

        if !was_frozen {
            // back off the pace at which bandwidth gets added
            self.add_to_available_batons_duration *= 2;
        }

        if self.packets_per_burst > 1 {
            self.packets_per_burst = max(self.packets_per_burst / 2, 1);
            log::debug!("decreased packets per burst to {}", self.packets_per_burst);
            return;
        }

        if self.available_burst_batons > 1 {
            self.available_burst_batons -= 1;
            self.total_batons -= 1;
            log::debug!(
                "decreased available batons to {}",
                self.available_burst_batons
            );
            return;
        }

        // the last available baton cannot be destroyed, take one held by an
        // in-flight packet instead
        let mut which_baton_to_destroy = u32::from(self.available_burst_batons == 0);

        for packet in self.sending_packets.values_mut() {
            if !packet.holds_baton {
                continue;
            }

            if which_baton_to_destroy == 0 {
                packet.release_baton(&mut self.available_burst_batons);
                self.available_burst_batons -= 1;
                self.total_batons -= 1;
                log::debug!(
                    "destroyed a held baton, available batons={}",
                    self.available_burst_batons
                );
                return;
            }

            which_baton_to_destroy -= 1;
        }
    }

    fn handle_unfreezing(&mut self) {
        if self.total_sending_period_without_issues <= UNFREEZE_AFTER_GOOD_TRANSMISSION {
            return;
        }

        self.bandwidth_increase_frozen = false;
        self.total_sending_period_without_issues = Duration::ZERO;

        // speed up adding bandwidth again, but never faster than the RTT
        self.add_to_available_batons_duration =
            max(self.add_to_available_batons_duration / 2, self.calculated_rtt);

        // recreated by the send cleanup with the new duration
        self.add_batons_timer_at = None;

        log::debug!(
            "good transmission period, unfreezing bandwidth increase, add baton duration={:?}",
            self.add_to_available_batons_duration
        );
    }

    /// Send a burst of packets if allowed, returns whether a new packet was
    /// created
    fn send_now(&mut self, now: Instant, on_event: &mut impl FnMut(RudpStreamEvent)) -> bool {
        if self.state == RudpStreamState::Shutdown {
            return false;
        }

        if self.wait_to_send_until_received_sequence_number != 0 {
            log::trace!(
                "cannot send while waiting for sequence number {}",
                self.wait_to_send_until_received_sequence_number
            );
            return false;
        }

        if !self.write_ready {
            log::trace!("cannot send, socket not ready for writing");
            return false;
        }

        let mut created_packet = false;
        let mut last_sent_sequence_number = None;

        if self.available_burst_batons != 0 {
            let mut packets_to_send = self.packets_per_burst;
            // all packets of one burst share the ACK vector
            let mut burst_vector: Option<(Vec<u8>, bool)> = None;

            while packets_to_send != 0 {
                // resend-flagged packets go out before new data
                let resend = if self.total_packets_to_resend != 0 {
                    self.sending_packets
                        .iter()
                        .find(|(_, packet)| {
                            packet.flag_for_resend_next_burst && packet.packet.is_some()
                        })
                        .map(|(sequence_number, packet)| {
                            (*sequence_number, packet.packet.clone().unwrap())
                        })
                } else {
                    None
                };

                if let Some((sequence_number, data)) = resend {
                    log::trace!("resending packet {sequence_number}");

                    on_event(RudpStreamEvent::SendPacket(data));

                    let packet = self
                        .sending_packets
                        .get_mut(&sequence_number)
                        .expect("resend candidate is buffered");

                    // resent data must be confirmed, force an ACK when
                    // possible
                    self.force_ack_next_time_possible = true;
                    packet.do_not_resend(&mut self.total_packets_to_resend);

                    last_sent_sequence_number = Some(sequence_number);
                    packets_to_send -= 1;
                    continue;
                }

                if self.send_stream.is_empty() {
                    break;
                }

                let parity = self.rng.gen::<bool>();

                let mut flags = Flags::default();
                flags.set(Flags::PS_PARITY_SENDING, parity);
                flags.set(Flags::PG_PARITY_GSNR, self.gsnr_parity);
                flags.set(Flags::XP_XORED_PARITY_TO_GSNFR, self.xor_parity_to_gsnfr);
                flags.set(Flags::DP_DUPLICATE_PACKET, self.duplicate_received);
                flags.set(Flags::EC_ECN_PACKET, self.ecn_received);
                self.duplicate_received = false;
                self.ecn_received = false;

                let (vector, vector_parity) = match &burst_vector {
                    Some(vector) => vector.clone(),
                    None => {
                        let vector = self.build_ack_vector();
                        burst_vector = Some(vector.clone());
                        vector
                    }
                };
                flags.set(Flags::VP_VECTOR_PARITY, vector_parity);

                let room = self.max_packet_size - HEADER_LEN - vector.len();
                let take = min(room, self.send_stream.len());
                let payload: Vec<u8> = self.send_stream.drain(..take).collect();

                // the last packet of a burst and the last packet of the
                // pending data ask for an immediate ACK
                let ack_required = self.send_stream.is_empty() || packets_to_send == 1;
                flags.set(Flags::AR_ACK_REQUIRED, ack_required);

                if ack_required {
                    // this packet acts as the implicit way to get an ACK
                    self.ensure_ack_timer_at = None;
                }

                let sequence_number = self.next_sequence_number;
                let data = RudpPacket::serialize(
                    self.send_channel,
                    flags,
                    sequence_number,
                    self.gsnr,
                    self.gsnfr,
                    &vector,
                    &payload,
                );

                self.xor_parity_to_now ^= parity;

                if self.sending_packets.is_empty() {
                    // the starting point of a fresh sending period
                    self.started_sending_at = Some(now);
                }

                log::trace!(
                    "sending packet {sequence_number}, size={}, ar={ack_required}",
                    data.len()
                );

                self.sending_packets.insert(
                    sequence_number,
                    BufferedSendPacket {
                        time_sent: now,
                        parity,
                        xor_parity_to_now: self.xor_parity_to_now,
                        ack_required,
                        holds_baton: false,
                        flagged_as_failed_to_receive: false,
                        flag_for_resend_next_burst: false,
                        packet: Some(data.clone()),
                    },
                );

                self.next_sequence_number += 1;
                created_packet = true;

                on_event(RudpStreamEvent::SendPacket(data));

                last_sent_sequence_number = Some(sequence_number);
                packets_to_send -= 1;
            }
        }

        // the last packet sent in the burst holds the baton
        if let Some(sequence_number) = last_sent_sequence_number {
            if let Some(packet) = self.sending_packets.get_mut(&sequence_number) {
                if packet.packet.is_some() {
                    packet.consume_baton(&mut self.available_burst_batons);
                }
            }
        }

        self.send_now_cleanup(now, on_event);

        created_packet
    }

    /// Build the ACK vector describing the receive window
    fn build_ack_vector(&self) -> (Vec<u8>, bool) {
        let mut encoder = VectorEncoder::new(self.xor_parity_to_gsnfr, MAX_VECTOR_LENGTH);
        let mut sequence_number = self.gsnfr + 1;

        'outer: for (&packet_sequence_number, packet) in &self.received_packets {
            while sequence_number < packet_sequence_number {
                if !encoder.add(VectorState::NotReceived, false) {
                    break 'outer;
                }
                sequence_number += 1;
            }

            let state = if packet.ecn_marked {
                VectorState::ReceivedEcnMarked
            } else {
                VectorState::Received
            };

            if !encoder.add(state, packet.parity) {
                break;
            }
            sequence_number += 1;
        }

        encoder.finalize()
    }

    /// Re-evaluate timers & forced-ACK needs after any send attempt
    fn send_now_cleanup(&mut self, now: Instant, on_event: &mut impl FnMut(RudpStreamEvent)) {
        let write_buffers = self.send_stream.len();

        self.handle_unfreezing();

        let mut add_batons_timer = !self.bandwidth_increase_frozen
            && self.total_packets_to_resend == 0
            && (!self.sending_packets.is_empty() || write_buffers > 0);

        let burst_timer_required = self.available_burst_batons != 0
            && ((!self.sending_packets.is_empty() && self.total_packets_to_resend != 0)
                || write_buffers > 0);

        let mut ensure_ack_timer = false;
        let mut force_ack_required = false;

        if !self.sending_packets.is_empty() {
            // unacked sent packets are in the buffer: make sure an ACK for
            // them eventually arrives
            ensure_ack_timer = true;
            force_ack_required = true;

            if self.available_burst_batons != 0 && write_buffers > 0 {
                // more data will be sent anyway which carries an implicit
                // ACK request
                ensure_ack_timer = false;
                force_ack_required = self.force_ack_next_time_possible;
            }

            if self.force_ack_request_id.is_some() {
                // an outstanding forced ACK exists already
                force_ack_required = false;
            }

            if force_ack_required && !self.force_ack_next_time_possible {
                // an in-flight ACK-required packet holding a baton will
                // produce the ACK on its own
                let implicit_ack_in_flight = self.sending_packets.values().any(|packet| {
                    packet.holds_baton
                        && packet.ack_required
                        && !packet.flag_for_resend_next_burst
                });

                if implicit_ack_in_flight {
                    force_ack_required = false;
                }
            }

            if force_ack_required {
                ensure_ack_timer = false;
            }
        }

        if self.sending_packets.is_empty() {
            self.force_ack_request_id = None;
            force_ack_required = false;
        }

        if force_ack_required || self.force_ack_request_id.is_some() {
            // forcing the ACK covers both of these
            add_batons_timer = false;
            ensure_ack_timer = false;
        }

        if burst_timer_required {
            if self.burst_timer_at.is_none() {
                // all available bursts should happen within one RTT
                let burst_duration = max(
                    self.calculated_rtt / self.available_burst_batons,
                    MINIMUM_BURST_TIMER,
                );
                self.burst_timer_at = Some(now + burst_duration);
            }
        } else {
            self.burst_timer_at = None;
        }

        if ensure_ack_timer {
            if self.ensure_ack_timer_at.is_none() {
                // fires at 1.5 x calculated RTT
                self.ensure_ack_timer_at = Some(now + self.calculated_rtt * 3 / 2);
            }
        } else {
            self.ensure_ack_timer_at = None;
        }

        if force_ack_required {
            let request_id = self.next_request_id;
            self.next_request_id += 1;

            self.force_ack_request_id = Some(request_id);
            self.force_ack_up_to_sequence_number = self.next_sequence_number - 1;
            self.force_ack_next_time_possible = false;

            log::trace!(
                "forcing an ACK immediately, request id={request_id}, up to sequence number={}",
                self.force_ack_up_to_sequence_number
            );

            on_event(RudpStreamEvent::SendExternalAckNow {
                request_id: Some(request_id),
            });
        }

        if add_batons_timer {
            if self.add_batons_timer_at.is_none() {
                self.add_batons_timer_at = Some(now + self.add_to_available_batons_duration);
            }
        } else {
            self.add_batons_timer_at = None;
        }

        self.close_on_all_data_sent(on_event);

        debug_assert_eq!(
            self.available_burst_batons
                + self
                    .sending_packets
                    .values()
                    .filter(|p| p.holds_baton)
                    .count() as u32,
            self.total_batons,
            "baton conservation violated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> RudpStream {
        RudpStream::new(RudpStreamConfig::default())
    }

    fn collect(events: &mut Vec<RudpStreamEvent>) -> impl FnMut(RudpStreamEvent) + '_ {
        |event| events.push(event)
    }

    /// Craft a data packet the way a peer with default config would
    fn peer_packet(sequence_number: u64, payload: &[u8], ar: bool) -> Vec<u8> {
        let mut flags = Flags::default();
        flags.set(Flags::AR_ACK_REQUIRED, ar);

        RudpPacket::serialize(0, flags, sequence_number, 0, 0, &[], payload)
    }

    #[test]
    fn in_order_delivery() {
        let mut stream = stream();
        let mut events = Vec::new();

        assert!(stream.handle_packet(Instant::now(), collect(&mut events), &peer_packet(1, b"abc", false), false));
        assert!(stream.handle_packet(Instant::now(), collect(&mut events), &peer_packet(2, b"def", false), false));

        assert_eq!(stream.gsnfr(), 2);

        let mut buf = [0u8; 16];
        let read = stream.read(&mut buf);
        assert_eq!(&buf[..read], b"abcdef");
    }

    #[test]
    fn reordered_packets_are_delivered_in_order() {
        let mut stream = stream();
        let mut events = Vec::new();

        assert!(stream.handle_packet(Instant::now(), collect(&mut events), &peer_packet(2, b"def", false), false));
        assert_eq!(stream.gsnfr(), 0);
        assert_eq!(stream.gsnr(), 2);
        assert_eq!(stream.available_to_read(), 0);

        assert!(stream.handle_packet(Instant::now(), collect(&mut events), &peer_packet(1, b"abc", false), false));
        assert_eq!(stream.gsnfr(), 2);

        let mut buf = [0u8; 16];
        let read = stream.read(&mut buf);
        assert_eq!(&buf[..read], b"abcdef");
    }

    #[test]
    fn duplicate_packet_is_rejected_and_latched() {
        let mut stream = stream();
        let mut events = Vec::new();

        assert!(stream.handle_packet(Instant::now(), collect(&mut events), &peer_packet(1, b"abc", false), false));
        // sequence number == GSNFR is a duplicate
        assert!(stream.handle_packet(Instant::now(), collect(&mut events), &peer_packet(1, b"abc", false), false));

        let ack = stream.ack_state();
        assert!(ack.duplicate_received);
        assert_eq!(stream.available_to_read(), 3);

        stream.notify_external_ack_sent();
        assert!(!stream.ack_state().duplicate_received);
    }

    #[test]
    fn out_of_window_packet_is_rejected() {
        let mut stream = stream();
        let mut events = Vec::new();

        assert!(stream.handle_packet(Instant::now(), collect(&mut events), &peer_packet(1, b"a", false), false));

        // gsnr == 1, packets up to gsnr + 256 are acceptable
        let too_far = 1 + MAX_WINDOW_TO_NEXT_SEQUENCE_NUMBER + 1;
        assert!(!stream.handle_packet(Instant::now(), collect(&mut events), &peer_packet(too_far, b"x", false), false));

        assert_eq!(stream.gsnr(), 1);

        // the edge of the window is still accepted
        let edge = 1 + MAX_WINDOW_TO_NEXT_SEQUENCE_NUMBER;
        assert!(stream.handle_packet(Instant::now(), collect(&mut events), &peer_packet(edge, b"y", false), false));
        assert_eq!(stream.gsnr(), edge);
    }

    #[test]
    fn ecn_mark_is_latched_until_reported() {
        let mut stream = stream();
        let mut events = Vec::new();

        assert!(stream.handle_packet(Instant::now(), collect(&mut events), &peer_packet(1, b"a", false), true));

        assert!(stream.ack_state().ecn_received);
        stream.notify_external_ack_sent();
        assert!(!stream.ack_state().ecn_received);
    }

    #[test]
    fn ack_required_fires_external_ack_when_nothing_to_send() {
        let mut stream = stream();
        let mut events = Vec::new();

        assert!(stream.handle_packet(Instant::now(), collect(&mut events), &peer_packet(1, b"abc", true), false));

        assert!(events.iter().any(|event| matches!(
            event,
            RudpStreamEvent::SendExternalAckNow { request_id: None }
        )));
    }

    #[test]
    fn congestion_backoff_on_reported_loss() {
        let mut stream = stream();
        let mut events = Vec::new();
        let now = Instant::now();

        stream.notify_socket_write_ready(now, collect(&mut events));

        // grow to a known congestion state
        stream.available_burst_batons = 4;
        stream.total_batons = 4;
        stream.packets_per_burst = 3;
        stream.add_to_available_batons_duration = Duration::from_millis(400);

        // put enough data in flight for a loss report to make sense
        stream
            .write(now, collect(&mut events), &[0u8; 4000])
            .unwrap();
        assert!(stream.sending_packets.len() >= 3);

        // the peer reports packet 2 as a gap: received 1 fully, saw 3
        let gsnr_packet_parity = stream.sending_packets[&3].parity;
        let gsnfr_parity = stream.sending_packets[&1].xor_parity_to_now;
        let mut encoder = VectorEncoder::new(gsnfr_parity, MAX_VECTOR_LENGTH);
        encoder.add(VectorState::NotReceived, false);
        let (vector, vector_parity) = encoder.finalize();

        let ack = ExternalAck {
            next_sequence_number: 1,
            gsnr: 3,
            gsnfr: 1,
            vector,
            vector_parity,
            gsnr_parity: gsnr_packet_parity,
            gsnfr_parity,
            duplicate_received: false,
            ecn_received: false,
        };

        stream.handle_external_ack(now, collect(&mut events), None, &ack);

        let congestion = stream.congestion_state();
        assert!(congestion.bandwidth_increase_frozen);
        assert_eq!(congestion.packets_per_burst, 1);
        assert_eq!(
            congestion.add_to_available_batons_duration,
            Duration::from_millis(800)
        );
        assert_eq!(
            congestion.total_sending_period_without_issues,
            Duration::ZERO
        );
    }

    #[test]
    fn illegal_ack_parity_shuts_the_stream_down() {
        let mut stream = stream();
        let mut events = Vec::new();
        let now = Instant::now();

        stream.notify_socket_write_ready(now, collect(&mut events));
        stream.write(now, collect(&mut events), b"hello").unwrap();
        assert!(!stream.sending_packets.is_empty());

        let wrong_parity = !stream.sending_packets[&1].xor_parity_to_now;

        let ack = ExternalAck {
            next_sequence_number: 1,
            gsnr: 1,
            gsnfr: 1,
            vector: Vec::new(),
            vector_parity: false,
            gsnr_parity: stream.sending_packets[&1].parity,
            gsnfr_parity: wrong_parity,
            duplicate_received: false,
            ecn_received: false,
        };

        stream.handle_external_ack(now, collect(&mut events), None, &ack);

        assert_eq!(stream.state(), RudpStreamState::Shutdown);
        assert_eq!(stream.error(), Some(RudpStreamError::IllegalStreamState));
    }

    #[test]
    fn batons_are_conserved_across_acks() {
        let mut stream = stream();
        let mut events = Vec::new();
        let now = Instant::now();

        stream.notify_socket_write_ready(now, collect(&mut events));
        stream.write(now, collect(&mut events), b"ping").unwrap();

        let held: u32 = stream
            .sending_packets
            .values()
            .filter(|p| p.holds_baton)
            .count() as u32;
        assert_eq!(stream.available_burst_batons + held, stream.total_batons);

        let gsnfr_parity = stream.sending_packets[&1].xor_parity_to_now;
        let ack = ExternalAck {
            next_sequence_number: 1,
            gsnr: 1,
            gsnfr: 1,
            vector: Vec::new(),
            vector_parity: false,
            gsnr_parity: stream.sending_packets[&1].parity,
            gsnfr_parity,
            duplicate_received: false,
            ecn_received: false,
        };
        stream.handle_external_ack(now, collect(&mut events), None, &ack);

        assert!(stream.sending_packets.is_empty());
        assert_eq!(stream.available_burst_batons, stream.total_batons);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let mut stream = stream();
        let mut transitions = 0;

        for _ in 0..2 {
            stream.shutdown(
                Instant::now(),
                |event| {
                    if matches!(event, RudpStreamEvent::StateChanged { .. }) {
                        transitions += 1;
                    }
                },
                false,
            );
        }

        assert_eq!(transitions, 1);
        assert_eq!(stream.state(), RudpStreamState::Shutdown);
    }

    #[test]
    fn shutdown_with_drain_waits_for_acks() {
        let mut stream = stream();
        let mut events = Vec::new();
        let now = Instant::now();

        stream.notify_socket_write_ready(now, collect(&mut events));
        stream.write(now, collect(&mut events), b"last words").unwrap();

        stream.shutdown(now, collect(&mut events), true);
        assert_eq!(stream.state(), RudpStreamState::ShuttingDown);

        let gsnfr_parity = stream.sending_packets[&1].xor_parity_to_now;
        let ack = ExternalAck {
            next_sequence_number: 1,
            gsnr: 1,
            gsnfr: 1,
            vector: Vec::new(),
            vector_parity: false,
            gsnr_parity: stream.sending_packets[&1].parity,
            gsnfr_parity,
            duplicate_received: false,
            ecn_received: false,
        };
        stream.handle_external_ack(now, collect(&mut events), None, &ack);

        assert_eq!(stream.state(), RudpStreamState::Shutdown);
        assert_eq!(stream.error(), None);
    }

    #[test]
    fn receive_direction_shutdown_drops_payload_but_acks() {
        let mut stream = stream();
        let mut events = Vec::new();

        stream.shutdown_direction(Direction::Receive);

        assert!(stream.handle_packet(Instant::now(), collect(&mut events), &peer_packet(1, b"abc", false), false));

        // window still advances, data is dropped
        assert_eq!(stream.gsnfr(), 1);
        assert_eq!(stream.available_to_read(), 0);
    }

    #[test]
    fn hold_sending_until_sequence_number_seen() {
        let mut stream = stream();
        let mut events = Vec::new();
        let now = Instant::now();

        stream.notify_socket_write_ready(now, collect(&mut events));
        stream.hold_sending_until_received_sequence_number(2);

        stream.write(now, collect(&mut events), b"held").unwrap();
        assert!(events.iter().all(|event| !matches!(event, RudpStreamEvent::SendPacket(_))));

        // a packet with sequence number 2 releases the hold
        stream.handle_packet(now, collect(&mut events), &peer_packet(1, b"a", false), false);
        assert!(events.iter().all(|event| !matches!(event, RudpStreamEvent::SendPacket(_))));

        stream.handle_packet(now, collect(&mut events), &peer_packet(2, b"b", false), false);
        assert!(events.iter().any(|event| matches!(event, RudpStreamEvent::SendPacket(_))));
    }
}
