#![deny(unreachable_pub, unsafe_code)]

//! sans io implementation of an ICE connectivity session
//!
//! [`IceSession`] performs connectivity checks between local & remote
//! transport candidates, nominates a working path and keeps it alive.
//! All I/O and timing is delegated to the embedder: packets go in through
//! [`IceSession::receive`], timers are driven by [`IceSession::poll`] /
//! [`IceSession::timeout`] and everything the session wants to do is
//! reported through [`IceSessionEvent`]s.

use core::fmt;
use rand::distributions::{Alphanumeric, DistString};
use slotmap::{new_key_type, SlotMap};
use std::{
    cmp::{max, min, Reverse},
    collections::HashSet,
    hash::{DefaultHasher, Hash, Hasher},
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};
use stun_types::{
    attributes::{ErrorCode, Fingerprint, IceControlled, IceControlling, UseCandidate},
    Class, Message, TransactionId,
};

mod stun;

use stun::{BindingRequestParams, StunConfig};

/// Pacing interval of the candidate pair activation timer
const ACTIVATE_INTERVAL: Duration = Duration::from_millis(20);

/// A message received on the session's UDP socket
pub struct ReceivedPkt {
    /// The received data
    pub data: Vec<u8>,
    /// Source address of the message
    pub source: SocketAddr,
    /// Local socket destination address of the message
    pub destination: SocketAddr,
}

/// Role of the ICE session in the nomination process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceRole {
    /// This session chooses which candidate pair gets nominated
    Controlling,
    /// This session follows the peer's nomination
    Controlled,
}

/// Events emitted by the [`IceSession`]
#[derive(Debug)]
pub enum IceSessionEvent {
    StateChanged {
        old: IceSessionState,
        new: IceSessionState,
    },
    /// The nominated pair changed, `None` when the nomination was lost
    NominationChanged {
        nominated: Option<(Candidate, Candidate)>,
    },
    /// A pair has been nominated, [`IceSession::send_packet`] will now succeed
    Writable,
    /// Non-STUN data arrived on the session's path
    PacketReceived { data: Vec<u8>, source: SocketAddr },
    SendData {
        data: Vec<u8>,
        source: Option<IpAddr>,
        target: SocketAddr,
    },
    /// The session is done, no further events will be emitted
    Closed { error: Option<IceSessionError> },
}

/// State of the ICE session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceSessionState {
    /// The session was just created, no candidates are known yet
    Pending,
    /// Local candidates exist but no pairs could be formed yet
    Prepared,
    /// Connectivity checks are running
    Searching,
    /// Every known pair failed, but the remote candidate list is not final
    Halted,
    /// A nomination request is in flight
    Nominating,
    /// A pair is nominated and carries application traffic
    Nominated,
    /// A pair is nominated and no higher-priority pair is left to consider
    Completed,
    /// Terminal state
    Shutdown,
}

/// Errors reported by the [`IceSession`]
///
/// Fatal kinds close the session; the numeric `code` mirrors the
/// HTTP-status taxonomy used on the signalling layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IceSessionError {
    #[error("not nominated")]
    NotNominated,
    #[error("unauthorized")]
    Unauthorized,
    #[error("candidate search failed")]
    CandidateSearchFailed,
    #[error("backgrounding timeout")]
    BackgroundingTimeout,
    #[error("shutdown")]
    Shutdown,
}

impl IceSessionError {
    pub fn code(&self) -> u16 {
        match self {
            IceSessionError::NotNominated => 412,
            IceSessionError::Unauthorized => 401,
            IceSessionError::CandidateSearchFailed => 404,
            IceSessionError::BackgroundingTimeout => 408,
            IceSessionError::Shutdown => 410,
        }
    }
}

new_key_type!(
    struct LocalCandidateId;
    struct RemoteCandidateId;
);

/// Kind of a transport candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum CandidateKind {
    /// Candidate directly bound on a local interface (host candidate)
    Local = 126,
    PeerReflexive = 110,
    ServerReflexive = 100,
    Relayed = 0,
}

/// A local or remote transport candidate, immutable after creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub kind: CandidateKind,
    pub addr: SocketAddr,
    /// Address this candidate is derived from (and sends from), set for
    /// everything but [`CandidateKind::Local`]
    pub related_addr: Option<SocketAddr>,
    pub priority: u64,
    pub local_preference: u32,
    pub foundation: String,
}

impl Candidate {
    pub fn new(
        kind: CandidateKind,
        addr: SocketAddr,
        related_addr: Option<SocketAddr>,
        local_preference: u32,
    ) -> Self {
        let base = related_addr.unwrap_or(addr);

        Candidate {
            kind,
            addr,
            related_addr,
            priority: candidate_priority(kind, local_preference),
            local_preference,
            foundation: compute_foundation(kind, base.ip(), "udp").to_string(),
        }
    }

    pub fn local(addr: SocketAddr, local_preference: u32) -> Self {
        Self::new(CandidateKind::Local, addr, None, local_preference)
    }

    pub fn server_reflexive(
        addr: SocketAddr,
        related_addr: SocketAddr,
        local_preference: u32,
    ) -> Self {
        Self::new(
            CandidateKind::ServerReflexive,
            addr,
            Some(related_addr),
            local_preference,
        )
    }

    pub fn relayed(addr: SocketAddr, related_addr: SocketAddr, local_preference: u32) -> Self {
        Self::new(CandidateKind::Relayed, addr, Some(related_addr), local_preference)
    }

    /// The address packets of this candidate are actually sent & received on
    fn via_addr(&self) -> SocketAddr {
        match self.kind {
            CandidateKind::Local => self.addr,
            _ => self.related_addr.unwrap_or(self.addr),
        }
    }
}

/// `(1 << 24) * kind + (1 << 8) * local-preference + component slot`,
/// this library always carries a single component
pub fn candidate_priority(kind: CandidateKind, local_preference: u32) -> u64 {
    2u64.pow(24) * kind as u64 + 2u64.pow(8) * local_preference as u64 + 256
}

/// Credentials of an ICE session
///
/// These must be exchanged using some external signaling protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();

        Self {
            ufrag: Alphanumeric.sample_string(&mut rng, 8),
            pwd: Alphanumeric.sample_string(&mut rng, 32),
        }
    }

    /// Credentials of a plain STUN server, checks against such a peer run
    /// without short-term credentials and the first successful response
    /// nominates the pair
    pub fn server_mode() -> Self {
        Self {
            ufrag: String::new(),
            pwd: String::new(),
        }
    }
}

/// Keepalive & liveness behavior of a nominated session
#[derive(Debug, Clone, Copy)]
pub struct KeepaliveConfig {
    /// Send a STUN binding indication when the application has not sent
    /// anything for this long
    pub send_keepalive: Option<Duration>,
    /// Probe the nominated pair with a binding request when nothing was
    /// received for this long
    pub expect_data_within: Option<Duration>,
    /// How long the probe may go unanswered before the nomination is
    /// considered lost
    pub keepalive_stun_timeout: Duration,
    /// Give up on the session entirely when there was no activity at all
    /// for this long
    pub backgrounding_timeout: Option<Duration>,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            send_keepalive: None,
            expect_data_within: None,
            keepalive_stun_timeout: Duration::from_secs(10),
            backgrounding_timeout: None,
        }
    }
}

/// Configuration for a new [`IceSession`]
pub struct IceSessionConfig {
    pub role: IceRole,
    pub local_credentials: IceCredentials,
    /// Remote credentials, an empty password enables server mode
    pub remote_credentials: IceCredentials,
    pub keepalive: KeepaliveConfig,
    pub max_pairs: usize,
}

impl Default for IceSessionConfig {
    fn default() -> Self {
        Self {
            role: IceRole::Controlling,
            local_credentials: IceCredentials::random(),
            remote_credentials: IceCredentials::server_mode(),
            keepalive: KeepaliveConfig::default(),
            max_pairs: 100,
        }
    }
}

struct CandidatePair {
    local: LocalCandidateId,
    remote: RemoteCandidateId,
    priority: u64,

    /// The peer's connectivity check reached us on this pair
    received_request: bool,
    /// Our connectivity check on this pair got a success response
    received_response: bool,
    failed: bool,
    /// A check was launched on this pair since the last (re)start
    checked: bool,

    check: CheckState,
}

enum CheckState {
    Idle,
    InProgress {
        transaction_id: TransactionId,
        stun_request: Vec<u8>,
        retransmit_at: Instant,
        retransmits: u32,
        source: IpAddr,
        target: SocketAddr,
        use_candidate: bool,
    },
}

impl CandidatePair {
    fn progress_reset(&mut self) {
        self.received_request = false;
        self.received_response = false;
        self.failed = false;
        self.checked = false;
        self.check = CheckState::Idle;
    }
}

/// Outstanding liveness probe on the nominated pair
struct ExpectationProbe {
    transaction_id: TransactionId,
    stun_request: Vec<u8>,
    retransmit_at: Instant,
    retransmits: u32,
    source: IpAddr,
    target: SocketAddr,
    deadline: Instant,
}

/// The ICE session state machine
pub struct IceSession {
    stun_config: StunConfig,

    role: IceRole,
    conflict_resolver: u64,

    local_credentials: IceCredentials,
    remote_credentials: IceCredentials,

    local_candidates: SlotMap<LocalCandidateId, Candidate>,
    remote_candidates: SlotMap<RemoteCandidateId, Candidate>,

    /// Sorted by descending pair priority
    pairs: Vec<CandidatePair>,
    max_pairs: usize,

    end_of_remote_candidates: bool,

    nominated: Option<(LocalCandidateId, RemoteCandidateId)>,
    pending_nomination: Option<(LocalCandidateId, RemoteCandidateId)>,
    previously_nominated: Option<(Candidate, Candidate)>,

    state: IceSessionState,
    error: Option<IceSessionError>,

    keepalive: KeepaliveConfig,
    probe: Option<ExpectationProbe>,

    last_activation: Option<Instant>,
    last_sent: Option<Instant>,
    last_sent_data: Option<Instant>,
    last_received: Option<Instant>,
    last_activity: Option<Instant>,
}

impl IceSession {
    pub fn new(config: IceSessionConfig) -> Self {
        IceSession {
            stun_config: StunConfig::new(),
            role: config.role,
            conflict_resolver: rand::random(),
            local_credentials: config.local_credentials,
            remote_credentials: config.remote_credentials,
            local_candidates: SlotMap::with_key(),
            remote_candidates: SlotMap::with_key(),
            pairs: Vec::new(),
            max_pairs: config.max_pairs,
            end_of_remote_candidates: false,
            nominated: None,
            pending_nomination: None,
            previously_nominated: None,
            state: IceSessionState::Pending,
            error: None,
            keepalive: config.keepalive,
            probe: None,
            last_activation: None,
            last_sent: None,
            last_sent_data: None,
            last_received: None,
            last_activity: None,
        }
    }

    /// Return the session's local ice credentials
    pub fn credentials(&self) -> &IceCredentials {
        &self.local_credentials
    }

    pub fn role(&self) -> IceRole {
        self.role
    }

    pub fn state(&self) -> IceSessionState {
        self.state
    }

    /// Returns the nominated pair, falling back to the previously nominated
    /// one while a lost nomination is being recovered
    pub fn nominated(&self) -> Option<(Candidate, Candidate)> {
        if let Some((local, remote)) = self.nominated {
            return Some((
                self.local_candidates[local].clone(),
                self.remote_candidates[remote].clone(),
            ));
        }

        self.previously_nominated.clone()
    }

    pub fn set_keepalive_properties(&mut self, keepalive: KeepaliveConfig) {
        self.keepalive = keepalive;
    }

    /// All local candidates, excluding discovered peer-reflexive ones
    pub fn local_candidates(&self) -> Vec<Candidate> {
        self.local_candidates
            .values()
            .filter(|c| c.kind != CandidateKind::PeerReflexive)
            .cloned()
            .collect()
    }

    /// Register a local transport candidate, usually a host address of the
    /// socket this session runs on
    pub fn add_local_candidate(&mut self, candidate: Candidate) {
        if candidate.addr.ip().is_unspecified() {
            return;
        }

        let already_exists = self
            .local_candidates
            .values()
            .any(|c| c.kind == candidate.kind && c.addr == candidate.addr);

        if already_exists {
            return;
        }

        log::debug!("add local candidate {:?} {}", candidate.kind, candidate.addr);

        self.local_candidates.insert(candidate);
        self.form_pairs();
    }

    /// Replace the set of remote candidates
    ///
    /// Pairs of candidates which survive the update keep their check
    /// progress, discovered peer-reflexive candidates are always retained.
    pub fn update_remote_candidates(&mut self, candidates: &[Candidate]) {
        let mut removed = Vec::new();

        self.remote_candidates.retain(|id, existing| {
            let keep = existing.kind == CandidateKind::PeerReflexive
                || candidates.iter().any(|c| c == existing);

            if !keep {
                removed.push(id);
            }

            keep
        });

        if !removed.is_empty() {
            self.pairs.retain(|pair| !removed.contains(&pair.remote));

            if let Some((_, remote)) = self.nominated {
                if removed.contains(&remote) {
                    self.drop_nomination();
                }
            }

            if let Some((_, remote)) = self.pending_nomination {
                if removed.contains(&remote) {
                    self.pending_nomination = None;
                }
            }
        }

        for candidate in candidates {
            let already_exists = self.remote_candidates.values().any(|c| c == candidate);

            if already_exists {
                continue;
            }

            log::debug!("add remote candidate {:?} {}", candidate.kind, candidate.addr);
            self.remote_candidates.insert(candidate.clone());
        }

        self.form_pairs();
    }

    /// Declare the remote candidate list final
    ///
    /// Once set, running out of non-failed pairs terminates the session
    /// with [`IceSessionError::CandidateSearchFailed`] instead of halting.
    pub fn end_of_remote_candidates(&mut self) {
        self.end_of_remote_candidates = true;
    }

    /// Send application data over the nominated pair
    pub fn send_packet(
        &mut self,
        now: Instant,
        mut on_event: impl FnMut(IceSessionEvent),
        data: &[u8],
    ) -> Result<(), IceSessionError> {
        if self.state == IceSessionState::Shutdown {
            return Err(IceSessionError::Shutdown);
        }

        // While a lost nomination is being recovered traffic continues to
        // flow over the previously nominated path
        let (source, target) = if let Some((local, remote)) = self.nominated {
            (
                self.local_candidates[local].via_addr().ip(),
                self.remote_candidates[remote].addr,
            )
        } else if let Some((local, remote)) = &self.previously_nominated {
            (local.via_addr().ip(), remote.addr)
        } else {
            return Err(IceSessionError::NotNominated);
        };

        self.last_sent = Some(now);
        self.last_sent_data = Some(now);
        self.last_activity = Some(now);

        on_event(IceSessionEvent::SendData {
            data: data.to_vec(),
            source: Some(source),
            target,
        });

        Ok(())
    }

    /// Shut the session down, cancelling all in-flight checks. Idempotent.
    pub fn end(&mut self, mut on_event: impl FnMut(IceSessionEvent)) {
        if self.state == IceSessionState::Shutdown {
            return;
        }

        for pair in &mut self.pairs {
            pair.check = CheckState::Idle;
        }
        self.probe = None;
        self.pending_nomination = None;

        self.set_state(IceSessionState::Shutdown, &mut on_event);
        on_event(IceSessionEvent::Closed { error: None });
    }

    fn fail(&mut self, error: IceSessionError, mut on_event: impl FnMut(IceSessionEvent)) {
        if self.state == IceSessionState::Shutdown {
            return;
        }

        // first fatal error wins
        let error = *self.error.get_or_insert(error);

        for pair in &mut self.pairs {
            pair.check = CheckState::Idle;
        }
        self.probe = None;
        self.pending_nomination = None;

        self.set_state(IceSessionState::Shutdown, &mut on_event);
        on_event(IceSessionEvent::Closed { error: Some(error) });
    }

    fn form_pairs(&mut self) {
        for (local_id, local_candidate) in &self.local_candidates {
            // A server reflexive candidate cannot be a send source, its base
            // covers the same path
            if local_candidate.kind == CandidateKind::ServerReflexive {
                continue;
            }

            for (remote_id, remote_candidate) in &self.remote_candidates {
                let already_exists = self
                    .pairs
                    .iter()
                    .any(|pair| pair.local == local_id && pair.remote == remote_id);

                if already_exists {
                    continue;
                }

                // Exclude pairs with different ip version
                match (local_candidate.addr.ip(), remote_candidate.addr.ip()) {
                    (IpAddr::V4(..), IpAddr::V4(..)) => { /* ok */ }
                    // Only pair IPv6 addresses when either both or neither are link local addresses
                    (IpAddr::V6(l), IpAddr::V6(r))
                        if l.is_unicast_link_local() == r.is_unicast_link_local() =>
                    { /* ok */ }
                    _ => {
                        // Would make an invalid pair, skip
                        continue;
                    }
                }

                let priority =
                    pair_priority(local_candidate, remote_candidate, self.role);

                log::debug!(
                    "add pair {}, priority: {priority}",
                    DisplayPair(local_candidate, remote_candidate),
                );

                self.pairs.push(CandidatePair {
                    local: local_id,
                    remote: remote_id,
                    priority,
                    received_request: false,
                    received_response: false,
                    failed: false,
                    checked: false,
                    check: CheckState::Idle,
                });
            }
        }

        self.sort_and_prune_pairs();
    }

    fn recompute_pair_priorities(&mut self) {
        for pair in &mut self.pairs {
            pair.priority = pair_priority(
                &self.local_candidates[pair.local],
                &self.remote_candidates[pair.remote],
                self.role,
            );
        }

        self.sort_and_prune_pairs();
    }

    fn sort_and_prune_pairs(&mut self) {
        self.pairs.sort_by_key(|p| Reverse(p.priority));

        // Within one local kind, only the highest priority pair of every
        // (via-address, remote-address) path is kept
        let mut seen: HashSet<(CandidateKind, IpAddr, IpAddr)> = HashSet::new();
        let local_candidates = &self.local_candidates;
        let remote_candidates = &self.remote_candidates;
        let nominated = self.nominated;

        self.pairs.retain(|pair| {
            if nominated == Some((pair.local, pair.remote)) {
                return true;
            }

            let local = &local_candidates[pair.local];
            let remote = &remote_candidates[pair.remote];

            seen.insert((local.kind, local.via_addr().ip(), remote.addr.ip()))
        });

        // Prune the lowest priority pairs until max_pairs is reached
        while self.pairs.len() > self.max_pairs {
            let pair = self.pairs.pop().unwrap();
            log::debug!("pruned pair {:?}:{:?}", pair.local, pair.remote);
        }
    }

    /// A pair is frozen while a higher-priority pair sharing its local
    /// foundation & remote address has neither completed nor failed
    fn pair_is_frozen(&self, index: usize) -> bool {
        let pair = &self.pairs[index];
        let foundation = &self.local_candidates[pair.local].foundation;
        let remote_ip = self.remote_candidates[pair.remote].addr.ip();

        let mut has_predecessor = false;

        for predecessor in &self.pairs[..index] {
            if predecessor.failed {
                continue;
            }

            if &self.local_candidates[predecessor.local].foundation != foundation
                || self.remote_candidates[predecessor.remote].addr.ip() != remote_ip
            {
                continue;
            }

            if predecessor.received_request && predecessor.received_response {
                return false;
            }

            has_predecessor = true;
        }

        has_predecessor
    }

    /// Receive a network packet for this session
    pub fn receive(
        &mut self,
        now: Instant,
        mut on_event: impl FnMut(IceSessionEvent),
        pkt: &ReceivedPkt,
    ) {
        if self.state == IceSessionState::Shutdown {
            return;
        }

        self.last_activity = Some(now);

        if !stun::is_stun_message(&pkt.data) {
            self.last_received = Some(now);

            on_event(IceSessionEvent::PacketReceived {
                data: pkt.data.clone(),
                source: pkt.source,
            });

            return;
        }

        let Ok(mut stun_msg) = Message::parse(pkt.data.clone()) else {
            log::trace!("failed to parse STUN message, discarding");
            return;
        };

        let passed_fingerprint_check = stun_msg
            .attribute::<Fingerprint>()
            .is_some_and(|r| r.is_ok());

        if !passed_fingerprint_check {
            log::trace!(
                "Incoming STUN {:?} failed fingerprint check, discarding",
                stun_msg.class()
            );
            return;
        }

        self.last_received = Some(now);

        match stun_msg.class() {
            Class::Request => self.receive_stun_request(now, &mut on_event, pkt, stun_msg),
            Class::Indication => { /* keepalive, activity was recorded */ }
            Class::Success => self.receive_stun_success(now, &mut on_event, pkt, stun_msg),
            Class::Error => self.receive_stun_error(&mut on_event, stun_msg),
        }

        self.poll_nomination(now, &mut on_event);
        self.poll_state(&mut on_event);
    }

    fn receive_stun_success(
        &mut self,
        now: Instant,
        mut on_event: impl FnMut(IceSessionEvent),
        pkt: &ReceivedPkt,
        mut stun_msg: Message,
    ) {
        if !stun::verify_integrity(
            &self.local_credentials,
            &self.remote_credentials,
            &mut stun_msg,
        ) {
            log::debug!("Incoming stun success failed the integrity check, discarding");
            return;
        }

        // Response to the liveness probe of the nominated pair?
        if let Some(probe) = &self.probe {
            if probe.transaction_id == stun_msg.transaction_id() {
                log::debug!("liveness probe confirmed the nominated pair");
                self.probe = None;
                return;
            }
        }

        let Some(pair) = self
            .pairs
            .iter_mut()
            .find(|p| {
                matches!(p.check, CheckState::InProgress { transaction_id, .. } if stun_msg.transaction_id() == transaction_id)
            }) else {
                log::debug!("Failed to find transaction for STUN success, discarding");
                return;
            };

        let CheckState::InProgress {
            source,
            target,
            use_candidate,
            ..
        } = &pair.check
        else {
            unreachable!()
        };
        let use_candidate = *use_candidate;

        // The source and destination transport addresses in the request and
        // response must be symmetric
        if pkt.source != *target && pkt.destination.ip() != *source {
            log::debug!(
                "got success response with invalid source address for pair {}",
                DisplayPair(
                    &self.local_candidates[pair.local],
                    &self.remote_candidates[pair.remote]
                )
            );

            pair.failed = true;
            pair.check = CheckState::Idle;

            if self.pending_nomination == Some((pair.local, pair.remote)) {
                self.pending_nomination = None;
            }

            return;
        }

        log::debug!(
            "got success response for pair {} use_candidate={use_candidate}",
            DisplayPair(
                &self.local_candidates[pair.local],
                &self.remote_candidates[pair.remote],
            ),
        );

        pair.received_response = true;
        pair.failed = false;
        pair.check = CheckState::Idle;

        // Server mode: there is no peer that would run its own checks
        // against us, a successful response is all the confirmation this
        // path will ever get
        if self.remote_credentials.pwd.is_empty() {
            pair.received_request = true;
        }

        let ids = (pair.local, pair.remote);

        if use_candidate && self.pending_nomination == Some(ids) {
            self.pending_nomination = None;
            self.set_nominated(ids, &mut on_event);
        } else if self.remote_credentials.pwd.is_empty() && self.nominated.is_none() {
            self.set_nominated(ids, &mut on_event);
        }

        // Check if we discovered a new local peer-reflexive candidate
        let mapped_addr = stun_msg
            .attribute::<stun_types::attributes::XorMappedAddress>()
            .and_then(|r| r.ok());

        if let Some(mapped_addr) = mapped_addr {
            let (local, _) = ids;
            if mapped_addr.0 != self.local_candidates[local].addr {
                let base = self.local_candidates[local].via_addr();
                let local_preference = self.local_candidates[local].local_preference;
                self.add_local_candidate(Candidate::new(
                    CandidateKind::PeerReflexive,
                    mapped_addr.0,
                    Some(base),
                    local_preference,
                ));
            }
        }
    }

    fn receive_stun_error(
        &mut self,
        mut on_event: impl FnMut(IceSessionEvent),
        mut stun_msg: Message,
    ) {
        if !stun::verify_integrity(
            &self.local_credentials,
            &self.remote_credentials,
            &mut stun_msg,
        ) {
            log::debug!("Incoming stun error response failed the integrity check, discarding");
            return;
        }

        let Some(pair) = self
            .pairs
            .iter_mut()
            .find(|p| {
                matches!(p.check, CheckState::InProgress { transaction_id, .. } if stun_msg.transaction_id() == transaction_id)
            }) else {
                log::debug!("Failed to find transaction for STUN error, discarding");
                return;
            };

        let ids = (pair.local, pair.remote);

        let Some(Ok(error_code)) = stun_msg.attribute::<ErrorCode>() else {
            pair.failed = true;
            pair.check = CheckState::Idle;
            if self.pending_nomination == Some(ids) {
                self.pending_nomination = None;
            }
            return;
        };

        log::debug!(
            "Candidate pair failed with code={}, reason={}",
            error_code.number,
            error_code.reason
        );

        if error_code.number == 487 {
            // We lost the role conflict: switch roles, reset every pair's
            // progress and start over with recomputed priorities
            if stun_msg.attribute::<IceControlled>().is_some() {
                self.role = IceRole::Controlling;
            } else if stun_msg.attribute::<IceControlling>().is_some() {
                self.role = IceRole::Controlled;
            }

            log::debug!("role conflict lost, continuing as {:?}", self.role);

            self.pending_nomination = None;

            for pair in &mut self.pairs {
                pair.progress_reset();
            }

            self.recompute_pair_priorities();
        } else {
            pair.failed = true;
            pair.check = CheckState::Idle;
            if self.pending_nomination == Some(ids) {
                self.pending_nomination = None;
            }
        }
    }

    fn receive_stun_request(
        &mut self,
        now: Instant,
        mut on_event: impl FnMut(IceSessionEvent),
        pkt: &ReceivedPkt,
        mut stun_msg: Message,
    ) {
        if !stun::verify_integrity(
            &self.local_credentials,
            &self.remote_credentials,
            &mut stun_msg,
        ) {
            log::debug!("Incoming stun request failed the integrity check, sending 401");

            let response = stun::make_error_response(
                stun_msg.transaction_id(),
                &self.local_credentials,
                401,
                "Unauthorized",
                None,
            );

            on_event(IceSessionEvent::SendData {
                data: response,
                source: Some(pkt.destination.ip()),
                target: pkt.source,
            });

            return;
        }

        let use_candidate = stun_msg.attribute::<UseCandidate>().is_some();

        // Detect and handle role conflicts. The side with the lower
        // conflict resolver value yields its role.
        let conflicting_resolver = match self.role {
            IceRole::Controlling => stun_msg
                .attribute::<IceControlling>()
                .and_then(|r| r.ok())
                .map(|a| a.0),
            IceRole::Controlled => stun_msg
                .attribute::<IceControlled>()
                .and_then(|r| r.ok())
                .map(|a| a.0),
        };

        if let Some(peer_resolver) = conflicting_resolver {
            if self.conflict_resolver >= peer_resolver {
                let response = stun::make_error_response(
                    stun_msg.transaction_id(),
                    &self.local_credentials,
                    487,
                    "Role Conflict",
                    Some((
                        self.role == IceRole::Controlling,
                        self.conflict_resolver,
                    )),
                );

                on_event(IceSessionEvent::SendData {
                    data: response,
                    source: Some(pkt.destination.ip()),
                    target: pkt.source,
                });

                return;
            } else {
                self.role = match self.role {
                    IceRole::Controlling => IceRole::Controlled,
                    IceRole::Controlled => IceRole::Controlling,
                };

                log::debug!("role conflict yielded, continuing as {:?}", self.role);

                self.pending_nomination = None;

                for pair in &mut self.pairs {
                    pair.progress_reset();
                }

                self.recompute_pair_priorities();
            }
        }

        // Peer-reflexive candidates never answer checks themselves and a
        // server-reflexive candidate cannot be a send source
        let local_id = match self.local_candidates.iter().find(|(_, c)| {
            matches!(c.kind, CandidateKind::Local | CandidateKind::Relayed)
                && c.via_addr() == pkt.destination
        }) {
            Some((id, _)) => id,
            None => {
                log::warn!(
                    "Failed to find matching local candidate for incoming STUN request ({})",
                    pkt.destination
                );
                return;
            }
        };

        let matching_remote_candidate = self
            .remote_candidates
            .iter()
            .find(|(_, c)| c.addr == pkt.source);

        let remote_id = match matching_remote_candidate {
            Some((remote, _)) => remote,
            None => {
                // No remote candidate with the source address, create a new
                // peer-reflexive candidate
                log::debug!("discovered remote peer-reflexive candidate {}", pkt.source);

                self.remote_candidates.insert(Candidate::new(
                    CandidateKind::PeerReflexive,
                    pkt.source,
                    None,
                    0,
                ))
            }
        };

        let pair_exists = self
            .pairs
            .iter()
            .any(|p| p.local == local_id && p.remote == remote_id);

        if !pair_exists {
            let priority = pair_priority(
                &self.local_candidates[local_id],
                &self.remote_candidates[remote_id],
                self.role,
            );

            self.pairs.push(CandidatePair {
                local: local_id,
                remote: remote_id,
                priority,
                received_request: false,
                received_response: false,
                failed: false,
                checked: false,
                check: CheckState::Idle,
            });

            self.sort_and_prune_pairs();
        }

        // The pair may have lost pruning against an established path, the
        // check is answered either way
        let known_pair = if let Some(pair) = self
            .pairs
            .iter_mut()
            .find(|p| p.local == local_id && p.remote == remote_id)
        {
            pair.received_request = true;
            pair.failed = false;

            log::trace!(
                "got connectivity check for pair {}",
                DisplayPair(
                    &self.local_candidates[pair.local],
                    &self.remote_candidates[pair.remote],
                )
            );

            true
        } else {
            false
        };

        let stun_response = stun::make_success_response(
            stun_msg.transaction_id(),
            &self.local_credentials,
            pkt.source,
        );

        on_event(IceSessionEvent::SendData {
            data: stun_response,
            source: Some(self.local_candidates[local_id].via_addr().ip()),
            target: pkt.source,
        });

        self.last_sent = Some(now);

        // The controlled side nominates when told so
        if known_pair && use_candidate && self.role == IceRole::Controlled {
            let ids = (local_id, remote_id);
            if self.nominated != Some(ids) {
                self.set_nominated(ids, &mut on_event);
            }
        }
    }

    fn set_nominated(
        &mut self,
        ids: (LocalCandidateId, RemoteCandidateId),
        mut on_event: impl FnMut(IceSessionEvent),
    ) {
        let was_writable = self.nominated.is_some();

        self.nominated = Some(ids);
        self.previously_nominated = None;
        self.probe = None;

        log::debug!(
            "nominated pair {}",
            DisplayPair(
                &self.local_candidates[ids.0],
                &self.remote_candidates[ids.1]
            )
        );

        on_event(IceSessionEvent::NominationChanged {
            nominated: self.nominated(),
        });

        if !was_writable {
            on_event(IceSessionEvent::Writable);
        }
    }

    fn drop_nomination(&mut self) {
        if let Some((local, remote)) = self.nominated.take() {
            self.previously_nominated = Some((
                self.local_candidates[local].clone(),
                self.remote_candidates[remote].clone(),
            ));
        }
        self.probe = None;
    }

    /// The nominated path went silent: remember it, reset every non-failed
    /// pair and start searching again
    fn lose_nomination(&mut self, mut on_event: impl FnMut(IceSessionEvent)) {
        log::debug!("nomination lost, restarting connectivity checks");

        self.drop_nomination();
        self.pending_nomination = None;

        for pair in &mut self.pairs {
            if !pair.failed {
                pair.progress_reset();
            }
        }

        on_event(IceSessionEvent::NominationChanged { nominated: None });
    }

    /// Drive the session forward. This must be called after the duration
    /// returned by [`timeout`](IceSession::timeout).
    pub fn poll(&mut self, now: Instant, mut on_event: impl FnMut(IceSessionEvent)) {
        if self.state == IceSessionState::Shutdown {
            return;
        }

        let last_activity = *self.last_activity.get_or_insert(now);

        if let Some(timeout) = self.keepalive.backgrounding_timeout {
            if now.duration_since(last_activity) >= timeout {
                self.fail(IceSessionError::BackgroundingTimeout, &mut on_event);
                return;
            }
        }

        self.poll_check_retransmits(now, &mut on_event);
        self.poll_probe(now, &mut on_event);
        self.poll_keepalive(now, &mut on_event);
        self.poll_activation(now, &mut on_event);
        self.poll_nomination(now, &mut on_event);
        self.poll_state(&mut on_event);
    }

    fn poll_check_retransmits(&mut self, now: Instant, mut on_event: impl FnMut(IceSessionEvent)) {
        let mut cancelled_nomination = false;
        let mut sent_any = false;

        for pair in &mut self.pairs {
            let CheckState::InProgress {
                stun_request,
                retransmit_at,
                retransmits,
                source,
                target,
                ..
            } = &mut pair.check
            else {
                continue;
            };

            if *retransmit_at > now {
                continue;
            }

            if *retransmits >= self.stun_config.max_retransmits {
                pair.failed = true;
                pair.check = CheckState::Idle;

                if self.pending_nomination == Some((pair.local, pair.remote)) {
                    cancelled_nomination = true;
                }

                continue;
            }

            *retransmits += 1;
            *retransmit_at += self.stun_config.retransmit_delta(*retransmits);
            sent_any = true;

            on_event(IceSessionEvent::SendData {
                data: stun_request.clone(),
                source: Some(*source),
                target: *target,
            });
        }

        if cancelled_nomination {
            self.pending_nomination = None;
        }

        if sent_any {
            self.last_sent = Some(now);
        }
    }

    fn poll_probe(&mut self, now: Instant, mut on_event: impl FnMut(IceSessionEvent)) {
        let Some(probe) = &mut self.probe else {
            return;
        };

        if now >= probe.deadline {
            self.lose_nomination(&mut on_event);
            return;
        }

        if probe.retransmit_at > now {
            return;
        }

        probe.retransmits += 1;
        probe.retransmit_at = min(
            probe.retransmit_at + self.stun_config.retransmit_delta(probe.retransmits),
            probe.deadline,
        );

        on_event(IceSessionEvent::SendData {
            data: probe.stun_request.clone(),
            source: Some(probe.source),
            target: probe.target,
        });

        self.last_sent = Some(now);
    }

    fn poll_keepalive(&mut self, now: Instant, mut on_event: impl FnMut(IceSessionEvent)) {
        let Some((local, remote)) = self.nominated else {
            return;
        };

        let source = self.local_candidates[local].via_addr().ip();
        let target = self.remote_candidates[remote].addr;

        // Keep the path alive while the application is quiet
        if let Some(send_keepalive) = self.keepalive.send_keepalive {
            let last_sent = *self.last_sent_data.get_or_insert(now);

            if now.duration_since(last_sent) >= send_keepalive {
                log::trace!("sending keepalive binding indication");

                self.last_sent = Some(now);
                self.last_sent_data = Some(now);

                on_event(IceSessionEvent::SendData {
                    data: stun::make_binding_indication(),
                    source: Some(source),
                    target,
                });
            }
        }

        // Probe the path when the peer went quiet
        if let Some(expect_data_within) = self.keepalive.expect_data_within {
            let last_received = *self.last_received.get_or_insert(now);

            if now.duration_since(last_received) >= expect_data_within && self.probe.is_none() {
                log::debug!("nothing received within expectation window, probing nominated pair");

                let transaction_id = TransactionId::random();
                let stun_request = stun::make_binding_request(BindingRequestParams {
                    transaction_id,
                    local_credentials: &self.local_credentials,
                    remote_credentials: &self.remote_credentials,
                    priority: self.local_candidates[local].priority as u32,
                    is_controlling: self.role == IceRole::Controlling,
                    conflict_resolver: self.conflict_resolver,
                    use_candidate: false,
                });

                self.probe = Some(ExpectationProbe {
                    transaction_id,
                    stun_request: stun_request.clone(),
                    retransmit_at: now + self.stun_config.retransmit_delta(0),
                    retransmits: 0,
                    source,
                    target,
                    deadline: now + self.keepalive.keepalive_stun_timeout,
                });

                self.last_sent = Some(now);

                on_event(IceSessionEvent::SendData {
                    data: stun_request,
                    source: Some(source),
                    target,
                });
            }
        }
    }

    fn poll_activation(&mut self, now: Instant, mut on_event: impl FnMut(IceSessionEvent)) {
        if self.remote_candidates.is_empty() {
            return;
        }

        // One new check per activation interval
        if let Some(it) = self.last_activation {
            if it + ACTIVATE_INTERVAL > now {
                return;
            }
        }

        let Some(index) = (0..self.pairs.len()).find(|&i| {
            let pair = &self.pairs[i];
            !pair.failed
                && !pair.checked
                && matches!(pair.check, CheckState::Idle)
                && !self.pair_is_frozen(i)
        }) else {
            return;
        };

        self.last_activation = Some(now);
        self.launch_check(index, now, false, &mut on_event);
    }

    fn launch_check(
        &mut self,
        index: usize,
        now: Instant,
        use_candidate: bool,
        mut on_event: impl FnMut(IceSessionEvent),
    ) {
        let pair = &self.pairs[index];

        log::debug!(
            "start connectivity check for pair {} use_candidate={use_candidate}",
            DisplayPair(
                &self.local_candidates[pair.local],
                &self.remote_candidates[pair.remote]
            )
        );

        let transaction_id = TransactionId::random();

        let stun_request = stun::make_binding_request(BindingRequestParams {
            transaction_id,
            local_credentials: &self.local_credentials,
            remote_credentials: &self.remote_credentials,
            priority: self.local_candidates[pair.local].priority as u32,
            is_controlling: self.role == IceRole::Controlling,
            conflict_resolver: self.conflict_resolver,
            use_candidate,
        });

        let source = self.local_candidates[pair.local].via_addr().ip();
        let target = self.remote_candidates[pair.remote].addr;

        let pair = &mut self.pairs[index];
        pair.checked = true;
        pair.check = CheckState::InProgress {
            transaction_id,
            stun_request: stun_request.clone(),
            retransmit_at: now + self.stun_config.retransmit_delta(0),
            retransmits: 0,
            source,
            target,
            use_candidate,
        };

        self.last_sent = Some(now);

        on_event(IceSessionEvent::SendData {
            data: stun_request,
            source: Some(source),
            target,
        });
    }

    fn poll_nomination(&mut self, now: Instant, mut on_event: impl FnMut(IceSessionEvent)) {
        if self.role != IceRole::Controlling
            || self.nominated.is_some()
            || self.pending_nomination.is_some()
            // server mode nominates on the first successful response
            || self.remote_credentials.pwd.is_empty()
        {
            return;
        }

        // Pairs are sorted by descending priority, pick the best working one
        let Some(index) = (0..self.pairs.len()).find(|&i| {
            let pair = &self.pairs[i];
            pair.received_request && pair.received_response && !pair.failed
        }) else {
            return;
        };

        let pair = &self.pairs[index];
        self.pending_nomination = Some((pair.local, pair.remote));

        self.launch_check(index, now, true, &mut on_event);
    }

    fn poll_state(&mut self, mut on_event: impl FnMut(IceSessionEvent)) {
        if self.state == IceSessionState::Shutdown {
            return;
        }

        let new_state = if let Some((_, _)) = self.nominated {
            let nominated_priority = self
                .nominated
                .and_then(|(l, r)| {
                    self.pairs
                        .iter()
                        .find(|p| p.local == l && p.remote == r)
                        .map(|p| p.priority)
                })
                .unwrap_or(u64::MAX);

            // A higher priority pair which is not failed and has not
            // concluded its check yet may still take over
            let contender = self.pairs.iter().any(|p| {
                p.priority > nominated_priority
                    && !p.failed
                    && !(p.received_request && p.received_response)
            });

            if contender {
                IceSessionState::Nominated
            } else {
                IceSessionState::Completed
            }
        } else if self.pending_nomination.is_some() {
            IceSessionState::Nominating
        } else if !self.pairs.is_empty() {
            if self.pairs.iter().all(|p| p.failed) {
                if self.end_of_remote_candidates {
                    self.fail(IceSessionError::CandidateSearchFailed, &mut on_event);
                    return;
                }

                IceSessionState::Halted
            } else {
                IceSessionState::Searching
            }
        } else if !self.local_candidates.is_empty() {
            IceSessionState::Prepared
        } else {
            IceSessionState::Pending
        };

        self.set_state(new_state, &mut on_event);
    }

    fn set_state(&mut self, new: IceSessionState, mut on_event: impl FnMut(IceSessionEvent)) {
        if self.state != new {
            log::debug!("state {:?} -> {:?}", self.state, new);

            on_event(IceSessionEvent::StateChanged {
                old: self.state,
                new,
            });
            self.state = new;
        }
    }

    /// Returns a duration after which to call [`poll`](IceSession::poll)
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        if self.state == IceSessionState::Shutdown {
            return None;
        }

        let mut timeout: Option<Duration> = None;

        // Next activation tick, only relevant while there are pairs to check
        let has_activatable = !self.remote_candidates.is_empty()
            && (0..self.pairs.len()).any(|i| {
                let pair = &self.pairs[i];
                !pair.failed && !pair.checked && matches!(pair.check, CheckState::Idle)
            });

        if has_activatable {
            let at = self
                .last_activation
                .map(|it| it + ACTIVATE_INTERVAL)
                .unwrap_or(now);
            timeout = opt_min(timeout, Some(at.saturating_duration_since(now)));
        }

        // In-flight check retransmits
        for pair in &self.pairs {
            if let CheckState::InProgress { retransmit_at, .. } = &pair.check {
                timeout = opt_min(
                    timeout,
                    Some(retransmit_at.saturating_duration_since(now)),
                );
            }
        }

        if let Some(probe) = &self.probe {
            let at = min(probe.retransmit_at, probe.deadline);
            timeout = opt_min(timeout, Some(at.saturating_duration_since(now)));
        }

        if self.nominated.is_some() {
            if let (Some(send_keepalive), Some(last)) =
                (self.keepalive.send_keepalive, self.last_sent_data)
            {
                timeout = opt_min(
                    timeout,
                    Some((last + send_keepalive).saturating_duration_since(now)),
                );
            }

            if let (Some(expect), Some(last)) =
                (self.keepalive.expect_data_within, self.last_received)
            {
                if self.probe.is_none() {
                    timeout = opt_min(
                        timeout,
                        Some((last + expect).saturating_duration_since(now)),
                    );
                }
            }
        }

        if let (Some(backgrounding), Some(last)) =
            (self.keepalive.backgrounding_timeout, self.last_activity)
        {
            timeout = opt_min(
                timeout,
                Some((last + backgrounding).saturating_duration_since(now)),
            );
        }

        timeout
    }
}

fn pair_priority(local_candidate: &Candidate, remote_candidate: &Candidate, role: IceRole) -> u64 {
    let (g, d) = match role {
        IceRole::Controlling => (local_candidate.priority, remote_candidate.priority),
        IceRole::Controlled => (remote_candidate.priority, local_candidate.priority),
    };

    // pair priority = 2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0)
    2u64.pow(32) * min(g, d) + 2 * max(g, d) + if g > d { 1 } else { 0 }
}

fn compute_foundation(kind: CandidateKind, base: IpAddr, proto: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    (kind, base, proto).hash(&mut hasher);
    hasher.finish()
}

struct DisplayPair<'a>(&'a Candidate, &'a Candidate);

impl fmt::Display for DisplayPair<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn fmt_candidate(f: &mut fmt::Formatter<'_>, c: &Candidate) -> fmt::Result {
            match c.kind {
                CandidateKind::Local => write!(f, "local({})", c.addr),
                CandidateKind::PeerReflexive => {
                    write!(f, "peer-reflexive(via:{}, peer:{})", c.via_addr(), c.addr)
                }
                CandidateKind::ServerReflexive => {
                    write!(f, "server-reflexive(via:{}, server:{})", c.via_addr(), c.addr)
                }
                CandidateKind::Relayed => {
                    write!(f, "relayed(via:{}, relay:{})", c.via_addr(), c.addr)
                }
            }
        }

        fmt_candidate(f, self.0)?;
        write!(f, " <-> ")?;
        fmt_candidate(f, self.1)
    }
}

fn opt_min<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (None, None) => None,
        (None, Some(b)) => Some(b),
        (Some(a), None) => Some(a),
        (Some(a), Some(b)) => Some(min(a, b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn session(role: IceRole) -> IceSession {
        IceSession::new(IceSessionConfig {
            role,
            local_credentials: IceCredentials::random(),
            remote_credentials: IceCredentials::random(),
            ..Default::default()
        })
    }

    #[test]
    fn candidate_priority_formula() {
        let c = Candidate::local(addr("192.168.178.2:4000"), 7);
        assert_eq!(c.priority, (126 << 24) + (7 << 8) + 256);
    }

    #[test]
    fn pair_priority_role_symmetry() {
        let local = Candidate::local(addr("10.0.0.1:1000"), 1);
        let remote = Candidate::local(addr("10.0.0.2:1000"), 2);

        // both sides must agree on the pair priority regardless of which
        // candidate they consider local
        let controlling = pair_priority(&local, &remote, IceRole::Controlling);
        let controlled = pair_priority(&remote, &local, IceRole::Controlled);
        assert_eq!(controlling, controlled);
    }

    #[test]
    fn pairs_sorted_by_descending_priority() {
        let mut session = session(IceRole::Controlling);

        session.add_local_candidate(Candidate::local(addr("10.0.0.1:1000"), 0));
        session.update_remote_candidates(&[
            Candidate::new(CandidateKind::Relayed, addr("9.9.9.9:1000"), Some(addr("10.0.0.9:1000")), 0),
            Candidate::local(addr("10.0.0.2:1000"), 0),
        ]);

        assert_eq!(session.pairs.len(), 2);
        assert!(session.pairs[0].priority >= session.pairs[1].priority);

        let best_remote = &session.remote_candidates[session.pairs[0].remote];
        assert_eq!(best_remote.kind, CandidateKind::Local);
    }

    #[test]
    fn update_remote_candidates_is_idempotent() {
        let mut session = session(IceRole::Controlling);

        session.add_local_candidate(Candidate::local(addr("10.0.0.1:1000"), 0));

        let remotes = vec![
            Candidate::local(addr("10.0.0.2:1000"), 0),
            Candidate::local(addr("10.0.0.3:1000"), 1),
        ];

        session.update_remote_candidates(&remotes);
        let pairs: Vec<_> = session.pairs.iter().map(|p| (p.local, p.remote)).collect();

        session.update_remote_candidates(&remotes);
        let pairs_after: Vec<_> = session.pairs.iter().map(|p| (p.local, p.remote)).collect();

        assert_eq!(pairs, pairs_after);
    }

    #[test]
    fn server_reflexive_local_candidates_form_no_pairs() {
        let mut session = session(IceRole::Controlling);

        session.add_local_candidate(Candidate::server_reflexive(
            addr("1.2.3.4:1000"),
            addr("10.0.0.1:1000"),
            0,
        ));
        session.update_remote_candidates(&[Candidate::local(addr("10.0.0.2:1000"), 0)]);

        assert!(session.pairs.is_empty());
    }

    #[test]
    fn duplicate_paths_within_kind_are_pruned() {
        let mut session = session(IceRole::Controlling);

        session.add_local_candidate(Candidate::local(addr("10.0.0.1:1000"), 0));
        // Same remote ip on two ports, same local via address: one path
        session.update_remote_candidates(&[
            Candidate::local(addr("10.0.0.2:1000"), 1),
            Candidate::local(addr("10.0.0.2:2000"), 0),
        ]);

        assert_eq!(session.pairs.len(), 1);
    }

    #[test]
    fn foundation_freezing_blocks_successors() {
        let mut session = session(IceRole::Controlling);

        session.add_local_candidate(Candidate::local(addr("10.0.0.1:1000"), 1));
        session.add_local_candidate(Candidate::local(addr("10.0.0.1:2000"), 0));
        session.update_remote_candidates(&[Candidate::local(addr("10.0.0.2:1000"), 0)]);

        // Different remote ips never freeze each other
        assert!(!session.pair_is_frozen(0));

        // Manually append a second pair sharing foundation & remote address,
        // the way discovery may create one after pruning already ran
        let (second_local, _) = session
            .local_candidates
            .iter()
            .find(|(_, c)| c.addr.port() == 2000)
            .unwrap();
        let remote = session.pairs[0].remote;

        session.pairs.push(CandidatePair {
            local: second_local,
            remote,
            priority: 0,
            received_request: false,
            received_response: false,
            failed: false,
            checked: false,
            check: CheckState::Idle,
        });

        assert!(session.pair_is_frozen(1));

        session.pairs[0].received_request = true;
        session.pairs[0].received_response = true;
        assert!(!session.pair_is_frozen(1));

        // A failed predecessor no longer freezes its successors
        session.pairs[0].received_response = false;
        assert!(session.pair_is_frozen(1));
        session.pairs[0].failed = true;
        assert!(!session.pair_is_frozen(1));
    }

    #[test]
    fn all_failed_is_halted_until_end_of_candidates() {
        let mut session = session(IceRole::Controlling);

        session.add_local_candidate(Candidate::local(addr("10.0.0.1:1000"), 0));
        session.update_remote_candidates(&[Candidate::local(addr("10.0.0.2:1000"), 0)]);

        for pair in &mut session.pairs {
            pair.failed = true;
        }

        let mut events = Vec::new();
        session.poll_state(|e| events.push(e));
        assert_eq!(session.state(), IceSessionState::Halted);

        session.end_of_remote_candidates();
        session.poll_state(|e| events.push(e));
        assert_eq!(session.state(), IceSessionState::Shutdown);
        assert_eq!(session.error, Some(IceSessionError::CandidateSearchFailed));
    }

    #[test]
    fn send_packet_requires_nomination() {
        let mut session = session(IceRole::Controlling);

        let result = session.send_packet(Instant::now(), |_| {}, b"hello");
        assert_eq!(result, Err(IceSessionError::NotNominated));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let mut session = session(IceRole::Controlling);

        let mut closed = 0;
        session.end(|e| {
            if matches!(e, IceSessionEvent::Closed { .. }) {
                closed += 1;
            }
        });
        session.end(|e| {
            if matches!(e, IceSessionEvent::Closed { .. }) {
                closed += 1;
            }
        });

        assert_eq!(closed, 1);
        assert_eq!(session.state(), IceSessionState::Shutdown);
    }
}
