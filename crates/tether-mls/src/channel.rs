use crate::{
    crypto,
    keying::{
        canonical_keying, AgreementKey, Encoding, KeyEntry, KeyInputs, Keying, KeyingBundle,
        KeyingBundleDoc, Signature, SignatureKey, KEYING_TYPE_AGREEMENT, KEYING_TYPE_PASSPHRASE,
        KEYING_TYPE_PKI, MLS_ALGORITHM, MLS_SIGNATURE_ALGORITHM,
    },
    keys::{DhKeyPair, DhPublicKey, RsaKeyPair, RsaPublicKey, DH_KEY_DOMAIN},
    nonce_cache,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

/// Data frames prepend an HMAC-SHA1 of this many bytes
const INTEGRITY_LENGTH: usize = 20;

/// Rotated-out key agreement pairs are kept around so bundles keyed against
/// an older public key still decode during a rolling rekey
const MAX_PREVIOUS_LOCAL_KEYS: usize = 4;

/// State of the security channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MlsChannelState {
    Pending,
    /// Keying material required to continue is missing, see the `needs_*`
    /// observers
    WaitingForNeededInformation,
    /// Both directions are keyed, data flows
    Connected,
    Shutdown,
}

/// How one direction of the channel is keyed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyingType {
    Unknown,
    Passphrase,
    PublicKey,
    KeyAgreement,
}

/// Fatal errors of the channel, the numeric code mirrors the HTTP status
/// taxonomy of the signalling layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MlsError {
    #[error("bad request")]
    BadRequest,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("request timeout")]
    RequestTimeout,
    #[error("precondition failed")]
    PreconditionFailed,
    #[error("expectation failed")]
    ExpectationFailed,
    #[error("cert error")]
    CertError,
    #[error("shutdown")]
    Shutdown,
    #[error("crypto failure")]
    CryptoFailure,
}

impl MlsError {
    pub fn code(&self) -> u16 {
        match self {
            MlsError::BadRequest => 400,
            MlsError::Unauthorized => 401,
            MlsError::Forbidden => 403,
            MlsError::RequestTimeout => 408,
            MlsError::PreconditionFailed => 412,
            MlsError::ExpectationFailed => 417,
            MlsError::CertError => 495,
            MlsError::Shutdown => 410,
            MlsError::CryptoFailure => 500,
        }
    }
}

impl From<openssl::error::ErrorStack> for MlsError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        log::warn!("crypto failure: {err}");
        MlsError::CryptoFailure
    }
}

/// Events emitted by the [`MlsChannel`]
#[derive(Debug)]
pub enum MlsChannelEvent {
    StateChanged {
        old: MlsChannelState,
        new: MlsChannelState,
    },
    /// A wire frame for the encoded stream towards the peer
    SendEncoded(Vec<u8>),
    /// Decrypted & authenticated application data
    ReceiveDecoded(Vec<u8>),
    Closed {
        error: Option<MlsError>,
    },
}

/// Configuration for a new [`MlsChannel`]
#[derive(Debug, Clone)]
pub struct MlsChannelConfig {
    pub local_context_id: String,
    /// How often the sending keys are replaced
    pub rekey_interval: Duration,
    /// Lifetime of an emitted keying bundle
    pub keying_expires: Duration,
    /// Number of keys per bundle, data frames pick one at random
    pub total_send_keys: u32,
}

impl Default for MlsChannelConfig {
    fn default() -> Self {
        Self {
            local_context_id: String::new(),
            rekey_interval: Duration::from_secs(60 * 60),
            keying_expires: Duration::from_secs(2 * 60 * 60),
            total_send_keys: 3,
        }
    }
}

/// Keying material of one algorithm index, the IV chains from frame to frame
struct KeyInfo {
    send_key: Vec<u8>,
    next_iv: Vec<u8>,
    integrity_passphrase: String,
}

/// Which piece of externally supplied material the receive pipeline is
/// stalled on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NeededInformation {
    SigningPublicKey,
    ReceivePassphrase,
    ReceivePrivateKey,
    KeyAgreement,
}

enum KeyingOutcome {
    Complete,
    Waiting,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SendKeyingKind {
    Passphrase,
    Pki,
    Agreement,
}

/// Bidirectional message layer security channel
///
/// Encrypts, authenticates and keys an application byte stream. Wire frames
/// are ingested with [`receive_encoded`](Self::receive_encoded), plaintext
/// is submitted with [`write`](Self::write), and the opposite directions
/// leave through [`MlsChannelEvent`]s.
///
/// Because keying bundles carry absolute expiry times, the channel clock is
/// a unix timestamp in seconds rather than a monotonic instant.
pub struct MlsChannel {
    state: MlsChannelState,
    error: Option<MlsError>,

    local_context_id: String,
    remote_context_id: String,

    rekey_interval: Duration,
    keying_expires: Duration,
    total_send_keys: u32,

    receive_keying_type: KeyingType,
    send_keying_type: KeyingType,

    receive_passphrase: Option<String>,
    send_passphrase: Option<String>,

    receive_keypair: Option<RsaKeyPair>,
    send_remote_public_key: Option<RsaPublicKey>,
    receive_signing_public_key: Option<RsaPublicKey>,
    send_signing_keypair: Option<RsaKeyPair>,

    dh_local: Option<DhKeyPair>,
    dh_remote_public: Option<DhPublicKey>,
    dh_original_remote_public: Option<DhPublicKey>,
    dh_previous_local: VecDeque<(DhKeyPair, DhPublicKey)>,
    dh_remote_side_knows_local_public: bool,
    dh_sent_remote_side_local_public: bool,

    next_receive_sequence: u64,
    next_send_sequence: u64,

    receive_keys: HashMap<u32, KeyInfo>,
    send_keys: HashMap<u32, KeyInfo>,

    /// Wire frames waiting to be processed in order
    pending_receive: VecDeque<Vec<u8>>,
    /// Plaintext waiting for the send direction to be keyed
    pending_send: VecDeque<Vec<u8>>,

    /// A built keying element waiting for an external signature, with the
    /// keys it will install once emitted
    send_keying_needing_signature: Option<serde_json::Value>,
    staged_send_keys: Option<HashMap<u32, KeyInfo>>,

    waiting_for: Option<NeededInformation>,

    next_rekey_at: Option<u64>,
    change_key_pending: bool,

    rng: StdRng,
}

impl MlsChannel {
    pub fn new(config: MlsChannelConfig) -> Self {
        MlsChannel {
            state: MlsChannelState::Pending,
            error: None,
            local_context_id: config.local_context_id,
            remote_context_id: String::new(),
            rekey_interval: config.rekey_interval,
            keying_expires: config.keying_expires,
            total_send_keys: config.total_send_keys.max(1),
            receive_keying_type: KeyingType::Unknown,
            send_keying_type: KeyingType::Unknown,
            receive_passphrase: None,
            send_passphrase: None,
            receive_keypair: None,
            send_remote_public_key: None,
            receive_signing_public_key: None,
            send_signing_keypair: None,
            dh_local: None,
            dh_remote_public: None,
            dh_original_remote_public: None,
            dh_previous_local: VecDeque::new(),
            dh_remote_side_knows_local_public: false,
            dh_sent_remote_side_local_public: false,
            next_receive_sequence: 0,
            next_send_sequence: 0,
            receive_keys: HashMap::new(),
            send_keys: HashMap::new(),
            pending_receive: VecDeque::new(),
            pending_send: VecDeque::new(),
            send_keying_needing_signature: None,
            staged_send_keys: None,
            waiting_for: None,
            next_rekey_at: None,
            change_key_pending: false,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn state(&self) -> MlsChannelState {
        self.state
    }

    pub fn error(&self) -> Option<MlsError> {
        self.error
    }

    pub fn local_context_id(&self) -> &str {
        &self.local_context_id
    }

    /// Context id of the peer, learned from its keying bundles
    pub fn remote_context_id(&self) -> &str {
        &self.remote_context_id
    }

    pub fn receive_keying_type(&self) -> KeyingType {
        self.receive_keying_type
    }

    pub fn send_keying_type(&self) -> KeyingType {
        self.send_keying_type
    }

    /// The first key agreement public value ever accepted from the peer,
    /// usable for identity binding checks across rekeys
    pub fn original_remote_key_agreement(&self) -> Option<&DhPublicKey> {
        self.dh_original_remote_public.as_ref()
    }

    /// A rekey was triggered but the fresh bundle has not been emitted yet
    pub fn rekey_pending(&self) -> bool {
        self.change_key_pending
    }

    /// The receive pipeline is stalled on keying material for the parked
    /// bundle
    pub fn needs_receive_keying(&self) -> bool {
        matches!(
            self.waiting_for,
            Some(NeededInformation::ReceivePassphrase)
                | Some(NeededInformation::ReceivePrivateKey)
                | Some(NeededInformation::KeyAgreement)
        )
    }

    pub fn needs_receive_keying_signing_public_key(&self) -> bool {
        self.waiting_for == Some(NeededInformation::SigningPublicKey)
    }

    /// No material to key the send direction has been supplied yet
    pub fn needs_send_keying(&self) -> bool {
        self.send_keys.is_empty()
            && self.staged_send_keys.is_none()
            && self.send_keying_kind().is_none()
    }

    pub fn needs_send_keying_to_be_signed(&self) -> bool {
        self.send_keying_needing_signature.is_some() && self.send_signing_keypair.is_none()
    }

    /// The keying element awaiting an external signature
    pub fn send_keying_needing_signature(&self) -> Option<&serde_json::Value> {
        self.send_keying_needing_signature.as_ref()
    }

    pub fn set_local_context_id(&mut self, context_id: String) {
        self.local_context_id = context_id;
    }

    pub fn set_receive_passphrase(
        &mut self,
        now: u64,
        on_event: impl FnMut(MlsChannelEvent),
        passphrase: String,
    ) {
        self.receive_passphrase = Some(passphrase);
        self.step(now, on_event);
    }

    pub fn set_send_passphrase(
        &mut self,
        now: u64,
        on_event: impl FnMut(MlsChannelEvent),
        passphrase: String,
    ) {
        self.send_passphrase = Some(passphrase);
        self.step(now, on_event);
    }

    /// Local RSA key pair used to decrypt keying material addressed to us
    pub fn set_receive_key_pair(
        &mut self,
        now: u64,
        on_event: impl FnMut(MlsChannelEvent),
        keypair: RsaKeyPair,
    ) {
        self.receive_keypair = Some(keypair);
        self.step(now, on_event);
    }

    /// The peer's RSA public key used to encrypt our keying material
    pub fn set_send_remote_public_key(
        &mut self,
        now: u64,
        on_event: impl FnMut(MlsChannelEvent),
        public_key: RsaPublicKey,
    ) {
        self.send_remote_public_key = Some(public_key);
        self.step(now, on_event);
    }

    /// The peer's public key used to validate keying bundle signatures
    pub fn set_receive_signing_public_key(
        &mut self,
        now: u64,
        on_event: impl FnMut(MlsChannelEvent),
        public_key: RsaPublicKey,
    ) {
        self.receive_signing_public_key = Some(public_key);
        self.step(now, on_event);
    }

    /// Local signing key pair, outgoing keying bundles are signed without
    /// the external signing handshake
    pub fn set_send_signing_key_pair(
        &mut self,
        now: u64,
        on_event: impl FnMut(MlsChannelEvent),
        keypair: RsaKeyPair,
    ) {
        self.send_signing_keypair = Some(keypair);
        self.step(now, on_event);
    }

    /// The external signer finished, supplying the key pair that signs the
    /// parked keying element
    pub fn notify_send_keying_signed(
        &mut self,
        now: u64,
        on_event: impl FnMut(MlsChannelEvent),
        keypair: RsaKeyPair,
    ) {
        self.send_signing_keypair = Some(keypair);
        self.step(now, on_event);
    }

    /// Local half of the key agreement. `remote_side_knows_local_public`
    /// suppresses carrying our public value inside keying bundles.
    pub fn set_local_key_agreement(
        &mut self,
        now: u64,
        on_event: impl FnMut(MlsChannelEvent),
        keypair: DhKeyPair,
        remote_side_knows_local_public: bool,
    ) {
        self.dh_local = Some(keypair);
        self.dh_remote_side_knows_local_public = remote_side_knows_local_public;
        self.dh_sent_remote_side_local_public = false;
        self.step(now, on_event);
    }

    /// The peer's key agreement public value, when it is learned through
    /// signalling instead of a keying bundle
    pub fn set_remote_key_agreement(
        &mut self,
        now: u64,
        on_event: impl FnMut(MlsChannelEvent),
        public_key: DhPublicKey,
    ) {
        if self.dh_original_remote_public.is_none() {
            self.dh_original_remote_public = Some(public_key.clone());
        }
        self.dh_remote_public = Some(public_key);
        self.step(now, on_event);
    }

    /// Submit plaintext for encryption & delivery
    pub fn write(
        &mut self,
        now: u64,
        on_event: impl FnMut(MlsChannelEvent),
        plaintext: &[u8],
    ) -> Result<(), MlsError> {
        if self.state == MlsChannelState::Shutdown {
            return Err(MlsError::Shutdown);
        }

        if !plaintext.is_empty() {
            self.pending_send.push_back(plaintext.to_vec());
        }

        self.step(now, on_event);
        Ok(())
    }

    /// Ingest one frame from the encoded wire stream
    pub fn receive_encoded(
        &mut self,
        now: u64,
        on_event: impl FnMut(MlsChannelEvent),
        frame: &[u8],
    ) -> Result<(), MlsError> {
        if self.state == MlsChannelState::Shutdown {
            return Err(MlsError::Shutdown);
        }

        self.pending_receive.push_back(frame.to_vec());
        self.step(now, on_event);

        match self.error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Drive the rekey timer. Must be called after the duration returned by
    /// [`timeout`](Self::timeout).
    pub fn poll(&mut self, now: u64, on_event: impl FnMut(MlsChannelEvent)) {
        if self.state == MlsChannelState::Shutdown {
            return;
        }

        if let Some(at) = self.next_rekey_at {
            if now >= at {
                self.next_rekey_at = Some(now + self.rekey_interval.as_secs());
                self.begin_rekey();
            }
        }

        self.step(now, on_event);
    }

    /// Returns the duration until the next rekey, in whole seconds
    pub fn timeout(&self, now: u64) -> Option<Duration> {
        if self.state == MlsChannelState::Shutdown {
            return None;
        }

        self.next_rekey_at
            .map(|at| Duration::from_secs(at.saturating_sub(now)))
    }

    /// Shut the channel down. Idempotent.
    pub fn shutdown(&mut self, mut on_event: impl FnMut(MlsChannelEvent)) {
        if self.state == MlsChannelState::Shutdown {
            return;
        }

        self.pending_receive.clear();
        self.pending_send.clear();
        self.send_keys.clear();
        self.receive_keys.clear();
        self.send_keying_needing_signature = None;
        self.staged_send_keys = None;
        self.next_rekey_at = None;

        self.set_state(MlsChannelState::Shutdown, &mut on_event);
        on_event(MlsChannelEvent::Closed { error: None });
    }

    fn fatal(&mut self, error: MlsError, on_event: &mut impl FnMut(MlsChannelEvent)) {
        if self.state == MlsChannelState::Shutdown {
            return;
        }

        // first fatal error wins
        let error = *self.error.get_or_insert(error);
        log::warn!("shutting down: {error}");

        self.pending_receive.clear();
        self.pending_send.clear();
        self.send_keys.clear();
        self.receive_keys.clear();
        self.send_keying_needing_signature = None;
        self.staged_send_keys = None;
        self.next_rekey_at = None;

        self.set_state(MlsChannelState::Shutdown, on_event);
        on_event(MlsChannelEvent::Closed {
            error: Some(error),
        });
    }

    /// Clear the sending keys so the next step emits a fresh bundle; in
    /// agreement mode a new ephemeral key pair replaces the current one
    fn begin_rekey(&mut self) {
        log::debug!("rekey timer fired, clearing send keys");

        self.change_key_pending = true;
        self.send_keys.clear();
        self.staged_send_keys = None;
        self.send_keying_needing_signature = None;

        if self.send_keying_kind() == Some(SendKeyingKind::Agreement) {
            if let Some(pair) = self.dh_local.take() {
                let public = pair.public_key();
                self.dh_previous_local.push_front((pair, public));
                self.dh_previous_local.truncate(MAX_PREVIOUS_LOCAL_KEYS);
            }

            match DhKeyPair::generate() {
                Ok(pair) => {
                    self.dh_local = Some(pair);
                    self.dh_remote_side_knows_local_public = false;
                    self.dh_sent_remote_side_local_public = false;
                }
                Err(err) => {
                    log::warn!("failed to generate key agreement pair: {err}");
                }
            }
        }
    }

    /// Make as much progress as the available material allows
    fn step(&mut self, now: u64, mut on_event: impl FnMut(MlsChannelEvent)) {
        if self.state == MlsChannelState::Shutdown {
            return;
        }

        if let Err(error) = self.process_pending_receive(now, &mut on_event) {
            self.fatal(error, &mut on_event);
            return;
        }

        if let Err(error) = self.process_send(now, &mut on_event) {
            self.fatal(error, &mut on_event);
            return;
        }

        self.evaluate_state(&mut on_event);
    }

    fn evaluate_state(&mut self, on_event: &mut impl FnMut(MlsChannelEvent)) {
        let new = if !self.send_keys.is_empty() && !self.receive_keys.is_empty() {
            MlsChannelState::Connected
        } else if self.waiting_for.is_some() || self.needs_send_keying_to_be_signed() {
            MlsChannelState::WaitingForNeededInformation
        } else {
            MlsChannelState::Pending
        };

        self.set_state(new, on_event);
    }

    fn set_state(&mut self, new: MlsChannelState, on_event: &mut impl FnMut(MlsChannelEvent)) {
        if self.state != new {
            log::debug!("state {:?} -> {:?}", self.state, new);

            on_event(MlsChannelEvent::StateChanged {
                old: self.state,
                new,
            });
            self.state = new;
        }
    }

    //-------------------------------------------------------------------
    // receive pipeline

    fn process_pending_receive(
        &mut self,
        now: u64,
        on_event: &mut impl FnMut(MlsChannelEvent),
    ) -> Result<(), MlsError> {
        while let Some(frame) = self.pending_receive.front() {
            if frame.len() < 4 {
                return Err(MlsError::Unauthorized);
            }

            let index = u32::from_be_bytes(frame[..4].try_into().expect("length checked"));

            if index == 0 {
                let payload = frame[4..].to_vec();

                match self.process_receive_keying(now, &payload)? {
                    KeyingOutcome::Complete => {
                        self.pending_receive.pop_front();
                    }
                    KeyingOutcome::Waiting => {
                        // parked until a setter supplies the missing piece
                        return Ok(());
                    }
                }
            } else {
                if self.receive_keys.is_empty() {
                    log::warn!("received data frame before any keying material");
                    return Err(MlsError::Forbidden);
                }

                let frame = self.pending_receive.pop_front().expect("front exists");
                let plaintext = self.decode_data_frame(index, &frame[4..])?;
                on_event(MlsChannelEvent::ReceiveDecoded(plaintext));
            }
        }

        Ok(())
    }

    fn decode_data_frame(&mut self, index: u32, body: &[u8]) -> Result<Vec<u8>, MlsError> {
        let Some(key_info) = self.receive_keys.get_mut(&index) else {
            log::warn!("data frame uses unknown key index {index}");
            return Err(MlsError::Forbidden);
        };

        if body.len() < INTEGRITY_LENGTH {
            return Err(MlsError::Unauthorized);
        }

        let (received_integrity, ciphertext) = body.split_at(INTEGRITY_LENGTH);

        let plaintext = crypto::aes_cfb_decrypt(&key_info.send_key, &key_info.next_iv, ciphertext)
            .map_err(|_| MlsError::Unauthorized)?;

        let hex_iv = crypto::hex(&key_info.next_iv);
        let integrity_input = format!(
            "integrity:{}:{hex_iv}",
            crypto::hex(&crypto::sha1(&plaintext))
        );
        let calculated_integrity = crypto::hmac_sha1(
            key_info.integrity_passphrase.as_bytes(),
            integrity_input.as_bytes(),
        )?;

        if calculated_integrity != received_integrity {
            log::warn!("data frame integrity mismatch on key index {index}");
            return Err(MlsError::Unauthorized);
        }

        // ratchet the IV forward
        let next_iv_input = format!("{hex_iv}:{}", crypto::hex(&calculated_integrity));
        key_info.next_iv = crypto::sha1(next_iv_input.as_bytes());

        Ok(plaintext)
    }

    fn process_receive_keying(
        &mut self,
        now: u64,
        payload: &[u8],
    ) -> Result<KeyingOutcome, MlsError> {
        let Ok(doc) = serde_json::from_slice::<KeyingBundleDoc>(payload) else {
            log::warn!("keying bundle is not decodable");
            return Err(MlsError::Unauthorized);
        };

        let Some(signing_public_key) = &self.receive_signing_public_key else {
            self.waiting_for = Some(NeededInformation::SigningPublicKey);
            return Ok(KeyingOutcome::Waiting);
        };

        let bundle = &doc.keying_bundle;
        let canonical = canonical_keying(&bundle.keying);

        let Ok(signature) = BASE64_STANDARD.decode(&bundle.signature.digest_signed) else {
            return Err(MlsError::Unauthorized);
        };

        if !signing_public_key.verify(&canonical, &signature)? {
            log::warn!("keying bundle signature validation failed");
            return Err(MlsError::Unauthorized);
        }

        let Ok(keying) = serde_json::from_value::<Keying>(bundle.keying.clone()) else {
            return Err(MlsError::BadRequest);
        };

        if keying.sequence != self.next_receive_sequence {
            log::warn!(
                "keying sequence number mismatch, expected {} got {}",
                self.next_receive_sequence,
                keying.sequence
            );
            return Err(MlsError::RequestTimeout);
        }

        if keying.expires <= now {
            log::warn!("signed keying bundle has expired");
            return Err(MlsError::RequestTimeout);
        }

        if !keying.algorithms.iter().any(|a| a == MLS_ALGORITHM) {
            log::warn!("keying bundle is missing the required algorithm");
            return Err(MlsError::ExpectationFailed);
        }

        // gather the decoding material for the bundle's keying type
        let decoding_passphrase = match keying.encoding.kind.as_str() {
            KEYING_TYPE_PASSPHRASE => {
                let Some(passphrase) = self.receive_passphrase.clone() else {
                    self.waiting_for = Some(NeededInformation::ReceivePassphrase);
                    return Ok(KeyingOutcome::Waiting);
                };

                let proof_input = format!("keying:{}", keying.nonce);
                let calculated_proof = crypto::hex(&crypto::hmac_sha1(
                    passphrase.as_bytes(),
                    proof_input.as_bytes(),
                )?);

                if keying.encoding.proof.as_deref() != Some(calculated_proof.as_str()) {
                    log::warn!("keying encoding not using the expected passphrase");
                    return Err(MlsError::ExpectationFailed);
                }

                self.receive_keying_type = KeyingType::Passphrase;
                Some(passphrase)
            }
            KEYING_TYPE_PKI => {
                let Some(keypair) = &self.receive_keypair else {
                    self.waiting_for = Some(NeededInformation::ReceivePrivateKey);
                    return Ok(KeyingOutcome::Waiting);
                };

                let local_fingerprint = keypair.public_key().fingerprint();
                if keying.encoding.fingerprint.as_deref() != Some(local_fingerprint.as_str()) {
                    log::warn!("keying encoding not using the local public key");
                    return Err(MlsError::CertError);
                }

                self.receive_keying_type = KeyingType::PublicKey;
                None
            }
            KEYING_TYPE_AGREEMENT => {
                if self.dh_local.is_none() {
                    self.waiting_for = Some(NeededInformation::KeyAgreement);
                    return Ok(KeyingOutcome::Waiting);
                }

                if let Some(key) = &keying.encoding.key {
                    if key.domain != DH_KEY_DOMAIN {
                        log::warn!("keying domain namespace does not match");
                        return Err(MlsError::PreconditionFailed);
                    }

                    let Ok(remote) = BASE64_STANDARD.decode(&key.ephemeral) else {
                        return Err(MlsError::BadRequest);
                    };

                    let remote = DhPublicKey::from_bytes(&remote);
                    if self.dh_original_remote_public.is_none() {
                        self.dh_original_remote_public = Some(remote.clone());
                    }
                    self.dh_remote_public = Some(remote);
                } else if self.dh_remote_public.is_none() {
                    self.waiting_for = Some(NeededInformation::KeyAgreement);
                    return Ok(KeyingOutcome::Waiting);
                }

                // the fingerprint names which of our public values the peer
                // encrypted against, it may be a rotated-out one
                let Some(fingerprint) = keying.encoding.fingerprint.as_deref() else {
                    return Err(MlsError::CertError);
                };

                let remote_public = self.dh_remote_public.clone().expect("set above");
                let local = self.dh_local.as_ref().expect("checked above");

                let shared_secret = if local.public_key().fingerprint() == fingerprint {
                    local.compute_shared_secret(&remote_public)?
                } else if let Some((previous, _)) = self
                    .dh_previous_local
                    .iter()
                    .find(|(_, public)| public.fingerprint() == fingerprint)
                {
                    previous.compute_shared_secret(&remote_public)?
                } else {
                    log::warn!("keying encoding not using a known local agreement key");
                    return Err(MlsError::CertError);
                };

                self.receive_keying_type = KeyingType::KeyAgreement;
                Some(crypto::hex(&shared_secret))
            }
            other => {
                log::warn!("unknown keying type {other}");
                return Err(MlsError::ExpectationFailed);
            }
        };

        // replay protection, a nonce may only ever be accepted once
        if !nonce_cache::check_and_store(&keying.nonce, keying.expires, now) {
            log::warn!("keying bundle nonce was seen previously");
            return Err(MlsError::Forbidden);
        }

        let mut new_keys = HashMap::new();

        for entry in &keying.keys {
            if entry.algorithm != MLS_ALGORITHM {
                continue;
            }

            let (send_key, next_iv, integrity) = match &decoding_passphrase {
                Some(passphrase) => (
                    decode_with_passphrase(passphrase, &keying.nonce, &entry.inputs.secret)?,
                    decode_with_passphrase(passphrase, &keying.nonce, &entry.inputs.iv)?,
                    decode_with_passphrase(
                        passphrase,
                        &keying.nonce,
                        &entry.inputs.hmac_integrity_key,
                    )?,
                ),
                None => {
                    let keypair = self.receive_keypair.as_ref().expect("pki material checked");
                    (
                        decode_with_rsa(keypair, &entry.inputs.secret)?,
                        decode_with_rsa(keypair, &entry.inputs.iv)?,
                        decode_with_rsa(keypair, &entry.inputs.hmac_integrity_key)?,
                    )
                }
            };

            if send_key.is_empty() || next_iv.is_empty() || integrity.is_empty() {
                log::warn!("keying bundle carries unusable key inputs");
                return Err(MlsError::ExpectationFailed);
            }

            new_keys.insert(
                entry.index,
                KeyInfo {
                    send_key,
                    next_iv,
                    integrity_passphrase: String::from_utf8_lossy(&integrity).into_owned(),
                },
            );
        }

        if new_keys.is_empty() {
            log::warn!("keying bundle carries no usable keys");
            return Err(MlsError::ExpectationFailed);
        }

        log::debug!(
            "installed {} receive keys from bundle sequence {}",
            new_keys.len(),
            keying.sequence
        );

        self.receive_keys = new_keys;
        self.remote_context_id = keying.context.clone();
        self.next_receive_sequence += 1;
        self.waiting_for = None;

        Ok(KeyingOutcome::Complete)
    }

    //-------------------------------------------------------------------
    // send pipeline

    fn process_send(
        &mut self,
        now: u64,
        on_event: &mut impl FnMut(MlsChannelEvent),
    ) -> Result<(), MlsError> {
        if self.send_keys.is_empty() {
            self.try_prepare_send_keying(now, on_event)?;
        }

        if self.send_keys.is_empty() {
            return Ok(());
        }

        while let Some(plaintext) = self.pending_send.pop_front() {
            let frame = self.encode_data_frame(&plaintext)?;
            on_event(MlsChannelEvent::SendEncoded(frame));
        }

        Ok(())
    }

    fn encode_data_frame(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, MlsError> {
        let index = self.rng.gen_range(1..=self.total_send_keys);
        let key_info = self
            .send_keys
            .get_mut(&index)
            .ok_or(MlsError::PreconditionFailed)?;

        let ciphertext =
            crypto::aes_cfb_encrypt(&key_info.send_key, &key_info.next_iv, plaintext)?;

        let hex_iv = crypto::hex(&key_info.next_iv);
        let integrity_input = format!(
            "integrity:{}:{hex_iv}",
            crypto::hex(&crypto::sha1(plaintext))
        );
        let integrity = crypto::hmac_sha1(
            key_info.integrity_passphrase.as_bytes(),
            integrity_input.as_bytes(),
        )?;

        let next_iv_input = format!("{hex_iv}:{}", crypto::hex(&integrity));
        key_info.next_iv = crypto::sha1(next_iv_input.as_bytes());

        let mut frame = Vec::with_capacity(4 + integrity.len() + ciphertext.len());
        frame.extend_from_slice(&index.to_be_bytes());
        frame.extend_from_slice(&integrity);
        frame.extend_from_slice(&ciphertext);

        Ok(frame)
    }

    fn send_keying_kind(&self) -> Option<SendKeyingKind> {
        if self.send_passphrase.is_some() {
            Some(SendKeyingKind::Passphrase)
        } else if self.send_remote_public_key.is_some() {
            Some(SendKeyingKind::Pki)
        } else if self.dh_local.is_some() && self.dh_remote_public.is_some() {
            Some(SendKeyingKind::Agreement)
        } else {
            None
        }
    }

    fn try_prepare_send_keying(
        &mut self,
        now: u64,
        on_event: &mut impl FnMut(MlsChannelEvent),
    ) -> Result<(), MlsError> {
        if self.send_keying_needing_signature.is_some() {
            if self.send_signing_keypair.is_some() {
                let keying_value = self
                    .send_keying_needing_signature
                    .take()
                    .expect("checked above");
                self.emit_signed_keying(now, keying_value, on_event)?;
            }

            return Ok(());
        }

        let Some(kind) = self.send_keying_kind() else {
            return Ok(());
        };

        let (keying_value, keys) = self.build_send_keying(now, kind)?;
        self.staged_send_keys = Some(keys);

        if self.send_signing_keypair.is_some() {
            self.emit_signed_keying(now, keying_value, on_event)?;
        } else {
            log::debug!("keying bundle built, waiting for external signature");
            self.send_keying_needing_signature = Some(keying_value);
        }

        Ok(())
    }

    fn emit_signed_keying(
        &mut self,
        now: u64,
        keying_value: serde_json::Value,
        on_event: &mut impl FnMut(MlsChannelEvent),
    ) -> Result<(), MlsError> {
        let signer = self
            .send_signing_keypair
            .as_ref()
            .ok_or(MlsError::PreconditionFailed)?;

        let canonical = canonical_keying(&keying_value);
        let signature = signer.sign(&canonical)?;

        let doc = KeyingBundleDoc {
            keying_bundle: KeyingBundle {
                keying: keying_value,
                signature: Signature {
                    algorithm: MLS_SIGNATURE_ALGORITHM.into(),
                    digest_value: BASE64_STANDARD.encode(crypto::sha1(&canonical)),
                    digest_signed: BASE64_STANDARD.encode(&signature),
                    key: SignatureKey {
                        fingerprint: signer.public_key().fingerprint(),
                    },
                },
            },
        };

        let payload = serde_json::to_vec(&doc).map_err(|_| MlsError::BadRequest)?;

        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&0u32.to_be_bytes());
        frame.extend_from_slice(&payload);

        log::debug!(
            "emitting keying bundle sequence {}",
            self.next_send_sequence
        );

        on_event(MlsChannelEvent::SendEncoded(frame));

        self.send_keys = self
            .staged_send_keys
            .take()
            .ok_or(MlsError::PreconditionFailed)?;
        self.next_send_sequence += 1;
        self.change_key_pending = false;

        if self.next_rekey_at.is_none() {
            self.next_rekey_at = Some(now + self.rekey_interval.as_secs());
        }

        Ok(())
    }

    fn build_send_keying(
        &mut self,
        now: u64,
        kind: SendKeyingKind,
    ) -> Result<(serde_json::Value, HashMap<u32, KeyInfo>), MlsError> {
        let nonce = crypto::random_string(32);
        let expires = now + self.keying_expires.as_secs();

        enum InputEncoder<'a> {
            Passphrase(String),
            Rsa(&'a RsaPublicKey),
        }

        let (encoding, encoder) = match kind {
            SendKeyingKind::Passphrase => {
                let passphrase = self.send_passphrase.clone().expect("kind checked");

                let proof_input = format!("keying:{nonce}");
                let proof = crypto::hex(&crypto::hmac_sha1(
                    passphrase.as_bytes(),
                    proof_input.as_bytes(),
                )?);

                self.send_keying_type = KeyingType::Passphrase;

                (
                    Encoding {
                        kind: KEYING_TYPE_PASSPHRASE.into(),
                        algorithm: MLS_ALGORITHM.into(),
                        proof: Some(proof),
                        fingerprint: None,
                        key: None,
                    },
                    InputEncoder::Passphrase(passphrase),
                )
            }
            SendKeyingKind::Pki => {
                let remote = self.send_remote_public_key.as_ref().expect("kind checked");

                self.send_keying_type = KeyingType::PublicKey;

                (
                    Encoding {
                        kind: KEYING_TYPE_PKI.into(),
                        algorithm: MLS_ALGORITHM.into(),
                        proof: None,
                        fingerprint: Some(remote.fingerprint()),
                        key: None,
                    },
                    InputEncoder::Rsa(remote),
                )
            }
            SendKeyingKind::Agreement => {
                let local = self.dh_local.as_ref().expect("kind checked");
                let remote = self.dh_remote_public.as_ref().expect("kind checked");

                let key = if !self.dh_remote_side_knows_local_public
                    && !self.dh_sent_remote_side_local_public
                {
                    self.dh_sent_remote_side_local_public = true;
                    Some(AgreementKey {
                        domain: DH_KEY_DOMAIN.into(),
                        ephemeral: BASE64_STANDARD.encode(local.public_key().as_bytes()),
                    })
                } else {
                    None
                };

                let shared_secret = local.compute_shared_secret(remote)?;

                self.send_keying_type = KeyingType::KeyAgreement;

                (
                    Encoding {
                        kind: KEYING_TYPE_AGREEMENT.into(),
                        algorithm: MLS_ALGORITHM.into(),
                        proof: None,
                        fingerprint: Some(remote.fingerprint()),
                        key,
                    },
                    InputEncoder::Passphrase(crypto::hex(&shared_secret)),
                )
            }
        };

        let mut entries = Vec::new();
        let mut keys = HashMap::new();

        for index in 1..=self.total_send_keys {
            let send_key = crypto::random_bytes(32);
            let next_iv = crypto::md5(&crypto::random_bytes(16));
            let integrity_passphrase = crypto::random_string(32);

            let encode = |plain: &[u8]| -> Result<String, MlsError> {
                match &encoder {
                    InputEncoder::Passphrase(passphrase) => {
                        encode_with_passphrase(passphrase, &nonce, plain)
                    }
                    InputEncoder::Rsa(public_key) => {
                        Ok(BASE64_STANDARD.encode(public_key.encrypt(plain)?))
                    }
                }
            };

            entries.push(KeyEntry {
                index,
                algorithm: MLS_ALGORITHM.into(),
                inputs: KeyInputs {
                    secret: encode(&send_key)?,
                    iv: encode(&next_iv)?,
                    hmac_integrity_key: encode(integrity_passphrase.as_bytes())?,
                },
            });

            keys.insert(
                index,
                KeyInfo {
                    send_key,
                    next_iv,
                    integrity_passphrase,
                },
            );
        }

        let keying = Keying {
            sequence: self.next_send_sequence,
            nonce,
            context: self.local_context_id.clone(),
            expires,
            encoding,
            algorithms: vec![MLS_ALGORITHM.into()],
            keys: entries,
        };

        let value = serde_json::to_value(&keying).map_err(|_| MlsError::BadRequest)?;

        Ok((value, keys))
    }
}

/// `hex(iv) + ":" + base64(aes-cfb(hmac-sha256(passphrase, "keying:" + nonce), iv, plain))`
fn encode_with_passphrase(
    passphrase: &str,
    nonce: &str,
    plain: &[u8],
) -> Result<String, MlsError> {
    let key_input = format!("keying:{nonce}");
    let key = crypto::hmac_sha256(passphrase.as_bytes(), key_input.as_bytes())?;

    let iv = crypto::random_bytes(16);
    let ciphertext = crypto::aes_cfb_encrypt(&key, &iv, plain)?;

    Ok(format!(
        "{}:{}",
        crypto::hex(&iv),
        BASE64_STANDARD.encode(ciphertext)
    ))
}

fn decode_with_passphrase(
    passphrase: &str,
    nonce: &str,
    encoded: &str,
) -> Result<Vec<u8>, MlsError> {
    let Some((hex_iv, ciphertext)) = encoded.split_once(':') else {
        return Err(MlsError::BadRequest);
    };

    let Some(iv) = crypto::from_hex(hex_iv) else {
        return Err(MlsError::BadRequest);
    };

    let Ok(ciphertext) = BASE64_STANDARD.decode(ciphertext) else {
        return Err(MlsError::BadRequest);
    };

    let key_input = format!("keying:{nonce}");
    let key = crypto::hmac_sha256(passphrase.as_bytes(), key_input.as_bytes())?;

    Ok(crypto::aes_cfb_decrypt(&key, &iv, &ciphertext)?)
}

fn decode_with_rsa(keypair: &RsaKeyPair, encoded: &str) -> Result<Vec<u8>, MlsError> {
    let Ok(ciphertext) = BASE64_STANDARD.decode(encoded) else {
        return Err(MlsError::BadRequest);
    };

    keypair.decrypt(&ciphertext).map_err(MlsError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passphrase_encoding_roundtrip() {
        let encoded = encode_with_passphrase("hunter2", "nonce-1", b"secret material").unwrap();
        let decoded = decode_with_passphrase("hunter2", "nonce-1", &encoded).unwrap();
        assert_eq!(decoded, b"secret material");

        // a different passphrase produces garbage, not the plaintext
        let wrong = decode_with_passphrase("hunter3", "nonce-1", &encoded).unwrap();
        assert_ne!(wrong, b"secret material");
    }

    #[test]
    fn passphrase_encoding_is_salted() {
        let a = encode_with_passphrase("hunter2", "nonce-1", b"same").unwrap();
        let b = encode_with_passphrase("hunter2", "nonce-1", b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn malformed_passphrase_encodings_are_rejected() {
        assert!(decode_with_passphrase("p", "n", "no-separator").is_err());
        assert!(decode_with_passphrase("p", "n", "zz:AAAA").is_err());
        assert!(decode_with_passphrase("p", "n", "0011:!!!").is_err());
    }

    #[test]
    fn data_frame_iv_chains_from_the_previous_integrity() {
        let mut channel = MlsChannel::new(MlsChannelConfig {
            total_send_keys: 1,
            ..Default::default()
        });

        channel.send_keys.insert(
            1,
            KeyInfo {
                send_key: crypto::random_bytes(32),
                next_iv: crypto::md5(&crypto::random_bytes(16)),
                integrity_passphrase: "integrity-pass".into(),
            },
        );

        let iv_0 = channel.send_keys[&1].next_iv.clone();
        let frame = channel.encode_data_frame(b"first").unwrap();
        let integrity_0 = &frame[4..4 + INTEGRITY_LENGTH];

        // iv_1 = sha1(hex(iv_0) + ":" + hex(integrity_0))
        let expected = crypto::sha1(
            format!("{}:{}", crypto::hex(&iv_0), crypto::hex(integrity_0)).as_bytes(),
        );
        assert_eq!(channel.send_keys[&1].next_iv, expected);

        // and the chain keeps advancing frame after frame
        let frame = channel.encode_data_frame(b"second").unwrap();
        let integrity_1 = &frame[4..4 + INTEGRITY_LENGTH];
        let expected = crypto::sha1(
            format!("{}:{}", crypto::hex(&expected), crypto::hex(integrity_1)).as_bytes(),
        );
        assert_eq!(channel.send_keys[&1].next_iv, expected);
    }
}
