use crate::IceCredentials;
use std::{borrow::Cow, cmp::min, net::SocketAddr, time::Duration};
use stun_types::{
    attributes::{
        ErrorCode, Fingerprint, IceControlled, IceControlling, MessageIntegrity,
        MessageIntegrityKey, Priority, Username, UseCandidate, XorMappedAddress,
    },
    Class, Message, MessageBuilder, Method, TransactionId,
};

pub(crate) struct StunConfig {
    pub(crate) initial_rto: Duration,
    pub(crate) max_retransmits: u32,
    pub(crate) max_rto: Duration,
}

impl StunConfig {
    pub(crate) fn new() -> Self {
        Self {
            // Copying str0m & libwebrtc defaults here
            initial_rto: Duration::from_millis(250),
            // RFC 5389 default
            max_retransmits: 7,
            // Like str0m & libwebrtc capping the maximum retransmit value
            max_rto: Duration::from_secs(8),
        }
    }

    pub(crate) fn retransmit_delta(&self, attempts: u32) -> Duration {
        let rto = Duration::from_millis(
            (self.initial_rto.as_millis() << attempts)
                .try_into()
                .unwrap_or(u64::MAX),
        );

        min(rto, self.max_rto)
    }
}

pub(crate) struct BindingRequestParams<'c> {
    pub(crate) transaction_id: TransactionId,
    pub(crate) local_credentials: &'c IceCredentials,
    pub(crate) remote_credentials: &'c IceCredentials,
    pub(crate) priority: u32,
    pub(crate) is_controlling: bool,
    pub(crate) conflict_resolver: u64,
    pub(crate) use_candidate: bool,
}

pub(crate) fn make_binding_request(params: BindingRequestParams<'_>) -> Vec<u8> {
    let mut stun_message = MessageBuilder::new(
        Class::Request,
        Method::Binding,
        params.transaction_id,
    );

    // A remote peer without a password is a plain STUN server, short-term
    // credentials are omitted entirely in that case
    if !params.remote_credentials.pwd.is_empty() {
        let username = format!(
            "{}:{}",
            params.remote_credentials.ufrag, params.local_credentials.ufrag
        );
        stun_message.add_attr(&Username::new(&username)).unwrap();
    }

    stun_message.add_attr(&Priority(params.priority)).unwrap();

    if params.is_controlling {
        stun_message
            .add_attr(&IceControlling(params.conflict_resolver))
            .unwrap();
    } else {
        stun_message
            .add_attr(&IceControlled(params.conflict_resolver))
            .unwrap();
    }

    if params.use_candidate {
        stun_message.add_attr(&UseCandidate).unwrap();
    }

    if !params.remote_credentials.pwd.is_empty() {
        stun_message
            .add_attr_with(
                &MessageIntegrity::default(),
                &MessageIntegrityKey::new_raw(Cow::Borrowed(
                    params.remote_credentials.pwd.as_bytes(),
                )),
            )
            .unwrap();
    }

    stun_message.add_attr(&Fingerprint).unwrap();

    stun_message.finish()
}

pub(crate) fn make_binding_indication() -> Vec<u8> {
    let mut stun_message = MessageBuilder::new(
        Class::Indication,
        Method::Binding,
        TransactionId::random(),
    );

    stun_message.add_attr(&Fingerprint).unwrap();

    stun_message.finish()
}

pub(crate) fn make_success_response(
    transaction_id: TransactionId,
    local_credentials: &IceCredentials,
    source: SocketAddr,
) -> Vec<u8> {
    let mut stun_message = MessageBuilder::new(Class::Success, Method::Binding, transaction_id);

    stun_message.add_attr(&XorMappedAddress(source)).unwrap();

    if !local_credentials.pwd.is_empty() {
        stun_message
            .add_attr_with(
                &MessageIntegrity::default(),
                &MessageIntegrityKey::new_raw(Cow::Borrowed(local_credentials.pwd.as_bytes())),
            )
            .unwrap();
    }

    stun_message.add_attr(&Fingerprint).unwrap();

    stun_message.finish()
}

pub(crate) fn make_error_response(
    transaction_id: TransactionId,
    local_credentials: &IceCredentials,
    code: u16,
    reason: &str,
    role_attr: Option<(bool, u64)>,
) -> Vec<u8> {
    let mut stun_message = MessageBuilder::new(Class::Error, Method::Binding, transaction_id);

    stun_message
        .add_attr(&ErrorCode {
            number: code,
            reason: reason.into(),
        })
        .unwrap();

    if let Some((is_controlling, conflict_resolver)) = role_attr {
        if is_controlling {
            stun_message
                .add_attr(&IceControlling(conflict_resolver))
                .unwrap();
        } else {
            stun_message
                .add_attr(&IceControlled(conflict_resolver))
                .unwrap();
        }
    }

    if !local_credentials.pwd.is_empty() {
        stun_message
            .add_attr_with(
                &MessageIntegrity::default(),
                &MessageIntegrityKey::new_raw(Cow::Borrowed(local_credentials.pwd.as_bytes())),
            )
            .unwrap();
    }

    stun_message.add_attr(&Fingerprint).unwrap();

    stun_message.finish()
}

/// Verify the short-term credential integrity of an incoming STUN message.
///
/// Requests & indications are signed with our own password, responses with
/// the remote one. An empty password (server mode) passes the check since
/// there is no key material to verify against.
pub(crate) fn verify_integrity(
    local_credentials: &IceCredentials,
    remote_credentials: &IceCredentials,
    stun_msg: &mut Message,
) -> bool {
    let is_request = match stun_msg.class() {
        Class::Request | Class::Indication => true,
        Class::Success | Class::Error => false,
    };

    let key = if is_request {
        &local_credentials.pwd
    } else {
        &remote_credentials.pwd
    };

    if key.is_empty() {
        return true;
    }

    let passed_integrity_check = stun_msg
        .attribute_with::<MessageIntegrity>(&MessageIntegrityKey::new_raw(Cow::Borrowed(
            key.as_bytes(),
        )))
        .is_some_and(|r| r.is_ok());

    if !passed_integrity_check {
        return false;
    }

    // Responses are matched by transaction id, only requests carry the
    // ufrag pair to check against
    if !is_request {
        return true;
    }

    let expected_username = format!(
        "{}:{}",
        local_credentials.ufrag, remote_credentials.ufrag
    );

    match stun_msg.attribute::<Username>() {
        Some(Ok(username)) => username.0 == expected_username,
        _ => false,
    }
}

/// Cheap check if a received datagram is a STUN message, everything else is
/// application data for the nominated path
pub(crate) fn is_stun_message(data: &[u8]) -> bool {
    const MAGIC_COOKIE: [u8; 4] = [0x21, 0x12, 0xA4, 0x42];

    data.len() >= 20 && data[0] & 0xC0 == 0 && data[4..8] == MAGIC_COOKIE
}
