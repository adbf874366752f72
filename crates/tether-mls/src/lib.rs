#![deny(unreachable_pub, unsafe_code)]

//! sans io implementation of a message layer security channel
//!
//! [`MlsChannel`] bidirectionally encrypts, authenticates and keys an
//! application byte stream carried over arbitrary transport streams. Keying
//! material is exchanged through signed JSON keying bundles, protected by a
//! shared passphrase, the peer's RSA public key or a Diffie-Hellman key
//! agreement. Data frames use AES-CFB with an HMAC-SHA1 integrity tag and a
//! hash-chained IV.
//!
//! All I/O and timing is left to the embedder: encoded wire frames are
//! ingested with [`MlsChannel::receive_encoded`], plaintext with
//! [`MlsChannel::write`], the rekey timer is driven by
//! [`MlsChannel::poll`] / [`MlsChannel::timeout`] and both outgoing
//! directions are reported through [`MlsChannelEvent`]s.

mod channel;
mod crypto;
mod keying;
mod keys;
mod nonce_cache;

pub use channel::{
    KeyingType, MlsChannel, MlsChannelConfig, MlsChannelEvent, MlsChannelState, MlsError,
};
pub use keying::{MLS_ALGORITHM, MLS_SIGNATURE_ALGORITHM};
pub use keys::{DhKeyPair, DhPublicKey, RsaKeyPair, RsaPublicKey, DH_KEY_DOMAIN};
