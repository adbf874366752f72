//! JSON document model of the signed keying bundle

use serde::{Deserialize, Serialize};

/// The default (and only) data frame algorithm of this library:
/// AES-256-CFB with 16 byte IVs, HMAC-SHA1 integrity and MD5 IV seeding
pub const MLS_ALGORITHM: &str = "https://meta.ortclib.org/2012/12/14/mls#aes-cfb-32-16-16-sha1-md5";

/// Signature algorithm of the keying element
pub const MLS_SIGNATURE_ALGORITHM: &str = "https://meta.ortclib.org/2012/12/14/mls#rsa-sha1";

pub(crate) const KEYING_TYPE_PASSPHRASE: &str = "passphrase";
pub(crate) const KEYING_TYPE_PKI: &str = "pki";
pub(crate) const KEYING_TYPE_AGREEMENT: &str = "agreement";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct KeyingBundleDoc {
    #[serde(rename = "keyingBundle")]
    pub(crate) keying_bundle: KeyingBundle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct KeyingBundle {
    /// Kept as a raw value so the signature covers the exact canonical form
    pub(crate) keying: serde_json::Value,
    pub(crate) signature: Signature,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Keying {
    pub(crate) sequence: u64,
    pub(crate) nonce: String,
    pub(crate) context: String,
    /// Unix timestamp in seconds
    pub(crate) expires: u64,
    pub(crate) encoding: Encoding,
    pub(crate) algorithms: Vec<String>,
    pub(crate) keys: Vec<KeyEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Encoding {
    #[serde(rename = "type")]
    pub(crate) kind: String,
    pub(crate) algorithm: String,
    /// Passphrase proof, `hex(hmac-sha1(passphrase, "keying:" + nonce))`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) proof: Option<String>,
    /// Fingerprint of the recipient key the inputs were encrypted against
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) fingerprint: Option<String>,
    /// The sender's key agreement public value, present until the remote
    /// side is known to have it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) key: Option<AgreementKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AgreementKey {
    pub(crate) domain: String,
    /// base64 of the public value
    pub(crate) ephemeral: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct KeyEntry {
    pub(crate) index: u32,
    pub(crate) algorithm: String,
    pub(crate) inputs: KeyInputs,
}

/// Per-key material, each field encrypted under the bundle's keying type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct KeyInputs {
    pub(crate) secret: String,
    pub(crate) iv: String,
    pub(crate) hmac_integrity_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Signature {
    pub(crate) algorithm: String,
    /// base64(sha1(canonical keying))
    pub(crate) digest_value: String,
    /// base64(rsa-sha1 signature over the canonical keying)
    pub(crate) digest_signed: String,
    pub(crate) key: SignatureKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SignatureKey {
    pub(crate) fingerprint: String,
}

/// The canonical byte form of a keying element that signatures cover.
///
/// `serde_json` maps are ordered, serializing the parsed value reproduces
/// the exact same bytes on both sides.
pub(crate) fn canonical_keying(keying: &serde_json::Value) -> Vec<u8> {
    serde_json::to_string(keying)
        .expect("keying value serializes")
        .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_is_stable_across_reparse() {
        let keying = serde_json::json!({
            "sequence": 0,
            "nonce": "abc",
            "zeta": "last",
            "alpha": "first",
        });

        let first = canonical_keying(&keying);
        let reparsed: serde_json::Value = serde_json::from_slice(&first).unwrap();
        let second = canonical_keying(&reparsed);

        assert_eq!(first, second);
    }

    #[test]
    fn key_inputs_use_wire_field_names() {
        let inputs = KeyInputs {
            secret: "s".into(),
            iv: "i".into(),
            hmac_integrity_key: "h".into(),
        };

        let json = serde_json::to_string(&inputs).unwrap();
        assert!(json.contains("hmacIntegrityKey"));
    }
}
