//! Thin wrappers around the openssl primitives used by the channel

use openssl::{
    error::ErrorStack,
    hash::{hash, MessageDigest},
    pkey::PKey,
    sign::Signer,
    symm::{decrypt, encrypt, Cipher},
};
use rand::{distributions::Alphanumeric, distributions::DistString, RngCore};

pub(crate) fn sha1(data: &[u8]) -> Vec<u8> {
    hash(MessageDigest::sha1(), data).map(|d| d.to_vec()).unwrap()
}

pub(crate) fn sha256(data: &[u8]) -> Vec<u8> {
    hash(MessageDigest::sha256(), data).map(|d| d.to_vec()).unwrap()
}

pub(crate) fn md5(data: &[u8]) -> Vec<u8> {
    hash(MessageDigest::md5(), data).map(|d| d.to_vec()).unwrap()
}

pub(crate) fn hmac_sha1(key: &[u8], data: &[u8]) -> Result<Vec<u8>, ErrorStack> {
    let key = PKey::hmac(key)?;
    let mut signer = Signer::new(MessageDigest::sha1(), &key)?;
    signer.update(data)?;
    signer.sign_to_vec()
}

pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, ErrorStack> {
    let key = PKey::hmac(key)?;
    let mut signer = Signer::new(MessageDigest::sha256(), &key)?;
    signer.update(data)?;
    signer.sign_to_vec()
}

/// AES-256-CFB as used for both keying material and data frames
pub(crate) fn aes_cfb_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, ErrorStack> {
    encrypt(Cipher::aes_256_cfb128(), key, Some(iv), data)
}

pub(crate) fn aes_cfb_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, ErrorStack> {
    decrypt(Cipher::aes_256_cfb128(), key, Some(iv), data)
}

pub(crate) fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

pub(crate) fn random_string(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), len)
}

pub(crate) fn hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub(crate) fn from_hex(data: &str) -> Option<Vec<u8>> {
    if data.len() % 2 != 0 {
        return None;
    }

    (0..data.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&data[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let data = [0x00, 0x01, 0xab, 0xff];
        let encoded = hex(&data);
        assert_eq!(encoded, "0001abff");
        assert_eq!(from_hex(&encoded).unwrap(), data);

        assert!(from_hex("abc").is_none());
        assert!(from_hex("zz").is_none());
    }

    #[test]
    fn aes_cfb_roundtrip() {
        let key = random_bytes(32);
        let iv = random_bytes(16);
        let plain = b"not block aligned.";

        let ct = aes_cfb_encrypt(&key, &iv, plain).unwrap();
        assert_ne!(&ct, plain);
        // CFB is a stream mode, no padding
        assert_eq!(ct.len(), plain.len());

        let decrypted = aes_cfb_decrypt(&key, &iv, &ct).unwrap();
        assert_eq!(decrypted, plain);
    }

    #[test]
    fn hmac_is_keyed() {
        let a = hmac_sha1(b"key-a", b"data").unwrap();
        let b = hmac_sha1(b"key-b", b"data").unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 20);

        assert_eq!(hmac_sha256(b"key", b"data").unwrap().len(), 32);
    }
}
