//! RSA & Diffie-Hellman key material used for keying bundles

use crate::crypto;
use openssl::{
    bn::BigNum,
    dh::Dh,
    error::ErrorStack,
    hash::MessageDigest,
    pkey::{PKey, Private},
    rsa::{Padding, Rsa},
    sign::{Signer, Verifier},
};

/// The fixed key agreement domain of this library (RFC 5114 2048/256 group)
pub const DH_KEY_DOMAIN: &str = "https://meta.ortclib.org/2012/12/14/dh#rfc5114-2048-256";

/// Local RSA key pair, used to decrypt received keying material and to sign
/// outgoing keying bundles
pub struct RsaKeyPair {
    rsa: Rsa<Private>,
}

impl RsaKeyPair {
    pub fn generate() -> Result<Self, ErrorStack> {
        Ok(RsaKeyPair {
            rsa: Rsa::generate(2048)?,
        })
    }

    pub fn from_private_der(der: &[u8]) -> Result<Self, ErrorStack> {
        Ok(RsaKeyPair {
            rsa: Rsa::private_key_from_der(der)?,
        })
    }

    pub fn public_key(&self) -> RsaPublicKey {
        RsaPublicKey {
            der: self.rsa.public_key_to_der().unwrap(),
        }
    }

    pub(crate) fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, ErrorStack> {
        let mut out = vec![0u8; self.rsa.size() as usize];
        let len = self.rsa.private_decrypt(data, &mut out, Padding::PKCS1_OAEP)?;
        out.truncate(len);
        Ok(out)
    }

    /// RSA-SHA1 signature over `data`
    pub(crate) fn sign(&self, data: &[u8]) -> Result<Vec<u8>, ErrorStack> {
        let key = PKey::from_rsa(self.rsa.clone())?;
        let mut signer = Signer::new(MessageDigest::sha1(), &key)?;
        signer.update(data)?;
        signer.sign_to_vec()
    }
}

/// An RSA public key, identified on the wire by its fingerprint
#[derive(Clone, PartialEq, Eq)]
pub struct RsaPublicKey {
    der: Vec<u8>,
}

impl RsaPublicKey {
    pub fn from_der(der: &[u8]) -> Result<Self, ErrorStack> {
        // validate eagerly so later uses cannot fail on malformed input
        Rsa::public_key_from_der(der)?;
        Ok(RsaPublicKey { der: der.to_vec() })
    }

    pub fn to_der(&self) -> &[u8] {
        &self.der
    }

    /// hex(sha1(public key DER)), the identifier carried in keying bundles
    pub fn fingerprint(&self) -> String {
        crypto::hex(&crypto::sha1(&self.der))
    }

    pub(crate) fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, ErrorStack> {
        let rsa = Rsa::public_key_from_der(&self.der)?;
        let mut out = vec![0u8; rsa.size() as usize];
        let len = rsa.public_encrypt(data, &mut out, Padding::PKCS1_OAEP)?;
        out.truncate(len);
        Ok(out)
    }

    pub(crate) fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool, ErrorStack> {
        let rsa = Rsa::public_key_from_der(&self.der)?;
        let key = PKey::from_rsa(rsa)?;
        let mut verifier = Verifier::new(MessageDigest::sha1(), &key)?;
        verifier.update(data)?;
        verifier.verify(signature)
    }
}

/// Local half of a Diffie-Hellman key agreement in [`DH_KEY_DOMAIN`]
pub struct DhKeyPair {
    dh: Dh<Private>,
}

impl DhKeyPair {
    pub fn generate() -> Result<Self, ErrorStack> {
        Ok(DhKeyPair {
            dh: Dh::get_2048_256()?.generate_key()?,
        })
    }

    pub fn public_key(&self) -> DhPublicKey {
        DhPublicKey {
            bytes: self.dh.public_key().to_vec(),
        }
    }

    pub(crate) fn compute_shared_secret(
        &self,
        remote: &DhPublicKey,
    ) -> Result<Vec<u8>, ErrorStack> {
        let remote = BigNum::from_slice(&remote.bytes)?;
        self.dh.compute_key(&remote)
    }
}

/// A peer's public Diffie-Hellman value
#[derive(Clone, PartialEq, Eq)]
pub struct DhPublicKey {
    bytes: Vec<u8>,
}

impl DhPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        DhPublicKey {
            bytes: bytes.to_vec(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn fingerprint(&self) -> String {
        crypto::hex(&crypto::sha1(&self.bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsa_encrypt_decrypt() {
        let pair = RsaKeyPair::generate().unwrap();
        let public = pair.public_key();

        let secret = b"thirty-two bytes of key material";
        let encrypted = public.encrypt(secret).unwrap();
        assert_eq!(pair.decrypt(&encrypted).unwrap(), secret);
    }

    #[test]
    fn rsa_sign_verify() {
        let pair = RsaKeyPair::generate().unwrap();
        let public = pair.public_key();

        let signature = pair.sign(b"document").unwrap();
        assert!(public.verify(b"document", &signature).unwrap());
        assert!(!public.verify(b"tampered", &signature).unwrap());
    }

    #[test]
    fn fingerprints_are_stable() {
        let pair = RsaKeyPair::generate().unwrap();
        assert_eq!(pair.public_key().fingerprint(), pair.public_key().fingerprint());
        assert_eq!(pair.public_key().fingerprint().len(), 40);
    }

    #[test]
    fn dh_agreement() {
        let a = DhKeyPair::generate().unwrap();
        let b = DhKeyPair::generate().unwrap();

        let ab = a.compute_shared_secret(&b.public_key()).unwrap();
        let ba = b.compute_shared_secret(&a.public_key()).unwrap();

        assert_eq!(ab, ba);
        assert!(!ab.is_empty());
    }
}
