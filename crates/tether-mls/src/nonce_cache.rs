//! Process-wide replay protection for keying bundle nonces
//!
//! Entries live for the keying bundle's own expiry window, matching the
//! 2 hour default lifetime of a bundle.

use crate::crypto;
use std::{
    collections::HashMap,
    sync::{Mutex, OnceLock},
};

const NONCE_CACHE_NAMESPACE: &str = "https://meta.ortclib.org/caching/mls/nonce/";

fn cache() -> &'static Mutex<HashMap<String, u64>> {
    static CACHE: OnceLock<Mutex<HashMap<String, u64>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Record `nonce` as seen until `expires`. Returns false when the nonce was
/// already seen and is still alive.
pub(crate) fn check_and_store(nonce: &str, expires: u64, now: u64) -> bool {
    let key = format!(
        "{NONCE_CACHE_NAMESPACE}{}",
        crypto::hex(&crypto::sha256(nonce.as_bytes()))
    );

    let mut cache = cache().lock().unwrap();

    cache.retain(|_, entry_expires| *entry_expires > now);

    if cache.contains_key(&key) {
        return false;
    }

    cache.insert(key, expires);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replayed_nonce_is_rejected_until_expiry() {
        assert!(check_and_store("nonce-cache-test-1", 1000, 100));
        assert!(!check_and_store("nonce-cache-test-1", 1000, 100));

        // a different nonce is unaffected
        assert!(check_and_store("nonce-cache-test-2", 1000, 100));

        // after expiry the nonce may appear again
        assert!(check_and_store("nonce-cache-test-1", 3000, 2000));
    }
}
