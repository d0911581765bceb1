//! Per-job output-connect credentials.
//!
//! The plaintext is handed to the worker exactly once, in the dispatch
//! message. Only the keyed hash is persisted on the job.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const CREDENTIAL_DOMAIN: &[u8] = b"buildfleet-output-connect";

/// Mint a fresh random credential (256 bits, hex encoded).
pub fn mint() -> String {
    let mut raw = Vec::with_capacity(32);
    raw.extend_from_slice(Uuid::new_v4().as_bytes());
    raw.extend_from_slice(Uuid::new_v4().as_bytes());
    hex::encode(raw)
}

fn mac(credential: &str) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(CREDENTIAL_DOMAIN).expect("HMAC can take any size key");
    mac.update(credential.as_bytes());
    mac
}

/// Hash a credential for storage.
pub fn hash(credential: &str) -> String {
    hex::encode(mac(credential).finalize().into_bytes())
}

/// Check a presented credential against a stored hash in constant time.
pub fn verify(credential: &str, stored_hash: &str) -> bool {
    let Ok(expected) = hex::decode(stored_hash) else {
        return false;
    };
    mac(credential).verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_is_random() {
        let a = mint();
        let b = mint();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn test_verify() {
        let cred = mint();
        let stored = hash(&cred);
        assert_ne!(stored, cred);
        assert!(verify(&cred, &stored));
        assert!(!verify(&mint(), &stored));
        assert!(!verify(&cred, "not-hex"));
    }
}
