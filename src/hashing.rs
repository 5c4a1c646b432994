//! Identifier Hashing
//! Mission: PII never persists raw; cross-tenant linking only via the digest

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// One-way digest of a normalised PII field (BVN, phone, email, device id).
///
/// The only form in which PII enters the transactional store or the
/// consortium. Construction goes through [`IdentityHasher`]; an empty input
/// stays empty rather than becoming the hash of "".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct HashedId(String);

impl HashedId {
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// Wrap a digest that is already a 64-hex string (e.g. read back from the
    /// store). Anything else collapses to empty.
    pub fn from_stored(value: &str) -> Self {
        if value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit()) {
            Self(value.to_string())
        } else {
            Self::empty()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HashedId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalises and hashes raw identifiers to 64-hex digests.
#[derive(Debug, Clone, Default)]
pub struct IdentityHasher;

impl IdentityHasher {
    pub fn new() -> Self {
        Self
    }

    /// Lowercase + trim, then SHA-256. Empty input maps to the empty id.
    pub fn hash(&self, raw: &str) -> HashedId {
        let normalised = raw.trim().to_lowercase();
        if normalised.is_empty() {
            return HashedId::empty();
        }
        HashedId(hex_digest(normalised.as_bytes()))
    }

    /// Phone numbers keep digits only (separators, spaces and the leading `+`
    /// are stripped) so "+234 801..." and "0234-801..." variants converge.
    pub fn hash_phone(&self, raw: &str) -> HashedId {
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return HashedId::empty();
        }
        HashedId(hex_digest(digits.as_bytes()))
    }

    /// Emails canonicalise to lowercase before hashing.
    pub fn hash_email(&self, raw: &str) -> HashedId {
        self.hash(raw)
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Keyed digest for API keys. The tenant store holds only this value, so a
/// leaked database cannot be replayed against the API without the process
/// secret.
pub fn api_key_digest(secret: &str, api_key: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(api_key.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_64_hex_and_deterministic() {
        let hasher = IdentityHasher::new();
        let a = hasher.hash("22123456789");
        let b = hasher.hash("22123456789");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().bytes().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn empty_input_stays_empty() {
        let hasher = IdentityHasher::new();
        assert!(hasher.hash("").is_empty());
        assert!(hasher.hash("   ").is_empty());
        assert!(hasher.hash_phone("").is_empty());
        assert!(hasher.hash_phone("+- ()").is_empty());
    }

    #[test]
    fn phone_variants_converge() {
        let hasher = IdentityHasher::new();
        let canonical = hasher.hash_phone("2348012345678");
        assert_eq!(hasher.hash_phone("+234 801 234 5678"), canonical);
        assert_eq!(hasher.hash_phone("234-8012345678"), canonical);
        assert_eq!(hasher.hash_phone("(234) 8012345678"), canonical);
    }

    #[test]
    fn email_case_insensitive() {
        let hasher = IdentityHasher::new();
        assert_eq!(
            hasher.hash_email("Ada.Obi@Example.COM"),
            hasher.hash_email("ada.obi@example.com")
        );
    }

    #[test]
    fn from_stored_rejects_garbage() {
        assert!(HashedId::from_stored("not-a-digest").is_empty());
        let hasher = IdentityHasher::new();
        let h = hasher.hash("device-123");
        assert_eq!(HashedId::from_stored(h.as_str()), h);
    }

    #[test]
    fn api_key_digest_depends_on_secret() {
        let a = api_key_digest("secret-one-secret-one-secret-one", "sk_live_abc");
        let b = api_key_digest("secret-two-secret-two-secret-two", "sk_live_abc");
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }
}
