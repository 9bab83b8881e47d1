//! Stable hashing used for bucketing and id-list lookups.
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};

/// Number of buckets pass percentages are expressed against (`100% == 10_000`).
pub const TOTAL_BUCKETS: u64 = 10_000;

pub trait Sharder {
    fn hash(&self, input: &str) -> u64;

    fn get_bucket(&self, input: &str, total_buckets: u64) -> u64 {
        self.hash(input) % total_buckets
    }
}

/// The default (and only) sharder: first 8 bytes of SHA-256 as a big-endian integer.
pub struct Sha256Sharder;

impl Sharder for Sha256Sharder {
    fn hash(&self, input: &str) -> u64 {
        let digest = Sha256::digest(input.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(prefix)
    }
}

/// Id lists store the first 8 characters of base64(SHA-256(id)).
pub fn id_list_hash(id: &str) -> String {
    let encoded = STANDARD.encode(Sha256::digest(id.as_bytes()));
    encoded.chars().take(8).collect()
}

#[cfg(test)]
pub struct DeterministicSharder(pub std::collections::HashMap<String, u64>);

#[cfg(test)]
impl Sharder for DeterministicSharder {
    fn hash(&self, input: &str) -> u64 {
        self.0.get(input).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use crate::sharder::{id_list_hash, Sha256Sharder, Sharder, TOTAL_BUCKETS};

    #[test]
    fn test_sha256_sharder() {
        assert_eq!(Sha256Sharder.get_bucket("test-input", TOTAL_BUCKETS), 1739);
        assert_eq!(Sha256Sharder.get_bucket("alice", TOTAL_BUCKETS), 207);
        assert_eq!(Sha256Sharder.get_bucket("bob", TOTAL_BUCKETS), 8650);
        assert_eq!(Sha256Sharder.get_bucket("charlie", TOTAL_BUCKETS), 362);
    }

    #[test]
    fn user_bucket_uses_thousand_buckets() {
        assert_eq!(Sha256Sharder.get_bucket("bob", 1000), 650);
    }

    #[test]
    fn test_id_list_hash() {
        assert_eq!(id_list_hash("u1"), "u4IDDbwr");
        assert_eq!(id_list_hash("u2"), "bKICyI5U");
    }
}
