//! Record and dataset hashing.

use sha2::{Digest, Sha256};

/// Computes authoritative hashes.
///
/// Hashes must be deterministic and stable for identical content across
/// processes, because they are compared against hashes computed elsewhere.
pub trait HashProvider: Send + Sync {
    /// Hash of one record value.
    fn compute_hash(&self, record: &serde_json::Value) -> String;

    /// Hash of a whole dataset given its record hashes in any order.
    fn dataset_hash(&self, record_hashes: &[String]) -> String;
}

/// SHA-256 over canonical JSON, rendered as lowercase hex.
///
/// Object keys are ordered by `serde_json`, so two values that compare equal
/// always hash equal.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256HashProvider;

impl HashProvider for Sha256HashProvider {
    fn compute_hash(&self, record: &serde_json::Value) -> String {
        hex(&Sha256::digest(record.to_string().as_bytes()))
    }

    fn dataset_hash(&self, record_hashes: &[String]) -> String {
        let mut sorted: Vec<&str> = record_hashes.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        let mut hasher = Sha256::new();
        for hash in sorted {
            hasher.update(hash.as_bytes());
            hasher.update(b"\n");
        }
        hex(&hasher.finalize())
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
