//! Configuration hashing for change detection.
//!
//! Hashes are computed over a canonical JSON rendering: resources keyed by
//! address and attribute maps with sorted keys, so declaration order and YAML
//! formatting never change the hash.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::spec::InfraConfig;

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the project identity and every resource definition.
    #[must_use]
    pub fn hash_config(&self, config: &InfraConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.project.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(config.project.environment.as_bytes());
        hasher.update([0u8]);

        let resources: BTreeMap<String, &BTreeMap<String, Value>> = config
            .resources
            .iter()
            .map(|r| (r.address(), &r.attributes))
            .collect();
        for (address, attributes) in resources {
            hasher.update(address.as_bytes());
            hasher.update([0u8]);
            hasher.update(self.hash_attributes(attributes).as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single attribute map.
    #[must_use]
    pub fn hash_attributes(&self, attributes: &BTreeMap<String, Value>) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in attributes {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            // serde_json maps are sorted, so this rendering is canonical
            hasher.update(value.to_string().as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}
