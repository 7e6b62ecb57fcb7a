use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::Identity;

/// Stored login credential: identity plus a one-way digest of its secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub identity: Identity,
    pub secret_digest: String,
}

impl CredentialRecord {
    pub fn new(identity: Identity, secret: &str) -> Self {
        Self {
            identity,
            secret_digest: digest_secret(secret),
        }
    }

    pub fn verify(&self, secret: &str) -> bool {
        digest_secret(secret) == self.secret_digest
    }
}

/// Hex SHA-256 of `secret`.
pub fn digest_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}
