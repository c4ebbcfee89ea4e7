//! Package integrity checksums.
//!
//! Only sha256 is supported. Digests are compared hex-encoded.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{KilnError, KilnResult};

/// The only supported checksum algorithm.
pub const SHA256: &str = "sha256";

/// Declared digest of a reference-delivered package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    #[serde(rename = "type")]
    pub checksum_type: String,
    /// Hex-encoded digest.
    pub sum: String,
}

impl Checksum {
    /// Checksum of `bytes` with the supported algorithm.
    pub fn sha256(bytes: &[u8]) -> Self {
        Self {
            checksum_type: SHA256.to_string(),
            sum: sha256_hex(bytes),
        }
    }

    /// Reject unsupported algorithms and empty digests.
    pub fn validate(&self) -> KilnResult<()> {
        if self.checksum_type != SHA256 {
            return Err(KilnError::Validation(format!(
                "unsupported checksum type {:?}",
                self.checksum_type
            )));
        }
        if self.sum.is_empty() {
            return Err(KilnError::Validation("checksum sum is empty".into()));
        }
        Ok(())
    }

    /// Start an incremental digest for this checksum's algorithm.
    pub fn hasher(&self) -> KilnResult<ChecksumHasher> {
        self.validate()?;
        Ok(ChecksumHasher {
            inner: Sha256::new(),
        })
    }

    /// Compare a computed hex digest against the declared one.
    pub fn verify_hex(&self, actual: &str) -> KilnResult<()> {
        if actual.eq_ignore_ascii_case(&self.sum) {
            Ok(())
        } else {
            Err(KilnError::Checksum(format!(
                "expected {}, got {actual}",
                self.sum
            )))
        }
    }
}

/// Incremental digest over streamed content.
pub struct ChecksumHasher {
    inner: Sha256,
}

impl ChecksumHasher {
    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    pub fn finish_hex(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

/// Hex-encoded sha256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
