//! Persisted form of a `WorkflowRun`.
//!
//! Large values live in a content-addressed blob store and are referenced by
//! their SHA-256 digest, so a snapshot row stays small regardless of how big
//! the candidate or the verdict history grows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{Id, Phase, Severity, TerminalReason};

/// Schema tag written with every snapshot. Loads reject any other tag.
pub const SCHEMA_VERSION: &str = "hone.checkpoint/v1";

/// SHA-256 hex digest identifying an immutable blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobRef(pub String);

impl BlobRef {
    pub fn for_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(format!("{:x}", hasher.finalize()))
    }
}

impl std::fmt::Display for BlobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for BlobRef {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub schema_version: String,
    pub run_id: Id,
    pub phase: Phase,
    pub iteration: u32,
    pub max_iterations: u32,
    pub blocking_severity: Severity,
    pub requirements_ref: BlobRef,
    pub plan_ref: Option<BlobRef>,
    pub code_candidate_ref: Option<BlobRef>,
    /// JSON array of verdicts consumed by refine cycles.
    pub verdict_history_ref: BlobRef,
    pub latest_verdict_ref: Option<BlobRef>,
    pub documentation_ref: Option<BlobRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub terminal_reason: Option<TerminalReason>,
    pub failure_detail: Option<String>,
    /// Retention hint for the external sweep; never enforced on load.
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_ref_is_stable_sha256_hex() {
        let a = BlobRef::for_bytes(b"resource \"aws_s3_bucket\" \"logs\" {}");
        let b = BlobRef::for_bytes(b"resource \"aws_s3_bucket\" \"logs\" {}");
        assert_eq!(a, b);
        assert_eq!(a.0.len(), 64);
        assert_eq!(
            BlobRef::for_bytes(b"").0,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn different_content_gets_different_ref() {
        assert_ne!(BlobRef::for_bytes(b"a"), BlobRef::for_bytes(b"b"));
    }
}
