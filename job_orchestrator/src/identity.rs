//! Deterministic job fingerprints.

use crate::{OrchestratorError, Result};
use sha2::{Digest, Sha256};

/// Trim surrounding whitespace. EVM-style `0x` addresses are case-insensitive and
/// lowercased; base58 addresses are case-sensitive and left alone.
pub fn normalize_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    if trimmed.len() > 2 && (trimmed.starts_with("0x") || trimmed.starts_with("0X")) {
        trimmed.to_ascii_lowercase()
    } else {
        trimmed.to_string()
    }
}

/// Normalized, sorted, duplicate-free subject list
pub fn canonical_subjects<S: AsRef<str>>(subjects: &[S]) -> Vec<String> {
    let mut canonical: Vec<String> = subjects
        .iter()
        .map(|s| normalize_subject(s.as_ref()))
        .filter(|s| !s.is_empty())
        .collect();
    canonical.sort();
    canonical.dedup();
    canonical
}

/// `"{operation}:{sha256 hex}"` over the operation, salt and canonical subjects.
///
/// Every component is length-prefixed before hashing, so no choice of subject
/// strings can collide with a different split of the same bytes.
pub fn job_identity<S: AsRef<str>>(operation: &str, subjects: &[S], salt: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    let mut feed = |part: &str| {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    };

    feed(operation);
    feed(salt.unwrap_or(""));
    let subjects = canonical_subjects(subjects);
    for subject in &subjects {
        feed(subject);
    }

    format!("{}:{}", operation, hex::encode(hasher.finalize()))
}

/// Fails with [`OrchestratorError::IdentityMismatch`] unless both identities agree
pub fn verify_identity(dispatched: &str, recomputed: &str) -> Result<()> {
    if dispatched == recomputed {
        Ok(())
    } else {
        Err(OrchestratorError::IdentityMismatch {
            dispatched: dispatched.to_string(),
            recomputed: recomputed.to_string(),
        })
    }
}
