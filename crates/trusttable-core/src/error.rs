//! Audit error taxonomy.
//!
//! Symbolic failures (ungrounded claims, invalid logic, indeterminate
//! solver runs) are verdicts, not errors. `AuditError` covers only the
//! conditions that stop a sample from being audited at all; the batch
//! runner marks such samples `Errored` and carries on.

use trusttable_llm::PromptPurpose;

use crate::claims::DecompositionError;
use crate::table::TableError;

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("decomposition failed: {0}")]
    Decomposition(#[from] DecompositionError),

    #[error("model unavailable for {purpose} after {attempts} attempt(s): {reason}")]
    ModelUnavailable {
        purpose: PromptPurpose,
        attempts: u32,
        reason: String,
    },

    #[error("invalid table: {0}")]
    Table(#[from] TableError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for audit operations.
pub type Result<T> = std::result::Result<T, AuditError>;
