//! Structured lifecycle events for sample audits.
//!
//! Every audit of a sample runs inside a `trusttable.audit` span carrying
//! its `sample_id`; the `emit_*` functions log the lifecycle events with
//! an `event` field so they can be filtered in JSON logs.

use tracing::{info, warn, Span};

use crate::verdict::Verdict;

/// Span tagging everything logged while auditing one sample.
///
/// Use with `tracing::Instrument` on async work.
pub fn audit_span(sample_id: &str) -> Span {
    tracing::info_span!("trusttable.audit", sample_id = %sample_id)
}

/// RAII guard that enters the audit span in synchronous code.
pub struct AuditSpan {
    _span: tracing::span::EnteredSpan,
}

impl AuditSpan {
    pub fn enter(sample_id: &str) -> Self {
        Self {
            _span: audit_span(sample_id).entered(),
        }
    }
}

pub fn emit_audit_started(sample_id: &str, attempt: u32) {
    info!(event = "audit.started", sample_id = %sample_id, attempt = attempt);
}

pub fn emit_audit_finished(sample_id: &str, attempt: u32, claims: usize, duration_ms: u64) {
    info!(
        event = "audit.finished",
        sample_id = %sample_id,
        attempt = attempt,
        claims = claims,
        duration_ms = duration_ms,
    );
}

pub fn emit_verdict(sample_id: &str, attempt: u32, verdict: &Verdict) {
    info!(
        event = "verdict.emitted",
        sample_id = %sample_id,
        attempt = attempt,
        error_type = %verdict.error_type,
        indeterminate = verdict.indeterminate,
        findings = verdict.evidence.findings.len(),
    );
}

pub fn emit_refinement_attempt(sample_id: &str, attempt: u32, max_attempts: u32) {
    info!(
        event = "refinement.attempt",
        sample_id = %sample_id,
        attempt = attempt,
        max_attempts = max_attempts,
    );
}

/// Refined trace that could not be decomposed; the attempt counts as rejected.
pub fn emit_attempt_undecomposable(sample_id: &str, attempt: u32, error: &dyn std::fmt::Display) {
    warn!(
        event = "refinement.undecomposable",
        sample_id = %sample_id,
        attempt = attempt,
        error = %error,
    );
}

pub fn emit_solver_indeterminate(reason: &str) {
    warn!(event = "solver.indeterminate", reason = %reason);
}

/// Sample excluded from the run (warning level).
pub fn emit_sample_errored(sample_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "sample.errored", sample_id = %sample_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_span_enter_and_events() {
        let _span = AuditSpan::enter("sample-1");
        emit_audit_started("sample-1", 0);
        emit_refinement_attempt("sample-1", 1, 3);
        emit_attempt_undecomposable("sample-1", 2, &"missing conclusion");
        emit_sample_errored("sample-1", &"model unavailable");
    }
}
