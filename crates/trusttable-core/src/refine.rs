//! RefinementLoop: per-sample state machine driven only by audit evidence.
//!
//! ```text
//! Pending --audit--> Faithful                      (terminal)
//!         \--------> Rejected --refine+audit--> Faithful | Rejected
//!                            \-- budget spent --> Exhausted (terminal)
//! ```
//!
//! With a budget of N attempts a sample is audited at most N+1 times.
//! A refined trace that cannot be decomposed is a rejected attempt: it
//! spends budget and its decomposition error becomes the next attempt's
//! evidence. Every other [`AuditError`], and any error in the initial
//! audit, ends the sample as [`SampleOutcome::Errored`]; the caller keeps
//! going.

use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::claims::{ReasoningTrace, Sample};
use crate::error::{AuditError, Result};
use crate::execution::ModelGate;
use crate::metrics::METRICS;
use crate::obs;
use crate::pipeline::{AuditReport, Auditor};
use crate::prompts;
use crate::table::Table;
use crate::verdict::{AuditModule, ErrorType, EvidenceReport, Finding, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinementState {
    Pending,
    Faithful,
    Rejected,
    Exhausted,
}

impl RefinementState {
    /// Transition after an audit, given how many refinement attempts have
    /// been spent so far. Terminal states never change.
    pub fn after_audit(self, faithful: bool, attempts_used: u32, budget: u32) -> Self {
        match self {
            RefinementState::Faithful | RefinementState::Exhausted => self,
            RefinementState::Pending | RefinementState::Rejected => {
                if faithful {
                    RefinementState::Faithful
                } else if attempts_used < budget {
                    RefinementState::Rejected
                } else {
                    RefinementState::Exhausted
                }
            }
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RefinementState::Faithful | RefinementState::Exhausted)
    }
}

impl std::fmt::Display for RefinementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RefinementState::Pending => "pending",
            RefinementState::Faithful => "faithful",
            RefinementState::Rejected => "rejected",
            RefinementState::Exhausted => "exhausted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementAttempt {
    pub attempt: u32,
    /// Evidence this attempt responded to.
    pub evidence: EvidenceReport,
    pub trace: ReasoningTrace,
    /// Absent when the refined trace could not be decomposed.
    pub report: Option<AuditReport>,
    pub error: Option<String>,
}

impl RefinementAttempt {
    /// Evidence handed to the next attempt.
    fn feedback(&self) -> EvidenceReport {
        match (&self.report, &self.error) {
            (Some(report), _) => report.verdict.evidence.clone(),
            (None, error) => EvidenceReport {
                findings: vec![Finding {
                    module: AuditModule::Decomposer,
                    step: None,
                    kind: "undecomposable".to_string(),
                    detail: error.clone().unwrap_or_default(),
                }],
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub sample_id: String,
    pub question: String,
    pub state: RefinementState,
    pub initial_trace: ReasoningTrace,
    /// The initial trace was generated rather than supplied.
    pub trace_generated: bool,
    pub initial: AuditReport,
    pub attempts: Vec<RefinementAttempt>,
    pub audits: u32,
    pub evaluated_at: DateTime<Utc>,
}

impl SampleRecord {
    pub fn initial_error_type(&self) -> ErrorType {
        self.initial.verdict.error_type
    }

    /// Verdict of the last audit that completed.
    pub fn final_verdict(&self) -> &Verdict {
        self.attempts
            .iter()
            .rev()
            .find_map(|a| a.report.as_ref())
            .map_or(&self.initial.verdict, |r| &r.verdict)
    }

    pub fn final_trace(&self) -> &ReasoningTrace {
        self.attempts
            .last()
            .map_or(&self.initial_trace, |a| &a.trace)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SampleOutcome {
    Completed(Box<SampleRecord>),
    /// Excluded from the run metrics.
    Errored { sample_id: String, reason: String },
}

impl SampleOutcome {
    pub fn sample_id(&self) -> &str {
        match self {
            SampleOutcome::Completed(record) => &record.sample_id,
            SampleOutcome::Errored { sample_id, .. } => sample_id,
        }
    }

    pub fn record(&self) -> Option<&SampleRecord> {
        match self {
            SampleOutcome::Completed(record) => Some(record.as_ref()),
            SampleOutcome::Errored { .. } => None,
        }
    }
}

/// Audit one sample and refine it until faithful or out of budget.
pub async fn audit_sample(auditor: &Auditor, sample: Sample) -> SampleOutcome {
    let sample_id = sample.id.clone();
    let span = obs::audit_span(&sample_id);
    match run_sample(auditor, sample).instrument(span).await {
        Ok(record) => SampleOutcome::Completed(Box::new(record)),
        Err(err) => {
            METRICS.inc_samples_errored();
            obs::emit_sample_errored(&sample_id, &err);
            SampleOutcome::Errored {
                sample_id,
                reason: err.to_string(),
            }
        }
    }
}

async fn run_sample(auditor: &Auditor, sample: Sample) -> Result<SampleRecord> {
    let Sample {
        id,
        question,
        table,
        trace,
    } = sample;
    let table = Arc::new(table.into_table()?);
    let gate = auditor.gate();
    let budget = auditor.config().refinement.budget();

    let (initial_trace, trace_generated) = match trace {
        Some(trace) => (trace, false),
        None => {
            let request = prompts::generate_trace(&question, &table);
            (trace_from_reply(&gate.complete(&request).await?), true)
        }
    };

    let initial = audit_pass(auditor, &gate, &table, &id, &question, &initial_trace, 0).await?;
    let mut state = RefinementState::Pending.after_audit(initial.verdict.is_faithful(), 0, budget);
    let mut attempts: Vec<RefinementAttempt> = Vec::new();

    while state == RefinementState::Rejected {
        let attempt = attempts.len() as u32 + 1;
        obs::emit_refinement_attempt(&id, attempt, budget);
        let (prior_trace, evidence) = match attempts.last() {
            Some(last) => (&last.trace, last.feedback()),
            None => (&initial_trace, initial.verdict.evidence.clone()),
        };
        let trace = refine_trace(&gate, &question, &table, prior_trace, &evidence).await?;
        let (report, error) =
            match audit_pass(auditor, &gate, &table, &id, &question, &trace, attempt).await {
                Ok(report) => (Some(report), None),
                Err(AuditError::Decomposition(err)) => {
                    obs::emit_attempt_undecomposable(&id, attempt, &err);
                    (None, Some(err.to_string()))
                }
                Err(err) => return Err(err),
            };
        let faithful = report.as_ref().is_some_and(|r| r.verdict.is_faithful());
        state = state.after_audit(faithful, attempt, budget);
        attempts.push(RefinementAttempt {
            attempt,
            evidence,
            trace,
            report,
            error,
        });
    }

    let completed_audits = attempts.iter().filter(|a| a.report.is_some()).count();
    Ok(SampleRecord {
        sample_id: id,
        question,
        state,
        initial_trace,
        trace_generated,
        initial,
        audits: completed_audits as u32 + 1,
        attempts,
        evaluated_at: Utc::now(),
    })
}

async fn audit_pass(
    auditor: &Auditor,
    gate: &ModelGate,
    table: &Arc<Table>,
    sample_id: &str,
    question: &str,
    trace: &ReasoningTrace,
    attempt: u32,
) -> Result<AuditReport> {
    obs::emit_audit_started(sample_id, attempt);
    let report = auditor.audit(gate, table, question, trace).await?;
    obs::emit_audit_finished(sample_id, attempt, report.claims.len(), report.duration_ms);
    obs::emit_verdict(sample_id, attempt, &report.verdict);
    Ok(report)
}

async fn refine_trace(
    gate: &ModelGate,
    question: &str,
    table: &Table,
    trace: &ReasoningTrace,
    evidence: &EvidenceReport,
) -> Result<ReasoningTrace> {
    let request = prompts::refine(question, table, trace, evidence);
    let reply = gate.complete(&request).await?;
    Ok(trace_from_reply(&reply))
}

fn trace_from_reply(reply: &str) -> ReasoningTrace {
    let reasoning = reply.trim();
    ReasoningTrace::new(reasoning, extract_answer(reasoning))
}

static ANSWER_PREFIX_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)(?:final\s+)?\banswer\b(?:\s+is)?\s*[:=]?\s*").ok());

/// Final answer of a free-text trace: the last non-empty line, after any
/// `Answer:` or `answer is` prefix.
pub fn extract_answer(text: &str) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .rev()
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    let answer = ANSWER_PREFIX_RE
        .as_ref()
        .and_then(|re| re.find_iter(line).last())
        .map_or(line, |m| &line[m.end()..]);
    answer
        .trim()
        .trim_matches('*')
        .trim_end_matches('.')
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions() {
        use RefinementState::*;
        assert_eq!(Pending.after_audit(true, 0, 3), Faithful);
        assert_eq!(Pending.after_audit(false, 0, 3), Rejected);
        assert_eq!(Pending.after_audit(false, 0, 0), Exhausted);
        assert_eq!(Rejected.after_audit(false, 3, 3), Exhausted);
        assert_eq!(Rejected.after_audit(true, 3, 3), Faithful);
        assert_eq!(Faithful.after_audit(false, 0, 3), Faithful);
        assert!(Exhausted.is_terminal());
        assert!(!Rejected.is_terminal());
    }

    #[test]
    fn answer_is_taken_from_the_last_line() {
        assert_eq!(extract_answer("Revenue max is 300.\nAnswer: 300"), "300");
        assert_eq!(extract_answer("step 1\nSo the answer is Ajax.\n\n"), "Ajax");
        assert_eq!(extract_answer("**Final Answer:** 12%"), "12%");
        assert_eq!(extract_answer("just 42"), "just 42");
        assert_eq!(extract_answer(""), "");
    }

    #[test]
    fn answer_prefix_needs_the_whole_word() {
        assert_eq!(extract_answer("Answered: 5 cities"), "Answered: 5 cities");
        let line = "Total: 12 (see the answers above)";
        assert_eq!(extract_answer(line), line);
        assert_eq!(extract_answer("My final answer is 7"), "7");
    }

    #[test]
    fn undecomposable_attempt_feeds_back_a_decomposer_finding() {
        let attempt = RefinementAttempt {
            attempt: 1,
            evidence: EvidenceReport::default(),
            trace: ReasoningTrace::new("gibberish", "gibberish"),
            report: None,
            error: Some("malformed claims: expected value".into()),
        };
        let feedback = attempt.feedback();
        assert_eq!(feedback.primary_module(), Some(AuditModule::Decomposer));
        assert_eq!(feedback.findings[0].kind, "undecomposable");
        assert!(feedback.render().contains("malformed claims"));
    }
}
