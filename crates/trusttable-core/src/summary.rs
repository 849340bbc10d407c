//! Run-level metrics over sample outcomes.
//!
//! VCAR is the fraction of completed samples judged faithful on the first
//! audit. CSR is the fraction of initially rejected samples that reached
//! faithful within the refinement budget. Errored samples are excluded
//! from both and listed by id.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::refine::{RefinementState, SampleOutcome};
use crate::verdict::ErrorType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub total: usize,
    pub completed: usize,
    /// Initial verdicts by error type.
    pub error_types: BTreeMap<ErrorType, usize>,
    pub faithful_initial: usize,
    pub initially_rejected: usize,
    pub corrected: usize,
    /// Refinement attempts across all completed samples.
    pub refinement_attempts: usize,
    /// Initial verdicts flagged indeterminate.
    pub indeterminate: usize,
    pub vcar: Option<f64>,
    pub csr: Option<f64>,
    pub errored: Vec<String>,
}

impl RunSummary {
    pub fn from_outcomes(outcomes: &[SampleOutcome]) -> Self {
        let mut summary = RunSummary {
            run_id: Uuid::new_v4(),
            generated_at: Utc::now(),
            total: outcomes.len(),
            completed: 0,
            error_types: BTreeMap::new(),
            faithful_initial: 0,
            initially_rejected: 0,
            corrected: 0,
            refinement_attempts: 0,
            indeterminate: 0,
            vcar: None,
            csr: None,
            errored: Vec::new(),
        };

        for outcome in outcomes {
            let record = match outcome {
                SampleOutcome::Completed(record) => record,
                SampleOutcome::Errored { sample_id, .. } => {
                    summary.errored.push(sample_id.clone());
                    continue;
                }
            };
            summary.completed += 1;
            summary.refinement_attempts += record.attempts.len();
            *summary
                .error_types
                .entry(record.initial_error_type())
                .or_default() += 1;
            if record.initial.verdict.indeterminate {
                summary.indeterminate += 1;
            }
            if record.initial.verdict.is_faithful() {
                summary.faithful_initial += 1;
            } else {
                summary.initially_rejected += 1;
                if record.state == RefinementState::Faithful {
                    summary.corrected += 1;
                }
            }
        }

        summary.vcar = ratio(summary.faithful_initial, summary.completed);
        summary.csr = ratio(summary.corrected, summary.initially_rejected);
        summary
    }
}

fn ratio(num: usize, den: usize) -> Option<f64> {
    (den > 0).then(|| num as f64 / den as f64)
}
