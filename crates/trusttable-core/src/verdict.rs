//! VerdictAggregator: one error type per audit, with evidence from every
//! module that failed.
//!
//! Precedence is fixed: an ungrounded claim (Type3) outranks a logic
//! failure (Type2), which outranks an answer mismatch (Type4). The error
//! type names the highest-ranked failure; the evidence lists all of them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::IndeterminatePolicy;
use crate::consistency::{ConsistencyStatus, ConsistencyVerdict};
use crate::fact_checker::GroundingVerdict;
use crate::logic_auditor::{LogicStatus, LogicVerdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Faithful,
    /// The conclusion does not follow from the premises.
    Type2Spurious,
    /// A claim cites data the table does not contain.
    Type3Hallucination,
    /// The stated answer disagrees with the computed one.
    Type4Inconsistent,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorType::Faithful => "faithful",
            ErrorType::Type2Spurious => "type2_spurious",
            ErrorType::Type3Hallucination => "type3_hallucination",
            ErrorType::Type4Inconsistent => "type4_inconsistent",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditModule {
    /// The answer could not be split into checkable claims.
    Decomposer,
    FactChecker,
    LogicAuditor,
    ConsistencyMonitor,
}

impl fmt::Display for AuditModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditModule::Decomposer => "decomposer",
            AuditModule::FactChecker => "fact_checker",
            AuditModule::LogicAuditor => "logic_auditor",
            AuditModule::ConsistencyMonitor => "consistency_monitor",
        };
        f.write_str(s)
    }
}

/// One failed check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub module: AuditModule,
    /// Claim step the failure is attributed to, if any.
    pub step: Option<u32>,
    pub kind: String,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceReport {
    pub findings: Vec<Finding>,
}

impl EvidenceReport {
    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    /// Highest-precedence module with a finding.
    pub fn primary_module(&self) -> Option<AuditModule> {
        self.findings.iter().map(|f| f.module).min()
    }

    /// Human-readable evidence, one finding per line, used as refinement
    /// feedback.
    pub fn render(&self) -> String {
        if self.findings.is_empty() {
            return "All checks passed.".to_string();
        }
        self.findings
            .iter()
            .map(|f| match f.step {
                Some(step) => format!("- [{}] step {step} ({}): {}", f.module, f.kind, f.detail),
                None => format!("- [{}] ({}): {}", f.module, f.kind, f.detail),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub error_type: ErrorType,
    /// Set when the logic check could not be decided.
    pub indeterminate: bool,
    pub evidence: EvidenceReport,
}

impl Verdict {
    /// An undecided logic check never counts as faithful, whatever error
    /// type the lenient policy reports.
    pub fn is_faithful(&self) -> bool {
        self.error_type == ErrorType::Faithful && !self.indeterminate
    }
}

pub fn aggregate(
    groundings: &[GroundingVerdict],
    logic: &LogicVerdict,
    consistency: &ConsistencyVerdict,
    policy: IndeterminatePolicy,
) -> Verdict {
    let mut findings = Vec::new();

    for g in groundings.iter().filter(|g| !g.grounded) {
        findings.push(Finding {
            module: AuditModule::FactChecker,
            step: Some(g.step),
            kind: if g.error.is_some() {
                "unverifiable".to_string()
            } else {
                "ungrounded".to_string()
            },
            detail: format!("\"{}\": {}", g.claim, g.describe_failure()),
        });
    }

    let conclusion_step = logic
        .formalization
        .as_ref()
        .map(|f| f.conclusion.step());
    match logic.status {
        LogicStatus::Valid => {}
        LogicStatus::Invalid => {
            let detail = match &logic.counterexample {
                Some(cex) if !cex.is_empty() => {
                    let assignment = cex
                        .iter()
                        .map(|(name, value)| format!("{name} = {value}"))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("the conclusion does not follow; counter-example: {assignment}")
                }
                _ => "the conclusion does not follow from the premises".to_string(),
            };
            let detail = match &logic.reason {
                Some(reason) => format!("{detail} ({reason})"),
                None => detail,
            };
            findings.push(Finding {
                module: AuditModule::LogicAuditor,
                step: conclusion_step,
                kind: "not_entailed".to_string(),
                detail,
            });
        }
        LogicStatus::InconsistentPremises => findings.push(Finding {
            module: AuditModule::LogicAuditor,
            step: None,
            kind: "inconsistent_premises".to_string(),
            detail: "the premises contradict each other, so they prove nothing".to_string(),
        }),
        LogicStatus::Indeterminate => findings.push(Finding {
            module: AuditModule::LogicAuditor,
            step: conclusion_step,
            kind: "indeterminate".to_string(),
            detail: format!(
                "entailment could not be decided: {}",
                logic.reason.as_deref().unwrap_or("unknown")
            ),
        }),
    }

    if consistency.status == ConsistencyStatus::Mismatch {
        let computed = consistency
            .computed
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        findings.push(Finding {
            module: AuditModule::ConsistencyMonitor,
            step: None,
            kind: "answer_mismatch".to_string(),
            detail: format!(
                "the reasoning computes {computed} but the stated answer is \"{}\"",
                consistency.stated
            ),
        });
    }

    let indeterminate = logic.status == LogicStatus::Indeterminate;
    let logic_failed = matches!(
        logic.status,
        LogicStatus::Invalid | LogicStatus::InconsistentPremises
    ) || (indeterminate && policy == IndeterminatePolicy::Conservative);

    let error_type = if groundings.iter().any(|g| !g.grounded) {
        ErrorType::Type3Hallucination
    } else if logic_failed {
        ErrorType::Type2Spurious
    } else if consistency.status == ConsistencyStatus::Mismatch {
        ErrorType::Type4Inconsistent
    } else {
        ErrorType::Faithful
    };

    Verdict {
        error_type,
        indeterminate,
        evidence: EvidenceReport { findings },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::logic_auditor::ComputedValue;
    use crate::table::Value;

    fn grounded(step: u32, ok: bool) -> GroundingVerdict {
        GroundingVerdict {
            step,
            claim: format!("claim {step}"),
            grounded: ok,
            program: None,
            result: None,
            missing: if ok { vec![] } else { vec![Value::text("Ajax")] },
            found: vec![],
            error: None,
        }
    }

    fn logic(status: LogicStatus) -> LogicVerdict {
        LogicVerdict {
            status,
            formalization: None,
            constraints: vec![],
            conclusion: None,
            counterexample: (status == LogicStatus::Invalid)
                .then(|| BTreeMap::from([("profit".to_string(), Value::Number(60.0))])),
            computed: Some(ComputedValue {
                target: "profit".into(),
                value: Value::Number(60.0),
            }),
            reason: (status == LogicStatus::Indeterminate).then(|| "timeout".to_string()),
        }
    }

    fn consistency(status: ConsistencyStatus) -> ConsistencyVerdict {
        ConsistencyVerdict {
            status,
            computed: Some(Value::Number(60.0)),
            stated: "61".into(),
        }
    }

    #[test]
    fn all_checks_passing_is_faithful() {
        let v = aggregate(
            &[grounded(1, true)],
            &logic(LogicStatus::Valid),
            &consistency(ConsistencyStatus::Match),
            IndeterminatePolicy::Conservative,
        );
        assert!(v.is_faithful());
        assert!(v.evidence.is_empty());
        assert_eq!(v.evidence.primary_module(), None);
    }

    #[test]
    fn hallucination_outranks_logic_and_mismatch_but_keeps_all_evidence() {
        let v = aggregate(
            &[grounded(1, false), grounded(2, true)],
            &logic(LogicStatus::Invalid),
            &consistency(ConsistencyStatus::Mismatch),
            IndeterminatePolicy::Conservative,
        );
        assert_eq!(v.error_type, ErrorType::Type3Hallucination);
        let modules: Vec<_> = v.evidence.findings.iter().map(|f| f.module).collect();
        assert_eq!(
            modules,
            vec![
                AuditModule::FactChecker,
                AuditModule::LogicAuditor,
                AuditModule::ConsistencyMonitor
            ]
        );
        assert_eq!(v.evidence.primary_module(), Some(AuditModule::FactChecker));
        let rendered = v.evidence.render();
        assert!(rendered.contains("'Ajax' not found in the table"));
        assert!(rendered.contains("profit = 60"));
    }

    #[test]
    fn logic_failure_outranks_mismatch() {
        let v = aggregate(
            &[],
            &logic(LogicStatus::InconsistentPremises),
            &consistency(ConsistencyStatus::Mismatch),
            IndeterminatePolicy::Conservative,
        );
        assert_eq!(v.error_type, ErrorType::Type2Spurious);
        assert_eq!(v.evidence.findings[0].kind, "inconsistent_premises");
    }

    #[test]
    fn mismatch_alone_is_type4() {
        let v = aggregate(
            &[grounded(1, true)],
            &logic(LogicStatus::Valid),
            &consistency(ConsistencyStatus::Mismatch),
            IndeterminatePolicy::Conservative,
        );
        assert_eq!(v.error_type, ErrorType::Type4Inconsistent);
        assert_eq!(v.evidence.primary_module(), Some(AuditModule::ConsistencyMonitor));
    }

    #[test]
    fn lenient_indeterminate_still_reports_lower_ranked_errors() {
        let v = aggregate(
            &[grounded(1, true)],
            &logic(LogicStatus::Indeterminate),
            &consistency(ConsistencyStatus::Mismatch),
            IndeterminatePolicy::Lenient,
        );
        assert_eq!(v.error_type, ErrorType::Type4Inconsistent);
        assert!(v.indeterminate);
        assert!(!v.is_faithful());
    }

    #[test]
    fn indeterminate_follows_policy() {
        let conservative = aggregate(
            &[],
            &logic(LogicStatus::Indeterminate),
            &consistency(ConsistencyStatus::NotApplicable),
            IndeterminatePolicy::Conservative,
        );
        assert_eq!(conservative.error_type, ErrorType::Type2Spurious);
        assert!(conservative.indeterminate);

        let lenient = aggregate(
            &[],
            &logic(LogicStatus::Indeterminate),
            &consistency(ConsistencyStatus::NotApplicable),
            IndeterminatePolicy::Lenient,
        );
        assert_eq!(lenient.error_type, ErrorType::Faithful);
        assert!(lenient.indeterminate);
        assert!(!lenient.is_faithful());
        assert_eq!(lenient.evidence.findings.len(), 1);
    }
}
