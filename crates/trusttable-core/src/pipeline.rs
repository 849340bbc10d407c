//! One audit pass: decompose, check grounding and logic concurrently,
//! compare answers, aggregate.
//!
//! `Auditor::audit` has no knowledge of refinement; the refinement loop
//! calls it once per trace.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use trusttable_llm::LanguageModel;

use crate::claims::{ClaimChain, ReasoningTrace};
use crate::config::AuditConfig;
use crate::consistency::{check_consistency, ConsistencyVerdict};
use crate::decomposer;
use crate::error::Result;
use crate::execution::ModelGate;
use crate::fact_checker::{FactChecker, GroundingVerdict};
use crate::logic_auditor::{LogicAuditor, LogicVerdict};
use crate::metrics::METRICS;
use crate::table::Table;
use crate::verdict::{aggregate, Verdict};

/// Everything one audit pass produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub claims: ClaimChain,
    pub groundings: Vec<GroundingVerdict>,
    pub logic: LogicVerdict,
    pub consistency: ConsistencyVerdict,
    pub verdict: Verdict,
    pub duration_ms: u64,
}

pub struct Auditor {
    model: Arc<dyn LanguageModel>,
    config: AuditConfig,
    fact_checker: FactChecker,
    logic_auditor: LogicAuditor,
}

impl Auditor {
    pub fn new(model: Arc<dyn LanguageModel>, config: AuditConfig) -> Self {
        let fact_checker = FactChecker::new(config.query.clone(), config.cache.synthesis_capacity);
        let logic_auditor =
            LogicAuditor::new(config.solver.clone(), config.consistency.numeric_tolerance);
        Self {
            model,
            config,
            fact_checker,
            logic_auditor,
        }
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    pub fn fact_checker(&self) -> &FactChecker {
        &self.fact_checker
    }

    /// A fresh model gate; one per sample so breakers are not shared.
    pub fn gate(&self) -> ModelGate {
        ModelGate::new(Arc::clone(&self.model), self.config.model.clone())
    }

    pub async fn audit(
        &self,
        gate: &ModelGate,
        table: &Arc<Table>,
        question: &str,
        trace: &ReasoningTrace,
    ) -> Result<AuditReport> {
        let started = Instant::now();
        METRICS.inc_audits();

        let claims = decomposer::decompose(gate, question, trace).await?;
        let (groundings, logic) = tokio::join!(
            self.fact_checker.check(gate, table, &claims),
            self.logic_auditor.audit(gate, question, &claims, &trace.answer),
        );
        let (groundings, logic) = (groundings?, logic?);

        let consistency = check_consistency(
            logic.computed.as_ref(),
            &trace.answer,
            self.config.consistency.numeric_tolerance,
        );
        let verdict = aggregate(
            &groundings,
            &logic,
            &consistency,
            self.config.verdict.indeterminate_policy,
        );

        Ok(AuditReport {
            claims,
            groundings,
            logic,
            consistency,
            verdict,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }
}
