//! FactChecker: grounds table-referencing claims with synthesized programs.
//!
//! For each lookup, filter or aggregate claim the model writes a
//! [`GroundingProgram`], which runs in the query sandbox against the
//! table. A program that cannot be synthesized or fails to execute leaves
//! the claim ungrounded; nothing passes unverified.
//!
//! Synthesis is memoised by the digest of (table schema snapshot, claim
//! text), so identical inputs reuse one program and get identical verdicts.

use std::sync::Arc;

use moka::sync::Cache;
use serde::{Deserialize, Serialize};

use crate::claims::{AtomicClaim, ClaimChain};
use crate::config::QueryLimits;
use crate::digest::ContentDigest;
use crate::error::Result;
use crate::execution::ModelGate;
use crate::metrics::METRICS;
use crate::prompts;
use crate::query::{execute_program, GroundingProgram, QueryResult};
use crate::table::{Table, Value};

/// Per-claim grounding outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundingVerdict {
    pub step: u32,
    pub claim: String,
    pub grounded: bool,
    /// The synthesized program, when synthesis succeeded.
    pub program: Option<GroundingProgram>,
    pub result: Option<QueryResult>,
    /// Entities or values the claim asserts that the table lacks.
    pub missing: Vec<Value>,
    pub found: Vec<Value>,
    /// Synthesis or execution failure.
    pub error: Option<String>,
}

impl GroundingVerdict {
    fn failed(claim: &AtomicClaim, program: Option<GroundingProgram>, error: String) -> Self {
        Self {
            step: claim.index,
            claim: claim.text.clone(),
            grounded: false,
            program,
            result: None,
            missing: Vec::new(),
            found: Vec::new(),
            error: Some(error),
        }
    }

    /// One-line explanation of why the claim is ungrounded.
    pub fn describe_failure(&self) -> String {
        let fmt_values = |values: &[Value]| {
            values
                .iter()
                .map(|v| format!("'{v}'"))
                .collect::<Vec<_>>()
                .join(", ")
        };
        if let Some(error) = &self.error {
            return format!("could not verify: {error}");
        }
        match (self.missing.is_empty(), self.found.is_empty()) {
            (false, false) => format!(
                "{} not found in the table (found {})",
                fmt_values(&self.missing),
                fmt_values(&self.found)
            ),
            (false, true) => format!("{} not found in the table", fmt_values(&self.missing)),
            (true, false) => format!("table shows {}", fmt_values(&self.found)),
            (true, true) => "the table does not support this claim".to_string(),
        }
    }
}

pub struct FactChecker {
    cache: Cache<ContentDigest, GroundingProgram>,
    limits: QueryLimits,
}

impl FactChecker {
    pub fn new(limits: QueryLimits, cache_capacity: u64) -> Self {
        Self {
            cache: Cache::new(cache_capacity),
            limits,
        }
    }

    /// Synthesis cache key for a claim against a table.
    pub fn cache_key(table: &Table, claim_text: &str) -> ContentDigest {
        let schema = table.schema_digest();
        ContentDigest::from_parts(&[schema.as_str().as_bytes(), claim_text.trim().as_bytes()])
    }

    /// Ground every table-referencing claim of the chain, in order.
    ///
    /// A chain without such claims yields no verdicts.
    pub async fn check(
        &self,
        gate: &ModelGate,
        table: &Arc<Table>,
        chain: &ClaimChain,
    ) -> Result<Vec<GroundingVerdict>> {
        let mut verdicts = Vec::new();
        for claim in chain.table_claims() {
            verdicts.push(self.check_claim(gate, table, claim).await?);
        }
        Ok(verdicts)
    }

    pub async fn check_claim(
        &self,
        gate: &ModelGate,
        table: &Arc<Table>,
        claim: &AtomicClaim,
    ) -> Result<GroundingVerdict> {
        let key = Self::cache_key(table, &claim.text);
        let program = match self.cache.get(&key) {
            Some(program) => {
                METRICS.inc_cache_hits();
                tracing::debug!(step = claim.index, key = %key.short(), "synthesis cache hit");
                program
            }
            None => {
                let request = prompts::synthesize_query(&table.schema_snapshot(), claim.text.trim());
                match gate.complete_parsed(&request, GroundingProgram::parse).await? {
                    Ok(program) => {
                        self.cache.insert(key, program.clone());
                        program
                    }
                    Err(malformed) => {
                        return Ok(GroundingVerdict::failed(
                            claim,
                            None,
                            format!("no usable program: {}", malformed.error),
                        ));
                    }
                }
            }
        };

        match execute_program(Arc::clone(table), program.clone(), self.limits.clone()).await {
            Ok(exec) => {
                tracing::debug!(step = claim.index, grounded = exec.grounded, "claim checked");
                Ok(GroundingVerdict {
                    step: claim.index,
                    claim: claim.text.clone(),
                    grounded: exec.grounded,
                    program: Some(program),
                    result: Some(exec.result),
                    missing: exec.missing,
                    found: exec.found,
                    error: None,
                })
            }
            Err(err) => {
                METRICS.inc_execution_failures();
                tracing::warn!(step = claim.index, error = %err, "grounding program failed");
                Ok(GroundingVerdict::failed(
                    claim,
                    Some(program),
                    format!("execution error: {err}"),
                ))
            }
        }
    }

    /// Programs currently memoised.
    pub fn cached_programs(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}
