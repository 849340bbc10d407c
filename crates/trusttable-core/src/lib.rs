//! TrustTable core library.
//!
//! Audits whether a reasoning trace over a table is faithful: every cited
//! fact grounded in the table, the conclusion entailed by the premises,
//! and the stated answer equal to what the reasoning computes.

pub mod artifacts;
pub mod batch;
pub mod claims;
pub mod config;
pub mod consistency;
pub mod decomposer;
pub mod digest;
pub mod error;
pub mod execution;
pub mod fact_checker;
pub mod formal;
pub mod logic_auditor;
pub mod metrics;
pub mod obs;
pub mod pipeline;
pub mod prompts;
pub mod query;
pub mod refine;
pub mod summary;
pub mod table;
pub mod telemetry;
pub mod verdict;

pub use artifacts::{read_sample_artifact, write_run_summary, write_sample_artifact};
pub use batch::audit_batch;
pub use claims::{AtomicClaim, ClaimChain, ClaimKind, DecompositionError, ReasoningTrace, Sample};
pub use config::{
    AuditConfig, BatchConfig, CacheConfig, ConsistencyConfig, IndeterminatePolicy,
    ModelCallConfig, QueryLimits, RefinementPolicy, SolverBackend, SolverConfig, VerdictConfig,
};
pub use consistency::{check_consistency, ConsistencyStatus, ConsistencyVerdict};
pub use digest::ContentDigest;
pub use error::{AuditError, Result};
pub use execution::{call_model, CircuitBreaker, MalformedOutput, ModelGate};
pub use fact_checker::{FactChecker, GroundingVerdict};
pub use logic_auditor::{ComputedValue, LogicAuditor, LogicStatus, LogicVerdict};
pub use metrics::METRICS;
pub use pipeline::{AuditReport, Auditor};
pub use refine::{
    audit_sample, extract_answer, RefinementAttempt, RefinementState, SampleOutcome, SampleRecord,
};
pub use summary::RunSummary;
pub use table::{Column, ColumnKind, RawTable, SchemaSnapshot, Table, TableError, Value};
pub use telemetry::init_tracing;
pub use verdict::{aggregate, AuditModule, ErrorType, EvidenceReport, Finding, Verdict};
