//! Audit configuration.
//!
//! Every field has a default so an empty TOML file is a valid config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AuditError, Result};

/// Top-level audit configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AuditConfig {
    pub model: ModelCallConfig,
    pub query: QueryLimits,
    pub solver: SolverConfig,
    pub consistency: ConsistencyConfig,
    pub verdict: VerdictConfig,
    pub refinement: RefinementPolicy,
    pub batch: BatchConfig,
    pub cache: CacheConfig,
}

impl AuditConfig {
    /// Parse a config from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| AuditError::Config(e.to_string()))
    }

    /// Load a config from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }
}

/// Controls applied to every language-model call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ModelCallConfig {
    /// Maximum wall-clock time for a single attempt (milliseconds).
    pub timeout_ms: u64,
    /// Maximum number of retries (0 = no retries, call once).
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries (milliseconds).
    pub backoff_base_ms: u64,
    /// Consecutive failures after which the breaker opens.
    pub breaker_threshold: u32,
    /// Re-prompts allowed when a reply does not parse.
    pub malformed_output_retries: u32,
}

impl Default for ModelCallConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            max_retries: 2,
            backoff_base_ms: 500,
            breaker_threshold: 5,
            malformed_output_retries: 2,
        }
    }
}

impl ModelCallConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Resource limits for grounding programs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct QueryLimits {
    /// Row visits allowed per program.
    pub max_steps: u64,
    pub timeout_ms: u64,
    /// Maximum nesting of query and predicate nodes.
    pub max_depth: usize,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            max_steps: 100_000,
            timeout_ms: 2_000,
            max_depth: 16,
        }
    }
}

impl QueryLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Which SMT backend discharges the formal checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SolverBackend {
    /// In-process z3 through its C API.
    #[default]
    Z3,
    /// External SMT-LIB2 solver driven over stdin/stdout.
    Process {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SolverConfig {
    /// Hard wall-clock bound on both solver checks of one audit.
    pub timeout_ms: u64,
    pub backend: SolverBackend,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            backend: SolverBackend::Z3,
        }
    }
}

impl SolverConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ConsistencyConfig {
    /// Relative tolerance for numeric answers. A stated answer is also
    /// allowed half a unit in its last written decimal place, so `33.33`
    /// matches `100/3`.
    pub numeric_tolerance: f64,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            numeric_tolerance: 1e-6,
        }
    }
}

/// How an indeterminate logic check counts toward the verdict.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IndeterminatePolicy {
    /// Treat as invalid logic (Type2), flagged indeterminate.
    #[default]
    Conservative,
    /// Report the error type the remaining checks give. The verdict stays
    /// flagged indeterminate and is never accepted as faithful.
    Lenient,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct VerdictConfig {
    pub indeterminate_policy: IndeterminatePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RefinementPolicy {
    /// Refinement attempts after the initial audit.
    pub max_attempts: u32,
    pub enabled: bool,
}

impl Default for RefinementPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            enabled: true,
        }
    }
}

impl RefinementPolicy {
    /// Attempts actually available under this policy.
    pub fn budget(&self) -> u32 {
        if self.enabled {
            self.max_attempts
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    pub max_concurrent: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_concurrent: 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Entries kept in the query-synthesis cache.
    pub synthesis_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            synthesis_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_is_default() {
        let cfg = AuditConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, AuditConfig::default());
        assert_eq!(cfg.solver.backend, SolverBackend::Z3);
        assert_eq!(cfg.verdict.indeterminate_policy, IndeterminatePolicy::Conservative);
        assert_eq!(cfg.refinement.budget(), 3);
    }

    #[test]
    fn partial_tables_keep_other_defaults() {
        let cfg = AuditConfig::from_toml_str(
            r#"
            [model]
            max_retries = 0

            [solver]
            timeout_ms = 250
            backend = { kind = "process", program = "z3", args = ["-in", "-smt2"] }

            [refinement]
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.model.max_retries, 0);
        assert_eq!(cfg.model.backoff_base_ms, 500);
        assert_eq!(cfg.solver.timeout(), Duration::from_millis(250));
        assert_eq!(
            cfg.solver.backend,
            SolverBackend::Process {
                program: "z3".into(),
                args: vec!["-in".into(), "-smt2".into()],
            }
        );
        assert_eq!(cfg.refinement.budget(), 0);
        assert_eq!(cfg.batch.max_concurrent, 4);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = AuditConfig::from_toml_str("[query]\nmax_rows = 10\n").unwrap_err();
        assert!(matches!(err, AuditError::Config(_)));
    }
}
