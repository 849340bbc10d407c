//! LogicAuditor: checks that the conclusion is entailed by the premises.
//!
//! The claim chain is formalized into typed constraints, lowered to SMT
//! terms, and discharged in two steps. First the premises alone: `unsat`
//! means they contradict each other. Then premises plus the negated
//! conclusion: `unsat` means the conclusion follows, `sat` yields a
//! counter-example. Solver `unknown`, solver errors, timeouts and
//! unusable formalizations are all `Indeterminate`, never a guess.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use trusttable_smt::{KillHandle, ProcessSolver, SatResult, SmtSolver, SolverError, Z3Solver};

use crate::claims::ClaimChain;
use crate::config::{SolverBackend, SolverConfig};
use crate::error::Result;
use crate::execution::ModelGate;
use crate::formal::{encode, Encoding, Formalization, FormalizationError};
use crate::metrics::METRICS;
use crate::obs;
use crate::prompts;
use crate::table::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicStatus {
    Valid,
    Invalid,
    InconsistentPremises,
    Indeterminate,
}

impl std::fmt::Display for LogicStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogicStatus::Valid => "valid",
            LogicStatus::Invalid => "invalid",
            LogicStatus::InconsistentPremises => "inconsistent_premises",
            LogicStatus::Indeterminate => "indeterminate",
        };
        f.write_str(s)
    }
}

/// Value the premises force on the conclusion's target variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedValue {
    pub target: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicVerdict {
    pub status: LogicStatus,
    pub formalization: Option<Formalization>,
    /// Premises as SMT-LIB assertions.
    pub constraints: Vec<String>,
    pub conclusion: Option<String>,
    /// Assignment satisfying the premises but not the conclusion.
    pub counterexample: Option<BTreeMap<String, Value>>,
    /// Only set when the premises determine the target uniquely.
    pub computed: Option<ComputedValue>,
    pub reason: Option<String>,
}

impl LogicVerdict {
    fn indeterminate(formalization: Option<Formalization>, reason: String) -> Self {
        METRICS.inc_solver_indeterminates();
        obs::emit_solver_indeterminate(&reason);
        Self {
            status: LogicStatus::Indeterminate,
            formalization,
            constraints: Vec::new(),
            conclusion: None,
            counterexample: None,
            computed: None,
            reason: Some(reason),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status == LogicStatus::Valid
    }
}

enum Discharge {
    Inconsistent,
    Unknown(String),
    Valid {
        computed: Option<Value>,
    },
    Invalid {
        computed: Option<Value>,
        counterexample: BTreeMap<String, Value>,
    },
}

/// Kill handle of the external solver serving the current check, if any.
type KillSlot = Arc<Mutex<Option<KillHandle>>>;

pub struct LogicAuditor {
    solver: SolverConfig,
    /// Relative tolerance for numeric conclusions.
    tolerance: f64,
}

impl LogicAuditor {
    pub fn new(solver: SolverConfig, tolerance: f64) -> Self {
        Self { solver, tolerance }
    }

    /// Formalize `chain` with the model and check it.
    pub async fn audit(
        &self,
        gate: &ModelGate,
        question: &str,
        chain: &ClaimChain,
        answer: &str,
    ) -> Result<LogicVerdict> {
        let request = prompts::formalize(question, chain, answer);
        let parse = |text: &str| -> std::result::Result<Formalization, FormalizationError> {
            let formalization = Formalization::parse(text)?;
            formalization.validate(chain)?;
            encode(&formalization, answer, self.tolerance)?;
            Ok(formalization)
        };
        match gate.complete_parsed(&request, parse).await? {
            Ok(formalization) => Ok(self.check(formalization, answer).await),
            Err(malformed) => Ok(LogicVerdict::indeterminate(
                None,
                format!("no usable formalization: {}", malformed.error),
            )),
        }
    }

    /// Discharge an already formalized chain.
    pub async fn check(&self, formalization: Formalization, answer: &str) -> LogicVerdict {
        let encoding = match encode(&formalization, answer, self.tolerance) {
            Ok(encoding) => encoding,
            Err(err) => {
                return LogicVerdict::indeterminate(Some(formalization), err.to_string());
            }
        };
        if let Some(raw) = &encoding.unreadable_conclusion {
            tracing::debug!(value = %raw, "conclusion value unreadable as target kind");
        }

        let timed_out = || format!("solver timed out after {} ms", self.solver.timeout_ms);
        if self.solver.timeout_ms == 0 {
            return LogicVerdict::indeterminate(Some(formalization), timed_out());
        }

        let config = self.solver.clone();
        let task_encoding = encoding.clone();
        let kill_slot = KillSlot::default();
        let task_slot = Arc::clone(&kill_slot);
        let handle =
            tokio::task::spawn_blocking(move || discharge(&task_encoding, &config, &task_slot));
        let outcome = match tokio::time::timeout(self.solver.timeout(), handle).await {
            Ok(Ok(Ok(outcome))) => outcome,
            Ok(Ok(Err(err))) => Discharge::Unknown(format!("solver error: {err}")),
            Ok(Err(join)) => Discharge::Unknown(format!("solver task failed: {join}")),
            Err(_elapsed) => {
                // Frees the blocking thread waiting on the solver's reply.
                if let Some(kill) = take_kill_handle(&kill_slot) {
                    kill.kill();
                }
                Discharge::Unknown(timed_out())
            }
        };

        let computed_for = |value: Option<Value>| {
            encoding
                .target
                .clone()
                .zip(value)
                .map(|(target, value)| ComputedValue { target, value })
        };
        let (status, counterexample, computed, reason) = match outcome {
            Discharge::Unknown(reason) => {
                return LogicVerdict::indeterminate(Some(formalization), reason);
            }
            Discharge::Inconsistent => (
                LogicStatus::InconsistentPremises,
                None,
                None,
                Some("the premises contradict each other".to_string()),
            ),
            Discharge::Valid { computed } => (LogicStatus::Valid, None, computed_for(computed), None),
            Discharge::Invalid {
                computed,
                counterexample,
            } => (
                LogicStatus::Invalid,
                Some(counterexample),
                computed_for(computed),
                encoding
                    .unreadable_conclusion
                    .as_ref()
                    .map(|raw| format!("conclusion value '{raw}' does not fit the target")),
            ),
        };
        tracing::debug!(status = %status, premises = encoding.premises.len(), "logic checked");

        LogicVerdict {
            status,
            constraints: encoding.smtlib_premises(),
            conclusion: Some(encoding.smtlib_conclusion()),
            formalization: Some(formalization),
            counterexample,
            computed,
            reason,
        }
    }
}

fn take_kill_handle(slot: &KillSlot) -> Option<KillHandle> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// Built on the thread that uses it; z3 objects cannot cross threads.
fn build_solver(
    config: &SolverConfig,
    kill_slot: &KillSlot,
) -> std::result::Result<Box<dyn SmtSolver>, SolverError> {
    match &config.backend {
        SolverBackend::Z3 => Ok(Box::new(Z3Solver::with_timeout(config.timeout()))),
        SolverBackend::Process { program, args } => {
            let solver = ProcessSolver::spawn(program, args)?.with_timeout(config.timeout())?;
            *kill_slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(solver.kill_handle());
            Ok(Box::new(solver))
        }
    }
}

fn discharge(
    encoding: &Encoding,
    config: &SolverConfig,
    kill_slot: &KillSlot,
) -> std::result::Result<Discharge, SolverError> {
    let mut solver = build_solver(config, kill_slot)?;
    for (name, sort) in &encoding.declarations {
        solver.declare_var(name, sort)?;
    }
    for (_, premise) in &encoding.premises {
        solver.assert(premise)?;
    }
    let vars = encoding.user_vars();

    let witness = match solver.check_sat_with_model(&vars)? {
        (SatResult::Unsat, _) => return Ok(Discharge::Inconsistent),
        (SatResult::Unknown(reason), _) => return Ok(Discharge::Unknown(reason)),
        (SatResult::Sat, witness) => witness,
    };

    // The witness value counts as computed only if no other value is possible.
    let mut computed = None;
    if let Some(model) = &witness {
        if let Some(pin) = encoding.target_pin(model) {
            solver.push()?;
            solver.assert(&pin.not())?;
            let unique = matches!(solver.check_sat()?, SatResult::Unsat);
            solver.pop()?;
            if unique {
                computed = encoding.target_value(model);
            }
        }
    }

    solver.push()?;
    solver.assert(&encoding.conclusion.clone().not())?;
    let negated = solver.check_sat_with_model(&vars)?;
    solver.pop()?;
    Ok(match negated {
        (SatResult::Unsat, _) => Discharge::Valid { computed },
        (SatResult::Sat, model) => Discharge::Invalid {
            computed,
            counterexample: model.map(|m| encoding.decode(&m)).unwrap_or_default(),
        },
        (SatResult::Unknown(reason), _) => Discharge::Unknown(reason),
    })
}
