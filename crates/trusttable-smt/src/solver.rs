use std::collections::HashMap;

use crate::rational::{self, Rational};
use crate::sorts::SmtSort;
use crate::terms::SmtTerm;

/// Result of a satisfiability check.
#[derive(Debug, Clone, PartialEq)]
pub enum SatResult {
    Sat,
    Unsat,
    Unknown(String),
}

/// A model (variable assignments) extracted from a SAT result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Model {
    pub values: HashMap<String, ModelValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelValue {
    Int(i64),
    Real(Rational),
    Bool(bool),
}

impl std::fmt::Display for ModelValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelValue::Int(n) => write!(f, "{n}"),
            ModelValue::Real(r) => f.write_str(&rational::to_decimal_string(r)),
            ModelValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl Model {
    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.values.get(name) {
            Some(ModelValue::Int(n)) => Some(*n),
            _ => None,
        }
    }

    /// Numeric value of `name`; integers are widened to rationals.
    pub fn get_real(&self, name: &str) -> Option<Rational> {
        match self.values.get(name) {
            Some(ModelValue::Real(r)) => Some(r.clone()),
            Some(ModelValue::Int(n)) => Some(rational::from_i64(*n)),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.values.get(name) {
            Some(ModelValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }
}

/// Errors shared by every backend so solvers stay swappable behind
/// `Box<dyn SmtSolver>`.
#[derive(Debug, thiserror::Error)]
pub enum SolverError {
    #[error("unknown variable: {0}")]
    UnknownVariable(String),

    #[error("variable already declared with a different sort: {0}")]
    SortConflict(String),

    #[error("sort mismatch: {0}")]
    SortMismatch(String),

    #[error("pop without matching push")]
    ScopeUnderflow,

    #[error("solver process not available: {0}")]
    NotFound(String),

    #[error("solver I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse solver output: {0}")]
    Parse(String),

    #[error("solver backend error: {0}")]
    Backend(String),
}

/// Abstract SMT solver interface.
pub trait SmtSolver {
    /// Declare a new variable.
    fn declare_var(&mut self, name: &str, sort: &SmtSort) -> Result<(), SolverError>;

    /// Assert a constraint.
    fn assert(&mut self, term: &SmtTerm) -> Result<(), SolverError>;

    /// Push a new scope.
    fn push(&mut self) -> Result<(), SolverError>;

    /// Pop a scope.
    fn pop(&mut self) -> Result<(), SolverError>;

    /// Check satisfiability.
    fn check_sat(&mut self) -> Result<SatResult, SolverError>;

    /// Check satisfiability and extract a model if SAT.
    fn check_sat_with_model(
        &mut self,
        var_names: &[(&str, &SmtSort)],
    ) -> Result<(SatResult, Option<Model>), SolverError>;

    /// Reset the solver state.
    fn reset(&mut self) -> Result<(), SolverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockSolver {
        sat_result: SatResult,
        check_sat_calls: usize,
        depth: usize,
    }

    impl SmtSolver for MockSolver {
        fn declare_var(&mut self, _name: &str, _sort: &SmtSort) -> Result<(), SolverError> {
            Ok(())
        }

        fn assert(&mut self, _term: &SmtTerm) -> Result<(), SolverError> {
            Ok(())
        }

        fn push(&mut self) -> Result<(), SolverError> {
            self.depth += 1;
            Ok(())
        }

        fn pop(&mut self) -> Result<(), SolverError> {
            self.depth = self.depth.checked_sub(1).ok_or(SolverError::ScopeUnderflow)?;
            Ok(())
        }

        fn check_sat(&mut self) -> Result<SatResult, SolverError> {
            self.check_sat_calls += 1;
            Ok(self.sat_result.clone())
        }

        fn check_sat_with_model(
            &mut self,
            _var_names: &[(&str, &SmtSort)],
        ) -> Result<(SatResult, Option<Model>), SolverError> {
            Ok((self.check_sat()?, None))
        }

        fn reset(&mut self) -> Result<(), SolverError> {
            self.depth = 0;
            Ok(())
        }
    }

    fn half() -> Rational {
        Rational::new(1.into(), 2.into())
    }

    #[test]
    fn model_getters_return_typed_values_only() {
        let mut values = HashMap::new();
        values.insert("x".to_string(), ModelValue::Int(42));
        values.insert("r".to_string(), ModelValue::Real(half()));
        values.insert("flag".to_string(), ModelValue::Bool(true));
        let model = Model { values };

        assert_eq!(model.get_int("x"), Some(42));
        assert_eq!(model.get_real("x"), Some(rational::from_i64(42)));
        assert_eq!(model.get_real("r"), Some(half()));
        assert_eq!(model.get_bool("flag"), Some(true));
        assert_eq!(model.get_int("flag"), None);
        assert_eq!(model.get_real("flag"), None);
        assert_eq!(model.get_bool("missing"), None);
    }

    #[test]
    fn trait_is_object_safe_and_pop_underflow_errors() {
        let mut solver: Box<dyn SmtSolver> = Box::new(MockSolver {
            sat_result: SatResult::Unknown("timeout".into()),
            check_sat_calls: 0,
            depth: 0,
        });
        assert!(matches!(solver.pop(), Err(SolverError::ScopeUnderflow)));
        solver.push().unwrap();
        solver.pop().unwrap();
        let (result, model) = solver.check_sat_with_model(&[]).unwrap();
        assert_eq!(result, SatResult::Unknown("timeout".into()));
        assert!(model.is_none());
    }

    #[test]
    fn model_value_display_uses_decimals() {
        assert_eq!(
            ModelValue::Real(Rational::new(121.into(), 2.into())).to_string(),
            "60.5"
        );
        assert_eq!(ModelValue::Int(-3).to_string(), "-3");
        assert_eq!(ModelValue::Bool(false).to_string(), "false");
    }
}
