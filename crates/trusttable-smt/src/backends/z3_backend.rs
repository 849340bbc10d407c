use std::collections::HashMap;
use std::time::Duration;

use num::traits::Zero;
use z3::ast::{Bool, Int, Real};
use z3::SatResult as Z3SatResult;

use crate::backends::sexpr::parse_numeral;
use crate::rational::Rational;
use crate::solver::{Model, ModelValue, SatResult, SmtSolver, SolverError};
use crate::sorts::SmtSort;
use crate::terms::SmtTerm;

/// In-process z3 through its C API.
///
/// z3 objects live in a thread-local context, so a `Z3Solver` must be
/// created and used on the same thread.
pub struct Z3Solver {
    solver: z3::Solver,
    real_vars: HashMap<String, Real>,
    int_vars: HashMap<String, Int>,
    bool_vars: HashMap<String, Bool>,
    depth: usize,
    params: Option<z3::Params>,
}

impl Z3Solver {
    pub fn new() -> Self {
        Self {
            solver: z3::Solver::new(),
            real_vars: HashMap::new(),
            int_vars: HashMap::new(),
            bool_vars: HashMap::new(),
            depth: 0,
            params: None,
        }
    }

    /// A zero timeout means no limit.
    pub fn with_timeout(timeout: Duration) -> Self {
        let ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let mut solver = Self::new();
        if ms == 0 {
            return solver;
        }
        let mut params = z3::Params::new();
        params.set_u32("timeout", ms);
        solver.solver.set_params(&params);
        solver.params = Some(params);
        solver
    }

    fn sort_of(&self, name: &str) -> Option<SmtSort> {
        if self.real_vars.contains_key(name) {
            Some(SmtSort::Real)
        } else if self.int_vars.contains_key(name) {
            Some(SmtSort::Int)
        } else if self.bool_vars.contains_key(name) {
            Some(SmtSort::Bool)
        } else {
            None
        }
    }

    fn translate_term(&self, term: &SmtTerm) -> Result<Z3Term, SolverError> {
        match term {
            SmtTerm::Var(name) => {
                if let Some(v) = self.real_vars.get(name) {
                    Ok(Z3Term::Real(v.clone()))
                } else if let Some(v) = self.int_vars.get(name) {
                    Ok(Z3Term::Int(v.clone()))
                } else if let Some(v) = self.bool_vars.get(name) {
                    Ok(Z3Term::Bool(v.clone()))
                } else {
                    Err(SolverError::UnknownVariable(name.clone()))
                }
            }
            SmtTerm::Num(value) => Ok(Z3Term::Lit(value.clone())),
            SmtTerm::BoolLit(b) => Ok(Z3Term::Bool(Bool::from_bool(*b))),
            SmtTerm::Add(lhs, rhs) => {
                Ok(match self.numeric_pair(lhs, rhs, "+")? {
                    Pair::Lit(l, r) => Z3Term::Lit(l + r),
                    Pair::Int(l, r) => Z3Term::Int(&l + &r),
                    Pair::Real(l, r) => Z3Term::Real(&l + &r),
                })
            }
            SmtTerm::Sub(lhs, rhs) => {
                Ok(match self.numeric_pair(lhs, rhs, "-")? {
                    Pair::Lit(l, r) => Z3Term::Lit(l - r),
                    Pair::Int(l, r) => Z3Term::Int(&l - &r),
                    Pair::Real(l, r) => Z3Term::Real(&l - &r),
                })
            }
            SmtTerm::Mul(lhs, rhs) => {
                Ok(match self.numeric_pair(lhs, rhs, "*")? {
                    Pair::Lit(l, r) => Z3Term::Lit(l * r),
                    Pair::Int(l, r) => Z3Term::Int(&l * &r),
                    Pair::Real(l, r) => Z3Term::Real(&l * &r),
                })
            }
            SmtTerm::Div(lhs, rhs) => {
                // Always real division, never integer `div`.
                Ok(match self.numeric_pair(lhs, rhs, "/")? {
                    Pair::Lit(l, r) if !r.is_zero() => Z3Term::Lit(l / r),
                    Pair::Lit(l, r) => Z3Term::Real(&real_lit(&l) / &real_lit(&r)),
                    Pair::Int(l, r) => Z3Term::Real(&l.to_real() / &r.to_real()),
                    Pair::Real(l, r) => Z3Term::Real(&l / &r),
                })
            }
            SmtTerm::Neg(inner) => match self.translate_term(inner)? {
                Z3Term::Lit(v) => Ok(Z3Term::Lit(-v)),
                Z3Term::Int(v) => Ok(Z3Term::Int(&Int::from_i64(0) - &v)),
                Z3Term::Real(v) => Ok(Z3Term::Real(&real_lit(&Rational::zero()) - &v)),
                Z3Term::Bool(_) => Err(SolverError::SortMismatch("negation of Bool".into())),
            },
            SmtTerm::Eq(lhs, rhs) => {
                let l = self.translate_term(lhs)?;
                let r = self.translate_term(rhs)?;
                match (l, r) {
                    (Z3Term::Bool(lb), Z3Term::Bool(rb)) => Ok(Z3Term::Bool(lb.eq(&rb))),
                    (l, r) => Ok(Z3Term::Bool(match numeric(l, r, "=")? {
                        Pair::Lit(l, r) => Bool::from_bool(l == r),
                        Pair::Int(l, r) => l.eq(&r),
                        Pair::Real(l, r) => l.eq(&r),
                    })),
                }
            }
            SmtTerm::Lt(lhs, rhs) => Ok(Z3Term::Bool(match self.numeric_pair(lhs, rhs, "<")? {
                Pair::Lit(l, r) => Bool::from_bool(l < r),
                Pair::Int(l, r) => l.lt(&r),
                Pair::Real(l, r) => l.lt(&r),
            })),
            SmtTerm::Le(lhs, rhs) => Ok(Z3Term::Bool(match self.numeric_pair(lhs, rhs, "<=")? {
                Pair::Lit(l, r) => Bool::from_bool(l <= r),
                Pair::Int(l, r) => l.le(&r),
                Pair::Real(l, r) => l.le(&r),
            })),
            SmtTerm::Gt(lhs, rhs) => Ok(Z3Term::Bool(match self.numeric_pair(lhs, rhs, ">")? {
                Pair::Lit(l, r) => Bool::from_bool(l > r),
                Pair::Int(l, r) => l.gt(&r),
                Pair::Real(l, r) => l.gt(&r),
            })),
            SmtTerm::Ge(lhs, rhs) => Ok(Z3Term::Bool(match self.numeric_pair(lhs, rhs, ">=")? {
                Pair::Lit(l, r) => Bool::from_bool(l >= r),
                Pair::Int(l, r) => l.ge(&r),
                Pair::Real(l, r) => l.ge(&r),
            })),
            SmtTerm::And(terms) => {
                let bools = self.translate_bools(terms)?;
                let refs: Vec<&Bool> = bools.iter().collect();
                Ok(Z3Term::Bool(Bool::and(&refs)))
            }
            SmtTerm::Or(terms) => {
                let bools = self.translate_bools(terms)?;
                let refs: Vec<&Bool> = bools.iter().collect();
                Ok(Z3Term::Bool(Bool::or(&refs)))
            }
            SmtTerm::Not(inner) => {
                let b = self.translate_term(inner)?.into_bool()?;
                Ok(Z3Term::Bool(b.not()))
            }
            SmtTerm::Implies(lhs, rhs) => {
                let l = self.translate_term(lhs)?.into_bool()?;
                let r = self.translate_term(rhs)?.into_bool()?;
                Ok(Z3Term::Bool(l.implies(&r)))
            }
        }
    }

    fn translate_bools(&self, terms: &[SmtTerm]) -> Result<Vec<Bool>, SolverError> {
        terms
            .iter()
            .map(|t| self.translate_term(t).and_then(Z3Term::into_bool))
            .collect()
    }

    fn numeric_pair(&self, lhs: &SmtTerm, rhs: &SmtTerm, op: &str) -> Result<Pair, SolverError> {
        numeric(self.translate_term(lhs)?, self.translate_term(rhs)?, op)
    }

    fn model_value(&self, model: &z3::Model, name: &str, sort: &SmtSort) -> Option<ModelValue> {
        match sort {
            SmtSort::Real => {
                let v = self.real_vars.get(name)?;
                let val = model.eval::<Real>(v, true)?;
                parse_numeral(&val.to_string()).map(ModelValue::Real)
            }
            SmtSort::Int => {
                let v = self.int_vars.get(name)?;
                let val = model.eval::<Int>(v, true)?;
                val.as_i64().map(ModelValue::Int)
            }
            SmtSort::Bool => {
                let v = self.bool_vars.get(name)?;
                let val = model.eval::<Bool>(v, true)?;
                val.as_bool().map(ModelValue::Bool)
            }
        }
    }
}

impl Default for Z3Solver {
    fn default() -> Self {
        Self::new()
    }
}

enum Z3Term {
    Bool(Bool),
    Int(Int),
    Real(Real),
    /// Kept exact until it meets a variable, which fixes its sort.
    Lit(Rational),
}

impl Z3Term {
    fn into_bool(self) -> Result<Bool, SolverError> {
        match self {
            Z3Term::Bool(b) => Ok(b),
            _ => Err(SolverError::SortMismatch("expected Bool, got a number".into())),
        }
    }
}

enum Pair {
    Lit(Rational, Rational),
    Int(Int, Int),
    Real(Real, Real),
}

fn real_lit(value: &Rational) -> Real {
    Real::from_big_rational(value)
}

fn int_lit(value: &Rational) -> Option<Int> {
    value.is_integer().then(|| Int::from_big_int(value.numer()))
}

/// Bring both operands to one numeric sort. Ints widen to Real when the
/// other side is real or a non-integer literal.
fn numeric(l: Z3Term, r: Z3Term, op: &str) -> Result<Pair, SolverError> {
    Ok(match (l, r) {
        (Z3Term::Bool(_), _) | (_, Z3Term::Bool(_)) => {
            return Err(SolverError::SortMismatch(format!(
                "`{op}` applied to a Bool operand"
            )))
        }
        (Z3Term::Lit(l), Z3Term::Lit(r)) => Pair::Lit(l, r),
        (Z3Term::Int(l), Z3Term::Int(r)) => Pair::Int(l, r),
        (Z3Term::Real(l), Z3Term::Real(r)) => Pair::Real(l, r),
        (Z3Term::Int(l), Z3Term::Real(r)) => Pair::Real(l.to_real(), r),
        (Z3Term::Real(l), Z3Term::Int(r)) => Pair::Real(l, r.to_real()),
        (Z3Term::Real(l), Z3Term::Lit(r)) => Pair::Real(l, real_lit(&r)),
        (Z3Term::Lit(l), Z3Term::Real(r)) => Pair::Real(real_lit(&l), r),
        (Z3Term::Int(l), Z3Term::Lit(r)) => match int_lit(&r) {
            Some(r) => Pair::Int(l, r),
            None => Pair::Real(l.to_real(), real_lit(&r)),
        },
        (Z3Term::Lit(l), Z3Term::Int(r)) => match int_lit(&l) {
            Some(l) => Pair::Int(l, r),
            None => Pair::Real(real_lit(&l), r.to_real()),
        },
    })
}

impl SmtSolver for Z3Solver {
    fn declare_var(&mut self, name: &str, sort: &SmtSort) -> Result<(), SolverError> {
        match self.sort_of(name) {
            Some(existing) if existing == *sort => return Ok(()),
            Some(_) => return Err(SolverError::SortConflict(name.to_string())),
            None => {}
        }
        match sort {
            SmtSort::Real => {
                self.real_vars
                    .insert(name.to_string(), Real::new_const(name));
            }
            SmtSort::Int => {
                self.int_vars.insert(name.to_string(), Int::new_const(name));
            }
            SmtSort::Bool => {
                self.bool_vars.insert(name.to_string(), Bool::new_const(name));
            }
        }
        Ok(())
    }

    fn assert(&mut self, term: &SmtTerm) -> Result<(), SolverError> {
        let z3_term = self.translate_term(term)?.into_bool()?;
        self.solver.assert(&z3_term);
        Ok(())
    }

    fn push(&mut self) -> Result<(), SolverError> {
        self.solver.push();
        self.depth += 1;
        Ok(())
    }

    fn pop(&mut self) -> Result<(), SolverError> {
        if self.depth == 0 {
            return Err(SolverError::ScopeUnderflow);
        }
        self.solver.pop(1);
        self.depth -= 1;
        Ok(())
    }

    fn check_sat(&mut self) -> Result<SatResult, SolverError> {
        match self.solver.check() {
            Z3SatResult::Sat => Ok(SatResult::Sat),
            Z3SatResult::Unsat => Ok(SatResult::Unsat),
            Z3SatResult::Unknown => Ok(SatResult::Unknown("z3 returned unknown".into())),
        }
    }

    fn check_sat_with_model(
        &mut self,
        var_names: &[(&str, &SmtSort)],
    ) -> Result<(SatResult, Option<Model>), SolverError> {
        let result = self.check_sat()?;
        if result != SatResult::Sat {
            return Ok((result, None));
        }
        let z3_model = self
            .solver
            .get_model()
            .ok_or_else(|| SolverError::Backend("sat but no model available".into()))?;
        let values = var_names
            .iter()
            .filter_map(|&(name, sort)| {
                self.model_value(&z3_model, name, sort)
                    .map(|value| (name.to_string(), value))
            })
            .collect();
        Ok((SatResult::Sat, Some(Model { values })))
    }

    fn reset(&mut self) -> Result<(), SolverError> {
        self.solver.reset();
        // z3 drops per-solver parameters on reset.
        if let Some(params) = &self.params {
            self.solver.set_params(params);
        }
        self.real_vars.clear();
        self.int_vars.clear();
        self.bool_vars.clear();
        self.depth = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rational;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn ratio(n: i64, d: i64) -> Rational {
        Rational::new(n.into(), d.into())
    }

    #[test]
    fn real_division_is_exact() -> TestResult {
        let mut solver = Z3Solver::new();
        solver.declare_var("avg", &SmtSort::Real)?;
        solver.assert(&SmtTerm::var("avg").eq(SmtTerm::int(100).div(SmtTerm::int(3))))?;

        let (result, model) = solver.check_sat_with_model(&[("avg", &SmtSort::Real)])?;
        assert_eq!(result, SatResult::Sat);
        let model = model.ok_or("expected a model")?;
        assert_eq!(model.get_real("avg"), Some(ratio(100, 3)));
        Ok(())
    }

    #[test]
    fn negative_and_fractional_models_are_read_back() -> TestResult {
        let mut solver = Z3Solver::new();
        solver.declare_var("x", &SmtSort::Real)?;
        solver.assert(&SmtTerm::var("x").eq(SmtTerm::num(ratio(-7, 4))))?;

        let (_, model) = solver.check_sat_with_model(&[("x", &SmtSort::Real)])?;
        assert_eq!(model.ok_or("expected a model")?.get_real("x"), Some(ratio(-7, 4)));
        Ok(())
    }

    #[test]
    fn int_and_real_operands_mix() -> TestResult {
        let mut solver = Z3Solver::new();
        solver.declare_var("n", &SmtSort::Int)?;
        solver.declare_var("x", &SmtSort::Real)?;
        solver.assert(&SmtTerm::var("n").eq(SmtTerm::int(3)))?;
        solver.assert(&SmtTerm::var("x").eq(SmtTerm::var("n").div(SmtTerm::int(2))))?;

        let vars = [("n", &SmtSort::Int), ("x", &SmtSort::Real)];
        let (_, model) = solver.check_sat_with_model(&vars)?;
        let model = model.ok_or("expected a model")?;
        assert_eq!(model.get_int("n"), Some(3));
        assert_eq!(model.get_real("x"), Some(ratio(3, 2)));
        Ok(())
    }

    #[test]
    fn literals_beyond_i64_stay_exact() -> TestResult {
        let big = rational::from_f64(1e30).ok_or("1e30 is finite")?;
        let mut solver = Z3Solver::new();
        solver.declare_var("x", &SmtSort::Real)?;
        solver.assert(&SmtTerm::var("x").eq(SmtTerm::num(big.clone()).add(SmtTerm::int(1))))?;

        let (_, model) = solver.check_sat_with_model(&[("x", &SmtSort::Real)])?;
        let value = model.ok_or("expected a model")?.get_real("x");
        assert_eq!(value, Some(big + rational::from_i64(1)));
        Ok(())
    }

    #[test]
    fn push_pop_scopes_assertions() -> TestResult {
        let mut solver = Z3Solver::new();
        solver.declare_var("x", &SmtSort::Real)?;
        solver.assert(&SmtTerm::var("x").ge(SmtTerm::int(0)))?;

        solver.push()?;
        solver.assert(&SmtTerm::var("x").lt(SmtTerm::int(0)))?;
        assert_eq!(solver.check_sat()?, SatResult::Unsat);
        solver.pop()?;

        assert_eq!(solver.check_sat()?, SatResult::Sat);
        assert!(matches!(solver.pop(), Err(SolverError::ScopeUnderflow)));
        Ok(())
    }

    #[test]
    fn sort_errors_are_reported() -> TestResult {
        let mut solver = Z3Solver::new();
        solver.declare_var("p", &SmtSort::Bool)?;
        assert!(matches!(
            solver.declare_var("p", &SmtSort::Real),
            Err(SolverError::SortConflict(_))
        ));
        assert!(matches!(
            solver.assert(&SmtTerm::var("p").add(SmtTerm::int(1)).ge(SmtTerm::int(0))),
            Err(SolverError::SortMismatch(_))
        ));
        assert!(matches!(
            solver.assert(&SmtTerm::var("q").ge(SmtTerm::int(0))),
            Err(SolverError::UnknownVariable(_))
        ));
        Ok(())
    }

    #[test]
    fn timeout_configuration_survives_reset() -> TestResult {
        let mut solver = Z3Solver::with_timeout(Duration::from_millis(2_000));
        assert!(solver.params.is_some());

        solver.declare_var("x", &SmtSort::Real)?;
        solver.assert(&SmtTerm::var("x").eq(SmtTerm::int(1)))?;
        assert_eq!(solver.check_sat()?, SatResult::Sat);

        solver.reset()?;
        assert!(matches!(
            solver.assert(&SmtTerm::var("x").eq(SmtTerm::int(2))),
            Err(SolverError::UnknownVariable(_))
        ));
        solver.declare_var("x", &SmtSort::Real)?;
        solver.assert(&SmtTerm::var("x").eq(SmtTerm::int(2)))?;
        assert_eq!(solver.check_sat()?, SatResult::Sat);
        assert!(solver.params.is_some());
        Ok(())
    }

    #[test]
    fn zero_timeout_means_unlimited() {
        assert!(Z3Solver::with_timeout(Duration::ZERO).params.is_none());
    }
}
