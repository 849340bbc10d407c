//! Lowering a validated [`Formalization`] to SMT terms.
//!
//! Numeric and date variables become `Real` (dates as days from CE), text
//! becomes `Real` codes interned per formalization so only equality is
//! meaningful, booleans stay `Bool`. `max`, `min` and `abs` introduce
//! auxiliary variables bounded by every argument plus a disjunction of
//! equalities.

use std::collections::{BTreeMap, HashMap};

use chrono::{Datelike, NaiveDate};
use trusttable_smt::rational::{self, Rational};
use trusttable_smt::{to_smtlib, Model, SmtSort, SmtTerm};

use crate::consistency::answer_tolerance;
use crate::query::CmpOp;
use crate::table::{decimal_places, extract_number, normalize_whitespace, Value};

use super::ast::{Conclusion, Constraint, Expr, Formalization, FormalizationError, VarKind};

/// Solver-ready form of one formalization.
#[derive(Debug, Clone)]
pub struct Encoding {
    /// Every solver variable, user and auxiliary, in declaration order.
    pub declarations: Vec<(String, SmtSort)>,
    /// Premise constraints paired with the claim step they encode.
    pub premises: Vec<(u32, SmtTerm)>,
    pub conclusion: SmtTerm,
    /// Variable whose witness value is the computed answer.
    pub target: Option<String>,
    /// Set when the asserted conclusion value could not be read as the
    /// target's kind; the conclusion is then encoded as `false`.
    pub unreadable_conclusion: Option<String>,
    names: BTreeMap<String, String>,
    kinds: BTreeMap<String, VarKind>,
    texts: Vec<String>,
}

impl Encoding {
    /// Smt names and sorts of the user-declared variables.
    pub fn user_vars(&self) -> Vec<(&str, &SmtSort)> {
        self.declarations
            .iter()
            .filter(|(name, _)| name.starts_with("v_"))
            .map(|(name, sort)| (name.as_str(), sort))
            .collect()
    }

    /// Premises rendered as SMT-LIB assertions.
    pub fn smtlib_premises(&self) -> Vec<String> {
        self.premises
            .iter()
            .map(|(_, t)| format!("(assert {})", to_smtlib(t)))
            .collect()
    }

    pub fn smtlib_conclusion(&self) -> String {
        to_smtlib(&self.conclusion)
    }

    /// Read user variables back out of a solver model.
    pub fn decode(&self, model: &Model) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        for (user, smt) in &self.names {
            let Some(kind) = self.kinds.get(user) else {
                continue;
            };
            let value = match kind {
                VarKind::Boolean => model.get_bool(smt).map(Value::Bool),
                VarKind::Numeric => model
                    .get_real(smt)
                    .map(|r| Value::Number(rational::to_f64(&r))),
                VarKind::Date => model
                    .get_real(smt)
                    .and_then(|r| rational::to_i64(&r))
                    .and_then(|days| i32::try_from(days).ok())
                    .and_then(NaiveDate::from_num_days_from_ce_opt)
                    .map(Value::Date),
                VarKind::Text => model.get_real(smt).map(|r| self.text_for(&r)),
            };
            if let Some(value) = value {
                out.insert(user.clone(), value);
            }
        }
        out
    }

    /// Term fixing the target to the value it takes in `model`.
    pub fn target_pin(&self, model: &Model) -> Option<SmtTerm> {
        let target = self.target.as_ref()?;
        let smt = self.names.get(target)?;
        match self.kinds.get(target)? {
            VarKind::Boolean => model.get_bool(smt).map(|b| {
                if b {
                    SmtTerm::var(smt)
                } else {
                    SmtTerm::var(smt).not()
                }
            }),
            _ => model
                .get_real(smt)
                .map(|r| SmtTerm::var(smt).eq(SmtTerm::num(r))),
        }
    }

    pub fn target_value(&self, model: &Model) -> Option<Value> {
        self.target.as_ref().and_then(|t| self.value_of(model, t))
    }

    /// Decoded value of a single user variable.
    pub fn value_of(&self, model: &Model, user: &str) -> Option<Value> {
        self.decode(model).remove(user)
    }

    fn text_for(&self, code: &Rational) -> Value {
        rational::to_i64(code)
            .and_then(|n| usize::try_from(n - 1).ok())
            .and_then(|i| self.texts.get(i))
            .map(|t| Value::Text(t.clone()))
            .unwrap_or(Value::Null)
    }
}

/// Lower `formalization`; `stated_answer` fills a value conclusion with no
/// explicit value. A numeric conclusion holds anywhere inside the stated
/// number's [`answer_tolerance`] band, so a rounded answer is entailed.
pub fn encode(
    formalization: &Formalization,
    stated_answer: &str,
    relative_tolerance: f64,
) -> Result<Encoding, FormalizationError> {
    let mut enc = Encoder::default();
    for decl in &formalization.variables {
        enc.declare_user(&decl.name, decl.kind);
    }

    let mut premises = Vec::new();
    for constraint in &formalization.constraints {
        let step = constraint.step();
        let term = match constraint {
            Constraint::Fact { var, value, .. } => {
                let kind = enc.kind(step, var)?;
                let v = enc.var(step, var)?;
                let lit = enc.literal(value, kind).ok_or_else(|| FormalizationError::KindMismatch {
                    step,
                    detail: format!("{value:?} is not a {kind:?} literal"),
                })?;
                relate(v, CmpOp::Eq, lit, kind)
            }
            Constraint::Define { var, expr, .. } => {
                let kind = enc.kind(step, var)?;
                let v = enc.var(step, var)?;
                let e = enc.expr(step, expr)?;
                relate(v, CmpOp::Eq, e, kind)
            }
            Constraint::Compare { lhs, op, rhs, .. } => {
                let kind = enc.expr_kind(lhs);
                let l = enc.expr(step, lhs)?;
                let r = enc.expr(step, rhs)?;
                relate(l, *op, r, kind)
            }
        };
        premises.extend(enc.aux.drain(..).map(|t| (step, t)));
        premises.push((step, term));
    }

    let mut unreadable = None;
    let (conclusion, target) = match &formalization.conclusion {
        Conclusion::Value {
            step,
            target,
            value,
        } => {
            let kind = enc.kind(*step, target)?;
            let v = enc.var(*step, target)?;
            let asserted = value.clone().unwrap_or_else(|| Value::text(stated_answer));
            let band = match kind {
                VarKind::Numeric => tolerance_band(&asserted, relative_tolerance),
                _ => None,
            };
            let term = match (band, enc.literal(&asserted, kind)) {
                (Some((lo, hi)), Some(_)) => {
                    SmtTerm::and(vec![v.clone().ge(SmtTerm::num(lo)), v.le(SmtTerm::num(hi))])
                }
                (None, Some(lit)) => relate(v, CmpOp::Eq, lit, kind),
                (_, None) => {
                    unreadable = Some(asserted.to_string());
                    SmtTerm::bool(false)
                }
            };
            (term, Some(target.clone()))
        }
        Conclusion::Holds { step, lhs, op, rhs } => {
            let kind = enc.expr_kind(lhs);
            let l = enc.expr(*step, lhs)?;
            let r = enc.expr(*step, rhs)?;
            premises.extend(enc.aux.drain(..).map(|t| (*step, t)));
            (relate(l, *op, r, kind), None)
        }
    };

    Ok(Encoding {
        declarations: enc.declarations,
        premises,
        conclusion,
        target,
        unreadable_conclusion: unreadable,
        names: enc.names,
        kinds: enc.kinds,
        texts: enc.texts,
    })
}

#[derive(Default)]
struct Encoder {
    declarations: Vec<(String, SmtSort)>,
    names: BTreeMap<String, String>,
    kinds: BTreeMap<String, VarKind>,
    texts: Vec<String>,
    text_codes: HashMap<String, usize>,
    aux: Vec<SmtTerm>,
    next_aux: usize,
}

impl Encoder {
    fn declare_user(&mut self, name: &str, kind: VarKind) {
        let base = format!("v_{}", sanitize(name));
        let mut smt = base.clone();
        let mut n = 1;
        while self.declarations.iter().any(|(d, _)| *d == smt) {
            smt = format!("{base}_{n}");
            n += 1;
        }
        let sort = match kind {
            VarKind::Boolean => SmtSort::Bool,
            _ => SmtSort::Real,
        };
        self.declarations.push((smt.clone(), sort));
        self.names.insert(name.to_string(), smt);
        self.kinds.insert(name.to_string(), kind);
    }

    fn fresh_aux(&mut self) -> SmtTerm {
        let name = format!("aux_{}", self.next_aux);
        self.next_aux += 1;
        self.declarations.push((name.clone(), SmtSort::Real));
        SmtTerm::var(name)
    }

    fn kind(&self, step: u32, name: &str) -> Result<VarKind, FormalizationError> {
        self.kinds
            .get(name)
            .copied()
            .ok_or_else(|| FormalizationError::Undeclared {
                step,
                name: name.to_string(),
            })
    }

    fn var(&self, step: u32, name: &str) -> Result<SmtTerm, FormalizationError> {
        self.names
            .get(name)
            .map(|smt| SmtTerm::var(smt.as_str()))
            .ok_or_else(|| FormalizationError::Undeclared {
                step,
                name: name.to_string(),
            })
    }

    fn intern(&mut self, text: &str) -> SmtTerm {
        let key = normalize_whitespace(text).to_lowercase();
        let code = match self.text_codes.get(&key) {
            Some(&code) => code,
            None => {
                self.texts.push(normalize_whitespace(text));
                let code = self.texts.len();
                self.text_codes.insert(key, code);
                code
            }
        };
        SmtTerm::num(rational::from_i64(i64::try_from(code).unwrap_or(i64::MAX)))
    }

    fn literal(&mut self, value: &Value, kind: VarKind) -> Option<SmtTerm> {
        match kind {
            VarKind::Numeric => {
                let n = value.as_number().or_else(|| match value {
                    Value::Text(s) => extract_number(s),
                    _ => None,
                })?;
                rational::from_f64(n).map(SmtTerm::num)
            }
            VarKind::Date => value.as_date().map(date_term),
            VarKind::Boolean => value.as_bool().map(SmtTerm::bool),
            VarKind::Text => {
                if value.is_null() {
                    None
                } else {
                    Some(self.intern(&value.to_string()))
                }
            }
        }
    }

    /// Kind of an already validated expression.
    fn expr_kind(&self, expr: &Expr) -> VarKind {
        match expr {
            Expr::Num { .. } | Expr::Mul { .. } | Expr::Div { .. } => VarKind::Numeric,
            Expr::Neg { .. } | Expr::Abs { .. } | Expr::Add { .. } => VarKind::Numeric,
            Expr::Text { .. } => VarKind::Text,
            Expr::Date { .. } => VarKind::Date,
            Expr::Bool { .. } => VarKind::Boolean,
            Expr::Var { name } => self.kinds.get(name).copied().unwrap_or(VarKind::Numeric),
            Expr::Sub { args } => {
                let kinds: Vec<VarKind> = args.iter().map(|a| self.expr_kind(a)).collect();
                match kinds.as_slice() {
                    [VarKind::Date, VarKind::Numeric] => VarKind::Date,
                    _ => VarKind::Numeric,
                }
            }
            Expr::Max { args } | Expr::Min { args } => args
                .first()
                .map(|a| self.expr_kind(a))
                .unwrap_or(VarKind::Numeric),
        }
    }

    fn expr(&mut self, step: u32, expr: &Expr) -> Result<SmtTerm, FormalizationError> {
        let term = match expr {
            Expr::Num { value } => {
                let r = rational::from_f64(*value).ok_or_else(|| FormalizationError::KindMismatch {
                    step,
                    detail: format!("number {value} is not representable"),
                })?;
                SmtTerm::num(r)
            }
            Expr::Text { value } => self.intern(value),
            Expr::Date { value } => date_term(*value),
            Expr::Bool { value } => SmtTerm::bool(*value),
            Expr::Var { name } => self.var(step, name)?,
            Expr::Add { args } => self.fold(step, args, SmtTerm::add)?,
            Expr::Sub { args } => self.fold(step, args, SmtTerm::sub)?,
            Expr::Mul { args } => self.fold(step, args, SmtTerm::mul)?,
            Expr::Div { args } => self.fold(step, args, SmtTerm::div)?,
            Expr::Neg { arg } => self.expr(step, arg)?.neg(),
            Expr::Abs { arg } => {
                let x = self.expr(step, arg)?;
                let a = self.fresh_aux();
                self.aux.push(a.clone().ge(x.clone()));
                self.aux.push(a.clone().ge(x.clone().neg()));
                self.aux.push(SmtTerm::or(vec![
                    a.clone().eq(x.clone()),
                    a.clone().eq(x.neg()),
                ]));
                a
            }
            Expr::Max { args } => self.extremum(step, args, SmtTerm::ge)?,
            Expr::Min { args } => self.extremum(step, args, SmtTerm::le)?,
        };
        Ok(term)
    }

    fn fold(
        &mut self,
        step: u32,
        args: &[Expr],
        op: fn(SmtTerm, SmtTerm) -> SmtTerm,
    ) -> Result<SmtTerm, FormalizationError> {
        let mut terms = Vec::with_capacity(args.len());
        for arg in args {
            terms.push(self.expr(step, arg)?);
        }
        let mut iter = terms.into_iter();
        let first = iter.next().ok_or_else(|| {
            FormalizationError::Malformed(format!("step {step}: operator with no arguments"))
        })?;
        Ok(iter.fold(first, op))
    }

    /// Aux `m` with `bound(m, arg)` for every argument and `m` equal to one.
    fn extremum(
        &mut self,
        step: u32,
        args: &[Expr],
        bound: fn(SmtTerm, SmtTerm) -> SmtTerm,
    ) -> Result<SmtTerm, FormalizationError> {
        let mut terms = Vec::with_capacity(args.len());
        for arg in args {
            terms.push(self.expr(step, arg)?);
        }
        if terms.is_empty() {
            return Err(FormalizationError::Malformed(format!(
                "step {step}: extremum with no arguments"
            )));
        }
        let m = self.fresh_aux();
        let mut choices = Vec::with_capacity(terms.len());
        for t in terms {
            self.aux.push(bound(m.clone(), t.clone()));
            choices.push(m.clone().eq(t));
        }
        self.aux.push(SmtTerm::or(choices));
        Ok(m)
    }
}

fn date_term(date: NaiveDate) -> SmtTerm {
    SmtTerm::num(rational::from_i64(i64::from(date.num_days_from_ce())))
}

/// Inclusive bounds around a stated number, `None` when it must match
/// exactly or is not a number at all.
fn tolerance_band(stated: &Value, relative: f64) -> Option<(Rational, Rational)> {
    let (value, decimals) = match stated {
        Value::Number(n) => (*n, decimal_places(&n.to_string())),
        Value::Text(s) => (extract_number(s)?, decimal_places(s)),
        _ => return None,
    };
    let tolerance = answer_tolerance(value, decimals, relative);
    if tolerance <= 0.0 {
        return None;
    }
    let center = rational::from_f64(value)?;
    let tolerance = rational::from_f64(tolerance)?;
    Some((&center - &tolerance, center + tolerance))
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Relation between two encoded terms of the same kind.
fn relate(lhs: SmtTerm, op: CmpOp, rhs: SmtTerm, kind: VarKind) -> SmtTerm {
    if kind == VarKind::Boolean {
        let iff = SmtTerm::or(vec![
            SmtTerm::and(vec![lhs.clone(), rhs.clone()]),
            SmtTerm::and(vec![lhs.not(), rhs.not()]),
        ]);
        return match op {
            CmpOp::Ne => iff.not(),
            _ => iff,
        };
    }
    match op {
        CmpOp::Eq => lhs.eq(rhs),
        CmpOp::Ne => lhs.eq(rhs).not(),
        CmpOp::Lt => lhs.lt(rhs),
        CmpOp::Le => lhs.le(rhs),
        CmpOp::Gt => lhs.gt(rhs),
        CmpOp::Ge => lhs.ge(rhs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formal::ast::VarDecl;
    use trusttable_smt::{SatResult, SmtSolver, Z3Solver};

    fn decl(name: &str, kind: VarKind) -> VarDecl {
        VarDecl { name: name.into(), kind }
    }

    fn check(enc: &Encoding, negate: bool) -> (SatResult, Option<Model>) {
        let mut solver = Z3Solver::new();
        for (name, sort) in &enc.declarations {
            solver.declare_var(name, sort).unwrap();
        }
        for (_, p) in &enc.premises {
            solver.assert(p).unwrap();
        }
        if negate {
            solver.assert(&enc.conclusion.clone().not()).unwrap();
        }
        solver.check_sat_with_model(&enc.user_vars()).unwrap()
    }

    #[test]
    fn max_over_facts_is_entailed() {
        let f = Formalization {
            variables: vec![
                decl("a", VarKind::Numeric),
                decl("b", VarKind::Numeric),
                decl("top", VarKind::Numeric),
            ],
            constraints: vec![
                Constraint::Fact { step: 1, var: "a".into(), value: Value::Number(120.0) },
                Constraint::Fact { step: 2, var: "b".into(), value: Value::Number(150.0) },
                Constraint::Define {
                    step: 3,
                    var: "top".into(),
                    expr: Expr::Max { args: vec![Expr::var("a"), Expr::var("b")] },
                },
            ],
            conclusion: Conclusion::Value { step: 4, target: "top".into(), value: None },
        };
        let enc = encode(&f, "150", 1e-6).unwrap();
        assert!(enc.declarations.iter().any(|(n, _)| n == "aux_0"));

        let (premises, model) = check(&enc, false);
        assert_eq!(premises, SatResult::Sat);
        assert_eq!(enc.value_of(&model.unwrap(), "top"), Some(Value::Number(150.0)));
        assert_eq!(check(&enc, true).0, SatResult::Unsat);
    }

    #[test]
    fn text_codes_are_case_insensitive() {
        let f = Formalization {
            variables: vec![decl("team", VarKind::Text)],
            constraints: vec![Constraint::Fact {
                step: 1,
                var: "team".into(),
                value: Value::text("Ajax "),
            }],
            conclusion: Conclusion::Value { step: 2, target: "team".into(), value: None },
        };
        let enc = encode(&f, "ajax", 1e-6).unwrap();
        assert_eq!(check(&enc, true).0, SatResult::Unsat);
        let (_, model) = check(&enc, false);
        assert_eq!(enc.decode(&model.unwrap())["team"], Value::text("Ajax"));
    }

    #[test]
    fn unreadable_answer_becomes_false_conclusion() {
        let f = Formalization {
            variables: vec![decl("x", VarKind::Numeric)],
            constraints: vec![],
            conclusion: Conclusion::Value { step: 1, target: "x".into(), value: None },
        };
        let enc = encode(&f, "no idea", 1e-6).unwrap();
        assert_eq!(enc.conclusion, SmtTerm::bool(false));
        assert_eq!(enc.unreadable_conclusion.as_deref(), Some("no idea"));
    }

    fn third_of_total() -> Formalization {
        Formalization {
            variables: vec![decl("total", VarKind::Numeric), decl("avg", VarKind::Numeric)],
            constraints: vec![
                Constraint::Fact { step: 1, var: "total".into(), value: Value::Number(100.0) },
                Constraint::Define {
                    step: 2,
                    var: "avg".into(),
                    expr: Expr::Div { args: vec![Expr::var("total"), Expr::Num { value: 3.0 }] },
                },
            ],
            conclusion: Conclusion::Value { step: 3, target: "avg".into(), value: None },
        }
    }

    #[test]
    fn rounded_answer_is_entailed_within_its_last_place() {
        let enc = encode(&third_of_total(), "33.33", 1e-6).unwrap();
        assert_eq!(check(&enc, true).0, SatResult::Unsat);

        let (_, model) = check(&enc, false);
        let Some(Value::Number(avg)) = enc.value_of(&model.unwrap(), "avg") else {
            panic!("avg should decode as a number");
        };
        assert!((avg - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn answer_outside_its_last_place_is_refuted() {
        let enc = encode(&third_of_total(), "33.32", 1e-6).unwrap();
        assert_eq!(check(&enc, true).0, SatResult::Sat);
        let enc = encode(&third_of_total(), "33", 1e-6).unwrap();
        assert_eq!(check(&enc, true).0, SatResult::Sat);
    }

    #[test]
    fn names_are_sanitized_and_unique() {
        let f = Formalization {
            variables: vec![decl("net profit", VarKind::Numeric), decl("net_profit", VarKind::Numeric)],
            constraints: vec![],
            conclusion: Conclusion::Value { step: 1, target: "net profit".into(), value: Some(Value::Number(1.0)) },
        };
        let enc = encode(&f, "", 0.0).unwrap();
        let names: Vec<_> = enc.declarations.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["v_net_profit", "v_net_profit_1"]);
        assert_eq!(enc.smtlib_conclusion(), "(= v_net_profit 1.0)");
    }
}
