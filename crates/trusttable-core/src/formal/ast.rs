//! Tagged constraint language produced by formalization.
//!
//! Each constraint cites the claim step it came from, so a counter-example
//! or a validation failure can be traced back to the reasoning.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::claims::ClaimChain;
use crate::query::CmpOp;
use crate::table::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Formalization {
    pub variables: Vec<VarDecl>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    pub conclusion: Conclusion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarDecl {
    pub name: String,
    pub kind: VarKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarKind {
    Numeric,
    Text,
    Date,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expr {
    Num { value: f64 },
    Text { value: String },
    Date { value: NaiveDate },
    Bool { value: bool },
    Var { name: String },
    Add { args: Vec<Expr> },
    Sub { args: Vec<Expr> },
    Mul { args: Vec<Expr> },
    Div { args: Vec<Expr> },
    Neg { arg: Box<Expr> },
    Abs { arg: Box<Expr> },
    Max { args: Vec<Expr> },
    Min { args: Vec<Expr> },
}

impl Expr {
    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var { name: name.into() }
    }

    pub fn num(value: f64) -> Self {
        Expr::Num { value }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Constraint {
    /// A table fact: `var` has this value.
    Fact { step: u32, var: String, value: Value },
    /// A derived variable: `var = expr`.
    Define { step: u32, var: String, expr: Expr },
    Compare {
        step: u32,
        lhs: Expr,
        op: CmpOp,
        rhs: Expr,
    },
}

impl Constraint {
    pub fn step(&self) -> u32 {
        match self {
            Constraint::Fact { step, .. }
            | Constraint::Define { step, .. }
            | Constraint::Compare { step, .. } => *step,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Conclusion {
    /// `target` equals `value`, or the stated answer when `value` is absent.
    Value {
        step: u32,
        target: String,
        #[serde(default)]
        value: Option<Value>,
    },
    /// Qualitative conclusion.
    Holds {
        step: u32,
        lhs: Expr,
        op: CmpOp,
        rhs: Expr,
    },
}

impl Conclusion {
    pub fn step(&self) -> u32 {
        match self {
            Conclusion::Value { step, .. } | Conclusion::Holds { step, .. } => *step,
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum FormalizationError {
    #[error("malformed formalization: {0}")]
    Malformed(String),

    #[error("variable {0} declared twice")]
    DuplicateVariable(String),

    #[error("step {step}: undeclared variable {name}")]
    Undeclared { step: u32, name: String },

    #[error("step {step}: {detail}")]
    KindMismatch { step: u32, detail: String },

    #[error("step {0}: order comparison over text or booleans")]
    TextOrdering(u32),

    #[error("constraint cites step {0}, which is not in the claim chain")]
    UnknownStep(u32),

    #[error("conclusion cites step {found}, but the conclusion claim is {expected}")]
    ConclusionStep { expected: u32, found: u32 },
}

impl Formalization {
    /// Parse a formalization from model output (code fences already stripped).
    pub fn parse(text: &str) -> Result<Self, FormalizationError> {
        serde_json::from_str(text).map_err(|e| FormalizationError::Malformed(e.to_string()))
    }

    pub fn kinds(&self) -> BTreeMap<&str, VarKind> {
        self.variables
            .iter()
            .map(|v| (v.name.as_str(), v.kind))
            .collect()
    }

    /// Check names, kinds and step citations against the claim chain.
    pub fn validate(&self, chain: &ClaimChain) -> Result<(), FormalizationError> {
        let mut seen = BTreeSet::new();
        for decl in &self.variables {
            if decl.name.trim().is_empty() {
                return Err(FormalizationError::Malformed("empty variable name".into()));
            }
            if !seen.insert(decl.name.as_str()) {
                return Err(FormalizationError::DuplicateVariable(decl.name.clone()));
            }
        }
        let kinds = self.kinds();
        let checker = KindChecker { kinds: &kinds };

        for constraint in &self.constraints {
            let step = constraint.step();
            if chain.get(step).is_none() {
                return Err(FormalizationError::UnknownStep(step));
            }
            match constraint {
                Constraint::Fact { var, value, .. } => {
                    let kind = checker.var(step, var)?;
                    if !value_fits(value, kind) {
                        return Err(FormalizationError::KindMismatch {
                            step,
                            detail: format!("{value:?} is not a {kind:?} value for {var}"),
                        });
                    }
                }
                Constraint::Define { var, expr, .. } => {
                    let kind = checker.var(step, var)?;
                    let expr_kind = checker.expr(step, expr)?;
                    if kind != expr_kind {
                        return Err(FormalizationError::KindMismatch {
                            step,
                            detail: format!("{var} is {kind:?} but is defined as {expr_kind:?}"),
                        });
                    }
                }
                Constraint::Compare { lhs, op, rhs, .. } => checker.comparison(step, lhs, *op, rhs)?,
            }
        }

        let expected = chain.conclusion().index;
        let found = self.conclusion.step();
        if found != expected {
            return Err(FormalizationError::ConclusionStep { expected, found });
        }
        match &self.conclusion {
            Conclusion::Value { step, target, value } => {
                let kind = checker.var(*step, target)?;
                if let Some(value) = value {
                    if !value_fits(value, kind) {
                        return Err(FormalizationError::KindMismatch {
                            step: *step,
                            detail: format!("conclusion value {value:?} is not {kind:?}"),
                        });
                    }
                }
            }
            Conclusion::Holds { step, lhs, op, rhs } => checker.comparison(*step, lhs, *op, rhs)?,
        }
        Ok(())
    }
}

/// Whether `value` can be read as a `kind` literal.
pub fn value_fits(value: &Value, kind: VarKind) -> bool {
    match kind {
        VarKind::Numeric => value.as_number().is_some(),
        VarKind::Date => value.as_date().is_some(),
        VarKind::Boolean => value.as_bool().is_some(),
        VarKind::Text => !value.is_null(),
    }
}

struct KindChecker<'a> {
    kinds: &'a BTreeMap<&'a str, VarKind>,
}

impl KindChecker<'_> {
    fn var(&self, step: u32, name: &str) -> Result<VarKind, FormalizationError> {
        self.kinds
            .get(name)
            .copied()
            .ok_or_else(|| FormalizationError::Undeclared {
                step,
                name: name.to_string(),
            })
    }

    fn comparison(
        &self,
        step: u32,
        lhs: &Expr,
        op: CmpOp,
        rhs: &Expr,
    ) -> Result<(), FormalizationError> {
        let l = self.expr(step, lhs)?;
        let r = self.expr(step, rhs)?;
        if l != r {
            return Err(FormalizationError::KindMismatch {
                step,
                detail: format!("cannot compare {l:?} with {r:?}"),
            });
        }
        let ordering = !matches!(op, CmpOp::Eq | CmpOp::Ne);
        if ordering && matches!(l, VarKind::Text | VarKind::Boolean) {
            return Err(FormalizationError::TextOrdering(step));
        }
        Ok(())
    }

    fn expr(&self, step: u32, expr: &Expr) -> Result<VarKind, FormalizationError> {
        let mismatch = |detail: String| FormalizationError::KindMismatch { step, detail };
        match expr {
            Expr::Num { value } => {
                if value.is_finite() {
                    Ok(VarKind::Numeric)
                } else {
                    Err(mismatch(format!("non-finite number {value}")))
                }
            }
            Expr::Text { .. } => Ok(VarKind::Text),
            Expr::Date { .. } => Ok(VarKind::Date),
            Expr::Bool { .. } => Ok(VarKind::Boolean),
            Expr::Var { name } => self.var(step, name),
            Expr::Neg { arg } | Expr::Abs { arg } => match self.expr(step, arg)? {
                VarKind::Numeric => Ok(VarKind::Numeric),
                other => Err(mismatch(format!("arithmetic over {other:?}"))),
            },
            Expr::Sub { args } if args.len() == 2 => {
                let l = self.expr(step, &args[0])?;
                let r = self.expr(step, &args[1])?;
                match (l, r) {
                    (VarKind::Numeric, VarKind::Numeric) | (VarKind::Date, VarKind::Date) => {
                        Ok(VarKind::Numeric)
                    }
                    (VarKind::Date, VarKind::Numeric) => Ok(VarKind::Date),
                    _ => Err(mismatch(format!("cannot subtract {r:?} from {l:?}"))),
                }
            }
            Expr::Div { args } if args.len() != 2 => {
                Err(FormalizationError::Malformed("div takes exactly two arguments".into()))
            }
            Expr::Add { args } | Expr::Sub { args } | Expr::Mul { args } | Expr::Div { args } => {
                self.uniform(step, args, &[VarKind::Numeric])
            }
            Expr::Max { args } | Expr::Min { args } => {
                self.uniform(step, args, &[VarKind::Numeric, VarKind::Date])
            }
        }
    }

    fn uniform(
        &self,
        step: u32,
        args: &[Expr],
        allowed: &[VarKind],
    ) -> Result<VarKind, FormalizationError> {
        let Some(first) = args.first() else {
            return Err(FormalizationError::Malformed(format!(
                "step {step}: operator with no arguments"
            )));
        };
        let kind = self.expr(step, first)?;
        if !allowed.contains(&kind) {
            return Err(FormalizationError::KindMismatch {
                step,
                detail: format!("operator does not accept {kind:?}"),
            });
        }
        for arg in &args[1..] {
            let k = self.expr(step, arg)?;
            if k != kind {
                return Err(FormalizationError::KindMismatch {
                    step,
                    detail: format!("mixed {kind:?} and {k:?} arguments"),
                });
            }
        }
        Ok(kind)
    }
}
