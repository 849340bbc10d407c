use num::traits::Zero;

use crate::rational::{self, Rational};

/// Abstract SMT term representation, solver-agnostic.
#[derive(Debug, Clone, PartialEq)]
pub enum SmtTerm {
    /// Variable reference by name.
    Var(String),
    /// Numeric literal (exact).
    Num(Rational),
    /// Boolean literal.
    BoolLit(bool),

    // Arithmetic
    Add(Box<SmtTerm>, Box<SmtTerm>),
    Sub(Box<SmtTerm>, Box<SmtTerm>),
    Mul(Box<SmtTerm>, Box<SmtTerm>),
    Div(Box<SmtTerm>, Box<SmtTerm>),
    Neg(Box<SmtTerm>),

    // Comparison
    Eq(Box<SmtTerm>, Box<SmtTerm>),
    Lt(Box<SmtTerm>, Box<SmtTerm>),
    Le(Box<SmtTerm>, Box<SmtTerm>),
    Gt(Box<SmtTerm>, Box<SmtTerm>),
    Ge(Box<SmtTerm>, Box<SmtTerm>),

    // Boolean logic
    And(Vec<SmtTerm>),
    Or(Vec<SmtTerm>),
    Not(Box<SmtTerm>),
    Implies(Box<SmtTerm>, Box<SmtTerm>),
}

#[allow(clippy::should_implement_trait)]
impl SmtTerm {
    pub fn var(name: impl Into<String>) -> Self {
        SmtTerm::Var(name.into())
    }

    pub fn num(value: Rational) -> Self {
        SmtTerm::Num(value)
    }

    pub fn int(n: i64) -> Self {
        SmtTerm::Num(rational::from_i64(n))
    }

    pub fn bool(b: bool) -> Self {
        SmtTerm::BoolLit(b)
    }

    pub fn add(self, other: SmtTerm) -> Self {
        SmtTerm::Add(Box::new(self), Box::new(other))
    }

    pub fn sub(self, other: SmtTerm) -> Self {
        SmtTerm::Sub(Box::new(self), Box::new(other))
    }

    pub fn mul(self, other: SmtTerm) -> Self {
        SmtTerm::Mul(Box::new(self), Box::new(other))
    }

    pub fn div(self, other: SmtTerm) -> Self {
        SmtTerm::Div(Box::new(self), Box::new(other))
    }

    pub fn neg(self) -> Self {
        SmtTerm::Neg(Box::new(self))
    }

    pub fn eq(self, other: SmtTerm) -> Self {
        SmtTerm::Eq(Box::new(self), Box::new(other))
    }

    pub fn lt(self, other: SmtTerm) -> Self {
        SmtTerm::Lt(Box::new(self), Box::new(other))
    }

    pub fn le(self, other: SmtTerm) -> Self {
        SmtTerm::Le(Box::new(self), Box::new(other))
    }

    pub fn gt(self, other: SmtTerm) -> Self {
        SmtTerm::Gt(Box::new(self), Box::new(other))
    }

    pub fn ge(self, other: SmtTerm) -> Self {
        SmtTerm::Ge(Box::new(self), Box::new(other))
    }

    pub fn and(terms: Vec<SmtTerm>) -> Self {
        SmtTerm::And(terms)
    }

    pub fn or(terms: Vec<SmtTerm>) -> Self {
        SmtTerm::Or(terms)
    }

    pub fn not(self) -> Self {
        SmtTerm::Not(Box::new(self))
    }

    pub fn implies(self, other: SmtTerm) -> Self {
        SmtTerm::Implies(Box::new(self), Box::new(other))
    }

    /// Left-folded sum; the empty sum is `0`.
    pub fn sum(terms: Vec<SmtTerm>) -> Self {
        let mut iter = terms.into_iter();
        match iter.next() {
            Some(first) => iter.fold(first, SmtTerm::add),
            None => SmtTerm::Num(Rational::zero()),
        }
    }

    /// Collect every variable name referenced by this term.
    pub fn collect_vars<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            SmtTerm::Var(name) => {
                if !out.contains(&name.as_str()) {
                    out.push(name);
                }
            }
            SmtTerm::Num(_) | SmtTerm::BoolLit(_) => {}
            SmtTerm::Neg(inner) | SmtTerm::Not(inner) => inner.collect_vars(out),
            SmtTerm::Add(l, r)
            | SmtTerm::Sub(l, r)
            | SmtTerm::Mul(l, r)
            | SmtTerm::Div(l, r)
            | SmtTerm::Eq(l, r)
            | SmtTerm::Lt(l, r)
            | SmtTerm::Le(l, r)
            | SmtTerm::Gt(l, r)
            | SmtTerm::Ge(l, r)
            | SmtTerm::Implies(l, r) => {
                l.collect_vars(out);
                r.collect_vars(out);
            }
            SmtTerm::And(terms) | SmtTerm::Or(terms) => {
                for t in terms {
                    t.collect_vars(out);
                }
            }
        }
    }
}
