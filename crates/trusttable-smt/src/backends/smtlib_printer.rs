use num::bigint::BigInt;
use num::traits::Signed;

use crate::rational::Rational;
use crate::sorts::SmtSort;
use crate::terms::SmtTerm;

/// Print a rational as an SMT-LIB2 real literal.
pub fn rational_to_smtlib(value: &Rational) -> String {
    let magnitude = |n: &BigInt| format!("{}.0", n.abs());
    let body = if value.is_integer() {
        magnitude(value.numer())
    } else {
        format!("(/ {} {})", magnitude(value.numer()), magnitude(value.denom()))
    };
    if value.is_negative() {
        format!("(- {body})")
    } else {
        body
    }
}

/// Print an SmtTerm as SMT-LIB2 format.
pub fn to_smtlib(term: &SmtTerm) -> String {
    match term {
        SmtTerm::Var(name) => name.clone(),
        SmtTerm::Num(value) => rational_to_smtlib(value),
        SmtTerm::BoolLit(b) => {
            if *b {
                "true".to_string()
            } else {
                "false".to_string()
            }
        }
        SmtTerm::Add(lhs, rhs) => format!("(+ {} {})", to_smtlib(lhs), to_smtlib(rhs)),
        SmtTerm::Sub(lhs, rhs) => format!("(- {} {})", to_smtlib(lhs), to_smtlib(rhs)),
        SmtTerm::Mul(lhs, rhs) => format!("(* {} {})", to_smtlib(lhs), to_smtlib(rhs)),
        SmtTerm::Div(lhs, rhs) => format!("(/ {} {})", to_smtlib(lhs), to_smtlib(rhs)),
        SmtTerm::Neg(inner) => format!("(- {})", to_smtlib(inner)),
        SmtTerm::Eq(lhs, rhs) => format!("(= {} {})", to_smtlib(lhs), to_smtlib(rhs)),
        SmtTerm::Lt(lhs, rhs) => format!("(< {} {})", to_smtlib(lhs), to_smtlib(rhs)),
        SmtTerm::Le(lhs, rhs) => format!("(<= {} {})", to_smtlib(lhs), to_smtlib(rhs)),
        SmtTerm::Gt(lhs, rhs) => format!("(> {} {})", to_smtlib(lhs), to_smtlib(rhs)),
        SmtTerm::Ge(lhs, rhs) => format!("(>= {} {})", to_smtlib(lhs), to_smtlib(rhs)),
        SmtTerm::And(terms) => {
            if terms.is_empty() {
                "true".to_string()
            } else if terms.len() == 1 {
                to_smtlib(&terms[0])
            } else {
                let inner: Vec<String> = terms.iter().map(to_smtlib).collect();
                format!("(and {})", inner.join(" "))
            }
        }
        SmtTerm::Or(terms) => {
            if terms.is_empty() {
                "false".to_string()
            } else if terms.len() == 1 {
                to_smtlib(&terms[0])
            } else {
                let inner: Vec<String> = terms.iter().map(to_smtlib).collect();
                format!("(or {})", inner.join(" "))
            }
        }
        SmtTerm::Not(inner) => format!("(not {})", to_smtlib(inner)),
        SmtTerm::Implies(lhs, rhs) => {
            format!("(=> {} {})", to_smtlib(lhs), to_smtlib(rhs))
        }
    }
}

/// Print a sort as SMT-LIB2 format.
pub fn sort_to_smtlib(sort: &SmtSort) -> &'static str {
    match sort {
        SmtSort::Bool => "Bool",
        SmtSort::Int => "Int",
        SmtSort::Real => "Real",
    }
}
