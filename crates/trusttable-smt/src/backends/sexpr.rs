//! SMT-LIB2 s-expressions as solvers print them back.

use num::traits::Zero;

use crate::rational::{self, Rational};
use crate::solver::SolverError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Sexpr {
    Atom(String),
    List(Vec<Sexpr>),
}

pub(crate) fn parse_sexpr(input: &str) -> Result<Sexpr, SolverError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in input.chars() {
        match c {
            '(' | ')' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                tokens.push(c.to_string());
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    let mut pos = 0;
    let expr = parse_tokens(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(SolverError::Parse(format!("trailing input in `{input}`")));
    }
    Ok(expr)
}

fn parse_tokens(tokens: &[String], pos: &mut usize) -> Result<Sexpr, SolverError> {
    let token = tokens
        .get(*pos)
        .ok_or_else(|| SolverError::Parse("unexpected end of s-expression".into()))?;
    *pos += 1;
    match token.as_str() {
        "(" => {
            let mut items = Vec::new();
            loop {
                match tokens.get(*pos).map(String::as_str) {
                    Some(")") => {
                        *pos += 1;
                        return Ok(Sexpr::List(items));
                    }
                    Some(_) => items.push(parse_tokens(tokens, pos)?),
                    None => return Err(SolverError::Parse("unbalanced parentheses".into())),
                }
            }
        }
        ")" => Err(SolverError::Parse("unexpected `)`".into())),
        atom => Ok(Sexpr::Atom(atom.to_string())),
    }
}

/// Numerals come back as `60.0`, `(- 3.0)`, `(/ 121.0 2.0)` or `121/2`.
pub(crate) fn sexpr_to_rational(expr: &Sexpr) -> Option<Rational> {
    match expr {
        Sexpr::Atom(text) => match text.split_once('/') {
            Some((num, den)) => {
                checked_div(rational::parse_decimal(num)?, rational::parse_decimal(den)?)
            }
            None => rational::parse_decimal(text),
        },
        Sexpr::List(items) => match items.as_slice() {
            [Sexpr::Atom(op), inner] if op == "-" => sexpr_to_rational(inner).map(|r| -r),
            [Sexpr::Atom(op), num, den] if op == "/" => {
                checked_div(sexpr_to_rational(num)?, sexpr_to_rational(den)?)
            }
            _ => None,
        },
    }
}

fn checked_div(num: Rational, den: Rational) -> Option<Rational> {
    (!den.is_zero()).then(|| num / den)
}

/// Parse a printed numeral such as a model value's display form.
pub(crate) fn parse_numeral(text: &str) -> Option<Rational> {
    parse_sexpr(text).ok().as_ref().and_then(sexpr_to_rational)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ratio(n: i64, d: i64) -> Rational {
        Rational::new(n.into(), d.into())
    }

    #[test]
    fn numerals_in_every_printed_form() {
        assert_eq!(parse_numeral("60.0"), Some(rational::from_i64(60)));
        assert_eq!(parse_numeral("(- 3.0)"), Some(rational::from_i64(-3)));
        assert_eq!(parse_numeral("(/ 100.0 3.0)"), Some(ratio(100, 3)));
        assert_eq!(parse_numeral("(- (/ 1.0 3.0))"), Some(ratio(-1, 3)));
        assert_eq!(parse_numeral("121/2"), Some(ratio(121, 2)));
    }

    #[test]
    fn zero_denominators_and_junk_are_rejected() {
        assert_eq!(parse_numeral("(/ 1.0 0.0)"), None);
        assert_eq!(parse_numeral("1/0"), None);
        assert_eq!(parse_numeral("(+ 1.0 2.0)"), None);
        assert!(parse_sexpr("((x 1.0)").is_err());
        assert!(parse_sexpr(")").is_err());
    }
}
