//! ConsistencyMonitor: compares the stated final answer with the value the
//! reasoning actually computes.

use serde::{Deserialize, Serialize};

use crate::logic_auditor::ComputedValue;
use crate::table::{decimal_places, extract_number, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyStatus {
    Match,
    Mismatch,
    /// Nothing was computed to compare against.
    NotApplicable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyVerdict {
    pub status: ConsistencyStatus,
    pub computed: Option<Value>,
    pub stated: String,
}

impl ConsistencyVerdict {
    pub fn is_mismatch(&self) -> bool {
        self.status == ConsistencyStatus::Mismatch
    }
}

/// How far the exact value may sit from a stated number written with
/// `decimals` places: `relative` scaled by the magnitude, widened to half a
/// unit in the last written place. `33.33` covers `100/3`.
pub fn answer_tolerance(stated: f64, decimals: usize, relative: f64) -> f64 {
    let scaled = relative * stated.abs().max(1.0);
    if decimals == 0 {
        return scaled;
    }
    let exponent = i32::try_from(decimals).unwrap_or(i32::MAX);
    scaled.max(0.5 * 10f64.powi(-exponent))
}

/// Compare `stated` with `computed`, reading the stated answer as the
/// computed value's type. Numbers agree within [`answer_tolerance`].
pub fn check_consistency(
    computed: Option<&ComputedValue>,
    stated: &str,
    tolerance: f64,
) -> ConsistencyVerdict {
    let verdict = |status, computed: Option<Value>| ConsistencyVerdict {
        status,
        computed,
        stated: stated.to_string(),
    };
    let Some(computed) = computed.filter(|c| !c.value.is_null()) else {
        return verdict(ConsistencyStatus::NotApplicable, None);
    };

    let stated_value = Value::text(stated.trim());
    let agrees = match &computed.value {
        Value::Number(x) => extract_number(stated).is_some_and(|y| {
            (x - y).abs() <= answer_tolerance(y, decimal_places(stated), tolerance)
        }),
        Value::Date(d) => stated_value.as_date() == Some(*d),
        Value::Bool(b) => stated_bool(stated) == Some(*b),
        other => other.normalized_text() == stated_value.normalized_text(),
    };
    let status = if agrees {
        ConsistencyStatus::Match
    } else {
        ConsistencyStatus::Mismatch
    };
    tracing::debug!(target_var = %computed.target, status = ?status, "consistency checked");
    verdict(status, Some(computed.value.clone()))
}

fn stated_bool(stated: &str) -> Option<bool> {
    let normalized = stated.trim().trim_end_matches('.').to_ascii_lowercase();
    match normalized.as_str() {
        "yes" | "true" => Some(true),
        "no" | "false" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn computed(value: Value) -> ComputedValue {
        ComputedValue {
            target: "answer".into(),
            value,
        }
    }

    #[test]
    fn numeric_answers_tolerate_formatting() {
        let c = computed(Value::Number(1200.0));
        assert_eq!(check_consistency(Some(&c), "$1,200", 1e-6).status, ConsistencyStatus::Match);
        assert_eq!(check_consistency(Some(&c), "1200.0000001", 1e-6).status, ConsistencyStatus::Match);
        assert_eq!(check_consistency(Some(&c), "1210", 1e-6).status, ConsistencyStatus::Mismatch);
    }

    #[test]
    fn rounded_answers_match_within_their_last_place() {
        let third = computed(Value::Number(100.0 / 3.0));
        assert_eq!(check_consistency(Some(&third), "33.33", 1e-6).status, ConsistencyStatus::Match);
        assert_eq!(check_consistency(Some(&third), "33.3", 1e-6).status, ConsistencyStatus::Match);
        assert_eq!(check_consistency(Some(&third), "33.32", 1e-6).status, ConsistencyStatus::Mismatch);
        assert_eq!(check_consistency(Some(&third), "33", 1e-6).status, ConsistencyStatus::Mismatch);
    }

    #[test]
    fn the_last_number_in_the_answer_is_compared() {
        let third = computed(Value::Number(100.0 / 3.0));
        let v = check_consistency(Some(&third), "100 / 3 = 33.33", 1e-6);
        assert_eq!(v.status, ConsistencyStatus::Match);
    }

    #[test]
    fn tolerance_widens_with_written_precision_only() {
        assert!((answer_tolerance(33.33, 2, 1e-6) - 0.005).abs() < 1e-12);
        assert!((answer_tolerance(1200.0, 0, 1e-6) - 1.2e-3).abs() < 1e-12);
        assert_eq!(answer_tolerance(0.0, 0, 1e-6), 1e-6);
    }

    #[test]
    fn stated_answer_disagreeing_with_computation_is_mismatch() {
        let c = computed(Value::Number(150.0));
        let v = check_consistency(Some(&c), "120", 1e-6);
        assert!(v.is_mismatch());
        assert_eq!(v.computed, Some(Value::Number(150.0)));
        assert_eq!(v.stated, "120");
    }

    #[test]
    fn text_dates_and_booleans() {
        let team = computed(Value::text("Ajax"));
        assert_eq!(check_consistency(Some(&team), "  ajax ", 1e-6).status, ConsistencyStatus::Match);
        let day = computed(Value::Date(NaiveDate::from_ymd_opt(2021, 5, 1).unwrap()));
        assert_eq!(check_consistency(Some(&day), "2021-05-01", 1e-6).status, ConsistencyStatus::Match);
        let flag = computed(Value::Bool(true));
        assert_eq!(check_consistency(Some(&flag), "yes", 1e-6).status, ConsistencyStatus::Match);
    }

    #[test]
    fn nothing_computed_is_not_applicable() {
        assert_eq!(check_consistency(None, "42", 1e-6).status, ConsistencyStatus::NotApplicable);
        let null = computed(Value::Null);
        assert_eq!(check_consistency(Some(&null), "42", 1e-6).status, ConsistencyStatus::NotApplicable);
    }
}
