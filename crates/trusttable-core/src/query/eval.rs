//! Restricted evaluator for grounding programs.
//!
//! Evaluation reads an immutable `&Table` and nothing else. Every row
//! visit ticks an [`EvalBudget`]; the wall-clock deadline is polled from
//! the same tick so a runaway program stops on its own even after its
//! caller has given up on it.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::QueryLimits;
use crate::table::{ColumnKind, Table, Value};

use super::ast::{AggFunc, ArithOp, CmpOp, Expectation, GroundingProgram, Predicate, Query};
use super::error::ExecutionError;

const NUMERIC_EPSILON: f64 = 1e-9;
const DEADLINE_POLL: u64 = 256;
const FOUND_LIMIT: usize = 20;

/// Result of evaluating a [`Query`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryResult {
    /// Row indices into the table, in result order.
    Rows { rows: Vec<usize> },
    Column { name: String, values: Vec<Value> },
    Scalar { value: Value },
}

impl QueryResult {
    fn kind(&self) -> &'static str {
        match self {
            QueryResult::Rows { .. } => "rows",
            QueryResult::Column { .. } => "column",
            QueryResult::Scalar { .. } => "scalar",
        }
    }
}

/// Outcome of a program that ran to completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub result: QueryResult,
    pub grounded: bool,
    /// Entities the claim asserts that the table does not contain.
    pub missing: Vec<Value>,
    /// Values the program actually produced, truncated.
    pub found: Vec<Value>,
}

#[derive(Debug)]
pub struct EvalBudget {
    max_steps: u64,
    used: u64,
    deadline: Option<(Instant, u64)>,
}

impl EvalBudget {
    pub fn new(max_steps: u64) -> Self {
        Self {
            max_steps,
            used: 0,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, limits: &QueryLimits) -> Self {
        self.deadline = Some((Instant::now() + limits.timeout(), limits.timeout_ms));
        self
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    fn tick(&mut self) -> Result<(), ExecutionError> {
        self.used += 1;
        if self.used > self.max_steps {
            return Err(ExecutionError::BudgetExceeded(self.max_steps));
        }
        if let Some((deadline, ms)) = self.deadline {
            if self.used % DEADLINE_POLL == 0 && Instant::now() >= deadline {
                return Err(ExecutionError::Timeout(ms));
            }
        }
        Ok(())
    }
}

struct Evaluator<'t> {
    table: &'t Table,
    budget: EvalBudget,
    misses: Vec<Value>,
}

impl<'t> Evaluator<'t> {
    fn eval(&mut self, query: &Query) -> Result<QueryResult, ExecutionError> {
        match query {
            Query::Rows => {
                let n = self.table.row_count();
                for _ in 0..n {
                    self.budget.tick()?;
                }
                Ok(QueryResult::Rows {
                    rows: (0..n).collect(),
                })
            }
            Query::Filter { input, predicate } => {
                let rows = self.rows_of(input, "filter")?;
                let mut kept = Vec::new();
                for &row in &rows {
                    self.budget.tick()?;
                    if self.test(predicate, row)? {
                        kept.push(row);
                    }
                }
                if kept.is_empty() {
                    self.record_misses(predicate, &rows, false)?;
                }
                Ok(QueryResult::Rows { rows: kept })
            }
            Query::Select { input, column } => {
                let rows = self.rows_of(input, "select")?;
                let idx = self.column(column)?;
                let mut values = Vec::with_capacity(rows.len());
                for row in rows {
                    self.budget.tick()?;
                    values.push(self.cell(row, idx));
                }
                Ok(QueryResult::Column {
                    name: self.table.columns()[idx].name.clone(),
                    values,
                })
            }
            Query::OrderBy {
                input,
                column,
                descending,
                limit,
            } => {
                let rows = self.rows_of(input, "order_by")?;
                let idx = self.column(column)?;
                let mut keyed = Vec::with_capacity(rows.len());
                for row in rows {
                    self.budget.tick()?;
                    keyed.push((row, self.cell(row, idx)));
                }
                keyed.sort_by(|(_, a), (_, b)| {
                    let ord = sort_order(a, b);
                    match (a.is_null(), b.is_null(), *descending) {
                        (false, false, true) => ord.reverse(),
                        _ => ord,
                    }
                });
                let mut rows: Vec<usize> = keyed.into_iter().map(|(row, _)| row).collect();
                if let Some(limit) = limit {
                    rows.truncate(*limit);
                }
                Ok(QueryResult::Rows { rows })
            }
            Query::Aggregate {
                input,
                func,
                column,
            } => self.aggregate(input, *func, column.as_deref()),
            Query::Arith { op, lhs, rhs } => {
                let l = self.eval(lhs)?;
                let l = scalar_number(&l, "arith lhs")?;
                let r = self.eval(rhs)?;
                let r = scalar_number(&r, "arith rhs")?;
                let value = match op {
                    ArithOp::Add => l + r,
                    ArithOp::Sub => l - r,
                    ArithOp::Mul => l * r,
                    ArithOp::Div => {
                        if r == 0.0 {
                            return Err(ExecutionError::DivisionByZero);
                        }
                        l / r
                    }
                };
                Ok(QueryResult::Scalar {
                    value: Value::Number(value),
                })
            }
            Query::Literal { value } => Ok(QueryResult::Scalar {
                value: value.clone(),
            }),
        }
    }

    fn aggregate(
        &mut self,
        input: &Query,
        func: AggFunc,
        column: Option<&str>,
    ) -> Result<QueryResult, ExecutionError> {
        let input = self.eval(input)?;
        let (values, kind) = match (input, column) {
            (QueryResult::Rows { rows }, None) if func == AggFunc::Count => {
                return Ok(QueryResult::Scalar {
                    value: Value::Number(rows.len() as f64),
                });
            }
            (QueryResult::Rows { rows }, Some(column)) => {
                let idx = self.column(column)?;
                let mut values = Vec::with_capacity(rows.len());
                for row in rows {
                    self.budget.tick()?;
                    values.push(self.cell(row, idx));
                }
                (values, Some(self.table.columns()[idx].clone()))
            }
            (QueryResult::Column { values, .. }, _) => (values, None),
            (other, _) => {
                return Err(ExecutionError::InvalidProgram(format!(
                    "aggregate needs rows with a column or a column, got {}",
                    other.kind()
                )))
            }
        };
        let values: Vec<Value> = values.into_iter().filter(|v| !v.is_null()).collect();

        if let Some(col) = &kind {
            let text_like = matches!(
                col.kind,
                ColumnKind::Text | ColumnKind::Categorical | ColumnKind::Boolean
            );
            if text_like && func != AggFunc::Count {
                return Err(ExecutionError::NotAggregatable {
                    column: col.name.clone(),
                    kind: col.kind,
                    func: format!("{func:?}").to_lowercase(),
                });
            }
        }

        let value = match func {
            AggFunc::Count => Value::Number(values.len() as f64),
            AggFunc::Sum => Value::Number(numbers(&values)?.iter().sum()),
            AggFunc::Avg => {
                let nums = numbers(&values)?;
                if nums.is_empty() {
                    return Err(ExecutionError::EmptyAggregate);
                }
                Value::Number(nums.iter().sum::<f64>() / nums.len() as f64)
            }
            AggFunc::Min | AggFunc::Max => {
                let want = if func == AggFunc::Max {
                    Ordering::Greater
                } else {
                    Ordering::Less
                };
                let mut best: Option<&Value> = None;
                for v in &values {
                    if v.as_number().is_none() && v.as_date().is_none() {
                        return Err(ExecutionError::TypeMismatch(format!(
                            "cannot take {func:?} of {v}"
                        )));
                    }
                    best = match best {
                        Some(b) if sort_order(v, b) != want => Some(b),
                        _ => Some(v),
                    };
                }
                best.cloned().ok_or(ExecutionError::EmptyAggregate)?
            }
        };
        Ok(QueryResult::Scalar { value })
    }

    fn rows_of(&mut self, input: &Query, op: &str) -> Result<Vec<usize>, ExecutionError> {
        match self.eval(input)? {
            QueryResult::Rows { rows } => Ok(rows),
            other => Err(ExecutionError::InvalidProgram(format!(
                "{op} needs rows, got {}",
                other.kind()
            ))),
        }
    }

    fn column(&self, name: &str) -> Result<usize, ExecutionError> {
        self.table
            .column_index(name)
            .ok_or_else(|| ExecutionError::UnknownColumn(name.to_string()))
    }

    fn cell(&self, row: usize, column: usize) -> Value {
        self.table.cell(row, column).cloned().unwrap_or(Value::Null)
    }

    fn test(&self, predicate: &Predicate, row: usize) -> Result<bool, ExecutionError> {
        match predicate {
            Predicate::Compare { column, op, value } => {
                let cell = self.cell(row, self.column(column)?);
                compare(&cell, *op, value)
            }
            Predicate::Contains { column, needle } => {
                let cell = self.cell(row, self.column(column)?);
                let needle = Value::text(needle.as_str()).normalized_text();
                Ok(cell.normalized_text().contains(&needle))
            }
            Predicate::And { predicates } => {
                for p in predicates {
                    if !self.test(p, row)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Or { predicates } => {
                for p in predicates {
                    if self.test(p, row)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Predicate::Not { predicate } => Ok(!self.test(predicate, row)?),
        }
    }

    /// Record each positive equality leaf that no input row satisfies.
    fn record_misses(
        &mut self,
        predicate: &Predicate,
        rows: &[usize],
        negated: bool,
    ) -> Result<(), ExecutionError> {
        match predicate {
            Predicate::Compare {
                column,
                op: CmpOp::Eq,
                value,
            } if !negated => {
                let idx = self.column(column)?;
                let mut hit = false;
                for &row in rows {
                    self.budget.tick()?;
                    if values_equal(&self.cell(row, idx), value) {
                        hit = true;
                        break;
                    }
                }
                if !hit && !self.misses.contains(value) {
                    self.misses.push(value.clone());
                }
                Ok(())
            }
            Predicate::And { predicates } | Predicate::Or { predicates } => {
                for p in predicates {
                    self.record_misses(p, rows, negated)?;
                }
                Ok(())
            }
            Predicate::Not { predicate } => self.record_misses(predicate, rows, !negated),
            _ => Ok(()),
        }
    }
}

/// Type-aware equality: numbers within tolerance, then dates, then
/// trimmed case-insensitive text.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        _ => {
            if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
                return numbers_close(x, y, NUMERIC_EPSILON);
            }
            if let (Some(x), Some(y)) = (a.as_date(), b.as_date()) {
                return x == y;
            }
            if let (Some(x), Some(y)) = (a.as_bool(), b.as_bool()) {
                return x == y;
            }
            a.normalized_text() == b.normalized_text()
        }
    }
}

/// Relative comparison with an absolute floor of `tolerance` near zero.
pub fn numbers_close(x: f64, y: f64, tolerance: f64) -> bool {
    (x - y).abs() <= tolerance * x.abs().max(y.abs()).max(1.0)
}

fn compare(cell: &Value, op: CmpOp, value: &Value) -> Result<bool, ExecutionError> {
    match op {
        CmpOp::Eq => return Ok(values_equal(cell, value)),
        CmpOp::Ne => return Ok(!values_equal(cell, value)),
        _ => {}
    }
    if cell.is_null() || value.is_null() {
        return Ok(false);
    }
    let ord = if let (Some(x), Some(y)) = (cell.as_number(), value.as_number()) {
        x.partial_cmp(&y)
    } else if let (Some(x), Some(y)) = (cell.as_date(), value.as_date()) {
        Some(x.cmp(&y))
    } else {
        return Err(ExecutionError::TypeMismatch(format!(
            "cannot order {cell:?} against {value:?}"
        )));
    };
    let Some(ord) = ord else {
        return Ok(false);
    };
    Ok(match op {
        CmpOp::Lt => ord == Ordering::Less,
        CmpOp::Le => ord != Ordering::Greater,
        CmpOp::Gt => ord == Ordering::Greater,
        CmpOp::Ge => ord != Ordering::Less,
        CmpOp::Eq | CmpOp::Ne => false,
    })
}

/// Total order for sorting: nulls last, then numbers, dates, text.
fn sort_order(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        _ => {}
    }
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return x.total_cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_date(), b.as_date()) {
        return x.cmp(&y);
    }
    a.normalized_text().cmp(&b.normalized_text())
}

fn numbers(values: &[Value]) -> Result<Vec<f64>, ExecutionError> {
    values
        .iter()
        .map(|v| {
            v.as_number()
                .ok_or_else(|| ExecutionError::TypeMismatch(format!("{v} is not numeric")))
        })
        .collect()
}

fn scalar_number(result: &QueryResult, what: &str) -> Result<f64, ExecutionError> {
    let value = match result {
        QueryResult::Scalar { value } => value,
        QueryResult::Column { values, .. } if values.len() == 1 => &values[0],
        other => {
            return Err(ExecutionError::InvalidProgram(format!(
                "{what} must be a single value, got {}",
                other.kind()
            )))
        }
    };
    value
        .as_number()
        .ok_or_else(|| ExecutionError::TypeMismatch(format!("{what} {value} is not numeric")))
}

/// Evaluate a bare query.
pub fn evaluate(
    table: &Table,
    query: &Query,
    budget: EvalBudget,
) -> Result<QueryResult, ExecutionError> {
    let mut evaluator = Evaluator {
        table,
        budget,
        misses: Vec::new(),
    };
    evaluator.eval(query)
}

/// Run a program synchronously within `limits`.
pub fn run_program(
    table: &Table,
    program: &GroundingProgram,
    limits: &QueryLimits,
) -> Result<Execution, ExecutionError> {
    let depth = program.depth();
    if depth > limits.max_depth {
        return Err(ExecutionError::DepthExceeded {
            depth,
            limit: limits.max_depth,
        });
    }
    let mut evaluator = Evaluator {
        table,
        budget: EvalBudget::new(limits.max_steps).with_deadline(limits),
        misses: Vec::new(),
    };
    let result = evaluator.eval(&program.query)?;
    let found = found_values(table, &result);
    let (grounded, expected_missing) = check(&program.expect, &result, &found)?;
    let missing = if grounded {
        Vec::new()
    } else if !evaluator.misses.is_empty() {
        evaluator.misses
    } else {
        expected_missing
    };
    Ok(Execution {
        result,
        grounded,
        missing,
        found,
    })
}

/// Run a program on the blocking pool under the configured wall-clock bound.
pub async fn execute_program(
    table: Arc<Table>,
    program: GroundingProgram,
    limits: QueryLimits,
) -> Result<Execution, ExecutionError> {
    let timeout = limits.timeout();
    let timeout_ms = limits.timeout_ms;
    let handle = tokio::task::spawn_blocking(move || run_program(&table, &program, &limits));
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(join)) => Err(ExecutionError::InvalidProgram(format!(
            "evaluator task failed: {join}"
        ))),
        Err(_) => Err(ExecutionError::Timeout(timeout_ms)),
    }
}

fn found_values(table: &Table, result: &QueryResult) -> Vec<Value> {
    match result {
        QueryResult::Scalar { value } => vec![value.clone()],
        QueryResult::Column { values, .. } => values.iter().take(FOUND_LIMIT).cloned().collect(),
        QueryResult::Rows { rows } => rows
            .iter()
            .take(FOUND_LIMIT)
            .filter_map(|&r| table.rows().get(r))
            .map(|row| {
                Value::Text(
                    row.iter()
                        .map(|v| v.to_string())
                        .collect::<Vec<_>>()
                        .join(" | "),
                )
            })
            .collect(),
    }
}

/// Test the expectation; on failure also return what was expected but absent.
fn check(
    expect: &Expectation,
    result: &QueryResult,
    found: &[Value],
) -> Result<(bool, Vec<Value>), ExecutionError> {
    let outcome = match expect {
        Expectation::Holds => (true, Vec::new()),
        Expectation::NonEmpty => {
            let ok = match result {
                QueryResult::Rows { rows } => !rows.is_empty(),
                QueryResult::Column { values, .. } => values.iter().any(|v| !v.is_null()),
                QueryResult::Scalar { value } => !value.is_null(),
            };
            (ok, Vec::new())
        }
        Expectation::Count { n } => {
            let actual = match result {
                QueryResult::Rows { rows } => rows.len(),
                QueryResult::Column { values, .. } => values.len(),
                QueryResult::Scalar { value } => {
                    let ok = value
                        .as_number()
                        .is_some_and(|v| numbers_close(v, *n as f64, NUMERIC_EPSILON));
                    return Ok((ok, vec![Value::Number(*n as f64)]));
                }
            };
            (actual == *n, vec![Value::Number(*n as f64)])
        }
        Expectation::Equals { value } => {
            let ok = match result {
                QueryResult::Scalar { value: got } => values_equal(got, value),
                QueryResult::Column { values, .. } => {
                    !values.is_empty() && values.iter().all(|v| values_equal(v, value))
                }
                QueryResult::Rows { .. } => {
                    return Err(ExecutionError::InvalidProgram(
                        "equals needs a scalar or column result".into(),
                    ))
                }
            };
            (ok, vec![value.clone()])
        }
        Expectation::ContainsAll { values } => {
            let absent: Vec<Value> = values
                .iter()
                .filter(|want| !contained(want, result, found))
                .cloned()
                .collect();
            (absent.is_empty(), absent)
        }
    };
    Ok(outcome)
}

fn contained(want: &Value, result: &QueryResult, found: &[Value]) -> bool {
    match result {
        QueryResult::Rows { .. } => found.iter().any(|row| {
            row.to_string()
                .split(" | ")
                .any(|cell| values_equal(&Value::text(cell), want))
        }),
        QueryResult::Column { values, .. } => values.iter().any(|v| values_equal(v, want)),
        QueryResult::Scalar { value } => values_equal(value, want),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::Predicate;

    fn table() -> Table {
        let s = |cells: &[&str]| cells.iter().map(|c| c.to_string()).collect::<Vec<_>>();
        Table::from_raw(
            "clubs",
            s(&["Team", "Wins", "Founded"]),
            vec![
                s(&["Ajax", "12", "1900-03-18"]),
                s(&["PSV", "9", "1913-08-31"]),
                s(&["Feyenoord", "15", "1908-07-19"]),
            ],
        )
        .unwrap()
    }

    fn limits() -> QueryLimits {
        QueryLimits::default()
    }

    #[test]
    fn lookup_equals() {
        let program = GroundingProgram {
            query: Query::select(
                Query::filter(Query::Rows, Predicate::eq("team", " ajax ")),
                "Wins",
            ),
            expect: Expectation::Equals { value: Value::Number(12.0) },
        };
        let exec = run_program(&table(), &program, &limits()).unwrap();
        assert!(exec.grounded);
        assert_eq!(exec.found, vec![Value::Number(12.0)]);
    }

    #[test]
    fn missing_entity_is_named() {
        let program = GroundingProgram {
            query: Query::select(
                Query::filter(Query::Rows, Predicate::eq("Team", "Twente")),
                "Wins",
            ),
            expect: Expectation::Equals { value: Value::Number(20.0) },
        };
        let exec = run_program(&table(), &program, &limits()).unwrap();
        assert!(!exec.grounded);
        assert_eq!(exec.missing, vec![Value::text("Twente")]);
    }

    #[test]
    fn wrong_value_reports_expected_and_found() {
        let program = GroundingProgram {
            query: Query::aggregate(Query::Rows, AggFunc::Max, Some("Wins")),
            expect: Expectation::Equals { value: Value::Number(12.0) },
        };
        let exec = run_program(&table(), &program, &limits()).unwrap();
        assert!(!exec.grounded);
        assert_eq!(exec.missing, vec![Value::Number(12.0)]);
        assert_eq!(exec.found, vec![Value::Number(15.0)]);
    }

    #[test]
    fn aggregates_and_arith() {
        let t = table();
        let total = Query::aggregate(Query::Rows, AggFunc::Sum, Some("Wins"));
        let count = Query::aggregate(Query::Rows, AggFunc::Count, None);
        let avg = Query::Arith {
            op: ArithOp::Div,
            lhs: Box::new(total),
            rhs: Box::new(count),
        };
        let result = evaluate(&t, &avg, EvalBudget::new(100)).unwrap();
        assert_eq!(result, QueryResult::Scalar { value: Value::Number(12.0) });

        let earliest = Query::aggregate(Query::Rows, AggFunc::Min, Some("Founded"));
        let result = evaluate(&t, &earliest, EvalBudget::new(100)).unwrap();
        let founded = chrono::NaiveDate::from_ymd_opt(1900, 3, 18).unwrap();
        assert_eq!(result, QueryResult::Scalar { value: Value::Date(founded) });
    }

    #[test]
    fn text_columns_do_not_sum() {
        let q = Query::aggregate(Query::Rows, AggFunc::Sum, Some("Team"));
        let err = evaluate(&table(), &q, EvalBudget::new(100)).unwrap_err();
        assert!(matches!(err, ExecutionError::NotAggregatable { .. }));
    }

    #[test]
    fn order_by_descending_with_limit() {
        let q = Query::select(
            Query::OrderBy {
                input: Box::new(Query::Rows),
                column: "Wins".into(),
                descending: true,
                limit: Some(2),
            },
            "Team",
        );
        let result = evaluate(&table(), &q, EvalBudget::new(100)).unwrap();
        assert_eq!(
            result,
            QueryResult::Column {
                name: "Team".into(),
                values: vec![Value::text("Feyenoord"), Value::text("Ajax")],
            }
        );
    }

    #[test]
    fn step_budget_is_enforced() {
        let q = Query::filter(Query::Rows, Predicate::eq("Team", "PSV"));
        let err = evaluate(&table(), &q, EvalBudget::new(4)).unwrap_err();
        assert_eq!(err, ExecutionError::BudgetExceeded(4));
    }

    #[test]
    fn depth_limit_checked_before_running() {
        let mut q = Query::Rows;
        for _ in 0..5 {
            q = Query::filter(q, Predicate::eq("Team", "Ajax"));
        }
        let program = GroundingProgram { query: q, expect: Expectation::NonEmpty };
        let limits = QueryLimits { max_depth: 3, ..QueryLimits::default() };
        let err = run_program(&table(), &program, &limits).unwrap_err();
        assert_eq!(err, ExecutionError::DepthExceeded { depth: 6, limit: 3 });
    }

    #[test]
    fn ordering_text_is_a_type_error() {
        let q = Query::filter(
            Query::Rows,
            Predicate::Compare { column: "Team".into(), op: CmpOp::Gt, value: Value::text("B") },
        );
        assert!(matches!(
            evaluate(&table(), &q, EvalBudget::new(100)),
            Err(ExecutionError::TypeMismatch(_))
        ));
    }

    #[test]
    fn contains_all_lists_absent_values() {
        let program = GroundingProgram {
            query: Query::select(Query::Rows, "Team"),
            expect: Expectation::ContainsAll {
                values: vec![Value::text("psv"), Value::text("AZ")],
            },
        };
        let exec = run_program(&table(), &program, &limits()).unwrap();
        assert!(!exec.grounded);
        assert_eq!(exec.missing, vec![Value::text("AZ")]);
    }

    #[tokio::test]
    async fn execute_program_runs_off_thread() {
        let program = GroundingProgram {
            query: Query::filter(Query::Rows, Predicate::eq("Wins", Value::Number(9.0))),
            expect: Expectation::Count { n: 1 },
        };
        let exec = execute_program(Arc::new(table()), program, limits()).await.unwrap();
        assert!(exec.grounded);
    }
}
