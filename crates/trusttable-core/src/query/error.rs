use crate::table::ColumnKind;

/// A synthesized program could not be parsed.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum QueryError {
    #[error("malformed grounding program: {0}")]
    Malformed(String),
}

/// A grounding program failed while running against a table.
///
/// Any execution error leaves the claim ungrounded.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("unknown column: {0}")]
    UnknownColumn(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("column {column} ({kind}) cannot be aggregated with {func}")]
    NotAggregatable {
        column: String,
        kind: ColumnKind,
        func: String,
    },

    #[error("step budget of {0} row visits exceeded")]
    BudgetExceeded(u64),

    #[error("execution timed out after {0} ms")]
    Timeout(u64),

    #[error("program nesting depth {depth} exceeds limit {limit}")]
    DepthExceeded { depth: usize, limit: usize },

    #[error("division by zero")]
    DivisionByZero,

    #[error("aggregate over an empty input")]
    EmptyAggregate,

    #[error("invalid program: {0}")]
    InvalidProgram(String),
}
