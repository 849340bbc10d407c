//! Grounding program grammar.
//!
//! A program is a finite, strictly typed tree over table operators plus
//! an expectation on the result. It is the only thing a synthesized
//! query can express; there is no variable binding, no loops and no
//! access to anything but the table it is evaluated against.

use serde::{Deserialize, Serialize};

use crate::table::Value;

use super::error::QueryError;

/// A synthesized check: evaluate `query`, then test `expect` on the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroundingProgram {
    pub query: Query,
    pub expect: Expectation,
}

impl GroundingProgram {
    /// Parse a program from model output (code fences already stripped).
    pub fn parse(text: &str) -> Result<Self, QueryError> {
        serde_json::from_str(text).map_err(|e| QueryError::Malformed(e.to_string()))
    }

    /// Deepest nesting of query and predicate nodes.
    pub fn depth(&self) -> usize {
        self.query.depth()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Query {
    /// Every row of the table.
    Rows,
    Filter {
        input: Box<Query>,
        predicate: Predicate,
    },
    Select {
        input: Box<Query>,
        column: String,
    },
    OrderBy {
        input: Box<Query>,
        column: String,
        #[serde(default)]
        descending: bool,
        #[serde(default)]
        limit: Option<usize>,
    },
    Aggregate {
        input: Box<Query>,
        func: AggFunc,
        /// Required for every function except `count`.
        #[serde(default)]
        column: Option<String>,
    },
    Arith {
        op: ArithOp,
        lhs: Box<Query>,
        rhs: Box<Query>,
    },
    Literal {
        value: Value,
    },
}

impl Query {
    pub fn depth(&self) -> usize {
        1 + match self {
            Query::Rows | Query::Literal { .. } => 0,
            Query::Filter { input, predicate } => input.depth().max(predicate.depth()),
            Query::Select { input, .. }
            | Query::OrderBy { input, .. }
            | Query::Aggregate { input, .. } => input.depth(),
            Query::Arith { lhs, rhs, .. } => lhs.depth().max(rhs.depth()),
        }
    }

    pub fn filter(input: Query, predicate: Predicate) -> Self {
        Query::Filter {
            input: Box::new(input),
            predicate,
        }
    }

    pub fn select(input: Query, column: impl Into<String>) -> Self {
        Query::Select {
            input: Box::new(input),
            column: column.into(),
        }
    }

    pub fn aggregate(input: Query, func: AggFunc, column: Option<&str>) -> Self {
        Query::Aggregate {
            input: Box::new(input),
            func,
            column: column.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    Compare {
        column: String,
        op: CmpOp,
        value: Value,
    },
    /// Case-insensitive substring match.
    Contains {
        column: String,
        needle: String,
    },
    And {
        predicates: Vec<Predicate>,
    },
    Or {
        predicates: Vec<Predicate>,
    },
    Not {
        predicate: Box<Predicate>,
    },
}

impl Predicate {
    pub fn depth(&self) -> usize {
        1 + match self {
            Predicate::Compare { .. } | Predicate::Contains { .. } => 0,
            Predicate::And { predicates } | Predicate::Or { predicates } => {
                predicates.iter().map(Predicate::depth).max().unwrap_or(0)
            }
            Predicate::Not { predicate } => predicate.depth(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            column: column.into(),
            op: CmpOp::Eq,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expectation {
    /// A scalar result, or a single-cell column, equals `value`.
    Equals { value: Value },
    /// Every value occurs in the result.
    ContainsAll { values: Vec<Value> },
    NonEmpty,
    Count { n: usize },
    /// Statement of intent; grounded whenever the query runs.
    Holds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}
