//! Sandboxed table queries used to ground factual claims.

pub mod ast;
pub mod error;
pub mod eval;

pub use ast::{AggFunc, ArithOp, CmpOp, Expectation, GroundingProgram, Predicate, Query};
pub use error::{ExecutionError, QueryError};
pub use eval::{
    evaluate, execute_program, numbers_close, run_program, values_equal, EvalBudget, Execution,
    QueryResult,
};
