//! Solver-agnostic SMT layer for TrustTable.
//!
//! Terms are built once and handed to any [`SmtSolver`] backend: the
//! in-process [`Z3Solver`] or a [`ProcessSolver`] speaking SMT-LIB2 to an
//! external binary. Numbers are exact [`Rational`]s throughout.

pub mod backends;
pub mod rational;
pub mod solver;
pub mod sorts;
pub mod terms;

pub use backends::process::{KillHandle, ProcessSolver};
pub use backends::smtlib_printer::{sort_to_smtlib, to_smtlib};
pub use backends::z3_backend::Z3Solver;
pub use rational::Rational;
pub use solver::{Model, ModelValue, SatResult, SmtSolver, SolverError};
pub use sorts::SmtSort;
pub use terms::SmtTerm;
