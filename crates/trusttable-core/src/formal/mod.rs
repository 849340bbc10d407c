//! Formal constraint language for the LogicAuditor.

pub mod ast;
pub mod encode;

pub use ast::{
    value_fits, Conclusion, Constraint, Expr, Formalization, FormalizationError, VarDecl, VarKind,
};
pub use encode::{encode, Encoding};
