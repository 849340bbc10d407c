pub mod process;
pub(crate) mod sexpr;
pub mod smtlib_printer;
pub mod z3_backend;
