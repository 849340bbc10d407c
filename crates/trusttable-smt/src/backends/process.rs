use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use num::traits::ToPrimitive;
use tracing::{debug, warn};

use crate::backends::sexpr::{parse_sexpr, sexpr_to_rational, Sexpr};
use crate::backends::smtlib_printer::{sort_to_smtlib, to_smtlib};
use crate::solver::{Model, ModelValue, SatResult, SmtSolver, SolverError};
use crate::sorts::SmtSort;
use crate::terms::SmtTerm;

pub const DEFAULT_PROGRAM: &str = "z3";
pub const DEFAULT_LOGIC: &str = "QF_LRA";

/// Drives an external SMT-LIB2 solver over stdin/stdout.
///
/// The solver runs with `:print-success` so every command has exactly one
/// reply and protocol errors surface at the command that caused them.
pub struct ProcessSolver {
    child: Arc<Mutex<Child>>,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    logic: String,
    timeout_ms: Option<u64>,
    vars: HashMap<String, SmtSort>,
}

/// Kills the solver process from another thread.
///
/// A query blocked on the solver's output returns an error once the
/// process is gone, which frees the thread that was waiting on it.
#[derive(Clone)]
pub struct KillHandle {
    child: Arc<Mutex<Child>>,
}

impl KillHandle {
    pub fn kill(&self) {
        let mut child = lock_child(&self.child);
        if let Err(e) = child.kill() {
            debug!(error = %e, "solver process already exited");
        }
        let _ = child.wait();
    }
}

fn lock_child(child: &Mutex<Child>) -> MutexGuard<'_, Child> {
    child.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ProcessSolver {
    /// `z3 -in -smt2`.
    pub fn z3() -> Result<Self, SolverError> {
        Self::spawn(DEFAULT_PROGRAM, &["-in".to_string(), "-smt2".to_string()])
    }

    pub fn spawn(program: &str, args: &[String]) -> Result<Self, SolverError> {
        Self::spawn_with_logic(program, args, DEFAULT_LOGIC)
    }

    pub fn spawn_with_logic(
        program: &str,
        args: &[String],
        logic: &str,
    ) -> Result<Self, SolverError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SolverError::NotFound(format!("{program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SolverError::Backend("failed to capture solver stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SolverError::Backend("failed to capture solver stdout".into()))?;

        let mut solver = Self {
            child: Arc::new(Mutex::new(child)),
            stdin,
            stdout: BufReader::new(stdout),
            logic: logic.to_string(),
            timeout_ms: None,
            vars: HashMap::new(),
        };
        solver.preamble()?;
        debug!(program, logic, "spawned SMT-LIB2 solver process");
        Ok(solver)
    }

    /// Ask the solver to give up on a query after `timeout`.
    ///
    /// Solvers that do not know `:timeout` answer `unsupported`; those
    /// still rely on the caller killing the process through
    /// [`ProcessSolver::kill_handle`].
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, SolverError> {
        let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.timeout_ms = Some(ms);
        self.apply_timeout()?;
        Ok(self)
    }

    pub fn kill_handle(&self) -> KillHandle {
        KillHandle {
            child: Arc::clone(&self.child),
        }
    }

    fn apply_timeout(&mut self) -> Result<(), SolverError> {
        let Some(ms) = self.timeout_ms else {
            return Ok(());
        };
        let cmd = format!("(set-option :timeout {ms})");
        writeln!(self.stdin, "{cmd}")?;
        self.stdin.flush()?;
        match self.read_reply()?.as_str() {
            "success" => Ok(()),
            "unsupported" => {
                warn!(timeout_ms = ms, "solver does not support :timeout");
                Ok(())
            }
            other => Err(SolverError::Backend(format!("`{cmd}` failed: {other}"))),
        }
    }

    fn preamble(&mut self) -> Result<(), SolverError> {
        writeln!(self.stdin, "(set-option :print-success true)")?;
        self.stdin.flush()?;
        self.expect_success("(set-option :print-success true)")?;
        self.command("(set-option :produce-models true)")?;
        let logic = format!("(set-logic {})", self.logic);
        self.command(&logic)
    }

    /// Read one complete s-expression (or bare atom) from the solver.
    fn read_reply(&mut self) -> Result<String, SolverError> {
        let mut reply = String::new();
        let mut depth: i64 = 0;
        loop {
            let mut line = String::new();
            let n = self.stdout.read_line(&mut line)?;
            if n == 0 {
                return Err(SolverError::Backend(format!(
                    "solver closed its output (partial reply: `{}`)",
                    reply.trim()
                )));
            }
            for c in line.chars() {
                match c {
                    '(' => depth += 1,
                    ')' => depth -= 1,
                    _ => {}
                }
            }
            reply.push_str(&line);
            if depth <= 0 && !reply.trim().is_empty() {
                return Ok(reply.trim().to_string());
            }
        }
    }

    fn expect_success(&mut self, cmd: &str) -> Result<(), SolverError> {
        let reply = self.read_reply()?;
        if reply == "success" {
            Ok(())
        } else {
            Err(SolverError::Backend(format!("`{cmd}` failed: {reply}")))
        }
    }

    fn command(&mut self, cmd: &str) -> Result<(), SolverError> {
        writeln!(self.stdin, "{cmd}")?;
        self.stdin.flush()?;
        self.expect_success(cmd)
    }

    fn query(&mut self, cmd: &str) -> Result<String, SolverError> {
        writeln!(self.stdin, "{cmd}")?;
        self.stdin.flush()?;
        self.read_reply()
    }
}

impl Drop for ProcessSolver {
    fn drop(&mut self) {
        let _ = writeln!(self.stdin, "(exit)");
        let _ = self.stdin.flush();
        self.kill_handle().kill();
    }
}

impl SmtSolver for ProcessSolver {
    fn declare_var(&mut self, name: &str, sort: &SmtSort) -> Result<(), SolverError> {
        match self.vars.get(name) {
            Some(existing) if existing == sort => return Ok(()),
            Some(_) => return Err(SolverError::SortConflict(name.to_string())),
            None => {}
        }
        self.command(&format!(
            "(declare-const {name} {})",
            sort_to_smtlib(sort)
        ))?;
        self.vars.insert(name.to_string(), *sort);
        Ok(())
    }

    fn assert(&mut self, term: &SmtTerm) -> Result<(), SolverError> {
        let mut referenced = Vec::new();
        term.collect_vars(&mut referenced);
        if let Some(missing) = referenced.iter().find(|v| !self.vars.contains_key(**v)) {
            return Err(SolverError::UnknownVariable(missing.to_string()));
        }
        self.command(&format!("(assert {})", to_smtlib(term)))
    }

    fn push(&mut self) -> Result<(), SolverError> {
        self.command("(push 1)")
    }

    fn pop(&mut self) -> Result<(), SolverError> {
        self.command("(pop 1)").map_err(|e| match e {
            SolverError::Backend(_) => SolverError::ScopeUnderflow,
            other => other,
        })
    }

    fn check_sat(&mut self) -> Result<SatResult, SolverError> {
        let reply = self.query("(check-sat)")?;
        parse_check_sat(&reply)
    }

    fn check_sat_with_model(
        &mut self,
        var_names: &[(&str, &SmtSort)],
    ) -> Result<(SatResult, Option<Model>), SolverError> {
        let result = self.check_sat()?;
        if result != SatResult::Sat {
            return Ok((result, None));
        }

        let mut values = HashMap::new();
        for &(name, sort) in var_names {
            let reply = self.query(&format!("(get-value ({name}))"))?;
            if let Some(value) = parse_value_reply(&reply, name, sort)? {
                values.insert(name.to_string(), value);
            }
        }
        Ok((SatResult::Sat, Some(Model { values })))
    }

    fn reset(&mut self) -> Result<(), SolverError> {
        self.command("(reset)")?;
        self.vars.clear();
        self.apply_timeout()?;
        self.command("(set-option :produce-models true)")?;
        let logic = format!("(set-logic {})", self.logic);
        self.command(&logic)
    }
}

pub(crate) fn parse_check_sat(reply: &str) -> Result<SatResult, SolverError> {
    match reply.trim() {
        "sat" => Ok(SatResult::Sat),
        "unsat" => Ok(SatResult::Unsat),
        "unknown" | "timeout" => Ok(SatResult::Unknown(format!(
            "solver returned {}",
            reply.trim()
        ))),
        other => Err(SolverError::Backend(other.to_string())),
    }
}

/// Parse a `get-value` reply of the form `((name value))`.
pub(crate) fn parse_value_reply(
    reply: &str,
    name: &str,
    sort: &SmtSort,
) -> Result<Option<ModelValue>, SolverError> {
    let parsed = parse_sexpr(reply)?;
    let Sexpr::List(pairs) = parsed else {
        return Err(SolverError::Parse(format!("unexpected get-value reply `{reply}`")));
    };
    let value = pairs.iter().find_map(|pair| match pair {
        Sexpr::List(items) if items.len() == 2 && items[0] == Sexpr::Atom(name.to_string()) => {
            Some(&items[1])
        }
        _ => None,
    });
    let Some(value) = value else {
        return Ok(None);
    };

    Ok(match sort {
        SmtSort::Bool => match value {
            Sexpr::Atom(a) if a == "true" => Some(ModelValue::Bool(true)),
            Sexpr::Atom(a) if a == "false" => Some(ModelValue::Bool(false)),
            _ => None,
        },
        SmtSort::Int => sexpr_to_rational(value)
            .filter(|r| r.is_integer())
            .and_then(|r| r.numer().to_i64())
            .map(ModelValue::Int),
        SmtSort::Real => sexpr_to_rational(value).map(ModelValue::Real),
    })
}
