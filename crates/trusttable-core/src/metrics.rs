//! Global atomic counters for TrustTable audits.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a batch).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    audits: AtomicU64,
    model_calls: AtomicU64,
    cache_hits: AtomicU64,
    solver_indeterminates: AtomicU64,
    execution_failures: AtomicU64,
    samples_errored: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            audits: AtomicU64::new(0),
            model_calls: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            solver_indeterminates: AtomicU64::new(0),
            execution_failures: AtomicU64::new(0),
            samples_errored: AtomicU64::new(0),
        }
    }

    /// One full audit pass (initial or refinement).
    pub fn inc_audits(&self) {
        self.audits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "audits", "counter incremented");
    }

    /// One language-model attempt, successful or not.
    pub fn inc_model_calls(&self) {
        self.model_calls.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "model_calls", "counter incremented");
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cache_hits", "counter incremented");
    }

    pub fn inc_solver_indeterminates(&self) {
        self.solver_indeterminates.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "solver_indeterminates", "counter incremented");
    }

    pub fn inc_execution_failures(&self) {
        self.execution_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "execution_failures", "counter incremented");
    }

    pub fn inc_samples_errored(&self) {
        self.samples_errored.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "samples_errored", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            audits = self.audits(),
            model_calls = self.model_calls(),
            cache_hits = self.cache_hits(),
            solver_indeterminates = self.solver_indeterminates(),
            execution_failures = self.execution_failures(),
            samples_errored = self.samples_errored(),
        );
    }

    pub fn audits(&self) -> u64 {
        self.audits.load(Ordering::Relaxed)
    }

    pub fn model_calls(&self) -> u64 {
        self.model_calls.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn solver_indeterminates(&self) -> u64 {
        self.solver_indeterminates.load(Ordering::Relaxed)
    }

    pub fn execution_failures(&self) -> u64 {
        self.execution_failures.load(Ordering::Relaxed)
    }

    pub fn samples_errored(&self) -> u64 {
        self.samples_errored.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.audits.store(0, Ordering::Relaxed);
        self.model_calls.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.solver_indeterminates.store(0, Ordering::Relaxed);
        self.execution_failures.store(0, Ordering::Relaxed);
        self.samples_errored.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_audits();
        m.inc_model_calls();
        m.inc_model_calls();
        m.inc_cache_hits();
        assert_eq!(m.audits(), 1);
        assert_eq!(m.model_calls(), 2);
        assert_eq!(m.cache_hits(), 1);
        assert_eq!(m.samples_errored(), 0);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_solver_indeterminates();
        m.inc_execution_failures();
        m.inc_samples_errored();
        m.reset();
        assert_eq!(m.solver_indeterminates(), 0);
        assert_eq!(m.execution_failures(), 0);
        assert_eq!(m.samples_errored(), 0);
    }
}
