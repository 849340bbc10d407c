//! Model-call controls: timeout, retry with exponential backoff, circuit breaker.
//!
//! Every model call in the pipeline goes through a [`ModelGate`]. One gate
//! is created per sample, so a sample whose calls keep failing trips only
//! its own breaker and the rest of a batch is unaffected.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use trusttable_llm::{strip_code_fences, CompletionRequest, LanguageModel};

use crate::config::ModelCallConfig;
use crate::error::{AuditError, Result};
use crate::metrics::METRICS;

/// Atomic circuit breaker that opens after N consecutive failures.
///
/// Resets on success.
#[derive(Debug)]
pub struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    threshold: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            threshold,
        }
    }

    /// Returns `true` if the breaker is open (too many consecutive failures).
    pub fn is_open(&self) -> bool {
        self.consecutive_failures.load(Ordering::Relaxed) >= self.threshold
    }

    /// Record a failure. Returns current consecutive failure count.
    pub fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}

/// A reply that still failed to parse after every re-prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedOutput<E> {
    pub attempts: u32,
    /// Parse error of the last reply.
    pub error: E,
}

/// Call `model` with timeout, retry and circuit-breaker controls.
///
/// The breaker is checked before each attempt and updated after. When all
/// attempts fail the error is [`AuditError::ModelUnavailable`].
pub async fn call_model(
    model: &dyn LanguageModel,
    config: &ModelCallConfig,
    breaker: &CircuitBreaker,
    request: &CompletionRequest,
) -> Result<String> {
    let max_attempts = config.max_retries + 1;
    let mut last_error = String::from("no attempt made");

    for attempt in 1..=max_attempts {
        if breaker.is_open() {
            return Err(AuditError::ModelUnavailable {
                purpose: request.purpose,
                attempts: attempt - 1,
                reason: format!(
                    "circuit breaker open after {} consecutive failures (last: {last_error})",
                    breaker.failure_count()
                ),
            });
        }

        METRICS.inc_model_calls();
        let outcome = tokio::time::timeout(config.timeout(), model.complete(request)).await;
        match outcome {
            Ok(Ok(text)) => {
                breaker.record_success();
                return Ok(text);
            }
            Ok(Err(err)) => last_error = err.to_string(),
            Err(_elapsed) => last_error = format!("timed out after {} ms", config.timeout_ms),
        }
        let failures = breaker.record_failure();
        tracing::warn!(
            model = model.name(),
            purpose = %request.purpose,
            attempt = attempt,
            consecutive_failures = failures,
            error = %last_error,
            "model call failed"
        );

        if attempt < max_attempts {
            let factor = 2u64.saturating_pow(attempt - 1);
            let delay = Duration::from_millis(config.backoff_base_ms.saturating_mul(factor));
            tokio::time::sleep(delay).await;
        }
    }

    Err(AuditError::ModelUnavailable {
        purpose: request.purpose,
        attempts: max_attempts,
        reason: last_error,
    })
}

/// A sample's handle on the language model.
#[derive(Clone)]
pub struct ModelGate {
    model: Arc<dyn LanguageModel>,
    config: ModelCallConfig,
    breaker: Arc<CircuitBreaker>,
}

impl ModelGate {
    pub fn new(model: Arc<dyn LanguageModel>, config: ModelCallConfig) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(config.breaker_threshold));
        Self {
            model,
            config,
            breaker,
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// One controlled completion.
    pub async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        call_model(self.model.as_ref(), &self.config, &self.breaker, request).await
    }

    /// Complete and parse, re-prompting with the parse error on malformed
    /// replies.
    ///
    /// The outer error means the model was unreachable; the inner one
    /// means it kept answering in an unusable shape.
    pub async fn complete_parsed<T, E, F>(
        &self,
        request: &CompletionRequest,
        parse: F,
    ) -> Result<std::result::Result<T, MalformedOutput<E>>>
    where
        E: std::fmt::Display,
        F: Fn(&str) -> std::result::Result<T, E>,
    {
        let max_attempts = self.config.malformed_output_retries + 1;
        let mut current = request.clone();
        let mut attempt = 1;

        loop {
            let reply = self.complete(&current).await?;
            let err = match parse(strip_code_fences(&reply)) {
                Ok(parsed) => return Ok(Ok(parsed)),
                Err(err) => err,
            };
            tracing::debug!(
                purpose = %request.purpose,
                attempt = attempt,
                error = %err,
                "malformed model output"
            );
            if attempt >= max_attempts {
                return Ok(Err(MalformedOutput {
                    attempts: attempt,
                    error: err,
                }));
            }
            current.user = format!(
                "{}\n\nYour previous reply could not be used: {err}\n\
                 Reply again, following the required output format exactly.",
                request.user
            );
            attempt += 1;
        }
    }
}
