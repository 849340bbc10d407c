//! Bounded-concurrency batch runner.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::claims::Sample;
use crate::metrics::METRICS;
use crate::obs;
use crate::pipeline::Auditor;
use crate::refine::{audit_sample, SampleOutcome};

/// Audit every sample, at most `batch.max_concurrent` at a time.
///
/// Outcomes come back in input order. A failing sample is `Errored` and
/// never stops the others.
pub async fn audit_batch(auditor: Arc<Auditor>, samples: Vec<Sample>) -> Vec<SampleOutcome> {
    let permits = auditor.config().batch.max_concurrent.max(1);
    let semaphore = Arc::new(Semaphore::new(permits));
    tracing::info!(samples = samples.len(), max_concurrent = permits, "batch started");

    let mut handles = Vec::with_capacity(samples.len());
    for sample in samples {
        let sample_id = sample.id.clone();
        let auditor = Arc::clone(&auditor);
        let semaphore = Arc::clone(&semaphore);
        let handle = tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            audit_sample(&auditor, sample).await
        });
        handles.push((sample_id, handle));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for (sample_id, handle) in handles {
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(join) => {
                METRICS.inc_samples_errored();
                obs::emit_sample_errored(&sample_id, &join);
                SampleOutcome::Errored {
                    sample_id,
                    reason: format!("audit task failed: {join}"),
                }
            }
        };
        outcomes.push(outcome);
    }
    outcomes
}
