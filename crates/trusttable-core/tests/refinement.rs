use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use trusttable_core::{
    audit_batch, audit_sample, read_sample_artifact, write_run_summary, write_sample_artifact,
    AuditConfig, AuditModule, Auditor, ErrorType, RefinementState, RunSummary, Sample,
    SampleOutcome,
};
use trusttable_llm::{ModelError, PromptPurpose, ScriptedModel};
use tempfile::tempdir;

const CLAIMS: &str = r#"{"claims": [
    {"index": 1, "kind": "aggregate", "text": "The maximum revenue in the table is 300"},
    {"index": 2, "kind": "conclusion", "text": "The max revenue is 300", "depends_on": [1]}
]}"#;

const PROGRAM: &str = r#"{
    "query": {"type": "aggregate", "input": {"type": "rows"}, "func": "max", "column": "Revenue"},
    "expect": {"type": "equals", "value": 300}
}"#;

const FORMAL: &str = r#"{
    "variables": [{"name": "max_revenue", "kind": "numeric"}],
    "constraints": [{"type": "fact", "step": 1, "var": "max_revenue", "value": 300}],
    "conclusion": {"type": "value", "step": 2, "target": "max_revenue", "value": 300}
}"#;

fn sample(id: &str, answer: Option<&str>) -> Sample {
    let trace = answer.map(|a| {
        serde_json::json!({"reasoning": "Revenues are 100, 300 and 200; the largest is 300.", "answer": a})
    });
    serde_json::from_value(serde_json::json!({
        "id": id,
        "question": "What was the max revenue?",
        "table": {
            "name": "financials",
            "header": ["Company", "Revenue"],
            "rows": [["A", 100], ["B", 300], ["C", 200]]
        },
        "trace": trace,
    }))
    .unwrap()
}

fn config(max_attempts: u32) -> AuditConfig {
    let mut config = AuditConfig::default();
    config.model.max_retries = 0;
    config.model.backoff_base_ms = 1;
    config.refinement.max_attempts = max_attempts;
    config
}

fn model() -> Arc<ScriptedModel> {
    let model = Arc::new(ScriptedModel::new());
    model
        .respond_with(PromptPurpose::Decompose, |_| Ok(CLAIMS.to_string()))
        .respond_with(PromptPurpose::SynthesizeQuery, |_| Ok(PROGRAM.to_string()))
        .respond_with(PromptPurpose::Formalize, |_| Ok(FORMAL.to_string()));
    model
}

fn record(outcome: &SampleOutcome) -> &trusttable_core::SampleRecord {
    outcome.record().expect("sample completed")
}

#[tokio::test]
async fn faithful_sample_is_never_refined() {
    let model = model();
    let auditor = Auditor::new(model.clone(), config(3));

    let outcome = audit_sample(&auditor, sample("s-1", Some("300"))).await;

    let record = record(&outcome);
    assert_eq!(record.state, RefinementState::Faithful);
    assert!(record.attempts.is_empty());
    assert_eq!(record.audits, 1);
    assert_eq!(model.calls_for(PromptPurpose::Refine), 0);
}

#[tokio::test]
async fn inconsistent_answer_is_corrected_by_refinement() {
    let model = model();
    model.push_reply(
        PromptPurpose::Refine,
        "The revenues are 100, 300 and 200, so the maximum is 300.\nAnswer: 300",
    );
    let auditor = Auditor::new(model.clone(), config(3));

    let outcome = audit_sample(&auditor, sample("s-2", Some("200"))).await;

    let record = record(&outcome);
    assert_eq!(record.initial_error_type(), ErrorType::Type4Inconsistent);
    assert_eq!(record.state, RefinementState::Faithful);
    assert_eq!(record.attempts.len(), 1);
    assert_eq!(record.attempts[0].trace.answer, "300");
    assert!(!record.attempts[0].evidence.is_empty());
    assert!(record.final_verdict().is_faithful());

    let refine = model
        .requests()
        .into_iter()
        .find(|r| r.purpose == PromptPurpose::Refine)
        .unwrap();
    assert!(refine.user.contains("stated answer is \"200\""));
}

#[tokio::test]
async fn refinement_stops_after_budget_with_at_most_n_plus_one_audits() {
    let model = model();
    model.respond_with(PromptPurpose::Refine, |_| Ok("Still guessing.\nAnswer: 100".to_string()));
    let auditor = Auditor::new(model.clone(), config(2));

    let outcome = audit_sample(&auditor, sample("s-3", Some("200"))).await;

    let record = record(&outcome);
    assert_eq!(record.state, RefinementState::Exhausted);
    assert_eq!(record.attempts.len(), 2);
    assert_eq!(record.audits, 3);
    assert_eq!(model.calls_for(PromptPurpose::Refine), 2);
    assert_eq!(model.calls_for(PromptPurpose::Decompose), 3);
    let numbers: Vec<u32> = record.attempts.iter().map(|a| a.attempt).collect();
    assert_eq!(numbers, vec![1, 2]);
}

#[tokio::test]
async fn disabled_refinement_reports_exhausted_with_zero_attempts() {
    let model = model();
    let mut config = config(3);
    config.refinement.enabled = false;
    let auditor = Auditor::new(model.clone(), config);

    let outcome = audit_sample(&auditor, sample("s-4", Some("200"))).await;

    let record = record(&outcome);
    assert_eq!(record.state, RefinementState::Exhausted);
    assert!(record.attempts.is_empty());
    assert_eq!(model.calls_for(PromptPurpose::Refine), 0);
}

#[tokio::test]
async fn missing_trace_is_generated_first() {
    let model = model();
    model.push_reply(
        PromptPurpose::GenerateTrace,
        "Company B has the largest revenue.\nAnswer: 300",
    );
    let auditor = Auditor::new(model.clone(), config(0));

    let outcome = audit_sample(&auditor, sample("s-5", None)).await;

    let record = record(&outcome);
    assert!(record.trace_generated);
    assert_eq!(record.initial_trace.answer, "300");
    assert_eq!(record.state, RefinementState::Faithful);
}

#[tokio::test]
async fn failing_sample_is_errored_and_the_batch_continues() {
    let model = model();
    model.respond_with(PromptPurpose::Decompose, |request| {
        if request.user.contains("BROKEN") {
            Err(ModelError::Transport("connection reset".into()))
        } else {
            Ok(CLAIMS.to_string())
        }
    });
    let auditor = Arc::new(Auditor::new(model, config(0)));

    let mut broken = sample("s-broken", Some("300"));
    broken.question = "BROKEN question".to_string();
    let samples = vec![
        sample("s-ok-1", Some("300")),
        broken,
        sample("s-ok-2", Some("200")),
    ];

    let outcomes = audit_batch(Arc::clone(&auditor), samples).await;

    let ids: Vec<&str> = outcomes.iter().map(SampleOutcome::sample_id).collect();
    assert_eq!(ids, vec!["s-ok-1", "s-broken", "s-ok-2"]);
    match &outcomes[1] {
        SampleOutcome::Errored { reason, .. } => assert!(reason.contains("model unavailable")),
        other => panic!("expected errored sample, got {other:?}"),
    }

    let summary = RunSummary::from_outcomes(&outcomes);
    assert_eq!(summary.total, 3);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.errored, vec!["s-broken".to_string()]);
    assert_eq!(summary.faithful_initial, 1);
    assert_eq!(summary.initially_rejected, 1);
    assert_eq!(summary.vcar, Some(0.5));
    assert_eq!(summary.csr, Some(0.0));
    assert_eq!(summary.error_types.get(&ErrorType::Type4Inconsistent), Some(&1));
}

#[tokio::test]
async fn summary_counts_corrections_toward_csr() {
    let model = model();
    model.respond_with(PromptPurpose::Refine, |_| Ok("The max is 300.\nAnswer: 300".to_string()));
    let auditor = Arc::new(Auditor::new(model, config(2)));

    let samples = vec![
        sample("a", Some("300")),
        sample("b", Some("200")),
        sample("c", Some("100")),
    ];
    let outcomes = audit_batch(auditor, samples).await;
    let summary = RunSummary::from_outcomes(&outcomes);

    assert_eq!(summary.vcar, Some(1.0 / 3.0));
    assert_eq!(summary.corrected, 2);
    assert_eq!(summary.csr, Some(1.0));
    assert_eq!(summary.refinement_attempts, 2);
    assert!(summary.errored.is_empty());
}

#[tokio::test]
async fn undecomposable_refinement_is_a_rejected_attempt() {
    let model = model();
    model
        .respond_with(PromptPurpose::Refine, |_| Ok("Still guessing.\nAnswer: 100".to_string()))
        .respond_with(PromptPurpose::Decompose, |request| {
            if request.user.contains("Still guessing") {
                Ok("not json".to_string())
            } else {
                Ok(CLAIMS.to_string())
            }
        });
    let auditor = Auditor::new(model.clone(), config(2));

    let outcome = audit_sample(&auditor, sample("s-6", Some("200"))).await;

    let record = record(&outcome);
    assert_eq!(record.state, RefinementState::Exhausted);
    assert_eq!(record.attempts.len(), 2);
    assert_eq!(record.audits, 1);
    for attempt in &record.attempts {
        assert!(attempt.report.is_none());
        assert!(attempt.error.as_deref().unwrap().contains("malformed"));
    }
    assert_eq!(
        record.attempts[1].evidence.primary_module(),
        Some(AuditModule::Decomposer)
    );
    assert_eq!(record.final_verdict().error_type, ErrorType::Type4Inconsistent);
    assert_eq!(model.calls_for(PromptPurpose::Refine), 2);

    let second_refine = model
        .requests()
        .into_iter()
        .filter(|r| r.purpose == PromptPurpose::Refine)
        .nth(1)
        .unwrap();
    assert!(second_refine.user.contains("could not be split into checkable steps"));

    let summary = RunSummary::from_outcomes(std::slice::from_ref(&outcome));
    assert_eq!(summary.completed, 1);
    assert!(summary.errored.is_empty());
    assert_eq!(summary.initially_rejected, 1);
    assert_eq!(summary.refinement_attempts, 2);
    assert_eq!(summary.csr, Some(0.0));
}

#[tokio::test]
async fn undecomposable_attempt_can_still_be_corrected_later() {
    let model = model();
    model
        .push_reply(PromptPurpose::Refine, "Still guessing.\nAnswer: 100")
        .push_reply(PromptPurpose::Refine, "The max is 300.\nAnswer: 300")
        .respond_with(PromptPurpose::Decompose, |request| {
            if request.user.contains("Still guessing") {
                Ok("not json".to_string())
            } else {
                Ok(CLAIMS.to_string())
            }
        });
    let auditor = Auditor::new(model, config(3));

    let outcome = audit_sample(&auditor, sample("s-7", Some("200"))).await;

    let record = record(&outcome);
    assert_eq!(record.state, RefinementState::Faithful);
    assert_eq!(record.attempts.len(), 2);
    assert!(record.attempts[0].report.is_none());
    assert!(record.attempts[1].report.is_some());
    assert_eq!(record.audits, 2);
    assert!(record.final_verdict().is_faithful());

    let summary = RunSummary::from_outcomes(std::slice::from_ref(&outcome));
    assert_eq!(summary.corrected, 1);
    assert_eq!(summary.csr, Some(1.0));
}

#[tokio::test]
async fn model_outage_on_a_later_attempt_errors_the_sample() {
    let model = model();
    let refines = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&refines);
    model.respond_with(PromptPurpose::Refine, move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok("Still guessing.\nAnswer: 100".to_string())
        } else {
            Err(ModelError::Transport("connection reset".into()))
        }
    });
    let auditor = Arc::new(Auditor::new(model, config(3)));

    let samples = vec![sample("s-ok", Some("300")), sample("s-outage", Some("200"))];
    let outcomes = audit_batch(auditor, samples).await;

    match &outcomes[1] {
        SampleOutcome::Errored { reason, .. } => {
            assert!(reason.contains("model unavailable for refine"));
        }
        other => panic!("expected errored sample, got {other:?}"),
    }
    assert_eq!(refines.load(Ordering::SeqCst), 2);

    let summary = RunSummary::from_outcomes(&outcomes);
    assert_eq!(summary.total, 2);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.errored, vec!["s-outage".to_string()]);
    assert_eq!(summary.vcar, Some(1.0));
    assert_eq!(summary.initially_rejected, 0);
    assert_eq!(summary.csr, None);
    assert_eq!(summary.refinement_attempts, 0);
}

#[tokio::test]
async fn completed_sample_artifact_round_trips() {
    let auditor = Auditor::new(model(), config(0));
    let outcome = audit_sample(&auditor, sample("s-art", Some("300"))).await;
    let dir = tempdir().unwrap();

    write_sample_artifact(&outcome, dir.path()).unwrap();
    let restored = read_sample_artifact("s-art", dir.path()).unwrap();
    assert_eq!(restored, outcome);

    let summary = RunSummary::from_outcomes(std::slice::from_ref(&outcome));
    let path = write_run_summary(&summary, dir.path()).unwrap();
    let text = std::fs::read_to_string(path).unwrap();
    assert!(text.contains("\"vcar\": 1.0"));
}
