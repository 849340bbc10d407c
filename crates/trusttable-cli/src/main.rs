//! TrustTable - faithfulness auditor for table-QA reasoning traces
//!
//! ## Commands
//!
//! - `audit`: Audit (and refine) a single sample
//! - `batch`: Audit a dataset, writing per-sample artifacts and a run summary
//! - `query`: Run a grounding program against a table, offline

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, Level};

use trusttable_core::query::{run_program, GroundingProgram};
use trusttable_core::{
    audit_batch, audit_sample, write_run_summary, write_sample_artifact, AuditConfig, Auditor,
    RawTable, RunSummary, Sample, SampleOutcome, METRICS,
};
use trusttable_llm::client::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use trusttable_llm::{ChatCompletionsClient, ModelConfig};

#[derive(Parser)]
#[command(name = "trusttable")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Audit the faithfulness of table-QA reasoning traces", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Audit configuration (TOML); every field is optional
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    model: ModelArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ModelArgs {
    /// Chat-completions endpoint root
    #[arg(long, global = true, env = "TRUSTTABLE_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Model identifier
    #[arg(long, global = true, env = "TRUSTTABLE_MODEL", default_value = DEFAULT_MODEL)]
    model: String,

    /// Bearer token for the endpoint
    #[arg(long, global = true, env = "TRUSTTABLE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Audit one sample, refining it until faithful or out of budget
    Audit {
        /// Sample file (JSON: id, question, table, optional trace)
        #[arg(short, long)]
        sample: PathBuf,

        /// Directory for the audit artifact
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Report the initial verdict only
        #[arg(long)]
        no_refine: bool,
    },

    /// Audit every sample of a dataset
    Batch {
        /// Dataset file (JSON array of samples)
        #[arg(short, long)]
        dataset: PathBuf,

        /// Output directory for artifacts and summary.json
        #[arg(short, long)]
        out: PathBuf,

        /// Samples audited concurrently (overrides the config)
        #[arg(short, long)]
        concurrency: Option<usize>,
    },

    /// Evaluate a grounding program against a table without a model
    Query {
        /// Table file (JSON: name, header, rows)
        #[arg(short, long)]
        table: PathBuf,

        /// Grounding program file (JSON: query, expect)
        #[arg(short, long)]
        program: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    trusttable_core::init_tracing(cli.json, level);

    let config = match &cli.config {
        Some(path) => AuditConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => AuditConfig::default(),
    };

    let result = match cli.command {
        Commands::Audit {
            sample,
            out,
            no_refine,
        } => cmd_audit(&cli.model, config, &sample, out.as_deref(), no_refine).await,
        Commands::Batch {
            dataset,
            out,
            concurrency,
        } => cmd_batch(&cli.model, config, &dataset, &out, concurrency).await,
        Commands::Query { table, program } => cmd_query(&config, &table, &program),
    };
    METRICS.flush();
    result
}

fn build_auditor(args: &ModelArgs, config: AuditConfig) -> Result<Auditor> {
    let mut model_config = ModelConfig::new(&args.base_url, &args.model);
    if let Some(key) = &args.api_key {
        model_config = model_config.with_api_key(key);
    }
    let client =
        ChatCompletionsClient::new(model_config).context("Failed to build model client")?;
    Ok(Auditor::new(Arc::new(client), config))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

fn print_outcome(outcome: &SampleOutcome) {
    match outcome {
        SampleOutcome::Completed(record) => {
            let verdict = record.final_verdict();
            println!(
                "{}: {} (initial {}, final {}, {} refinement attempt(s))",
                record.sample_id,
                record.state,
                record.initial_error_type(),
                verdict.error_type,
                record.attempts.len()
            );
            if verdict.indeterminate {
                println!("  logic check was indeterminate");
            }
            if !verdict.evidence.is_empty() {
                for line in verdict.evidence.render().lines() {
                    println!("  {line}");
                }
            }
        }
        SampleOutcome::Errored { sample_id, reason } => {
            println!("{sample_id}: errored ({reason})");
        }
    }
}

async fn cmd_audit(
    args: &ModelArgs,
    mut config: AuditConfig,
    sample_path: &Path,
    out: Option<&Path>,
    no_refine: bool,
) -> Result<()> {
    if no_refine {
        config.refinement.enabled = false;
    }
    let sample: Sample = read_json(sample_path)?;
    let auditor = build_auditor(args, config)?;

    info!(sample_id = %sample.id, model = %args.model, "auditing sample");
    let outcome = audit_sample(&auditor, sample).await;
    print_outcome(&outcome);

    if let Some(dir) = out {
        let path = write_sample_artifact(&outcome, dir).context("Failed to write artifact")?;
        println!("artifact: {}", path.display());
    }
    Ok(())
}

async fn cmd_batch(
    args: &ModelArgs,
    mut config: AuditConfig,
    dataset: &Path,
    out: &Path,
    concurrency: Option<usize>,
) -> Result<()> {
    if let Some(n) = concurrency {
        config.batch.max_concurrent = n;
    }
    let samples: Vec<Sample> = read_json(dataset)?;
    let auditor = Arc::new(build_auditor(args, config)?);

    let outcomes = audit_batch(auditor, samples).await;
    for outcome in &outcomes {
        print_outcome(outcome);
        write_sample_artifact(outcome, out)
            .with_context(|| format!("Failed to write artifact for {}", outcome.sample_id()))?;
    }

    let summary = RunSummary::from_outcomes(&outcomes);
    let path = write_run_summary(&summary, out).context("Failed to write run summary")?;
    println!();
    println!(
        "{} sample(s): {} completed, {} errored",
        summary.total,
        summary.completed,
        summary.errored.len()
    );
    println!("VCAR: {}", format_ratio(summary.vcar));
    println!("CSR:  {}", format_ratio(summary.csr));
    if !summary.errored.is_empty() {
        println!("excluded: {}", summary.errored.join(", "));
    }
    println!("summary: {}", path.display());
    Ok(())
}

fn format_ratio(ratio: Option<f64>) -> String {
    ratio.map_or_else(|| "n/a".to_string(), |r| format!("{:.1}%", r * 100.0))
}

#[derive(Serialize)]
struct QueryOutput<'a> {
    table: &'a str,
    #[serde(flatten)]
    execution: trusttable_core::query::Execution,
}

fn cmd_query(config: &AuditConfig, table_path: &Path, program_path: &Path) -> Result<()> {
    let raw: RawTable = read_json(table_path)?;
    let table = raw.into_table().context("Invalid table")?;
    let text = std::fs::read_to_string(program_path)
        .with_context(|| format!("Failed to read {}", program_path.display()))?;
    let program = GroundingProgram::parse(&text).context("Invalid grounding program")?;

    let execution =
        run_program(&table, &program, &config.query).context("Grounding program failed")?;
    let output = QueryOutput {
        table: table.name(),
        execution,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn audit_flags_parse() {
        let cli = Cli::try_parse_from([
            "trusttable",
            "audit",
            "--sample",
            "s.json",
            "--no-refine",
            "--model",
            "local",
        ])
        .unwrap();
        assert_eq!(cli.model.model, "local");
        assert!(matches!(cli.command, Commands::Audit { no_refine: true, .. }));
    }

    #[test]
    fn query_runs_offline() {
        let dir = tempfile::tempdir().unwrap();
        let table = dir.path().join("table.json");
        let program = dir.path().join("program.json");
        std::fs::write(
            &table,
            r#"{"name": "t", "header": ["Team", "Wins"], "rows": [["Ajax", 12], ["PSV", 9]]}"#,
        )
        .unwrap();
        std::fs::write(
            &program,
            r#"{"query": {"type": "aggregate", "input": {"type": "rows"}, "func": "max", "column": "Wins"},
                "expect": {"type": "equals", "value": 12}}"#,
        )
        .unwrap();
        cmd_query(&AuditConfig::default(), &table, &program).unwrap();
    }

    #[test]
    fn ratios_render_as_percentages() {
        assert_eq!(format_ratio(Some(0.5)), "50.0%");
        assert_eq!(format_ratio(None), "n/a");
    }
}
