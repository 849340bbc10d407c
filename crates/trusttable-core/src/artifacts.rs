//! Persisted audit output.
//!
//! Each sample is written to `<dir>/<sample_id>/audit.json` next to an
//! `audit.digest` holding the SHA-256 of the JSON bytes, so a report that
//! was edited after the run is detected on read.

use std::path::{Path, PathBuf};

use crate::digest::ContentDigest;
use crate::error::{AuditError, Result};
use crate::refine::SampleOutcome;
use crate::summary::RunSummary;

const AUDIT_FILE: &str = "audit.json";
const DIGEST_FILE: &str = "audit.digest";
const SUMMARY_FILE: &str = "summary.json";

fn sample_dir(dir: &Path, sample_id: &str) -> Result<PathBuf> {
    let usable = !sample_id.is_empty()
        && sample_id != "."
        && sample_id != ".."
        && !sample_id.contains(['/', '\\']);
    if !usable {
        return Err(AuditError::Artifact(format!(
            "sample id {sample_id:?} cannot be used as a directory name"
        )));
    }
    Ok(dir.join(sample_id))
}

/// Persist `<dir>/<sample_id>/audit.json` and `<dir>/<sample_id>/audit.digest`.
pub fn write_sample_artifact(outcome: &SampleOutcome, dir: &Path) -> Result<PathBuf> {
    let sample_dir = sample_dir(dir, outcome.sample_id())?;
    std::fs::create_dir_all(&sample_dir)?;

    let artifact_path = sample_dir.join(AUDIT_FILE);
    let json = serde_json::to_vec_pretty(outcome)?;
    let digest = ContentDigest::from_bytes(&json);

    std::fs::write(&artifact_path, &json)?;
    std::fs::write(sample_dir.join(DIGEST_FILE), digest.as_str().as_bytes())?;

    Ok(artifact_path)
}

/// Read `<dir>/<sample_id>/audit.json`, verifying it against its digest.
pub fn read_sample_artifact(sample_id: &str, dir: &Path) -> Result<SampleOutcome> {
    let sample_dir = sample_dir(dir, sample_id)?;
    let json = std::fs::read(sample_dir.join(AUDIT_FILE))?;
    let expected = std::fs::read_to_string(sample_dir.join(DIGEST_FILE))?;
    let actual = ContentDigest::from_bytes(&json);
    if expected.trim() != actual.as_str() {
        return Err(AuditError::DigestMismatch {
            expected: expected.trim().to_string(),
            actual: actual.to_string(),
        });
    }

    Ok(serde_json::from_slice(&json)?)
}

/// Write `<dir>/summary.json`.
pub fn write_run_summary(summary: &RunSummary, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(SUMMARY_FILE);
    std::fs::write(&path, serde_json::to_vec_pretty(summary)?)?;
    Ok(path)
}
