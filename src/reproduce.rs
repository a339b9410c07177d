use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{info, warn};

use crate::buildfile::Buildfile;
use crate::image::ArtifactSummary;
use crate::observability::MetricsSnapshot;
use crate::pipeline::{PipelineState, StageRegistry, build_pipeline};
use crate::validation::validate_buildfile;

#[derive(Debug)]
pub struct VerifyOptions {
    pub buildfile_path: PathBuf,
    pub runs: usize,
}

#[derive(Debug, Serialize)]
pub struct VerifyRun {
    pub index: usize,
    pub state: PipelineState,
    pub duration_ms: f64,
    pub artifacts: BTreeMap<String, ArtifactSummary>,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Serialize)]
pub struct VerifySummary {
    pub total_runs: usize,
    pub reproducible: bool,
    pub divergent_stages: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct VerifyReport {
    pub buildfile: PathBuf,
    pub name: String,
    pub runs: Vec<VerifyRun>,
    pub summary: VerifySummary,
}

/// Run the pipeline several times on the unchanged source tree and compare
/// the artifacts each build stage produced.
///
/// Every run writes into its own throwaway output directory so the images
/// under the buildfile's real output directory are left alone.
pub fn run_verification(options: &VerifyOptions, registry: &StageRegistry) -> Result<VerifyReport> {
    if options.runs < 2 {
        bail!("Reproducibility check needs at least 2 runs, got {}", options.runs);
    }

    let buildfile = Buildfile::load(&options.buildfile_path)?;
    let validation = validate_buildfile(&buildfile, registry);
    for warning in &validation.warnings {
        warn!(file = %options.buildfile_path.display(), "{warning}");
    }
    if !validation.is_ok() {
        bail!(
            "Buildfile validation failed with {} error(s): {}",
            validation.errors.len(),
            validation.errors.join("; ")
        );
    }

    let scratch = tempfile::Builder::new()
        .prefix("imagesmith-verify-")
        .tempdir()
        .context("Failed to create verification directory")?;

    let mut runs = Vec::with_capacity(options.runs);
    for index in 0..options.runs {
        let mut attempt = buildfile.clone();
        attempt.output.directory = scratch.path().join(format!("run-{index}"));

        let executor = build_pipeline(registry, &attempt)?;
        let run = executor
            .execute()
            .with_context(|| format!("Verification run {} failed", index + 1))?;
        info!(run = index + 1, "Verification run completed");

        runs.push(VerifyRun {
            index,
            state: run.state,
            duration_ms: run.duration_ms,
            artifacts: run.artifacts,
            metrics: executor.metrics().snapshot(),
        });
    }

    let divergent_stages = divergent_stages(&runs);
    for stage in &divergent_stages {
        warn!(stage = %stage, "Build output differs between runs");
    }

    Ok(VerifyReport {
        buildfile: options.buildfile_path.clone(),
        name: buildfile.name,
        summary: VerifySummary {
            total_runs: runs.len(),
            reproducible: divergent_stages.is_empty(),
            divergent_stages,
        },
        runs,
    })
}

fn divergent_stages(runs: &[VerifyRun]) -> Vec<String> {
    let Some((first, rest)) = runs.split_first() else {
        return Vec::new();
    };
    let mut divergent: Vec<String> = first
        .artifacts
        .iter()
        .filter(|(stage, summary)| {
            rest.iter().any(|run| {
                run.artifacts
                    .get(*stage)
                    .is_none_or(|other| other.sha256 != summary.sha256)
            })
        })
        .map(|(stage, _)| stage.clone())
        .collect();
    divergent.sort();
    divergent
}
