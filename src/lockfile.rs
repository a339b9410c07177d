use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::buildfile::Buildfile;
use crate::graph::plan_order;
use crate::pipeline::StageSpec;

#[derive(Debug, Serialize)]
pub struct PipelineLock {
    pub buildfile_version: u32,
    pub name: String,
    pub generated_at: DateTime<Utc>,
    pub output: String,
    pub toolchains: Vec<String>,
    pub stages: Vec<StageLock>,
}

#[derive(Debug, Serialize)]
pub struct StageLock {
    pub name: String,
    pub stage: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,
    pub params_hash: String,
}

/// Lock the buildfile's stages in execution order.
pub fn generate_lock(buildfile: &Buildfile, path: &Path) -> Result<PipelineLock> {
    let order = plan_order(&buildfile.stages)?;
    let stages = order
        .into_iter()
        .map(|idx| {
            let spec = &buildfile.stages[idx];
            StageLock {
                name: spec.name.clone(),
                stage: spec.stage.clone(),
                needs: spec.needs.clone(),
                params_hash: hash_params(spec),
            }
        })
        .collect();

    let mut toolchains: Vec<String> = buildfile
        .stages_of("provision")
        .filter_map(|spec| spec.params.as_ref()?.get("toolchain")?.as_str())
        .map(str::to_string)
        .collect();
    toolchains.sort();
    toolchains.dedup();

    let lock = PipelineLock {
        buildfile_version: buildfile.version,
        name: buildfile.name.clone(),
        generated_at: Utc::now(),
        output: buildfile.output.directory.to_string_lossy().to_string(),
        toolchains,
        stages,
    };

    let file = File::create(path)
        .with_context(|| format!("Failed to create lockfile: {}", path.display()))?;
    serde_yaml::to_writer(file, &lock)
        .with_context(|| format!("Failed to write lockfile: {}", path.display()))?;

    Ok(lock)
}

fn hash_params(spec: &StageSpec) -> String {
    let mut hasher = Sha256::new();
    // serde_json maps are ordered, so equal params hash equally.
    let serialized = serde_json::to_vec(&spec.params.clone().unwrap_or_default()).unwrap_or_default();
    hasher.update(spec.stage.as_bytes());
    hasher.update([0u8]);
    hasher.update(spec.needs.join(",").as_bytes());
    hasher.update([0u8]);
    hasher.update(serialized);
    format!("{:x}", hasher.finalize())
}
