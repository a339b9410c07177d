use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};

use crate::buildfile::Buildfile;
use crate::pipeline::{OutputSpec, StageParameters, StageSpec};

pub const PRESETS: [&str; 3] = ["cargo", "go", "make"];

/// Write a starter buildfile for `preset` packaging an executable called `name`.
pub fn generate_preset(preset: &str, name: &str, destination: &Path) -> Result<PathBuf> {
    let buildfile = match preset {
        "cargo" => cargo_preset(name),
        "go" => go_preset(name),
        "make" => make_preset(name),
        other => anyhow::bail!(
            "Unknown preset '{other}'. Available presets: {}",
            PRESETS.join(", ")
        ),
    };

    let rendered = buildfile.to_yaml()?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write preset buildfile: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}

fn cargo_preset(name: &str) -> Buildfile {
    three_stage(name, "rust:stable", None)
}

fn go_preset(name: &str) -> Buildfile {
    three_stage(
        name,
        "go:stable",
        Some(params(json!({
            "command": ["go", "build", "-trimpath", "-o", name, "."],
            "artifact": name,
            "env": { "CGO_ENABLED": "0" },
        }))),
    )
}

fn make_preset(name: &str) -> Buildfile {
    three_stage(
        name,
        "make:latest",
        Some(params(json!({
            "command": ["make", "release"],
            "artifact": name,
        }))),
    )
}

fn three_stage(name: &str, toolchain: &str, build: Option<StageParameters>) -> Buildfile {
    Buildfile {
        version: 1,
        name: name.to_string(),
        stages: vec![
            stage("base", "provision", &[], Some(params(json!({ "toolchain": toolchain })))),
            stage("builder", "build", &["base"], build),
            stage("runtime", "package", &["base", "builder"], None),
        ],
        output: OutputSpec::default(),
        root: PathBuf::from("."),
    }
}

fn stage(name: &str, kind: &str, needs: &[&str], params: Option<StageParameters>) -> StageSpec {
    StageSpec {
        name: name.into(),
        stage: kind.into(),
        needs: needs.iter().map(|n| n.to_string()).collect(),
        params,
    }
}

fn params(value: Value) -> StageParameters {
    match value {
        Value::Object(map) => map,
        _ => StageParameters::new(),
    }
}
