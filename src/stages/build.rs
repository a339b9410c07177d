use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result, anyhow, bail};
use glob::{MatchOptions, Pattern};
use once_cell::sync::Lazy;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::provision::ToolchainId;
use super::{ensure_consumed, take_string, take_string_list, take_string_map};
use crate::error::PipelineError;
use crate::image::{ArtifactSummary, is_executable};
use crate::pipeline::{
    PipelineContext, Stage, StageInputs, StageKind, StageOutput, StageParameters,
};
use crate::security::compute_sha256;

pub const DEFAULT_BUILD_WORKDIR: &str = "/usr/src/app";

static DEFAULT_EXCLUDES: Lazy<Vec<Pattern>> = Lazy::new(|| {
    [".git", ".git/**", "target", "target/**"]
        .iter()
        .filter_map(|pattern| Pattern::new(pattern).ok())
        .collect()
});

const STDERR_TAIL_LINES: usize = 20;

/// Host cargo settings that would move or rename the release artifact.
const CARGO_HOST_OVERRIDES: [&str; 2] = ["CARGO_BUILD_TARGET", "CARGO_BUILD_TARGET_DIR"];

/// The executable a build stage produced, carried outside its workspace.
#[derive(Debug, Clone, Serialize)]
pub struct BuildArtifact {
    pub stage: String,
    pub file_name: String,
    pub path: PathBuf,
    pub sha256: String,
    pub size: u64,
    pub executable: bool,
}

impl BuildArtifact {
    pub fn summary(&self) -> ArtifactSummary {
        ArtifactSummary {
            file: self.file_name.clone(),
            sha256: self.sha256.clone(),
            size: self.size,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildParams {
    pub source: PathBuf,
    pub workdir: String,
    pub command: Option<Vec<String>>,
    pub artifact: Option<String>,
    pub exclude: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl BuildParams {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let source = take_string(&mut params, "source")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let workdir =
            take_string(&mut params, "workdir").unwrap_or_else(|| DEFAULT_BUILD_WORKDIR.into());
        if !workdir.starts_with('/') {
            bail!("build stage 'workdir' must be an absolute path, got '{workdir}'");
        }
        let command = take_string_list(&mut params, "command")?;
        if command.as_ref().is_some_and(Vec::is_empty) {
            bail!("build stage 'command' cannot be empty");
        }
        let artifact = take_string(&mut params, "artifact");
        if let Some(path) = &artifact {
            validate_relative(path)?;
        }
        let exclude = take_string_list(&mut params, "exclude")?.unwrap_or_default();
        for pattern in &exclude {
            Pattern::new(pattern)
                .with_context(|| format!("build stage exclude '{pattern}' is not a valid glob"))?;
        }
        let env = take_string_map(&mut params, "env")?;
        ensure_consumed(&params, "build")?;
        Ok(Self {
            source,
            workdir,
            command,
            artifact,
            exclude,
            env,
        })
    }

    /// Release build command, falling back to the toolchain's default.
    pub fn resolve_command(&self, toolchain: &ToolchainId) -> Option<Vec<String>> {
        self.command.clone().or_else(|| {
            toolchain.is_cargo().then(|| {
                vec!["cargo".into(), "build".into(), "--release".into()]
            })
        })
    }

    /// Artifact path relative to the workspace, falling back to the
    /// toolchain's default output location for `app_name`.
    pub fn resolve_artifact(&self, toolchain: &ToolchainId, app_name: &str) -> Option<String> {
        self.artifact.clone().or_else(|| {
            toolchain
                .is_cargo()
                .then(|| format!("target/release/{app_name}"))
        })
    }
}

fn validate_relative(path: &str) -> Result<()> {
    let candidate = Path::new(path);
    if candidate.is_absolute()
        || candidate
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        bail!("build stage 'artifact' must be a path inside the workspace, got '{path}'");
    }
    if candidate.file_name().is_none() {
        bail!("build stage 'artifact' must name a file, got '{path}'");
    }
    Ok(())
}

pub struct BuildStage {
    params: BuildParams,
}

impl BuildStage {
    pub fn new(params: BuildParams) -> Self {
        Self { params }
    }

    fn build_error(stage: &str, reason: impl Into<String>) -> anyhow::Error {
        PipelineError::Build {
            stage: stage.to_string(),
            reason: reason.into(),
        }
        .into()
    }

    fn deterministic_env(
        &self,
        toolchain: &ToolchainId,
        workspace: &Path,
    ) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("SOURCE_DATE_EPOCH".into(), "0".into());
        if toolchain.is_cargo() {
            env.insert("CARGO_INCREMENTAL".into(), "0".into());
            // The default artifact path is <workspace>/target/release/<name>.
            env.insert(
                "CARGO_TARGET_DIR".into(),
                workspace.join("target").to_string_lossy().into_owned(),
            );
            let remap = format!(
                "--remap-path-prefix={}={}",
                workspace.display(),
                self.params.workdir
            );
            let flags = match std::env::var("RUSTFLAGS") {
                Ok(existing) if !existing.trim().is_empty() => format!("{existing} {remap}"),
                _ => remap,
            };
            env.insert("RUSTFLAGS".into(), flags);
        }
        env
    }
}

impl Stage for BuildStage {
    fn kind(&self) -> StageKind {
        StageKind::Build
    }

    fn run(&self, inputs: &StageInputs<'_>, ctx: &PipelineContext) -> Result<StageOutput> {
        let stage = inputs.stage();
        let base = inputs.environment()?;
        let toolchain = &base.toolchain;

        let source = ctx.root.join(&self.params.source);
        if !source.is_dir() {
            return Err(Self::build_error(
                stage,
                format!("source tree {} is not a directory", source.display()),
            ));
        }
        let command = self.params.resolve_command(toolchain).ok_or_else(|| {
            Self::build_error(
                stage,
                format!("no build command configured for toolchain {toolchain}"),
            )
        })?;
        let artifact_rel = self
            .params
            .resolve_artifact(toolchain, &ctx.name)
            .ok_or_else(|| {
                Self::build_error(
                    stage,
                    format!("no artifact path configured for toolchain {toolchain}"),
                )
            })?;

        let workspace = tempfile::Builder::new()
            .prefix("workspace-")
            .tempdir_in(&ctx.scratch)
            .context("Failed to create build workspace")?;

        let excludes = self.exclude_patterns(&source, &[ctx.output.directory.as_path(), ctx.scratch.as_path()])?;
        let copied = copy_tree(&source, workspace.path(), Path::new(""), &excludes)?;
        debug!(files = copied, source = %source.display(), "Source tree copied");

        info!(command = ?command, "Running build command");
        let mut build = Command::new(&command[0]);
        build.args(&command[1..]).current_dir(workspace.path());
        if toolchain.is_cargo() {
            for key in CARGO_HOST_OVERRIDES {
                build.env_remove(key);
            }
        }
        let output = build
            .envs(self.deterministic_env(toolchain, workspace.path()))
            .envs(&base.env)
            .envs(&self.params.env)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| {
                Self::build_error(stage, format!("failed to start '{}': {err}", command[0]))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.trim().is_empty() {
            debug!(stdout = %stdout.trim_end(), "Build output");
        }
        if !output.status.success() {
            let tail: Vec<&str> = stderr.lines().rev().take(STDERR_TAIL_LINES).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(Self::build_error(
                stage,
                format!(
                    "command {:?} exited with {}{}",
                    command,
                    output.status,
                    if tail.is_empty() {
                        String::new()
                    } else {
                        format!(":\n{}", tail.join("\n"))
                    }
                ),
            ));
        }

        let built = workspace.path().join(&artifact_rel);
        if !built.is_file() {
            return Err(Self::build_error(
                stage,
                format!("build succeeded but artifact '{artifact_rel}' was not produced"),
            ));
        }

        let file_name = built
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| anyhow!("artifact '{artifact_rel}' has no file name"))?;
        let carried_dir = ctx.scratch.join("artifacts").join(stage);
        fs::create_dir_all(&carried_dir).with_context(|| {
            format!("Failed to create artifact directory: {}", carried_dir.display())
        })?;
        let carried = carried_dir.join(&file_name);
        let size = fs::copy(&built, &carried)
            .with_context(|| format!("Failed to carry artifact {}", built.display()))?;
        let sha256 = compute_sha256(&carried)?;
        let executable = is_executable(&carried)?;
        if !executable {
            warn!(artifact = %file_name, "Build artifact is not marked executable");
        }

        let workspace_path = workspace.path().to_path_buf();
        workspace.close().with_context(|| {
            format!("Failed to discard build workspace: {}", workspace_path.display())
        })?;

        info!(artifact = %file_name, sha256 = %sha256, size, "Build artifact produced");

        Ok(StageOutput::Artifact(BuildArtifact {
            stage: stage.to_string(),
            file_name,
            path: carried,
            sha256,
            size,
            executable,
        }))
    }
}

impl BuildStage {
    fn exclude_patterns(&self, source: &Path, generated: &[&Path]) -> Result<Vec<Pattern>> {
        let mut patterns = DEFAULT_EXCLUDES.clone();
        for pattern in &self.params.exclude {
            patterns.push(Pattern::new(pattern)?);
        }

        // Previous images and this run's scratch never flow back into a build.
        let Ok(source) = source.canonicalize() else {
            return Ok(patterns);
        };
        for dir in generated {
            if let Ok(dir) = dir.canonicalize()
                && let Ok(relative) = dir.strip_prefix(&source)
                && !relative.as_os_str().is_empty()
            {
                let relative = relative.to_string_lossy().replace('\\', "/");
                patterns.push(Pattern::new(&Pattern::escape(&relative))?);
            }
        }
        Ok(patterns)
    }
}

fn is_excluded(relative: &Path, excludes: &[Pattern]) -> bool {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    let normalized = relative.to_string_lossy().replace('\\', "/");
    excludes
        .iter()
        .any(|pattern| pattern.matches_with(&normalized, options))
}

/// Copy `source/relative` into `dest/relative`, skipping excluded paths.
/// Returns the number of files copied.
fn copy_tree(source: &Path, dest: &Path, relative: &Path, excludes: &[Pattern]) -> Result<usize> {
    let dir = source.join(relative);
    let mut entries = fs::read_dir(&dir)
        .with_context(|| format!("Failed to read source directory: {}", dir.display()))?
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    let mut copied = 0usize;
    for entry in entries {
        let rel = relative.join(entry.file_name());
        if is_excluded(&rel, excludes) {
            continue;
        }
        let target = dest.join(&rel);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
            copied += copy_tree(source, dest, &rel, excludes)?;
        } else if file_type.is_symlink() {
            copy_symlink(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> Result<()> {
    let pointee = fs::read_link(link)
        .with_context(|| format!("Failed to read symlink {}", link.display()))?;
    std::os::unix::fs::symlink(&pointee, target)
        .with_context(|| format!("Failed to recreate symlink {}", target.display()))
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, _target: &Path) -> Result<()> {
    warn!(path = %link.display(), "Skipping symlink in source tree");
    Ok(())
}
