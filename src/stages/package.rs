use std::fs;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::info;

use super::{ensure_consumed, take_string};
use crate::error::PipelineError;
use crate::image::{
    IMAGE_SCHEMA, ImageConfig, ROOTFS_DIR, RuntimeImage, container_path, set_executable,
    validate_file_name,
};
use crate::pipeline::{
    PipelineContext, Stage, StageInputs, StageKind, StageOutput, StageParameters,
};
use crate::security::compute_sha256;

pub const DEFAULT_RUNTIME_WORKDIR: &str = "/app";

#[derive(Debug, Clone)]
pub struct PackageParams {
    pub workdir: String,
    pub file: Option<String>,
    pub from: Option<String>,
}

impl PackageParams {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let workdir =
            take_string(&mut params, "workdir").unwrap_or_else(|| DEFAULT_RUNTIME_WORKDIR.into());
        if !workdir.starts_with('/') {
            bail!("package stage 'workdir' must be an absolute path, got '{workdir}'");
        }
        let file = take_string(&mut params, "file");
        if let Some(name) = &file {
            validate_file_name(name).context("package stage 'file'")?;
        }
        let from = take_string(&mut params, "from");
        ensure_consumed(&params, "package")?;
        Ok(Self {
            workdir,
            file,
            from,
        })
    }
}

pub struct PackageStage {
    params: PackageParams,
}

impl PackageStage {
    pub fn new(params: PackageParams) -> Self {
        Self { params }
    }
}

impl Stage for PackageStage {
    fn kind(&self) -> StageKind {
        StageKind::Package
    }

    fn run(&self, inputs: &StageInputs<'_>, ctx: &PipelineContext) -> Result<StageOutput> {
        let stage = inputs.stage();
        let base = inputs.environment()?;
        let artifact = inputs.artifact(self.params.from.as_deref())?;

        if !artifact.path.is_file() {
            return Err(PipelineError::Ordering {
                stage: stage.to_string(),
                reason: format!(
                    "build artifact {} from stage '{}' does not exist",
                    artifact.path.display(),
                    artifact.stage
                ),
            }
            .into());
        }

        let file = self
            .params
            .file
            .clone()
            .unwrap_or_else(|| artifact.file_name.clone());

        // A fresh base instance: nothing from the builder workspace comes along.
        let image_root = ctx.scratch.join("image");
        fs::create_dir(&image_root)
            .with_context(|| format!("Failed to create image directory: {}", image_root.display()))?;
        let rootfs = base.instantiate(&image_root.join(ROOTFS_DIR))?;
        let workdir = container_path(&rootfs, &self.params.workdir)?;
        fs::create_dir_all(&workdir)
            .with_context(|| format!("Failed to create working directory: {}", workdir.display()))?;

        let target = workdir.join(&file);
        fs::copy(&artifact.path, &target)
            .with_context(|| format!("Failed to copy artifact into {}", target.display()))?;
        set_executable(&target)?;

        let packaged = compute_sha256(&target)?;
        if packaged != artifact.sha256 {
            return Err(PipelineError::ArtifactMismatch {
                stage: stage.to_string(),
                expected: artifact.sha256.clone(),
                actual: packaged,
            }
            .into());
        }

        let mut summary = artifact.summary();
        summary.file = file.clone();
        let image = RuntimeImage {
            root: image_root,
            config: ImageConfig {
                schema: IMAGE_SCHEMA,
                name: ctx.name.clone(),
                base: base.summary(),
                working_dir: self.params.workdir.clone(),
                entrypoint: vec![format!("./{file}")],
                artifact: summary,
                created_at: Utc::now(),
            },
        };
        image.write_config()?;
        image.verify()?;

        info!(
            workdir = %self.params.workdir,
            entrypoint = %image.config.entrypoint.join(" "),
            "Runtime image assembled"
        );
        Ok(StageOutput::Image(image))
    }
}
