use thiserror::Error;

/// Failure kinds a pipeline run can end with.
///
/// Stages return `anyhow::Result`; the executor downcasts to this type and
/// wraps anything else in [`PipelineError::Stage`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("toolchain '{toolchain}' could not be provisioned: {reason}")]
    Provisioning { toolchain: String, reason: String },

    #[error("stage '{stage}' failed to build: {reason}")]
    Build { stage: String, reason: String },

    #[error("stage '{stage}' ran out of order: {reason}")]
    Ordering { stage: String, reason: String },

    #[error("stage '{stage}' packaged artifact {actual} but the build produced {expected}")]
    ArtifactMismatch {
        stage: String,
        expected: String,
        actual: String,
    },

    #[error("stage '{stage}' failed: {source:#}")]
    Stage {
        stage: String,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Provisioning { .. } => "provisioning",
            PipelineError::Build { .. } => "build",
            PipelineError::Ordering { .. } => "ordering",
            PipelineError::ArtifactMismatch { .. } => "artifact_mismatch",
            PipelineError::Stage { .. } => "stage",
        }
    }

    pub(crate) fn from_stage(stage: &str, err: anyhow::Error) -> Self {
        match err.downcast::<PipelineError>() {
            Ok(typed) => typed,
            Err(other) => PipelineError::Stage {
                stage: stage.to_string(),
                source: other,
            },
        }
    }
}
