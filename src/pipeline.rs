use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, instrument, warn};

use crate::buildfile::Buildfile;
use crate::error::PipelineError;
use crate::graph::plan_order;
use crate::image::{ArtifactSummary, RuntimeImage};
use crate::observability::MetricsCollector;
use crate::stages::build::BuildArtifact;
use crate::stages::provision::BaseEnvironment;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputSpec {
    #[serde(default = "default_output_directory")]
    pub directory: PathBuf,
}

impl Default for OutputSpec {
    fn default() -> Self {
        Self {
            directory: default_output_directory(),
        }
    }
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("out")
}

pub type StageParameters = Map<String, Value>;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageSpec {
    pub name: String,
    pub stage: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<StageParameters>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Provision,
    Build,
    Package,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Provision => "provision",
            StageKind::Build => "build",
            StageKind::Package => "package",
        }
    }
}

/// Lifecycle of one pipeline run. `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Pending,
    Provisioned,
    Built,
    Packaged,
    Failed,
}

impl PipelineState {
    fn rank(self) -> u8 {
        match self {
            PipelineState::Pending => 0,
            PipelineState::Provisioned => 1,
            PipelineState::Built => 2,
            PipelineState::Packaged => 3,
            PipelineState::Failed => u8::MAX,
        }
    }

    /// State after a stage of `kind` completes, or an ordering violation if
    /// the stage may not run yet.
    pub fn advance(self, stage: &str, kind: StageKind) -> Result<Self, PipelineError> {
        let (required, reached) = match kind {
            StageKind::Provision => (PipelineState::Pending, PipelineState::Provisioned),
            StageKind::Build => (PipelineState::Provisioned, PipelineState::Built),
            StageKind::Package => (PipelineState::Built, PipelineState::Packaged),
        };

        if self == PipelineState::Failed {
            return Err(PipelineError::Ordering {
                stage: stage.to_string(),
                reason: "pipeline already failed".into(),
            });
        }
        if self == PipelineState::Packaged {
            return Err(PipelineError::Ordering {
                stage: stage.to_string(),
                reason: "image was already packaged".into(),
            });
        }
        if self.rank() < required.rank() {
            return Err(PipelineError::Ordering {
                stage: stage.to_string(),
                reason: format!(
                    "{} stage requires state {:?} but pipeline is {:?}",
                    kind.as_str(),
                    required,
                    self
                ),
            });
        }

        Ok(if reached.rank() > self.rank() {
            reached
        } else {
            self
        })
    }
}

#[derive(Debug)]
pub enum StageOutput {
    Environment(BaseEnvironment),
    Artifact(BuildArtifact),
    Image(RuntimeImage),
}

/// Outputs of the stages a stage declared in `needs`, in declaration order.
pub struct StageInputs<'a> {
    stage: &'a str,
    entries: Vec<(&'a str, &'a StageOutput)>,
}

impl<'a> StageInputs<'a> {
    pub fn new(stage: &'a str, entries: Vec<(&'a str, &'a StageOutput)>) -> Self {
        Self { stage, entries }
    }

    pub fn stage(&self) -> &'a str {
        self.stage
    }

    pub fn environment(&self) -> Result<&'a BaseEnvironment, PipelineError> {
        self.entries
            .iter()
            .find_map(|(_, output)| match output {
                StageOutput::Environment(env) => Some(env),
                _ => None,
            })
            .ok_or_else(|| PipelineError::Ordering {
                stage: self.stage.to_string(),
                reason: "no provisioned base environment among its inputs".into(),
            })
    }

    /// The single build artifact among the inputs, or the one produced by
    /// stage `from` when given.
    pub fn artifact(&self, from: Option<&str>) -> Result<&'a BuildArtifact, PipelineError> {
        let artifacts: Vec<(&str, &BuildArtifact)> = self
            .entries
            .iter()
            .filter_map(|(name, output)| match output {
                StageOutput::Artifact(artifact) => Some((*name, artifact)),
                _ => None,
            })
            .collect();

        let selected = match from {
            Some(wanted) => artifacts.iter().find(|(name, _)| *name == wanted),
            None if artifacts.len() == 1 => artifacts.first(),
            None if artifacts.len() > 1 => {
                return Err(PipelineError::Ordering {
                    stage: self.stage.to_string(),
                    reason: "several build artifacts available; set 'from'".into(),
                });
            }
            None => None,
        };

        selected
            .map(|(_, artifact)| *artifact)
            .ok_or_else(|| PipelineError::Ordering {
                stage: self.stage.to_string(),
                reason: match from {
                    Some(wanted) => format!("no build artifact from stage '{wanted}'"),
                    None => "no build artifact among its inputs".into(),
                },
            })
    }
}

#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub name: String,
    pub root: PathBuf,
    pub output: OutputSpec,
    pub scratch: PathBuf,
}

pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;
    fn run(&self, inputs: &StageInputs<'_>, ctx: &PipelineContext) -> Result<StageOutput>;
}

type StageConstructor = Arc<dyn Fn(StageParameters) -> Result<Box<dyn Stage>> + Send + Sync>;

pub struct StageRegistry {
    factories: HashMap<String, StageConstructor>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(StageParameters) -> Result<Box<dyn Stage>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(constructor));
    }

    pub fn create(&self, name: &str, params: StageParameters) -> Result<Box<dyn Stage>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            anyhow!(
                "Unknown stage '{}'. Available stages: {}",
                name,
                self.known_stages().join(", ")
            )
        })?;
        factory(params)
    }

    pub fn known_stages(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

struct PlannedStage {
    name: String,
    needs: Vec<String>,
    stage: Box<dyn Stage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub name: String,
    pub kind: StageKind,
    pub status: StageStatus,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageFailure {
    pub stage: String,
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct PipelineRun {
    pub name: String,
    pub state: PipelineState,
    pub stages: Vec<StageRecord>,
    pub artifacts: BTreeMap<String, ArtifactSummary>,
    pub image: Option<RuntimeImage>,
    pub failure: Option<StageFailure>,
    pub duration_ms: f64,
    #[serde(skip)]
    pub error: Option<PipelineError>,
}

impl PipelineRun {
    pub fn succeeded(&self) -> bool {
        self.state == PipelineState::Packaged && self.error.is_none()
    }

    pub fn into_result(mut self) -> Result<Self> {
        match self.error.take() {
            Some(err) => Err(anyhow::Error::new(err)),
            None => Ok(self),
        }
    }
}

pub struct PipelineExecutor {
    stages: Vec<PlannedStage>,
    name: String,
    root: PathBuf,
    output: OutputSpec,
    metrics: MetricsCollector,
    state: Cell<PipelineState>,
}

impl PipelineExecutor {
    pub fn state(&self) -> PipelineState {
        self.state.get()
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Run every stage once and report the outcome.
    ///
    /// Stage failures are captured in the returned run rather than returned
    /// as `Err`; use [`PipelineRun::into_result`] or [`Self::execute`] to
    /// turn them into an error.
    #[instrument(skip(self), fields(pipeline = %self.name))]
    pub fn run(&self) -> PipelineRun {
        self.metrics.reset();
        self.state.set(PipelineState::Pending);
        let total_start = Instant::now();

        let mut run = PipelineRun {
            name: self.name.clone(),
            state: PipelineState::Pending,
            stages: Vec::with_capacity(self.stages.len()),
            artifacts: BTreeMap::new(),
            image: None,
            failure: None,
            duration_ms: 0.0,
            error: None,
        };

        let result = self.run_stages(&mut run);
        if let Err(err) = result {
            self.state.set(PipelineState::Failed);
            error!(kind = err.kind(), "Pipeline failed: {err}");
            let stage = failed_stage_name(&err, &run);
            run.failure = Some(StageFailure {
                stage,
                kind: err.kind(),
                message: err.to_string(),
            });
            run.error = Some(err);
            self.metrics.record_run_failure();
        } else {
            self.metrics.record_run_success();
        }

        run.state = self.state.get();
        let elapsed = total_start.elapsed();
        run.duration_ms = elapsed.as_secs_f64() * 1_000.0;
        self.metrics.record_total_duration(elapsed);
        run
    }

    pub fn execute(&self) -> Result<PipelineRun> {
        self.run().into_result()
    }

    fn run_stages(&self, run: &mut PipelineRun) -> Result<(), PipelineError> {
        let setup_error = |err: anyhow::Error| PipelineError::Stage {
            stage: "setup".into(),
            source: err,
        };

        let output_dir = &self.output.directory;
        fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create output directory: {}", output_dir.display()))
            .map_err(setup_error)?;
        // All intermediate state lives here and is removed when the run ends.
        let scratch = tempfile::Builder::new()
            .prefix(".imagesmith-run-")
            .tempdir_in(output_dir)
            .with_context(|| format!("Failed to create scratch directory in {}", output_dir.display()))
            .map_err(setup_error)?;

        let ctx = PipelineContext {
            name: self.name.clone(),
            root: self.root.clone(),
            output: self.output.clone(),
            scratch: scratch.path().to_path_buf(),
        };

        let mut outputs: HashMap<&str, StageOutput> = HashMap::new();
        let mut failure: Option<PipelineError> = None;

        for planned in &self.stages {
            let kind = planned.stage.kind();
            if failure.is_some() {
                run.stages.push(StageRecord {
                    name: planned.name.clone(),
                    kind,
                    status: StageStatus::Skipped,
                    duration_ms: 0.0,
                });
                continue;
            }

            let span = tracing::span!(
                tracing::Level::INFO,
                "stage",
                stage = planned.name.as_str(),
                kind = kind.as_str()
            );
            let _span_guard = span.enter();
            let started = Instant::now();

            let outcome = self
                .state
                .get()
                .advance(&planned.name, kind)
                .and_then(|next| {
                    let output = self.run_stage(planned, &outputs, &ctx)?;
                    Ok((next, output))
                });
            let duration_ms = started.elapsed().as_secs_f64() * 1_000.0;

            match outcome {
                Ok((next, output)) => {
                    if let StageOutput::Artifact(artifact) = &output {
                        run.artifacts
                            .insert(planned.name.clone(), artifact.summary());
                    }
                    outputs.insert(planned.name.as_str(), output);
                    self.state.set(next);
                    info!(duration_ms, state = ?next, "Stage completed");
                    run.stages.push(StageRecord {
                        name: planned.name.clone(),
                        kind,
                        status: StageStatus::Succeeded,
                        duration_ms,
                    });
                }
                Err(err) => {
                    self.state.set(PipelineState::Failed);
                    run.stages.push(StageRecord {
                        name: planned.name.clone(),
                        kind,
                        status: StageStatus::Failed,
                        duration_ms,
                    });
                    failure = Some(err);
                }
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }

        let image = outputs.into_values().find_map(|output| match output {
            StageOutput::Image(image) => Some(image),
            _ => None,
        });
        let Some(image) = image else {
            return Err(PipelineError::Ordering {
                stage: self.name.clone(),
                reason: "pipeline finished without packaging an image".into(),
            });
        };

        let destination = output_dir.join(&self.name);
        let promoted = match promote_image(image, &destination, scratch.path()) {
            Ok(image) => image,
            Err(failure) => {
                if failure.stranded {
                    // The previous image only survives inside the scratch directory now.
                    let kept = scratch.keep();
                    error!(
                        previous = %kept.join(RETIRED_IMAGE_DIR).display(),
                        "Previous image could not be restored; scratch directory kept"
                    );
                }
                return Err(PipelineError::Stage {
                    stage: "promote".into(),
                    source: failure.error,
                });
            }
        };
        info!(image = %promoted.root.display(), "Runtime image written");
        run.image = Some(promoted);

        if let Err(err) = scratch.close() {
            warn!(error = %err, "Failed to remove scratch directory");
        }
        Ok(())
    }

    fn run_stage(
        &self,
        planned: &PlannedStage,
        outputs: &HashMap<&str, StageOutput>,
        ctx: &PipelineContext,
    ) -> Result<StageOutput, PipelineError> {
        let mut entries = Vec::with_capacity(planned.needs.len());
        for need in &planned.needs {
            let output = outputs
                .get(need.as_str())
                .ok_or_else(|| PipelineError::Ordering {
                    stage: planned.name.clone(),
                    reason: format!("input stage '{need}' has not completed"),
                })?;
            entries.push((need.as_str(), output));
        }
        let inputs = StageInputs::new(&planned.name, entries);

        let _timer = self.metrics.start_stage(&planned.name);
        planned
            .stage
            .run(&inputs, ctx)
            .map_err(|err| PipelineError::from_stage(&planned.name, err))
    }
}

fn failed_stage_name(err: &PipelineError, run: &PipelineRun) -> String {
    match err {
        PipelineError::Build { stage, .. }
        | PipelineError::Ordering { stage, .. }
        | PipelineError::ArtifactMismatch { stage, .. }
        | PipelineError::Stage { stage, .. } => stage.clone(),
        PipelineError::Provisioning { .. } => run
            .stages
            .iter()
            .find(|record| record.status == StageStatus::Failed)
            .map(|record| record.name.clone())
            .unwrap_or_default(),
    }
}

const RETIRED_IMAGE_DIR: &str = "retired";

struct PromotionFailure {
    error: anyhow::Error,
    /// The previous image is still parked under the scratch directory.
    stranded: bool,
}

impl PromotionFailure {
    fn new(error: anyhow::Error) -> Self {
        Self {
            error,
            stranded: false,
        }
    }
}

/// Move a staged image into `destination`, replacing any previous image only
/// once the new one is in place.
fn promote_image(
    mut image: RuntimeImage,
    destination: &Path,
    scratch: &Path,
) -> Result<RuntimeImage, PromotionFailure> {
    let retired = scratch.join(RETIRED_IMAGE_DIR);
    let had_previous = destination.exists();
    if had_previous {
        fs::rename(destination, &retired)
            .with_context(|| format!("Failed to retire previous image: {}", destination.display()))
            .map_err(PromotionFailure::new)?;
    }

    if let Err(err) = fs::rename(&image.root, destination) {
        let error = anyhow::Error::new(err)
            .context(format!("Failed to move image into place: {}", destination.display()));
        if had_previous && let Err(restore) = fs::rename(&retired, destination) {
            warn!(error = %restore, previous = %retired.display(), "Failed to restore previous image");
            return Err(PromotionFailure {
                error: error.context(format!(
                    "previous image could not be restored ({restore}) and was left at {}",
                    retired.display()
                )),
                stranded: true,
            });
        }
        return Err(PromotionFailure::new(error));
    }

    image.root = destination.to_path_buf();
    Ok(image)
}

pub fn build_pipeline(registry: &StageRegistry, buildfile: &Buildfile) -> Result<PipelineExecutor> {
    let order = plan_order(&buildfile.stages)?;

    let mut stages = Vec::with_capacity(order.len());
    let mut package_stages = 0usize;
    for idx in order {
        let spec = &buildfile.stages[idx];
        let params = spec.params.clone().unwrap_or_default();
        let stage = registry
            .create(&spec.stage, params)
            .with_context(|| format!("Stage '{}' ({})", spec.name, spec.stage))?;
        if stage.kind() == StageKind::Package {
            package_stages += 1;
        }
        stages.push(PlannedStage {
            name: spec.name.clone(),
            needs: spec.needs.clone(),
            stage,
        });
    }

    if package_stages != 1 {
        bail!(
            "Buildfile '{}' must contain exactly one package stage (found {})",
            buildfile.name,
            package_stages
        );
    }

    Ok(PipelineExecutor {
        stages,
        name: buildfile.name.clone(),
        root: buildfile.root.clone(),
        output: OutputSpec {
            directory: buildfile.output_directory(),
        },
        metrics: MetricsCollector::new(),
        state: Cell::new(PipelineState::Pending),
    })
}
