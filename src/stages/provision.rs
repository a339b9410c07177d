use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ensure_consumed, take_string, take_string_list, take_string_map};
use crate::error::PipelineError;
use crate::image::BaseSummary;
use crate::pipeline::{
    PipelineContext, Stage, StageInputs, StageKind, StageOutput, StageParameters,
};
use crate::security::sha256_hex;

const ANY_VERSION: [&str; 3] = ["latest", "stable", "*"];

/// A `tool:version` toolchain reference such as `rust:1.75`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ToolchainId {
    pub tool: String,
    pub version: String,
}

impl ToolchainId {
    pub fn accepts_any_version(&self) -> bool {
        ANY_VERSION.contains(&self.version.as_str())
    }

    /// Whether a probe's reported version line satisfies this reference.
    pub fn matches(&self, reported: &str) -> bool {
        if self.accepts_any_version() {
            return true;
        }
        reported
            .split(|c: char| c.is_whitespace() || matches!(c, ',' | '(' | ')' | ';'))
            .map(|token| token.trim_start_matches(|c: char| !c.is_ascii_digit()))
            .filter(|token| !token.is_empty())
            .any(|token| {
                token == self.version
                    || token
                        .strip_prefix(self.version.as_str())
                        .is_some_and(|rest| rest.starts_with('.') || rest.starts_with('-'))
            })
    }

    pub fn is_cargo(&self) -> bool {
        matches!(self.tool.as_str(), "rust" | "cargo" | "rustc")
    }

    pub fn default_probe(&self) -> Vec<String> {
        match self.tool.as_str() {
            "rust" | "rustc" => vec!["rustc".into(), "--version".into()],
            "go" | "golang" => vec!["go".into(), "version".into()],
            tool => vec![tool.to_string(), "--version".into()],
        }
    }

    /// Container image reference used when rendering a Dockerfile.
    pub fn default_image(&self) -> String {
        let version = if self.accepts_any_version() {
            "latest"
        } else {
            self.version.as_str()
        };
        let repository = match self.tool.as_str() {
            "rust" | "rustc" | "cargo" => "rust",
            "go" | "golang" => "golang",
            "gcc" | "make" => "gcc",
            other => other,
        };
        format!("{repository}:{version}")
    }
}

impl FromStr for ToolchainId {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim();
        let (tool, version) = match value.split_once(':') {
            Some((tool, version)) => (tool.trim(), version.trim()),
            None => (value, "latest"),
        };
        if tool.is_empty() || tool.contains(char::is_whitespace) {
            bail!("Invalid toolchain '{value}': expected 'tool:version'");
        }
        if version.is_empty() || version.contains(char::is_whitespace) {
            bail!("Invalid toolchain '{value}': version cannot be empty");
        }
        Ok(Self {
            tool: tool.to_string(),
            version: version.to_string(),
        })
    }
}

impl TryFrom<String> for ToolchainId {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ToolchainId> for String {
    fn from(value: ToolchainId) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ToolchainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tool, self.version)
    }
}

/// Immutable snapshot of a resolved toolchain environment.
#[derive(Debug, Clone, Serialize)]
pub struct BaseEnvironment {
    pub toolchain: ToolchainId,
    pub program: PathBuf,
    pub reported_version: String,
    pub fingerprint: String,
    pub env: BTreeMap<String, String>,
}

impl BaseEnvironment {
    /// Materialize a fresh, empty root filesystem for this base at `dir`.
    pub fn instantiate(&self, dir: &Path) -> Result<PathBuf> {
        if dir.exists() {
            bail!(
                "Cannot instantiate base {} at {}: path already exists",
                self.toolchain,
                dir.display()
            );
        }
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create root filesystem: {}", dir.display()))?;
        Ok(dir.to_path_buf())
    }

    pub fn summary(&self) -> BaseSummary {
        BaseSummary {
            toolchain: self.toolchain.to_string(),
            reported_version: self.reported_version.clone(),
            fingerprint: self.fingerprint.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolchainRequest {
    pub toolchain: ToolchainId,
    pub probe: Vec<String>,
    /// Directory that relative version commands resolve against.
    pub root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ResolvedToolchain {
    pub program: PathBuf,
    pub reported_version: String,
}

pub trait ToolchainResolver: Send + Sync {
    fn resolve(&self, request: &ToolchainRequest) -> Result<ResolvedToolchain>;
}

/// Resolves toolchains installed on the host by running their version probe.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostToolchainResolver;

impl ToolchainResolver for HostToolchainResolver {
    fn resolve(&self, request: &ToolchainRequest) -> Result<ResolvedToolchain> {
        let (program, args) = request
            .probe
            .split_first()
            .ok_or_else(|| anyhow!("probe command is empty"))?;
        let program = find_program(program, &request.root)
            .ok_or_else(|| anyhow!("'{program}' was not found on PATH"))?;

        debug!(program = %program.display(), ?args, "Probing toolchain");
        let output = Command::new(&program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to run {}", program.display()))?;
        if !output.status.success() {
            bail!(
                "probe {} exited with {}: {}",
                program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let reported = first_line(&output.stdout)
            .or_else(|| first_line(&output.stderr))
            .ok_or_else(|| anyhow!("probe {} printed no version", program.display()))?;

        Ok(ResolvedToolchain {
            program,
            reported_version: reported,
        })
    }
}

fn first_line(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Locate `name` the way a shell would, except that a relative path such as
/// `./tools/rustc` is taken from `root` rather than the current directory.
pub fn find_program(name: &str, root: &Path) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        let candidate = root.join(candidate);
        return candidate.is_file().then_some(candidate);
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|path| path.is_file())
}

#[derive(Debug, Clone)]
pub struct ProvisionParams {
    pub toolchain: ToolchainId,
    pub probe: Option<Vec<String>>,
    pub image: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl ProvisionParams {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let toolchain = take_string(&mut params, "toolchain")
            .ok_or_else(|| anyhow!("provision stage requires 'toolchain' parameter"))?
            .parse()?;
        let probe = take_string_list(&mut params, "probe")?;
        if probe.as_ref().is_some_and(Vec::is_empty) {
            bail!("provision stage 'probe' cannot be empty");
        }
        let image = take_string(&mut params, "image");
        let env = take_string_map(&mut params, "env")?;
        ensure_consumed(&params, "provision")?;
        Ok(Self {
            toolchain,
            probe,
            image,
            env,
        })
    }

    pub fn image(&self) -> String {
        self.image
            .clone()
            .unwrap_or_else(|| self.toolchain.default_image())
    }
}

pub struct ProvisionStage {
    params: ProvisionParams,
    resolver: Arc<dyn ToolchainResolver>,
}

impl ProvisionStage {
    pub fn new(params: ProvisionParams, resolver: Arc<dyn ToolchainResolver>) -> Self {
        Self { params, resolver }
    }
}

impl Stage for ProvisionStage {
    fn kind(&self) -> StageKind {
        StageKind::Provision
    }

    fn run(&self, _inputs: &StageInputs<'_>, ctx: &PipelineContext) -> Result<StageOutput> {
        let toolchain = &self.params.toolchain;
        let request = ToolchainRequest {
            toolchain: toolchain.clone(),
            probe: self
                .params
                .probe
                .clone()
                .unwrap_or_else(|| toolchain.default_probe()),
            root: ctx.root.clone(),
        };

        let resolved =
            self.resolver
                .resolve(&request)
                .map_err(|err| PipelineError::Provisioning {
                    toolchain: toolchain.to_string(),
                    reason: format!("{err:#}"),
                })?;

        if !toolchain.matches(&resolved.reported_version) {
            return Err(PipelineError::Provisioning {
                toolchain: toolchain.to_string(),
                reason: format!(
                    "probe reported '{}', which does not satisfy version {}",
                    resolved.reported_version, toolchain.version
                ),
            }
            .into());
        }

        let toolchain_label = toolchain.to_string();
        let program = resolved.program.to_string_lossy();
        let fingerprint = sha256_hex(&[
            toolchain_label.as_bytes(),
            program.as_bytes(),
            resolved.reported_version.as_bytes(),
        ]);

        info!(
            toolchain = %toolchain,
            version = %resolved.reported_version,
            fingerprint = %fingerprint,
            "Toolchain provisioned"
        );

        Ok(StageOutput::Environment(BaseEnvironment {
            toolchain: toolchain.clone(),
            program: resolved.program,
            reported_version: resolved.reported_version,
            fingerprint,
            env: self.params.env.clone(),
        }))
    }
}
