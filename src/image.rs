//! On-disk runtime images.
//!
//! An image is a directory holding `image.json` and a `rootfs/` tree. The
//! rootfs contains the working directory and, inside it, exactly one file:
//! the packaged executable that the entrypoint names.

use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::security::compute_sha256;

pub const IMAGE_CONFIG_FILE: &str = "image.json";
pub const ROOTFS_DIR: &str = "rootfs";
pub const IMAGE_SCHEMA: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseSummary {
    pub toolchain: String,
    pub reported_version: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub file: String,
    pub sha256: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub schema: u32,
    pub name: String,
    pub base: BaseSummary,
    pub working_dir: String,
    pub entrypoint: Vec<String>,
    pub artifact: ArtifactSummary,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeImage {
    pub root: PathBuf,
    pub config: ImageConfig,
}

impl RuntimeImage {
    pub fn load(root: &Path) -> Result<Self> {
        let config_path = root.join(IMAGE_CONFIG_FILE);
        let file = File::open(&config_path)
            .with_context(|| format!("Failed to open image config: {}", config_path.display()))?;
        let config: ImageConfig = serde_json::from_reader(file)
            .with_context(|| format!("Failed to parse image config: {}", config_path.display()))?;
        if config.schema != IMAGE_SCHEMA {
            bail!(
                "Unsupported image schema {} in {}",
                config.schema,
                config_path.display()
            );
        }
        Ok(Self {
            root: root.to_path_buf(),
            config,
        })
    }

    pub fn write_config(&self) -> Result<()> {
        let config_path = self.root.join(IMAGE_CONFIG_FILE);
        let file = File::create(&config_path)
            .with_context(|| format!("Failed to create image config: {}", config_path.display()))?;
        serde_json::to_writer_pretty(file, &self.config)
            .with_context(|| format!("Failed to write image config: {}", config_path.display()))?;
        Ok(())
    }

    pub fn rootfs(&self) -> PathBuf {
        self.root.join(ROOTFS_DIR)
    }

    pub fn working_dir(&self) -> Result<PathBuf> {
        container_path(&self.rootfs(), &self.config.working_dir)
    }

    pub fn entrypoint_path(&self) -> Result<PathBuf> {
        let [command] = self.config.entrypoint.as_slice() else {
            bail!(
                "Image entrypoint must be a single command without arguments, found {:?}",
                self.config.entrypoint
            );
        };
        let file = command
            .strip_prefix("./")
            .ok_or_else(|| anyhow!("Entrypoint '{command}' must be relative to the working directory"))?;
        validate_file_name(file)?;
        Ok(self.working_dir()?.join(file))
    }

    /// Check the image layout: the rootfs holds only the working directory
    /// chain and the entrypoint, which is executable and matches the recorded
    /// digest.
    pub fn verify(&self) -> Result<()> {
        let entrypoint = self.entrypoint_path()?;
        if !entrypoint.is_file() {
            bail!("Entrypoint {} is missing", entrypoint.display());
        }
        if !is_executable(&entrypoint)? {
            bail!("Entrypoint {} is not executable", entrypoint.display());
        }

        let mut files = Vec::new();
        collect_files(&self.rootfs(), &mut files)?;
        if files != [entrypoint.clone()] {
            bail!(
                "Image rootfs must contain exactly the entrypoint, found: {}",
                files
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        let digest = compute_sha256(&entrypoint)?;
        if digest != self.config.artifact.sha256 {
            bail!(
                "Entrypoint digest {} does not match recorded artifact {}",
                digest,
                self.config.artifact.sha256
            );
        }
        debug!(image = %self.root.display(), "Image layout verified");
        Ok(())
    }

    /// Execute the entrypoint with no arguments from the working directory
    /// and return its exit code.
    pub fn run(&self) -> Result<i32> {
        self.verify()?;
        let entrypoint = self.entrypoint_path()?;
        let working_dir = self.working_dir()?;
        info!(
            image = %self.config.name,
            entrypoint = %entrypoint.display(),
            "Starting image entrypoint"
        );
        let status = Command::new(&entrypoint)
            .current_dir(&working_dir)
            .status()
            .with_context(|| format!("Failed to start entrypoint {}", entrypoint.display()))?;
        Ok(status.code().unwrap_or(1))
    }
}

/// Resolve an absolute container path (e.g. `/app`) under `rootfs`.
pub fn container_path(rootfs: &Path, logical: &str) -> Result<PathBuf> {
    let logical_path = Path::new(logical);
    if !logical.starts_with('/') {
        bail!("Container path '{logical}' must be absolute");
    }
    let mut resolved = rootfs.to_path_buf();
    for component in logical_path.components() {
        match component {
            Component::RootDir => {}
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => bail!("Container path '{logical}' may not contain '..' or prefixes"),
        }
    }
    Ok(resolved)
}

pub fn validate_file_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => bail!("'{name}' must be a plain file name"),
    }
}

pub fn is_executable(path: &Path) -> Result<bool> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("Failed to read metadata: {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        Ok(metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
    }
    #[cfg(not(unix))]
    {
        Ok(metadata.is_file())
    }
}

pub fn set_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
            .with_context(|| format!("Failed to mark executable: {}", path.display()))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to list directory: {}", dir.display()))?
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}
