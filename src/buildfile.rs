use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::pipeline::{OutputSpec, StageSpec};

/// A pipeline definition loaded from YAML.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Buildfile {
    pub version: u32,
    pub name: String,
    pub stages: Vec<StageSpec>,
    #[serde(default)]
    pub output: OutputSpec,
    /// Directory relative paths resolve against.
    #[serde(skip)]
    pub root: PathBuf,
}

impl Buildfile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read buildfile: {}", path.display()))?;
        let root = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_yaml(&content, root)
            .with_context(|| format!("Failed to parse buildfile YAML: {}", path.display()))
    }

    pub fn from_yaml(content: &str, root: impl Into<PathBuf>) -> Result<Self> {
        let mut buildfile: Buildfile = serde_yaml::from_str(content)?;
        buildfile.root = root.into();
        Ok(buildfile)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn output_directory(&self) -> PathBuf {
        self.root.join(&self.output.directory)
    }

    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|spec| spec.name == name)
    }

    pub fn stages_of<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a StageSpec> + 'a {
        self.stages.iter().filter(move |spec| spec.stage == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: 1
name: robot_tech_test
stages:
  - name: base
    stage: provision
    params:
      toolchain: "rust:1.75"
  - name: builder
    stage: build
    needs: [base]
  - name: runtime
    stage: package
    needs: [base, builder]
"#;

    #[test]
    fn parses_stages_and_defaults() {
        let buildfile = Buildfile::from_yaml(SAMPLE, "/work").unwrap();
        assert_eq!(buildfile.name, "robot_tech_test");
        assert_eq!(buildfile.stages.len(), 3);
        assert_eq!(buildfile.output_directory(), PathBuf::from("/work/out"));
        assert_eq!(
            buildfile.stage("runtime").unwrap().needs,
            vec!["base", "builder"]
        );
        assert_eq!(buildfile.stages_of("build").count(), 1);
        assert!(buildfile.stage("builder").unwrap().params.is_none());
    }

    #[test]
    fn absolute_output_directories_are_kept() {
        let mut buildfile = Buildfile::from_yaml(SAMPLE, "/work").unwrap();
        buildfile.output.directory = PathBuf::from("/srv/images");
        assert_eq!(buildfile.output_directory(), PathBuf::from("/srv/images"));
    }
}
