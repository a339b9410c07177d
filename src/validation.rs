use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::buildfile::Buildfile;
use crate::graph::plan_order;
use crate::pipeline::{StageKind, StageRegistry, StageSpec};

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_buildfile(buildfile: &Buildfile, registry: &StageRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if buildfile.version != 1 {
        report
            .errors
            .push(format!("Unsupported buildfile version: {}", buildfile.version));
    }

    let name = buildfile.name.trim();
    if name.is_empty() {
        report.errors.push("Buildfile name cannot be empty".into());
    } else if name.contains(['/', '\\']) || name == "." || name == ".." {
        report
            .errors
            .push(format!("Buildfile name '{name}' must be a plain file name"));
    }

    if buildfile.output.directory.as_os_str().is_empty() {
        report
            .errors
            .push("Output directory cannot be empty".into());
    }

    if buildfile.stages.is_empty() {
        report
            .errors
            .push("Buildfile must contain at least one stage".into());
        return report;
    }

    if let Err(err) = plan_order(&buildfile.stages) {
        report.errors.push(err.to_string());
    }

    let mut kinds: HashMap<&str, StageKind> = HashMap::new();
    for (idx, spec) in buildfile.stages.iter().enumerate() {
        let params = spec.params.clone().unwrap_or_default();
        match registry.create(&spec.stage, params) {
            Ok(stage) => {
                kinds.insert(spec.name.as_str(), stage.kind());
            }
            Err(err) => report.errors.push(format!(
                "Stage {} ('{}'): {:#}",
                idx + 1,
                spec.name,
                err.context("Failed to instantiate stage")
            )),
        }
    }

    let package_count = kinds
        .values()
        .filter(|kind| **kind == StageKind::Package)
        .count();
    if package_count != 1 {
        report.errors.push(format!(
            "Buildfile must contain exactly one package stage (found {package_count})"
        ));
    }

    for spec in &buildfile.stages {
        if let Some(kind) = kinds.get(spec.name.as_str()) {
            report.merge(validate_stage_needs(spec, *kind, &kinds, buildfile));
        }
    }

    report.merge(unreachable_stages(buildfile, &kinds));
    report
}

fn needs_of_kind<'a>(
    spec: &'a StageSpec,
    kind: StageKind,
    kinds: &HashMap<&str, StageKind>,
) -> Vec<&'a str> {
    spec.needs
        .iter()
        .map(String::as_str)
        .filter(|need| kinds.get(need) == Some(&kind))
        .collect()
}

fn validate_stage_needs(
    spec: &StageSpec,
    kind: StageKind,
    kinds: &HashMap<&str, StageKind>,
    buildfile: &Buildfile,
) -> ValidationReport {
    let mut report = ValidationReport::default();
    let name = &spec.name;

    match kind {
        StageKind::Provision => {
            if !spec.needs.is_empty() {
                report
                    .errors
                    .push(format!("Provision stage '{name}' cannot depend on other stages"));
            }
        }
        StageKind::Build => {
            if needs_of_kind(spec, StageKind::Provision, kinds).len() != 1 {
                report.errors.push(format!(
                    "Build stage '{name}' must need exactly one provision stage"
                ));
            }
            if !needs_of_kind(spec, StageKind::Package, kinds).is_empty() {
                report
                    .errors
                    .push(format!("Build stage '{name}' cannot depend on a package stage"));
            }
        }
        StageKind::Package => {
            let bases = needs_of_kind(spec, StageKind::Provision, kinds);
            let builds = needs_of_kind(spec, StageKind::Build, kinds);
            if bases.len() != 1 {
                report.errors.push(format!(
                    "Package stage '{name}' must need exactly one provision stage"
                ));
            }
            if builds.is_empty() {
                report.errors.push(format!(
                    "Package stage '{name}' must need a build stage to take its artifact from"
                ));
            }

            let from = spec
                .params
                .as_ref()
                .and_then(|params| params.get("from"))
                .and_then(|value| value.as_str());
            match from {
                Some(from) if !builds.contains(&from) => report.errors.push(format!(
                    "Package stage '{name}' takes its artifact from '{from}', which is not one of its build needs"
                )),
                None if builds.len() > 1 => report.errors.push(format!(
                    "Package stage '{name}' needs several build stages; set 'from'"
                )),
                _ => {}
            }

            // The runtime image should start from the same base the builder used.
            if let [runtime_base] = bases.as_slice() {
                for build in &builds {
                    let builder_bases = buildfile
                        .stage(build)
                        .map(|b| needs_of_kind(b, StageKind::Provision, kinds))
                        .unwrap_or_default();
                    if !builder_bases.contains(runtime_base) {
                        report.warnings.push(format!(
                            "Package stage '{name}' uses base '{runtime_base}' but build stage '{build}' was compiled on a different base"
                        ));
                    }
                }
            }
        }
    }

    report
}

fn unreachable_stages(buildfile: &Buildfile, kinds: &HashMap<&str, StageKind>) -> ValidationReport {
    let mut report = ValidationReport::default();
    let Some(package) = buildfile
        .stages
        .iter()
        .find(|spec| kinds.get(spec.name.as_str()) == Some(&StageKind::Package))
    else {
        return report;
    };

    let mut reachable = BTreeSet::new();
    let mut pending = vec![package.name.as_str()];
    while let Some(name) = pending.pop() {
        if !reachable.insert(name) {
            continue;
        }
        if let Some(spec) = buildfile.stage(name) {
            pending.extend(spec.needs.iter().map(String::as_str));
        }
    }

    for spec in &buildfile.stages {
        if !reachable.contains(spec.name.as_str()) {
            report.warnings.push(format!(
                "Stage '{}' does not contribute to the packaged image",
                spec.name
            ));
        }
    }
    report
}
