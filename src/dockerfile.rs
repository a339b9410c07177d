//! Render a buildfile as the equivalent multi-stage Dockerfile.

use std::fmt::Write as _;

use anyhow::{Result, anyhow, bail};

use crate::buildfile::Buildfile;
use crate::graph::plan_order;
use crate::pipeline::StageSpec;
use crate::stages::build::BuildParams;
use crate::stages::package::PackageParams;
use crate::stages::provision::ProvisionParams;

pub fn render_dockerfile(buildfile: &Buildfile) -> Result<String> {
    let order = plan_order(&buildfile.stages)?;
    let mut out = String::new();
    let _ = writeln!(out, "# Generated by imagesmith from buildfile '{}'", buildfile.name);

    for idx in order {
        let spec = &buildfile.stages[idx];
        let params = spec.params.clone().unwrap_or_default();
        out.push('\n');
        match spec.stage.as_str() {
            "provision" => {
                let provision = ProvisionParams::from_params(params)?;
                let _ = writeln!(out, "FROM {} AS {}", provision.image(), spec.name);
                for (key, value) in &provision.env {
                    let _ = writeln!(out, "ENV {key}={}", quote_env(value));
                }
            }
            "build" => {
                let build = BuildParams::from_params(params)?;
                let base = base_of(buildfile, spec)?;
                let provision = provision_params(buildfile, base)?;
                let command = build
                    .resolve_command(&provision.toolchain)
                    .ok_or_else(|| anyhow!("Stage '{}' has no build command", spec.name))?;
                let source = build.source.to_string_lossy().replace('\\', "/");

                let _ = writeln!(out, "FROM {base} AS {}", spec.name);
                let _ = writeln!(out, "WORKDIR {}", build.workdir);
                for (key, value) in &build.env {
                    let _ = writeln!(out, "ENV {key}={}", quote_env(value));
                }
                let _ = writeln!(out, "COPY {source} .");
                let _ = writeln!(out, "RUN {}", exec_form(&command)?);
            }
            "package" => {
                let package = PackageParams::from_params(params)?;
                let base = base_of(buildfile, spec)?;
                let builder_name = builder_of(buildfile, spec, package.from.as_deref())?;
                let builder = buildfile
                    .stage(builder_name)
                    .ok_or_else(|| anyhow!("Unknown build stage '{builder_name}'"))?;
                let build = BuildParams::from_params(builder.params.clone().unwrap_or_default())?;
                let builder_base = provision_params(buildfile, base_of(buildfile, builder)?)?;
                let artifact = build
                    .resolve_artifact(&builder_base.toolchain, &buildfile.name)
                    .ok_or_else(|| anyhow!("Stage '{builder_name}' has no artifact path"))?;
                let file = package.file.clone().unwrap_or_else(|| {
                    artifact
                        .rsplit('/')
                        .next()
                        .unwrap_or(artifact.as_str())
                        .to_string()
                });

                let _ = writeln!(out, "FROM {base}");
                let _ = writeln!(out, "WORKDIR {}", package.workdir);
                let _ = writeln!(
                    out,
                    "COPY --from={builder_name} {}/{artifact} ./{file}",
                    build.workdir.trim_end_matches('/')
                );
                let _ = writeln!(out, "CMD {}", exec_form(&[format!("./{file}")])?);
            }
            other => bail!("Stage '{}' has unknown kind '{other}'", spec.name),
        }
    }

    Ok(out)
}

fn base_of<'a>(buildfile: &'a Buildfile, spec: &'a StageSpec) -> Result<&'a str> {
    spec.needs
        .iter()
        .find(|need| {
            buildfile
                .stage(need)
                .is_some_and(|dep| dep.stage == "provision")
        })
        .map(String::as_str)
        .ok_or_else(|| anyhow!("Stage '{}' does not need a provision stage", spec.name))
}

fn builder_of<'a>(
    buildfile: &'a Buildfile,
    spec: &'a StageSpec,
    from: Option<&'a str>,
) -> Result<&'a str> {
    if let Some(from) = from {
        return Ok(from);
    }
    let mut builds = spec.needs.iter().filter(|need| {
        buildfile
            .stage(need)
            .is_some_and(|dep| dep.stage == "build")
    });
    match (builds.next(), builds.next()) {
        (Some(build), None) => Ok(build.as_str()),
        (None, _) => bail!("Stage '{}' does not need a build stage", spec.name),
        (Some(_), Some(_)) => bail!("Stage '{}' needs several build stages; set 'from'", spec.name),
    }
}

fn provision_params(buildfile: &Buildfile, name: &str) -> Result<ProvisionParams> {
    let spec = buildfile
        .stage(name)
        .ok_or_else(|| anyhow!("Unknown provision stage '{name}'"))?;
    ProvisionParams::from_params(spec.params.clone().unwrap_or_default())
}

fn exec_form(command: &[String]) -> Result<String> {
    Ok(serde_json::to_string(command)?)
}

fn quote_env(value: &str) -> String {
    if value.is_empty() || value.contains(|c: char| c.is_whitespace() || c == '"' || c == '\\') {
        format!("{value:?}")
    } else {
        value.to_string()
    }
}
