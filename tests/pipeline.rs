#![cfg(unix)]

use std::fs;
use std::path::Path;

use imagesmith::PipelineError;
use imagesmith::buildfile::Buildfile;
use imagesmith::image::{RuntimeImage, is_executable};
use imagesmith::pipeline::{
    PipelineContext, PipelineState, Stage, StageInputs, StageKind, StageOutput, StageRegistry,
    StageStatus, build_pipeline,
};
use imagesmith::security::compute_sha256;
use imagesmith::stages;
use imagesmith::stages::build::BuildArtifact;
use tempfile::tempdir;

const EMIT_APP: &str = "mkdir -p dist && printf '#!/bin/sh\\nexit 3\\n' > dist/app && chmod +x dist/app";

fn build_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    registry
}

fn buildfile(root: &Path, probe: &str, build: &str) -> Buildfile {
    let yaml = format!(
        r#"
version: 1
name: app
stages:
  - name: base
    stage: provision
    params:
      toolchain: "sh:latest"
      probe: ["sh", "-c", "{probe}"]
  - name: builder
    stage: build
    needs: [base]
    params:
      command: ["sh", "-c", "{build}"]
      artifact: dist/app
  - name: runtime
    stage: package
    needs: [base, builder]
output:
  directory: out
"#
    );
    Buildfile::from_yaml(&yaml, root).expect("fixture buildfile should parse")
}

fn write_source(root: &Path) {
    fs::create_dir_all(root.join("src")).unwrap();
    fs::write(root.join("src/main.c"), "int main(void) { return 3; }\n").unwrap();
    fs::write(root.join("README"), "sample project\n").unwrap();
}

fn list_files(dir: &Path) -> Vec<String> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).unwrap() {
        let entry = entry.unwrap();
        let path = entry.path();
        if path.is_dir() {
            for nested in list_files(&path) {
                files.push(format!("{}/{nested}", entry.file_name().to_string_lossy()));
            }
        } else {
            files.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    files.sort();
    files
}

#[test]
fn successful_run_packages_only_the_executable() {
    let temp = tempdir().unwrap();
    write_source(temp.path());
    let buildfile = buildfile(temp.path(), "echo sh 1.0", EMIT_APP);

    let executor = build_pipeline(&build_registry(), &buildfile).unwrap();
    assert_eq!(executor.stage_names(), vec!["base", "builder", "runtime"]);

    let run = executor.execute().expect("pipeline should succeed");
    assert_eq!(run.state, PipelineState::Packaged);
    assert!(run
        .stages
        .iter()
        .all(|record| record.status == StageStatus::Succeeded));

    let image = run.image.expect("image should be produced");
    assert_eq!(image.root, temp.path().join("out/app"));
    assert_eq!(image.config.entrypoint, vec!["./app".to_string()]);
    assert_eq!(image.config.working_dir, "/app");

    let workdir = image.working_dir().unwrap();
    assert_eq!(list_files(&workdir), vec!["app"]);
    // Nothing from the source tree reaches the image.
    assert_eq!(list_files(&image.rootfs()), vec!["app/app"]);

    let entrypoint = workdir.join("app");
    assert!(is_executable(&entrypoint).unwrap());
    let digest = compute_sha256(&entrypoint).unwrap();
    assert_eq!(digest, image.config.artifact.sha256);
    assert_eq!(run.artifacts["builder"].sha256, digest);

    // The per-run scratch directory is gone.
    assert_eq!(list_files(&temp.path().join("out")), vec!["app/image.json", "app/rootfs/app/app"]);

    let loaded = RuntimeImage::load(&image.root).unwrap();
    assert_eq!(loaded.run().unwrap(), 3);

    let snapshot = executor.metrics().snapshot();
    assert_eq!(snapshot.runs_succeeded, 1);
    assert_eq!(snapshot.runs_failed, 0);
    assert!(snapshot.stages.contains_key("builder"));
}

#[test]
fn compile_failure_skips_packaging_and_leaves_no_image() {
    let temp = tempdir().unwrap();
    write_source(temp.path());
    let buildfile = buildfile(temp.path(), "echo sh 1.0", "echo broken >&2; exit 1");

    let executor = build_pipeline(&build_registry(), &buildfile).unwrap();
    let run = executor.run();
    assert!(!run.succeeded());
    assert_eq!(run.state, PipelineState::Failed);

    let statuses: Vec<_> = run.stages.iter().map(|r| (r.name.as_str(), r.status)).collect();
    assert_eq!(
        statuses,
        vec![
            ("base", StageStatus::Succeeded),
            ("builder", StageStatus::Failed),
            ("runtime", StageStatus::Skipped),
        ]
    );

    let failure = run.failure.as_ref().unwrap();
    assert_eq!(failure.stage, "builder");
    assert_eq!(failure.kind, "build");
    assert!(failure.message.contains("broken"), "{}", failure.message);
    assert!(!temp.path().join("out/app").exists());

    let err = run.into_result().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::Build { stage, .. }) if stage == "builder"
    ));
    assert_eq!(executor.metrics().snapshot().runs_failed, 1);
}

#[test]
fn unresolvable_toolchain_halts_before_building() {
    let temp = tempdir().unwrap();
    write_source(temp.path());
    let marker = temp.path().join("build-ran");
    let build = format!("touch {}; {EMIT_APP}", marker.display());
    let buildfile = buildfile(temp.path(), "exit 127", &build);

    let run = build_pipeline(&build_registry(), &buildfile).unwrap().run();
    assert_eq!(run.state, PipelineState::Failed);
    assert_eq!(run.failure.as_ref().unwrap().kind, "provisioning");
    assert_eq!(run.stages[1].status, StageStatus::Skipped);
    assert_eq!(run.stages[2].status, StageStatus::Skipped);
    assert!(!marker.exists(), "build command must not run");
    assert!(run.image.is_none());
}

#[test]
fn missing_artifact_is_a_build_failure() {
    let temp = tempdir().unwrap();
    write_source(temp.path());
    let buildfile = buildfile(temp.path(), "echo sh 1.0", "true");

    let run = build_pipeline(&build_registry(), &buildfile).unwrap().run();
    let failure = run.failure.unwrap();
    assert_eq!(failure.stage, "builder");
    assert!(failure.message.contains("dist/app"), "{}", failure.message);
}

#[test]
fn new_image_supersedes_previous_one_only_on_success() {
    let temp = tempdir().unwrap();
    write_source(temp.path());

    let first = buildfile(temp.path(), "echo sh 1.0", EMIT_APP);
    build_pipeline(&build_registry(), &first)
        .unwrap()
        .execute()
        .unwrap();
    let image_json = temp.path().join("out/app/image.json");
    let original = fs::read_to_string(&image_json).unwrap();

    let failing = buildfile(temp.path(), "echo sh 1.0", "exit 2");
    let run = build_pipeline(&build_registry(), &failing).unwrap().run();
    assert!(!run.succeeded());
    assert_eq!(fs::read_to_string(&image_json).unwrap(), original);

    let rebuilt = buildfile(
        temp.path(),
        "echo sh 1.0",
        "mkdir -p dist && printf '#!/bin/sh\\nexit 0\\n' > dist/app && chmod +x dist/app",
    );
    let run = build_pipeline(&build_registry(), &rebuilt)
        .unwrap()
        .execute()
        .unwrap();
    let image = run.image.unwrap();
    assert_ne!(fs::read_to_string(&image_json).unwrap(), original);
    assert_eq!(image.run().unwrap(), 0);
}

/// Hands the package stage an artifact without compiling anything.
struct HandedArtifact {
    contents: Option<&'static [u8]>,
    sha256: String,
}

impl Stage for HandedArtifact {
    fn kind(&self) -> StageKind {
        StageKind::Build
    }

    fn run(&self, inputs: &StageInputs<'_>, ctx: &PipelineContext) -> anyhow::Result<StageOutput> {
        let dir = ctx.scratch.join("handed");
        let path = dir.join("app");
        if let Some(contents) = self.contents {
            fs::create_dir_all(&dir)?;
            fs::write(&path, contents)?;
        }
        Ok(StageOutput::Artifact(BuildArtifact {
            stage: inputs.stage().to_string(),
            file_name: "app".into(),
            path,
            sha256: self.sha256.clone(),
            size: self.contents.map_or(0, |c| c.len() as u64),
            executable: true,
        }))
    }
}

fn handed_artifact_run(
    root: &Path,
    contents: Option<&'static [u8]>,
    sha256: &str,
) -> imagesmith::PipelineRun {
    let mut registry = build_registry();
    let sha256 = sha256.to_string();
    registry.register("handed", move |_| {
        Ok(Box::new(HandedArtifact {
            contents,
            sha256: sha256.clone(),
        }) as Box<dyn Stage>)
    });

    let buildfile = Buildfile::from_yaml(
        r#"
version: 1
name: app
stages:
  - name: base
    stage: provision
    params:
      toolchain: "sh:latest"
      probe: ["sh", "-c", "echo sh 1.0"]
  - name: builder
    stage: handed
    needs: [base]
  - name: runtime
    stage: package
    needs: [base, builder]
"#,
        root,
    )
    .unwrap();
    build_pipeline(&registry, &buildfile).unwrap().run()
}

#[test]
fn missing_build_artifact_is_an_ordering_violation() {
    let temp = tempdir().unwrap();
    let run = handed_artifact_run(temp.path(), None, &"0".repeat(64));

    assert_eq!(run.state, PipelineState::Failed);
    let failure = run.failure.as_ref().unwrap();
    assert_eq!(failure.stage, "runtime");
    assert_eq!(failure.kind, "ordering");
    assert_eq!(run.stages[2].status, StageStatus::Failed);
    assert!(run.image.is_none());
    assert!(!temp.path().join("out/app").exists());
}

#[test]
fn artifact_digest_mismatch_fails_packaging() {
    let temp = tempdir().unwrap();
    let run = handed_artifact_run(temp.path(), Some(&b"#!/bin/sh\nexit 0\n"[..]), &"0".repeat(64));

    assert_eq!(run.state, PipelineState::Failed);
    let failure = run.failure.as_ref().unwrap();
    assert_eq!(failure.stage, "runtime");
    assert_eq!(failure.kind, "artifact_mismatch");
    assert!(run.image.is_none());
    assert!(!temp.path().join("out/app").exists());

    let err = run.into_result().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::ArtifactMismatch { expected, .. }) if *expected == "0".repeat(64)
    ));
}

#[test]
fn relative_version_command_resolves_against_buildfile_directory() {
    let temp = tempdir().unwrap();
    write_source(temp.path());
    let tools = temp.path().join("tools");
    fs::create_dir_all(&tools).unwrap();
    fs::write(tools.join("version"), "#!/bin/sh\necho tool 2.1.0\n").unwrap();
    imagesmith::image::set_executable(&tools.join("version")).unwrap();

    let buildfile = Buildfile::from_yaml(
        &format!(
            r#"
version: 1
name: app
stages:
  - name: base
    stage: provision
    params:
      toolchain: "tool:2.1"
      probe: ["./tools/version"]
  - name: builder
    stage: build
    needs: [base]
    params:
      command: ["sh", "-c", "{EMIT_APP}"]
      artifact: dist/app
  - name: runtime
    stage: package
    needs: [base, builder]
"#
        ),
        temp.path(),
    )
    .unwrap();

    // The test process runs from the crate directory, not from `temp`.
    let run = build_pipeline(&build_registry(), &buildfile)
        .unwrap()
        .execute()
        .unwrap();
    assert_eq!(run.image.unwrap().config.base.reported_version, "tool 2.1.0");
}
