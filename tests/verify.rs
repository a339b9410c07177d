#![cfg(unix)]

use std::fs;
use std::path::Path;

use imagesmith::pipeline::StageRegistry;
use imagesmith::reproduce::{VerifyOptions, run_verification};
use imagesmith::stages;
use tempfile::tempdir;

fn build_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    registry
}

fn write_buildfile(dir: &Path, build: &str) -> std::path::PathBuf {
    let path = dir.join("imagesmith.yaml");
    let yaml = format!(
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
    stage: build
    needs: [base]
    params:
      command: ["sh", "-c", "{build}"]
      artifact: app
  - name: runtime
    stage: package
    needs: [base, builder]
"#
    );
    fs::write(&path, yaml).unwrap();
    path
}

#[test]
fn deterministic_build_is_reproducible() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("input.txt"), "fixed").unwrap();
    let buildfile = write_buildfile(temp.path(), "cat input.txt > app && chmod +x app");

    let report = run_verification(
        &VerifyOptions {
            buildfile_path: buildfile,
            runs: 3,
        },
        &build_registry(),
    )
    .unwrap();

    assert_eq!(report.summary.total_runs, 3);
    assert!(report.summary.reproducible);
    assert!(report.summary.divergent_stages.is_empty());
    // Verification runs never touch the real output directory.
    assert!(!temp.path().join("out").exists());
}

#[test]
fn nondeterministic_build_is_flagged() {
    let temp = tempdir().unwrap();
    let buildfile = write_buildfile(
        temp.path(),
        "date +%s%N > app && echo $$ >> app && chmod +x app",
    );

    let report = run_verification(
        &VerifyOptions {
            buildfile_path: buildfile,
            runs: 2,
        },
        &build_registry(),
    )
    .unwrap();

    assert!(!report.summary.reproducible);
    assert_eq!(report.summary.divergent_stages, vec!["builder"]);
}

#[test]
fn a_single_run_is_rejected() {
    let temp = tempdir().unwrap();
    let buildfile = write_buildfile(temp.path(), "true");
    let err = run_verification(
        &VerifyOptions {
            buildfile_path: buildfile,
            runs: 1,
        },
        &build_registry(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("at least 2 runs"));
}

#[test]
fn invalid_buildfile_is_rejected_before_any_run() {
    let temp = tempdir().unwrap();
    let marker = temp.path().join("build-ran");
    let path = temp.path().join("imagesmith.yaml");
    fs::write(
        &path,
        format!(
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
    stage: build
    needs: [base]
    params:
      command: ["sh", "-c", "touch {marker}"]
      artifact: app
  - name: runtime
    stage: package
    needs: [builder]
"#,
            marker = marker.display()
        ),
    )
    .unwrap();

    let err = run_verification(
        &VerifyOptions {
            buildfile_path: path,
            runs: 2,
        },
        &build_registry(),
    )
    .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("validation failed"), "{message}");
    assert!(message.contains("exactly one provision stage"), "{message}");
    assert!(!marker.exists(), "no run should start");
}
