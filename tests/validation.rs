use std::path::Path;

use imagesmith::buildfile::Buildfile;
use imagesmith::lockfile::generate_lock;
use imagesmith::pipeline::StageRegistry;
use imagesmith::stages;
use imagesmith::validation::validate_buildfile;
use tempfile::tempdir;

fn build_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    registry
}

fn parse(yaml: &str) -> Buildfile {
    Buildfile::from_yaml(yaml, ".").expect("buildfile should parse")
}

#[test]
fn sample_buildfile_is_valid() {
    let buildfile = Buildfile::load(Path::new("buildfiles/robot_tech_test.yaml"))
        .expect("sample buildfile should load");
    let report = validate_buildfile(&buildfile, &build_registry());
    assert!(
        report.is_ok(),
        "sample buildfile should pass validation: {:?}",
        report.errors
    );
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
}

#[test]
fn unknown_stage_kind_is_reported() {
    let buildfile = parse(
        r#"
version: 1
name: app
stages:
  - name: base
    stage: teleport
"#,
    );
    let report = validate_buildfile(&buildfile, &build_registry());
    assert!(!report.is_ok());
    assert!(report.errors.iter().any(|e| e.contains("teleport")), "{:?}", report.errors);
}

#[test]
fn cycles_and_missing_needs_are_errors() {
    let buildfile = parse(
        r#"
version: 1
name: app
stages:
  - name: base
    stage: provision
    params: { toolchain: "rust:1.75" }
  - name: builder
    stage: build
    needs: [base, runtime]
  - name: runtime
    stage: package
    needs: [base, builder]
"#,
    );
    let report = validate_buildfile(&buildfile, &build_registry());
    assert!(
        report.errors.iter().any(|e| e.contains("cycle")),
        "{:?}",
        report.errors
    );
    assert!(
        report
            .errors
            .iter()
            .any(|e| e.contains("cannot depend on a package stage")),
        "{:?}",
        report.errors
    );
}

#[test]
fn package_with_two_builds_requires_from() {
    let yaml = r#"
version: 1
name: app
stages:
  - name: base
    stage: provision
    params: { toolchain: "rust:1.75" }
  - name: app
    stage: build
    needs: [base]
  - name: tools
    stage: build
    needs: [base]
  - name: runtime
    stage: package
    needs: [base, app, tools]
"#;
    let report = validate_buildfile(&parse(yaml), &build_registry());
    assert!(
        report.errors.iter().any(|e| e.contains("set 'from'")),
        "{:?}",
        report.errors
    );

    let with_from = yaml.replace(
        "needs: [base, app, tools]",
        "needs: [base, app, tools]\n    params: { from: app }",
    );
    let report = validate_buildfile(&parse(&with_from), &build_registry());
    assert!(report.is_ok(), "{:?}", report.errors);
}

#[test]
fn runtime_on_different_base_warns() {
    let buildfile = parse(
        r#"
version: 1
name: app
stages:
  - name: toolchain
    stage: provision
    params: { toolchain: "rust:1.75" }
  - name: slim
    stage: provision
    params: { toolchain: "rust:1.75", image: "debian:bookworm-slim" }
  - name: builder
    stage: build
    needs: [toolchain]
  - name: runtime
    stage: package
    needs: [slim, builder]
"#,
    );
    let report = validate_buildfile(&buildfile, &build_registry());
    assert!(report.is_ok(), "{:?}", report.errors);
    assert!(
        report.warnings.iter().any(|w| w.contains("different base")),
        "{:?}",
        report.warnings
    );
}

#[test]
fn unexpected_parameters_are_rejected() {
    let buildfile = parse(
        r#"
version: 1
name: app
stages:
  - name: base
    stage: provision
    params: { toolchain: "rust:1.75", cache: true }
  - name: builder
    stage: build
    needs: [base]
  - name: runtime
    stage: package
    needs: [base, builder]
"#,
    );
    let report = validate_buildfile(&buildfile, &build_registry());
    assert!(
        report.errors.iter().any(|e| e.contains("cache")),
        "{:?}",
        report.errors
    );
}

#[test]
fn lockfile_lists_stages_in_execution_order() {
    let temp = tempdir().unwrap();
    let buildfile = parse(
        r#"
version: 1
name: app
stages:
  - name: runtime
    stage: package
    needs: [base, builder]
  - name: builder
    stage: build
    needs: [base]
  - name: base
    stage: provision
    params: { toolchain: "rust:1.75" }
"#,
    );
    let path = temp.path().join("imagesmith.lock");
    let lock = generate_lock(&buildfile, &path).unwrap();

    let order: Vec<_> = lock.stages.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(order, vec!["base", "builder", "runtime"]);
    assert!(lock.stages.iter().all(|s| s.params_hash.len() == 64));

    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains("rust:1.75"), "{written}");
}
