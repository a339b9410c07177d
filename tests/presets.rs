use imagesmith::buildfile::Buildfile;
use imagesmith::dockerfile::render_dockerfile;
use imagesmith::pipeline::StageRegistry;
use imagesmith::presets::{PRESETS, generate_preset};
use imagesmith::stages;
use imagesmith::validation::validate_buildfile;
use tempfile::tempdir;

#[test]
fn every_preset_generates_a_valid_buildfile() {
    let temp = tempdir().unwrap();
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);

    for preset in PRESETS {
        let path = temp.path().join("nested").join(format!("{preset}.yaml"));
        let generated = generate_preset(preset, "svc", &path).unwrap();
        assert_eq!(generated, path);

        let buildfile = Buildfile::load(&path).unwrap();
        assert_eq!(buildfile.name, "svc");
        let report = validate_buildfile(&buildfile, &registry);
        assert!(report.is_ok(), "{preset}: {:?}", report.errors);
        assert!(report.warnings.is_empty(), "{preset}: {:?}", report.warnings);
    }
}

#[test]
fn go_preset_renders_trimmed_build() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("go.yaml");
    generate_preset("go", "svc", &path).unwrap();

    let dockerfile = render_dockerfile(&Buildfile::load(&path).unwrap()).unwrap();
    assert!(
        dockerfile.contains(r#"RUN ["go","build","-trimpath","-o","svc","."]"#),
        "{dockerfile}"
    );
    assert!(dockerfile.contains("COPY --from=builder /usr/src/app/svc ./svc"), "{dockerfile}");
}

#[test]
fn unknown_preset_lists_available_ones() {
    let temp = tempdir().unwrap();
    let err = generate_preset("bazel", "svc", &temp.path().join("x.yaml")).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("cargo, go, make"), "{message}");
}
