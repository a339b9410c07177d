use std::env;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use imagesmith::buildfile::Buildfile;
use imagesmith::dockerfile::render_dockerfile;
use imagesmith::image::RuntimeImage;
use imagesmith::lockfile::generate_lock;
use imagesmith::observability::{MetricsSnapshot, log_snapshot};
#[cfg(feature = "metrics-server")]
use imagesmith::observability::server::MetricsServer;
use imagesmith::pipeline::{StageRegistry, build_pipeline};
use imagesmith::presets::generate_preset;
use imagesmith::reproduce::{VerifyOptions, run_verification};
use imagesmith::security::{compute_sha256, generate_sbom, write_sha256};
use imagesmith::stages;
use imagesmith::validation::{ValidationReport, validate_buildfile};
use serde::Serialize;
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
#[cfg(feature = "metrics-server")]
use std::net::SocketAddr;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let otlp_endpoint = match &cli.command {
        Commands::Build { otlp_endpoint, .. } => otlp_endpoint.clone(),
        _ => None,
    };
    configure_tracing(otlp_endpoint.as_deref())?;

    let mut exit_code = 0;
    let result = match cli.command {
        Commands::Build {
            buildfile,
            dry_run,
            output_dir,
            report,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            metrics_listen,
            otlp_endpoint: _,
        } => build_command(BuildArgs {
            buildfile,
            dry_run,
            output_dir,
            report,
            metrics: MetricsArgs {
                print: print_metrics,
                json: metrics_json,
                prometheus: metrics_prometheus,
            },
            metrics_listen,
        }),
        Commands::ListStages => {
            list_stages();
            Ok(())
        }
        Commands::Validate { buildfile } => validate_command(&buildfile),
        Commands::Lock { buildfile, output } => lock_command(&buildfile, &output),
        Commands::Buildfile { action } => buildfile_command(action),
        Commands::Verify {
            buildfile,
            runs,
            report,
        } => verify_command(buildfile, runs, report),
        Commands::Inspect { image } => inspect_command(&image),
        Commands::Run { image } => run_image(&image).map(|code| exit_code = code),
        Commands::Dockerfile { buildfile, output } => dockerfile_command(&buildfile, output),
        Commands::Security { action } => security_command(action),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "imagesmith", &mut io::stdout());
            Ok(())
        }
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    result?;
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                    vec![KeyValue::new("service.name", "imagesmith")],
                )))
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .install_simple()?;

            return tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()));
        }
    }

    #[cfg(not(feature = "otel"))]
    if let Some(endpoint) = otlp_endpoint {
        eprintln!(
            "warning: --otlp-endpoint '{endpoint}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel."
        );
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))
}

struct BuildArgs {
    buildfile: PathBuf,
    dry_run: bool,
    output_dir: Option<PathBuf>,
    report: Option<PathBuf>,
    metrics: MetricsArgs,
    metrics_listen: Option<String>,
}

struct MetricsArgs {
    print: bool,
    json: Option<PathBuf>,
    prometheus: Option<PathBuf>,
}

fn build_command(args: BuildArgs) -> Result<()> {
    let mut buildfile = Buildfile::load(&args.buildfile)?;
    if let Some(dir) = args.output_dir {
        // Flags are relative to where the command runs, not to the buildfile.
        buildfile.output.directory = if dir.is_absolute() {
            dir
        } else {
            env::current_dir()
                .context("Failed to determine current directory")?
                .join(dir)
        };
    }
    let registry = build_registry();

    let report = validate_buildfile(&buildfile, &registry);
    log_report(&args.buildfile, &report);
    if !report.is_ok() {
        bail!(
            "Buildfile validation failed with {} error(s)",
            report.errors.len()
        );
    }

    let executor = build_pipeline(&registry, &buildfile)?;
    if args.dry_run {
        info!(
            pipeline = %buildfile.name,
            output = %buildfile.output_directory().display(),
            "Planned stages: {}",
            executor.stage_names().join(" -> ")
        );
        return Ok(());
    }

    let metrics_handle = executor.metrics();

    #[cfg(feature = "metrics-server")]
    let metrics_server = match &args.metrics_listen {
        Some(addr_str) => {
            let addr: SocketAddr = addr_str
                .parse()
                .with_context(|| format!("Invalid metrics listen address: {addr_str}"))?;
            Some(MetricsServer::start(addr, metrics_handle.clone())?)
        }
        None => None,
    };

    #[cfg(not(feature = "metrics-server"))]
    if let Some(addr_str) = &args.metrics_listen {
        warn!("Metrics server feature not enabled; ignoring --metrics-listen={addr_str}.");
    }

    let run = executor.run();

    // The report is written for failed runs too.
    if let Some(path) = &args.report {
        write_json(path, &run)?;
        info!(report = %path.display(), "Build report written");
    }
    export_metrics(&args.metrics, &metrics_handle.snapshot())?;

    #[cfg(feature = "metrics-server")]
    if let Some(mut server) = metrics_server {
        server.stop();
    }

    let run = run.into_result()?;
    if let Some(image) = &run.image {
        info!(
            image = %image.root.display(),
            entrypoint = ?image.config.entrypoint,
            digest = %image.config.artifact.sha256,
            "Image ready"
        );
        println!("{}", image.root.display());
    }
    Ok(())
}

fn export_metrics(args: &MetricsArgs, snapshot: &MetricsSnapshot) -> Result<()> {
    if args.print {
        log_snapshot(snapshot);
    }
    if let Some(path) = &args.json {
        write_json(path, snapshot)?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = &args.prometheus {
        ensure_parent(path)?;
        fs::write(path, snapshot.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

fn list_stages() {
    let registry = build_registry();
    println!("Available stages:");
    for name in registry.known_stages() {
        println!("- {name}");
    }
}

fn log_report(path: &Path, report: &ValidationReport) {
    for warning in &report.warnings {
        warn!(file = %path.display(), "{warning}");
    }
    for error_msg in &report.errors {
        error!(file = %path.display(), "{error_msg}");
    }
}

fn validate_command(path: &Path) -> Result<()> {
    let buildfile = Buildfile::load(path)?;
    let report = validate_buildfile(&buildfile, &build_registry());
    log_report(path, &report);
    if report.is_ok() {
        info!(file = %path.display(), "Buildfile validation passed");
        Ok(())
    } else {
        Err(anyhow!(
            "Buildfile validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn lock_command(path: &Path, output: &Path) -> Result<()> {
    let buildfile = Buildfile::load(path)?;
    let report = validate_buildfile(&buildfile, &build_registry());
    log_report(path, &report);
    if !report.is_ok() {
        bail!(
            "Cannot generate lockfile due to {} validation error(s)",
            report.errors.len()
        );
    }

    ensure_parent(output)?;
    generate_lock(&buildfile, output)?;
    info!(lockfile = %output.display(), "Lockfile generated successfully");
    Ok(())
}

fn buildfile_command(command: BuildfileCommands) -> Result<()> {
    match command {
        BuildfileCommands::New {
            preset,
            name,
            output,
        } => {
            let destination = output.unwrap_or_else(|| PathBuf::from("imagesmith.yaml"));
            let generated = generate_preset(&preset, &name, &destination)?;
            info!(
                preset = %preset,
                path = %generated.display(),
                "Preset buildfile generated"
            );
            Ok(())
        }
        BuildfileCommands::Lint { buildfiles } => lint_buildfiles(&buildfiles),
        BuildfileCommands::Diff { lhs, rhs } => diff_buildfiles(&lhs, &rhs),
    }
}

fn lint_buildfiles(paths: &[PathBuf]) -> Result<()> {
    let registry = build_registry();
    let mut failures = 0usize;
    for path in paths {
        match Buildfile::load(path) {
            Ok(buildfile) => {
                let report = validate_buildfile(&buildfile, &registry);
                log_report(path, &report);
                if report.is_ok() {
                    info!(file = %path.display(), "Lint passed");
                } else {
                    failures += 1;
                }
            }
            Err(err) => {
                failures += 1;
                error!(file = %path.display(), "Failed to load buildfile: {err:#}");
            }
        }
    }

    if failures > 0 {
        bail!("Lint failed for {failures} buildfile(s)");
    }
    info!("All buildfile lint checks passed");
    Ok(())
}

fn diff_buildfiles(lhs: &Path, rhs: &Path) -> Result<()> {
    let left = Buildfile::load(lhs)?;
    let right = Buildfile::load(rhs)?;
    let differences = buildfile_differences(&left, &right);

    if differences.is_empty() {
        println!("Buildfiles match: {} == {}", lhs.display(), rhs.display());
        return Ok(());
    }

    println!(
        "Buildfile differences between '{}' and '{}':",
        lhs.display(),
        rhs.display()
    );
    for diff in &differences {
        println!("- {diff}");
    }
    bail!("Buildfiles differ ({} difference(s) found)", differences.len());
}

fn buildfile_differences(left: &Buildfile, right: &Buildfile) -> Vec<String> {
    let mut differences = Vec::new();
    if left.version != right.version {
        differences.push(format!("Version mismatch: {} vs {}", left.version, right.version));
    }
    if left.name != right.name {
        differences.push(format!("Name differs: '{}' vs '{}'", left.name, right.name));
    }
    if left.output.directory != right.output.directory {
        differences.push(format!(
            "Output directory differs: '{}' vs '{}'",
            left.output.directory.display(),
            right.output.directory.display()
        ));
    }

    for l_stage in &left.stages {
        let Some(r_stage) = right.stage(&l_stage.name) else {
            differences.push(format!("Stage '{}' only in left buildfile", l_stage.name));
            continue;
        };
        if l_stage.stage != r_stage.stage {
            differences.push(format!(
                "Stage '{}' kind differs: '{}' vs '{}'",
                l_stage.name, l_stage.stage, r_stage.stage
            ));
        }
        if l_stage.needs != r_stage.needs {
            differences.push(format!(
                "Stage '{}' needs differ: {:?} vs {:?}",
                l_stage.name, l_stage.needs, r_stage.needs
            ));
        }
        let l_params = l_stage.params.clone().unwrap_or_default();
        let r_params = r_stage.params.clone().unwrap_or_default();
        if l_params != r_params {
            differences.push(format!(
                "Stage '{}' parameters differ: {} vs {}",
                l_stage.name,
                serde_json::to_string(&l_params).unwrap_or_else(|_| "<invalid>".into()),
                serde_json::to_string(&r_params).unwrap_or_else(|_| "<invalid>".into())
            ));
        }
    }
    for r_stage in &right.stages {
        if left.stage(&r_stage.name).is_none() {
            differences.push(format!("Stage '{}' only in right buildfile", r_stage.name));
        }
    }
    differences
}

fn verify_command(buildfile: PathBuf, runs: usize, report: Option<PathBuf>) -> Result<()> {
    let options = VerifyOptions {
        buildfile_path: buildfile,
        runs,
    };
    let result = run_verification(&options, &build_registry())?;

    for run in &result.runs {
        for (stage, artifact) in &run.artifacts {
            println!(
                "run {}: {stage} {}  {}",
                run.index + 1,
                artifact.sha256,
                artifact.file
            );
        }
    }
    if let Some(path) = &report {
        write_json(path, &result)?;
        info!(report = %path.display(), "Verification report written");
    }

    if result.summary.reproducible {
        println!("Reproducible across {} runs", result.summary.total_runs);
        Ok(())
    } else {
        bail!(
            "Build output is not reproducible for stage(s): {}",
            result.summary.divergent_stages.join(", ")
        )
    }
}

fn inspect_command(path: &Path) -> Result<()> {
    let image = RuntimeImage::load(path)?;
    to_writer_pretty(io::stdout(), &image.config).context("Failed to print image config")?;
    println!();
    image.verify()?;
    info!(image = %path.display(), "Image layout verified");
    Ok(())
}

fn run_image(path: &Path) -> Result<i32> {
    let image = RuntimeImage::load(path)?;
    let code = image.run()?;
    if code != 0 {
        warn!(image = %path.display(), code, "Entrypoint exited with non-zero status");
    }
    Ok(code)
}

fn dockerfile_command(path: &Path, output: Option<PathBuf>) -> Result<()> {
    let buildfile = Buildfile::load(path)?;
    let rendered = render_dockerfile(&buildfile)?;
    match output {
        Some(output) => {
            ensure_parent(&output)?;
            fs::write(&output, rendered)
                .with_context(|| format!("Failed to write Dockerfile: {}", output.display()))?;
            info!(dockerfile = %output.display(), "Dockerfile written");
        }
        None => print!("{rendered}"),
    }
    Ok(())
}

fn security_command(command: SecurityCommands) -> Result<()> {
    match command {
        SecurityCommands::Sbom {
            manifest_path,
            output,
        } => {
            ensure_parent(&output)?;
            generate_sbom(&manifest_path, &output)?;
            info!(sbom = %output.display(), "SBOM generated");
            Ok(())
        }
        SecurityCommands::Digest { path, output } => {
            if let Some(out_path) = output {
                let digest = write_sha256(&path, &out_path)?;
                println!("{}  {}", digest, path.display());
                info!(
                    file = %path.display(),
                    digest_output = %out_path.display(),
                    "SHA256 digest written"
                );
            } else {
                let digest = compute_sha256(&path)?;
                println!("{}  {}", digest, path.display());
            }
            Ok(())
        }
    }
}

fn build_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    registry
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    let file = File::create(path)
        .with_context(|| format!("Failed to create file: {}", path.display()))?;
    to_writer_pretty(file, value)
        .with_context(|| format!("Failed to write JSON: {}", path.display()))
}

#[derive(Parser)]
#[command(
    name = "imagesmith",
    version,
    about = "Build and package minimal runtime images from a staged buildfile"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline and write the runtime image.
    Build {
        buildfile: PathBuf,
        #[arg(long)]
        dry_run: bool,
        #[arg(long = "output-dir")]
        output_dir: Option<PathBuf>,
        #[arg(long)]
        report: Option<PathBuf>,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        #[arg(long = "metrics-listen")]
        metrics_listen: Option<String>,
        #[arg(long = "otlp-endpoint")]
        otlp_endpoint: Option<String>,
    },
    ListStages,
    Validate {
        buildfile: PathBuf,
    },
    Lock {
        buildfile: PathBuf,
        output: PathBuf,
    },
    Buildfile {
        #[command(subcommand)]
        action: BuildfileCommands,
    },
    /// Build several times and compare artifact digests.
    Verify {
        buildfile: PathBuf,
        #[arg(long, default_value_t = 2)]
        runs: usize,
        #[arg(long)]
        report: Option<PathBuf>,
    },
    Inspect {
        image: PathBuf,
    },
    /// Execute an image's entrypoint from its working directory.
    Run {
        image: PathBuf,
    },
    Dockerfile {
        buildfile: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Security {
        #[command(subcommand)]
        action: SecurityCommands,
    },
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum BuildfileCommands {
    New {
        #[arg(long)]
        preset: String,
        #[arg(long, default_value = "app")]
        name: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Lint {
        #[arg(required = true)]
        buildfiles: Vec<PathBuf>,
    },
    Diff {
        lhs: PathBuf,
        rhs: PathBuf,
    },
}

#[derive(Subcommand)]
enum SecurityCommands {
    Sbom {
        #[arg(long = "manifest-path", default_value = "Cargo.toml")]
        manifest_path: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    Digest {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}
