use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use dsu_content::{
    describe_gsi, describe_remote_gsi, load_request_manifest, local_image_size,
    open_byte_source, stream_package_images, Visit,
};
use dsu_core::{
    load_config, ByteSource, CancellationToken, DeviceInfo, DiagnosticReport, DsuConfig, GsiInfo,
    InstallOutcome, InstallationRequest, PartitionSource, ProgressSample, SourceKind,
};
use dsu_diagnostics::{CommandLog, FileLog, LogSource, ReportContext};
use dsu_host_linux::{collect_device_info, device_info_from_props, parse_getprop, ImageDirService};
use dsu_imaging::{inspect_image, InspectProgress, ProgressObserver};
use dsu_installer::{InstallObserver, InstallationStep, PartitionPlan};
use dsu_report::{create_report_bundle, render_text};
use dsu_safety::{require_confirmation_token, SafetyContext};
use dsu_workflow_engine::{
    diagnose_log, discard_existing_installation, run_installation_attempt, write_attempt_bundle,
    AttemptParams,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dsu", about = "Dynamic system installer and log diagnostics")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Install a GSI into a directory-backed dynamic system slot.
    Install(InstallArgs),
    /// Classify a device log and print the report.
    Diagnose(DiagnoseArgs),
    /// Report format, sizes and digest of an image file.
    Inspect {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value = "8M", value_parser = parse_size)]
        chunk_size: u64,
    },
    /// Show which partitions a request would install.
    Plan {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Print the connected device's properties.
    DeviceInfo {
        #[arg(long)]
        props: Option<PathBuf>,
        #[arg(long)]
        pretty: bool,
    },
    /// Print a confirmation token for --discard-existing.
    ConfirmToken,
}

#[derive(Args)]
struct SourceArgs {
    /// Single system image.
    #[arg(long, conflicts_with_all = ["partitions", "package", "url", "manifest"])]
    image: Option<PathBuf>,
    /// Partition image as NAME=PATH; repeatable.
    #[arg(long = "partition", value_name = "NAME=PATH")]
    partitions: Vec<String>,
    /// Local package archive.
    #[arg(long, conflicts_with_all = ["partitions", "url", "manifest"])]
    package: Option<PathBuf>,
    /// Remote package archive.
    #[arg(long, conflicts_with_all = ["partitions", "manifest"])]
    url: Option<String>,
    /// JSON or YAML request manifest.
    #[arg(long, conflicts_with = "partitions")]
    manifest: Option<PathBuf>,
    /// Userdata size, such as 8G or 2048M.
    #[arg(long, default_value = "8G", value_parser = parse_size)]
    userdata: u64,
}

#[derive(Args)]
struct LogArgs {
    /// Captured log file to classify.
    #[arg(long, conflicts_with = "logcat")]
    log: Option<PathBuf>,
    /// Follow `logcat -v threadtime`.
    #[arg(long)]
    logcat: bool,
}

#[derive(Args)]
struct InstallArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[command(flatten)]
    logs: LogArgs,
    /// Directory standing in for the privileged installation service.
    #[arg(long)]
    service_root: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = ".")]
    report_base: PathBuf,
    /// getprop output to use instead of querying the device.
    #[arg(long)]
    device_props: Option<PathBuf>,
    /// Remove an installed dynamic system first.
    #[arg(long)]
    discard_existing: bool,
    #[arg(long)]
    force: bool,
    #[arg(long)]
    confirmation_token: Option<String>,
}

#[derive(Args)]
struct DiagnoseArgs {
    #[command(flatten)]
    logs: LogArgs,
    /// GSI the log belongs to, for the architecture check.
    #[arg(long)]
    gsi: Option<PathBuf>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    device_props: Option<PathBuf>,
    /// Also write a report bundle under this directory.
    #[arg(long)]
    report_base: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Install(args) => run_install(args),
        Command::Diagnose(args) => run_diagnose(args),
        Command::Inspect { path, chunk_size } => {
            let chunk_size = usize::try_from(chunk_size).context("chunk size too large")?;
            let mut progress = InspectPrinter::default();
            let inspection = inspect_image(&path, chunk_size, Some(&mut progress))?;
            eprintln!();
            println!("{}", serde_json::to_string_pretty(&inspection)?);
            Ok(())
        }
        Command::Plan { source } => run_plan(&source),
        Command::DeviceInfo { props, pretty } => {
            let info = device_info(props.as_deref())?;
            if pretty {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("{}", serde_json::to_string(&info)?);
            }
            Ok(())
        }
        Command::ConfirmToken => {
            println!("{}", require_confirmation_token());
            Ok(())
        }
    }
}

fn run_install(args: InstallArgs) -> Result<()> {
    let config = load_dsu_config(args.config.as_deref())?;
    let service = ImageDirService::new(&args.service_root);

    if args.discard_existing {
        let ctx = SafetyContext {
            force_mode: args.force,
            confirmation_token: args.confirmation_token.clone(),
        };
        if discard_existing_installation(&service, &ctx)? {
            eprintln!("discarded existing dynamic system");
        }
    }

    let request = build_request(&args.source)?;
    let gsi_info = gsi_info_for(&args.source);
    let device_info = match args.device_props.as_deref() {
        Some(path) => device_info(Some(path))?,
        None => device_info(None).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "device properties unavailable");
            DeviceInfo::default()
        }),
    };
    let mut log_source = open_log_source(&args.logs);

    let mut observer = ConsoleObserver::default();
    let mut report = None;
    let mut sink = |value: DiagnosticReport| report = Some(value);
    let result = run_installation_attempt(
        &service,
        AttemptParams {
            request,
            installer: config.installer,
            diagnostics: config.diagnostics,
            device_info,
            gsi_info,
        },
        log_source.as_mut().map(|s| s.as_mut() as &mut dyn LogSource),
        &CancellationToken::new(),
        &mut observer,
        &mut sink,
    );

    let report = report.ok_or_else(|| anyhow!("installation produced no report"))?;
    let paths = write_attempt_bundle(&args.report_base, &report, &result)?;
    println!("outcome: {}", result.terminal_step);
    println!("report_root: {}", paths.root.display());
    println!("report: {}", paths.report_txt.display());
    println!("logs: {}", paths.logs_path.display());

    match result.outcome {
        InstallOutcome::Failed => Err(anyhow!(
            "installation failed: {}",
            result.failure.unwrap_or_else(|| result.terminal_step.to_string())
        )),
        _ => Ok(()),
    }
}

fn run_diagnose(args: DiagnoseArgs) -> Result<()> {
    let config = load_dsu_config(args.config.as_deref())?;
    let mut source =
        open_log_source(&args.logs).ok_or_else(|| anyhow!("--log or --logcat is required"))?;
    let gsi_info = match &args.gsi {
        Some(path) => Some(describe_gsi(path)?),
        None => None,
    };
    let device_info = match args.device_props.as_deref() {
        Some(path) => device_info(Some(path))?,
        None => device_info(None).unwrap_or_default(),
    };

    let result = diagnose_log(
        source.as_mut(),
        config.diagnostics,
        ReportContext {
            device_info,
            gsi_info,
            installation_info: None,
        },
        &CancellationToken::new(),
    )?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result.report)?);
    } else {
        print!("{}", render_text(&result.report));
    }
    if let Some(base) = &args.report_base {
        let paths = create_report_bundle(base, &result.report, None)?;
        eprintln!("report_root: {}", paths.root.display());
    }
    eprintln!("diagnosis: {}", result.state);
    Ok(())
}

fn run_plan(source: &SourceArgs) -> Result<()> {
    let request = build_request(source)?;
    let mut plan = PartitionPlan::new();
    match request.source_kind {
        SourceKind::SingleImage | SourceKind::MultiImage => {
            for entry in &request.entries {
                plan.admit(&entry.name)?;
            }
        }
        SourceKind::Package | SourceKind::RemotePackage => {
            for entry in request.entries {
                let mut reader = open_byte_source(entry.byte_source)?;
                stream_package_images::<_, anyhow::Error, _>(&mut reader, |image| {
                    plan.admit(&image.partition)?;
                    Ok(Visit::Continue)
                })?;
            }
        }
    }
    let summary = serde_json::json!({
        "source_kind": request.source_kind,
        "userdata_size_bytes": request.userdata_size_bytes,
        "install_order": plan.admitted(),
        "skipped": plan.skipped(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn load_dsu_config(path: Option<&Path>) -> Result<DsuConfig> {
    match path {
        Some(path) => load_config(path),
        None => Ok(DsuConfig::default()),
    }
}

fn device_info(props_file: Option<&Path>) -> Result<DeviceInfo> {
    match props_file {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("read {}", path.display()))?;
            Ok(device_info_from_props(&parse_getprop(&text), None))
        }
        None => collect_device_info(),
    }
}

fn open_log_source(args: &LogArgs) -> Option<Box<dyn LogSource>> {
    if let Some(path) = &args.log {
        return Some(Box::new(FileLog::new(path)));
    }
    if args.logcat {
        return Some(Box::new(CommandLog::logcat()));
    }
    None
}

fn build_request(args: &SourceArgs) -> Result<InstallationRequest> {
    if let Some(path) = &args.manifest {
        let manifest = load_request_manifest(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        return manifest.into_request(base);
    }
    if let Some(path) = &args.image {
        let size = local_image_size(path)?;
        return Ok(InstallationRequest::single_image(
            size,
            ByteSource::File(path.clone()),
            args.userdata,
        ));
    }
    if let Some(path) = &args.package {
        return Ok(InstallationRequest::package(
            path.display().to_string(),
            ByteSource::File(path.clone()),
            args.userdata,
        ));
    }
    if let Some(url) = &args.url {
        return Ok(InstallationRequest::remote_package(url.clone(), args.userdata));
    }
    if !args.partitions.is_empty() {
        let entries = args
            .partitions
            .iter()
            .map(|spec| {
                let (name, path) = parse_partition_spec(spec)?;
                let size = local_image_size(&path)?;
                Ok(PartitionSource::new(name, size, ByteSource::File(path)))
            })
            .collect::<Result<Vec<_>>>()?;
        return Ok(InstallationRequest::multi_image(entries, args.userdata));
    }
    Err(anyhow!(
        "one of --image, --partition, --package, --url or --manifest is required"
    ))
}

fn gsi_info_for(args: &SourceArgs) -> Option<GsiInfo> {
    if let Some(url) = &args.url {
        return Some(describe_remote_gsi(url));
    }
    let path = args.image.clone().or_else(|| args.package.clone()).or_else(|| {
        args.partitions
            .first()
            .and_then(|spec| parse_partition_spec(spec).ok())
            .map(|(_, path)| path)
    })?;
    describe_gsi(path).ok()
}

fn parse_partition_spec(spec: &str) -> Result<(String, PathBuf)> {
    let (name, path) = spec
        .split_once('=')
        .ok_or_else(|| anyhow!("expected NAME=PATH, got {spec}"))?;
    let name = name.trim();
    if name.is_empty() || path.is_empty() {
        return Err(anyhow!("expected NAME=PATH, got {spec}"));
    }
    Ok((name.to_string(), PathBuf::from(path)))
}

/// Byte count with an optional binary suffix: `512`, `64K`, `2048M`, `8G`, `8GiB`.
fn parse_size(value: &str) -> Result<u64, String> {
    let value = value.trim();
    let split = value
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(split);
    let number: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size: {value}"))?;
    let shift = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 0,
        "K" | "KB" | "KIB" => 10,
        "M" | "MB" | "MIB" => 20,
        "G" | "GB" | "GIB" => 30,
        "T" | "TB" | "TIB" => 40,
        _ => return Err(format!("unknown size suffix in {value}")),
    };
    number
        .checked_mul(1u64 << shift)
        .ok_or_else(|| format!("size too large: {value}"))
}

/// Prints whole-percent progress changes and every step to stderr.
#[derive(Default)]
struct ConsoleObserver {
    last: Option<(String, u32)>,
}

impl InstallObserver for ConsoleObserver {
    fn on_progress(&mut self, sample: &ProgressSample) {
        let percent = (sample.fraction() * 100.0).floor() as u32;
        let current = (sample.partition.clone(), percent);
        if self.last.as_ref() != Some(&current) {
            eprint!("\r{}: {percent:>3}%", sample.partition);
            if percent == 100 {
                eprintln!();
            }
            self.last = Some(current);
        }
    }

    fn on_step(&mut self, step: &InstallationStep) {
        tracing::info!(step = %step, "installation step");
    }

    fn on_partition_created(&mut self, name: &str, size_bytes: u64) {
        tracing::info!(partition = name, size_bytes, "partition created");
    }

    fn on_error(&mut self, step: &InstallationStep, message: &str) {
        eprintln!("error at {step}: {message}");
    }
}

#[derive(Default)]
struct InspectPrinter {
    last_percent: Option<u64>,
}

impl ProgressObserver for InspectPrinter {
    fn on_progress(&mut self, progress: InspectProgress) -> bool {
        if progress.total_bytes > 0 {
            let percent = progress.bytes_expanded.saturating_mul(100) / progress.total_bytes;
            if self.last_percent != Some(percent) {
                eprint!("\rinspect: {percent:>3}%");
                self.last_percent = Some(percent);
            }
        }
        true
    }
}
