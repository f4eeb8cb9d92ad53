use anyhow::{anyhow, Result};
use dsu_core::{
    now_utc_rfc3339, AnalysisSeverity, CancellationToken, DeviceInfo, DiagnosticReport,
    DiagnosticsConfig, ErrorAnalysis, ErrorType, GsiInfo, InstallOutcome, InstallationInfo,
    InstallationRequest, InstallerConfig,
};
use dsu_diagnostics::{DiagnosticEngine, EngineState, LogSource, ReportContext, StreamEnd};
use dsu_installer::{
    panic_message, ImageSourceResolver, InstallError, InstallObserver, InstallationStep,
    InstallationSummary, PartitionInstaller, PrivilegedService,
};
use dsu_report::{create_report_bundle, ReportPaths};
use dsu_safety::{can_discard_installation, SafetyContext, SafetyDecision};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::thread;

/// Receives the final report of an attempt, exactly once.
pub trait ReportSink {
    fn on_report(&mut self, report: DiagnosticReport);
}

impl<F: FnMut(DiagnosticReport)> ReportSink for F {
    fn on_report(&mut self, report: DiagnosticReport) {
        self(report)
    }
}

#[derive(Debug)]
pub struct AttemptParams {
    pub request: InstallationRequest,
    pub installer: InstallerConfig,
    pub diagnostics: DiagnosticsConfig,
    pub device_info: DeviceInfo,
    pub gsi_info: Option<GsiInfo>,
}

#[derive(Debug, Clone)]
pub struct AttemptResult {
    pub outcome: InstallOutcome,
    pub terminal_step: InstallationStep,
    pub failure: Option<String>,
    pub diagnostics_state: EngineState,
    pub installation: InstallationInfo,
    pub skipped: Vec<String>,
    pub logs: Vec<String>,
}

/// Runs one installation attempt with log diagnostics alongside.
///
/// The resolver runs on the calling thread; the log source is consumed on a
/// scoped worker. A failure classified from the log cancels `cancel`, which
/// the installer observes at its next chunk boundary.
pub fn run_installation_attempt<S: PrivilegedService>(
    service: S,
    params: AttemptParams,
    log_source: Option<&mut dyn LogSource>,
    cancel: &CancellationToken,
    observer: &mut dyn InstallObserver,
    report_sink: &mut dyn ReportSink,
) -> AttemptResult {
    let AttemptParams {
        request,
        installer,
        diagnostics,
        device_info,
        gsi_info,
    } = params;
    let started_at_utc = now_utc_rfc3339();
    let source_kind = request.source_kind;
    let userdata_size_bytes = request.userdata_size_bytes;

    let mut logs = Vec::new();
    logs.push("workflow=dsu-install".to_string());
    logs.push(format!("started_at={started_at_utc}"));
    logs.push(format!("source_kind={}", source_kind.as_str()));
    logs.push(format!("entries={}", request.entries.len()));
    logs.push(format!("userdata_size_bytes={userdata_size_bytes}"));
    logs.push(format!("declared_image_bytes={}", request.declared_image_bytes()));
    logs.push(format!("slot={}", installer.slot));
    logs.push(format!(
        "log_source={}",
        log_source.as_ref().map(|source| source.name()).unwrap_or("none")
    ));

    observer.on_step(&InstallationStep::Processing);

    let resolver = ImageSourceResolver::new(PartitionInstaller::new(service, installer));
    let mut engine = DiagnosticEngine::new(diagnostics);
    let diagnostics_stop = CancellationToken::new();

    let (summary, stream_end) = thread::scope(|scope| {
        let worker = log_source.map(|source| {
            let engine = &mut engine;
            let stop = &diagnostics_stop;
            let preempt = cancel.clone();
            scope.spawn(move || {
                let end = engine.run_source(source, stop);
                if engine.state() == EngineState::Failed {
                    tracing::warn!(
                        error_type = ?engine.analysis().map(|analysis| analysis.error_type),
                        "log shows a failure, cancelling installation"
                    );
                    preempt.cancel();
                }
                end
            })
        });

        let summary = panic::catch_unwind(AssertUnwindSafe(|| {
            resolver.run(request, cancel, &mut *observer)
        }))
        .unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            tracing::error!(panic = %message, "installer panicked");
            InstallationSummary {
                session_id: None,
                partitions: Vec::new(),
                skipped: Vec::new(),
                outcome: Err(InstallError::Unexpected(message)),
            }
        });

        diagnostics_stop.cancel();
        let stream_end = worker.map(|handle| {
            handle
                .join()
                .unwrap_or_else(|payload| StreamEnd::Unavailable(panic_message(payload.as_ref())))
        });
        (summary, stream_end)
    });

    let InstallationSummary {
        session_id,
        partitions,
        skipped,
        outcome,
    } = summary;

    let (outcome, terminal_step, failure) = match outcome {
        Err(err) => {
            let message = err.to_string();
            engine.conclude_failure(Some(analysis_for_error(&err)));
            (InstallOutcome::Failed, err.step(), Some(message))
        }
        Ok(InstallOutcome::Cancelled) if engine.state() == EngineState::Failed => {
            let (step, message) = match engine.analysis() {
                Some(analysis) => (
                    InstallationStep::for_classified(analysis.error_type),
                    analysis.error_message.clone(),
                ),
                None => (
                    InstallationStep::Error,
                    "installation stopped by log diagnostics".to_string(),
                ),
            };
            (InstallOutcome::Failed, step, Some(message))
        }
        Ok(InstallOutcome::Cancelled) => {
            engine.conclude_cancelled();
            (InstallOutcome::Cancelled, InstallationStep::Cancelled, None)
        }
        Ok(other) => {
            engine.conclude_success();
            (other, InstallationStep::Installed, None)
        }
    };

    if let Some(session_id) = session_id {
        logs.push(format!("session_id={session_id}"));
    }
    for partition in &partitions {
        logs.push(format!(
            "partition={} size_bytes={} bytes_written={} sha256={}",
            partition.name,
            partition.size_bytes,
            partition.bytes_written,
            partition.sha256.as_deref().unwrap_or("-")
        ));
    }
    for name in &skipped {
        logs.push(format!("skipped={name}"));
    }
    logs.push(format!("log_lines={}", engine.entries().len()));
    logs.push(format!("stream_end={}", describe_stream_end(stream_end.as_ref())));
    logs.push(format!("diagnostics={}", engine.state()));
    logs.push(format!("terminal_step={terminal_step}"));
    logs.push(format!("outcome={}", outcome_label(outcome)));
    if let Some(failure) = &failure {
        logs.push(format!("failure={failure}"));
    }

    observer.on_step(&terminal_step);
    if let Some(message) = &failure {
        observer.on_error(&terminal_step, message);
    }

    let installation = InstallationInfo {
        session_id: session_id.map(|id| id.to_string()),
        source_kind,
        userdata_size_bytes,
        partitions,
        outcome,
        failure: failure.clone(),
        started_at_utc,
        finished_at_utc: now_utc_rfc3339(),
    };
    let report = engine.build_report(ReportContext {
        device_info,
        gsi_info,
        installation_info: Some(installation.clone()),
    });
    tracing::info!(
        report_id = %report.report_id,
        outcome = outcome_label(outcome),
        step = %terminal_step,
        "installation attempt complete"
    );
    report_sink.on_report(report);

    AttemptResult {
        outcome,
        terminal_step,
        failure,
        diagnostics_state: engine.state(),
        installation,
        skipped,
        logs,
    }
}

fn outcome_label(outcome: InstallOutcome) -> &'static str {
    match outcome {
        InstallOutcome::Finished => "finished",
        InstallOutcome::Cancelled => "cancelled",
        InstallOutcome::Failed => "failed",
    }
}

fn describe_stream_end(end: Option<&StreamEnd>) -> String {
    match end {
        None => "none".to_string(),
        Some(StreamEnd::Terminal(state)) => format!("terminal:{state}"),
        Some(StreamEnd::Exhausted) => "exhausted".to_string(),
        Some(StreamEnd::Stopped) => "stopped".to_string(),
        Some(StreamEnd::Unavailable(reason)) => format!("unavailable:{reason}"),
    }
}

/// Analysis for an installer failure the log did not explain.
pub fn analysis_for_error(err: &InstallError) -> ErrorAnalysis {
    let (error_type, recoverable) = match err.step() {
        InstallationStep::ErrorAlreadyRunningDynamicSystem => {
            (ErrorType::AlreadyRunningDynamicSystem, true)
        }
        InstallationStep::ErrorNoAvailableStorage => (ErrorType::InsufficientStorage, true),
        InstallationStep::ErrorFragmentedUserdata => (ErrorType::FragmentedUserdata, true),
        InstallationStep::ErrorRequiresDiscard | InstallationStep::ErrorSource(_) => {
            (ErrorType::InstallationFailure, true)
        }
        _ => (ErrorType::InstallationFailure, false),
    };
    let mut analysis = ErrorAnalysis::new(error_type, AnalysisSeverity::Error, recoverable)
        .with_message(err.to_string());
    analysis
        .possible_causes
        .push(format!("The installer stopped at {}", err.step()));
    analysis
}

/// Writes the report bundle for an attempt, with its key=value log.
pub fn write_attempt_bundle(
    base: impl AsRef<Path>,
    report: &DiagnosticReport,
    result: &AttemptResult,
) -> Result<ReportPaths> {
    create_report_bundle(base, report, Some(&result.logs.join("\n")))
}

/// Removes an installed (not running) dynamic system. Requires force-mode
/// and a confirmation token.
pub fn discard_existing_installation<S: PrivilegedService>(
    service: &S,
    ctx: &SafetyContext,
) -> Result<bool> {
    if let SafetyDecision::Deny(reason) = can_discard_installation(ctx) {
        return Err(anyhow!(reason));
    }
    if service.is_in_use() {
        return Err(anyhow!("refusing to discard a running dynamic system"));
    }
    if !service.is_installed() {
        return Ok(false);
    }
    if !service.discard_session() {
        return Err(anyhow!("the installation service could not discard the installed system"));
    }
    tracing::info!("existing dynamic system discarded");
    Ok(true)
}

#[derive(Debug, Clone)]
pub struct DiagnosisResult {
    pub state: EngineState,
    pub report: DiagnosticReport,
}

/// Classifies a log on its own. A source that runs out without a verdict
/// is concluded by whatever has accumulated.
pub fn diagnose_log(
    source: &mut dyn LogSource,
    config: DiagnosticsConfig,
    context: ReportContext,
    stop: &CancellationToken,
) -> Result<DiagnosisResult> {
    let mut engine = DiagnosticEngine::new(config);
    let state = match engine.run_source(source, stop) {
        StreamEnd::Terminal(state) => state,
        StreamEnd::Exhausted => engine.end_of_stream(),
        StreamEnd::Stopped => engine.conclude_cancelled(),
        StreamEnd::Unavailable(reason) => {
            return Err(anyhow!("cannot read {}: {reason}", source.name()))
        }
    };
    Ok(DiagnosisResult {
        state,
        report: engine.build_report(context),
    })
}
