use anyhow::{Context, Result};
use dsu_core::{
    now_utc_rfc3339, DiagnosticReport, InstallOutcome, LogEntry, REPORT_SCHEMA_VERSION,
};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct ReportPaths {
    pub report_id: Uuid,
    pub root: PathBuf,
    pub report_txt: PathBuf,
    pub report_json: PathBuf,
    pub bundle_json: PathBuf,
    pub logs_path: PathBuf,
}

#[derive(Debug, Serialize)]
struct BundleMetadata {
    report_id: Uuid,
    created_at_utc: String,
    report_schema_version: String,
    outcome: Option<InstallOutcome>,
    error_code: Option<String>,
    log_lines: usize,
}

/// Writes `<base>/reports/<report_id>/` with the text rendering, the JSON
/// report, bundle metadata and the attempt log followed by the device log.
pub fn create_report_bundle(
    base: impl AsRef<Path>,
    report: &DiagnosticReport,
    attempt_log: Option<&str>,
) -> Result<ReportPaths> {
    let base = base.as_ref();
    let root = base.join("reports").join(report.report_id.to_string());
    std::fs::create_dir_all(&root)
        .with_context(|| format!("create {}", root.display()))?;

    let report_txt = root.join("report.txt");
    let report_json = root.join("report.json");
    let bundle_json = root.join("bundle.json");
    let logs_path = root.join("logs.txt");

    std::fs::write(&report_txt, render_text(report))
        .with_context(|| format!("write {}", report_txt.display()))?;

    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(&report_json, json)
        .with_context(|| format!("write {}", report_json.display()))?;

    let metadata = BundleMetadata {
        report_id: report.report_id,
        created_at_utc: now_utc_rfc3339(),
        report_schema_version: REPORT_SCHEMA_VERSION.to_string(),
        outcome: report
            .installation_info
            .as_ref()
            .map(|installation| installation.outcome),
        error_code: report
            .error_analysis
            .as_ref()
            .map(|analysis| analysis.error_code.clone()),
        log_lines: report.logs.len(),
    };
    std::fs::write(&bundle_json, serde_json::to_string_pretty(&metadata)?)
        .with_context(|| format!("write {}", bundle_json.display()))?;

    let mut log_data = attempt_log.unwrap_or("").trim_end().to_string();
    if !report.logs.is_empty() {
        if !log_data.is_empty() {
            log_data.push_str("\n\n");
        }
        log_data.push_str("# device log\n");
        for entry in &report.logs {
            log_data.push_str(&format_log_entry(entry));
            log_data.push('\n');
        }
    }
    std::fs::write(&logs_path, log_data)
        .with_context(|| format!("write {}", logs_path.display()))?;

    Ok(ReportPaths {
        report_id: report.report_id,
        root,
        report_txt,
        report_json,
        bundle_json,
        logs_path,
    })
}

fn outcome_label(outcome: InstallOutcome) -> &'static str {
    match outcome {
        InstallOutcome::Finished => "finished",
        InstallOutcome::Cancelled => "cancelled",
        InstallOutcome::Failed => "failed",
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = "B";
    for next in UNITS {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{value:.2} {unit}")
}

/// `MM-DD HH:MM:SS.mmm L/tag: message`, in UTC.
pub fn format_log_entry(entry: &LogEntry) -> String {
    let format = format_description!("[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]");
    let stamp = OffsetDateTime::from_unix_timestamp_nanos(entry.timestamp_millis as i128 * 1_000_000)
        .ok()
        .and_then(|moment| moment.format(&format).ok())
        .unwrap_or_else(|| entry.timestamp_millis.to_string());
    format!("{stamp} {entry}")
}

fn section(out: &mut String, title: &str) {
    let _ = writeln!(out);
    let _ = writeln!(out, "{title}");
    let _ = writeln!(out, "{}", "-".repeat(title.len()));
}

/// Human-readable rendering. Sections without data are left out.
pub fn render_text(report: &DiagnosticReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Dynamic System Diagnostic Report");
    let _ = writeln!(out, "================================");
    let _ = writeln!(out, "Report ID: {}", report.report_id);
    let _ = writeln!(out, "Generated: {}", report.timestamp);
    let _ = writeln!(out, "Schema:    {}", report.schema_version);

    let device = &report.device_info;
    section(&mut out, "Device");
    let _ = writeln!(out, "Manufacturer: {}", device.manufacturer);
    let _ = writeln!(out, "Model:        {}", device.model);
    let _ = writeln!(
        out,
        "Android:      {} (SDK {})",
        device.android_version, device.sdk_level
    );
    let abis = if device.supported_abis.is_empty() {
        "unknown".to_string()
    } else {
        device.supported_abis.join(", ")
    };
    let _ = writeln!(out, "ABIs:         {abis}");
    if let Some(kernel) = &device.kernel_version {
        let _ = writeln!(out, "Kernel:       {kernel}");
    }
    if let Some(slot) = &device.slot_suffix {
        let _ = writeln!(out, "Slot:         {slot}");
    }

    if let Some(gsi) = &report.gsi_info {
        section(&mut out, "GSI");
        let _ = writeln!(out, "Name:         {}", gsi.name);
        let _ = writeln!(
            out,
            "Architecture: {}",
            gsi.architecture.as_deref().unwrap_or("unknown")
        );
        let _ = writeln!(out, "Size:         {}", format_bytes(gsi.size_bytes));
        let _ = writeln!(out, "Format:       {}", gsi.format);
    }

    if let Some(installation) = &report.installation_info {
        section(&mut out, "Installation");
        if let Some(session_id) = &installation.session_id {
            let _ = writeln!(out, "Session:  {session_id}");
        }
        let _ = writeln!(out, "Source:   {}", installation.source_kind.as_str());
        let _ = writeln!(
            out,
            "Userdata: {}",
            format_bytes(installation.userdata_size_bytes)
        );
        let _ = writeln!(out, "Outcome:  {}", outcome_label(installation.outcome));
        if let Some(failure) = &installation.failure {
            let _ = writeln!(out, "Failure:  {failure}");
        }
        let _ = writeln!(out, "Started:  {}", installation.started_at_utc);
        let _ = writeln!(out, "Finished: {}", installation.finished_at_utc);
        if !installation.partitions.is_empty() {
            let _ = writeln!(out, "Partitions:");
            for partition in &installation.partitions {
                let mode = if partition.read_only { "ro" } else { "rw" };
                let _ = write!(
                    out,
                    "  - {} [{mode}] {} of {}",
                    partition.name,
                    format_bytes(partition.bytes_written),
                    format_bytes(partition.size_bytes)
                );
                if let Some(sha256) = &partition.sha256 {
                    let _ = write!(out, " sha256={sha256}");
                }
                let _ = writeln!(out);
            }
        }
    }

    if let Some(analysis) = &report.error_analysis {
        section(&mut out, "Error Analysis");
        let _ = writeln!(out, "Type:        {}", analysis.error_code);
        let _ = writeln!(out, "Message:     {}", analysis.error_message);
        let _ = writeln!(out, "Severity:    {}", analysis.severity.as_str());
        let _ = writeln!(
            out,
            "Recoverable: {}",
            if analysis.is_recoverable { "yes" } else { "no" }
        );
        if !analysis.possible_causes.is_empty() {
            let _ = writeln!(out, "Possible causes:");
            for cause in &analysis.possible_causes {
                let _ = writeln!(out, "  - {cause}");
            }
        }
        if !analysis.related_log_lines.is_empty() {
            let _ = writeln!(out, "Related log lines:");
            for line in &analysis.related_log_lines {
                let _ = writeln!(out, "  > {line}");
            }
        }
    }

    if !report.suggestions.is_empty() {
        section(&mut out, "Suggestions");
        for (index, suggestion) in report.suggestions.iter().enumerate() {
            let _ = writeln!(out, "{}. {suggestion}", index + 1);
        }
    }

    section(&mut out, &format!("Logs (last {})", report.logs.len()));
    for entry in &report.logs {
        let _ = writeln!(out, "{}", format_log_entry(entry));
    }
    out
}
