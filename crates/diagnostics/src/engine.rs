use crate::classifier::{classify, detect_signal, LogSignal};
use crate::parser::parse_line;
use crate::patterns::{is_reboot_signal, matches_any_category};
use crate::source::{LogPump, LogSource};
use crate::suggestions::generate_suggestions;
use dsu_core::{
    now_unix_millis, AnalysisSeverity, CancellationToken, DeviceInfo, DiagnosticReport,
    DiagnosticsConfig, ErrorAnalysis, GsiInfo, InstallationInfo, LogEntry, ProgressSample,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long already-emitted lines are still consumed after a stop request.
const STOP_GRACE: Duration = Duration::from_millis(250);
/// Percent progress is kept in basis points.
const PERCENT_SCALE: u64 = 10_000;

static PROGRESS_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)progress\s*[:=]").expect("progress marker pattern"));
static PROGRESS_PARTITION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)progress\s*[:=]\s*([a-z_][a-z0-9_.-]*)").expect("progress partition pattern")
});
static PROGRESS_BYTES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)progress\s*[:=]\s*([a-z_][a-z0-9_.-]*)\s+(\d+)\s*/\s*(\d+)\b")
        .expect("progress bytes pattern")
});
static PROGRESS_PERCENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)progress\s*[:=]\s*([a-z_][a-z0-9_.-]*)\s+(\d+(?:\.\d+)?)\s*%")
        .expect("progress percent pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Logging,
    Success,
    Failed,
    Cancelled,
}

impl EngineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineState::Success | EngineState::Failed | EngineState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::Logging => "logging",
            EngineState::Success => "success",
            EngineState::Failed => "failed",
            EngineState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress reported inside the log itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogProgress {
    Determinate(ProgressSample),
    Indeterminate { partition: Option<String> },
}

/// `progress: <partition> <done>/<total>` or `progress: <partition> <pct>%`.
/// Any other text after a progress marker degrades to `Indeterminate`.
pub fn parse_progress(line: &str) -> Option<LogProgress> {
    if !PROGRESS_MARKER.is_match(line) {
        return None;
    }

    if let Some(caps) = PROGRESS_BYTES.captures(line) {
        let partition = caps[1].to_string();
        let done = caps[2].parse::<u64>().ok();
        let total = caps[3].parse::<u64>().ok();
        return Some(match (done, total) {
            (Some(done), Some(total)) if total > 0 => {
                LogProgress::Determinate(ProgressSample::new(partition, done, total))
            }
            _ => LogProgress::Indeterminate {
                partition: Some(partition),
            },
        });
    }

    if let Some(caps) = PROGRESS_PERCENT.captures(line) {
        let partition = caps[1].to_string();
        return Some(match caps[2].parse::<f64>() {
            Ok(percent) if (0.0..=100.0).contains(&percent) => {
                let done = (percent * (PERCENT_SCALE as f64 / 100.0)).round() as u64;
                LogProgress::Determinate(ProgressSample::new(partition, done, PERCENT_SCALE))
            }
            _ => LogProgress::Indeterminate {
                partition: Some(partition),
            },
        });
    }

    let partition = PROGRESS_PARTITION
        .captures(line)
        .map(|caps| caps[1].to_string());
    Some(LogProgress::Indeterminate { partition })
}

/// What the caller gets back from [`DiagnosticEngine::run_source`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// The engine reached a terminal state while reading.
    Terminal(EngineState),
    /// A finite source ran out; the engine is still logging.
    Exhausted,
    /// The stop token fired; the engine is still logging.
    Stopped,
    /// The source could not be opened.
    Unavailable(String),
}

/// Everything outside the log that goes into a report.
#[derive(Debug, Clone, Default)]
pub struct ReportContext {
    pub device_info: DeviceInfo,
    pub gsi_info: Option<GsiInfo>,
    pub installation_info: Option<InstallationInfo>,
}

pub struct DiagnosticEngine {
    config: DiagnosticsConfig,
    state: EngineState,
    source_name: String,
    entries: Vec<LogEntry>,
    raw_lines: Vec<String>,
    full_text_lower: String,
    reboot_count: u32,
    analysis: Option<ErrorAnalysis>,
    progress: Option<LogProgress>,
}

impl DiagnosticEngine {
    pub fn new(config: DiagnosticsConfig) -> Self {
        Self {
            config,
            state: EngineState::Idle,
            source_name: String::new(),
            entries: Vec::new(),
            raw_lines: Vec::new(),
            full_text_lower: String::new(),
            reboot_count: 0,
            analysis: None,
            progress: None,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &DiagnosticsConfig {
        &self.config
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn analysis(&self) -> Option<&ErrorAnalysis> {
        self.analysis.as_ref()
    }

    pub fn progress(&self) -> Option<&LogProgress> {
        self.progress.as_ref()
    }

    pub fn reboot_count(&self) -> u32 {
        self.reboot_count
    }

    /// Starts a fresh session on a log stream. Anything retained from a
    /// previous session is dropped.
    pub fn attach(&mut self, source_name: &str) {
        self.reset();
        self.source_name = source_name.to_string();
        self.state = EngineState::Logging;
        tracing::debug!(source = source_name, "diagnostics attached");
    }

    pub fn reset(&mut self) {
        self.state = EngineState::Idle;
        self.source_name.clear();
        self.entries.clear();
        self.raw_lines.clear();
        self.full_text_lower.clear();
        self.reboot_count = 0;
        self.analysis = None;
        self.progress = None;
    }

    /// Consumes one raw line. Returns the new state when the line ended the
    /// session; lines arriving outside `Logging` are ignored.
    pub fn feed_line(&mut self, line: &str) -> Option<EngineState> {
        if self.state != EngineState::Logging {
            return None;
        }

        let line = line.trim_end_matches(['\r', '\n']);
        let lower = line.to_lowercase();
        self.entries
            .push(parse_line(line, &self.source_name, now_unix_millis()));
        self.raw_lines.push(line.to_string());
        self.full_text_lower.push_str(&lower);
        self.full_text_lower.push('\n');

        if let Some(progress) = parse_progress(line) {
            self.progress = Some(progress);
        }

        if let Some(signal) = detect_signal(line) {
            return Some(match signal {
                LogSignal::Completed => self.transition(EngineState::Success),
                LogSignal::Cancelled => self.transition(EngineState::Cancelled),
                LogSignal::Failure(analysis) => {
                    self.analysis = Some(analysis);
                    self.transition(EngineState::Failed)
                }
            });
        }

        let reboot = is_reboot_signal(&lower);
        if reboot {
            self.reboot_count += 1;
        }
        // The accumulated text only changes its classification when the new
        // line carries a pattern or a reboot.
        if reboot || matches_any_category(&lower) {
            self.analysis = classify(
                &self.full_text_lower,
                &self.raw_lines,
                self.reboot_count,
                self.config.boot_loop_threshold,
                self.config.excerpt_limit,
            );
        }

        let critical = self
            .analysis
            .as_ref()
            .is_some_and(|analysis| analysis.severity == AnalysisSeverity::Critical);
        critical.then(|| self.transition(EngineState::Failed))
    }

    /// A finite source ended: any classification fails the session,
    /// otherwise it succeeded.
    pub fn end_of_stream(&mut self) -> EngineState {
        if self.state == EngineState::Logging {
            let next = if self.analysis.is_some() {
                EngineState::Failed
            } else {
                EngineState::Success
            };
            self.transition(next);
        }
        self.state
    }

    pub fn conclude_success(&mut self) -> EngineState {
        if !self.state.is_terminal() {
            self.transition(EngineState::Success);
        }
        self.state
    }

    pub fn conclude_cancelled(&mut self) -> EngineState {
        if !self.state.is_terminal() {
            self.transition(EngineState::Cancelled);
        }
        self.state
    }

    /// Fails the session. A classification already made from the log is kept
    /// over `fallback`.
    pub fn conclude_failure(&mut self, fallback: Option<ErrorAnalysis>) -> EngineState {
        if !self.state.is_terminal() {
            if self.analysis.is_none() {
                self.analysis = fallback;
            }
            self.transition(EngineState::Failed);
        }
        self.state
    }

    fn transition(&mut self, next: EngineState) -> EngineState {
        tracing::info!(
            from = %self.state,
            to = %next,
            lines = self.entries.len(),
            error_type = ?self.analysis.as_ref().map(|analysis| analysis.error_type),
            "diagnostics state"
        );
        self.state = next;
        next
    }

    /// Report over the trailing log window. The analysis is only included
    /// when the session failed.
    pub fn build_report(&self, context: ReportContext) -> DiagnosticReport {
        let skip = self
            .entries
            .len()
            .saturating_sub(self.config.report_log_window);
        let logs = self.entries[skip..].to_vec();
        let analysis = match self.state {
            EngineState::Failed => self.analysis.clone(),
            _ => None,
        };
        let suggestions = generate_suggestions(
            analysis.as_ref(),
            &context.device_info,
            context.gsi_info.as_ref(),
            self.config.min_supported_sdk,
        );
        DiagnosticReport::new(
            context.device_info,
            context.gsi_info,
            context.installation_info,
            analysis,
            logs,
            suggestions,
        )
    }

    /// Attaches to `source` and consumes lines until the session ends, the
    /// source runs out, or `stop` fires. After a stop, lines already emitted
    /// are still read for a short grace period.
    pub fn run_source(&mut self, source: &mut dyn LogSource, stop: &CancellationToken) -> StreamEnd {
        let stream = match source.open() {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(source = source.name(), error = %err, "log source unavailable");
                return StreamEnd::Unavailable(err.to_string());
            }
        };
        self.attach(source.name());
        let pump = LogPump::spawn(stream);

        loop {
            if stop.is_cancelled() {
                return self.drain_after_stop(&pump);
            }
            match pump.recv_timeout(POLL_INTERVAL) {
                Ok(line) => {
                    if let Some(state) = self.feed_line(&line) {
                        return StreamEnd::Terminal(state);
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return StreamEnd::Exhausted,
            }
        }
    }

    fn drain_after_stop(&mut self, pump: &LogPump) -> StreamEnd {
        let deadline = Instant::now() + STOP_GRACE;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return StreamEnd::Stopped;
            }
            match pump.recv_timeout(remaining) {
                Ok(line) => {
                    if let Some(state) = self.feed_line(&line) {
                        return StreamEnd::Terminal(state);
                    }
                }
                Err(_) => return StreamEnd::Stopped,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{CapturedLog, FileLog};
    use dsu_core::ErrorType;

    fn logging_engine() -> DiagnosticEngine {
        let mut engine = DiagnosticEngine::new(DiagnosticsConfig::default());
        engine.attach("test");
        engine
    }

    #[test]
    fn sdcard_denial_fails_with_unmount_suggestion() {
        let mut engine = logging_engine();
        let state = engine.feed_line("E/vold: realpath failed: /mnt/sd: Permission denied");
        assert_eq!(state, Some(EngineState::Failed));

        let report = engine.build_report(ReportContext::default());
        let analysis = report.error_analysis.unwrap();
        assert_eq!(analysis.error_type, ErrorType::ExternalSdcardAlloc);
        assert!(!analysis.is_recoverable);
        assert!(report
            .suggestions
            .iter()
            .any(|suggestion| suggestion.contains("unmount SD")));
    }

    #[test]
    fn ready_status_succeeds_without_analysis() {
        let mut engine = logging_engine();
        assert_eq!(engine.feed_line("I/gsid: starting"), None);
        assert_eq!(
            engine.feed_line("I/DynSystemInstallationService: postStatus(): statusCode=3"),
            Some(EngineState::Success)
        );
        let report = engine.build_report(ReportContext::default());
        assert!(report.error_analysis.is_none());
        assert_eq!(report.logs.len(), 2);
    }

    #[test]
    fn terminal_engine_is_inert() {
        let mut engine = logging_engine();
        engine.feed_line("I/gsid: install completed");
        assert_eq!(engine.feed_line("E/vold: realpath failed: Permission denied"), None);
        assert_eq!(engine.entries().len(), 1);
        assert_eq!(engine.conclude_failure(None), EngineState::Success);
        assert_eq!(engine.state(), EngineState::Success);
    }

    #[test]
    fn critical_category_ends_session_immediately() {
        let mut engine = logging_engine();
        assert_eq!(engine.feed_line("E/AndroidRuntime: FATAL EXCEPTION: main"), None);
        assert_eq!(
            engine.analysis().map(|analysis| analysis.error_type),
            Some(ErrorType::SystemFailure)
        );
        assert_eq!(
            engine.feed_line("E/init: avb_slot_verify failed"),
            Some(EngineState::Failed)
        );
        assert_eq!(
            engine.analysis().map(|analysis| analysis.error_type),
            Some(ErrorType::AvbVerification)
        );
    }

    #[test]
    fn second_reboot_is_a_boot_loop() {
        let mut engine = logging_engine();
        assert_eq!(engine.feed_line("E/vintf: incompatible manifest"), None);
        assert_eq!(engine.feed_line("I/init: rebooting"), None);
        assert_eq!(engine.feed_line("I/init: rebooting"), Some(EngineState::Failed));
        let analysis = engine.analysis().unwrap();
        assert_eq!(analysis.error_type, ErrorType::BootLoop);
        assert_eq!(analysis.severity, AnalysisSeverity::Critical);
        assert_eq!(engine.reboot_count(), 2);
    }

    #[test]
    fn end_of_stream_uses_accumulated_analysis() {
        let mut engine = logging_engine();
        engine.feed_line("E/linker: VNDK version mismatch");
        assert_eq!(engine.end_of_stream(), EngineState::Failed);

        let mut engine = logging_engine();
        engine.feed_line("I/ActivityManager: Start proc");
        assert_eq!(engine.end_of_stream(), EngineState::Success);
    }

    #[test]
    fn failure_keeps_log_classification_over_fallback() {
        let mut engine = logging_engine();
        engine.feed_line("E/linker: VNDK version mismatch");
        let fallback = ErrorAnalysis::new(
            ErrorType::InstallationFailure,
            AnalysisSeverity::Error,
            false,
        );
        engine.conclude_failure(Some(fallback.clone()));
        assert_eq!(engine.analysis().unwrap().error_type, ErrorType::Compatibility);

        let mut engine = logging_engine();
        engine.conclude_failure(Some(fallback));
        assert_eq!(
            engine.analysis().unwrap().error_type,
            ErrorType::InstallationFailure
        );
    }

    #[test]
    fn success_report_hides_noise_analysis() {
        let mut engine = logging_engine();
        engine.feed_line("W/vintf: incompatible optional hal");
        engine.conclude_success();
        assert!(engine.build_report(ReportContext::default()).error_analysis.is_none());
    }

    #[test]
    fn report_keeps_trailing_window() {
        let mut engine = logging_engine();
        for i in 0..120 {
            engine.feed_line(&format!("I/tag: line {i}"));
        }
        engine.conclude_cancelled();
        let report = engine.build_report(ReportContext::default());
        assert_eq!(report.logs.len(), 50);
        assert_eq!(report.logs[0].message, "line 70");
        assert_eq!(report.logs[49].message, "line 119");
        assert_eq!(engine.entries().len(), 120);
    }

    #[test]
    fn progress_lines() {
        assert_eq!(
            parse_progress("I/gsid: progress: system 512/2048"),
            Some(LogProgress::Determinate(ProgressSample::new("system", 512, 2048)))
        );
        let Some(LogProgress::Determinate(sample)) = parse_progress("Progress= vendor 42.5%") else {
            panic!("expected determinate progress");
        };
        assert_eq!(sample.partition, "vendor");
        assert!((sample.fraction() - 0.425).abs() < 1e-9);
        assert_eq!(
            parse_progress("progress: system 10/0"),
            Some(LogProgress::Indeterminate {
                partition: Some("system".to_string())
            })
        );
        assert_eq!(
            parse_progress("progress: product ???"),
            Some(LogProgress::Indeterminate {
                partition: Some("product".to_string())
            })
        );
        assert_eq!(
            parse_progress("progress: system 250%"),
            Some(LogProgress::Indeterminate {
                partition: Some("system".to_string())
            })
        );
        assert_eq!(parse_progress("I/gsid: nothing here"), None);
    }

    #[test]
    fn malformed_progress_does_not_stop_classification() {
        let mut engine = logging_engine();
        assert_eq!(engine.feed_line("progress: !!!"), None);
        assert_eq!(
            engine.progress(),
            Some(&LogProgress::Indeterminate { partition: None })
        );
        assert_eq!(
            engine.feed_line("E/vold: realpath failed: /mnt/sd: Permission denied"),
            Some(EngineState::Failed)
        );
    }

    #[test]
    fn run_source_over_captured_log() {
        let mut engine = DiagnosticEngine::new(DiagnosticsConfig::default());
        let mut source = CapturedLog::new(
            "capture",
            "I/gsid: progress: system 1/2\nE/vold: realpath failed: /mnt/sd: Permission denied\nI/tag: after\n",
        );
        let end = engine.run_source(&mut source, &CancellationToken::new());
        assert_eq!(end, StreamEnd::Terminal(EngineState::Failed));
        assert_eq!(engine.entries().len(), 2);
        assert_eq!(engine.source_name(), "capture");
    }

    #[test]
    fn run_source_exhausts_clean_log() {
        let mut engine = DiagnosticEngine::new(DiagnosticsConfig::default());
        let mut source = CapturedLog::new("capture", "I/tag: one\nI/tag: two\n");
        assert_eq!(
            engine.run_source(&mut source, &CancellationToken::new()),
            StreamEnd::Exhausted
        );
        assert_eq!(engine.state(), EngineState::Logging);
        assert_eq!(engine.end_of_stream(), EngineState::Success);
    }

    #[test]
    fn restarting_a_source_starts_a_new_session() {
        let mut engine = DiagnosticEngine::new(DiagnosticsConfig::default());
        let mut source = CapturedLog::new("capture", "I/gsid: install completed\n");
        engine.run_source(&mut source, &CancellationToken::new());
        assert_eq!(engine.state(), EngineState::Success);
        engine.run_source(&mut source, &CancellationToken::new());
        assert_eq!(engine.state(), EngineState::Success);
        assert_eq!(engine.entries().len(), 1);
    }

    #[test]
    fn stopped_before_reading() {
        let mut engine = DiagnosticEngine::new(DiagnosticsConfig::default());
        let stop = CancellationToken::new();
        stop.cancel();
        let mut source = CapturedLog::new("capture", "I/tag: one\n");
        assert_eq!(engine.run_source(&mut source, &stop), StreamEnd::Stopped);
        assert_eq!(engine.entries().len(), 1);
    }

    #[test]
    fn missing_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = DiagnosticEngine::new(DiagnosticsConfig::default());
        let mut source = FileLog::new(dir.path().join("missing.log"));
        let end = engine.run_source(&mut source, &CancellationToken::new());
        assert!(matches!(end, StreamEnd::Unavailable(_)));
        assert_eq!(engine.state(), EngineState::Idle);
    }
}
