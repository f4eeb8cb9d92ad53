use crate::patterns::{is_reboot_signal, CATEGORIES};
use dsu_core::{AnalysisSeverity, ErrorAnalysis, ErrorType};
use once_cell::sync::Lazy;
use regex::Regex;

static STATUS_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"statuscode\s*=\s*(-?\d+)").expect("status code pattern"));
static CAUSE_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"causecode\s*=\s*(-?\d+)").expect("cause code pattern"));

const STATUS_READY: i64 = 3;
const STATUS_IN_USE: i64 = 4;

const CAUSE_INSTALL_COMPLETED: i64 = 1;
const CAUSE_CANCELLED: i64 = 2;

const STORAGE_SIGNALS: &[&str] = &[
    "below the minimum threshold",
    "not enough free space",
    "insufficient storage",
];
const CANCEL_SIGNALS: &[&str] = &[
    "installation cancelled",
    "installation canceled",
    "installation aborted",
    "install aborted",
    "cancelled by user",
];
const COMPLETED_SIGNALS: &[&str] = &["install completed", "installation completed"];

/// Outcome carried by a single line that needs no further classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSignal {
    Completed,
    Cancelled,
    Failure(ErrorAnalysis),
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

fn single_line_failure(
    error_type: ErrorType,
    recoverable: bool,
    cause: &str,
    raw_line: &str,
) -> LogSignal {
    let mut analysis = ErrorAnalysis::new(error_type, AnalysisSeverity::Error, recoverable);
    analysis.possible_causes.push(cause.to_string());
    analysis.related_log_lines.push(raw_line.trim().to_string());
    LogSignal::Failure(analysis)
}

/// Explicit single-signal detectors, checked ahead of the category tables.
pub fn detect_signal(raw_line: &str) -> Option<LogSignal> {
    let lower = raw_line.to_lowercase();

    if lower.contains("dynamic system")
        && contains_any(&lower, &["in use", "already running", "is running"])
    {
        return Some(single_line_failure(
            ErrorType::AlreadyRunningDynamicSystem,
            true,
            "The device is currently booted into a dynamic system",
            raw_line,
        ));
    }
    if lower.contains("realpath failed") && lower.contains("permission denied") {
        return Some(single_line_failure(
            ErrorType::ExternalSdcardAlloc,
            false,
            "The installer is not allowed to place the image on the SD card",
            raw_line,
        ));
    }
    if contains_any(&lower, STORAGE_SIGNALS) {
        return Some(single_line_failure(
            ErrorType::InsufficientStorage,
            true,
            "Free space on userdata is below what the installation needs",
            raw_line,
        ));
    }
    if lower.contains("f2fs") && contains_any(&lower, &["mismatch", "does not match", "wrong path"])
    {
        return Some(single_line_failure(
            ErrorType::F2fsWrongPath,
            true,
            "The image path does not resolve to the f2fs userdata mount",
            raw_line,
        ));
    }
    if lower.contains("avc: denied") && lower.contains("block_device") {
        return Some(single_line_failure(
            ErrorType::SelinuxDenial,
            false,
            "SELinux policy blocks access to the backing block device",
            raw_line,
        ));
    }
    if contains_any(&lower, &["too fragmented", "file system cluttered"]) {
        return Some(single_line_failure(
            ErrorType::FragmentedUserdata,
            true,
            "Userdata is too fragmented to allocate contiguous image extents",
            raw_line,
        ));
    }
    if contains_any(&lower, CANCEL_SIGNALS) {
        return Some(LogSignal::Cancelled);
    }
    if contains_any(&lower, COMPLETED_SIGNALS) {
        return Some(LogSignal::Completed);
    }
    status_signal(&lower, raw_line)
}

fn capture_code(pattern: &Regex, lower: &str) -> Option<i64> {
    pattern
        .captures(lower)
        .and_then(|caps| caps.get(1))
        .and_then(|code| code.as_str().parse().ok())
}

/// `postStatus(): statusCode=N, causeCode=M`. The cause is checked first.
fn status_signal(lower: &str, raw_line: &str) -> Option<LogSignal> {
    if let Some(cause) = capture_code(&CAUSE_CODE, lower) {
        match cause {
            CAUSE_INSTALL_COMPLETED => return Some(LogSignal::Completed),
            CAUSE_CANCELLED => return Some(LogSignal::Cancelled),
            3..=6 => {
                let (name, recoverable) = match cause {
                    3 => ("ERROR_IO", true),
                    4 => ("ERROR_INVALID_URL", true),
                    5 => ("ERROR_IPC", false),
                    _ => ("ERROR_EXCEPTION", false),
                };
                let mut analysis =
                    ErrorAnalysis::new(ErrorType::InstallerStatus, AnalysisSeverity::Error, recoverable)
                        .with_code(name)
                        .with_message(format!("Installer service failed with {name}"));
                analysis
                    .possible_causes
                    .push(format!("The installation service posted cause code {cause}"));
                analysis.related_log_lines.push(raw_line.trim().to_string());
                return Some(LogSignal::Failure(analysis));
            }
            _ => {}
        }
    }
    match capture_code(&STATUS_CODE, lower)? {
        STATUS_READY => Some(LogSignal::Completed),
        STATUS_IN_USE => Some(single_line_failure(
            ErrorType::AlreadyRunningDynamicSystem,
            true,
            "The installation service reports the dynamic system in use",
            raw_line,
        )),
        _ => None,
    }
}

fn trailing_unique(lines: impl Iterator<Item = String>, limit: usize) -> Vec<String> {
    let mut unique: Vec<String> = Vec::new();
    for line in lines {
        if !unique.contains(&line) {
            unique.push(line);
        }
    }
    let skip = unique.len().saturating_sub(limit);
    unique.split_off(skip)
}

/// Category classification over the whole log seen so far.
///
/// `full_lower` is the lowercased accumulated text; `lines` are the raw lines
/// used for excerpts. A reboot count at or over `boot_loop_threshold`
/// overrides any category.
pub fn classify(
    full_lower: &str,
    lines: &[String],
    reboot_count: u32,
    boot_loop_threshold: u32,
    excerpt_limit: usize,
) -> Option<ErrorAnalysis> {
    if reboot_count >= boot_loop_threshold {
        let mut analysis =
            ErrorAnalysis::new(ErrorType::BootLoop, AnalysisSeverity::Critical, false);
        analysis.possible_causes.push(format!(
            "The device restarted {reboot_count} times without finishing boot"
        ));
        analysis.related_log_lines = trailing_unique(
            lines
                .iter()
                .filter(|line| is_reboot_signal(&line.to_lowercase()))
                .map(|line| line.trim().to_string()),
            excerpt_limit,
        );
        return Some(analysis);
    }

    for category in CATEGORIES {
        let matched: Vec<_> = category
            .patterns
            .iter()
            .filter(|pattern| full_lower.contains(pattern.needle))
            .collect();
        if matched.is_empty() {
            continue;
        }

        let mut analysis =
            ErrorAnalysis::new(category.error_type, category.severity, category.recoverable);
        for pattern in &matched {
            let cause = pattern.cause.to_string();
            if !analysis.possible_causes.contains(&cause) {
                analysis.possible_causes.push(cause);
            }
        }
        analysis.related_log_lines = trailing_unique(
            lines
                .iter()
                .filter(|line| {
                    let lower = line.to_lowercase();
                    matched.iter().any(|pattern| lower.contains(pattern.needle))
                })
                .map(|line| line.trim().to_string()),
            excerpt_limit,
        );
        return Some(analysis);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify_text(text: &str, reboots: u32) -> Option<ErrorAnalysis> {
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        classify(&text.to_lowercase(), &lines, reboots, 2, 10)
    }

    #[test]
    fn avb_beats_system() {
        let analysis = classify_text(
            "E/AndroidRuntime: *** FATAL EXCEPTION IN SYSTEM PROCESS: main\nE/init: avb_slot_verify failed for system_dsu",
            0,
        )
        .unwrap();
        assert_eq!(analysis.error_type, ErrorType::AvbVerification);
        assert_eq!(analysis.severity, AnalysisSeverity::Critical);
        assert_eq!(analysis.related_log_lines, vec!["E/init: avb_slot_verify failed for system_dsu"]);
    }

    #[test]
    fn all_causes_in_the_winning_category_are_kept() {
        let analysis = classify_text(
            "E/linker: VNDK version mismatch\nE/vintf: VINTF check: incompatible manifest",
            0,
        )
        .unwrap();
        assert_eq!(analysis.error_type, ErrorType::Compatibility);
        assert!(analysis.is_recoverable);
        assert_eq!(analysis.possible_causes.len(), 3);
        assert_eq!(analysis.related_log_lines.len(), 2);
    }

    #[test]
    fn boot_loop_overrides_categories() {
        let analysis = classify_text(
            "E/AndroidRuntime: FATAL EXCEPTION: main\nI/init: rebooting\nI/init: rebooting",
            2,
        )
        .unwrap();
        assert_eq!(analysis.error_type, ErrorType::BootLoop);
        assert_eq!(analysis.severity, AnalysisSeverity::Critical);
        assert_eq!(analysis.related_log_lines, vec!["I/init: rebooting"]);
    }

    #[test]
    fn excerpts_are_deduplicated_and_trailing() {
        let mut text = String::new();
        for i in 0..15 {
            text.push_str(&format!("E/zygote: zygote died {i}\n"));
        }
        text.push_str("E/zygote: zygote died 14\n");
        let analysis = classify_text(&text, 0).unwrap();
        assert_eq!(analysis.related_log_lines.len(), 10);
        assert_eq!(analysis.related_log_lines.first().unwrap(), "E/zygote: zygote died 5");
        assert_eq!(analysis.related_log_lines.last().unwrap(), "E/zygote: zygote died 14");
    }

    #[test]
    fn clean_log_has_no_analysis() {
        assert!(classify_text("I/ActivityManager: Start proc\nI/init: boot completed", 1).is_none());
    }

    #[test]
    fn sdcard_realpath_denial() {
        let Some(LogSignal::Failure(analysis)) =
            detect_signal("E/vold: realpath failed: /mnt/sd: Permission denied")
        else {
            panic!("expected a failure signal");
        };
        assert_eq!(analysis.error_type, ErrorType::ExternalSdcardAlloc);
        assert!(!analysis.is_recoverable);
    }

    #[test]
    fn status_codes() {
        assert_eq!(
            detect_signal("I/DynSystemInstallationService: postStatus(): statusCode=3, causeCode=0"),
            Some(LogSignal::Completed)
        );
        assert_eq!(
            detect_signal("postStatus(): statusCode=1, causeCode=2"),
            Some(LogSignal::Cancelled)
        );
        let Some(LogSignal::Failure(analysis)) =
            detect_signal("postStatus(): statusCode=1, causeCode=3")
        else {
            panic!("expected a failure signal");
        };
        assert_eq!(analysis.error_type, ErrorType::InstallerStatus);
        assert_eq!(analysis.error_code, "ERROR_IO");
        let Some(LogSignal::Failure(analysis)) = detect_signal("postStatus(): statusCode=4") else {
            panic!("expected a failure signal");
        };
        assert_eq!(analysis.error_type, ErrorType::AlreadyRunningDynamicSystem);
        assert_eq!(detect_signal("postStatus(): statusCode=2, causeCode=0"), None);
    }

    #[test]
    fn other_detectors() {
        let kind = |line: &str| match detect_signal(line) {
            Some(LogSignal::Failure(analysis)) => Some(analysis.error_type),
            _ => None,
        };
        assert_eq!(
            kind("W/gsid: free space is below the minimum threshold"),
            Some(ErrorType::InsufficientStorage)
        );
        assert_eq!(
            kind("E/gsid: f2fs path mismatch for /data/gsi"),
            Some(ErrorType::F2fsWrongPath)
        );
        assert_eq!(
            kind("avc: denied { read } for name=\"dm-0\" scontext=u:r:gsid:s0 tclass=blk_file tcontext=u:object_r:block_device:s0"),
            Some(ErrorType::SelinuxDenial)
        );
        assert_eq!(
            kind("E/gsid: userdata is too fragmented"),
            Some(ErrorType::FragmentedUserdata)
        );
        assert_eq!(
            kind("E/DynamicSystemService: dynamic system is in use"),
            Some(ErrorType::AlreadyRunningDynamicSystem)
        );
        assert_eq!(detect_signal("I/gsid: Installation cancelled"), Some(LogSignal::Cancelled));
        assert_eq!(detect_signal("I/gsid: install completed"), Some(LogSignal::Completed));
        assert_eq!(detect_signal("I/ActivityManager: Start proc"), None);
    }
}
