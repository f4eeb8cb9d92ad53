use crate::request::{InstalledPartition, SourceKind};
use crate::{now_utc_rfc3339, REPORT_SCHEMA_VERSION};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSeverity {
    Verbose,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl LogSeverity {
    /// Maps a logcat priority letter. `A` (assert) is reported as fatal.
    pub fn from_letter(letter: char) -> Option<Self> {
        match letter {
            'V' => Some(LogSeverity::Verbose),
            'D' => Some(LogSeverity::Debug),
            'I' => Some(LogSeverity::Info),
            'W' => Some(LogSeverity::Warning),
            'E' => Some(LogSeverity::Error),
            'F' | 'A' => Some(LogSeverity::Fatal),
            _ => None,
        }
    }

    pub fn letter(&self) -> char {
        match self {
            LogSeverity::Verbose => 'V',
            LogSeverity::Debug => 'D',
            LogSeverity::Info => 'I',
            LogSeverity::Warning => 'W',
            LogSeverity::Error => 'E',
            LogSeverity::Fatal => 'F',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp_millis: i64,
    pub severity: LogSeverity,
    pub tag: String,
    pub message: String,
    pub source: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}: {}", self.severity.letter(), self.tag, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisSeverity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
    Unknown,
}

impl AnalysisSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisSeverity::Debug => "debug",
            AnalysisSeverity::Info => "info",
            AnalysisSeverity::Warning => "warning",
            AnalysisSeverity::Error => "error",
            AnalysisSeverity::Critical => "critical",
            AnalysisSeverity::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    AvbVerification,
    BootFailure,
    PartitionFailure,
    Compatibility,
    SystemFailure,
    BootLoop,
    AlreadyRunningDynamicSystem,
    ExternalSdcardAlloc,
    InsufficientStorage,
    F2fsWrongPath,
    SelinuxDenial,
    FragmentedUserdata,
    InstallerStatus,
    InstallationFailure,
    Unknown,
}

impl ErrorType {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorType::AvbVerification => "AVB_VERIFICATION_FAILED",
            ErrorType::BootFailure => "BOOT_FAILURE",
            ErrorType::PartitionFailure => "PARTITION_FAILURE",
            ErrorType::Compatibility => "COMPATIBILITY_MISMATCH",
            ErrorType::SystemFailure => "SYSTEM_FAILURE",
            ErrorType::BootLoop => "BOOT_LOOP",
            ErrorType::AlreadyRunningDynamicSystem => "ALREADY_RUNNING_DYNAMIC_SYSTEM",
            ErrorType::ExternalSdcardAlloc => "EXTERNAL_SDCARD_ALLOC",
            ErrorType::InsufficientStorage => "INSUFFICIENT_STORAGE",
            ErrorType::F2fsWrongPath => "F2FS_WRONG_PATH",
            ErrorType::SelinuxDenial => "SELINUX_DENIAL",
            ErrorType::FragmentedUserdata => "FRAGMENTED_USERDATA",
            ErrorType::InstallerStatus => "INSTALLER_STATUS",
            ErrorType::InstallationFailure => "INSTALLATION_FAILURE",
            ErrorType::Unknown => "UNKNOWN",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            ErrorType::AvbVerification => "Verified boot rejected the image",
            ErrorType::BootFailure => "The dynamic system failed to boot",
            ErrorType::PartitionFailure => "Dynamic partition failure",
            ErrorType::Compatibility => "GSI is not compatible with this device",
            ErrorType::SystemFailure => "Android framework failed to start",
            ErrorType::BootLoop => "Boot loop detected",
            ErrorType::AlreadyRunningDynamicSystem => "A dynamic system is currently running",
            ErrorType::ExternalSdcardAlloc => "Cannot allocate the image on external storage",
            ErrorType::InsufficientStorage => "Not enough free storage",
            ErrorType::F2fsWrongPath => "Image path is not usable on f2fs",
            ErrorType::SelinuxDenial => "SELinux denied access to a block device",
            ErrorType::FragmentedUserdata => "Userdata is too fragmented",
            ErrorType::InstallerStatus => "Installer service reported an error",
            ErrorType::InstallationFailure => "Installation failed",
            ErrorType::Unknown => "Unknown error",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorAnalysis {
    pub error_type: ErrorType,
    pub error_code: String,
    pub error_message: String,
    pub severity: AnalysisSeverity,
    pub is_recoverable: bool,
    pub possible_causes: Vec<String>,
    pub related_log_lines: Vec<String>,
}

impl ErrorAnalysis {
    /// Analysis with the type's code and title; callers fill in the rest.
    pub fn new(error_type: ErrorType, severity: AnalysisSeverity, is_recoverable: bool) -> Self {
        Self {
            error_type,
            error_code: error_type.code().to_string(),
            error_message: error_type.title().to_string(),
            severity,
            is_recoverable,
            possible_causes: Vec::new(),
            related_log_lines: Vec::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = message.into();
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = code.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub manufacturer: String,
    pub model: String,
    pub android_version: String,
    pub sdk_level: u32,
    pub supported_abis: Vec<String>,
    pub kernel_version: Option<String>,
    pub slot_suffix: Option<String>,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            manufacturer: "unknown".to_string(),
            model: "unknown".to_string(),
            android_version: "unknown".to_string(),
            sdk_level: 0,
            supported_abis: Vec::new(),
            kernel_version: None,
            slot_suffix: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GsiInfo {
    pub name: String,
    pub architecture: Option<String>,
    pub size_bytes: u64,
    pub format: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallOutcome {
    Finished,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationInfo {
    pub session_id: Option<String>,
    pub source_kind: SourceKind,
    pub userdata_size_bytes: u64,
    pub partitions: Vec<InstalledPartition>,
    pub outcome: InstallOutcome,
    pub failure: Option<String>,
    pub started_at_utc: String,
    pub finished_at_utc: String,
}

/// Aggregate produced once at the end of a diagnostic session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub report_id: Uuid,
    pub schema_version: String,
    pub timestamp: String,
    pub device_info: DeviceInfo,
    pub gsi_info: Option<GsiInfo>,
    pub installation_info: Option<InstallationInfo>,
    pub error_analysis: Option<ErrorAnalysis>,
    pub logs: Vec<LogEntry>,
    pub suggestions: Vec<String>,
}

impl DiagnosticReport {
    pub fn new(
        device_info: DeviceInfo,
        gsi_info: Option<GsiInfo>,
        installation_info: Option<InstallationInfo>,
        error_analysis: Option<ErrorAnalysis>,
        logs: Vec<LogEntry>,
        suggestions: Vec<String>,
    ) -> Self {
        Self {
            report_id: Uuid::new_v4(),
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            timestamp: now_utc_rfc3339(),
            device_info,
            gsi_info,
            installation_info,
            error_analysis,
            logs,
            suggestions,
        }
    }
}
