use time::format_description::well_known::Rfc3339;

mod cancel;
pub mod config;
mod diagnostic;
mod request;

pub use cancel::CancellationToken;
pub use config::{load_config, DiagnosticsConfig, DsuConfig, InstallerConfig};
pub use diagnostic::{
    AnalysisSeverity, DeviceInfo, DiagnosticReport, ErrorAnalysis, ErrorType, GsiInfo,
    InstallOutcome, InstallationInfo, LogEntry, LogSeverity,
};
pub use request::{
    ByteSource, InstalledPartition, InstallationRequest, PartitionSource, ProgressSample,
    SessionState, SourceKind, USERDATA_PARTITION,
};

pub const REPORT_SCHEMA_VERSION: &str = "1.0.0";
pub const REQUEST_SCHEMA_VERSION: &str = "1.0.0";

pub fn now_utc_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

pub fn now_unix_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
