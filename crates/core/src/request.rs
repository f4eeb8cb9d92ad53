use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::PathBuf;

/// The writable data partition, always created first and never populated.
pub const USERDATA_PARTITION: &str = "userdata";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    SingleImage,
    MultiImage,
    Package,
    RemotePackage,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::SingleImage => "single_image",
            SourceKind::MultiImage => "multi_image",
            SourceKind::Package => "package",
            SourceKind::RemotePackage => "remote_package",
        }
    }
}

/// Where the bytes of a partition (or of a whole package) come from.
///
/// Sources are opened lazily, one at a time, so a multi-image request never
/// holds more than one open image.
pub enum ByteSource {
    File(PathBuf),
    Url(String),
    Reader(Box<dyn Read + Send>),
}

impl ByteSource {
    pub fn describe(&self) -> String {
        match self {
            ByteSource::File(path) => path.display().to_string(),
            ByteSource::Url(url) => url.clone(),
            ByteSource::Reader(_) => "<stream>".to_string(),
        }
    }
}

impl fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByteSource::File(path) => f.debug_tuple("File").field(path).finish(),
            ByteSource::Url(url) => f.debug_tuple("Url").field(url).finish(),
            ByteSource::Reader(_) => f.write_str("Reader(..)"),
        }
    }
}

#[derive(Debug)]
pub struct PartitionSource {
    pub name: String,
    pub declared_size_bytes: u64,
    pub byte_source: ByteSource,
}

impl PartitionSource {
    pub fn new(name: impl Into<String>, declared_size_bytes: u64, byte_source: ByteSource) -> Self {
        Self {
            name: name.into(),
            declared_size_bytes,
            byte_source,
        }
    }
}

/// One installation attempt. Built once and consumed by the resolver.
#[derive(Debug)]
pub struct InstallationRequest {
    pub source_kind: SourceKind,
    pub entries: Vec<PartitionSource>,
    pub userdata_size_bytes: u64,
}

impl InstallationRequest {
    pub fn single_image(
        declared_size_bytes: u64,
        byte_source: ByteSource,
        userdata_size_bytes: u64,
    ) -> Self {
        Self {
            source_kind: SourceKind::SingleImage,
            entries: vec![PartitionSource::new("system", declared_size_bytes, byte_source)],
            userdata_size_bytes,
        }
    }

    pub fn multi_image(entries: Vec<PartitionSource>, userdata_size_bytes: u64) -> Self {
        Self {
            source_kind: SourceKind::MultiImage,
            entries,
            userdata_size_bytes,
        }
    }

    /// A local (or already opened) package container. The container's own
    /// size is unknown until its entries are read.
    pub fn package(name: impl Into<String>, byte_source: ByteSource, userdata_size_bytes: u64) -> Self {
        Self {
            source_kind: SourceKind::Package,
            entries: vec![PartitionSource::new(name, 0, byte_source)],
            userdata_size_bytes,
        }
    }

    pub fn remote_package(url: impl Into<String>, userdata_size_bytes: u64) -> Self {
        let url = url.into();
        Self {
            source_kind: SourceKind::RemotePackage,
            entries: vec![PartitionSource::new(url.clone(), 0, ByteSource::Url(url))],
            userdata_size_bytes,
        }
    }

    pub fn declared_image_bytes(&self) -> u64 {
        self.entries
            .iter()
            .map(|entry| entry.declared_size_bytes)
            .fold(0u64, |acc, size| acc.saturating_add(size))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Started,
    InstallingPartition,
    Finished,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Finished | SessionState::Cancelled | SessionState::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSample {
    pub partition: String,
    pub bytes_processed: u64,
    pub total_bytes: u64,
}

impl ProgressSample {
    pub fn new(partition: impl Into<String>, bytes_processed: u64, total_bytes: u64) -> Self {
        Self {
            partition: partition.into(),
            bytes_processed,
            total_bytes,
        }
    }

    /// Normalized progress in `[0, 1]`. An empty partition counts as done.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        (self.bytes_processed as f64 / self.total_bytes as f64).clamp(0.0, 1.0)
    }

    pub fn is_complete(&self) -> bool {
        self.fraction() >= 1.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPartition {
    pub name: String,
    pub size_bytes: u64,
    pub bytes_written: u64,
    pub read_only: bool,
    pub sha256: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn fraction_is_clamped() {
        assert_eq!(ProgressSample::new("system", 0, 100).fraction(), 0.0);
        assert_eq!(ProgressSample::new("system", 50, 100).fraction(), 0.5);
        assert_eq!(ProgressSample::new("system", 150, 100).fraction(), 1.0);
        assert_eq!(ProgressSample::new("empty", 0, 0).fraction(), 1.0);
    }

    #[test]
    fn single_image_targets_system() {
        let request = InstallationRequest::single_image(
            4,
            ByteSource::Reader(Box::new(Cursor::new(vec![0u8; 4]))),
            1024,
        );
        assert_eq!(request.source_kind, SourceKind::SingleImage);
        assert_eq!(request.entries.len(), 1);
        assert_eq!(request.entries[0].name, "system");
        assert_eq!(request.declared_image_bytes(), 4);
    }

    #[test]
    fn remote_package_keeps_url() {
        let request = InstallationRequest::remote_package("https://example.invalid/gsi.zip", 8);
        assert_eq!(request.source_kind, SourceKind::RemotePackage);
        assert_eq!(
            request.entries[0].byte_source.describe(),
            "https://example.invalid/gsi.zip"
        );
    }

    #[test]
    fn terminal_states() {
        assert!(SessionState::Cancelled.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(SessionState::Finished.is_terminal());
        assert!(!SessionState::InstallingPartition.is_terminal());
    }
}
