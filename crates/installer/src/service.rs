use dsu_imaging::TransferBuffer;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result of a `create_partition` call, using the platform's numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionStatus {
    Ok,
    Generic,
    NoSpace,
    FileSystemCluttered,
    Other(i32),
}

impl PartitionStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => PartitionStatus::Ok,
            1 => PartitionStatus::Generic,
            2 => PartitionStatus::NoSpace,
            3 => PartitionStatus::FileSystemCluttered,
            other => PartitionStatus::Other(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            PartitionStatus::Ok => 0,
            PartitionStatus::Generic => 1,
            PartitionStatus::NoSpace => 2,
            PartitionStatus::FileSystemCluttered => 3,
            PartitionStatus::Other(code) => *code,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, PartitionStatus::Ok)
    }
}

impl fmt::Display for PartitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionStatus::Ok => f.write_str("ok"),
            PartitionStatus::Generic => f.write_str("generic failure"),
            PartitionStatus::NoSpace => f.write_str("no space"),
            PartitionStatus::FileSystemCluttered => f.write_str("file system cluttered"),
            PartitionStatus::Other(code) => write!(f, "status {code}"),
        }
    }
}

/// The privileged, out-of-process installation service.
///
/// Calls are serialized per session: at most one partition is open, and
/// `bytes_processed` is the only method that may be called while
/// `create_partition` is still running.
pub trait PrivilegedService: Send + Sync {
    fn is_in_use(&self) -> bool;
    fn is_installed(&self) -> bool;
    /// Stops any process holding the previous installation open.
    fn force_stop_consumer(&self) {}
    fn start_session(&self, slot: &str) -> bool;
    fn create_partition(&self, name: &str, size_bytes: u64, read_only: bool) -> PartitionStatus;
    fn open_transfer_channel(&self, buffer_size: usize) -> Option<TransferBuffer>;
    /// Consumes exactly `byte_count` staged bytes from `channel`.
    fn submit(&self, channel: &mut TransferBuffer, byte_count: usize) -> bool;
    fn close_partition(&self) -> bool;
    fn finish_session(&self) -> bool;
    fn discard_session(&self) -> bool;
    fn bytes_processed(&self) -> u64;
}

impl<T: PrivilegedService + ?Sized> PrivilegedService for &T {
    fn is_in_use(&self) -> bool {
        (**self).is_in_use()
    }
    fn is_installed(&self) -> bool {
        (**self).is_installed()
    }
    fn force_stop_consumer(&self) {
        (**self).force_stop_consumer()
    }
    fn start_session(&self, slot: &str) -> bool {
        (**self).start_session(slot)
    }
    fn create_partition(&self, name: &str, size_bytes: u64, read_only: bool) -> PartitionStatus {
        (**self).create_partition(name, size_bytes, read_only)
    }
    fn open_transfer_channel(&self, buffer_size: usize) -> Option<TransferBuffer> {
        (**self).open_transfer_channel(buffer_size)
    }
    fn submit(&self, channel: &mut TransferBuffer, byte_count: usize) -> bool {
        (**self).submit(channel, byte_count)
    }
    fn close_partition(&self) -> bool {
        (**self).close_partition()
    }
    fn finish_session(&self) -> bool {
        (**self).finish_session()
    }
    fn discard_session(&self) -> bool {
        (**self).discard_session()
    }
    fn bytes_processed(&self) -> u64 {
        (**self).bytes_processed()
    }
}
