use dsu_imaging::TransferBuffer;
use dsu_installer::{PartitionStatus, PrivilegedService};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

const INSTALLED_MARKER: &str = "installed";
const IN_USE_MARKER: &str = "in_use";
const ENOSPC: i32 = 28;

#[derive(Default)]
struct DirState {
    slot: Option<String>,
    open: Option<(String, File)>,
    next_channel: u64,
}

/// Privileged service backed by a plain directory: each partition becomes
/// `<root>/<slot>/<name>.img`. A committed session leaves an `installed`
/// marker in the root; an `in_use` marker simulates a running system.
pub struct ImageDirService {
    root: PathBuf,
    state: Mutex<DirState>,
    processed: AtomicU64,
}

impl ImageDirService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Mutex::new(DirState::default()),
            processed: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_path(&self, slot: &str, name: &str) -> PathBuf {
        self.root.join(slot).join(format!("{name}.img"))
    }

    pub fn set_in_use(&self, in_use: bool) -> std::io::Result<()> {
        let marker = self.root.join(IN_USE_MARKER);
        if in_use {
            fs::create_dir_all(&self.root)?;
            fs::write(marker, b"")
        } else if marker.exists() {
            fs::remove_file(marker)
        } else {
            Ok(())
        }
    }

    fn state(&self) -> MutexGuard<'_, DirState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn create_file(&self, slot: &str, name: &str, size_bytes: u64, read_only: bool) -> std::io::Result<File> {
        let path = self.partition_path(slot, name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        if !read_only {
            file.set_len(size_bytes)?;
            self.processed.store(size_bytes, Ordering::SeqCst);
        }
        Ok(file)
    }
}

impl PrivilegedService for ImageDirService {
    fn is_in_use(&self) -> bool {
        self.root.join(IN_USE_MARKER).exists()
    }

    fn is_installed(&self) -> bool {
        self.root.join(INSTALLED_MARKER).exists()
    }

    fn force_stop_consumer(&self) {
        tracing::debug!(root = %self.root.display(), "no consumer to stop");
    }

    fn start_session(&self, slot: &str) -> bool {
        let slot_dir = self.root.join(slot);
        if let Err(err) = fs::create_dir_all(&slot_dir) {
            tracing::warn!(path = %slot_dir.display(), error = %err, "cannot create slot directory");
            return false;
        }
        let mut state = self.state();
        state.slot = Some(slot.to_string());
        state.open = None;
        true
    }

    fn create_partition(&self, name: &str, size_bytes: u64, read_only: bool) -> PartitionStatus {
        let Some(slot) = self.state().slot.clone() else {
            return PartitionStatus::Generic;
        };
        self.processed.store(0, Ordering::SeqCst);
        match self.create_file(&slot, name, size_bytes, read_only) {
            Ok(file) => {
                self.state().open = Some((name.to_string(), file));
                PartitionStatus::Ok
            }
            Err(err) if err.raw_os_error() == Some(ENOSPC) => PartitionStatus::NoSpace,
            Err(err) => {
                tracing::warn!(partition = name, error = %err, "create partition failed");
                PartitionStatus::Generic
            }
        }
    }

    fn open_transfer_channel(&self, buffer_size: usize) -> Option<TransferBuffer> {
        let mut state = self.state();
        state.open.as_ref()?;
        state.next_channel += 1;
        Some(TransferBuffer::new(state.next_channel, buffer_size))
    }

    fn submit(&self, channel: &mut TransferBuffer, byte_count: usize) -> bool {
        let mut state = self.state();
        let Some((name, file)) = state.open.as_mut() else {
            return false;
        };
        let bytes = match channel.drain(byte_count) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(partition = %name, error = %err, "rejecting submit");
                return false;
            }
        };
        if let Err(err) = file.write_all(bytes) {
            tracing::warn!(partition = %name, error = %err, "write failed");
            return false;
        }
        self.processed.fetch_add(byte_count as u64, Ordering::SeqCst);
        true
    }

    fn close_partition(&self) -> bool {
        let Some((name, file)) = self.state().open.take() else {
            return false;
        };
        match file.sync_all() {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(partition = %name, error = %err, "sync failed");
                false
            }
        }
    }

    fn finish_session(&self) -> bool {
        let mut state = self.state();
        let Some(slot) = state.slot.take() else {
            return false;
        };
        state.open = None;
        fs::write(self.root.join(INSTALLED_MARKER), slot.as_bytes()).is_ok()
    }

    fn discard_session(&self) -> bool {
        let mut state = self.state();
        state.open = None;
        let slot = state.slot.take();
        let marker = self.root.join(INSTALLED_MARKER);
        if marker.exists() && fs::remove_file(&marker).is_err() {
            return false;
        }
        match slot {
            Some(slot) => {
                let slot_dir = self.root.join(slot);
                !slot_dir.exists() || fs::remove_dir_all(&slot_dir).is_ok()
            }
            None => true,
        }
    }

    fn bytes_processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }
}
