//! Recording doubles shared by the installer tests.

use crate::events::{InstallObserver, InstallationStep};
use crate::service::{PartitionStatus, PrivilegedService};
use dsu_core::{CancellationToken, ProgressSample};
use dsu_imaging::TransferBuffer;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    ForceStop,
    Start(String),
    Create(String, u64, bool),
    Submit(String, usize),
    Close,
    Finish,
    Discard,
}

#[derive(Default)]
pub(crate) struct MockService {
    pub in_use: bool,
    pub installed: bool,
    pub refuse_start: bool,
    pub refuse_close: bool,
    pub refuse_finish: bool,
    pub create_status: HashMap<String, PartitionStatus>,
    pub reject_submit_after: Option<usize>,
    pub cancel_after_submits: Option<(usize, CancellationToken)>,
    pub create_delay: Duration,
    /// Counter values shown while a writable partition is being created,
    /// one per `create_delay`.
    pub create_steps: Vec<u64>,
    pub(crate) calls: Mutex<Vec<Call>>,
    pub(crate) current: Mutex<Option<String>>,
    pub(crate) submitted: Mutex<HashMap<String, u64>>,
    pub(crate) submits: AtomicUsize,
    pub(crate) processed: AtomicU64,
}

impl MockService {
    pub fn with_create_status(mut self, name: &str, status: PartitionStatus) -> Self {
        self.create_status.insert(name.to_string(), status);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn created(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Create(name, ..) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn submitted_bytes(&self, name: &str) -> u64 {
        self.submitted.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl PrivilegedService for MockService {
    fn is_in_use(&self) -> bool {
        self.in_use
    }

    fn is_installed(&self) -> bool {
        self.installed
    }

    fn force_stop_consumer(&self) {
        self.record(Call::ForceStop);
    }

    fn start_session(&self, slot: &str) -> bool {
        self.record(Call::Start(slot.to_string()));
        !self.refuse_start
    }

    fn create_partition(&self, name: &str, size_bytes: u64, read_only: bool) -> PartitionStatus {
        self.record(Call::Create(name.to_string(), size_bytes, read_only));
        let status = self
            .create_status
            .get(name)
            .copied()
            .unwrap_or(PartitionStatus::Ok);
        if !status.is_ok() {
            return status;
        }
        *self.current.lock().unwrap() = Some(name.to_string());
        self.processed.store(0, Ordering::SeqCst);
        if !self.create_steps.is_empty() {
            for step in &self.create_steps {
                std::thread::sleep(self.create_delay);
                self.processed.store(*step, Ordering::SeqCst);
            }
            std::thread::sleep(self.create_delay);
        } else if !self.create_delay.is_zero() {
            for _ in 0..5 {
                std::thread::sleep(self.create_delay / 5);
                self.processed.fetch_add(size_bytes / 5, Ordering::SeqCst);
            }
        }
        self.processed.store(size_bytes, Ordering::SeqCst);
        status
    }

    fn open_transfer_channel(&self, buffer_size: usize) -> Option<TransferBuffer> {
        Some(TransferBuffer::new(7, buffer_size))
    }

    fn submit(&self, channel: &mut TransferBuffer, byte_count: usize) -> bool {
        let count = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
        if matches!(self.reject_submit_after, Some(limit) if count > limit) {
            return false;
        }
        if channel.drain(byte_count).is_err() {
            return false;
        }
        let name = self.current.lock().unwrap().clone().unwrap_or_default();
        self.record(Call::Submit(name.clone(), byte_count));
        *self.submitted.lock().unwrap().entry(name).or_insert(0) += byte_count as u64;
        if let Some((limit, token)) = &self.cancel_after_submits {
            if count == *limit {
                token.cancel();
            }
        }
        true
    }

    fn close_partition(&self) -> bool {
        self.record(Call::Close);
        !self.refuse_close
    }

    fn finish_session(&self) -> bool {
        self.record(Call::Finish);
        !self.refuse_finish
    }

    fn discard_session(&self) -> bool {
        self.record(Call::Discard);
        true
    }

    fn bytes_processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub(crate) struct RecordingObserver {
    pub samples: Vec<ProgressSample>,
    pub steps: Vec<InstallationStep>,
    pub created: Vec<(String, u64)>,
}

impl RecordingObserver {
    pub fn fractions(&self, partition: &str) -> Vec<f64> {
        self.samples
            .iter()
            .filter(|sample| sample.partition == partition)
            .map(ProgressSample::fraction)
            .collect()
    }
}

impl InstallObserver for RecordingObserver {
    fn on_progress(&mut self, sample: &ProgressSample) {
        self.samples.push(sample.clone());
    }

    fn on_step(&mut self, step: &InstallationStep) {
        self.steps.push(step.clone());
    }

    fn on_partition_created(&mut self, name: &str, size_bytes: u64) {
        self.created.push((name.to_string(), size_bytes));
    }
}
