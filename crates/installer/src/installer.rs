use crate::error::InstallError;
use crate::events::{InstallObserver, InstallationStep};
use crate::panic_message;
use crate::service::{PartitionStatus, PrivilegedService};
use dsu_core::{CancellationToken, InstalledPartition, InstallerConfig, ProgressSample, SessionState};
use dsu_imaging::{ImageDigest, SparseDecoder, TransferError};
use std::io::Read;
use std::thread;
use std::time::Duration;
use uuid::Uuid;

/// How the bytes of a content partition are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageEncoding {
    /// Sniff for a sparse header and expand it.
    Detect,
    /// Hand the bytes over untouched (package entries).
    Passthrough,
}

pub enum PartitionContent<'a> {
    /// Allocated by the service, never populated (`userdata`).
    Writable,
    Image {
        reader: &'a mut dyn Read,
        encoding: ImageEncoding,
    },
}

pub struct PartitionRequest<'a> {
    pub name: String,
    pub size_bytes: u64,
    pub read_only: bool,
    pub content: PartitionContent<'a>,
}

impl<'a> PartitionRequest<'a> {
    pub fn writable(name: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            name: name.into(),
            size_bytes,
            read_only: false,
            content: PartitionContent::Writable,
        }
    }

    pub fn image(
        name: impl Into<String>,
        size_bytes: u64,
        reader: &'a mut dyn Read,
        encoding: ImageEncoding,
    ) -> Self {
        Self {
            name: name.into(),
            size_bytes,
            read_only: true,
            content: PartitionContent::Image { reader, encoding },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionOutcome {
    Installed(InstalledPartition),
    Cancelled,
}

/// One open installation session. Only the installer mutates it.
#[derive(Debug)]
pub struct InstallationSession {
    id: Uuid,
    slot: String,
    state: SessionState,
    installed: Vec<InstalledPartition>,
    cancel: CancellationToken,
}

impl InstallationSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn partitions_installed(&self) -> &[InstalledPartition] {
        &self.installed
    }

    pub fn into_partitions(self) -> Vec<InstalledPartition> {
        self.installed
    }

    /// Requests cooperative cancellation; observed at the next chunk boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub struct PartitionInstaller<S> {
    service: S,
    config: InstallerConfig,
}

impl<S: PrivilegedService> PartitionInstaller<S> {
    pub fn new(service: S, config: InstallerConfig) -> Self {
        Self { service, config }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn config(&self) -> &InstallerConfig {
        &self.config
    }

    /// Opens a session on the configured slot. The "in use" and "installed"
    /// queries are asked fresh on every call.
    pub fn start(&self, cancel: CancellationToken) -> Result<InstallationSession, InstallError> {
        if self.service.is_in_use() {
            return Err(InstallError::AlreadyRunningDynamicSystem);
        }
        if self.service.is_installed() {
            return Err(InstallError::RequiresDiscard);
        }
        self.service.force_stop_consumer();
        if !self.service.start_session(&self.config.slot) {
            return Err(InstallError::SessionStartFailed);
        }
        let session = InstallationSession {
            id: Uuid::new_v4(),
            slot: self.config.slot.clone(),
            state: SessionState::Started,
            installed: Vec::new(),
            cancel,
        };
        tracing::info!(session = %session.id, slot = %session.slot, "installation session started");
        Ok(session)
    }

    pub fn install_partition(
        &self,
        session: &mut InstallationSession,
        request: PartitionRequest<'_>,
        observer: &mut dyn InstallObserver,
    ) -> Result<PartitionOutcome, InstallError> {
        if session.state.is_terminal() {
            return Err(InstallError::SessionClosed(session.state));
        }
        if session.cancel_requested() {
            session.state = SessionState::Cancelled;
            return Ok(PartitionOutcome::Cancelled);
        }
        if session.installed.iter().any(|p| p.name == request.name) {
            session.state = SessionState::Failed;
            return Err(InstallError::DuplicatePartition(request.name));
        }

        session.state = SessionState::InstallingPartition;
        let PartitionRequest {
            name,
            size_bytes,
            read_only,
            content,
        } = request;
        let result = match content {
            PartitionContent::Writable => {
                self.install_writable(&name, size_bytes, read_only, &session.cancel, observer)
            }
            PartitionContent::Image { reader, encoding } => self.install_image(
                &name,
                size_bytes,
                read_only,
                reader,
                encoding,
                &session.cancel,
                observer,
            ),
        };

        match &result {
            Ok(PartitionOutcome::Installed(partition)) => {
                session.installed.push(partition.clone());
                session.state = SessionState::Started;
            }
            Ok(PartitionOutcome::Cancelled) => {
                tracing::info!(session = %session.id, partition = %name, "installation cancelled");
                session.state = SessionState::Cancelled;
            }
            Err(err) => {
                tracing::warn!(session = %session.id, partition = %name, error = %err, "partition failed");
                session.state = SessionState::Failed;
            }
        }
        result
    }

    pub fn finish(&self, session: &mut InstallationSession) -> Result<(), InstallError> {
        if session.state.is_terminal() {
            return Err(InstallError::SessionClosed(session.state));
        }
        if !self.service.finish_session() {
            session.state = SessionState::Failed;
            return Err(InstallError::FinishFailed);
        }
        session.state = SessionState::Finished;
        tracing::info!(session = %session.id, partitions = session.installed.len(), "installation finished");
        Ok(())
    }

    /// Throws away everything written in this session.
    pub fn discard(&self, session: &mut InstallationSession) -> Result<(), InstallError> {
        let discarded = self.service.discard_session();
        if session.state != SessionState::Failed {
            session.state = SessionState::Cancelled;
        }
        if !discarded {
            return Err(InstallError::DiscardFailed);
        }
        tracing::info!(session = %session.id, "installation discarded");
        Ok(())
    }

    fn install_writable(
        &self,
        name: &str,
        size_bytes: u64,
        read_only: bool,
        cancel: &CancellationToken,
        observer: &mut dyn InstallObserver,
    ) -> Result<PartitionOutcome, InstallError> {
        observer.on_step(&InstallationStep::CreatingPartition(name.to_string()));
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        let service = &self.service;

        let status = thread::scope(|scope| {
            let worker = scope.spawn(|| service.create_partition(name, size_bytes, read_only));
            let mut published = 0u64;
            while !worker.is_finished() && !cancel.is_cancelled() {
                thread::sleep(interval);
                let processed = service.bytes_processed();
                if processed.saturating_sub(published) >= self.config.min_progress_bytes {
                    observer.on_progress(&ProgressSample::new(name, processed, size_bytes));
                    published = processed;
                }
            }
            worker
                .join()
                .map_err(|payload| InstallError::Unexpected(panic_message(payload.as_ref())))
        })?;

        if !status.is_ok() {
            return Err(InstallError::CreatePartitionFailed {
                name: name.to_string(),
                status,
            });
        }
        observer.on_partition_created(name, size_bytes);
        if cancel.is_cancelled() {
            return Ok(PartitionOutcome::Cancelled);
        }

        observer.on_progress(&ProgressSample::new(name, size_bytes, size_bytes));
        if !self.service.close_partition() {
            return Err(InstallError::ClosePartitionFailed(name.to_string()));
        }
        tracing::info!(partition = name, size_bytes, "writable partition created");
        Ok(PartitionOutcome::Installed(InstalledPartition {
            name: name.to_string(),
            size_bytes,
            bytes_written: 0,
            read_only,
            sha256: None,
        }))
    }

    #[allow(clippy::too_many_arguments)]
    fn install_image(
        &self,
        name: &str,
        declared_size: u64,
        read_only: bool,
        reader: &mut dyn Read,
        encoding: ImageEncoding,
        cancel: &CancellationToken,
        observer: &mut dyn InstallObserver,
    ) -> Result<PartitionOutcome, InstallError> {
        let mut decoder = match encoding {
            ImageEncoding::Detect => {
                SparseDecoder::new(reader).map_err(|source| InstallError::SourceRead {
                    name: name.to_string(),
                    source,
                })?
            }
            ImageEncoding::Passthrough => SparseDecoder::passthrough(reader),
        };
        let logical_size = decoder.unsparsed_size().unwrap_or(declared_size);

        observer.on_step(&InstallationStep::CreatingPartition(name.to_string()));
        let status = self.service.create_partition(name, logical_size, read_only);
        if status != PartitionStatus::Ok {
            return Err(InstallError::CreatePartitionFailed {
                name: name.to_string(),
                status,
            });
        }
        observer.on_partition_created(name, logical_size);
        observer.on_step(&InstallationStep::InstallingPartition(name.to_string()));

        let mut channel = self
            .service
            .open_transfer_channel(self.config.transfer_buffer_bytes)
            .ok_or_else(|| InstallError::TransferChannelFailed(name.to_string()))?;
        let mut digest = self.config.record_digest.then(ImageDigest::new);
        let mut processed = 0u64;
        tracing::debug!(
            partition = name,
            logical_size,
            sparse = decoder.is_sparse(),
            buffer = channel.capacity(),
            "streaming partition"
        );

        loop {
            if cancel.is_cancelled() {
                return Ok(PartitionOutcome::Cancelled);
            }
            let read = channel
                .fill(&mut decoder)
                .map_err(|source| InstallError::Transfer {
                    name: name.to_string(),
                    source,
                })?;
            if read == 0 {
                break;
            }
            if let Some(digest) = digest.as_mut() {
                digest.update(channel.staged());
            }
            if !self.service.submit(&mut channel, read) {
                return Err(InstallError::SubmitFailed {
                    name: name.to_string(),
                    offset: processed,
                    bytes: read,
                });
            }
            if channel.is_pending() {
                return Err(InstallError::Transfer {
                    name: name.to_string(),
                    source: TransferError::Busy(channel.id()),
                });
            }
            processed += read as u64;
            observer.on_progress(&ProgressSample::new(name, processed, logical_size));
        }

        if processed != logical_size {
            return Err(InstallError::SizeMismatch {
                name: name.to_string(),
                expected: logical_size,
                actual: processed,
            });
        }
        if processed == 0 {
            observer.on_progress(&ProgressSample::new(name, 0, 0));
        }
        if !self.service.close_partition() {
            return Err(InstallError::ClosePartitionFailed(name.to_string()));
        }

        let sha256 = digest.map(ImageDigest::finalize_hex);
        tracing::info!(partition = name, bytes = processed, "partition installed");
        Ok(PartitionOutcome::Installed(InstalledPartition {
            name: name.to_string(),
            size_bytes: logical_size,
            bytes_written: processed,
            read_only,
            sha256,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, MockService, RecordingObserver};
    use crate::NullObserver;
    use dsu_core::config::DEFAULT_MIN_PROGRESS_BYTES;
    use dsu_imaging::SPARSE_HEADER_MAGIC;
    use std::io::{self, Cursor};

    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * MIB;

    fn config() -> InstallerConfig {
        InstallerConfig {
            poll_interval_ms: 1,
            min_progress_bytes: 1,
            ..InstallerConfig::default()
        }
    }

    #[test]
    fn refuses_when_running_or_installed() {
        let running = PartitionInstaller::new(MockService { in_use: true, ..Default::default() }, config());
        assert!(matches!(
            running.start(CancellationToken::new()),
            Err(InstallError::AlreadyRunningDynamicSystem)
        ));

        let installed =
            PartitionInstaller::new(MockService { installed: true, ..Default::default() }, config());
        assert!(matches!(
            installed.start(CancellationToken::new()),
            Err(InstallError::RequiresDiscard)
        ));

        let refused =
            PartitionInstaller::new(MockService { refuse_start: true, ..Default::default() }, config());
        assert!(matches!(
            refused.start(CancellationToken::new()),
            Err(InstallError::SessionStartFailed)
        ));
    }

    #[test]
    fn start_stops_consumer_and_uses_default_slot() {
        let installer = PartitionInstaller::new(MockService::default(), config());
        let session = installer.start(CancellationToken::new()).unwrap();
        assert_eq!(session.state(), SessionState::Started);
        assert_eq!(
            installer.service().calls(),
            vec![Call::ForceStop, Call::Start("dsu".to_string())]
        );
    }

    #[test]
    fn two_gib_raw_image_takes_4096_submits() {
        let installer = PartitionInstaller::new(
            MockService::default(),
            InstallerConfig {
                record_digest: false,
                ..config()
            },
        );
        let mut session = installer.start(CancellationToken::new()).unwrap();
        let mut source = io::repeat(0).take(2 * GIB);
        let mut observer = RecordingObserver::default();
        let outcome = installer
            .install_partition(
                &mut session,
                PartitionRequest::image("system", 2 * GIB, &mut source, ImageEncoding::Detect),
                &mut observer,
            )
            .unwrap();

        assert!(matches!(outcome, PartitionOutcome::Installed(_)));
        let service = installer.service();
        assert_eq!(service.submit_count(), 4096);
        assert_eq!(service.submitted_bytes("system"), 2 * GIB);
        let fractions = observer.fractions("system");
        assert!(fractions.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(fractions.last().copied(), Some(1.0));
        assert_eq!(session.partitions_installed()[0].bytes_written, 2 * GIB);
    }

    fn sparse_image() -> Vec<u8> {
        let block = 4096u32;
        let mut out = Vec::new();
        out.extend_from_slice(&SPARSE_HEADER_MAGIC.to_le_bytes());
        for value in [1u16, 0, 28, 12] {
            out.extend_from_slice(&value.to_le_bytes());
        }
        for value in [block, 300, 2, 0] {
            out.extend_from_slice(&value.to_le_bytes());
        }
        // 44 raw blocks, then 256 zero blocks.
        out.extend_from_slice(&0xcac1u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&44u32.to_le_bytes());
        out.extend_from_slice(&(12 + 44 * block).to_le_bytes());
        out.extend(std::iter::repeat(0x5a).take(44 * block as usize));
        out.extend_from_slice(&0xcac3u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&256u32.to_le_bytes());
        out.extend_from_slice(&12u32.to_le_bytes());
        out
    }

    #[test]
    fn sparse_image_submits_unsparsed_size() {
        let installer = PartitionInstaller::new(MockService::default(), config());
        let mut session = installer.start(CancellationToken::new()).unwrap();
        let image = sparse_image();
        let declared = image.len() as u64;
        let mut source = Cursor::new(image);
        let mut observer = RecordingObserver::default();
        installer
            .install_partition(
                &mut session,
                PartitionRequest::image("system", declared, &mut source, ImageEncoding::Detect),
                &mut observer,
            )
            .unwrap();

        let unsparsed = 300 * 4096;
        assert_eq!(installer.service().submitted_bytes("system"), unsparsed);
        assert!(installer
            .service()
            .calls()
            .contains(&Call::Create("system".to_string(), unsparsed, true)));
        assert_eq!(observer.fractions("system").last().copied(), Some(1.0));
        assert!(session.partitions_installed()[0].sha256.is_some());
    }

    #[test]
    fn passthrough_keeps_sparse_bytes() {
        let installer = PartitionInstaller::new(MockService::default(), config());
        let mut session = installer.start(CancellationToken::new()).unwrap();
        let image = sparse_image();
        let size = image.len() as u64;
        let mut source = Cursor::new(image);
        installer
            .install_partition(
                &mut session,
                PartitionRequest::image("system", size, &mut source, ImageEncoding::Passthrough),
                &mut NullObserver,
            )
            .unwrap();
        assert_eq!(installer.service().submitted_bytes("system"), size);
    }

    #[test]
    fn writable_partition_polls_progress() {
        let service = MockService {
            create_delay: Duration::from_millis(40),
            ..Default::default()
        };
        let installer = PartitionInstaller::new(service, config());
        let mut session = installer.start(CancellationToken::new()).unwrap();
        let mut observer = RecordingObserver::default();
        installer
            .install_partition(
                &mut session,
                PartitionRequest::writable("userdata", 8 * GIB),
                &mut observer,
            )
            .unwrap();

        let fractions = observer.fractions("userdata");
        assert!(fractions.len() >= 2);
        assert!(fractions.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(fractions.last().copied(), Some(1.0));
        assert_eq!(observer.created, vec![("userdata".to_string(), 8 * GIB)]);
        assert!(installer.service().calls().contains(&Call::Close));
    }

    #[test]
    fn writable_progress_waits_for_minimum_advance() {
        let service = MockService {
            create_delay: Duration::from_millis(25),
            create_steps: vec![64 * MIB, 100 * MIB, 200 * MIB, 300 * MIB, 320 * MIB],
            ..Default::default()
        };
        let installer = PartitionInstaller::new(
            service,
            InstallerConfig {
                poll_interval_ms: 1,
                ..InstallerConfig::default()
            },
        );
        assert_eq!(installer.config().min_progress_bytes, DEFAULT_MIN_PROGRESS_BYTES);
        let mut session = installer.start(CancellationToken::new()).unwrap();
        let mut observer = RecordingObserver::default();
        installer
            .install_partition(&mut session, PartitionRequest::writable("userdata", GIB), &mut observer)
            .unwrap();

        let intermediate: Vec<u64> = observer
            .samples
            .iter()
            .map(|sample| sample.bytes_processed)
            .filter(|bytes| *bytes < GIB)
            .collect();
        assert_eq!(intermediate, vec![200 * MIB]);
        let last = observer.samples.last().unwrap();
        assert_eq!((last.bytes_processed, last.total_bytes), (GIB, GIB));
    }

    #[test]
    fn cancel_during_writable_creation_skips_close() {
        let cancel = CancellationToken::new();
        let service = MockService {
            create_delay: Duration::from_millis(200),
            ..Default::default()
        };
        let installer = PartitionInstaller::new(service, config());
        let mut session = installer.start(cancel.clone()).unwrap();
        let trigger = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            trigger.cancel();
        });
        let mut observer = RecordingObserver::default();
        let outcome = installer
            .install_partition(
                &mut session,
                PartitionRequest::writable("userdata", 8 * GIB),
                &mut observer,
            )
            .unwrap();
        canceller.join().unwrap();

        assert_eq!(outcome, PartitionOutcome::Cancelled);
        assert_eq!(session.state(), SessionState::Cancelled);
        assert!(session.partitions_installed().is_empty());
        let calls = installer.service().calls();
        assert!(calls.contains(&Call::Create("userdata".to_string(), 8 * GIB, false)));
        assert!(!calls.contains(&Call::Close));
        assert!(!observer.fractions("userdata").contains(&1.0));
    }

    #[test]
    fn create_refusal_is_fatal() {
        let service = MockService::default().with_create_status("system", PartitionStatus::Generic);
        let installer = PartitionInstaller::new(service, config());
        let mut session = installer.start(CancellationToken::new()).unwrap();
        let mut source = Cursor::new(vec![0u8; 4096]);
        let err = installer
            .install_partition(
                &mut session,
                PartitionRequest::image("system", 4096, &mut source, ImageEncoding::Detect),
                &mut RecordingObserver::default(),
            )
            .unwrap_err();
        assert!(matches!(err, InstallError::CreatePartitionFailed { ref name, .. } if name == "system"));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(installer.service().submit_count(), 0);

        let mut more = Cursor::new(vec![0u8; 16]);
        assert!(matches!(
            installer.install_partition(
                &mut session,
                PartitionRequest::image("product", 16, &mut more, ImageEncoding::Detect),
                &mut RecordingObserver::default(),
            ),
            Err(InstallError::SessionClosed(SessionState::Failed))
        ));
    }

    #[test]
    fn rejected_submit_reports_offset() {
        let service = MockService {
            reject_submit_after: Some(2),
            ..Default::default()
        };
        let installer = PartitionInstaller::new(service, config());
        let mut session = installer.start(CancellationToken::new()).unwrap();
        let mut source = io::repeat(1).take(4 * 524_288);
        let err = installer
            .install_partition(
                &mut session,
                PartitionRequest::image("system", 4 * 524_288, &mut source, ImageEncoding::Detect),
                &mut RecordingObserver::default(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            InstallError::SubmitFailed { offset: 1_048_576, bytes: 524_288, .. }
        ));
        assert!(!installer.service().calls().contains(&Call::Close));
    }

    #[test]
    fn close_refusal_is_fatal() {
        let service = MockService {
            refuse_close: true,
            ..Default::default()
        };
        let installer = PartitionInstaller::new(service, config());
        let mut session = installer.start(CancellationToken::new()).unwrap();
        let mut source = Cursor::new(vec![0u8; 100]);
        let err = installer
            .install_partition(
                &mut session,
                PartitionRequest::image("system", 100, &mut source, ImageEncoding::Detect),
                &mut NullObserver,
            )
            .unwrap_err();
        assert!(matches!(err, InstallError::ClosePartitionFailed(ref name) if name == "system"));
    }

    #[test]
    fn short_source_is_a_size_mismatch() {
        let installer = PartitionInstaller::new(MockService::default(), config());
        let mut session = installer.start(CancellationToken::new()).unwrap();
        let mut source = Cursor::new(vec![0u8; 100]);
        let err = installer
            .install_partition(
                &mut session,
                PartitionRequest::image("system", 200, &mut source, ImageEncoding::Detect),
                &mut NullObserver,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            InstallError::SizeMismatch { expected: 200, actual: 100, .. }
        ));
    }

    #[test]
    fn cancel_stops_before_next_chunk_without_close() {
        let cancel = CancellationToken::new();
        let service = MockService {
            cancel_after_submits: Some((3, cancel.clone())),
            ..Default::default()
        };
        let installer = PartitionInstaller::new(service, config());
        let mut session = installer.start(cancel).unwrap();
        let mut source = io::repeat(0).take(10 * 524_288);
        let outcome = installer
            .install_partition(
                &mut session,
                PartitionRequest::image("system", 10 * 524_288, &mut source, ImageEncoding::Detect),
                &mut RecordingObserver::default(),
            )
            .unwrap();
        assert_eq!(outcome, PartitionOutcome::Cancelled);
        assert_eq!(session.state(), SessionState::Cancelled);
        assert_eq!(installer.service().submit_count(), 3);
        assert!(!installer.service().calls().contains(&Call::Close));
        assert!(matches!(
            installer.finish(&mut session),
            Err(InstallError::SessionClosed(SessionState::Cancelled))
        ));
    }

    #[test]
    fn cancel_before_partition_creates_nothing() {
        let installer = PartitionInstaller::new(MockService::default(), config());
        let mut session = installer.start(CancellationToken::new()).unwrap();
        session.cancel();
        let mut source = Cursor::new(vec![0u8; 10]);
        let outcome = installer
            .install_partition(
                &mut session,
                PartitionRequest::image("system", 10, &mut source, ImageEncoding::Detect),
                &mut RecordingObserver::default(),
            )
            .unwrap();
        assert_eq!(outcome, PartitionOutcome::Cancelled);
        assert!(installer
            .service()
            .calls()
            .iter()
            .all(|call| !matches!(call, Call::Create(..))));
    }

    #[test]
    fn finish_failure_is_reported() {
        let service = MockService {
            refuse_finish: true,
            ..Default::default()
        };
        let installer = PartitionInstaller::new(service, config());
        let mut session = installer.start(CancellationToken::new()).unwrap();
        assert!(matches!(installer.finish(&mut session), Err(InstallError::FinishFailed)));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn partitions_are_unique_per_session() {
        let installer = PartitionInstaller::new(MockService::default(), config());
        let mut session = installer.start(CancellationToken::new()).unwrap();
        let mut first = Cursor::new(vec![0u8; 8]);
        installer
            .install_partition(
                &mut session,
                PartitionRequest::image("system", 8, &mut first, ImageEncoding::Detect),
                &mut RecordingObserver::default(),
            )
            .unwrap();
        let mut second = Cursor::new(vec![0u8; 8]);
        let result = installer.install_partition(
            &mut session,
            PartitionRequest::image("system", 8, &mut second, ImageEncoding::Detect),
            &mut RecordingObserver::default(),
        );
        assert!(matches!(result, Err(InstallError::DuplicatePartition(ref name)) if name == "system"));
        assert_eq!(session.partitions_installed().len(), 1);
        assert_eq!(session.state(), SessionState::Failed);
    }
}
