use crate::error::InstallError;
use crate::events::{InstallObserver, InstallationStep};
use crate::installer::{
    ImageEncoding, InstallationSession, PartitionInstaller, PartitionOutcome, PartitionRequest,
};
use crate::service::PrivilegedService;
use dsu_content::{open_byte_source, stream_package_images, Visit};
use dsu_core::{
    CancellationToken, InstallOutcome, InstalledPartition, InstallationRequest, PartitionSource,
    SourceKind, USERDATA_PARTITION,
};
use dsu_safety::{can_install_partition, SafetyDecision};
use uuid::Uuid;

/// Partitions admitted into one session, in install order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    admitted: Vec<String>,
    skipped: Vec<String>,
}

impl Default for PartitionPlan {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionPlan {
    /// `userdata` is always first.
    pub fn new() -> Self {
        Self {
            admitted: vec![USERDATA_PARTITION.to_string()],
            skipped: Vec::new(),
        }
    }

    /// Builds a plan from a known list of names, failing on duplicates.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Self, InstallError> {
        let mut plan = Self::new();
        for name in names {
            plan.admit(name)?;
        }
        Ok(plan)
    }

    /// Returns `false` for denylisted names, which are skipped without error.
    pub fn admit(&mut self, name: &str) -> Result<bool, InstallError> {
        if let SafetyDecision::Deny(reason) = can_install_partition(name) {
            tracing::info!(partition = name, reason = %reason, "skipping partition");
            self.skipped.push(name.to_string());
            return Ok(false);
        }
        if self.admitted.iter().any(|admitted| admitted == name) {
            return Err(InstallError::DuplicatePartition(name.to_string()));
        }
        self.admitted.push(name.to_string());
        Ok(true)
    }

    pub fn admitted(&self) -> &[String] {
        &self.admitted
    }

    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    pub fn image_count(&self) -> usize {
        self.admitted.len() - 1
    }
}

/// What one resolver run produced. `outcome` carries the failure, if any;
/// the rest describes how far the session got.
#[derive(Debug)]
pub struct InstallationSummary {
    pub session_id: Option<Uuid>,
    pub partitions: Vec<InstalledPartition>,
    pub skipped: Vec<String>,
    pub outcome: Result<InstallOutcome, InstallError>,
}

enum Flow {
    Completed,
    Cancelled,
}

pub struct ImageSourceResolver<S> {
    installer: PartitionInstaller<S>,
}

impl<S: PrivilegedService> ImageSourceResolver<S> {
    pub fn new(installer: PartitionInstaller<S>) -> Self {
        Self { installer }
    }

    pub fn installer(&self) -> &PartitionInstaller<S> {
        &self.installer
    }

    /// Installs everything the request names, then commits the session.
    /// A cancelled session is always discarded.
    pub fn run(
        &self,
        request: InstallationRequest,
        cancel: &CancellationToken,
        observer: &mut dyn InstallObserver,
    ) -> InstallationSummary {
        let mut plan = PartitionPlan::new();
        let mut session = match self.installer.start(cancel.clone()) {
            Ok(session) => session,
            Err(err) => {
                return InstallationSummary {
                    session_id: None,
                    partitions: Vec::new(),
                    skipped: Vec::new(),
                    outcome: Err(err),
                }
            }
        };
        tracing::info!(
            session = %session.id(),
            kind = request.source_kind.as_str(),
            entries = request.entries.len(),
            "resolving installation request"
        );

        let flow = self.install_all(&mut session, request, &mut plan, observer);
        let outcome = match flow {
            Ok(Flow::Completed) if cancel.is_cancelled() => self.discard(&mut session),
            Ok(Flow::Completed) => {
                observer.on_step(&InstallationStep::Finishing);
                self.installer
                    .finish(&mut session)
                    .map(|_| InstallOutcome::Finished)
            }
            Ok(Flow::Cancelled) => self.discard(&mut session),
            Err(err) => Err(err),
        };

        InstallationSummary {
            session_id: Some(session.id()),
            skipped: plan.skipped().to_vec(),
            partitions: session.into_partitions(),
            outcome,
        }
    }

    fn discard(&self, session: &mut InstallationSession) -> Result<InstallOutcome, InstallError> {
        self.installer
            .discard(session)
            .map(|_| InstallOutcome::Cancelled)
    }

    fn install_all(
        &self,
        session: &mut InstallationSession,
        request: InstallationRequest,
        plan: &mut PartitionPlan,
        observer: &mut dyn InstallObserver,
    ) -> Result<Flow, InstallError> {
        let InstallationRequest {
            source_kind,
            entries,
            userdata_size_bytes,
        } = request;

        let userdata = PartitionRequest::writable(USERDATA_PARTITION, userdata_size_bytes);
        if self.installer.install_partition(session, userdata, observer)? == PartitionOutcome::Cancelled {
            return Ok(Flow::Cancelled);
        }

        match source_kind {
            SourceKind::SingleImage | SourceKind::MultiImage => {
                self.install_images(session, entries, plan, observer)
            }
            SourceKind::Package | SourceKind::RemotePackage => {
                self.install_packages(session, entries, plan, observer)
            }
        }
    }

    fn install_images(
        &self,
        session: &mut InstallationSession,
        entries: Vec<PartitionSource>,
        plan: &mut PartitionPlan,
        observer: &mut dyn InstallObserver,
    ) -> Result<Flow, InstallError> {
        let mut admitted = Vec::with_capacity(entries.len());
        for entry in entries {
            if plan.admit(&entry.name)? {
                admitted.push(entry);
            }
        }
        if admitted.is_empty() {
            return Err(InstallError::NoInstallableImages);
        }

        for entry in admitted {
            if session.cancel_requested() {
                return Ok(Flow::Cancelled);
            }
            let PartitionSource {
                name,
                declared_size_bytes,
                byte_source,
            } = entry;
            let mut reader = open_byte_source(byte_source)?;
            let request = PartitionRequest::image(
                name,
                declared_size_bytes,
                &mut *reader,
                ImageEncoding::Detect,
            );
            if self.installer.install_partition(session, request, observer)?
                == PartitionOutcome::Cancelled
            {
                return Ok(Flow::Cancelled);
            }
        }
        Ok(Flow::Completed)
    }

    fn install_packages(
        &self,
        session: &mut InstallationSession,
        entries: Vec<PartitionSource>,
        plan: &mut PartitionPlan,
        observer: &mut dyn InstallObserver,
    ) -> Result<Flow, InstallError> {
        for entry in entries {
            if session.cancel_requested() {
                return Ok(Flow::Cancelled);
            }
            tracing::info!(package = %entry.byte_source.describe(), "streaming package");
            let mut reader = open_byte_source(entry.byte_source)?;
            let mut cancelled = false;
            stream_package_images::<_, InstallError, _>(&mut reader, |image| {
                if !plan.admit(&image.partition)? {
                    return Ok(Visit::Continue);
                }
                let request = PartitionRequest::image(
                    image.partition,
                    image.size,
                    image.reader,
                    ImageEncoding::Passthrough,
                );
                match self.installer.install_partition(session, request, observer)? {
                    PartitionOutcome::Installed(_) => Ok(Visit::Continue),
                    PartitionOutcome::Cancelled => {
                        cancelled = true;
                        Ok(Visit::Stop)
                    }
                }
            })?;
            if cancelled {
                return Ok(Flow::Cancelled);
            }
        }
        if plan.image_count() == 0 {
            return Err(InstallError::NoInstallableImages);
        }
        Ok(Flow::Completed)
    }
}
