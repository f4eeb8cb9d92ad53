use crate::events::InstallationStep;
use crate::service::PartitionStatus;
use dsu_content::ContentError;
use dsu_core::SessionState;
use dsu_imaging::TransferError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("a dynamic system is currently running")]
    AlreadyRunningDynamicSystem,
    #[error("a dynamic system is already installed; discard it first")]
    RequiresDiscard,
    #[error("the installation service refused to start a session")]
    SessionStartFailed,
    #[error("failed to create partition {name}: {status}")]
    CreatePartitionFailed { name: String, status: PartitionStatus },
    #[error("failed to open a transfer channel for {0}")]
    TransferChannelFailed(String),
    #[error("submit of {bytes} bytes at offset {offset} rejected for {name}")]
    SubmitFailed { name: String, offset: u64, bytes: usize },
    #[error("transfer failed for {name}: {source}")]
    Transfer {
        name: String,
        #[source]
        source: TransferError,
    },
    #[error("failed to read image for {name}: {source}")]
    SourceRead {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to complete partition {0}")]
    ClosePartitionFailed(String),
    #[error("{name}: submitted {actual} bytes, expected {expected}")]
    SizeMismatch { name: String, expected: u64, actual: u64 },
    #[error("partition {0} requested twice")]
    DuplicatePartition(String),
    #[error("no installable images in the request")]
    NoInstallableImages,
    #[error("the installation service could not commit the session")]
    FinishFailed,
    #[error("the installation service could not discard the session")]
    DiscardFailed,
    #[error("session is already {0:?}")]
    SessionClosed(SessionState),
    #[error(transparent)]
    Content(#[from] ContentError),
    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

impl InstallError {
    /// Partition the failure is attributed to, when there is one.
    pub fn partition(&self) -> Option<&str> {
        match self {
            InstallError::CreatePartitionFailed { name, .. }
            | InstallError::SubmitFailed { name, .. }
            | InstallError::Transfer { name, .. }
            | InstallError::SourceRead { name, .. }
            | InstallError::SizeMismatch { name, .. } => Some(name),
            InstallError::TransferChannelFailed(name)
            | InstallError::ClosePartitionFailed(name)
            | InstallError::DuplicatePartition(name) => Some(name),
            _ => None,
        }
    }

    /// Terminal step reported to the caller for this failure.
    pub fn step(&self) -> InstallationStep {
        match self {
            InstallError::AlreadyRunningDynamicSystem => {
                InstallationStep::ErrorAlreadyRunningDynamicSystem
            }
            InstallError::RequiresDiscard => InstallationStep::ErrorRequiresDiscard,
            InstallError::SessionStartFailed => InstallationStep::ErrorSessionStart,
            InstallError::CreatePartitionFailed { name, status } => match status {
                PartitionStatus::NoSpace => InstallationStep::ErrorNoAvailableStorage,
                PartitionStatus::FileSystemCluttered => InstallationStep::ErrorFragmentedUserdata,
                _ => InstallationStep::ErrorCreatePartition(name.clone()),
            },
            InstallError::DuplicatePartition(name) => {
                InstallationStep::ErrorCreatePartition(name.clone())
            }
            InstallError::TransferChannelFailed(name)
            | InstallError::SubmitFailed { name, .. }
            | InstallError::Transfer { name, .. }
            | InstallError::SizeMismatch { name, .. } => InstallationStep::ErrorSubmit(name.clone()),
            InstallError::SourceRead { name, .. } => InstallationStep::ErrorSource(name.clone()),
            InstallError::Content(_) | InstallError::NoInstallableImages => {
                InstallationStep::ErrorSource(String::new())
            }
            InstallError::ClosePartitionFailed(name) => {
                InstallationStep::ErrorClosePartition(name.clone())
            }
            InstallError::FinishFailed => InstallationStep::ErrorFinish,
            InstallError::DiscardFailed => InstallationStep::ErrorDiscard,
            InstallError::SessionClosed(_) | InstallError::Unexpected(_) => InstallationStep::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_statuses_map_to_specific_steps() {
        let no_space = InstallError::CreatePartitionFailed {
            name: "userdata".to_string(),
            status: PartitionStatus::NoSpace,
        };
        assert_eq!(no_space.step(), InstallationStep::ErrorNoAvailableStorage);
        assert_eq!(no_space.partition(), Some("userdata"));

        let cluttered = InstallError::CreatePartitionFailed {
            name: "userdata".to_string(),
            status: PartitionStatus::FileSystemCluttered,
        };
        assert_eq!(cluttered.step(), InstallationStep::ErrorFragmentedUserdata);

        let generic = InstallError::CreatePartitionFailed {
            name: "system".to_string(),
            status: PartitionStatus::Generic,
        };
        assert_eq!(
            generic.step(),
            InstallationStep::ErrorCreatePartition("system".to_string())
        );
    }

    #[test]
    fn messages_name_the_partition() {
        let err = InstallError::SubmitFailed {
            name: "product".to_string(),
            offset: 1024,
            bytes: 512,
        };
        assert!(err.to_string().contains("product"));
        assert_eq!(err.step(), InstallationStep::ErrorSubmit("product".to_string()));
        assert_eq!(InstallError::FinishFailed.partition(), None);
    }
}
