use dsu_core::{ErrorType, ProgressSample};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::mpsc::Sender;

/// Every state an installation attempt reports through the step sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallationStep {
    NotInstalling,
    Processing,
    CreatingPartition(String),
    InstallingPartition(String),
    Finishing,
    Installed,
    Cancelled,
    ErrorAlreadyRunningDynamicSystem,
    ErrorRequiresDiscard,
    ErrorSessionStart,
    ErrorCreatePartition(String),
    ErrorNoAvailableStorage,
    ErrorFragmentedUserdata,
    ErrorSubmit(String),
    ErrorSource(String),
    ErrorClosePartition(String),
    ErrorFinish,
    ErrorDiscard,
    ErrorExternalSdcardAlloc,
    ErrorF2fsWrongPath,
    ErrorSelinux,
    ErrorClassified(ErrorType),
    Error,
}

impl InstallationStep {
    pub fn is_error(&self) -> bool {
        !matches!(
            self,
            InstallationStep::NotInstalling
                | InstallationStep::Processing
                | InstallationStep::CreatingPartition(_)
                | InstallationStep::InstallingPartition(_)
                | InstallationStep::Finishing
                | InstallationStep::Installed
                | InstallationStep::Cancelled
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.is_error() || matches!(self, InstallationStep::Installed | InstallationStep::Cancelled)
    }

    /// Step for a failure the log classifier found.
    pub fn for_classified(error_type: ErrorType) -> Self {
        match error_type {
            ErrorType::AlreadyRunningDynamicSystem => {
                InstallationStep::ErrorAlreadyRunningDynamicSystem
            }
            ErrorType::ExternalSdcardAlloc => InstallationStep::ErrorExternalSdcardAlloc,
            ErrorType::InsufficientStorage => InstallationStep::ErrorNoAvailableStorage,
            ErrorType::F2fsWrongPath => InstallationStep::ErrorF2fsWrongPath,
            ErrorType::SelinuxDenial => InstallationStep::ErrorSelinux,
            ErrorType::FragmentedUserdata => InstallationStep::ErrorFragmentedUserdata,
            other => InstallationStep::ErrorClassified(other),
        }
    }
}

impl fmt::Display for InstallationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallationStep::CreatingPartition(name) => write!(f, "creating_partition:{name}"),
            InstallationStep::InstallingPartition(name) => write!(f, "installing_partition:{name}"),
            InstallationStep::ErrorCreatePartition(name) => {
                write!(f, "error_create_partition:{name}")
            }
            InstallationStep::ErrorSubmit(name) => write!(f, "error_submit:{name}"),
            InstallationStep::ErrorSource(name) if name.is_empty() => f.write_str("error_source"),
            InstallationStep::ErrorSource(name) => write!(f, "error_source:{name}"),
            InstallationStep::ErrorClosePartition(name) => {
                write!(f, "error_close_partition:{name}")
            }
            InstallationStep::ErrorClassified(error_type) => {
                write!(f, "error_classified:{}", error_type.code())
            }
            other => {
                let name = match other {
                    InstallationStep::NotInstalling => "not_installing",
                    InstallationStep::Processing => "processing",
                    InstallationStep::Finishing => "finishing",
                    InstallationStep::Installed => "installed",
                    InstallationStep::Cancelled => "cancelled",
                    InstallationStep::ErrorAlreadyRunningDynamicSystem => {
                        "error_already_running_dynamic_system"
                    }
                    InstallationStep::ErrorRequiresDiscard => "error_requires_discard",
                    InstallationStep::ErrorSessionStart => "error_session_start",
                    InstallationStep::ErrorNoAvailableStorage => "error_no_available_storage",
                    InstallationStep::ErrorFragmentedUserdata => "error_fragmented_userdata",
                    InstallationStep::ErrorFinish => "error_finish",
                    InstallationStep::ErrorDiscard => "error_discard",
                    InstallationStep::ErrorExternalSdcardAlloc => "error_external_sdcard_alloc",
                    InstallationStep::ErrorF2fsWrongPath => "error_f2fs_wrong_path",
                    InstallationStep::ErrorSelinux => "error_selinux",
                    _ => "error",
                };
                f.write_str(name)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstallEvent {
    Progress { fraction: f64, partition: String },
    Step(InstallationStep),
    PartitionCreated { name: String, size_bytes: u64 },
    Error { step: InstallationStep, message: String },
}

/// Caller-side sinks. Callbacks fire on the thread doing the I/O.
pub trait InstallObserver {
    fn on_progress(&mut self, sample: &ProgressSample);
    fn on_step(&mut self, _step: &InstallationStep) {}
    fn on_partition_created(&mut self, _name: &str, _size_bytes: u64) {}
    fn on_error(&mut self, _step: &InstallationStep, _message: &str) {}
}

#[derive(Debug, Default)]
pub struct NullObserver;

impl InstallObserver for NullObserver {
    fn on_progress(&mut self, _sample: &ProgressSample) {}
}

/// Forwards every callback as an [`InstallEvent`]; a closed receiver is ignored.
impl InstallObserver for Sender<InstallEvent> {
    fn on_progress(&mut self, sample: &ProgressSample) {
        let _ = self.send(InstallEvent::Progress {
            fraction: sample.fraction(),
            partition: sample.partition.clone(),
        });
    }

    fn on_step(&mut self, step: &InstallationStep) {
        let _ = self.send(InstallEvent::Step(step.clone()));
    }

    fn on_partition_created(&mut self, name: &str, size_bytes: u64) {
        let _ = self.send(InstallEvent::PartitionCreated {
            name: name.to_string(),
            size_bytes,
        });
    }

    fn on_error(&mut self, step: &InstallationStep, message: &str) {
        let _ = self.send(InstallEvent::Error {
            step: step.clone(),
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn step_classes() {
        assert!(!InstallationStep::Processing.is_terminal());
        assert!(InstallationStep::Installed.is_terminal());
        assert!(!InstallationStep::Cancelled.is_error());
        assert!(InstallationStep::ErrorSubmit("system".to_string()).is_error());
        assert_eq!(
            InstallationStep::for_classified(ErrorType::ExternalSdcardAlloc),
            InstallationStep::ErrorExternalSdcardAlloc
        );
        assert_eq!(
            InstallationStep::for_classified(ErrorType::AvbVerification),
            InstallationStep::ErrorClassified(ErrorType::AvbVerification)
        );
    }

    #[test]
    fn display_names() {
        assert_eq!(
            InstallationStep::InstallingPartition("system".to_string()).to_string(),
            "installing_partition:system"
        );
        assert_eq!(InstallationStep::ErrorSelinux.to_string(), "error_selinux");
        assert_eq!(
            InstallationStep::ErrorClassified(ErrorType::BootLoop).to_string(),
            "error_classified:BOOT_LOOP"
        );
    }

    #[test]
    fn channel_observer_forwards_events() {
        let (tx, rx) = channel();
        let mut observer = tx;
        observer.on_progress(&ProgressSample::new("system", 50, 100));
        observer.on_step(&InstallationStep::Finishing);
        drop(observer);
        let events: Vec<InstallEvent> = rx.iter().collect();
        assert_eq!(
            events,
            vec![
                InstallEvent::Progress {
                    fraction: 0.5,
                    partition: "system".to_string()
                },
                InstallEvent::Step(InstallationStep::Finishing),
            ]
        );
    }
}
