//! Streams GSI partitions into a dynamic system slot through the privileged
//! installation service.

use std::any::Any;

mod error;
mod events;
mod installer;
mod resolver;
mod service;

#[cfg(test)]
mod testing;

pub use error::InstallError;
pub use events::{InstallEvent, InstallObserver, InstallationStep, NullObserver};
pub use installer::{
    ImageEncoding, InstallationSession, PartitionContent, PartitionInstaller, PartitionOutcome,
    PartitionRequest,
};
pub use resolver::{ImageSourceResolver, InstallationSummary, PartitionPlan};
pub use service::{PartitionStatus, PrivilegedService};

/// Text carried by a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}
