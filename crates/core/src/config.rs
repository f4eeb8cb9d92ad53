use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_SLOT: &str = "dsu";
pub const DEFAULT_TRANSFER_BUFFER_BYTES: usize = 512 * 1024;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_MIN_PROGRESS_BYTES: u64 = 128 * 1024 * 1024;

/// Android 10 (API 29) is the first release shipping Dynamic System Updates.
pub const MIN_SUPPORTED_SDK: u32 = 29;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DsuConfig {
    pub installer: InstallerConfig,
    pub diagnostics: DiagnosticsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    pub slot: String,
    pub transfer_buffer_bytes: usize,
    pub poll_interval_ms: u64,
    pub min_progress_bytes: u64,
    pub record_digest: bool,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            slot: DEFAULT_SLOT.to_string(),
            transfer_buffer_bytes: DEFAULT_TRANSFER_BUFFER_BYTES,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            min_progress_bytes: DEFAULT_MIN_PROGRESS_BYTES,
            record_digest: true,
        }
    }
}

impl InstallerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.slot.trim().is_empty() {
            return Err(anyhow!("installer.slot must not be empty"));
        }
        if self.transfer_buffer_bytes == 0 {
            return Err(anyhow!("installer.transfer_buffer_bytes must be > 0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("installer.poll_interval_ms must be > 0"));
        }
        if self.min_progress_bytes == 0 {
            return Err(anyhow!("installer.min_progress_bytes must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub report_log_window: usize,
    pub excerpt_limit: usize,
    pub boot_loop_threshold: u32,
    pub min_supported_sdk: u32,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            report_log_window: 50,
            excerpt_limit: 10,
            boot_loop_threshold: 2,
            min_supported_sdk: MIN_SUPPORTED_SDK,
        }
    }
}

impl DiagnosticsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.report_log_window == 0 {
            return Err(anyhow!("diagnostics.report_log_window must be > 0"));
        }
        if self.excerpt_limit == 0 {
            return Err(anyhow!("diagnostics.excerpt_limit must be > 0"));
        }
        if self.boot_loop_threshold == 0 {
            return Err(anyhow!("diagnostics.boot_loop_threshold must be > 0"));
        }
        Ok(())
    }
}

impl DsuConfig {
    pub fn validate(&self) -> Result<()> {
        self.installer.validate()?;
        self.diagnostics.validate()
    }
}

pub fn load_config(path: impl AsRef<Path>) -> Result<DsuConfig> {
    let path = path.as_ref();
    let data =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let config: DsuConfig =
        serde_json::from_str(&data).with_context(|| format!("parse {}", path.display()))?;
    config.validate()?;
    Ok(config)
}
