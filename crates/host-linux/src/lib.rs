use anyhow::{anyhow, Context, Result};
use dsu_core::DeviceInfo;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::process::Command;

mod image_dir;

pub use image_dir::ImageDirService;

/// Device facts from `getprop` plus the running kernel release.
pub fn collect_device_info() -> Result<DeviceInfo> {
    let output = Command::new("getprop")
        .output()
        .context("run getprop")?;
    if !output.status.success() {
        return Err(anyhow!("getprop exited with {}", output.status));
    }
    let props = parse_getprop(&String::from_utf8_lossy(&output.stdout));
    Ok(device_info_from_props(&props, read_kernel_release()))
}

/// Parses `[key]: [value]` lines. Malformed lines are skipped.
pub fn parse_getprop(text: &str) -> HashMap<String, String> {
    let mut props = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('[') else {
            continue;
        };
        let Some((key, value)) = rest.split_once("]: [") else {
            continue;
        };
        let Some(value) = value.strip_suffix(']') else {
            continue;
        };
        props.insert(key.to_string(), value.to_string());
    }
    props
}

pub fn device_info_from_props(
    props: &HashMap<String, String>,
    kernel_version: Option<String>,
) -> DeviceInfo {
    let defaults = DeviceInfo::default();
    let prop = |key: &str| {
        props
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    let supported_abis = prop("ro.product.cpu.abilist")
        .or_else(|| prop("ro.product.cpu.abi"))
        .map(|list| {
            list.split(',')
                .map(|abi| abi.trim().to_string())
                .filter(|abi| !abi.is_empty())
                .collect()
        })
        .unwrap_or_default();

    DeviceInfo {
        manufacturer: prop("ro.product.manufacturer").unwrap_or(defaults.manufacturer),
        model: prop("ro.product.model").unwrap_or(defaults.model),
        android_version: prop("ro.build.version.release").unwrap_or(defaults.android_version),
        sdk_level: prop("ro.build.version.sdk")
            .and_then(|sdk| sdk.parse().ok())
            .unwrap_or(0),
        supported_abis,
        kernel_version,
        slot_suffix: prop("ro.boot.slot_suffix"),
    }
}

fn read_kernel_release() -> Option<String> {
    read_string("/proc/sys/kernel/osrelease").filter(|value| !value.is_empty())
}

fn read_string(path: impl AsRef<Path>) -> Option<String> {
    fs::read_to_string(path).ok().map(|value| value.trim().to_string())
}
