use dsu_core::{DeviceInfo, ErrorAnalysis, ErrorType, GsiInfo};

/// Android ABI names a GSI architecture runs on.
fn abis_for_architecture(architecture: &str) -> &'static [&'static str] {
    match architecture {
        "arm64" => &["arm64-v8a"],
        "arm" => &["armeabi-v7a", "armeabi"],
        "x86_64" => &["x86_64"],
        "x86" => &["x86"],
        _ => &[],
    }
}

/// `None` when either side is unknown.
pub fn architecture_mismatch(device: &DeviceInfo, gsi: Option<&GsiInfo>) -> Option<String> {
    let architecture = gsi?.architecture.as_deref()?;
    let wanted = abis_for_architecture(architecture);
    if wanted.is_empty() || device.supported_abis.is_empty() {
        return None;
    }
    let supported = device
        .supported_abis
        .iter()
        .any(|abi| wanted.contains(&abi.as_str()));
    if supported {
        return None;
    }
    Some(format!(
        "Warning: the GSI is built for {architecture} but this device supports {}. Download a GSI that matches the device architecture.",
        device.supported_abis.join(", ")
    ))
}

fn remediation(error_type: ErrorType) -> &'static [&'static str] {
    match error_type {
        ErrorType::AvbVerification => &[
            "Unlock the bootloader, or flash a vbmeta image with verification disabled.",
            "Use a GSI signed with keys the device trusts.",
        ],
        ErrorType::BootFailure => &[
            "Reboot to return to the original system, then try a different GSI build.",
            "Check that the device kernel supports the GSI's Android version.",
        ],
        ErrorType::PartitionFailure => &[
            "Discard the existing dynamic system and retry the installation.",
            "Make sure the device uses dynamic partitions and the GSI fits the super layout.",
        ],
        ErrorType::Compatibility => &[
            "Pick a GSI whose Android version matches the vendor partition's VNDK version.",
            "Update the device firmware before installing newer GSIs.",
        ],
        ErrorType::SystemFailure => &[
            "Wipe the dynamic system's userdata and boot it again.",
            "Try a GSI variant without bundled apps (vanilla).",
        ],
        ErrorType::BootLoop => &[
            "Hold power to reboot into the original system; the dynamic system is disabled after a failed boot.",
            "Discard the dynamic system and try a different GSI.",
        ],
        ErrorType::AlreadyRunningDynamicSystem => &[
            "Reboot into the original system before starting a new installation.",
        ],
        ErrorType::ExternalSdcardAlloc => &[
            "Enable the \"unmount SD\" option so the image is allocated on internal storage.",
            "Alternatively remove the SD card before installing.",
        ],
        ErrorType::InsufficientStorage => &[
            "Free up internal storage, or reduce the userdata size of the dynamic system.",
        ],
        ErrorType::F2fsWrongPath => &[
            "Install the image to internal storage; the backing file must live on the f2fs userdata mount.",
        ],
        ErrorType::SelinuxDenial => &[
            "The platform policy blocks this installation; use a build where the DSU feature is enabled.",
        ],
        ErrorType::FragmentedUserdata => &[
            "Free up storage and reboot so the file system can compact, then retry.",
        ],
        ErrorType::InstallerStatus => &[
            "Check the network connection or the image location, then retry the installation.",
        ],
        ErrorType::InstallationFailure => &[
            "Retry the installation; if it fails again, attach the report when asking for help.",
        ],
        ErrorType::Unknown => &["Attach the report when asking for help."],
    }
}

/// Remediation list for the final outcome.
///
/// An architecture mismatch comes first, then the minimum-SDK notice, then
/// the entries for the error category (or the success hints).
pub fn generate_suggestions(
    analysis: Option<&ErrorAnalysis>,
    device: &DeviceInfo,
    gsi: Option<&GsiInfo>,
    min_supported_sdk: u32,
) -> Vec<String> {
    let mut suggestions = Vec::new();
    if let Some(warning) = architecture_mismatch(device, gsi) {
        suggestions.push(warning);
    }
    if device.sdk_level != 0 && device.sdk_level == min_supported_sdk {
        suggestions.push(
            "Android 10 has limited dynamic system support; some GSIs may fail to install or boot."
                .to_string(),
        );
    }
    match analysis {
        Some(analysis) => suggestions.extend(
            remediation(analysis.error_type)
                .iter()
                .map(|line| line.to_string()),
        ),
        None => suggestions.push(
            "Reboot to start the dynamic system; reboot again to return to the original system."
                .to_string(),
        ),
    }
    suggestions
}
