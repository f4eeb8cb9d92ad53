//! Failure signatures. All needles are lowercase and matched as substrings
//! of lowercased log text.

use dsu_core::{AnalysisSeverity, ErrorType};

#[derive(Debug, Clone, Copy)]
pub struct FailurePattern {
    pub needle: &'static str,
    pub cause: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct PatternCategory {
    pub error_type: ErrorType,
    pub severity: AnalysisSeverity,
    pub recoverable: bool,
    pub patterns: &'static [FailurePattern],
}

impl PatternCategory {
    pub fn matches_line(&self, lower_line: &str) -> bool {
        self.patterns
            .iter()
            .any(|pattern| lower_line.contains(pattern.needle))
    }
}

const fn pattern(needle: &'static str, cause: &'static str) -> FailurePattern {
    FailurePattern { needle, cause }
}

const AVB_PATTERNS: &[FailurePattern] = &[
    pattern("avb_slot_verify", "Verified boot rejected a partition of the dynamic system"),
    pattern("verification failed", "Image signature verification failed"),
    pattern("vbmeta", "vbmeta of the GSI does not match the device's verified boot state"),
    pattern("dm-verity", "dm-verity detected corrupted or unsigned blocks"),
    pattern("verified boot", "Verified boot is enforcing while the bootloader is locked"),
    pattern("libavb", "libavb refused the image"),
];

const BOOT_PATTERNS: &[FailurePattern] = &[
    pattern("kernel panic", "The kernel panicked while booting the dynamic system"),
    pattern("watchdog reset", "A hardware watchdog reset the device during boot"),
    pattern("init: critical process", "A critical init service crashed repeatedly"),
    pattern(
        "failed to mount required partitions early",
        "First stage init could not mount the GSI partitions",
    ),
    pattern("boot failed", "The dynamic system did not finish booting"),
];

const PARTITION_PATTERNS: &[FailurePattern] = &[
    pattern("failed to create partition", "A dynamic partition could not be allocated"),
    pattern("lp_metadata", "Logical partition metadata is invalid"),
    pattern("liblp", "liblp reported a dynamic partition metadata error"),
    pattern("super partition", "The super partition layout does not fit the GSI"),
    pattern("invalid slot", "An invalid boot slot was selected"),
    pattern("slot suffix", "The slot suffix of the GSI does not match the device"),
];

const COMPATIBILITY_PATTERNS: &[FailurePattern] = &[
    pattern("vndk", "VNDK version of the GSI does not match the vendor partition"),
    pattern("vintf", "VINTF compatibility check between system and vendor failed"),
    pattern("vendor interface", "The vendor interface is older than the GSI requires"),
    pattern("incompatible", "The GSI reported an incompatible component"),
    pattern("unsupported abi", "The GSI was built for a different CPU architecture"),
    pattern("kernel version", "The device kernel is too old for this GSI"),
    pattern("treble", "The device is not fully Treble compliant"),
];

const SYSTEM_PATTERNS: &[FailurePattern] = &[
    pattern("fatal exception in system process", "system_server crashed"),
    pattern("fatal exception", "A framework process crashed with a fatal exception"),
    pattern("zygote died", "Zygote died and took the framework with it"),
    pattern("servicemanager died", "servicemanager died"),
    pattern("surfaceflinger died", "SurfaceFlinger died"),
    pattern("anr in", "A core process stopped responding"),
];

/// Checked in this order; the first category with any match wins.
pub const CATEGORIES: &[PatternCategory] = &[
    PatternCategory {
        error_type: ErrorType::AvbVerification,
        severity: AnalysisSeverity::Critical,
        recoverable: false,
        patterns: AVB_PATTERNS,
    },
    PatternCategory {
        error_type: ErrorType::BootFailure,
        severity: AnalysisSeverity::Error,
        recoverable: false,
        patterns: BOOT_PATTERNS,
    },
    PatternCategory {
        error_type: ErrorType::PartitionFailure,
        severity: AnalysisSeverity::Error,
        recoverable: false,
        patterns: PARTITION_PATTERNS,
    },
    PatternCategory {
        error_type: ErrorType::Compatibility,
        severity: AnalysisSeverity::Error,
        recoverable: true,
        patterns: COMPATIBILITY_PATTERNS,
    },
    PatternCategory {
        error_type: ErrorType::SystemFailure,
        severity: AnalysisSeverity::Error,
        recoverable: false,
        patterns: SYSTEM_PATTERNS,
    },
];

pub const REBOOT_SIGNALS: &[&str] = &[
    "rebooting",
    "sys.powerctl=reboot",
    "restarting system",
    "reboot: restarting",
];

pub fn is_reboot_signal(lower_line: &str) -> bool {
    REBOOT_SIGNALS
        .iter()
        .any(|signal| lower_line.contains(signal))
}

pub fn matches_any_category(lower_line: &str) -> bool {
    CATEGORIES
        .iter()
        .any(|category| category.matches_line(lower_line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needles_are_lowercase() {
        for category in CATEGORIES {
            for pattern in category.patterns {
                assert_eq!(pattern.needle, pattern.needle.to_lowercase());
            }
        }
        for signal in REBOOT_SIGNALS {
            assert_eq!(*signal, signal.to_lowercase());
        }
    }

    #[test]
    fn category_order_is_fixed() {
        let order: Vec<ErrorType> = CATEGORIES.iter().map(|c| c.error_type).collect();
        assert_eq!(
            order,
            vec![
                ErrorType::AvbVerification,
                ErrorType::BootFailure,
                ErrorType::PartitionFailure,
                ErrorType::Compatibility,
                ErrorType::SystemFailure,
            ]
        );
    }

    #[test]
    fn reboot_signals() {
        assert!(is_reboot_signal("i/init: sys.powerctl=reboot,recovery"));
        assert!(is_reboot_signal("[ 12.0] reboot: restarting system"));
        assert!(!is_reboot_signal("i/init: boot completed"));
    }
}
