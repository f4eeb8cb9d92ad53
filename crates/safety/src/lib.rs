use uuid::Uuid;

/// Partitions a dynamic system image must never provide.
///
/// These belong to the running device (boot chain, verified boot metadata,
/// recovery) or are managed by the installer itself (`userdata`, `scratch`).
pub const PARTITION_DENYLIST: &[&str] = &[
    "boot",
    "vbmeta",
    "dtbo",
    "userdata",
    "scratch",
    "super_empty",
    "system_other",
    "vendor_boot",
    "init_boot",
    "recovery",
    "vbmeta_system",
    "vbmeta_vendor",
];

#[derive(Debug, Clone)]
pub struct SafetyContext {
    pub force_mode: bool,
    pub confirmation_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyDecision {
    Allow,
    Deny(String),
}

impl SafetyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, SafetyDecision::Allow)
    }
}

pub fn is_denylisted(partition: &str) -> bool {
    PARTITION_DENYLIST.contains(&partition)
}

pub fn can_install_partition(partition: &str) -> SafetyDecision {
    if partition.trim().is_empty() {
        return SafetyDecision::Deny("Denied: empty partition name".to_string());
    }
    if is_denylisted(partition) {
        return SafetyDecision::Deny(format!(
            "Denied: {partition} is reserved by the device"
        ));
    }
    SafetyDecision::Allow
}

pub fn require_confirmation_token() -> String {
    format!("DSU-{}", Uuid::new_v4())
}

/// Wiping an existing dynamic system requires force-mode and a token.
pub fn can_discard_installation(ctx: &SafetyContext) -> SafetyDecision {
    if !ctx.force_mode {
        return SafetyDecision::Deny(
            "Denied: discarding an installed system requires force-mode".to_string(),
        );
    }

    let Some(token) = &ctx.confirmation_token else {
        return SafetyDecision::Deny("Denied: confirmation token missing".to_string());
    };
    if !token.starts_with("DSU-") {
        return SafetyDecision::Deny("Denied: invalid confirmation token".to_string());
    }

    SafetyDecision::Allow
}
