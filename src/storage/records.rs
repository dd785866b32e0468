use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub const ONGOING_FORMAT_VERSION: u32 = 1;
pub(crate) const ONGOING_PREFIX: &str = "v1:ongoing:";
pub(crate) const PERMISSION_PREFIX: &str = "v1:cfg:";

/// Persisted form of an in-flight ongoing request.
///
/// `envelope` holds the MessagePack payload of the original request so recovery can re-decode it
/// with the same codec the transport uses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OngoingRecord {
    pub format_version: u32,
    pub client_address: String,
    pub persisted_at: String,
    pub envelope: Vec<u8>,
}

impl OngoingRecord {
    pub fn new(client_address: impl Into<String>, envelope: Vec<u8>) -> Self {
        Self {
            format_version: ONGOING_FORMAT_VERSION,
            client_address: client_address.into(),
            persisted_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            envelope,
        }
    }
}

/// One item of an ongoing-store snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OngoingEntry {
    Valid(OngoingRecord),
    Corrupt { client_address: String, reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionDecision {
    Allow,
    Deny,
}

impl PermissionDecision {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "allow" => Some(Self::Allow),
            "deny" => Some(Self::Deny),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

/// Remembered arbiter decision for one (sender, operation) pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRecord {
    pub sender: String,
    pub operation: String,
    pub decision: PermissionDecision,
    pub updated_at: String,
}

impl PermissionRecord {
    pub fn new(
        sender: impl Into<String>,
        operation: impl Into<String>,
        decision: PermissionDecision,
    ) -> Self {
        Self {
            sender: sender.into(),
            operation: operation.into(),
            decision,
            updated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

pub(crate) fn ongoing_key(client_address: &str) -> String {
    format!("{ONGOING_PREFIX}{client_address}")
}

// Sender identities are package-like names and never contain '/'.
pub(crate) fn permission_app_prefix(sender: &str) -> String {
    format!("{PERMISSION_PREFIX}{sender}/")
}

pub(crate) fn permission_key(sender: &str, operation: &str) -> String {
    format!("{}{operation}", permission_app_prefix(sender))
}

pub(crate) fn decode_ongoing_entry(key: &[u8], value: &[u8]) -> OngoingEntry {
    let key = String::from_utf8_lossy(key);
    let client_address = key.strip_prefix(ONGOING_PREFIX).unwrap_or(&key).to_owned();

    match serde_json::from_slice::<OngoingRecord>(value) {
        Ok(record) if record.format_version != ONGOING_FORMAT_VERSION => OngoingEntry::Corrupt {
            client_address,
            reason: format!("unsupported format_version {}", record.format_version),
        },
        Ok(record) if record.client_address != client_address => OngoingEntry::Corrupt {
            client_address,
            reason: format!(
                "record address '{}' does not match its key",
                record.client_address
            ),
        },
        Ok(record) => OngoingEntry::Valid(record),
        Err(error) => OngoingEntry::Corrupt {
            client_address,
            reason: error.to_string(),
        },
    }
}
