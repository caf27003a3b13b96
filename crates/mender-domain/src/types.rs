use serde::{Deserialize, Serialize};

use crate::error::DomainError;

// ── Identifiers / newtypes ───────────────────────────────────────────────────

/// Opaque bearer token handed out by the deployment service on successful
/// authentication. Stored verbatim, never parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken(pub String);

impl SessionToken {
    pub fn new(s: impl Into<String>) -> Self {
        SessionToken(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The name of the artifact currently installed, or "unknown" before the
/// first successful deployment. Process-wide, but owned by whichever code
/// constructs the agent rather than a static — see the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactName(pub String);

impl ArtifactName {
    pub fn unknown() -> Self {
        ArtifactName("unknown".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single device identity attribute (e.g. `mac`, `serial`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub value: String,
}

// ── ClientConfig ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub device_type: String,
    pub host: String,
    pub tenant_token: Option<String>,
    /// Seconds between authentication attempts while unauthenticated.
    pub auth_poll_interval: i64,
    /// Seconds between deployment checks. Negative disables periodic polling
    /// (the work unit still runs on an explicit trigger).
    pub update_poll_interval: i64,
    /// Seconds between inventory submissions (only consulted when the
    /// `inventory` feature is enabled).
    pub inventory_poll_interval: i64,
    /// Whether to allow re-commissioning (re-authenticating with a fresh
    /// identity) after the device has already been accepted once.
    pub recommissioning: bool,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.device_type.trim().is_empty() {
            return Err(DomainError::InvalidConfig("device_type must not be empty".into()));
        }
        if self.host.trim().is_empty() {
            return Err(DomainError::InvalidConfig("host must not be empty".into()));
        }
        Ok(())
    }
}

// ── Deployment descriptor ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentDescriptor {
    pub id: String,
    pub artifact_name: String,
    pub uri: String,
    pub device_types_compatible: Vec<String>,
}

// ── DeploymentStatus ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentStatus {
    Downloading,
    Installing,
    Rebooting,
    Success,
    Failure,
    AlreadyInstalled,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Downloading => "downloading",
            DeploymentStatus::Installing => "installing",
            DeploymentStatus::Rebooting => "rebooting",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failure => "failure",
            DeploymentStatus::AlreadyInstalled => "already-installed",
        }
    }

    /// Terminal statuses close out a deployment; no further status may be
    /// reported for the same deployment id afterwards.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Success | DeploymentStatus::Failure | DeploymentStatus::AlreadyInstalled
        )
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── DeploymentState (persisted) ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentState {
    pub id: String,
    pub artifact_name: String,
    pub last_reported_status: Option<DeploymentStatus>,
    #[serde(default)]
    pub payload_state: std::collections::HashMap<String, serde_json::Value>,
    /// Provides entries the artifact advertised, staged here across the
    /// reboot boundary so they can be merged into the persisted provides
    /// set only once the commit that follows reboot actually succeeds
    /// (§4.3 "new artifact_provides are persisted only after a successful
    /// commit").
    #[serde(default)]
    pub pending_provides: std::collections::HashMap<String, String>,
}

impl DeploymentState {
    pub fn new(id: impl Into<String>, artifact_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            artifact_name: artifact_name.into(),
            last_reported_status: None,
            payload_state: std::collections::HashMap::new(),
            pending_provides: std::collections::HashMap::new(),
        }
    }

    /// Whether `status` is a legal next status to report: terminal statuses
    /// may never be followed by another report for this deployment.
    pub fn can_report(&self, status: DeploymentStatus) -> bool {
        match self.last_reported_status {
            Some(last) => !last.is_terminal() || status == last,
            None => true,
        }
    }

    pub fn mark_reported(&mut self, status: DeploymentStatus) {
        self.last_reported_status = Some(status);
    }
}

// ── KeyValueList ──────────────────────────────────────────────────────────────

/// Unit separator between a key and its value, record separator between
/// entries. Matches the on-disk serialization of the legacy C key/value
/// list exactly, so existing persisted blobs stay readable.
const UNIT_SEPARATOR: char = '\u{1F}';
const RECORD_SEPARATOR: char = '\u{1E}';

/// An ordered list of key/value string pairs, replacing the original
/// singly-linked list representation with a `Vec` while preserving its
/// wire format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyValueList(pub Vec<(String, String)>);

impl KeyValueList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if let Some(entry) = self.0.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value.into();
        } else {
            self.0.push((key, value.into()));
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_separated_string(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{}{}{}", k, UNIT_SEPARATOR, v))
            .collect::<Vec<_>>()
            .join(&RECORD_SEPARATOR.to_string())
    }

    pub fn from_separated_string(s: &str) -> Result<Self, DomainError> {
        if s.is_empty() {
            return Ok(Self::new());
        }
        let mut out = Vec::new();
        for record in s.split(RECORD_SEPARATOR) {
            if record.is_empty() {
                continue;
            }
            let mut parts = record.splitn(2, UNIT_SEPARATOR);
            let key = parts.next().ok_or_else(|| {
                DomainError::MalformedKeyValueList(format!("missing key in record {:?}", record))
            })?;
            let value = parts.next().ok_or_else(|| {
                DomainError::MalformedKeyValueList(format!(
                    "missing unit separator in record {:?}",
                    record
                ))
            })?;
            out.push((key.to_string(), value.to_string()));
        }
        Ok(Self(out))
    }
}

// ── Keystore ──────────────────────────────────────────────────────────────────

/// An ordered key/value store persisted as a JSON object, used for signing
/// keys and other opaque device secrets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keystore(pub Vec<(String, String)>);

impl Keystore {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if let Some(entry) = self.0.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value.into();
        } else {
            self.0.push((key, value.into()));
        }
    }

    pub fn delete(&mut self, key: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|(k, _)| k != key);
        self.0.len() != before
    }

    pub fn to_json_object(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect(),
        )
    }

    pub fn from_json_object(value: &serde_json::Value) -> Result<Self, DomainError> {
        let obj = value.as_object().ok_or_else(|| {
            DomainError::MalformedKeyValueList("keystore JSON must be an object".into())
        })?;
        let mut out = Vec::with_capacity(obj.len());
        for (k, v) in obj {
            let s = v.as_str().ok_or_else(|| {
                DomainError::MalformedKeyValueList(format!("keystore value for {:?} not a string", k))
            })?;
            out.push((k.clone(), s.to_string()));
        }
        Ok(Self(out))
    }
}

/// Serialize an [`Identity`] list to the JSON object the deployment service
/// expects in the authentication payload's `id_data` field.
pub fn identity_to_json(identities: &[Identity]) -> serde_json::Value {
    serde_json::Value::Object(
        identities
            .iter()
            .map(|i| (i.name.clone(), serde_json::Value::String(i.value.clone())))
            .collect(),
    )
}

// ── HTTP status phrases ───────────────────────────────────────────────────────

/// A small subset of the HTTP status reason phrases, used for log messages
/// when the server's response carries no body to explain an error.
pub fn http_status_phrase(code: u16) -> Option<&'static str> {
    Some(match code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        409 => "Conflict",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => return None,
    })
}

// ── Small string helpers ──────────────────────────────────────────────────────
// Thin, named wrappers kept for symmetry with the artifact parser's
// prefix/suffix matching vocabulary (`begins_with("data/")`, `ends_with(".gz")`).

pub fn begins_with(s: &str, prefix: &str) -> bool {
    s.starts_with(prefix)
}

pub fn ends_with(s: &str, suffix: &str) -> bool {
    s.ends_with(suffix)
}

/// Find the last occurrence of `needle` in `haystack`.
pub fn strrstr<'a>(haystack: &'a str, needle: &str) -> Option<&'a str> {
    haystack.rfind(needle).map(|idx| &haystack[idx..])
}
