use thiserror::Error;

/// Failure reported by an external capability (identity provider or crypto
/// backend) injected into the client. Kept string-based since the concrete
/// failure modes of those collaborators (§6) are opaque to this crate.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct CapabilityError(pub String);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("session token rejected (401)")]
    Unauthorized,

    #[error("unsupported or unrecognized HTTP status: {0}")]
    Unsupported(u16),

    #[error("[{status}] {phrase}: {message}")]
    Failure { status: u16, phrase: String, message: String },

    #[error("external capability failed: {0}")]
    Capability(#[from] CapabilityError),
}

impl ApiError {
    /// Build a `Failure` from a non-2xx status, looking up its reason
    /// phrase and pulling `error` out of a JSON body when present — the
    /// `[<code>] <phrase>: <server-error-field-or-"unknown error">` log
    /// shape from §4.2/§7.
    pub fn from_status(status: u16, body: &[u8]) -> Self {
        let phrase = mender_domain::http_status_phrase(status).unwrap_or("Unknown Status").to_string();
        let message = serde_json::from_slice::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or_else(|| "unknown error".to_string());
        ApiError::Failure { status, phrase, message }
    }
}
