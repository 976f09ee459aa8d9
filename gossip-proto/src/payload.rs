//! Announcement payload codec and blob transport encoding.
//!
//! An announcement can carry a small user payload alongside the handshake:
//! the announcer's display name and a greeting line. The canonical wire form
//! is compact JSON `{"u":"name","m":"greeting"}`. Two legacy forms are still
//! accepted on input and never produced on output:
//!
//! - `name:greeting` — colon-separated, name left of the first colon
//! - bare text — the whole string is the greeting
//!
//! Blobs exchanged with the relay over HTTP travel as unpadded base64url.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

/// Error type for payload encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// Serialization to JSON failed.
    #[error("payload serialization error: {0}")]
    Serialization(String),

    /// The payload bytes are not valid UTF-8.
    #[error("payload is not valid UTF-8")]
    NotUtf8,

    /// A base64url blob failed to decode.
    #[error("invalid base64url blob: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// User data carried in an announcement: display name and greeting.
///
/// Both fields are optional; an announcement with no payload decodes to an
/// empty `AnnouncementPayload`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncementPayload {
    /// Display name the announcer wants to be known by.
    #[serde(rename = "u", skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Greeting line shown with the contact request.
    #[serde(rename = "m", skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
}

impl AnnouncementPayload {
    /// Builds a payload from optional name and greeting parts.
    #[must_use]
    pub const fn new(username: Option<String>, greeting: Option<String>) -> Self {
        Self { username, greeting }
    }

    /// Returns `true` if neither field is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.username.is_none() && self.greeting.is_none()
    }
}

/// Encodes a payload into its canonical JSON `{u,m}` form.
///
/// Legacy forms are never emitted.
///
/// # Errors
///
/// Returns `PayloadError::Serialization` if JSON serialization fails.
pub fn encode_payload(payload: &AnnouncementPayload) -> Result<Vec<u8>, PayloadError> {
    serde_json::to_vec(payload).map_err(|e| PayloadError::Serialization(e.to_string()))
}

/// Decodes announcement user data, accepting the canonical and both legacy
/// forms.
///
/// Decode order, per the wire history:
/// 1. starts with `{` — JSON `{u,m}`
/// 2. contains `:` — `name:greeting`
/// 3. otherwise — the whole string is the greeting
///
/// Empty input decodes to an empty payload.
///
/// # Errors
///
/// Returns `PayloadError::NotUtf8` if the bytes are not UTF-8, or
/// `PayloadError::Serialization` if a `{`-prefixed payload is not valid
/// JSON.
pub fn decode_payload(bytes: &[u8]) -> Result<AnnouncementPayload, PayloadError> {
    if bytes.is_empty() {
        return Ok(AnnouncementPayload::default());
    }
    let text = std::str::from_utf8(bytes).map_err(|_| PayloadError::NotUtf8)?;

    if text.starts_with('{') {
        return serde_json::from_str(text).map_err(|e| PayloadError::Serialization(e.to_string()));
    }

    if let Some((name, greeting)) = text.split_once(':') {
        return Ok(AnnouncementPayload {
            username: non_empty(name),
            greeting: non_empty(greeting),
        });
    }

    Ok(AnnouncementPayload {
        username: None,
        greeting: non_empty(text),
    })
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Encodes a blob as unpadded base64url for HTTP transport.
#[must_use]
pub fn encode_blob(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decodes an unpadded base64url blob.
///
/// # Errors
///
/// Returns `PayloadError::Base64` if the input is not valid base64url.
pub fn decode_blob(s: &str) -> Result<Vec<u8>, PayloadError> {
    Ok(URL_SAFE_NO_PAD.decode(s)?)
}
