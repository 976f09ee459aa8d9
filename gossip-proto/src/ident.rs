//! User identifiers and their human-readable string form.
//!
//! A user id is 32 opaque bytes derived by the crypto layer from a user's
//! public keys. On screen and in invites it travels as a bech32 string with
//! the human-readable prefix `gossip` (e.g. `gossip1q3j5...`), which gives a
//! checksum, a fixed alphabet, and error detection on manual entry.

use bech32::{Bech32, Hrp};

/// Length in bytes of a raw user id.
pub const USER_ID_LEN: usize = 32;

/// Human-readable bech32 prefix for encoded user ids.
pub const USER_ID_HRP: &str = "gossip";

/// Errors produced when decoding a user-id string.
#[derive(Debug, thiserror::Error)]
pub enum IdentError {
    /// The string is not valid bech32 (bad charset, checksum, or casing).
    #[error("invalid user id encoding: {0}")]
    Encoding(String),

    /// The string decoded but carried the wrong human-readable prefix.
    #[error("wrong user id prefix: expected {USER_ID_HRP:?}, got {0:?}")]
    WrongPrefix(String),

    /// The decoded payload was not exactly [`USER_ID_LEN`] bytes.
    #[error("wrong user id length: expected {USER_ID_LEN} bytes, got {0}")]
    WrongLength(usize),
}

/// A 32-byte user identifier, opaque to everything but the crypto layer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct UserId([u8; USER_ID_LEN]);

impl UserId {
    /// Wraps raw id bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; USER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Builds a `UserId` from a byte slice, if it has the right length.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; USER_ID_LEN]>::try_from(bytes).ok().map(Self)
    }

    /// Returns the raw id bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; USER_ID_LEN] {
        &self.0
    }

    /// Encodes this id as its bech32 string form.
    #[must_use]
    pub fn encode(&self) -> String {
        encode_user_id(self)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl std::fmt::Debug for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short hex prefix is enough to tell ids apart in logs.
        write!(f, "UserId(")?;
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

/// Encodes a user id into its bech32 string form.
#[must_use]
pub fn encode_user_id(id: &UserId) -> String {
    let hrp = Hrp::parse_unchecked(USER_ID_HRP);
    // Encoding 32 bytes under a 6-character HRP is far below the bech32
    // length ceiling, so this cannot fail.
    bech32::encode::<Bech32>(hrp, id.as_bytes()).unwrap_or_default()
}

/// Decodes a bech32 user-id string, rejecting checksum, prefix, and length
/// mismatches.
///
/// # Errors
///
/// Returns [`IdentError`] if the string is not valid bech32, carries a
/// prefix other than [`USER_ID_HRP`], or does not decode to exactly
/// [`USER_ID_LEN`] bytes.
pub fn decode_user_id(s: &str) -> Result<UserId, IdentError> {
    let (hrp, data) = bech32::decode(s).map_err(|e| IdentError::Encoding(e.to_string()))?;
    if hrp.as_str() != USER_ID_HRP {
        return Err(IdentError::WrongPrefix(hrp.as_str().to_string()));
    }
    UserId::from_slice(&data).ok_or(IdentError::WrongLength(data.len()))
}
