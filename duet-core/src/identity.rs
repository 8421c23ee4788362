//! User identity abstraction
//!
//! The call core never interprets identities beyond equality and a stable
//! string form. The string form is what the relay routes on and what call
//! history records are keyed by.

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};
use std::hash::Hash;

/// Trait for user identities in the call system
///
/// Implementations must be serializable (they travel inside signaling
/// envelopes), comparable, and displayable.
pub trait PeerIdentity:
    Clone
    + Debug
    + Display
    + PartialEq
    + Eq
    + Hash
    + Serialize
    + for<'de> Deserialize<'de>
    + Send
    + Sync
    + 'static
{
    /// Convert the identity to a string representation
    fn to_string_repr(&self) -> String;

    /// Try to create an identity from a string representation
    fn from_string_repr(s: &str) -> anyhow::Result<Self>
    where
        Self: Sized;

    /// Key used by relays and history stores
    fn unique_id(&self) -> String {
        self.to_string_repr()
    }
}

/// Plain string user identity, as handed out by the hosted auth service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    /// Create a new user identity
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PeerIdentity for UserId {
    fn to_string_repr(&self) -> String {
        self.0.clone()
    }

    fn from_string_repr(s: &str) -> anyhow::Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            anyhow::bail!("user id cannot be empty");
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_display() {
        let id = UserId::new("miles-davis");
        assert_eq!(id.to_string(), "miles-davis");
        assert_eq!(id.to_string_repr(), "miles-davis");
        assert_eq!(id.unique_id(), "miles-davis");
    }

    #[test]
    fn test_user_id_from_string_trims() {
        let id = UserId::from_string_repr("  nina \n").unwrap();
        assert_eq!(id.as_str(), "nina");
    }

    #[test]
    fn test_user_id_from_empty_string_fails() {
        assert!(UserId::from_string_repr("   ").is_err());
    }

    #[test]
    fn test_user_id_serializes_as_plain_string() {
        let id = UserId::new("coltrane");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"coltrane\"");
        let back: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
