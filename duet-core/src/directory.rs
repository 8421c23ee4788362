//! Profile and presence lookups
//!
//! The call core only needs a user id to function. Profiles enrich history
//! records; presence is advisory and only used to decide whether a caller
//! writes the missed record on behalf of an unreachable callee.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Directory errors
#[derive(Error, Debug)]
pub enum DirectoryError {
    /// No profile for this user
    #[error("User not found: {0}")]
    NotFound(String),

    /// Lookup backend failed
    #[error("Directory lookup failed: {0}")]
    Backend(String),
}

/// Public profile of a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    /// User id
    pub user_id: String,
    /// Display name
    pub display_name: String,
    /// Avatar reference (URL or storage key)
    #[serde(default)]
    pub avatar_ref: Option<String>,
    /// Verified badge
    #[serde(default)]
    pub is_verified: bool,
}

impl UserProfile {
    /// Profile carrying just a display name
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            avatar_ref: None,
            is_verified: false,
        }
    }

    /// Fallback profile whose display name is the raw user id
    pub fn anonymous(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            display_name: user_id.clone(),
            user_id,
            avatar_ref: None,
            is_verified: false,
        }
    }

    /// Set the avatar reference
    #[must_use]
    pub fn with_avatar(mut self, avatar_ref: impl Into<String>) -> Self {
        self.avatar_ref = Some(avatar_ref.into());
        self
    }
}

/// Identity/profile lookup
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    /// Fetch a user's profile
    async fn get_user_profile(&self, user_id: &str) -> Result<UserProfile, DirectoryError>;
}

/// Online presence
#[async_trait]
pub trait Presence: Send + Sync {
    /// Whether the user currently has a live signaling connection
    async fn is_online(&self, user_id: &str) -> bool;
}

/// In-memory directory with fixed profiles and presence
#[derive(Default)]
pub struct StaticDirectory {
    profiles: RwLock<HashMap<String, UserProfile>>,
    online: RwLock<HashSet<String>>,
}

impl StaticDirectory {
    /// Create an empty directory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a profile
    pub fn insert(&self, profile: UserProfile) {
        self.profiles.write().insert(profile.user_id.clone(), profile);
    }

    /// Mark a user online or offline
    pub fn set_online(&self, user_id: &str, online: bool) {
        let mut set = self.online.write();
        if online {
            set.insert(user_id.to_string());
        } else {
            set.remove(user_id);
        }
    }
}

impl FromIterator<UserProfile> for StaticDirectory {
    fn from_iter<T: IntoIterator<Item = UserProfile>>(iter: T) -> Self {
        let directory = Self::new();
        for profile in iter {
            directory.insert(profile);
        }
        directory
    }
}

#[async_trait]
impl ProfileDirectory for StaticDirectory {
    async fn get_user_profile(&self, user_id: &str) -> Result<UserProfile, DirectoryError> {
        self.profiles
            .read()
            .get(user_id)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(user_id.to_string()))
    }
}

#[async_trait]
impl Presence for StaticDirectory {
    async fn is_online(&self, user_id: &str) -> bool {
        self.online.read().contains(user_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_directory_lookup() {
        let directory: StaticDirectory = vec![
            UserProfile::new("alice", "Alice Coltrane").with_avatar("avatars/alice.png"),
        ]
        .into_iter()
        .collect();

        let profile = directory.get_user_profile("alice").await.unwrap();
        assert_eq!(profile.display_name, "Alice Coltrane");
        assert_eq!(profile.avatar_ref.as_deref(), Some("avatars/alice.png"));

        assert!(matches!(
            directory.get_user_profile("nobody").await,
            Err(DirectoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_presence_toggle() {
        let directory = StaticDirectory::new();
        assert!(!directory.is_online("bob").await);
        directory.set_online("bob", true);
        assert!(directory.is_online("bob").await);
        directory.set_online("bob", false);
        assert!(!directory.is_online("bob").await);
    }

    #[test]
    fn test_anonymous_profile_uses_id() {
        let profile = UserProfile::anonymous("u-42");
        assert_eq!(profile.display_name, "u-42");
        assert!(!profile.is_verified);
    }
}
