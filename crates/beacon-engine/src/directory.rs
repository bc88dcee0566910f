//! User directory collaborator and its local lookup cache.
//!
//! The directory itself (a company-wide user store) lives in the host; the
//! engine only needs a user id → profile mapping for display names on dm
//! peers, typing indicators, and notifications.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use beacon_core::{EngineError, Profile};
use tracing::warn;

/// External user store, fetched in full and cached locally.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn users(&self) -> Result<Vec<Profile>, EngineError>;
}

/// Keyed profile cache over a [`UserDirectory`].
///
/// Invalidation is explicit: hosts refresh on login and when the directory
/// signals a change. Lookups never block on the network.
#[derive(Default)]
pub struct DirectoryCache {
    profiles: RwLock<HashMap<String, Profile>>,
}

impl DirectoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cache from the external directory.
    pub async fn refresh(&self, directory: &dyn UserDirectory) -> Result<usize, EngineError> {
        let users = directory.users().await?;
        let count = users.len();

        let Ok(mut profiles) = self.profiles.write() else {
            warn!("directory cache lock poisoned");
            return Ok(count);
        };
        profiles.clear();
        for profile in users {
            if !profile.user_id.is_empty() {
                profiles.insert(profile.user_id.clone(), profile);
            }
        }
        Ok(count)
    }

    /// Seed the cache directly, for hosts that already hold the user list.
    pub fn seed(&self, users: Vec<Profile>) {
        let Ok(mut profiles) = self.profiles.write() else {
            warn!("directory cache lock poisoned");
            return;
        };
        for profile in users {
            if !profile.user_id.is_empty() {
                profiles.insert(profile.user_id.clone(), profile);
            }
        }
    }

    pub fn get(&self, user_id: &str) -> Option<Profile> {
        self.profiles
            .read()
            .ok()
            .and_then(|profiles| profiles.get(user_id).cloned())
    }

    /// Best display name for a user, when the directory knows one.
    pub fn display_name(&self, user_id: &str) -> Option<String> {
        self.get(user_id)
            .map(|profile| {
                if profile.display_name.is_empty() {
                    profile.username
                } else {
                    profile.display_name
                }
            })
            .filter(|name| !name.is_empty())
    }

    pub fn len(&self) -> usize {
        self.profiles.read().map(|profiles| profiles.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything, e.g. on logout.
    pub fn clear(&self) {
        if let Ok(mut profiles) = self.profiles.write() {
            profiles.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(user_id: &str, display_name: &str, username: &str) -> Profile {
        Profile {
            user_id: user_id.into(),
            username: username.into(),
            display_name: display_name.into(),
            avatar_url: None,
            is_online: false,
            last_seen: None,
        }
    }

    struct FixedDirectory(Vec<Profile>);

    #[async_trait]
    impl UserDirectory for FixedDirectory {
        async fn users(&self) -> Result<Vec<Profile>, EngineError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn refresh_replaces_the_cache() {
        let cache = DirectoryCache::new();
        cache.seed(vec![profile("u_old", "Old", "old")]);

        let directory = FixedDirectory(vec![
            profile("u_1", "Sam Field", "sam"),
            profile("u_2", "", "jo"),
        ]);
        let count = cache.refresh(&directory).await.expect("refresh");

        assert_eq!(count, 2);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("u_old"), None);
    }

    #[test]
    fn display_name_falls_back_to_username() {
        let cache = DirectoryCache::new();
        cache.seed(vec![
            profile("u_1", "Sam Field", "sam"),
            profile("u_2", "", "jo"),
        ]);

        assert_eq!(cache.display_name("u_1").as_deref(), Some("Sam Field"));
        assert_eq!(cache.display_name("u_2").as_deref(), Some("jo"));
        assert_eq!(cache.display_name("u_unknown"), None);
    }

    #[test]
    fn clear_empties_the_cache() {
        let cache = DirectoryCache::new();
        cache.seed(vec![profile("u_1", "Sam", "sam")]);
        cache.clear();
        assert!(cache.is_empty());
    }
}
