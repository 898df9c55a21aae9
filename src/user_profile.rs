//! Sticky bucketing storage.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};

use crate::{storage::KeyValueStore, Error, Result};

/// A user's past bucketing decisions, keyed by experiment id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    #[serde(default)]
    pub experiment_bucket_map: HashMap<String, StickyDecision>,
}

/// A stored decision for one experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickyDecision {
    pub variation_id: String,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>) -> UserProfile {
        UserProfile {
            user_id: user_id.into(),
            experiment_bucket_map: HashMap::new(),
        }
    }

    /// Stored variation id for `experiment_id`, if any.
    pub fn variation_id(&self, experiment_id: &str) -> Option<&str> {
        self.experiment_bucket_map
            .get(experiment_id)
            .map(|decision| decision.variation_id.as_str())
    }

    pub fn set_variation_id(&mut self, experiment_id: &str, variation_id: &str) {
        self.experiment_bucket_map.insert(
            experiment_id.to_owned(),
            StickyDecision {
                variation_id: variation_id.to_owned(),
            },
        );
    }
}

/// Storage of [`UserProfile`]s used for sticky bucketing.
///
/// The decision service serializes lookup/save sequences for the same user, so implementations
/// only need to be safe for concurrent calls on different users.
pub trait UserProfileService {
    fn lookup(&self, user_id: &str) -> Result<Option<UserProfile>>;
    fn save(&self, profile: &UserProfile) -> Result<()>;
}

/// [`UserProfileService`] that keeps profiles in memory for the lifetime of the process.
#[derive(Debug, Default)]
pub struct InMemoryUserProfileService {
    profiles: Mutex<HashMap<String, UserProfile>>,
}

impl InMemoryUserProfileService {
    pub fn new() -> InMemoryUserProfileService {
        InMemoryUserProfileService::default()
    }
}

impl UserProfileService for InMemoryUserProfileService {
    fn lookup(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let profiles = self.profiles.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(profiles.get(user_id).cloned())
    }

    fn save(&self, profile: &UserProfile) -> Result<()> {
        let mut profiles = self.profiles.lock().unwrap_or_else(PoisonError::into_inner);
        profiles.insert(profile.user_id.clone(), profile.clone());
        Ok(())
    }
}

/// [`UserProfileService`] persisting JSON-encoded profiles in a [`KeyValueStore`].
pub struct KeyValueUserProfileService {
    store: Arc<dyn KeyValueStore + Send + Sync>,
}

impl KeyValueUserProfileService {
    pub fn new(store: Arc<dyn KeyValueStore + Send + Sync>) -> KeyValueUserProfileService {
        KeyValueUserProfileService { store }
    }

    fn key(user_id: &str) -> String {
        format!("user_profile/{user_id}")
    }
}

impl UserProfileService for KeyValueUserProfileService {
    fn lookup(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let Some(bytes) = self.store.get(&Self::key(user_id))? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| Error::Serialization(Arc::new(err)))
    }

    fn save(&self, profile: &UserProfile) -> Result<()> {
        let bytes =
            serde_json::to_vec(profile).map_err(|err| Error::Serialization(Arc::new(err)))?;
        self.store.put(&Self::key(&profile.user_id), &bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::{FileKeyValueStore, InMemoryKeyValueStore};

    #[test]
    fn profile_wire_format() {
        let mut profile = UserProfile::new("user42");
        profile.set_variation_id("30001", "30101");
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "user_id": "user42",
                "experiment_bucket_map": {"30001": {"variation_id": "30101"}}
            })
        );
    }

    #[test]
    fn in_memory_round_trip() {
        let service = InMemoryUserProfileService::new();
        assert_eq!(service.lookup("user42").unwrap(), None);

        let mut profile = UserProfile::new("user42");
        profile.set_variation_id("30001", "30101");
        service.save(&profile).unwrap();

        let stored = service.lookup("user42").unwrap().unwrap();
        assert_eq!(stored.variation_id("30001"), Some("30101"));
        assert_eq!(stored.variation_id("30002"), None);
    }

    #[test]
    fn key_value_service_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Arc::new(FileKeyValueStore::open(dir.path()).unwrap());
            let service = KeyValueUserProfileService::new(store);
            let mut profile = UserProfile::new("user42");
            profile.set_variation_id("30001", "30102");
            service.save(&profile).unwrap();
        }

        let store = Arc::new(FileKeyValueStore::open(dir.path()).unwrap());
        let service = KeyValueUserProfileService::new(store);
        let profile = service.lookup("user42").unwrap().unwrap();
        assert_eq!(profile.variation_id("30001"), Some("30102"));
    }

    #[test]
    fn corrupt_profile_is_an_error() {
        let store = Arc::new(InMemoryKeyValueStore::new());
        store.put("user_profile/user42", b"not json").unwrap();
        let service = KeyValueUserProfileService::new(store);
        assert!(matches!(
            service.lookup("user42"),
            Err(Error::Serialization(_))
        ));
    }
}
