use std::sync::{Arc, RwLock};

use crate::ProjectConfig;

/// `ConfigurationStore` provides a Sync storage for the current [`ProjectConfig`] that allows
/// concurrent access for readers and writers.
///
/// Readers get an `Arc` to a complete snapshot and keep using it for the duration of a decision,
/// even if a new snapshot is published in the meantime.
#[derive(Default)]
pub struct ConfigurationStore {
    configuration: RwLock<Option<Arc<ProjectConfig>>>,
}

impl ConfigurationStore {
    pub fn new() -> Self {
        Self {
            configuration: RwLock::new(None),
        }
    }

    pub fn get_configuration(&self) -> Option<Arc<ProjectConfig>> {
        // self.configuration.read() should always return Ok(). Err() is possible only if the lock
        // is poisoned (writer panicked while holding the lock), which should never happen. Still,
        // using .ok()? here to not crash the app.
        let configuration = self.configuration.read().ok()?;
        configuration.clone()
    }

    /// Set new configuration, returning the previous one.
    pub fn set_configuration(&self, config: Arc<ProjectConfig>) -> Option<Arc<ProjectConfig>> {
        let mut configuration_slot = self.configuration.write().ok()?;
        std::mem::replace(&mut configuration_slot, Some(config))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::ConfigurationStore;
    use crate::ProjectConfig;

    fn config_with_revision(revision: u32) -> Arc<ProjectConfig> {
        // Every index carries the revision so that a torn read would be visible.
        let key = format!("exp-{revision}");
        let bytes = serde_json::to_vec(&json!({
            "version": "4",
            "accountId": "1",
            "projectId": "2",
            "revision": revision.to_string(),
            "events": [{"id": format!("ev-{revision}"), "key": key, "experimentIds": []}],
            "experiments": [{
                "id": format!("id-{revision}"),
                "key": key,
                "status": "Running",
                "variations": [{"id": format!("var-{revision}"), "key": "v"}],
                "trafficAllocation": [{"entityId": format!("var-{revision}"), "endOfRange": 10000}],
            }],
        }))
        .unwrap();
        Arc::new(ProjectConfig::from_bytes(&bytes).unwrap())
    }

    #[test]
    fn can_set_configuration_from_another_thread() {
        let store = Arc::new(ConfigurationStore::new());
        assert!(store.get_configuration().is_none());

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || {
                store.set_configuration(config_with_revision(1));
            })
            .join();
        }

        assert_eq!(store.get_configuration().unwrap().revision(), "1");
    }

    #[test]
    fn set_configuration_returns_previous() {
        let store = ConfigurationStore::new();
        assert!(store.set_configuration(config_with_revision(1)).is_none());
        let previous = store.set_configuration(config_with_revision(2)).unwrap();
        assert_eq!(previous.revision(), "1");
    }

    #[test]
    fn readers_never_observe_a_mixed_snapshot() {
        let store = Arc::new(ConfigurationStore::new());
        store.set_configuration(config_with_revision(0));

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for revision in 1..200 {
                    store.set_configuration(config_with_revision(revision));
                }
            })
        };

        let readers = (0..4)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let snapshot = store.get_configuration().unwrap();
                        let revision = snapshot.revision().to_owned();
                        let key = format!("exp-{revision}");
                        let experiment = snapshot.experiment_by_key(&key).unwrap();
                        assert_eq!(experiment.id, format!("id-{revision}"));
                        assert!(snapshot.event_by_key(&key).is_some());
                        assert!(experiment
                            .variation_by_id(&format!("var-{revision}"))
                            .is_some());
                    }
                })
            })
            .collect::<Vec<_>>();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(store.get_configuration().unwrap().revision(), "199");
    }
}
