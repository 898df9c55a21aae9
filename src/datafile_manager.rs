//! Fetches the datafile from the CDN and publishes it to a [`ConfigurationStore`].
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use url::Url;

use crate::{
    configuration_store::ConfigurationStore,
    notification::{ConfigUpdateNotification, NotificationCenter},
    single_flight::InFlight,
    storage::KeyValueStore,
    transport::{HttpRequest, Transport},
    Error, ProjectConfig, Result,
};

pub struct DatafileManagerConfig {
    /// Base URL of the datafile CDN. The datafile is requested from `{base_url}/{sdk_key}.json`.
    pub base_url: String,
    pub sdk_key: String,
    pub timeout: Duration,
}

impl DatafileManagerConfig {
    pub const DEFAULT_BASE_URL: &'static str = "https://cdn.optimizely.com/datafiles";
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Result of a successful [`DatafileManager::sync`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A new datafile was published.
    Updated { revision: String },
    /// The server has nothing newer than the current snapshot.
    NotModified,
    /// Another sync is running. This call did nothing.
    InProgress,
}

pub struct DatafileManager {
    transport: Arc<dyn Transport + Send + Sync>,
    store: Arc<ConfigurationStore>,
    /// Last good payload, kept for cold starts.
    cache: Option<Arc<dyn KeyValueStore + Send + Sync>>,
    notification_center: Arc<NotificationCenter>,
    url: Url,
    sdk_key: String,
    timeout: Duration,
    /// `Last-Modified` header of the published datafile.
    last_modified: Mutex<Option<String>>,
    /// Serializes the revision check, the swap and the notification of [`DatafileManager::publish`].
    publishing: Mutex<()>,
    syncing: AtomicBool,
    /// If we receive a 401 Unauthorized error during a request, it means the SDK key is not
    /// valid. We cache this error so we don't issue additional requests to the server.
    unauthorized: AtomicBool,
}

impl DatafileManager {
    /// # Errors
    ///
    /// - [`Error::InvalidBaseUrl`] if `base_url` and `sdk_key` do not make a valid URL.
    pub fn new(
        config: DatafileManagerConfig,
        transport: Arc<dyn Transport + Send + Sync>,
        store: Arc<ConfigurationStore>,
        cache: Option<Arc<dyn KeyValueStore + Send + Sync>>,
        notification_center: Arc<NotificationCenter>,
    ) -> Result<DatafileManager> {
        let url = Url::parse(&format!(
            "{}/{}.json",
            config.base_url.trim_end_matches('/'),
            config.sdk_key
        ))
        .map_err(Error::InvalidBaseUrl)?;

        Ok(DatafileManager {
            transport,
            store,
            cache,
            notification_center,
            url,
            sdk_key: config.sdk_key,
            timeout: config.timeout,
            last_modified: Mutex::new(None),
            publishing: Mutex::new(()),
            syncing: AtomicBool::new(false),
            unauthorized: AtomicBool::new(false),
        })
    }

    /// Publish a datafile before the first fetch.
    ///
    /// Uses the cached payload of a previous run if there is a valid one, and `fallback` otherwise.
    /// Returns the revision that was published, if any.
    ///
    /// # Errors
    ///
    /// Returns the parse error if `fallback` is used and is not a valid datafile.
    pub fn bootstrap(&self, fallback: Option<&[u8]>) -> Result<Option<String>> {
        if let Some((config, last_modified)) = self.load_cached() {
            let revision = config.revision().to_owned();
            log::debug!(target: "splitkit", revision; "bootstrapped from cached datafile");
            *self.lock_last_modified() = last_modified;
            self.publish(Arc::new(config));
            return Ok(Some(revision));
        }

        let Some(fallback) = fallback else {
            return Ok(None);
        };
        let config = ProjectConfig::from_bytes(fallback)?;
        let revision = config.revision().to_owned();
        log::debug!(target: "splitkit", revision; "bootstrapped from fallback datafile");
        self.publish(Arc::new(config));
        Ok(Some(revision))
    }

    /// Fetch the datafile and publish it if it changed.
    ///
    /// A failed fetch or an invalid datafile leaves the current snapshot in place.
    ///
    /// # Errors
    ///
    /// - [`Error::Unauthorized`] if the server rejected the SDK key. Once received, no further
    ///   requests are made.
    /// - [`Error::Transport`] or [`Error::HttpStatus`] if the fetch failed.
    /// - Datafile parse and validation errors.
    pub fn sync(&self) -> Result<SyncOutcome> {
        if self.unauthorized.load(Ordering::Acquire) {
            return Err(Error::Unauthorized);
        }

        let Some(_in_flight) = InFlight::acquire(&self.syncing) else {
            log::trace!(target: "splitkit", "datafile sync already in progress");
            return Ok(SyncOutcome::InProgress);
        };

        let mut request = HttpRequest::get(self.url.as_str(), self.timeout);
        // A conditional request only makes sense if there is something to keep.
        if self.store.get_configuration().is_some() {
            if let Some(last_modified) = self.lock_last_modified().clone() {
                request = request.with_header("If-Modified-Since", last_modified);
            }
        }

        log::debug!(target: "splitkit", url = self.url.as_str(); "fetching datafile");
        let response = self.transport.send(&request).map_err(|err| {
            log::warn!(target: "splitkit", err:display = err; "failed to fetch datafile");
            Error::from(err)
        })?;

        match response.status {
            304 => {
                log::debug!(target: "splitkit", "datafile not modified");
                Ok(SyncOutcome::NotModified)
            }
            401 | 403 => {
                log::warn!(target: "splitkit", "client is not authorized. Check your SDK key");
                self.unauthorized.store(true, Ordering::Release);
                Err(Error::Unauthorized)
            }
            status if response.is_success() => {
                let config = ProjectConfig::from_bytes(&response.body).map_err(|err| {
                    log::warn!(target: "splitkit",
                               err:display = err;
                               "received invalid datafile, keeping the current one");
                    err
                })?;
                let revision = config.revision().to_owned();
                let last_modified = response.header("last-modified").map(str::to_owned);
                log::debug!(target: "splitkit", status, revision; "fetched datafile");

                self.save_cached(&response.body, last_modified.as_deref());
                *self.lock_last_modified() = last_modified;

                if self.publish(Arc::new(config)) {
                    Ok(SyncOutcome::Updated { revision })
                } else {
                    Ok(SyncOutcome::NotModified)
                }
            }
            status => {
                log::warn!(target: "splitkit",
                           status;
                           "received non-200 response while fetching datafile");
                Err(Error::HttpStatus(status))
            }
        }
    }

    /// Publish `config` and notify config-update listeners.
    ///
    /// Returns `false` and does nothing if the current snapshot already has the same revision.
    ///
    /// Concurrent calls are serialized, so listeners see each revision once and in publication
    /// order. Listeners must not publish from inside the callback.
    pub fn publish(&self, config: Arc<ProjectConfig>) -> bool {
        let _publishing = self
            .publishing
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let previous = self.store.get_configuration();
        if previous
            .as_ref()
            .is_some_and(|previous| previous.revision() == config.revision())
        {
            log::debug!(target: "splitkit",
                        revision = config.revision();
                        "datafile revision unchanged");
            return false;
        }

        self.store.set_configuration(Arc::clone(&config));
        log::info!(target: "splitkit",
                   revision = config.revision();
                   "published new datafile");
        self.notification_center
            .notify_config_update(&ConfigUpdateNotification {
                revision: config.revision(),
                previous_revision: previous.as_ref().map(|previous| previous.revision()),
            });
        true
    }

    pub fn store(&self) -> &Arc<ConfigurationStore> {
        &self.store
    }

    fn payload_key(&self) -> String {
        format!("datafile/{}", self.sdk_key)
    }

    fn last_modified_key(&self) -> String {
        format!("datafile/{}/last_modified", self.sdk_key)
    }

    fn load_cached(&self) -> Option<(ProjectConfig, Option<String>)> {
        let cache = self.cache.as_ref()?;
        let payload = match cache.get(&self.payload_key()) {
            Ok(payload) => payload?,
            Err(err) => {
                log::error!(target: "splitkit", err:display = err; "failed to read cached datafile");
                return None;
            }
        };
        let config = match ProjectConfig::from_bytes(&payload) {
            Ok(config) => config,
            Err(err) => {
                log::warn!(target: "splitkit",
                           err:display = err;
                           "cached datafile is invalid, discarding it");
                let _ = cache.delete(&self.payload_key());
                let _ = cache.delete(&self.last_modified_key());
                return None;
            }
        };
        let last_modified = cache
            .get(&self.last_modified_key())
            .ok()
            .flatten()
            .and_then(|bytes| String::from_utf8(bytes).ok());
        Some((config, last_modified))
    }

    fn save_cached(&self, payload: &[u8], last_modified: Option<&str>) {
        let Some(cache) = &self.cache else {
            return;
        };
        let result = cache.put(&self.payload_key(), payload).and_then(|()| {
            match last_modified {
                Some(last_modified) => {
                    cache.put(&self.last_modified_key(), last_modified.as_bytes())
                }
                None => cache.delete(&self.last_modified_key()),
            }
        });
        if let Err(err) = result {
            log::error!(target: "splitkit", err:display = err; "failed to cache datafile");
        }
    }

    fn lock_last_modified(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.last_modified
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{atomic::AtomicUsize, mpsc, Arc, Barrier, Mutex},
        time::Duration,
    };

    use super::*;
    use crate::{
        project_config::tests::fixture_bytes,
        storage::{FileKeyValueStore, InMemoryKeyValueStore},
        transport::{
            tests::{response, ScriptedTransport},
            HttpRequest, HttpResponse, TransportError,
        },
        ErrorKind,
    };

    const LAST_MODIFIED: &str = "Wed, 21 Oct 2015 07:28:00 GMT";

    fn datafile_response(body: Vec<u8>) -> HttpResponse {
        HttpResponse {
            status: 200,
            headers: HashMap::from([("last-modified".to_owned(), LAST_MODIFIED.to_owned())]),
            body,
        }
    }

    fn with_revision(revision: &str) -> Vec<u8> {
        let mut datafile: serde_json::Value = serde_json::from_slice(&fixture_bytes()).unwrap();
        datafile["revision"] = revision.into();
        serde_json::to_vec(&datafile).unwrap()
    }

    fn manager(
        transport: Arc<ScriptedTransport>,
        cache: Option<Arc<dyn KeyValueStore + Send + Sync>>,
    ) -> DatafileManager {
        DatafileManager::new(
            DatafileManagerConfig {
                base_url: "http://cdn.test/datafiles/".to_owned(),
                sdk_key: "sdk-key".to_owned(),
                timeout: Duration::from_secs(1),
            },
            transport,
            Arc::new(ConfigurationStore::new()),
            cache,
            Arc::new(NotificationCenter::new()),
        )
        .unwrap()
    }

    #[test]
    fn rejects_invalid_base_url() {
        let result = DatafileManager::new(
            DatafileManagerConfig {
                base_url: "not a url".to_owned(),
                sdk_key: "sdk-key".to_owned(),
                timeout: Duration::from_secs(1),
            },
            Arc::new(ScriptedTransport::new(Ok(response(200)))),
            Arc::new(ConfigurationStore::new()),
            None,
            Arc::new(NotificationCenter::new()),
        );
        assert!(matches!(result, Err(Error::InvalidBaseUrl(_))));
    }

    #[test]
    fn conditional_fetch_and_not_modified() {
        let transport = Arc::new(ScriptedTransport::new(Ok(response(304))));
        transport.push(Ok(datafile_response(fixture_bytes())));
        let manager = manager(transport.clone(), None);

        let updates = Arc::new(Mutex::new(Vec::new()));
        {
            let updates = updates.clone();
            manager.notification_center.add_config_update_listener(
                move |n: &ConfigUpdateNotification<'_>| {
                    updates.lock().unwrap().push(n.revision.to_owned());
                },
            );
        }

        assert_eq!(
            manager.sync().unwrap(),
            SyncOutcome::Updated {
                revision: "42".to_owned()
            }
        );
        let snapshot = manager.store().get_configuration().unwrap();

        // The second fetch is conditional and yields 304: same snapshot, no listeners called.
        assert_eq!(manager.sync().unwrap(), SyncOutcome::NotModified);
        assert!(Arc::ptr_eq(
            &snapshot,
            &manager.store().get_configuration().unwrap()
        ));
        assert_eq!(*updates.lock().unwrap(), ["42"]);

        let requests = transport.requests();
        assert_eq!(requests[0].url, "http://cdn.test/datafiles/sdk-key.json");
        assert_eq!(requests[0].header("If-Modified-Since"), None);
        assert_eq!(requests[1].header("If-Modified-Since"), Some(LAST_MODIFIED));
    }

    #[test]
    fn invalid_datafile_keeps_previous_snapshot() {
        let transport = Arc::new(ScriptedTransport::new(Ok(datafile_response(
            br#"{"version": "1"}"#.to_vec(),
        ))));
        transport.push(Ok(datafile_response(fixture_bytes())));
        let manager = manager(transport, None);

        manager.sync().unwrap();
        let err = manager.sync().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert_eq!(
            manager.store().get_configuration().unwrap().revision(),
            "42"
        );
    }

    #[test]
    fn failures_are_reported_and_retriable() {
        let transport = Arc::new(ScriptedTransport::new(Ok(datafile_response(fixture_bytes()))));
        transport.push(Err(TransportError::Timeout));
        transport.push(Ok(response(500)));
        let manager = manager(transport, None);

        assert!(matches!(manager.sync(), Err(Error::Transport(TransportError::Timeout))));
        assert!(matches!(manager.sync(), Err(Error::HttpStatus(500))));
        assert!(manager.store().get_configuration().is_none());
        assert!(matches!(manager.sync(), Ok(SyncOutcome::Updated { .. })));
    }

    #[test]
    fn unauthorized_is_latched() {
        let transport = Arc::new(ScriptedTransport::new(Ok(response(401))));
        let manager = manager(transport.clone(), None);

        assert!(matches!(manager.sync(), Err(Error::Unauthorized)));
        assert!(matches!(manager.sync(), Err(Error::Unauthorized)));
        assert_eq!(transport.requests().len(), 1);
    }

    #[test]
    fn same_revision_is_not_republished() {
        let transport = Arc::new(ScriptedTransport::new(Ok(datafile_response(fixture_bytes()))));
        let manager = manager(transport, None);

        assert!(matches!(manager.sync(), Ok(SyncOutcome::Updated { .. })));
        assert_eq!(manager.sync().unwrap(), SyncOutcome::NotModified);
    }

    #[test]
    fn newer_revision_notifies_with_previous() {
        let transport = Arc::new(ScriptedTransport::new(Ok(datafile_response(with_revision(
            "43",
        )))));
        transport.push(Ok(datafile_response(fixture_bytes())));
        let manager = manager(transport, None);

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            manager.notification_center.add_config_update_listener(
                move |n: &ConfigUpdateNotification<'_>| {
                    seen.lock()
                        .unwrap()
                        .push((n.previous_revision.map(str::to_owned), n.revision.to_owned()));
                },
            );
        }

        manager.sync().unwrap();
        manager.sync().unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            [
                (None, "42".to_owned()),
                (Some("42".to_owned()), "43".to_owned())
            ]
        );
    }

    #[test]
    fn bootstrap_prefers_cache_over_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let cache: Arc<dyn KeyValueStore + Send + Sync> =
            Arc::new(FileKeyValueStore::open(dir.path()).unwrap());

        // Nothing cached yet: the fallback is used.
        let transport = Arc::new(ScriptedTransport::new(Ok(datafile_response(with_revision(
            "43",
        )))));
        let first = manager(transport, Some(cache.clone()));
        assert_eq!(
            first.bootstrap(Some(&fixture_bytes())).unwrap(),
            Some("42".to_owned())
        );
        first.sync().unwrap();

        // A restarted process starts from the fetched datafile and revalidates it.
        let cache: Arc<dyn KeyValueStore + Send + Sync> =
            Arc::new(FileKeyValueStore::open(dir.path()).unwrap());
        let transport = Arc::new(ScriptedTransport::new(Ok(response(304))));
        let second = manager(transport.clone(), Some(cache));
        assert_eq!(
            second.bootstrap(Some(&fixture_bytes())).unwrap(),
            Some("43".to_owned())
        );
        assert_eq!(second.sync().unwrap(), SyncOutcome::NotModified);
        assert_eq!(
            transport.requests()[0].header("If-Modified-Since"),
            Some(LAST_MODIFIED)
        );
    }

    #[test]
    fn bootstrap_discards_corrupt_cache() {
        let cache = Arc::new(InMemoryKeyValueStore::new());
        cache.put("datafile/sdk-key", b"{not json").unwrap();
        let manager = manager(
            Arc::new(ScriptedTransport::new(Ok(response(304)))),
            Some(cache.clone()),
        );

        assert_eq!(manager.bootstrap(None).unwrap(), None);
        assert_eq!(cache.get("datafile/sdk-key").unwrap(), None);
        assert!(manager.bootstrap(Some(b"[]")).is_err());
    }

    #[test]
    fn concurrent_publish_notifies_once() {
        let manager = Arc::new(manager(
            Arc::new(ScriptedTransport::new(Ok(response(304)))),
            None,
        ));
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            manager.notification_center.add_config_update_listener(
                move |n: &ConfigUpdateNotification<'_>| {
                    seen.lock()
                        .unwrap()
                        .push((n.previous_revision.map(str::to_owned), n.revision.to_owned()));
                },
            );
        }

        let barrier = Arc::new(Barrier::new(8));
        let publishers = (0..8)
            .map(|_| {
                let manager = manager.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let config = Arc::new(ProjectConfig::from_bytes(&fixture_bytes()).unwrap());
                    barrier.wait();
                    manager.publish(config)
                })
            })
            .collect::<Vec<_>>();
        let published = publishers
            .into_iter()
            .map(|publisher| publisher.join().unwrap())
            .filter(|published| *published)
            .count();

        assert_eq!(published, 1);
        assert_eq!(*seen.lock().unwrap(), [(None, "42".to_owned())]);
    }

    struct GatedTransport {
        requests: AtomicUsize,
        started: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl Transport for GatedTransport {
        fn send(
            &self,
            _request: &HttpRequest,
        ) -> std::result::Result<HttpResponse, TransportError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let _ = self.started.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
            Ok(datafile_response(fixture_bytes()))
        }
    }

    #[test]
    fn concurrent_sync_is_a_no_op() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let transport = Arc::new(GatedTransport {
            requests: AtomicUsize::new(0),
            started: Mutex::new(started_tx),
            release: Mutex::new(release_rx),
        });
        let manager = Arc::new(
            DatafileManager::new(
                DatafileManagerConfig {
                    base_url: "http://cdn.test/datafiles".to_owned(),
                    sdk_key: "sdk-key".to_owned(),
                    timeout: Duration::from_secs(1),
                },
                transport.clone(),
                Arc::new(ConfigurationStore::new()),
                None,
                Arc::new(NotificationCenter::new()),
            )
            .unwrap(),
        );

        let syncing = {
            let manager = manager.clone();
            std::thread::spawn(move || manager.sync())
        };
        started_rx.recv().unwrap();

        assert_eq!(manager.sync().unwrap(), SyncOutcome::InProgress);
        assert_eq!(transport.requests.load(Ordering::SeqCst), 1);

        release_tx.send(()).unwrap();
        assert_eq!(
            syncing.join().unwrap().unwrap(),
            SyncOutcome::Updated {
                revision: "42".to_owned()
            }
        );
        assert_eq!(transport.requests.load(Ordering::SeqCst), 1);
    }
}
