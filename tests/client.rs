use std::{
    collections::HashMap,
    fs::File,
    io::Read,
    sync::{Arc, Mutex},
    time::Duration,
};

use splitkit::{
    AttributeValue, Attributes, ClientConfig, ConfigUpdateNotification, EventTags,
    FileEventStore, HttpRequest, HttpResponse, Method, RetryPolicy, SyncOutcome, Transport,
    TransportError,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn datafile() -> Vec<u8> {
    let mut bytes = Vec::new();
    File::open("tests/data/datafile.json")
        .unwrap()
        .read_to_end(&mut bytes)
        .unwrap();
    bytes
}

/// Serves the datafile on GET and records event posts. Posts fail while `offline` is set.
#[derive(Clone)]
struct FakeBackend {
    datafile: Vec<u8>,
    offline: bool,
    posts: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl FakeBackend {
    fn new(offline: bool) -> FakeBackend {
        FakeBackend {
            datafile: datafile(),
            offline,
            posts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn event_keys(&self) -> Vec<String> {
        self.posts
            .lock()
            .unwrap()
            .iter()
            .map(|payload| {
                payload["visitors"][0]["snapshots"][0]["events"][0]["key"]
                    .as_str()
                    .unwrap()
                    .to_owned()
            })
            .collect()
    }
}

impl Transport for FakeBackend {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        match request.method {
            Method::Get => Ok(HttpResponse {
                status: 200,
                headers: HashMap::new(),
                body: self.datafile.clone(),
            }),
            Method::Post if self.offline => Err(TransportError::Timeout),
            Method::Post => {
                let payload = serde_json::from_slice(request.body.as_deref().unwrap()).unwrap();
                self.posts.lock().unwrap().push(payload);
                Ok(HttpResponse {
                    status: 204,
                    headers: HashMap::new(),
                    body: Vec::new(),
                })
            }
        }
    }
}

#[test]
fn fetch_decide_and_track() {
    init_logger();

    let backend = FakeBackend::new(false);
    let client = ClientConfig::from_sdk_key("sdk-key")
        .transport(backend.clone())
        .flush_interval(None)
        .to_client()
        .unwrap();

    let revisions = Arc::new(Mutex::new(Vec::new()));
    {
        let revisions = revisions.clone();
        client
            .notification_center()
            .add_config_update_listener(move |n: &ConfigUpdateNotification<'_>| {
                revisions.lock().unwrap().push(n.revision.to_owned());
            });
    }

    assert_eq!(client.activate("exp1", "qa_user", &Attributes::new()), None);
    assert!(matches!(
        client.sync_configuration(),
        Ok(SyncOutcome::Updated { .. })
    ));
    assert_eq!(*revisions.lock().unwrap(), ["42"]);

    let attributes: Attributes = [
        ("country".to_owned(), "US".into()),
        ("age".to_owned(), AttributeValue::Number(40.0)),
    ]
    .into_iter()
    .collect();
    assert_eq!(
        client.activate("exp1", "qa_user", &attributes).as_deref(),
        Some("b")
    );
    assert!(client.is_feature_enabled("checkout_redesign", "qa_user", &attributes));

    let tags: EventTags = [("revenue".to_owned(), AttributeValue::Number(1999.0))]
        .into_iter()
        .collect();
    client.track("purchase", "qa_user", &attributes, &tags);
    client.shutdown().unwrap();

    assert_eq!(
        backend.event_keys(),
        ["campaign_activated", "campaign_activated", "purchase"]
    );
    let posts = backend.posts.lock().unwrap();
    let visitor = &posts[0]["visitors"][0];
    assert_eq!(visitor["visitor_id"], "qa_user");
    assert_eq!(posts[2]["visitors"][0]["snapshots"][0]["events"][0]["revenue"], 1999);
}

#[test]
fn undelivered_events_survive_restart() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let retry_policy = RetryPolicy {
        initial_interval: Duration::from_secs(3600),
        ..RetryPolicy::default()
    };

    let offline = FakeBackend::new(true);
    let client = ClientConfig::from_sdk_key("sdk-key")
        .transport(offline)
        .event_store(FileEventStore::open(dir.path()).unwrap())
        .retry_policy(retry_policy)
        .fallback_datafile(datafile())
        .flush_interval(None)
        .to_client()
        .unwrap();
    client.activate("exp1", "qa_user", &Attributes::new());
    client.track("signup", "qa_user", &Attributes::new(), &EventTags::new());
    client.shutdown().unwrap();
    assert_eq!(client.pending_event_count(), 2);
    drop(client);

    let online = FakeBackend::new(false);
    let client = ClientConfig::from_sdk_key("sdk-key")
        .transport(online.clone())
        .event_store(FileEventStore::open(dir.path()).unwrap())
        .retry_policy(retry_policy)
        .fallback_datafile(datafile())
        .flush_interval(None)
        .to_client()
        .unwrap();
    client.shutdown().unwrap();

    assert_eq!(online.event_keys(), ["campaign_activated", "signup"]);
    assert_eq!(client.pending_event_count(), 0);
}
