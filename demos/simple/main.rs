use splitkit::{AttributeValue, Attributes, ClientConfig, EventTags, FileEventStore};

pub fn main() -> splitkit::Result<()> {
    env_logger::init();

    let sdk_key = std::env::var("SPLITKIT_SDK_KEY").unwrap_or_else(|_| "demo-sdk-key".to_owned());
    let queue_dir = std::env::temp_dir().join("splitkit-demo-events");

    let client = ClientConfig::from_sdk_key(sdk_key)
        // Keep undelivered events across runs.
        .event_store(FileEventStore::open(queue_dir)?)
        .to_client()?;

    // Start a poller thread to fetch the datafile from the server.
    client.start_poller_thread()?;

    // Block waiting for the datafile. Until this call returns, the client will return None for all
    // variations.
    if let Err(err) = client.wait_for_configuration() {
        eprintln!("Cannot fetch datafile: {err}");
        return client.shutdown();
    }

    let attributes: Attributes = [
        ("country".to_owned(), "US".into()),
        ("age".to_owned(), AttributeValue::Number(30.0)),
    ]
    .into_iter()
    .collect();

    let variation = client.activate("checkout_test", "test-user", &attributes);
    println!("Variation: {:?}", variation);

    let enabled = client.is_feature_enabled("checkout_redesign", "test-user", &attributes);
    let headline = client
        .get_feature_variable_string("checkout_redesign", "headline", "test-user", &attributes)
        // default value
        .unwrap_or_else(|| "Welcome".to_owned());
    println!("Feature enabled: {enabled}, headline: {headline}");

    let tags: EventTags = [("revenue".to_owned(), AttributeValue::Number(4200.0))]
        .into_iter()
        .collect();
    client.track("purchase", "test-user", &attributes, &tags);

    // Flushes queued events before exiting.
    client.shutdown()
}
