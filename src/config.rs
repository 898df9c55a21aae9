use std::{sync::Arc, time::Duration};

use crate::{
    clock::{Clock, SystemClock},
    datafile_manager::DatafileManagerConfig,
    dispatcher::EventDispatcherConfig,
    poller::PollerThreadConfig,
    retry::RetryPolicy,
    storage::{EventStore, KeyValueStore},
    transport::Transport,
    user_profile::UserProfileService,
    Client, Result,
};

/// Configuration for [`Client`].
pub struct ClientConfig {
    pub(crate) sdk_key: String,
    pub(crate) datafile_base_url: String,
    pub(crate) event_endpoint: String,
    pub(crate) request_timeout: Duration,
    pub(crate) poller: PollerThreadConfig,
    pub(crate) flush_interval: Option<Duration>,
    pub(crate) batch_size: usize,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) transport: Option<Arc<dyn Transport + Send + Sync>>,
    pub(crate) event_store: Option<Arc<dyn EventStore + Send + Sync>>,
    pub(crate) key_value_store: Option<Arc<dyn KeyValueStore + Send + Sync>>,
    pub(crate) user_profile_service: Option<Arc<dyn UserProfileService + Send + Sync>>,
    pub(crate) clock: Arc<dyn Clock + Send + Sync>,
    pub(crate) fallback_datafile: Option<Vec<u8>>,
}

impl ClientConfig {
    /// Default base URL the datafile is fetched from.
    pub const DEFAULT_DATAFILE_BASE_URL: &'static str = DatafileManagerConfig::DEFAULT_BASE_URL;
    /// Default URL events are posted to.
    pub const DEFAULT_EVENT_ENDPOINT: &'static str = EventDispatcherConfig::DEFAULT_ENDPOINT;
    /// Default timeout of datafile and event requests.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default interval of the background queue flush.
    pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

    /// Create a default configuration using the specified SDK key.
    ///
    /// ```
    /// # use splitkit::ClientConfig;
    /// ClientConfig::from_sdk_key("sdk-key");
    /// ```
    pub fn from_sdk_key(sdk_key: impl Into<String>) -> Self {
        ClientConfig {
            sdk_key: sdk_key.into(),
            datafile_base_url: ClientConfig::DEFAULT_DATAFILE_BASE_URL.to_owned(),
            event_endpoint: ClientConfig::DEFAULT_EVENT_ENDPOINT.to_owned(),
            request_timeout: ClientConfig::DEFAULT_REQUEST_TIMEOUT,
            poller: PollerThreadConfig::default(),
            flush_interval: Some(ClientConfig::DEFAULT_FLUSH_INTERVAL),
            batch_size: EventDispatcherConfig::DEFAULT_BATCH_SIZE,
            retry_policy: RetryPolicy::default(),
            transport: None,
            event_store: None,
            key_value_store: None,
            user_profile_service: None,
            clock: Arc::new(SystemClock),
            fallback_datafile: None,
        }
    }

    /// Override base URL of the datafile CDN. Clients should use the default setting in most
    /// cases.
    pub fn datafile_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.datafile_base_url = base_url.into();
        self
    }

    /// Override the URL events are posted to.
    pub fn event_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.event_endpoint = endpoint.into();
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Configure the datafile poller started with [`Client::start_poller_thread`].
    pub fn poller(mut self, poller: PollerThreadConfig) -> Self {
        self.poller = poller;
        self
    }

    /// Interval of the background queue flush. `None` disables the timer. The queue is still
    /// flushed after every dispatch, on [`Client::flush`] and on shutdown.
    pub fn flush_interval(mut self, interval: Option<Duration>) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Number of queued events read at a time while flushing.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Replace the default `reqwest`-based HTTP transport.
    pub fn transport(mut self, transport: impl Transport + Send + Sync + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Durable storage for the event retry queue. Defaults to an in-memory queue.
    pub fn event_store(mut self, event_store: impl EventStore + Send + Sync + 'static) -> Self {
        self.event_store = Some(Arc::new(event_store));
        self
    }

    /// Storage for the last fetched datafile, used on cold start.
    pub fn key_value_store(
        mut self,
        key_value_store: impl KeyValueStore + Send + Sync + 'static,
    ) -> Self {
        self.key_value_store = Some(Arc::new(key_value_store));
        self
    }

    /// Enable sticky bucketing.
    ///
    /// ```
    /// # use splitkit::{ClientConfig, InMemoryUserProfileService};
    /// ClientConfig::from_sdk_key("sdk-key")
    ///     .user_profile_service(InMemoryUserProfileService::new());
    /// ```
    pub fn user_profile_service(
        mut self,
        user_profile_service: impl UserProfileService + Send + Sync + 'static,
    ) -> Self {
        self.user_profile_service = Some(Arc::new(user_profile_service));
        self
    }

    pub fn clock(mut self, clock: impl Clock + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Datafile bundled with the application. It is used until the first successful fetch when
    /// no cached datafile is available.
    pub fn fallback_datafile(mut self, datafile: impl Into<Vec<u8>>) -> Self {
        self.fallback_datafile = Some(datafile.into());
        self
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidBaseUrl`](crate::Error::InvalidBaseUrl) if the datafile URL is invalid.
    /// - [`Error::Io`](crate::Error::Io) if the event processor thread failed to start.
    ///
    /// ```
    /// # use splitkit::{Client, ClientConfig};
    /// let client: Client = ClientConfig::from_sdk_key("sdk-key").to_client().unwrap();
    /// # client.shutdown().unwrap();
    /// ```
    pub fn to_client(self) -> Result<Client> {
        Client::new(self)
    }
}
