//! `splitkit` decides which experiment variation or feature flag value a user gets, and reliably
//! reports those decisions as analytics events.
//!
//! # Overview
//!
//! The SDK revolves around a [`Client`] that makes decisions for users, where each user has a
//! unique id and key-value [`Attributes`] associated with it. Decisions are driven by a datafile:
//! a versioned project configuration describing experiments, audiences, traffic splits, mutual
//! exclusion groups, feature flags and rollouts. The datafile is fetched periodically by a
//! background [`PollerThread`] and published atomically, so a decision always sees one complete
//! datafile.
//!
//! Bucketing is deterministic: the same user, attributes and datafile always produce the same
//! variation.
//!
//! Impressions and conversions are delivered at least once. Events that fail to send are kept in
//! an [`EventStore`] and redelivered with exponential backoff. Use [`FileEventStore`] to keep them
//! across restarts.
//!
//! Network and storage access go through the [`Transport`], [`EventStore`] and [`KeyValueStore`]
//! traits. The SDK ships default implementations of each.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. [`Error::kind`] classifies them.
//!
//! Decision methods of [`Client`] never return errors. If the datafile hasn't been loaded yet or
//! a key is unknown, they log a warning and return a default value, as decisions should not be
//! critical enough to cause system crashes. Lifecycle methods return errors, which usually
//! indicate that developer's attention is needed.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages with structured key-values, under the `splitkit` target. Consider integrating a
//! `log`-compatible logger implementation for better visibility into SDK operations.
//!
//! # Examples
//!
//! ```no_run
//! # use splitkit::{Attributes, ClientConfig};
//! let client = ClientConfig::from_sdk_key("sdk-key").to_client()?;
//! client.start_poller_thread()?;
//! client.wait_for_configuration()?;
//!
//! let attributes = Attributes::from([("country".to_owned(), "US".into())]);
//! if let Some(variation) = client.activate("checkout_test", "user42", &attributes) {
//!     println!("user42 is in {variation}");
//! }
//! client.shutdown()?;
//! # Ok::<(), splitkit::Error>(())
//! ```
//!
//! A complete program can be found in the `demos` directory of the crate repository.

#![warn(rustdoc::missing_crate_level_docs)]

mod attributes;
mod client;
mod clock;
mod conditions;
mod config;
mod configuration_store;
pub mod datafile;
mod datafile_manager;
mod decision;
mod dispatcher;
mod error;
mod event;
mod notification;
mod poller;
mod project_config;
mod retry;
mod sharder;
mod single_flight;
mod storage;
mod transport;
mod user_profile;

pub use attributes::{
    is_reserved_attribute, is_valid_attribute_value, is_valid_number, AttributeValue, Attributes,
    BOT_FILTERING_ATTRIBUTE, BUCKETING_ID_ATTRIBUTE, USER_AGENT_ATTRIBUTE,
};
pub use client::Client;
pub use clock::{Clock, ManualClock, SystemClock};
pub use conditions::{Condition, ConditionTree, MatchType};
pub use config::ClientConfig;
pub use configuration_store::ConfigurationStore;
pub use datafile_manager::{DatafileManager, DatafileManagerConfig, SyncOutcome};
pub use decision::{
    DecisionReason, DecisionService, DecisionSource, ExperimentDecision, FeatureDecision,
};
pub use dispatcher::{EventDispatcher, EventDispatcherConfig, EventProcessor, FlushOutcome};
pub use error::{Error, ErrorKind, Result};
pub use event::{
    DecisionEntry, EventBatch, EventBuilder, EventKind, EventRecord, EventTags, Snapshot,
    SnapshotEvent, Visitor, VisitorAttribute, REVENUE_TAG, VALUE_TAG,
};
pub use notification::{
    ActivateListener, ActivateNotification, ConfigUpdateListener, ConfigUpdateNotification,
    NotificationCenter, NotificationId, NotificationType, TrackListener, TrackNotification,
};
pub use poller::{PollerThread, PollerThreadConfig};
pub use project_config::ProjectConfig;
pub use retry::RetryPolicy;
pub use sharder::{bucket, find_entity, MurmurSharder, Sharder, MAX_TRAFFIC_VALUE};
pub use storage::{
    EventStore, FileEventStore, FileKeyValueStore, InMemoryEventStore, InMemoryKeyValueStore,
    KeyValueStore, StoredRecord,
};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Method, Transport, TransportError};
pub use user_profile::{
    InMemoryUserProfileService, KeyValueUserProfileService, StickyDecision, UserProfile,
    UserProfileService,
};
