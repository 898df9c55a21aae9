use std::sync::{Arc, Mutex, PoisonError};

use crate::{
    configuration_store::ConfigurationStore,
    datafile::{Experiment, FeatureFlag, VariableType, Variation},
    datafile_manager::{DatafileManager, DatafileManagerConfig, SyncOutcome},
    decision::{DecisionService, DecisionSource},
    dispatcher::{EventDispatcher, EventDispatcherConfig, EventProcessor},
    event::{EventBuilder, EventTags},
    notification::{ActivateNotification, NotificationCenter, TrackNotification},
    poller::{PollerThread, PollerThreadConfig},
    storage::InMemoryEventStore,
    transport::HttpTransport,
    Attributes, ClientConfig, Error, ProjectConfig, Result,
};

/// A client for making experiment and feature flag decisions.
///
/// In order to create a client instance, first create [`ClientConfig`].
///
/// Decision methods never fail. If the datafile has not been loaded yet, or a key is unknown,
/// they log a warning and return a default: `None` for variations and variables, `false` for
/// feature flags.
///
/// # Examples
/// ```
/// # use splitkit::{Attributes, ClientConfig};
/// let client = ClientConfig::from_sdk_key("sdk-key").to_client().unwrap();
/// let variation = client.activate("checkout_test", "user42", &Attributes::new());
/// # client.shutdown().unwrap();
/// ```
pub struct Client {
    configuration_store: Arc<ConfigurationStore>,
    datafile_manager: Arc<DatafileManager>,
    decision_service: DecisionService,
    event_builder: EventBuilder,
    event_processor: EventProcessor,
    notification_center: Arc<NotificationCenter>,
    poller_config: PollerThreadConfig,
    poller_thread: Mutex<Option<PollerThread>>,
}

impl Client {
    /// Create a new `Client` using the specified configuration.
    ///
    /// Publishes the cached or fallback datafile, if any, and starts the event processor thread.
    /// It does not fetch the datafile. Use [`Client::start_poller_thread`] or
    /// [`Client::sync_configuration`] for that.
    pub fn new(config: ClientConfig) -> Result<Client> {
        let transport = config
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::new()));
        let configuration_store = Arc::new(ConfigurationStore::new());
        let notification_center = Arc::new(NotificationCenter::new());

        let datafile_manager = Arc::new(DatafileManager::new(
            DatafileManagerConfig {
                base_url: config.datafile_base_url,
                sdk_key: config.sdk_key,
                timeout: config.request_timeout,
            },
            Arc::clone(&transport),
            Arc::clone(&configuration_store),
            config.key_value_store,
            Arc::clone(&notification_center),
        )?);
        if let Err(err) = datafile_manager.bootstrap(config.fallback_datafile.as_deref()) {
            log::warn!(target: "splitkit",
                       err:display = err;
                       "fallback datafile is invalid, waiting for the first fetch");
        }

        let dispatcher = Arc::new(EventDispatcher::new(
            transport,
            config
                .event_store
                .unwrap_or_else(|| Arc::new(InMemoryEventStore::new())),
            config.clock,
            EventDispatcherConfig {
                endpoint: config.event_endpoint,
                timeout: config.request_timeout,
                retry_policy: config.retry_policy,
                batch_size: config.batch_size,
            },
        ));
        let event_processor = EventProcessor::start(dispatcher, config.flush_interval)?;
        // Redeliver events left over by a previous run.
        event_processor.flush();

        Ok(Client {
            configuration_store,
            datafile_manager,
            decision_service: DecisionService::new(config.user_profile_service),
            event_builder: EventBuilder::new(),
            event_processor,
            notification_center,
            poller_config: config.poller,
            poller_thread: Mutex::new(None),
        })
    }

    /// Bucket the user into an experiment and send an impression.
    ///
    /// Returns the variation key, or `None` if the user is not in the experiment.
    pub fn activate(
        &self,
        experiment_key: &str,
        user_id: &str,
        attributes: &Attributes,
    ) -> Option<String> {
        let config = self.configuration(experiment_key, user_id)?;
        let experiment = lookup_experiment(&config, experiment_key, user_id)?;
        let variation = self.decide(&config, experiment, user_id, attributes)?;
        self.send_impression(&config, experiment, variation, user_id, attributes);
        Some(variation.key.clone())
    }

    /// Bucket the user into an experiment without sending an impression.
    pub fn get_variation(
        &self,
        experiment_key: &str,
        user_id: &str,
        attributes: &Attributes,
    ) -> Option<String> {
        let config = self.configuration(experiment_key, user_id)?;
        let experiment = lookup_experiment(&config, experiment_key, user_id)?;
        let variation = self.decide(&config, experiment, user_id, attributes)?;
        Some(variation.key.clone())
    }

    /// Send a conversion event.
    ///
    /// Reserved `revenue` and `value` tags are validated. Tags that cannot be coerced to numbers
    /// are dropped from the event.
    pub fn track(
        &self,
        event_key: &str,
        user_id: &str,
        attributes: &Attributes,
        tags: &EventTags,
    ) {
        self.track_event(event_key, user_id, attributes, tags, None);
    }

    /// Send a conversion event with revenue passed as a separate argument.
    ///
    /// Prefer [`Client::track`] with a `revenue` tag. A `revenue` tag in `tags` takes precedence
    /// over `event_value`.
    pub fn track_with_value(
        &self,
        event_key: &str,
        user_id: &str,
        attributes: &Attributes,
        tags: &EventTags,
        event_value: f64,
    ) {
        self.track_event(event_key, user_id, attributes, tags, Some(event_value));
    }

    fn track_event(
        &self,
        event_key: &str,
        user_id: &str,
        attributes: &Attributes,
        tags: &EventTags,
        event_value: Option<f64>,
    ) {
        let Some(config) = self.configuration(event_key, user_id) else {
            return;
        };
        let Some(event) = config.event_by_key(event_key) else {
            log::warn!(target: "splitkit",
                       err:display = Error::EventNotFound(event_key.to_owned()),
                       user_id;
                       "not tracking unknown event");
            return;
        };

        let record = self.event_builder.build_conversion(
            &config,
            event,
            user_id,
            attributes,
            tags,
            event_value,
        );
        log::trace!(target: "splitkit",
                    event_key,
                    user_id,
                    record_id = record.id;
                    "tracking conversion");
        self.notification_center.notify_track(&TrackNotification {
            event_key,
            user_id,
            attributes,
            tags,
            event: &record,
        });
        self.event_processor.process(record);
    }

    /// Returns `true` if the feature is enabled for the user.
    ///
    /// Sends an impression if the decision came from a feature test.
    pub fn is_feature_enabled(
        &self,
        feature_key: &str,
        user_id: &str,
        attributes: &Attributes,
    ) -> bool {
        let Some(config) = self.configuration(feature_key, user_id) else {
            return false;
        };
        let Some(feature) = lookup_feature(&config, feature_key, user_id) else {
            return false;
        };
        self.feature_enabled(&config, feature, user_id, attributes)
    }

    /// Keys of all features enabled for the user, sorted.
    ///
    /// Sends impressions for features decided by feature tests.
    pub fn get_enabled_features(&self, user_id: &str, attributes: &Attributes) -> Vec<String> {
        let Some(config) = self.configuration("", user_id) else {
            return Vec::new();
        };
        let mut enabled = config
            .feature_flags()
            .filter(|feature| self.feature_enabled(&config, feature, user_id, attributes))
            .map(|feature| feature.key.clone())
            .collect::<Vec<_>>();
        enabled.sort();
        enabled
    }

    fn feature_enabled(
        &self,
        config: &ProjectConfig,
        feature: &FeatureFlag,
        user_id: &str,
        attributes: &Attributes,
    ) -> bool {
        let Some(decision) =
            self.decision_service
                .get_variation_for_feature(config, feature, user_id, attributes)
        else {
            log::info!(target: "splitkit",
                       feature_key:display = feature.key,
                       user_id;
                       "user is not in any rule of the feature");
            return false;
        };

        if decision.source == DecisionSource::FeatureTest {
            self.send_impression(
                config,
                decision.experiment,
                decision.variation,
                user_id,
                attributes,
            );
        }

        let enabled = decision.variation.feature_enabled;
        log::debug!(target: "splitkit",
                    feature_key:display = feature.key,
                    user_id,
                    enabled,
                    source:debug = decision.source;
                    "evaluated feature");
        enabled
    }

    /// Value of a boolean feature variable for the user.
    pub fn get_feature_variable_boolean(
        &self,
        feature_key: &str,
        variable_key: &str,
        user_id: &str,
        attributes: &Attributes,
    ) -> Option<bool> {
        let value = self.feature_variable(
            feature_key,
            variable_key,
            VariableType::Boolean,
            user_id,
            attributes,
        )?;
        parse_variable(variable_key, &value, |v| v.parse::<bool>().ok())
    }

    /// Value of an integer feature variable for the user.
    pub fn get_feature_variable_integer(
        &self,
        feature_key: &str,
        variable_key: &str,
        user_id: &str,
        attributes: &Attributes,
    ) -> Option<i64> {
        let value = self.feature_variable(
            feature_key,
            variable_key,
            VariableType::Integer,
            user_id,
            attributes,
        )?;
        parse_variable(variable_key, &value, |v| v.parse::<i64>().ok())
    }

    /// Value of a double feature variable for the user.
    pub fn get_feature_variable_double(
        &self,
        feature_key: &str,
        variable_key: &str,
        user_id: &str,
        attributes: &Attributes,
    ) -> Option<f64> {
        let value = self.feature_variable(
            feature_key,
            variable_key,
            VariableType::Double,
            user_id,
            attributes,
        )?;
        parse_variable(variable_key, &value, |v| {
            v.parse::<f64>().ok().filter(|v| v.is_finite())
        })
    }

    /// Value of a string feature variable for the user.
    pub fn get_feature_variable_string(
        &self,
        feature_key: &str,
        variable_key: &str,
        user_id: &str,
        attributes: &Attributes,
    ) -> Option<String> {
        self.feature_variable(
            feature_key,
            variable_key,
            VariableType::String,
            user_id,
            attributes,
        )
    }

    /// Raw value of a feature variable: the override of the user's variation if the feature is
    /// enabled for them, the default value otherwise.
    fn feature_variable(
        &self,
        feature_key: &str,
        variable_key: &str,
        variable_type: VariableType,
        user_id: &str,
        attributes: &Attributes,
    ) -> Option<String> {
        let config = self.configuration(feature_key, user_id)?;
        let feature = lookup_feature(&config, feature_key, user_id)?;

        let variable = match feature.variable_by_key(variable_key) {
            Some(variable) if variable.variable_type == variable_type => variable,
            found => {
                let err = match found {
                    Some(_) => Error::VariableTypeMismatch(variable_key.to_owned()),
                    None => Error::VariableNotFound(variable_key.to_owned()),
                };
                log::warn!(target: "splitkit",
                           feature_key,
                           variable_key,
                           variable_type:debug = variable_type,
                           err:display = err;
                           "cannot get feature variable");
                return None;
            }
        };

        let decision = self
            .decision_service
            .get_variation_for_feature(&config, feature, user_id, attributes);
        let value = match decision {
            Some(decision) if decision.variation.feature_enabled => decision
                .variation
                .variable_value(&variable.id)
                .unwrap_or(&variable.default_value),
            _ => &variable.default_value,
        };
        log::trace!(target: "splitkit",
                    feature_key,
                    variable_key,
                    user_id,
                    value;
                    "evaluated feature variable");
        Some(value.to_owned())
    }

    /// Force the user into a variation of an experiment, or clear the override with `None`.
    ///
    /// Overrides are kept in memory for the lifetime of the client.
    ///
    /// # Errors
    ///
    /// - [`Error::ConfigurationMissing`] if no datafile has been loaded.
    /// - [`Error::ExperimentNotFound`] or [`Error::VariationNotFound`] for unknown keys.
    pub fn set_forced_variation(
        &self,
        experiment_key: &str,
        user_id: &str,
        variation_key: Option<&str>,
    ) -> Result<()> {
        let config = self
            .configuration_store
            .get_configuration()
            .ok_or(Error::ConfigurationMissing)?;
        self.decision_service
            .set_forced_variation(&config, experiment_key, user_id, variation_key)
            .inspect_err(|err| {
                log::warn!(target: "splitkit",
                           experiment_key,
                           user_id,
                           err:display = err;
                           "cannot set forced variation");
            })
    }

    /// Key of the variation the user was forced into with [`Client::set_forced_variation`].
    pub fn get_forced_variation(&self, experiment_key: &str, user_id: &str) -> Option<String> {
        let config = self.configuration_store.get_configuration()?;
        self.decision_service
            .get_forced_variation(&config, experiment_key, user_id)
            .map(|variation| variation.key.clone())
    }

    /// Publish a datafile provided by the application.
    ///
    /// Returns the revision of the published datafile.
    ///
    /// # Errors
    ///
    /// Returns the parse or validation error. The current datafile stays in effect.
    pub fn set_datafile(&self, datafile: &[u8]) -> Result<String> {
        let config = ProjectConfig::from_bytes(datafile).inspect_err(|err| {
            log::warn!(target: "splitkit", err:display = err; "rejected datafile");
        })?;
        let revision = config.revision().to_owned();
        self.datafile_manager.publish(Arc::new(config));
        Ok(revision)
    }

    /// Fetch the datafile now, on the calling thread.
    pub fn sync_configuration(&self) -> Result<SyncOutcome> {
        self.datafile_manager.sync()
    }

    /// Start a poller thread to fetch the datafile periodically.
    ///
    /// Does nothing if the poller is already running.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the thread failed to start.
    pub fn start_poller_thread(&self) -> Result<()> {
        let mut poller_thread = self
            .poller_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if poller_thread.is_none() {
            *poller_thread = Some(PollerThread::start(
                Arc::clone(&self.datafile_manager),
                self.poller_config.clone(),
            )?);
        }
        Ok(())
    }

    /// Block until the poller thread has synced the datafile once.
    ///
    /// # Errors
    ///
    /// - [`Error::ConfigurationMissing`] if the poller is not running.
    /// - [`Error::PollerThreadStopped`] if the poller was stopped before the first sync.
    /// - Fatal poller errors, such as [`Error::Unauthorized`].
    pub fn wait_for_configuration(&self) -> Result<()> {
        // Wait outside of the lock so that the poller can be stopped meanwhile.
        let result = self
            .poller_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(PollerThread::result)
            .ok_or(Error::ConfigurationMissing)?;
        result.wait()
    }

    /// Stop the poller thread and wait for it to exit. Calling it when no poller is running is a
    /// no-op.
    pub fn stop_poller_thread(&self) -> Result<()> {
        let poller_thread = self
            .poller_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match poller_thread {
            Some(poller_thread) => poller_thread.shutdown(),
            None => Ok(()),
        }
    }

    /// Ask the background thread to redeliver queued events. Does not block.
    pub fn flush(&self) {
        self.event_processor.flush();
    }

    /// Call when the host application goes to the background. Flushes queued events.
    pub fn on_background(&self) {
        log::debug!(target: "splitkit", "application moved to background, flushing events");
        self.event_processor.flush();
    }

    /// Stop background threads, flushing queued events first. Blocks until threads exit.
    ///
    /// Events that could not be delivered stay in the event store. After shutdown, decisions still
    /// work and new events are queued without being sent.
    pub fn shutdown(&self) -> Result<()> {
        let poller_result = self.stop_poller_thread();
        self.event_processor.shutdown()?;
        poller_result
    }

    pub fn notification_center(&self) -> &NotificationCenter {
        &self.notification_center
    }

    /// The currently published datafile.
    pub fn configuration_snapshot(&self) -> Option<Arc<ProjectConfig>> {
        self.configuration_store.get_configuration()
    }

    /// Number of events waiting for redelivery.
    pub fn pending_event_count(&self) -> usize {
        self.event_processor.dispatcher().pending_count()
    }

    fn configuration(&self, key: &str, user_id: &str) -> Option<Arc<ProjectConfig>> {
        let configuration = self.configuration_store.get_configuration();
        if configuration.is_none() {
            log::warn!(target: "splitkit",
                       key,
                       user_id;
                       "making a decision before the datafile has been loaded");
        }
        configuration
    }

    fn decide<'a>(
        &self,
        config: &'a ProjectConfig,
        experiment: &'a Experiment,
        user_id: &str,
        attributes: &Attributes,
    ) -> Option<&'a Variation> {
        let decision = self
            .decision_service
            .get_variation(config, experiment, user_id, attributes);
        if decision.variation.is_none() {
            log::info!(target: "splitkit",
                       experiment_key:display = experiment.key,
                       user_id,
                       reason:debug = decision.reason;
                       "user is not in experiment");
        }
        decision.variation
    }

    fn send_impression(
        &self,
        config: &ProjectConfig,
        experiment: &Experiment,
        variation: &Variation,
        user_id: &str,
        attributes: &Attributes,
    ) {
        let record =
            self.event_builder
                .build_impression(config, experiment, variation, user_id, attributes);
        log::trace!(target: "splitkit",
                    experiment_key:display = experiment.key,
                    variation_key:display = variation.key,
                    user_id,
                    record_id = record.id;
                    "sending impression");
        self.notification_center
            .notify_activate(&ActivateNotification {
                experiment,
                user_id,
                attributes,
                variation,
                event: &record,
            });
        self.event_processor.process(record);
    }
}

fn lookup_experiment<'a>(
    config: &'a ProjectConfig,
    experiment_key: &str,
    user_id: &str,
) -> Option<&'a Experiment> {
    let experiment = config.experiment_by_key(experiment_key);
    if experiment.is_none() {
        log::warn!(target: "splitkit",
                   err:display = Error::ExperimentNotFound(experiment_key.to_owned()),
                   user_id;
                   "unknown experiment");
    }
    experiment
}

fn lookup_feature<'a>(
    config: &'a ProjectConfig,
    feature_key: &str,
    user_id: &str,
) -> Option<&'a FeatureFlag> {
    let feature = config.feature_flag_by_key(feature_key);
    if feature.is_none() {
        log::warn!(target: "splitkit",
                   err:display = Error::FeatureNotFound(feature_key.to_owned()),
                   user_id;
                   "unknown feature flag");
    }
    feature
}

fn parse_variable<T>(
    variable_key: &str,
    value: &str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Option<T> {
    let parsed = parse(value);
    if parsed.is_none() {
        log::warn!(target: "splitkit",
                   variable_key,
                   value;
                   "feature variable value does not match its type");
    }
    parsed
}
