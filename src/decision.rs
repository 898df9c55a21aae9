//! Decision service: turns a user and a snapshot into a variation.
use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    attributes::bucketing_id,
    datafile::{Experiment, FeatureFlag, GroupPolicy, Variation},
    sharder::{bucket, MurmurSharder, Sharder},
    user_profile::{UserProfile, UserProfileService},
    Attributes, Error, ProjectConfig, Result,
};

/// Number of locks that sticky bucketing read-modify-write sequences are striped over.
const USER_LOCK_STRIPES: usize = 64;

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    /// Runtime override set with [`DecisionService::set_forced_variation`].
    ForcedVariation,
    /// User is listed in the experiment's whitelist.
    Whitelisted,
    ExperimentNotRunning,
    AudienceMismatch,
    /// Variation returned from the user profile without re-bucketing.
    StickyBucketed,
    /// User was bucketed into another experiment of the same mutual exclusion group.
    GroupExcluded,
    /// User fell into holdback traffic.
    NotBucketed,
    Bucketed,
}

/// Outcome of [`DecisionService::get_variation`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExperimentDecision<'a> {
    pub variation: Option<&'a Variation>,
    pub reason: DecisionReason,
}

impl<'a> ExperimentDecision<'a> {
    fn new(variation: Option<&'a Variation>, reason: DecisionReason) -> Self {
        ExperimentDecision { variation, reason }
    }

    fn none(reason: DecisionReason) -> Self {
        ExperimentDecision::new(None, reason)
    }
}

/// Where a feature decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    /// An A/B test attached to the feature. These decisions produce impressions.
    FeatureTest,
    /// A rollout rule. These decisions don't produce impressions.
    Rollout,
}

/// Outcome of [`DecisionService::get_variation_for_feature`].
#[derive(Debug, Clone, Copy)]
pub struct FeatureDecision<'a> {
    pub experiment: &'a Experiment,
    pub variation: &'a Variation,
    pub source: DecisionSource,
}

/// Layers forced variations, whitelists, sticky bucketing, and mutual exclusion on top of
/// bucketing.
pub struct DecisionService {
    sharder: Box<dyn Sharder + Send + Sync>,
    user_profile_service: Option<Arc<dyn UserProfileService + Send + Sync>>,
    /// (experiment id, user id) to variation id.
    forced_variations: Mutex<HashMap<(String, String), String>>,
    user_locks: Vec<Mutex<()>>,
}

impl DecisionService {
    pub fn new(
        user_profile_service: Option<Arc<dyn UserProfileService + Send + Sync>>,
    ) -> DecisionService {
        DecisionService::with_sharder(MurmurSharder, user_profile_service)
    }

    pub fn with_sharder(
        sharder: impl Sharder + Send + Sync + 'static,
        user_profile_service: Option<Arc<dyn UserProfileService + Send + Sync>>,
    ) -> DecisionService {
        DecisionService {
            sharder: Box::new(sharder),
            user_profile_service,
            forced_variations: Mutex::new(HashMap::new()),
            user_locks: (0..USER_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Decide which variation of `experiment` the user gets.
    pub fn get_variation<'a>(
        &self,
        config: &'a ProjectConfig,
        experiment: &'a Experiment,
        user_id: &str,
        attributes: &Attributes,
    ) -> ExperimentDecision<'a> {
        let decision = self.decide(config, experiment, user_id, attributes);
        log::debug!(target: "splitkit",
                    experiment_key:display = experiment.key,
                    user_id,
                    variation_key = decision.variation.map(|v| v.key.as_str()).unwrap_or(""),
                    reason:debug = decision.reason;
                    "decided variation");
        decision
    }

    fn decide<'a>(
        &self,
        config: &'a ProjectConfig,
        experiment: &'a Experiment,
        user_id: &str,
        attributes: &Attributes,
    ) -> ExperimentDecision<'a> {
        if let Some(variation) = self.forced_variation(experiment, user_id) {
            return ExperimentDecision::new(Some(variation), DecisionReason::ForcedVariation);
        }

        if let Some(variation) = whitelisted_variation(experiment, user_id) {
            return ExperimentDecision::new(Some(variation), DecisionReason::Whitelisted);
        }

        if !experiment.is_running() {
            return ExperimentDecision::none(DecisionReason::ExperimentNotRunning);
        }

        if !config.is_in_audience(experiment, attributes) {
            return ExperimentDecision::none(DecisionReason::AudienceMismatch);
        }

        let bucketing_id = bucketing_id(user_id, attributes);

        let Some(user_profile_service) = &self.user_profile_service else {
            return self.bucket_experiment(config, experiment, bucketing_id);
        };

        // Lookup, bucket and save must not interleave with another decision for the same user.
        let _guard = self.lock_user(user_id);

        let mut profile = user_profile_service
            .lookup(user_id)
            .unwrap_or_else(|err| {
                log::warn!(target: "splitkit",
                           user_id,
                           err:display = err;
                           "failed to look up user profile, bucketing without it");
                None
            });

        if let Some(stored_id) = profile.as_ref().and_then(|p| p.variation_id(&experiment.id)) {
            match experiment.variation_by_id(stored_id) {
                Some(variation) => {
                    return ExperimentDecision::new(
                        Some(variation),
                        DecisionReason::StickyBucketed,
                    );
                }
                None => {
                    log::info!(target: "splitkit",
                               experiment_key:display = experiment.key,
                               user_id,
                               variation_id = stored_id;
                               "stored variation no longer exists, re-bucketing");
                }
            }
        }

        let decision = self.bucket_experiment(config, experiment, bucketing_id);
        if let Some(variation) = decision.variation {
            let profile = profile.get_or_insert_with(|| UserProfile::new(user_id));
            profile.set_variation_id(&experiment.id, &variation.id);
            if let Err(err) = user_profile_service.save(profile) {
                log::warn!(target: "splitkit",
                           user_id,
                           err:display = err;
                           "failed to save user profile");
            }
        }
        decision
    }

    fn bucket_experiment<'a>(
        &self,
        config: &'a ProjectConfig,
        experiment: &'a Experiment,
        bucketing_id: &str,
    ) -> ExperimentDecision<'a> {
        if let Some(group) = experiment
            .group_id
            .as_deref()
            .and_then(|id| config.group_by_id(id))
        {
            if group.policy == GroupPolicy::Random {
                let member = bucket(
                    self.sharder.as_ref(),
                    bucketing_id,
                    &group.id,
                    &group.traffic_allocation,
                );
                if member != Some(experiment.id.as_str()) {
                    return ExperimentDecision::none(DecisionReason::GroupExcluded);
                }
            }
        }

        let variation = bucket(
            self.sharder.as_ref(),
            bucketing_id,
            &experiment.id,
            &experiment.traffic_allocation,
        )
        .and_then(|variation_id| {
            let variation = experiment.variation_by_id(variation_id);
            if variation.is_none() {
                log::warn!(target: "splitkit",
                           experiment_key:display = experiment.key,
                           variation_id;
                           "traffic allocation references unknown variation");
            }
            variation
        });

        match variation {
            Some(variation) => ExperimentDecision::new(Some(variation), DecisionReason::Bucketed),
            None => ExperimentDecision::none(DecisionReason::NotBucketed),
        }
    }

    /// Decide whether the feature is on for the user, and through which rule.
    ///
    /// Returns `None` if neither a feature test nor a rollout rule applies, in which case the
    /// feature is disabled and variables take their default values.
    pub fn get_variation_for_feature<'a>(
        &self,
        config: &'a ProjectConfig,
        feature: &'a FeatureFlag,
        user_id: &str,
        attributes: &Attributes,
    ) -> Option<FeatureDecision<'a>> {
        for experiment_id in &feature.experiment_ids {
            let Some(experiment) = config.experiment_by_id(experiment_id) else {
                log::warn!(target: "splitkit",
                           feature_key:display = feature.key,
                           experiment_id:display = experiment_id;
                           "feature references unknown experiment");
                continue;
            };
            if let Some(variation) = self
                .get_variation(config, experiment, user_id, attributes)
                .variation
            {
                return Some(FeatureDecision {
                    experiment,
                    variation,
                    source: DecisionSource::FeatureTest,
                });
            }
        }

        self.get_variation_for_rollout(config, feature, user_id, attributes)
    }

    fn get_variation_for_rollout<'a>(
        &self,
        config: &'a ProjectConfig,
        feature: &'a FeatureFlag,
        user_id: &str,
        attributes: &Attributes,
    ) -> Option<FeatureDecision<'a>> {
        if feature.rollout_id.is_empty() {
            return None;
        }
        let Some(rollout) = config.rollout_by_id(&feature.rollout_id) else {
            log::warn!(target: "splitkit",
                       feature_key:display = feature.key,
                       rollout_id:display = feature.rollout_id;
                       "feature references unknown rollout");
            return None;
        };

        let bucketing_id = bucketing_id(user_id, attributes);
        rollout.experiments.iter().find_map(|rule| {
            if !config.is_in_audience(rule, attributes) {
                return None;
            }
            let variation_id = bucket(
                self.sharder.as_ref(),
                bucketing_id,
                &rule.id,
                &rule.traffic_allocation,
            )?;
            let variation = rule.variation_by_id(variation_id)?;
            log::debug!(target: "splitkit",
                        feature_key:display = feature.key,
                        user_id,
                        rule_id:display = rule.id;
                        "user qualified for rollout rule");
            Some(FeatureDecision {
                experiment: rule,
                variation,
                source: DecisionSource::Rollout,
            })
        })
    }

    /// Force the user into a variation of an experiment, or clear the override when
    /// `variation_key` is `None`.
    ///
    /// Overrides are kept by experiment and variation id, so they survive datafile updates as long
    /// as the variation still exists.
    pub fn set_forced_variation(
        &self,
        config: &ProjectConfig,
        experiment_key: &str,
        user_id: &str,
        variation_key: Option<&str>,
    ) -> Result<()> {
        let experiment = config
            .experiment_by_key(experiment_key)
            .ok_or_else(|| Error::ExperimentNotFound(experiment_key.to_owned()))?;
        let key = (experiment.id.clone(), user_id.to_owned());

        let mut forced_variations = self
            .forced_variations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match variation_key {
            None => {
                forced_variations.remove(&key);
            }
            Some(variation_key) => {
                let variation = experiment
                    .variation_by_key(variation_key)
                    .ok_or_else(|| Error::VariationNotFound(variation_key.to_owned()))?;
                forced_variations.insert(key, variation.id.clone());
            }
        }
        Ok(())
    }

    /// Return the runtime override for the user, if one is set and still valid.
    pub fn get_forced_variation<'a>(
        &self,
        config: &'a ProjectConfig,
        experiment_key: &str,
        user_id: &str,
    ) -> Option<&'a Variation> {
        let experiment = config.experiment_by_key(experiment_key)?;
        self.forced_variation(experiment, user_id)
    }

    fn forced_variation<'a>(
        &self,
        experiment: &'a Experiment,
        user_id: &str,
    ) -> Option<&'a Variation> {
        let forced_variations = self
            .forced_variations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let variation_id = forced_variations.get(&(experiment.id.clone(), user_id.to_owned()))?;
        experiment.variation_by_id(variation_id)
    }

    fn lock_user(&self, user_id: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        let stripe = (hasher.finish() % self.user_locks.len() as u64) as usize;
        self.user_locks[stripe]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn whitelisted_variation<'a>(experiment: &'a Experiment, user_id: &str) -> Option<&'a Variation> {
    let variation_key = experiment.forced_variations.get(user_id)?;
    let variation = experiment.variation_by_key(variation_key);
    if variation.is_none() {
        log::warn!(target: "splitkit",
                   experiment_key:display = experiment.key,
                   user_id,
                   variation_key:display = variation_key;
                   "whitelist references unknown variation");
    }
    variation
}
