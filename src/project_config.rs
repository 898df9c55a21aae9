use std::{collections::HashMap, sync::Arc};

use crate::{
    conditions::Condition,
    datafile::{
        Attribute, Audience, Datafile, EventDefinition, Experiment, FeatureFlag, Group, Rollout,
        TrafficAllocation,
    },
    sharder::MAX_TRAFFIC_VALUE,
    Attributes, Error, Result,
};

/// Datafile versions this SDK understands.
const SUPPORTED_VERSIONS: &[&str] = &["2", "3", "4"];

/// Immutable, indexed view of a datafile.
///
/// A `ProjectConfig` is built once and never mutated. Publishing a new datafile builds a brand new
/// `ProjectConfig` that replaces the old one in [`ConfigurationStore`](crate::ConfigurationStore).
#[derive(Debug)]
pub struct ProjectConfig {
    version: String,
    account_id: String,
    project_id: String,
    revision: String,
    anonymize_ip: bool,
    bot_filtering: Option<bool>,

    /// Experiments by id, including group members.
    experiments: HashMap<String, Experiment>,
    /// Experiment key to id.
    experiment_keys: HashMap<String, String>,
    events: HashMap<String, EventDefinition>,
    attributes: HashMap<String, Attribute>,
    audiences: HashMap<String, Audience>,
    groups: HashMap<String, Group>,
    feature_flags: HashMap<String, FeatureFlag>,
    rollouts: HashMap<String, Rollout>,
}

impl ProjectConfig {
    /// Parse and validate a raw datafile.
    pub fn from_bytes(bytes: &[u8]) -> Result<ProjectConfig> {
        let datafile: Datafile = serde_json::from_slice(bytes)
            .map_err(|err| Error::ConfigurationParseError(Arc::new(err)))?;
        ProjectConfig::from_datafile(datafile)
    }

    /// Validate `datafile` and build indices over it.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedDatafileVersion`] if the schema version is unknown.
    /// - [`Error::InvalidTrafficAllocation`] if any allocation has decreasing bounds or bounds
    ///   past the bucketing space.
    pub fn from_datafile(datafile: Datafile) -> Result<ProjectConfig> {
        if !SUPPORTED_VERSIONS.contains(&datafile.version.as_str()) {
            return Err(Error::UnsupportedDatafileVersion(datafile.version));
        }

        let Datafile {
            version,
            account_id,
            project_id,
            revision,
            anonymize_ip,
            bot_filtering,
            attributes,
            audiences,
            typed_audiences,
            events,
            mut experiments,
            groups,
            feature_flags,
            mut rollouts,
        } = datafile;

        let groups = groups
            .into_iter()
            .map(|mut group| {
                validate_allocation(&group.id, &group.traffic_allocation)?;
                for mut experiment in group.experiments.drain(..) {
                    experiment.group_id = Some(group.id.clone());
                    experiments.push(experiment);
                }
                Ok((group.id.clone(), group))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        for experiment in &mut experiments {
            validate_allocation(&experiment.id, &experiment.traffic_allocation)?;
            experiment.index();
        }
        for rule in rollouts.iter_mut().flat_map(|r| r.experiments.iter_mut()) {
            validate_allocation(&rule.id, &rule.traffic_allocation)?;
            rule.index();
        }

        let experiment_keys = experiments
            .iter()
            .map(|e| (e.key.clone(), e.id.clone()))
            .collect();
        let experiments = experiments
            .into_iter()
            .map(|e| (e.id.clone(), e))
            .collect();

        // Typed audiences are inserted last so that they win over legacy audiences with the same
        // id.
        let audiences = audiences
            .into_iter()
            .chain(typed_audiences)
            .map(|a| (a.id.clone(), a))
            .collect();

        Ok(ProjectConfig {
            version,
            account_id,
            project_id,
            revision,
            anonymize_ip,
            bot_filtering,
            experiments,
            experiment_keys,
            events: events.into_iter().map(|e| (e.key.clone(), e)).collect(),
            attributes: attributes.into_iter().map(|a| (a.key.clone(), a)).collect(),
            audiences,
            groups,
            feature_flags: feature_flags
                .into_iter()
                .map(|f| (f.key.clone(), f))
                .collect(),
            rollouts: rollouts.into_iter().map(|r| (r.id.clone(), r)).collect(),
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Datafile revision. Increases with every published change.
    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn anonymize_ip(&self) -> bool {
        self.anonymize_ip
    }

    pub fn bot_filtering(&self) -> Option<bool> {
        self.bot_filtering
    }

    pub fn experiment_by_key(&self, key: &str) -> Option<&Experiment> {
        self.experiment_keys
            .get(key)
            .and_then(|id| self.experiments.get(id))
    }

    pub fn experiment_by_id(&self, id: &str) -> Option<&Experiment> {
        self.experiments.get(id)
    }

    pub fn event_by_key(&self, key: &str) -> Option<&EventDefinition> {
        self.events.get(key)
    }

    pub fn attribute_by_key(&self, key: &str) -> Option<&Attribute> {
        self.attributes.get(key)
    }

    pub fn audience_by_id(&self, id: &str) -> Option<&Audience> {
        self.audiences.get(id)
    }

    pub fn group_by_id(&self, id: &str) -> Option<&Group> {
        self.groups.get(id)
    }

    pub fn feature_flag_by_key(&self, key: &str) -> Option<&FeatureFlag> {
        self.feature_flags.get(key)
    }

    pub fn feature_flags(&self) -> impl Iterator<Item = &FeatureFlag> {
        self.feature_flags.values()
    }

    pub fn rollout_by_id(&self, id: &str) -> Option<&Rollout> {
        self.rollouts.get(id)
    }

    /// Evaluate the audiences of `experiment` against `attributes`.
    ///
    /// Returns `Some(true)` for experiments without audiences. References to unknown audiences
    /// evaluate to unknown.
    pub fn evaluate_audiences(
        &self,
        experiment: &Experiment,
        attributes: &Attributes,
    ) -> Option<bool> {
        let Some(tree) = &experiment.audience_conditions else {
            return Some(true);
        };

        tree.evaluate(&mut |audience_id: &String| {
            let Some(audience) = self.audiences.get(audience_id) else {
                log::warn!(target: "splitkit",
                           experiment_key:display = experiment.key,
                           audience_id:display = audience_id;
                           "experiment references unknown audience");
                return None;
            };
            let result = audience
                .conditions
                .evaluate(&mut |condition: &Condition| condition.eval(attributes));
            log::trace!(target: "splitkit",
                        audience_id:display = audience_id,
                        result:debug = result;
                        "evaluated audience");
            result
        })
    }

    /// Returns `true` if the user passes the audience check of `experiment`. Unknown results
    /// exclude the user.
    pub fn is_in_audience(&self, experiment: &Experiment, attributes: &Attributes) -> bool {
        self.evaluate_audiences(experiment, attributes)
            .unwrap_or(false)
    }
}

/// Check that allocation bounds are non-decreasing and within the bucketing space.
fn validate_allocation(entity_id: &str, allocation: &[TrafficAllocation]) -> Result<()> {
    let mut previous = 0;
    for slot in allocation {
        if slot.end_of_range < previous || slot.end_of_range > MAX_TRAFFIC_VALUE {
            return Err(Error::InvalidTrafficAllocation(entity_id.to_owned()));
        }
        previous = slot.end_of_range;
    }
    Ok(())
}
