//! Wire models of the project datafile.
//!
//! These mirror the JSON document as served by the CDN. [`ProjectConfig`](crate::ProjectConfig)
//! indexes and validates them; nothing else should consume them directly.
use std::collections::HashMap;

use serde::Deserialize;

use crate::conditions::{
    deserialize_audience_conditions, deserialize_audience_id_tree, Condition, ConditionTree,
};

/// Project datafile.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Datafile {
    pub version: String,
    pub account_id: String,
    pub project_id: String,
    pub revision: String,
    #[serde(default, rename = "anonymizeIP")]
    pub anonymize_ip: bool,
    #[serde(default)]
    pub bot_filtering: Option<bool>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    #[serde(default)]
    pub audiences: Vec<Audience>,
    /// Audiences with inline condition trees and non-exact match types. Override legacy
    /// `audiences` that share an id.
    #[serde(default)]
    pub typed_audiences: Vec<Audience>,
    #[serde(default)]
    pub events: Vec<EventDefinition>,
    #[serde(default)]
    pub experiments: Vec<Experiment>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub feature_flags: Vec<FeatureFlag>,
    #[serde(default)]
    pub rollouts: Vec<Rollout>,
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TryParse<T> {
    Parsed(T),
    ParseFailed(serde_json::Value),
}
impl<'a, T> From<&'a TryParse<T>> for Option<&'a T> {
    fn from(value: &'a TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attribute {
    pub id: String,
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Audience {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(deserialize_with = "deserialize_audience_conditions")]
    pub conditions: ConditionTree<Condition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDefinition {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub experiment_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ExperimentStatus {
    Running,
    Paused,
    #[serde(rename = "Not started")]
    NotStarted,
    Launched,
    Archived,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: String,
    pub key: String,
    pub status: ExperimentStatus,
    #[serde(default)]
    pub layer_id: String,
    #[serde(default)]
    pub variations: Vec<Variation>,
    #[serde(default)]
    pub traffic_allocation: Vec<TrafficAllocation>,
    /// Legacy audience list, combined with an implicit OR.
    #[serde(default)]
    pub audience_ids: Vec<String>,
    /// Audience id expression. Takes precedence over `audience_ids` when present.
    #[serde(default, deserialize_with = "deserialize_audience_id_tree")]
    pub audience_conditions: Option<ConditionTree<String>>,
    /// Whitelist: user id to variation key.
    #[serde(default)]
    pub forced_variations: HashMap<String, String>,
    /// Set while indexing for experiments nested in a group.
    #[serde(skip)]
    pub group_id: Option<String>,
    #[serde(skip)]
    variation_ids: HashMap<String, usize>,
    #[serde(skip)]
    variation_keys: HashMap<String, usize>,
}

impl Experiment {
    /// Build variation indices and fold legacy `audience_ids` into `audience_conditions`.
    pub(crate) fn index(&mut self) {
        self.variation_ids = self
            .variations
            .iter()
            .enumerate()
            .map(|(i, v)| (v.id.clone(), i))
            .collect();
        self.variation_keys = self
            .variations
            .iter()
            .enumerate()
            .map(|(i, v)| (v.key.clone(), i))
            .collect();

        if self.audience_conditions.is_none() && !self.audience_ids.is_empty() {
            self.audience_conditions = Some(ConditionTree::Or(
                self.audience_ids
                    .iter()
                    .cloned()
                    .map(ConditionTree::Leaf)
                    .collect(),
            ));
        }
    }

    pub fn variation_by_id(&self, id: &str) -> Option<&Variation> {
        self.variation_ids.get(id).map(|&i| &self.variations[i])
    }

    pub fn variation_by_key(&self, key: &str) -> Option<&Variation> {
        self.variation_keys.get(key).map(|&i| &self.variations[i])
    }

    pub fn is_running(&self) -> bool {
        self.status == ExperimentStatus::Running
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variation {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub feature_enabled: bool,
    #[serde(default)]
    pub variables: Vec<VariableUsage>,
}

impl Variation {
    /// Variable override value for `variable_id`, if this variation sets one.
    pub fn variable_value(&self, variable_id: &str) -> Option<&str> {
        self.variables
            .iter()
            .find(|usage| usage.id == variable_id)
            .map(|usage| usage.value.as_str())
    }
}

/// A variation's override of a feature variable.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableUsage {
    pub id: String,
    pub value: String,
}

/// One slot of a traffic allocation. Slots are ordered by `end_of_range`, and a slot covers bucket
/// values from the previous slot's bound (inclusive) to its own bound (exclusive).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficAllocation {
    pub entity_id: String,
    pub end_of_range: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    /// Mutually exclusive experiments. Users are bucketed into at most one member.
    Random,
    /// Members are evaluated independently.
    Overlapping,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub policy: GroupPolicy,
    #[serde(default)]
    pub traffic_allocation: Vec<TrafficAllocation>,
    /// Member experiments. Moved into the project-wide experiment index while indexing.
    #[serde(default)]
    pub experiments: Vec<Experiment>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub rollout_id: String,
    #[serde(default)]
    pub experiment_ids: Vec<String>,
    /// Variables with a type this SDK doesn't know fail parsing individually and are skipped.
    #[serde(default)]
    pub variables: Vec<TryParse<FeatureVariable>>,
}

impl FeatureFlag {
    pub fn variables(&self) -> impl Iterator<Item = &FeatureVariable> {
        self.variables
            .iter()
            .filter_map(Option::<&FeatureVariable>::from)
    }

    pub fn variable_by_key(&self, key: &str) -> Option<&FeatureVariable> {
        self.variables().find(|variable| variable.key == key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    Boolean,
    Integer,
    Double,
    String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureVariable {
    pub id: String,
    pub key: String,
    #[serde(rename = "type")]
    pub variable_type: VariableType,
    pub default_value: String,
}

/// An ordered list of audience-gated traffic rules. Rules are experiment-shaped.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    pub id: String,
    #[serde(default)]
    pub experiments: Vec<Experiment>,
}
