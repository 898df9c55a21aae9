//! Analytics events: the canonical record and the builder that produces it.
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    attributes::{
        is_reserved_attribute, is_valid_attribute_value, is_valid_number, BOT_FILTERING_ATTRIBUTE,
    },
    datafile::{EventDefinition, Experiment, Variation},
    AttributeValue, Attributes, ProjectConfig,
};

/// Tags attached to a conversion event.
pub type EventTags = HashMap<String, AttributeValue>;

/// Reserved tag carrying revenue in the smallest currency unit. Must be an integer.
pub const REVENUE_TAG: &str = "revenue";
/// Reserved tag carrying a numeric metric value.
pub const VALUE_TAG: &str = "value";

const CLIENT_NAME: &str = "splitkit-rust";
const CUSTOM_ATTRIBUTE_TYPE: &str = "custom";
const ACTIVATE_EVENT_KEY: &str = "campaign_activated";

/// An analytics event ready for delivery.
///
/// Records are immutable once built. `id` increases with build order within a process and is used
/// for logging only. Queue order is kept by the event store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    /// Body posted to the event endpoint.
    pub payload: EventBatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A user was exposed to a variation.
    Impression {
        experiment_id: String,
        variation_id: String,
    },
    /// A user performed a tracked action.
    Conversion { event_key: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub account_id: String,
    pub project_id: String,
    pub revision: String,
    pub client_name: String,
    pub client_version: String,
    pub anonymize_ip: bool,
    pub enrich_decisions: bool,
    pub visitors: Vec<Visitor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visitor {
    pub visitor_id: String,
    pub attributes: Vec<VisitorAttribute>,
    pub snapshots: Vec<Snapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitorAttribute {
    pub entity_id: String,
    pub key: String,
    #[serde(rename = "type")]
    pub attribute_type: String,
    pub value: AttributeValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decisions: Vec<DecisionEntry>,
    pub events: Vec<SnapshotEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionEntry {
    pub campaign_id: String,
    pub experiment_id: String,
    pub variation_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEvent {
    pub entity_id: String,
    pub key: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revenue: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: EventTags,
}

/// Builds [`EventRecord`]s from decisions and track calls.
#[derive(Debug)]
pub struct EventBuilder {
    next_id: AtomicU64,
}

impl Default for EventBuilder {
    fn default() -> Self {
        EventBuilder::new()
    }
}

impl EventBuilder {
    pub fn new() -> EventBuilder {
        // Seeding from the wall clock keeps ids increasing across restarts in practice.
        let seed = Utc::now().timestamp_micros().max(0) as u64;
        EventBuilder {
            next_id: AtomicU64::new(seed),
        }
    }

    /// Build the impression sent when a user is exposed to `variation`.
    pub fn build_impression(
        &self,
        config: &ProjectConfig,
        experiment: &Experiment,
        variation: &Variation,
        user_id: &str,
        attributes: &Attributes,
    ) -> EventRecord {
        let timestamp = Utc::now();
        let snapshot = Snapshot {
            decisions: vec![DecisionEntry {
                campaign_id: experiment.layer_id.clone(),
                experiment_id: experiment.id.clone(),
                variation_id: variation.id.clone(),
            }],
            events: vec![SnapshotEvent {
                entity_id: experiment.layer_id.clone(),
                key: ACTIVATE_EVENT_KEY.to_owned(),
                timestamp: timestamp.timestamp_millis(),
                uuid: Uuid::new_v4().to_string(),
                revenue: None,
                value: None,
                tags: EventTags::new(),
            }],
        };

        self.record(
            config,
            user_id,
            attributes,
            snapshot,
            timestamp,
            EventKind::Impression {
                experiment_id: experiment.id.clone(),
                variation_id: variation.id.clone(),
            },
        )
    }

    /// Build the conversion sent for a track call.
    ///
    /// `event_value` is the legacy revenue argument. It is used only when `tags` carry no revenue.
    /// Reserved tags that cannot be coerced to numbers are dropped with a warning.
    pub fn build_conversion(
        &self,
        config: &ProjectConfig,
        event: &EventDefinition,
        user_id: &str,
        attributes: &Attributes,
        tags: &EventTags,
        event_value: Option<f64>,
    ) -> EventRecord {
        let timestamp = Utc::now();
        let (tags, revenue, value) = prepare_tags(&event.key, tags, event_value);
        let snapshot = Snapshot {
            decisions: Vec::new(),
            events: vec![SnapshotEvent {
                entity_id: event.id.clone(),
                key: event.key.clone(),
                timestamp: timestamp.timestamp_millis(),
                uuid: Uuid::new_v4().to_string(),
                revenue,
                value,
                tags,
            }],
        };

        self.record(
            config,
            user_id,
            attributes,
            snapshot,
            timestamp,
            EventKind::Conversion {
                event_key: event.key.clone(),
            },
        )
    }

    fn record(
        &self,
        config: &ProjectConfig,
        user_id: &str,
        attributes: &Attributes,
        snapshot: Snapshot,
        timestamp: DateTime<Utc>,
        kind: EventKind,
    ) -> EventRecord {
        let payload = EventBatch {
            account_id: config.account_id().to_owned(),
            project_id: config.project_id().to_owned(),
            revision: config.revision().to_owned(),
            client_name: CLIENT_NAME.to_owned(),
            client_version: env!("CARGO_PKG_VERSION").to_owned(),
            anonymize_ip: config.anonymize_ip(),
            enrich_decisions: true,
            visitors: vec![Visitor {
                visitor_id: user_id.to_owned(),
                attributes: visitor_attributes(config, attributes),
                snapshots: vec![snapshot],
            }],
        };

        EventRecord {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            timestamp,
            kind,
            payload,
        }
    }
}

/// Attributes sent with an event: those declared in the datafile plus reserved `$opt_` ones.
fn visitor_attributes(config: &ProjectConfig, attributes: &Attributes) -> Vec<VisitorAttribute> {
    let mut result = attributes
        .iter()
        .filter(|(_, value)| is_valid_attribute_value(value))
        .filter_map(|(key, value)| {
            let entity_id = if is_reserved_attribute(key) {
                key.clone()
            } else {
                match config.attribute_by_key(key) {
                    Some(attribute) => attribute.id.clone(),
                    None => {
                        log::debug!(target: "splitkit",
                                    attribute:display = key;
                                    "attribute is not in the datafile, not sending it");
                        return None;
                    }
                }
            };
            Some(VisitorAttribute {
                entity_id,
                key: key.clone(),
                attribute_type: CUSTOM_ATTRIBUTE_TYPE.to_owned(),
                value: value.clone(),
            })
        })
        .collect::<Vec<_>>();
    // Attributes come from a HashMap; sort for a stable payload.
    result.sort_by(|a, b| a.key.cmp(&b.key));

    if let Some(bot_filtering) = config.bot_filtering() {
        result.push(VisitorAttribute {
            entity_id: BOT_FILTERING_ATTRIBUTE.to_owned(),
            key: BOT_FILTERING_ATTRIBUTE.to_owned(),
            attribute_type: CUSTOM_ATTRIBUTE_TYPE.to_owned(),
            value: bot_filtering.into(),
        });
    }

    result
}

/// Validate reserved tags and merge the legacy event value.
///
/// Returns the tags to send along with the coerced revenue and value.
fn prepare_tags(
    event_key: &str,
    tags: &EventTags,
    event_value: Option<f64>,
) -> (EventTags, Option<i64>, Option<f64>) {
    let mut tags = tags.clone();
    if let Some(event_value) = event_value {
        // Tags win over the legacy argument.
        tags.entry(REVENUE_TAG.to_owned())
            .or_insert(AttributeValue::Number(event_value));
    }

    let revenue = take_reserved_tag(event_key, &mut tags, REVENUE_TAG, revenue_value);
    let value = take_reserved_tag(event_key, &mut tags, VALUE_TAG, numeric_value);
    (tags, revenue, value)
}

/// Coerce a reserved tag, removing it from `tags` if it can't be coerced.
fn take_reserved_tag<T>(
    event_key: &str,
    tags: &mut EventTags,
    name: &str,
    coerce: fn(&AttributeValue) -> Option<T>,
) -> Option<T> {
    let tag = tags.get(name)?;
    let coerced = coerce(tag);
    if coerced.is_none() {
        log::warn!(target: "splitkit",
                   event_key,
                   tag = name,
                   value:debug = tag;
                   "reserved tag is not numeric, dropping it");
        tags.remove(name);
    }
    coerced
}

fn revenue_value(tag: &AttributeValue) -> Option<i64> {
    match tag {
        AttributeValue::Number(n) if is_valid_number(*n) && n.fract() == 0.0 => Some(*n as i64),
        AttributeValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn numeric_value(tag: &AttributeValue) -> Option<f64> {
    match tag {
        AttributeValue::Number(n) if n.is_finite() => Some(*n),
        AttributeValue::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}
