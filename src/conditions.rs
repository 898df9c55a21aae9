//! Audience conditions and their three-valued evaluation.
//!
//! Evaluation results are `Option<bool>`: `None` stands for "unknown" (missing attribute, type
//! mismatch, unsupported condition). Unknown propagates through `and`/`or`/`not` and is only
//! collapsed to `false` at the experiment level.
use semver::Version;
use serde::{de::Error as _, Deserialize, Deserializer};
use serde_json::Value as JsonValue;

use crate::{
    attributes::is_valid_number, AttributeValue, Attributes, Error, Result,
};

const CUSTOM_ATTRIBUTE_CONDITION_TYPE: &str = "custom_attribute";

/// A boolean expression tree over leaves of type `L`.
///
/// Audiences use [`Condition`] leaves; experiments combine audiences by id using `String` leaves.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionTree<L> {
    /// `false` if any child is `false`, else unknown if any child is unknown, else `true`.
    And(Vec<ConditionTree<L>>),
    /// `true` if any child is `true`, else unknown if any child is unknown, else `false`.
    Or(Vec<ConditionTree<L>>),
    /// Flips `true`/`false`; unknown stays unknown.
    Not(Box<ConditionTree<L>>),
    /// A single leaf.
    Leaf(L),
}

impl<L> ConditionTree<L> {
    /// Evaluate the tree, delegating leaves to `eval_leaf`.
    pub fn evaluate<F>(&self, eval_leaf: &mut F) -> Option<bool>
    where
        F: FnMut(&L) -> Option<bool>,
    {
        match self {
            ConditionTree::And(children) => {
                let mut unknown = false;
                for child in children {
                    match child.evaluate(eval_leaf) {
                        Some(false) => return Some(false),
                        None => unknown = true,
                        Some(true) => {}
                    }
                }
                if unknown {
                    None
                } else {
                    Some(true)
                }
            }
            ConditionTree::Or(children) => {
                let mut unknown = false;
                for child in children {
                    match child.evaluate(eval_leaf) {
                        Some(true) => return Some(true),
                        None => unknown = true,
                        Some(false) => {}
                    }
                }
                if unknown {
                    None
                } else {
                    Some(false)
                }
            }
            ConditionTree::Not(child) => child.evaluate(eval_leaf).map(|value| !value),
            ConditionTree::Leaf(leaf) => eval_leaf(leaf),
        }
    }

    /// Decode the JSON list form: `["and" | "or" | "not", ...operands]`. A list that does not
    /// start with an operator is an implicit `or`. An empty list matches everyone.
    pub(crate) fn decode(
        value: &JsonValue,
        decode_leaf: &impl Fn(&JsonValue) -> Result<L>,
    ) -> Result<ConditionTree<L>> {
        let JsonValue::Array(items) = value else {
            return decode_leaf(value).map(ConditionTree::Leaf);
        };

        let (operator, operands) = match items.split_first() {
            None => return Ok(ConditionTree::And(Vec::new())),
            Some((JsonValue::String(op), rest)) if is_operator(op) => (op.as_str(), rest),
            Some(_) => ("or", items.as_slice()),
        };

        let children = operands
            .iter()
            .map(|operand| ConditionTree::decode(operand, decode_leaf))
            .collect::<Result<Vec<_>>>()?;

        match operator {
            "and" => Ok(ConditionTree::And(children)),
            "not" => {
                let mut children = children.into_iter();
                match (children.next(), children.next()) {
                    (Some(child), None) => Ok(ConditionTree::Not(Box::new(child))),
                    _ => Err(Error::InvalidCondition(
                        "\"not\" expects exactly one operand".to_owned(),
                    )),
                }
            }
            _ => Ok(ConditionTree::Or(children)),
        }
    }
}

fn is_operator(s: &str) -> bool {
    matches!(s, "and" | "or" | "not")
}

/// A leaf condition over a single user attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Attribute key.
    pub name: String,
    /// Condition type. Only `custom_attribute` is evaluated.
    pub condition_type: String,
    /// How the attribute is compared to `value`.
    pub match_type: MatchType,
    /// Value to compare against. Ignored by [`MatchType::Exists`].
    pub value: AttributeValue,
}

/// Supported comparison operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchType {
    Exact,
    Substring,
    Exists,
    Gt,
    Ge,
    Lt,
    Le,
    SemverEq,
    SemverGt,
    SemverGe,
    SemverLt,
    SemverLe,
    /// A match type this SDK doesn't know. Always evaluates to unknown.
    Unknown(String),
}

impl MatchType {
    fn parse(s: &str) -> MatchType {
        match s {
            "exact" => MatchType::Exact,
            "substring" => MatchType::Substring,
            "exists" => MatchType::Exists,
            "gt" => MatchType::Gt,
            "ge" => MatchType::Ge,
            "lt" => MatchType::Lt,
            "le" => MatchType::Le,
            "semver_eq" => MatchType::SemverEq,
            "semver_gt" => MatchType::SemverGt,
            "semver_ge" => MatchType::SemverGe,
            "semver_lt" => MatchType::SemverLt,
            "semver_le" => MatchType::SemverLe,
            other => MatchType::Unknown(other.to_owned()),
        }
    }

    /// Try applying the match to the values, returning `None` if it cannot be applied.
    fn try_eval(
        &self,
        attribute: Option<&AttributeValue>,
        condition_value: &AttributeValue,
    ) -> Option<bool> {
        // Explicit nulls are treated the same as missing attributes.
        let attribute = attribute.filter(|value| !value.is_null());

        match self {
            Self::Exists => Some(attribute.is_some()),

            Self::Exact => match (condition_value, attribute?) {
                (AttributeValue::String(expected), AttributeValue::String(actual)) => {
                    Some(expected == actual)
                }
                (AttributeValue::Number(expected), AttributeValue::Number(actual))
                    if is_valid_number(*expected) && is_valid_number(*actual) =>
                {
                    Some(expected == actual)
                }
                (AttributeValue::Boolean(expected), AttributeValue::Boolean(actual)) => {
                    Some(expected == actual)
                }
                _ => None,
            },

            Self::Substring => match (condition_value, attribute?) {
                (AttributeValue::String(expected), AttributeValue::String(actual)) => {
                    Some(actual.contains(expected.as_str()))
                }
                _ => None,
            },

            Self::Gt | Self::Ge | Self::Lt | Self::Le => {
                let expected = condition_value.as_number().filter(|n| is_valid_number(*n))?;
                let actual = attribute?.as_number().filter(|n| is_valid_number(*n))?;
                Some(match self {
                    Self::Gt => actual > expected,
                    Self::Ge => actual >= expected,
                    Self::Lt => actual < expected,
                    Self::Le => actual <= expected,
                    _ => {
                        // unreachable
                        return None;
                    }
                })
            }

            Self::SemverEq | Self::SemverGt | Self::SemverGe | Self::SemverLt | Self::SemverLe => {
                let expected = parse_version(condition_value.as_str()?)?;
                let actual = parse_version(attribute?.as_str()?)?;
                Some(match self {
                    Self::SemverEq => actual == expected,
                    Self::SemverGt => actual > expected,
                    Self::SemverGe => actual >= expected,
                    Self::SemverLt => actual < expected,
                    Self::SemverLe => actual <= expected,
                    _ => {
                        // unreachable
                        return None;
                    }
                })
            }

            Self::Unknown(_) => None,
        }
    }
}

/// Parse a semantic version, padding missing minor/patch components with zeros ("2.1" is
/// "2.1.0").
fn parse_version(s: &str) -> Option<Version> {
    let s = s.trim();
    if let Ok(version) = Version::parse(s) {
        return Some(version);
    }
    // Split off pre-release/build suffix before padding.
    let split_at = s.find(['-', '+']).unwrap_or(s.len());
    let (core, suffix) = s.split_at(split_at);
    let mut parts = core.split('.').collect::<Vec<_>>();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    while parts.len() < 3 {
        parts.push("0");
    }
    Version::parse(&format!("{}{}", parts.join("."), suffix)).ok()
}

impl Condition {
    /// Evaluate the condition against user attributes.
    pub fn eval(&self, attributes: &Attributes) -> Option<bool> {
        if self.condition_type != CUSTOM_ATTRIBUTE_CONDITION_TYPE {
            log::warn!(target: "splitkit",
                       condition_type:display = self.condition_type;
                       "unsupported condition type, evaluating as unknown");
            return None;
        }
        if let MatchType::Unknown(match_type) = &self.match_type {
            log::warn!(target: "splitkit",
                       match_type:display = match_type;
                       "unsupported match type, evaluating as unknown");
            return None;
        }

        let result = self
            .match_type
            .try_eval(attributes.get(&self.name), &self.value);
        log::trace!(target: "splitkit",
                    attribute:display = self.name,
                    match_type:debug = self.match_type,
                    result:debug = result;
                    "evaluated condition");
        result
    }

    /// Decode a leaf from its JSON object form:
    /// `{"name": ..., "type": "custom_attribute", "match": "exact", "value": ...}`.
    ///
    /// Leaves without `match` are legacy exact matches.
    pub(crate) fn decode(value: &JsonValue) -> Result<Condition> {
        let JsonValue::Object(object) = value else {
            return Err(Error::InvalidCondition(format!(
                "expected condition object, got {value}"
            )));
        };

        let name = object
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| Error::InvalidCondition("condition without name".to_owned()))?
            .to_owned();
        let condition_type = object
            .get("type")
            .and_then(JsonValue::as_str)
            .unwrap_or(CUSTOM_ATTRIBUTE_CONDITION_TYPE)
            .to_owned();
        let match_type = object
            .get("match")
            .and_then(JsonValue::as_str)
            .map_or(MatchType::Exact, MatchType::parse);
        let value = match object.get("value") {
            Some(JsonValue::String(s)) => AttributeValue::String(s.clone()),
            Some(JsonValue::Bool(b)) => AttributeValue::Boolean(*b),
            Some(JsonValue::Number(n)) => n
                .as_f64()
                .map_or(AttributeValue::Null, AttributeValue::Number),
            // Missing values, nulls, and nested structures can't be compared against.
            _ => AttributeValue::Null,
        };

        Ok(Condition {
            name,
            condition_type,
            match_type,
            value,
        })
    }
}

/// Decode an audience id leaf.
pub(crate) fn decode_audience_id(value: &JsonValue) -> Result<String> {
    value
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| Error::InvalidCondition(format!("expected audience id, got {value}")))
}

/// Deserialize audience conditions. Legacy datafiles carry the tree as a JSON-encoded string,
/// typed audiences carry it inline.
pub(crate) fn deserialize_audience_conditions<'de, D>(
    deserializer: D,
) -> std::result::Result<ConditionTree<Condition>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = match JsonValue::deserialize(deserializer)? {
        JsonValue::String(encoded) => serde_json::from_str(&encoded).map_err(D::Error::custom)?,
        value => value,
    };
    ConditionTree::decode(&value, &Condition::decode).map_err(D::Error::custom)
}

/// Deserialize an experiment's `audienceConditions`, a tree of audience ids.
pub(crate) fn deserialize_audience_id_tree<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<ConditionTree<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<JsonValue>::deserialize(deserializer)? {
        None => Ok(None),
        Some(value) => ConditionTree::decode(&value, &decode_audience_id)
            .map(Some)
            .map_err(D::Error::custom),
    }
}
