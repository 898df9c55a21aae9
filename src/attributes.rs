use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Type alias for a HashMap representing user attributes.
///
/// # Examples
/// ```
/// # use splitkit::{Attributes, AttributeValue};
/// let attributes = [
///     ("age".to_owned(), 30.0.into()),
///     ("is_premium_member".to_owned(), true.into()),
///     ("country".to_owned(), "US".into()),
/// ].into_iter().collect::<Attributes>();
/// ```
pub type Attributes = HashMap<String, AttributeValue>;

/// Enum representing possible values of a user attribute (or an event tag).
///
/// Conveniently implements `From` conversions for `String`, `&str`, `f64`, and `bool` types.
#[derive(Debug, Serialize, Deserialize, PartialEq, PartialOrd, From, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A string value.
    String(String),
    /// A numerical value.
    Number(f64),
    /// A boolean value.
    Boolean(bool),
    /// A null value or absence of value.
    Null,
}

impl AttributeValue {
    /// Return the string value if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Return the numeric value if this is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Return the boolean value if this is a boolean.
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            AttributeValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns `true` for [`AttributeValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

/// Reserved attribute that overrides the user id as the bucketing key.
pub const BUCKETING_ID_ATTRIBUTE: &str = "$opt_bucketing_id";
/// Reserved attribute carrying the user agent. Forwarded to analytics without a datafile entry.
pub const USER_AGENT_ATTRIBUTE: &str = "$opt_user_agent";
/// Reserved attribute appended to events when the datafile enables bot filtering.
pub const BOT_FILTERING_ATTRIBUTE: &str = "$opt_bot_filtering";

const RESERVED_ATTRIBUTE_PREFIX: &str = "$opt_";

/// Largest integer that an `f64` represents exactly. Numbers beyond it are not compared.
const MAX_EXACT_NUMBER: f64 = 9_007_199_254_740_992.0;

/// Returns `true` if `key` uses the reserved `$opt_` namespace.
pub fn is_reserved_attribute(key: &str) -> bool {
    key.starts_with(RESERVED_ATTRIBUTE_PREFIX)
}

/// Returns `true` if `value` can be used in a condition or sent to analytics.
///
/// Nulls and non-finite or out-of-range numbers are not valid.
pub fn is_valid_attribute_value(value: &AttributeValue) -> bool {
    match value {
        AttributeValue::String(_) | AttributeValue::Boolean(_) => true,
        AttributeValue::Number(n) => is_valid_number(*n),
        AttributeValue::Null => false,
    }
}

/// Returns `true` for finite numbers that can be compared without losing precision.
pub fn is_valid_number(n: f64) -> bool {
    n.is_finite() && n.abs() <= MAX_EXACT_NUMBER
}

/// Resolve the key used for bucketing: `$opt_bucketing_id` when provided as a string, otherwise
/// the user id.
pub(crate) fn bucketing_id<'a>(user_id: &'a str, attributes: &'a Attributes) -> &'a str {
    match attributes.get(BUCKETING_ID_ATTRIBUTE) {
        Some(AttributeValue::String(id)) => id,
        Some(other) => {
            log::warn!(target: "splitkit",
                       user_id,
                       bucketing_id:debug = other;
                       "bucketing id attribute is not a string, using user id");
            user_id
        }
        None => user_id,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn validates_values() {
        assert!(is_valid_attribute_value(&"a".into()));
        assert!(is_valid_attribute_value(&false.into()));
        assert!(is_valid_attribute_value(&42.0.into()));
        assert!(!is_valid_attribute_value(&AttributeValue::Null));
        assert!(!is_valid_attribute_value(&f64::NAN.into()));
        assert!(!is_valid_attribute_value(&f64::INFINITY.into()));
        assert!(!is_valid_attribute_value(&1e300.into()));
    }

    #[test]
    fn bucketing_id_prefers_reserved_attribute() {
        let attributes = HashMap::from([(BUCKETING_ID_ATTRIBUTE.to_owned(), "household".into())]);
        assert_eq!(bucketing_id("user", &attributes), "household");
    }

    #[test]
    fn bucketing_id_ignores_non_string_values() {
        let attributes = HashMap::from([(BUCKETING_ID_ATTRIBUTE.to_owned(), 42.0.into())]);
        assert_eq!(bucketing_id("user", &attributes), "user");
        assert_eq!(bucketing_id("user", &HashMap::new()), "user");
    }

    #[test]
    fn deserializes_untagged() {
        let attributes: Attributes =
            serde_json::from_str(r#"{"a": "x", "b": 1.5, "c": true, "d": null}"#).unwrap();
        assert_eq!(attributes["a"], "x".into());
        assert_eq!(attributes["b"], 1.5.into());
        assert_eq!(attributes["c"], true.into());
        assert_eq!(attributes["d"], AttributeValue::Null);
    }
}
