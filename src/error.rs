use std::sync::Arc;

use crate::transport::TransportError;

/// Represents a result type for operations in the SDK.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the SDK.
///
/// Decision-facing methods of [`Client`](crate::Client) never return these errors. They are logged
/// and the method returns its documented default instead. Lower-level building blocks return them
/// so that callers can react.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Datafile is not valid JSON or does not match the expected schema.
    #[error("error parsing datafile")]
    ConfigurationParseError(#[source] Arc<serde_json::Error>),

    /// Datafile schema version is not supported by this SDK.
    #[error("unsupported datafile version: {0}")]
    UnsupportedDatafileVersion(String),

    /// Traffic allocation bounds are decreasing or exceed the bucketing space.
    #[error("invalid traffic allocation for entity {0}")]
    InvalidTrafficAllocation(String),

    /// An audience condition could not be decoded.
    #[error("invalid audience condition: {0}")]
    InvalidCondition(String),

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The request was unauthorized, possibly due to an invalid SDK key.
    #[error("unauthorized, sdk_key is likely invalid")]
    Unauthorized,

    /// No datafile has been loaded yet.
    #[error("datafile has not been loaded yet")]
    ConfigurationMissing,

    /// Experiment key or id is not present in the datafile.
    #[error("experiment not found: {0}")]
    ExperimentNotFound(String),

    /// Feature flag key is not present in the datafile.
    #[error("feature flag not found: {0}")]
    FeatureNotFound(String),

    /// Event key is not present in the datafile.
    #[error("event not found: {0}")]
    EventNotFound(String),

    /// Variation key or id is not present in the experiment.
    #[error("variation not found: {0}")]
    VariationNotFound(String),

    /// Feature variable key is not present in the feature flag.
    #[error("feature variable not found: {0}")]
    VariableNotFound(String),

    /// Feature variable was requested with a type that differs from its declaration.
    #[error("feature variable {0} has a different type")]
    VariableTypeMismatch(String),

    /// Event delivery failed before a response was received.
    #[error(transparent)]
    Transport(TransportError),

    /// Server responded with a non-success status code.
    #[error("unexpected http status: {0}")]
    HttpStatus(u16),

    /// Storage capability failed.
    #[error("persistence error")]
    Persistence(#[source] Arc<std::io::Error>),

    /// A stored record or profile could not be (de)serialized.
    #[error("serialization error")]
    Serialization(#[source] Arc<serde_json::Error>),

    /// Indicates that the poller thread panicked. This should normally never happen.
    #[error("poller thread panicked")]
    PollerThreadPanicked,

    /// The poller thread was stopped before the datafile was synced.
    #[error("poller thread stopped")]
    PollerThreadStopped,

    /// Indicates that the event processor thread panicked.
    #[error("event processor thread panicked")]
    EventProcessorPanicked,

    /// An I/O error outside of storage (e.g., failure to spawn a thread).
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),
}

/// Coarse classification of [`Error`], matching how the SDK reacts to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or incompatible datafile. The previous snapshot stays in effect.
    Config,
    /// Unknown key or invalid reference. The call returns its default value.
    Decision,
    /// Event delivery failure. The record goes through the retry queue.
    Dispatch,
    /// Storage failure. The SDK degrades to in-memory behavior.
    Persistence,
    /// Background thread failures.
    Lifecycle,
}

impl Error {
    /// Return the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConfigurationParseError(_)
            | Error::UnsupportedDatafileVersion(_)
            | Error::InvalidTrafficAllocation(_)
            | Error::InvalidCondition(_)
            | Error::InvalidBaseUrl(_)
            | Error::Unauthorized => ErrorKind::Config,
            Error::ConfigurationMissing
            | Error::ExperimentNotFound(_)
            | Error::FeatureNotFound(_)
            | Error::EventNotFound(_)
            | Error::VariationNotFound(_)
            | Error::VariableNotFound(_)
            | Error::VariableTypeMismatch(_) => ErrorKind::Decision,
            Error::Transport(_) | Error::HttpStatus(_) => ErrorKind::Dispatch,
            Error::Persistence(_) | Error::Serialization(_) => ErrorKind::Persistence,
            Error::PollerThreadPanicked
            | Error::PollerThreadStopped
            | Error::EventProcessorPanicked
            | Error::Io(_) => ErrorKind::Lifecycle,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<TransportError> for Error {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind};
    use crate::transport::TransportError;

    #[test]
    fn classifies_errors() {
        assert_eq!(
            Error::UnsupportedDatafileVersion("1".into()).kind(),
            ErrorKind::Config
        );
        assert_eq!(
            Error::ExperimentNotFound("exp".into()).kind(),
            ErrorKind::Decision
        );
        assert_eq!(
            Error::from(TransportError::Timeout).kind(),
            ErrorKind::Dispatch
        );
        assert_eq!(Error::HttpStatus(503).kind(), ErrorKind::Dispatch);
    }
}
