use serde::Serialize;
use thiserror::Error;

/// Problems in the rule data itself: unknown ids, inheritance cycles, values that fail
/// validation. These are operator errors rather than transient failures.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConfigurationError {
    #[error("unknown ruleset '{0}'")]
    UnknownRuleset(String),

    #[error("unknown client '{0}'")]
    UnknownClient(String),

    #[error("ruleset inheritance cycle through '{0}'")]
    InheritanceCycle(String),

    #[error("no baseline ruleset is configured")]
    MissingBaseline,

    #[error("duplicate {entity} '{id}'")]
    Duplicate { entity: &'static str, id: String },

    #[error("{entity} '{id}' is still referenced by {referenced_by}")]
    StillReferenced {
        entity: &'static str,
        id: String,
        referenced_by: String,
    },

    #[error("invalid {entity} '{id}': {message}")]
    Invalid {
        entity: &'static str,
        id: String,
        message: String,
    },
}

impl ConfigurationError {
    pub(crate) fn invalid(entity: &'static str, id: &str, message: impl ToString) -> Self {
        ConfigurationError::Invalid {
            entity,
            id: id.to_owned(),
            message: message.to_string(),
        }
    }
}

/// The rule provider (or rule store) could not be reached or answered with an error.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ProviderError {
    #[error("rule provider unavailable: {0}")]
    Unavailable(String),

    #[error("rule provider did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("rule provider returned malformed data: {0}")]
    Malformed(String),
}

/// A single condition could not be evaluated. The condition is treated as non-matching.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum EvaluationError {
    #[error("invalid regex '{pattern}': {message}")]
    InvalidRegex { pattern: String, message: String },

    #[error("'{0}' is not numeric")]
    NotNumeric(String),

    #[error("'{0}' is not a version")]
    InvalidVersion(String),

    #[error("'{0}' is not an ISO-8601 datetime")]
    InvalidDatetime(String),

    #[error("operator '{0}' requires an expected value")]
    MissingExpectedValue(String),

    #[error("percentage {0} is outside 0..=100")]
    InvalidPercentage(String),
}

/// Broad classification carried by error fallbacks in an [crate::EvaluationResult].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The rule data is inconsistent; see [ConfigurationError].
    Configuration,
    /// The rule provider failed; see [ProviderError].
    Provider,
    /// No snapshot has ever been loaded, so nothing could be decided from data.
    NotReady,
    /// Something unexpected stopped the evaluation; check the log for details.
    Internal,
}

impl From<&ConfigurationError> for ErrorKind {
    fn from(_: &ConfigurationError) -> Self {
        ErrorKind::Configuration
    }
}

impl From<&ProviderError> for ErrorKind {
    fn from(_: &ProviderError) -> Self {
        ErrorKind::Provider
    }
}

/// Failure of a management operation.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ManagementError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },
}

impl ManagementError {
    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        ManagementError::NotFound {
            entity,
            id: id.into(),
        }
    }
}
