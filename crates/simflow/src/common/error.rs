use thiserror::Error;

use crate::common::error::FlowError::GenericError;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("{0}")]
    CoreError(#[from] simcore::Error),
    #[error("Invariant violation: {0}")]
    InvariantError(String),
    #[error("Invalid configuration: {0}")]
    ConfigError(String),
    #[error("Queue error: {0}")]
    QueueError(String),
    #[error("Maximum number of launches reached: {0}")]
    MaxNumLaunches(u32),
    #[error(transparent)]
    NoQueueAdapter(#[from] NoQueueAdapterError),
    #[error(transparent)]
    Restart(#[from] RestartError),
    #[error(transparent)]
    FixQueueCritical(#[from] FixQueueCriticalError),
    #[error("Autoparal probe failed: {0}")]
    ProbeFailed(String),
    #[error("Error: {0}")]
    GenericError(String),
}

/// No usable restart artifact was found.
#[derive(Debug, Error)]
#[error("Cannot restart task: {0}")]
pub struct RestartError(pub String);

/// A resource escalation hit the ceiling of the adapter.
#[derive(Debug, Error)]
#[error("Cannot increase {resource}: {reason}")]
pub struct ManagerIncreaseError {
    pub resource: &'static str,
    pub reason: String,
}

impl ManagerIncreaseError {
    pub fn new(resource: &'static str, reason: impl Into<String>) -> Self {
        ManagerIncreaseError {
            resource,
            reason: reason.into(),
        }
    }
}

/// None of the recovery strategies for a queue failure could be applied.
#[derive(Debug, Error)]
#[error("Cannot fix queue critical error: {0}")]
pub struct FixQueueCriticalError(pub String);

/// The task declined to reduce its memory or time demand.
#[derive(Debug, Error)]
#[error("Cannot decrease demands: {0}")]
pub struct DecreaseDemandsError(pub String);

#[derive(Debug, Error)]
#[error("Cannot find a queue adapter for this run ({0})")]
pub struct NoQueueAdapterError(pub String);

impl From<serde_json::error::Error> for FlowError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<serde_yaml::Error> for FlowError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::DeserializationError(e.to_string())
    }
}

impl From<anyhow::Error> for FlowError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(format!("{error:#}"))
    }
}

impl From<String> for FlowError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}

pub fn error<T>(message: String) -> crate::Result<T> {
    Err(GenericError(message))
}
