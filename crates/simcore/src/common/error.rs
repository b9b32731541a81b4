use thiserror::Error;

#[derive(Debug, Error)]
pub enum DsError {
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Cannot parse hints: {0}")]
    HintParseError(String),
    #[error("Invalid condition: {0}")]
    ConditionError(String),
    #[error("Selection error: {0}")]
    SelectionError(String),
    #[error("Invariant violation: {0}")]
    InvariantError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<serde_json::error::Error> for DsError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<serde_yaml::Error> for DsError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}
