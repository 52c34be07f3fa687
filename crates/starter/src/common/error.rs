use thiserror::Error;

use crate::common::error::StarterError::GenericError;

#[derive(Debug, Error)]
pub enum StarterError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Runtime error: {0}")]
    GuardError(#[from] nodeguard::Error),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Invalid pattern: {0}")]
    PatternError(#[from] regex::Error),
    #[error("Invalid configuration: {0}")]
    ConfigError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<serde_json::error::Error> for StarterError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<rusqlite::Error> for StarterError {
    fn from(e: rusqlite::Error) -> Self {
        Self::DatabaseError(e.to_string())
    }
}

impl From<walkdir::Error> for StarterError {
    fn from(e: walkdir::Error) -> Self {
        Self::GenericError(e.to_string())
    }
}

impl From<String> for StarterError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}

impl From<&str> for StarterError {
    fn from(e: &str) -> Self {
        GenericError(e.to_string())
    }
}
