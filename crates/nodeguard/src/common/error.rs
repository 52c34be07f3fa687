use thiserror::Error;

use crate::Pid;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Process {0} is not available")]
    ProcessUnavailable(Pid),
    #[error("Invalid exit code table: {0}")]
    InvalidTable(String),
    #[error("Launch error: {0}")]
    LaunchError(String),
    #[error("Wrapper error: {0}")]
    WrapperError(String),
    #[error("Cancelled: {0}")]
    Cancelled(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<serde_json::error::Error> for GuardError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}
impl From<psutil::Error> for GuardError {
    fn from(e: psutil::Error) -> Self {
        Self::GenericError(e.to_string())
    }
}
impl From<nix::Error> for GuardError {
    fn from(e: nix::Error) -> Self {
        Self::GenericError(e.to_string())
    }
}
impl From<String> for GuardError {
    fn from(e: String) -> Self {
        Self::GenericError(e)
    }
}
impl From<&str> for GuardError {
    fn from(e: &str) -> Self {
        Self::GenericError(e.to_string())
    }
}
