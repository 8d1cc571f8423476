use std::io;
use thiserror::Error;

/// Unified error type for the dataplane core
#[derive(Error, Debug)]
pub enum DataplaneError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// SOCKS5 protocol violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Name resolution failed
    #[error("Resolve error: {0}")]
    Resolve(String),

    /// Virtual interface error
    #[error("Interface error: {0}")]
    Interface(String),

    /// Transport transceiver error
    #[error("Transport error: {0}")]
    Transport(String),

    /// External command failed
    #[error("Command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    /// Other errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, DataplaneError>;

impl From<anyhow::Error> for DataplaneError {
    fn from(err: anyhow::Error) -> Self {
        DataplaneError::Other(err.to_string())
    }
}

impl From<ipnet::AddrParseError> for DataplaneError {
    fn from(err: ipnet::AddrParseError) -> Self {
        DataplaneError::Config(format!("CIDR parse error: {}", err))
    }
}
