//! Client errors

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SipError {
    #[error("Connect error: {0}")]
    Connect(String),

    #[error("Registrar lookup failed: {0}")]
    Resolve(String),

    #[error("Public IP discovery failed: {0}")]
    PublicIp(String),

    #[error("Handshake timeout: no {awaiting} within {timeout:?}")]
    HandshakeTimeout {
        awaiting: &'static str,
        timeout: Duration,
    },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Login rejected: {0}")]
    LoginRejected(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Connection is not registered")]
    NotRegistered,

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for SipError {
    fn from(err: std::io::Error) -> Self {
        SipError::Transport(err.to_string())
    }
}

impl From<config::ConfigError> for SipError {
    fn from(err: config::ConfigError) -> Self {
        SipError::Config(err.to_string())
    }
}
