use crate::types::{SessionState, TerminalStatus};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("environment variable not found: {0}")]
    EnvVarNotFound(String),
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credential available: {0}")]
    Unavailable(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("failed to obtain access token: {0}")]
    Token(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("dial failed: {0}")]
    Dial(String),

    #[error("stream open exceeded deadline of {0:?}")]
    DialTimeout(Duration),

    #[error("write failed: {0}")]
    Write(String),

    #[error("stream is half-closed")]
    Closed,

    #[error("read failed: {0}")]
    Read(TerminalStatus),

    #[error("peer reported error: {0}")]
    Protocol(TerminalStatus),
}

impl TransportError {
    /// Terminal status carried by read-side failures, if any.
    pub fn status(&self) -> Option<&TerminalStatus> {
        match self {
            TransportError::Read(status) | TransportError::Protocol(status) => Some(status),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("session setup failed: {0}")]
    Setup(String),

    #[error("stream setup failed: {0}")]
    StreamSetup(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{operation} not permitted in state {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("speech engine not found: {0}")]
    EngineNotFound(String),

    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown setting: {0}")]
    UnknownSetting(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("failed to open audio source: {0}")]
    Open(String),

    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("failed to read audio: {0}")]
    Read(String),
}
