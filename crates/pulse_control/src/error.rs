//! Control plane errors

use pulse_events::DelegateError;

use crate::PluginKey;
use crate::external::{ClientError, TransportError};

/// Errors raised while starting, stopping or supervising plugins
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("no delegates added before start")]
    NoDelegates,

    #[error("{0} not set before start")]
    MissingCollaborator(&'static str),

    #[error("handler registration failed: {0}")]
    Delegate(#[from] DelegateError),

    #[error("error while starting plugin: {0}")]
    StartFailed(#[source] TransportError),

    #[error("error while waiting for response: {0}")]
    WaitForResponse(#[source] TransportError),

    #[error("no response object returned from plugin")]
    NoResponse,

    #[error("plugin could not start error: {0}")]
    PluginRejected(String),

    #[error("could not connect to plugin: {0}")]
    Connect(#[source] TransportError),

    #[error("plugin did not answer ping: {0}")]
    Ping(#[source] ClientError),

    #[error("plugin did not stop cleanly: {0}")]
    Stop(#[source] ClientError),

    #[error("available plugin {id} not found in pool {key}")]
    NotFound { key: PluginKey, id: u64 },
}

/// Result type for control operations
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors from loading control configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
