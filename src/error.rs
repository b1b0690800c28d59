use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to spawn plugin '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Timeout while waiting for plugin '{name}' to start ({timeout:?})")]
    StartupTimeout { name: String, timeout: Duration },

    #[error("Plugin '{name}' exited before we could connect")]
    PrematureExit { name: String },

    #[error("Plugin '{0}' has already been started")]
    AlreadyStarted(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("{0}")]
    Remote(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrokerError {
    /// Application-level failure raised by an interface implementation.
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote(message.into())
    }

    /// Message sent to the calling stub when this error crosses the wire.
    ///
    /// Remote errors travel as their bare message so they reach the caller
    /// verbatim, however many endpoints they pass through.
    pub fn wire_message(&self) -> String {
        match self {
            Self::Remote(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_cross_the_wire_verbatim() {
        let err = BrokerError::remote("unknown builder: nope");
        assert_eq!(err.to_string(), "unknown builder: nope");
        assert_eq!(err.wire_message(), "unknown builder: nope");
    }

    #[test]
    fn other_errors_carry_their_description() {
        let err = BrokerError::Channel("expected a remote handle".into());
        assert_eq!(err.wire_message(), "Channel error: expected a remote handle");
    }
}
