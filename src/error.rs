use thiserror::Error;

/// Failure taxonomy for the daemon.
///
/// `Validation` and `Persistence` are recovered locally (the offending
/// message or write is dropped and logged); `Connection` and `Subscription`
/// drive the reconnect policy; `Configuration` is fatal at startup.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("broker rejected subscription: {0}")]
    Subscription(String),

    #[error("invalid message: {0}")]
    Validation(String),

    #[error("store operation failed: {0}")]
    Persistence(#[source] sqlx::Error),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl DaemonError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

pub type Result<T, E = DaemonError> = std::result::Result<T, E>;
