use thiserror::Error;

/// Convenient Result alias.
pub type CastResult<T> = Result<T, CastError>;

/// Cast engine error taxonomy.
///
/// `BadConfig` and `DeviceUnreachable` are reported at Opening and keep
/// the cast out of Running; `Source` aborts a running cast;
/// `TransientNetwork` and `QueueSaturation` are logged and survived.
#[derive(Debug, Error)]
pub enum CastError {
    #[error("invalid configuration: {0}")]
    BadConfig(String),

    #[error("source error: {0}")]
    Source(String),

    #[error("device unreachable: {0}")]
    DeviceUnreachable(String),

    #[error("transient network error: {0}")]
    TransientNetwork(#[from] std::io::Error),

    #[error("send queue for {device} saturated at depth {depth}")]
    QueueSaturation { device: String, depth: usize },

    #[error("action failed: {0}")]
    Action(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
