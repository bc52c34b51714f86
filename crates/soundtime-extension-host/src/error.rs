use soundtime_extensions::ExtensionError;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error(transparent)]
    Extension(#[from] ExtensionError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HostError {
    /// Whether the host channel is gone and the process must exit.
    pub fn is_channel_closed(&self) -> bool {
        matches!(self, Self::Extension(ExtensionError::ChannelClosed))
    }
}
