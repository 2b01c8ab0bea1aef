#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("native handle already registered as {0}")]
    DuplicateHandle(dxcap_protocol::HandleId),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for CoreError {
    fn from(e: toml::de::Error) -> Self {
        CoreError::ConfigError(e.to_string())
    }
}
