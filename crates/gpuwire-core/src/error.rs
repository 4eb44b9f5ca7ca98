#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("shared region {0} not found")]
    RegionNotFound(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
