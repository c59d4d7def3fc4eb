use thiserror::Error;

#[derive(Debug, Error)]
pub enum RlogError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Codec Error: {0}")]
    Codec(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Snapshot Error: {0}")]
    Snapshot(String),

    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, RlogError>;

impl From<bincode::Error> for RlogError {
    fn from(err: bincode::Error) -> Self {
        RlogError::Codec(err.to_string())
    }
}
