use thiserror::Error;
#[derive(Debug, Error)]
pub enum NidusError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Codec Error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Consensus Error: {0}")]
    Consensus(String),

    #[error("Protocol Error: {0}")]
    Protocol(String),

    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Timed out: {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, NidusError>;
