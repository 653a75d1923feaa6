use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Polling error: {0}")]
    Polling(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type BridgeResult<T> = Result<T, BridgeError>;
