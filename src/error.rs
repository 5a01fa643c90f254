use thiserror::Error;

#[derive(Debug, Error)]
pub enum SentinelError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("sidecar error: {0}")]
    Sidecar(String),
}

pub type Result<T> = std::result::Result<T, SentinelError>;
