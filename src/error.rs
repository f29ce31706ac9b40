use thiserror::Error;

/// Result type for admission operations
pub type Result<T> = std::result::Result<T, AdmissionError>;

/// Errors that can occur inside the admission layer
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Counter store error: {0}")]
    Store(String),

    #[error("Token error: {0}")]
    Token(String),

    #[error("Tier lookup failed for subject {subject}: {reason}")]
    TierLookup { subject: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
