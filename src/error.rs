use thiserror::Error;

#[derive(Error, Debug)]
pub enum EvncfError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("index out of range: {0}")]
    InvalidIndex(String),

    #[error("numeric instability: {0}")]
    NumericInstability(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EvncfError>;

impl EvncfError {
    pub fn shape(expected: impl std::fmt::Display, found: impl std::fmt::Display) -> Self {
        EvncfError::ShapeMismatch(format!("expected {}, found {}", expected, found))
    }
}
