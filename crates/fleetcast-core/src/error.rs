use thiserror::Error;

#[derive(Debug, Error)]
pub enum FleetcastError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetcastError {
    /// Short error code string, used in logs and HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            FleetcastError::Config(_) => "CONFIG_ERROR",
            FleetcastError::Serialization(_) => "SERIALIZATION_ERROR",
            FleetcastError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, FleetcastError>;
