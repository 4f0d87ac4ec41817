use thiserror::Error;

pub type DaemonResult<T> = Result<T, DaemonError>;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Instance not found: {0}")]
    NotFound(String),

    #[error("No available ports in range {min}-{max}")]
    PortsExhausted { min: u16, max: u16 },

    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Descriptor validation failed: {}", .0.join("; "))]
    InvalidDescriptor(Vec<String>),

    #[error("{operation} timed out after {seconds}s")]
    OperationTimeout { operation: String, seconds: u64 },

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for DaemonError {
    fn from(err: std::io::Error) -> Self {
        DaemonError::IoError(err.to_string())
    }
}

impl From<bollard::errors::Error> for DaemonError {
    fn from(err: bollard::errors::Error) -> Self {
        DaemonError::Runtime(err.to_string())
    }
}
