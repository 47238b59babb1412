use thiserror::Error;

/// Failures from the remote traffic-signal node lookup (Overpass)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeLookupError {
    #[error("Invalid node lookup URL: {0}")]
    InvalidUrl(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Node lookup timed out")]
    Timeout,

    #[error("HTTP error: {0}")]
    HttpStatus(u16),

    #[error("Rate limited by node lookup service")]
    RateLimited,

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Failures from the remote signal prediction backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteSignalError {
    #[error("Backend base URL is not configured")]
    MissingConfiguration,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Bad HTTP status: {0}")]
    BadStatus(u16),

    #[error("Backend request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),
}

/// Failures from pattern / profile persistence. Always swallowed by callers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Unknown prediction mode: {0}")]
    InvalidMode(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidNumber { key: String, value: String },

    #[error("Failed to read config: {0}")]
    Io(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}

#[derive(Error, Debug)]
pub enum SampleLogError {
    #[error("Failed to read sample log: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sample log contains no readable samples")]
    Empty,
}
