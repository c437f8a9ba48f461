/// Centralized error types for the backfill pipeline
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackfillError {
    // Configuration Errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Config parse failed: {0}")]
    ConfigParseError(#[from] toml::de::Error),

    // Network Errors
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Request to {url} failed after {attempts} attempts")]
    RetriesExhausted { url: String, attempts: u32 },

    // Data Errors
    #[error("Invalid bar data: {0}")]
    InvalidBarData(String),

    #[error("Deserialization failed: {0}")]
    DeserializationError(#[from] serde_json::Error),

    // Storage Errors
    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    // File I/O Errors
    #[error("File I/O error: {0}")]
    FileError(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("File write failed: {0}")]
    FileWriteFailed(String),

    // Worker Errors
    #[error("Worker failed: {0}")]
    WorkerFailed(String),
}

pub type Result<T> = std::result::Result<T, BackfillError>;

impl BackfillError {
    /// Check if error must stop the process before any work starts
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BackfillError::ConfigError(_)
                | BackfillError::ConfigParseError(_)
                | BackfillError::InvalidParameter(_)
        )
    }

    /// Get error code for logging/monitoring
    pub fn error_code(&self) -> &str {
        match self {
            BackfillError::ConfigError(_) => "CFG_001",
            BackfillError::InvalidParameter(_) => "CFG_002",
            BackfillError::ConfigParseError(_) => "CFG_003",
            BackfillError::HttpError(_) => "NET_001",
            BackfillError::RetriesExhausted { .. } => "NET_002",
            BackfillError::InvalidBarData(_) => "DATA_001",
            BackfillError::DeserializationError(_) => "DATA_002",
            BackfillError::DatabaseError(_) => "DB_001",
            BackfillError::PoolError(_) => "DB_002",
            BackfillError::DuplicateKey(_) => "DB_003",
            BackfillError::FileError(_) => "FILE_001",
            BackfillError::CsvError(_) => "FILE_002",
            BackfillError::FileWriteFailed(_) => "FILE_003",
            BackfillError::WorkerFailed(_) => "WORK_001",
        }
    }
}
