// Error types for the drive core and its startup configuration

use std::path::PathBuf;

/// Errors raised while building the drive. The per-cycle path never fails.
#[derive(Debug, thiserror::Error)]
pub enum DriveError {
    #[error("Invalid module geometry: {0}")]
    InvalidGeometry(String),

    #[error("Invalid drive config: {0}")]
    InvalidConfig(String),

    #[error("Failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, DriveError>;
