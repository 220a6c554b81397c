//! Error types for source drivers.

use thiserror::Error;

/// Errors raised while talking to a source datastore.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Failed to reach or authenticate against the source
    #[error("connection failed: {0}")]
    Connection(String),

    /// Query execution failed
    #[error("query failed: {0}")]
    Query(String),

    /// A value could not be converted into the row model
    #[error("data conversion failed: {0}")]
    Data(String),

    /// Operation not available for this driver
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Database/table enumeration failed
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// CSV sources: unreadable file or malformed content
    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl From<std::io::Error> for SourceError {
    fn from(e: std::io::Error) -> Self {
        SourceError::Filesystem(e.to_string())
    }
}

impl From<csv::Error> for SourceError {
    fn from(e: csv::Error) -> Self {
        SourceError::Filesystem(e.to_string())
    }
}

impl From<sqlx::Error> for SourceError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Configuration(_) => SourceError::Connection(e.to_string()),
            sqlx::Error::Database(_) => SourceError::Query(e.to_string()),
            sqlx::Error::Io(_) => SourceError::Connection(e.to_string()),
            sqlx::Error::ColumnDecode { .. } => SourceError::Data(e.to_string()),
            sqlx::Error::Decode(_) => SourceError::Data(e.to_string()),
            _ => SourceError::Connection(e.to_string()),
        }
    }
}

impl From<tiberius::error::Error> for SourceError {
    fn from(e: tiberius::error::Error) -> Self {
        match &e {
            tiberius::error::Error::Io { .. } => SourceError::Connection(e.to_string()),
            tiberius::error::Error::Server(_) => SourceError::Query(e.to_string()),
            _ => SourceError::Connection(e.to_string()),
        }
    }
}

impl From<regex::Error> for SourceError {
    fn from(e: regex::Error) -> Self {
        SourceError::Discovery(e.to_string())
    }
}
