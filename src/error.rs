use thiserror::Error;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input data: {0}")]
    InputData(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Already locked: {0}")]
    AlreadyLocked(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Migration required: {0}")]
    MigrationRequired(String),
}

pub type Result<T> = std::result::Result<T, CatalogError>;
