use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid source descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("source root unreachable: {0}")]
    RootUnreachable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("credential store error: {0}")]
    CredentialStore(String),

    #[error("thumbnail generation failed for {path}: {reason}")]
    Thumbnail { path: PathBuf, reason: String },

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
