//! Error types for the bronze ingestion engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BronzeError>;

#[derive(Error, Debug)]
pub enum BronzeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid URL template '{template}': {reason}")]
    Template { template: String, reason: String },

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}
