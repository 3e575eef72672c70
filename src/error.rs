//! Error types for gold-accrual

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Principal not found: {0}")]
    NotFound(String),

    #[error("Principal already exists: {0}")]
    AlreadyExists(String),

    #[error("Concurrent modification of {identity}: expected version {expected}, found {actual}")]
    VersionConflict {
        identity: String,
        expected: u64,
        actual: u64,
    },

    #[error("Insufficient gold for {identity}: have {available:.2}, need {requested:.2}")]
    InsufficientBalance {
        identity: String,
        available: f64,
        requested: f64,
    },

    #[error("Invalid amount: {0}")]
    InvalidAmount(f64),

    #[error("Invariant violation for {identity}: {detail}")]
    InvariantViolation { identity: String, detail: String },

    #[error("Invalid display name: {0}")]
    InvalidDisplayName(String),

    #[error("Display name already taken: {0}")]
    DisplayNameTaken(String),

    #[error("Leaderboard rebuild already in progress")]
    RebuildInProgress,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
