// ===============================
// src/error.rs
// ===============================
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected payload: {0}")]
    Decode(String),
    #[error("no current price for {0}")]
    NoPrice(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum IndicatorError {
    #[error("insufficient data: {have} observations (need at least {need})")]
    Insufficient { have: usize, need: usize },
    #[error("insufficient data after trimming: {0} rows")]
    TooFewRows(usize),
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("model api returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("empty completion")]
    Empty,
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid recommendation: {0}")]
    Recommendation(String),
    #[error("invalid confidence: {0}")]
    Confidence(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Run-level failures; anything here aborts the batch
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}
