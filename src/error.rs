// src/error.rs

use thiserror::Error;

/// Error taxonomy for the scanning and extraction core.
///
/// Malformed model *output* is deliberately not represented here: the
/// invoker repairs or degrades it into a low-confidence result instead
/// of surfacing an error (see `model.rs`).
#[derive(Error, Debug)]
pub enum ScanError {
    /// Caller mistake; rejected immediately, never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The source document could not be fetched at all. Fatal for a
    /// scan: no partial result is meaningful without the bytes.
    #[error("failed to retrieve document '{reference}': {detail}")]
    Retrieval { reference: String, detail: String },

    /// Transport-level failure talking to the model endpoint.
    #[error("model request failed: {0}")]
    Model(#[from] reqwest::Error),

    /// The model endpoint answered with a non-success status.
    #[error("model API error {status}: {body}")]
    ModelApi { status: u16, body: String },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Spreadsheet could not be converted to delimited text. Treated as
    /// invalid input: there is no binary-lane fallback for workbooks.
    #[error("could not read spreadsheet: {0}")]
    Spreadsheet(String),
}

impl ScanError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}
