//! Error types for the library.
//!
//! Detector noise (bad labels, low confidence, spacing rejects) is never an
//! error: the tracker drops it. Only contract violations, I/O and explicit
//! outcomes such as cancellation surface here.

use thiserror::Error;

/// Bad arguments to the note/geometry helpers. Always a caller bug.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NoteError {
    #[error("string index {0} out of range (expected 0..=5)")]
    InvalidString(usize),
    #[error("fret number {0} must not be negative")]
    InvalidFret(i32),
    #[error("frequency {0} Hz must be positive")]
    InvalidFrequency(f64),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FilterError {
    #[error("unknown filter `{0}`")]
    UnknownFilter(String),
    #[error("invalid parameter for `{filter}`: {msg}")]
    InvalidParam { filter: String, msg: String },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum InferenceError {
    #[error("inference worker not ready")]
    NotReady,
    #[error("an inference call is already in flight")]
    Busy,
    #[error("model failed to load: {0}")]
    Load(String),
    #[error("inference backend error: {0}")]
    Backend(String),
    #[error("malformed prediction: {0}")]
    Malformed(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("calibration cancelled")]
    Cancelled,
    #[error("no reference frame captured yet")]
    NoReferenceFrame,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("filter chain i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("filter chain json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stored filter chain is invalid: {0}")]
    InvalidChain(#[from] FilterError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("config json: {0}")]
    Json(#[from] serde_json::Error),
}
