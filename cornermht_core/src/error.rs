//! Error types for the corner tracker.

use thiserror::Error;

/// A matrix operation hit a singular or otherwise degenerate input.
///
/// Always recovered locally: the candidate hypothesis that needed the
/// inverse is dropped and the rest of the scan proceeds.
#[derive(Debug, Clone, Error)]
#[error("numeric error: {0}")]
pub struct NumericError(pub String);

impl NumericError {
    pub fn singular(what: impl Into<String>) -> Self {
        Self(format!("{} is singular", what.into()))
    }
}

/// Errors surfaced by the tracker and its I/O layers.
#[derive(Debug, Error)]
pub enum TrackError {
    /// Missing or malformed parameter file.
    #[error("config error: {0}")]
    Config(String),

    /// Corner file not found, under-length, or malformed.
    #[error("input error: {0}")]
    Input(String),

    /// Frames submitted out of order, or after draining.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Non-invertible covariance that escaped local recovery.
    #[error(transparent)]
    Numeric(#[from] NumericError),

    /// Underlying file I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrackError {
    /// Creates a config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an input error.
    pub fn input(msg: impl Into<String>) -> Self {
        Self::Input(msg.into())
    }

    /// Creates a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
