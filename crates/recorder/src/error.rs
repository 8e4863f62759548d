//! Recorder error types

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use v4l2_capture::CaptureError;

/// Settings and startup errors
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Usage: {0}")]
    Usage(String),

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid capture settings: {0}")]
    Invalid(String),

    #[error("Invalid log level '{0}'")]
    LogLevel(String),

    #[error("Failed to install log subscriber: {0}")]
    Logging(String),
}

/// Errors ending a recording
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("Failed to open output file {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Capture(#[from] CaptureError),
}
