use std::io;
use std::os::fd::RawFd;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GpioError>;

#[derive(Debug, Error)]
pub enum GpioError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("Not a known {field}: '{content}'")]
    Parse { field: &'static str, content: String },
    #[error("Expected {expected} byte(s) from {path}, got {got}")]
    Range {
        path: String,
        expected: usize,
        got: usize,
    },
    #[error("Unable to create poll context: {0}")]
    Setup(#[source] io::Error),
    #[error("Unable to register descriptor {fd}: {source}")]
    Registration {
        fd: RawFd,
        #[source]
        source: io::Error,
    },
    #[error("Stopping watch loop: {0}")]
    FatalWait(#[source] io::Error),
    #[error("Watcher is closed")]
    WatcherClosed,
    #[error("Pin not found: {0}")]
    NotFoundPin(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Configuration error: {0}")]
    Config(String),
}
