use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SentrycamError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{service} is already running (pid {pid})")]
    AlreadyRunning { service: &'static str, pid: i32 },

    #[error("Permission denied for {path}: {source}")]
    Permission {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Camera device error: {message}")]
    Device { message: String },

    #[error("Attempted to flush a recording with no buffered frames")]
    EmptyClip,

    #[error("Transient media error: {message}")]
    Transient { message: String },

    #[error("System error: {message}")]
    System { message: String },
}

impl SentrycamError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn device<S: Into<String>>(message: S) -> Self {
        Self::Device {
            message: message.into(),
        }
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Whether the error should be retried with a bounded delay rather than
    /// escalated through the termination path.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

pub type Result<T> = std::result::Result<T, SentrycamError>;
