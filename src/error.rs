//! Error types and handling for Zerogrid
//!
//! This module defines the fault taxonomy shared by the device sessions, the
//! control loop and the command dispatcher.

use thiserror::Error;

/// Result type alias for Zerogrid operations
pub type Result<T> = std::result::Result<T, ZeroGridError>;

/// Main error type for Zerogrid
#[derive(Debug, Error)]
pub enum ZeroGridError {
    /// Serial or socket open/I/O failure; the session must reconnect
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Malformed, CRC-invalid or exception response on a readable channel
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// An I/O deadline elapsed
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Unknown remote command or malformed arguments
    #[error("Command error: {message}")]
    Command { message: String },

    /// A control cycle failed and the actuators were forced to zero
    #[error("Safety fault: {message}")]
    Safety { message: String },

    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// The operation was abandoned because shutdown was requested
    #[error("Cancelled: {message}")]
    Cancelled { message: String },
}

impl ZeroGridError {
    /// Create a new transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        ZeroGridError::Transport {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        ZeroGridError::Protocol {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        ZeroGridError::Timeout {
            message: message.into(),
        }
    }

    /// Create a new command error
    pub fn command<S: Into<String>>(message: S) -> Self {
        ZeroGridError::Command {
            message: message.into(),
        }
    }

    /// Create a new safety fault
    pub fn safety<S: Into<String>>(message: S) -> Self {
        ZeroGridError::Safety {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        ZeroGridError::Config {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        ZeroGridError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        ZeroGridError::Io {
            message: message.into(),
        }
    }

    /// Create a new cancellation error
    pub fn cancelled<S: Into<String>>(message: S) -> Self {
        ZeroGridError::Cancelled {
            message: message.into(),
        }
    }

    /// Whether this failure means the underlying handle is dead and a full
    /// reconnect is required before the next attempt. Timeouts and malformed
    /// responses only warrant a local retry.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, ZeroGridError::Transport { .. })
    }
}

impl From<std::io::Error> for ZeroGridError {
    fn from(err: std::io::Error) -> Self {
        ZeroGridError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for ZeroGridError {
    fn from(err: serde_yaml::Error) -> Self {
        ZeroGridError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ZeroGridError {
    fn from(err: serde_json::Error) -> Self {
        ZeroGridError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<csv::Error> for ZeroGridError {
    fn from(err: csv::Error) -> Self {
        ZeroGridError::io(err.to_string())
    }
}

impl From<tokio_serial::Error> for ZeroGridError {
    fn from(err: tokio_serial::Error) -> Self {
        ZeroGridError::transport(err.to_string())
    }
}
