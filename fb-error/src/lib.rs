//! Unified error handling for Fanbridge
//!
//! One error type shared by the controller layer, the broker daemon, the
//! connection manager and the fan orchestrator.

use std::io;
use std::path::PathBuf;

/// Result type alias using FanbridgeError
pub type Result<T> = std::result::Result<T, FanbridgeError>;

/// Unified error type for all Fanbridge operations
#[derive(thiserror::Error, Debug)]
pub enum FanbridgeError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    // ============================================================================
    // Controller Errors
    // ============================================================================
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Cannot decode {key} with type '{type_tag}'")]
    DecodeFailed {
        key: String,
        type_tag: String,
    },

    #[error("Write to {key} failed: {reason}")]
    WriteFailed {
        key: String,
        reason: String,
    },

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Controller driver error: {0}")]
    Driver(String),

    #[error("No working driver selector found")]
    NoSelector,

    // ============================================================================
    // Transport Errors
    // ============================================================================
    #[error("Broker channel closed: {0}")]
    ChannelDead(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Line too large: {size} bytes (max {max_size} bytes)")]
    LineTooLarge {
        size: usize,
        max_size: usize,
    },

    // ============================================================================
    // Service Management Errors
    // ============================================================================
    #[error("Broker installation failed: {0}")]
    InstallFailed(String),

    #[error("Failed to execute privileged command: {0}")]
    PrivilegeEscalation(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    // ============================================================================
    // Fan Control Errors
    // ============================================================================
    #[error("Thermal daemon reclaimed fan control after {attempts} attempts")]
    ModeConflict {
        attempts: u32,
    },

    #[error("Invalid percentage: {value} (must be 0-100)")]
    InvalidPercentage {
        value: f64,
    },

    #[error("Curve validation failed: {0}")]
    InvalidCurve(String),

    #[error("Fan {0} does not exist")]
    NoSuchFan(usize),

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("{0}")]
    Generic(String),
}

impl FanbridgeError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a driver error from a string
    pub fn driver(msg: impl Into<String>) -> Self {
        Self::Driver(msg.into())
    }

    /// Create a protocol error from a string
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a dead-channel error from a string
    pub fn channel_dead(msg: impl Into<String>) -> Self {
        Self::ChannelDead(msg.into())
    }

    /// Create a write failure for a key
    pub fn write_failed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::WriteFailed {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// True for errors after which the broker link must be dropped
    pub fn is_transport_fatal(&self) -> bool {
        matches!(self, Self::ChannelDead(_) | Self::Timeout(_) | Self::Io(_))
    }
}

// Allow converting from String to FanbridgeError
impl From<String> for FanbridgeError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to FanbridgeError
impl From<&str> for FanbridgeError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}
