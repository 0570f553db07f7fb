//! Error types for vmhost.

use std::path::PathBuf;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the setup, recreate and purge entry points.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A privileged external command exited non-zero (or could not start).
    #[error("command failed ({exit_code}): {command}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// The boot image does not fit on the declared disk.
    #[error("image {image} is {image_bytes} bytes, larger than the {size_gib} GiB disk")]
    ImageTooLarge {
        image: String,
        image_bytes: u64,
        size_gib: u64,
    },

    /// Fetching the boot image failed.
    #[error("failed to download image {image}: {reason}")]
    ImageDownloadFailed { image: String, reason: String },

    /// Converting the boot image to raw failed.
    #[error("failed to convert image {image}: {reason}")]
    ImageConvertFailed { image: String, reason: String },

    /// A network with no host bits left was asked to be split.
    #[error("cannot split prefix {0}: no bit left to partition")]
    InvalidPrefix(String),

    /// Network text that does not parse.
    #[error("invalid address '{value}': {reason}")]
    InvalidAddress { value: String, reason: String },

    /// Wrapping or unwrapping a data-encryption key failed.
    #[error("key material unreadable at {path}: {reason}")]
    KeyMaterialUnreadable { path: PathBuf, reason: String },

    /// The system random number generator failed.
    #[error("random generator unavailable: {0}")]
    RandomUnavailable(String),

    /// Caller-supplied parameters are inconsistent.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Agent configuration could not be loaded.
    #[error("failed to load config: {0}")]
    ConfigLoad(String),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a command failure.
    pub fn command_failed(
        command: impl Into<String>,
        exit_code: i32,
        stderr: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            command: command.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }

    /// Create a key material error.
    pub fn key_material(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::KeyMaterialUnreadable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an address parse error.
    pub fn address(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create a random generator failure.
    pub fn random(what: impl Into<String>) -> Self {
        Self::RandomUnavailable(what.into())
    }

    /// Create a parameter validation error.
    pub fn params(message: impl Into<String>) -> Self {
        Self::InvalidParams(message.into())
    }

    /// Whether this is a command failure whose stderr matches one of `patterns`.
    ///
    /// Used where a missing resource counts as success.
    pub fn is_absent(&self, patterns: &[&str]) -> bool {
        match self {
            Error::CommandFailed { stderr, .. } => patterns.iter().any(|p| stderr.contains(p)),
            _ => false,
        }
    }
}

impl From<vmhost_protocol::ProtocolError> for Error {
    fn from(e: vmhost_protocol::ProtocolError) -> Self {
        match e {
            vmhost_protocol::ProtocolError::Json(e) => Error::Json(e),
            other => Error::InvalidParams(other.to_string()),
        }
    }
}
