//! Error types for the herder crate.
//!
//! This module provides error handling for configuration loading, planning
//! and plan execution, with clear error messages and helpful context.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for herder operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for all herder operations
#[derive(Error, Debug)]
pub enum Error {
    /// User-supplied configuration is malformed or semantically invalid
    #[error("{message}")]
    InvalidConfig {
        /// Description of the configuration problem, including the
        /// offending application name when one applies
        message: String,
    },

    /// The node's own configuration file could not be written
    #[error("Unable to create configuration file {}: {message}", path.display())]
    CreateConfiguration {
        /// Path that could not be written
        path: PathBuf,
        /// Description of the underlying failure
        message: String,
    },

    /// A container with the requested name already exists
    #[error("Container already exists: {name}")]
    ContainerConflict {
        /// The conflicting container name
        name: String,
    },

    /// No volume with the requested name exists in the local pool
    #[error("Volume not found: {name}")]
    VolumeNotFound {
        /// The volume name that was not found
        name: String,
    },

    /// An attempt to push or hand off a volume this node does not own
    #[error("Volume is not locally owned: {name}")]
    NotOwned {
        /// The volume name
        name: String,
    },

    /// A kernel routing rule mutation failed
    #[error("Kernel rule change failed: {command}")]
    KernelRule {
        /// The command that failed
        command: String,
        /// Standard error from the command
        stderr: String,
    },

    /// A runtime, volume pool or transport call failed
    #[error("Transient failure: {message}")]
    Transient {
        /// Description of the failure
        message: String,
    },

    /// IO error occurred during operation
    #[error("IO error: {message}")]
    Io {
        /// Error message describing the IO failure
        message: String,
        /// The underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// YAML parsing or serialization error
    #[error("YAML error: {message}")]
    Yaml {
        /// Error message describing the YAML failure
        message: String,
        /// The underlying YAML error
        #[source]
        source: serde_yaml::Error,
    },
}

impl Error {
    /// Create a new invalid configuration error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a new application-scoped configuration error
    pub fn application_config(name: &str, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: format!(
                "Application '{name}' has a config error. {}",
                message.into()
            ),
        }
    }

    /// Create a new configuration file creation error
    pub fn create_configuration(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::CreateConfiguration {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new container conflict error
    pub fn container_conflict(name: impl Into<String>) -> Self {
        Self::ContainerConflict { name: name.into() }
    }

    /// Create a new volume not found error
    pub fn volume_not_found(name: impl Into<String>) -> Self {
        Self::VolumeNotFound { name: name.into() }
    }

    /// Create a new ownership error
    pub fn not_owned(name: impl Into<String>) -> Self {
        Self::NotOwned { name: name.into() }
    }

    /// Create a new kernel rule error
    pub fn kernel_rule(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::KernelRule {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a new transient error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Get the error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } | Self::CreateConfiguration { .. } => "config",
            Self::ContainerConflict { .. } => "runtime",
            Self::VolumeNotFound { .. } | Self::NotOwned { .. } => "volume",
            Self::KernelRule { .. } => "kernel",
            Self::Transient { .. } => "transient",
            Self::Io { .. } => "io",
            Self::Yaml { .. } => "parsing",
        }
    }

    /// Check if this error is retryable on a later convergence tick
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::KernelRule { .. } | Self::Io { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
            source: err,
        }
    }
}
