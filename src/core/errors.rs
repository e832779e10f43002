//! UGK-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, UgkError>;

/// Top-level error type for the USB gatekeeper.
#[derive(Debug, Error)]
pub enum UgkError {
    #[error("[UGK-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[UGK-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[UGK-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[UGK-2001] cannot resolve block device for {device_node}: {details}")]
    Resolution {
        device_node: PathBuf,
        details: String,
    },

    #[error("[UGK-2002] invalid device identity: {details}")]
    InvalidIdentity { details: String },

    #[error("[UGK-2003] no mount record for {device_node}")]
    MountRecordMissing { device_node: PathBuf },

    #[error("[UGK-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[UGK-2102] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error("[UGK-2201] classifier artifact rejected: {details}")]
    ClassifierArtifact { details: String },

    #[error("[UGK-3001] privileged command `{command}` failed: {details}")]
    Execution { command: String, details: String },

    #[error("[UGK-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[UGK-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[UGK-3004] prompt failed: {details}")]
    Prompt { details: String },

    #[error("[UGK-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl UgkError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "UGK-1001",
            Self::MissingConfig { .. } => "UGK-1002",
            Self::ConfigParse { .. } => "UGK-1003",
            Self::Resolution { .. } => "UGK-2001",
            Self::InvalidIdentity { .. } => "UGK-2002",
            Self::MountRecordMissing { .. } => "UGK-2003",
            Self::Serialization { .. } => "UGK-2101",
            Self::Sql { .. } => "UGK-2102",
            Self::ClassifierArtifact { .. } => "UGK-2201",
            Self::Execution { .. } => "UGK-3001",
            Self::Io { .. } => "UGK-3002",
            Self::ChannelClosed { .. } => "UGK-3003",
            Self::Prompt { .. } => "UGK-3004",
            Self::Runtime { .. } => "UGK-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    ///
    /// Privileged command failures are deliberately not retryable: mount,
    /// mkdir and rule appends are not safe to replay blindly.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::ChannelClosed { .. } | Self::Sql { .. } | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for UgkError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for UgkError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for UgkError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
