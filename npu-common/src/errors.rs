//! Error types shared by the plugin crates.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::EnvError;

/// Errors raised while loading the fault policy table or plugin configuration.
///
/// A failed load never replaces state that was already loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The source could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The fault code document is not valid JSON of the expected shape.
    #[error("malformed fault code document: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A code in a category list is neither a number nor a hex string.
    #[error("invalid fault code '{code}' in {category}")]
    InvalidCode { category: String, code: String },

    /// Every category in the fault code document is empty.
    #[error("fault code document must contain at least one fault code")]
    EmptyTable,

    /// The TOML configuration file could not be parsed.
    #[error("invalid config file {path}: {message}")]
    Toml { path: PathBuf, message: String },

    /// One or more `NPU_*` environment overrides were rejected.
    #[error("invalid environment overrides: {}", join_env_errors(.0))]
    Environment(Vec<EnvError>),

    /// Semantically invalid configuration.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn join_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors raised when a device name does not follow the Ascend naming scheme.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceNameError {
    #[error("device name '{0}' does not match the Ascend naming scheme")]
    Malformed(String),

    #[error("device id in '{0}' is out of range")]
    IdOutOfRange(String),
}
