//! Crate-wide error type.
//!
//! Engines never surface this type to the pipeline -- a failure inside an
//! engine is converted into a `Finding` (see `pipeline::Finding`) so that one
//! bad file never aborts a scan. `WardenError` is reserved for failures that
//! *are* fatal: configuration parsing, signature loading, and cache/database
//! setup at startup.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WardenError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("failed to parse signature file at {path}: {source}")]
    SignatureParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid regex pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("hash cache unavailable at {path}: {source}")]
    CacheOpen {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("signing binary '{binary}' not found on PATH")]
    SigningBinaryMissing { binary: String },

    #[error("signing failed (exit {code}): {stderr}")]
    SigningFailed { code: i32, stderr: String },
}
