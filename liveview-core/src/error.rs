//! Error types for source configuration.
//!
//! These are startup-time errors only: once the server is running, failures
//! in the watch/dispatch paths are logged and contained, never propagated.

use std::path::PathBuf;

/// Errors raised while resolving tracked sources from CLI arguments or the
/// configuration file.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("path does not exist: '{0}'")]
    NotFound(PathBuf),

    #[error("path is a directory, expected a file: '{0}'")]
    IsDirectory(PathBuf),

    #[error("invalid glob pattern '{pattern}'")]
    BadPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("no files match '{0}'")]
    NoMatches(String),

    #[error("failed to resolve '{path}'")]
    Resolve {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read config '{path}'")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config '{path}'")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
