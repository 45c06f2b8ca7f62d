//! Tracked sources.
//!
//! A source is one independently re-runnable unit: a file plus the shell
//! command that executes it. Sources are resolved once at startup, from CLI
//! positionals (paths or glob patterns) and/or a `sources.json` file, and
//! are immutable for the life of the process.

use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use tracing::debug;

use crate::error::SourceError;

/// Placeholder substituted with the source path in command templates.
const PATH_PLACEHOLDER: &str = "${path}";

/// A trackable file + spawn command pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    /// Absolute path of the tracked file.
    pub path: PathBuf,
    /// Shell command template; `${path}` is substituted with the source path,
    /// a template without the placeholder gets the path appended.
    pub command: String,
    /// Stable identifier derived from the path.
    pub id: String,
}

impl Source {
    pub fn new(path: PathBuf, command: impl Into<String>) -> Self {
        let id = URL_SAFE_NO_PAD.encode(path.to_string_lossy().as_bytes());
        Self {
            path,
            command: command.into(),
            id,
        }
    }

    /// The full shell command for one run of this source.
    pub fn shell_command(&self) -> String {
        let path = self.path.to_string_lossy();
        if self.command.contains(PATH_PLACEHOLDER) {
            self.command.replace(PATH_PLACEHOLDER, &path)
        } else {
            format!("{} '{}'", self.command, path)
        }
    }
}

/// One entry of `sources.json`.
#[derive(Debug, Deserialize)]
struct SourceEntry {
    path: String,
    cmd: String,
}

/// Load sources from a JSON config file: an array of `{ "path", "cmd" }`
/// objects, each path a file or glob pattern.
pub fn load_config(path: &Path) -> Result<Vec<Source>, SourceError> {
    let content = std::fs::read_to_string(path).map_err(|source| SourceError::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    let entries: Vec<SourceEntry> =
        serde_json::from_str(&content).map_err(|source| SourceError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;

    let mut sources = Vec::new();
    for entry in entries {
        for resolved in expand_paths(&entry.path)? {
            sources.push(Source::new(resolved, entry.cmd.clone()));
        }
    }
    Ok(sources)
}

/// Resolve a path or glob pattern to absolute file paths.
///
/// Plain paths must exist and be regular files; patterns must match at least
/// one file. Either failure is fatal at startup, never at runtime.
pub fn expand_paths(pattern: &str) -> Result<Vec<PathBuf>, SourceError> {
    if pattern.contains(['*', '?', '[']) {
        return expand_glob(pattern);
    }

    let path = PathBuf::from(pattern);
    if !path.exists() {
        return Err(SourceError::NotFound(path));
    }
    if path.is_dir() {
        return Err(SourceError::IsDirectory(path));
    }
    Ok(vec![absolutize(&path)?])
}

fn expand_glob(pattern: &str) -> Result<Vec<PathBuf>, SourceError> {
    let paths = glob::glob(pattern).map_err(|source| SourceError::BadPattern {
        pattern: pattern.to_string(),
        source,
    })?;

    let mut matches = Vec::new();
    for entry in paths {
        match entry {
            Ok(path) if path.is_file() => {
                debug!(path = %path.display(), "glob match");
                matches.push(absolutize(&path)?);
            }
            Ok(_) => {}
            Err(error) => {
                debug!(%error, "skipping unreadable glob entry");
            }
        }
    }

    if matches.is_empty() {
        return Err(SourceError::NoMatches(pattern.to_string()));
    }
    Ok(matches)
}

fn absolutize(path: &Path) -> Result<PathBuf, SourceError> {
    path.canonicalize().map_err(|source| SourceError::Resolve {
        path: path.to_path_buf(),
        source,
    })
}
