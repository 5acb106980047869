//! Error types for playtime-core operations.

use std::path::PathBuf;

/// All errors that can occur while loading heuristic data.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Heuristic tables malformed: {path}: {details}")]
    TablesMalformed { path: PathBuf, details: String },

    #[error("Heuristic tables version {found} is newer than supported version {supported}")]
    UnsupportedTablesVersion { found: u32, supported: u32 },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// No executable path and no known process names were found for a title.
///
/// Tracking is disabled for the session; it still closes on wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no executable or process name resolved for '{title}' (session {session_id}, {candidates_scanned} candidates scanned)")]
pub struct ResolutionFailure {
    pub session_id: i64,
    pub title: String,
    pub candidates_scanned: usize,
}
