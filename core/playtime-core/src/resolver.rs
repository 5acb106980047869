//! Executable resolution: decides what the tracker helper should watch.
//!
//! Resolution order:
//! 1. exact (case-insensitive) match against the known-game table,
//! 2. largest executable that is not on the deny-list,
//! 3. the known-game process names, when nothing on disk qualified.
//!
//! Given the same tables and filesystem snapshot the result is always the same.

use playtime_daemon_protocol::tracker::StartTrackingParams;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ResolutionFailure;
use crate::scan::{enumerate_executables, ExecutableCandidate};
use crate::tables::HeuristicTables;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    KnownExecutable,
    LargestExecutable,
    KnownProcessNames,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackingTarget {
    pub session_id: i64,
    pub exe_path: Option<PathBuf>,
    pub process_names: Option<Vec<String>>,
    pub track_children: bool,
    pub strategy: ResolutionStrategy,
}

impl TrackingTarget {
    pub fn to_start_params(&self, game_name: &str) -> StartTrackingParams {
        StartTrackingParams {
            session_id: self.session_id,
            exe_path: self
                .exe_path
                .as_ref()
                .map(|path| path.to_string_lossy().to_string()),
            process_names: self.process_names.clone(),
            game_name: game_name.to_string(),
            track_children: self.track_children,
            timeout: None,
        }
    }
}

/// How long to wait after launch before resolving targets for `title`.
pub fn tracking_delay(title: &str, tables: &HeuristicTables) -> Duration {
    tables.tracking_delay(title)
}

/// Scans `install_dir` (when present) and picks a tracking target.
pub fn resolve_tracking_target(
    session_id: i64,
    install_dir: Option<&Path>,
    title: &str,
    tables: &HeuristicTables,
) -> Result<TrackingTarget, ResolutionFailure> {
    let candidates = match install_dir {
        Some(dir) => enumerate_executables(dir, tables),
        None => Vec::new(),
    };
    tracing::debug!(
        session_id,
        title,
        candidates = candidates.len(),
        "Executable candidates collected"
    );
    select_target(session_id, &candidates, title, tables)
}

/// Picks a target from an already-collected candidate list.
pub fn select_target(
    session_id: i64,
    candidates: &[ExecutableCandidate],
    title: &str,
    tables: &HeuristicTables,
) -> Result<TrackingTarget, ResolutionFailure> {
    let known = tables.known_game(title);

    if let Some(game) = known {
        let exact = candidates.iter().find(|candidate| {
            game.executables
                .iter()
                .any(|name| name.eq_ignore_ascii_case(&candidate.name))
        });
        if let Some(candidate) = exact {
            return Ok(TrackingTarget {
                session_id,
                exe_path: Some(candidate.path.clone()),
                process_names: Some(game.executables.clone()),
                track_children: true,
                strategy: ResolutionStrategy::KnownExecutable,
            });
        }
    }

    let largest = candidates
        .iter()
        .filter(|candidate| !tables.is_denied(&candidate.name))
        .fold(None::<&ExecutableCandidate>, |best, candidate| match best {
            Some(best) if best.size >= candidate.size => Some(best),
            _ => Some(candidate),
        });
    if let Some(candidate) = largest {
        return Ok(TrackingTarget {
            session_id,
            exe_path: Some(candidate.path.clone()),
            process_names: None,
            track_children: true,
            strategy: ResolutionStrategy::LargestExecutable,
        });
    }

    if let Some(game) = known.filter(|game| !game.executables.is_empty()) {
        return Ok(TrackingTarget {
            session_id,
            exe_path: None,
            process_names: Some(game.executables.clone()),
            track_children: true,
            strategy: ResolutionStrategy::KnownProcessNames,
        });
    }

    Err(ResolutionFailure {
        session_id,
        title: title.to_string(),
        candidates_scanned: candidates.len(),
    })
}
