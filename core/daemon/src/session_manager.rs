//! Session lifecycle: launch, end, helper-reported exits, shutdown.
//!
//! The manager is owned by the coordinator thread, so every mutation of the
//! registry and the database is serialized. A session is closed exactly once:
//! whichever path removes it from the registry first wins, and the database
//! refuses to close a row twice.
//!
//! All operations take `now` so callers (and tests) control the clock.

use chrono::{DateTime, Utc};
use playtime_core::{resolve_tracking_target, HeuristicTables, ResolutionFailure, TrackingTarget};
use playtime_daemon_protocol::tracker::{StopTrackingParams, TrackerCommand};
use playtime_daemon_protocol::{ActiveSessionInfo, PlayTimeStats, RegisterGameParams};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::db::{format_timestamp, Db, NewGame};
use crate::launcher::GameLauncher;
use crate::registry::{ActiveSession, SessionRegistry};
use crate::tracker_client::{TrackerChannel, TrackerError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no active session for game {game_id}")]
    NotFound { game_id: i64 },

    #[error("game {game_id} is not registered")]
    GameNotFound { game_id: i64 },

    #[error("session {session_id} is no longer active")]
    SessionClosed { session_id: i64 },

    #[error("launch failed: {0}")]
    Launch(String),

    #[error(transparent)]
    Resolution(#[from] ResolutionFailure),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("storage error: {0}")]
    Storage(String),
}

impl SessionError {
    /// Wire error code for the IPC layer.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::NotFound { .. } => "not_found",
            SessionError::GameNotFound { .. } => "game_not_found",
            SessionError::SessionClosed { .. } => "session_closed",
            SessionError::Launch(_) => "launch_failed",
            SessionError::Resolution(_) => "resolution_failed",
            SessionError::Tracker(TrackerError::NotReady) => "tracker_not_ready",
            SessionError::Tracker(_) => "tracker_unavailable",
            SessionError::Storage(_) => "storage_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Relaunched,
    Ended,
    ProcessEnded,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClosedSession {
    pub session_id: i64,
    pub game_id: i64,
    pub duration: i64,
    pub end_time: String,
    pub reason: CloseReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedSession {
    pub session_id: i64,
    pub game_id: i64,
    pub title: String,
    /// Wait this long before resolving tracking targets.
    pub resolve_after: Duration,
    /// The previous session for the same game, closed by this launch.
    pub replaced: Option<ClosedSession>,
}

pub struct SessionManager<T: TrackerChannel> {
    db: Db,
    registry: SessionRegistry,
    tracker: T,
    tables: HeuristicTables,
    launcher: Box<dyn GameLauncher>,
}

impl<T: TrackerChannel> SessionManager<T> {
    pub fn new(db: Db, tracker: T, tables: HeuristicTables, launcher: Box<dyn GameLauncher>) -> Self {
        Self {
            db,
            registry: SessionRegistry::new(),
            tracker,
            tables,
            launcher,
        }
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut T {
        &mut self.tracker
    }

    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    pub fn register_game(&self, params: &RegisterGameParams) -> Result<i64, SessionError> {
        let game_id = self
            .db
            .upsert_game(&NewGame {
                title: params.title.trim(),
                platform: params.platform.as_deref(),
                install_directory: params.install_directory.as_deref(),
                launch_command: params.launch_command.as_deref(),
            })
            .map_err(SessionError::Storage)?;
        info!(game_id, title = %params.title, "Game registered");
        Ok(game_id)
    }

    /// Starts the game (when a command is known) and opens a session for it.
    ///
    /// An existing session for the same game is closed first with wall-clock
    /// duration. A failed launch opens no session.
    pub fn launch_session(
        &mut self,
        game_id: i64,
        launch_command: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<LaunchedSession, SessionError> {
        let game = self
            .db
            .get_game(game_id)
            .map_err(SessionError::Storage)?
            .ok_or(SessionError::GameNotFound { game_id })?;

        let replaced = match self.registry.lookup(game_id).map(|existing| existing.session_id) {
            Some(previous) => {
                warn!(
                    game_id,
                    session_id = previous,
                    "Game relaunched while a session was open; closing previous session"
                );
                self.close_active(game_id, now, None, CloseReason::Relaunched)?
            }
            None => None,
        };

        let command = launch_command
            .filter(|command| !command.trim().is_empty())
            .or(game.launch_command.as_deref());
        match command {
            Some(command) => self.launcher.launch(command).map_err(SessionError::Launch)?,
            None => debug!(game_id, "No launch command; recording session only"),
        }

        let session_id = self
            .db
            .start_session(game_id, now)
            .map_err(SessionError::Storage)?;
        self.registry.insert(ActiveSession {
            session_id,
            game_id,
            title: game.title.clone(),
            started_at: now,
        });

        let resolve_after = self.tables.tracking_delay(&game.title);
        info!(
            game_id,
            session_id,
            title = %game.title,
            resolve_after_secs = resolve_after.as_secs(),
            "Session started"
        );

        Ok(LaunchedSession {
            session_id,
            game_id,
            title: game.title,
            resolve_after,
            replaced,
        })
    }

    /// Resolves what to watch for a session and asks the helper to track it.
    ///
    /// Runs after the launch delay; a session that already ended is skipped.
    pub fn begin_tracking(&mut self, session_id: i64) -> Result<TrackingTarget, SessionError> {
        let game_id = self
            .registry
            .game_for_session(session_id)
            .ok_or(SessionError::SessionClosed { session_id })?;
        if !self.tracker.is_ready() {
            return Err(SessionError::Tracker(TrackerError::NotReady));
        }

        let game = self
            .db
            .get_game(game_id)
            .map_err(SessionError::Storage)?
            .ok_or(SessionError::GameNotFound { game_id })?;
        let install_dir = game.install_directory.as_deref().map(Path::new);
        let target = resolve_tracking_target(session_id, install_dir, &game.title, &self.tables)?;

        self.tracker
            .send_command(TrackerCommand::StartTracking(target.to_start_params(&game.title)))?;
        info!(
            session_id,
            strategy = ?target.strategy,
            exe_path = ?target.exe_path,
            "Tracking requested"
        );
        Ok(target)
    }

    /// Closes the active session for `game_id` using wall-clock duration.
    pub fn end_session(
        &mut self,
        game_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<ClosedSession>, SessionError> {
        if self.registry.lookup(game_id).is_none() {
            return Err(SessionError::NotFound { game_id });
        }
        self.close_active(game_id, now, None, CloseReason::Ended)
    }

    /// Closes a session the helper saw exit, using the helper's runtime.
    /// Unknown or already-closed sessions are ignored.
    pub fn handle_process_ended(
        &mut self,
        session_id: i64,
        runtime_secs: i64,
        now: DateTime<Utc>,
    ) -> Option<ClosedSession> {
        let Some(game_id) = self.registry.game_for_session(session_id) else {
            info!(session_id, "Process ended for a session that is not active; ignoring");
            return None;
        };
        match self.close_active(game_id, now, Some(runtime_secs), CloseReason::ProcessEnded) {
            Ok(closed) => closed,
            Err(err) => {
                warn!(session_id, error = %err, "Failed to persist process-ended session");
                None
            }
        }
    }

    /// Closes every active session with wall-clock duration. Used at shutdown.
    pub fn end_all_active_sessions(&mut self, now: DateTime<Utc>) -> Vec<ClosedSession> {
        if self.registry.is_empty() {
            return Vec::new();
        }
        let mut game_ids = Vec::new();
        self.registry.for_each(|session| game_ids.push(session.game_id));

        let mut closed = Vec::new();
        for game_id in game_ids {
            match self.close_active(game_id, now, None, CloseReason::Shutdown) {
                Ok(Some(session)) => closed.push(session),
                Ok(None) => {}
                Err(err) => warn!(game_id, error = %err, "Failed to close session at shutdown"),
            }
        }
        closed
    }

    pub fn active_sessions(&self, now: DateTime<Utc>) -> Vec<ActiveSessionInfo> {
        let mut sessions = Vec::new();
        self.registry.for_each(|session| {
            sessions.push(ActiveSessionInfo {
                game_id: session.game_id,
                session_id: session.session_id,
                title: session.title.clone(),
                start_time: format_timestamp(session.started_at),
                current_duration: wall_clock_secs(session, now),
            })
        });
        sessions
    }

    pub fn play_time(&self, game_id: i64) -> Result<PlayTimeStats, SessionError> {
        self.db
            .play_time_stats(game_id)
            .map_err(SessionError::Storage)?
            .ok_or(SessionError::GameNotFound { game_id })
    }

    pub fn sweep_orphans(
        &mut self,
        now: DateTime<Utc>,
        long_session_after: chrono::Duration,
    ) -> crate::orphan_monitor::SweepReport {
        crate::orphan_monitor::sweep(&mut self.registry, &self.db, now, long_session_after)
    }

    fn stop_tracking(&mut self, session_id: i64) {
        if !self.tracker.is_ready() {
            return;
        }
        if let Err(err) = self
            .tracker
            .send_command(TrackerCommand::StopTracking(StopTrackingParams { session_id }))
        {
            warn!(session_id, error = %err, "Failed to send stop_tracking");
        }
    }

    /// Closes the indexed session for `game_id`, using `runtime_secs` when the
    /// helper measured it and wall-clock time otherwise.
    ///
    /// The entry is only dropped from the registry once the row is closed, so
    /// a failed write leaves the session open for a later end or shutdown.
    fn close_active(
        &mut self,
        game_id: i64,
        now: DateTime<Utc>,
        runtime_secs: Option<i64>,
        reason: CloseReason,
    ) -> Result<Option<ClosedSession>, SessionError> {
        let Some(session) = self.registry.lookup(game_id).cloned() else {
            return Ok(None);
        };
        let duration = match runtime_secs {
            Some(runtime) => runtime.max(0),
            None => wall_clock_secs(&session, now),
        };

        let closed = self.finish(&session, now, duration, reason)?;
        self.registry.remove(game_id);
        if reason != CloseReason::ProcessEnded {
            self.stop_tracking(session.session_id);
        }
        Ok(closed)
    }

    fn finish(
        &self,
        session: &ActiveSession,
        now: DateTime<Utc>,
        duration: i64,
        reason: CloseReason,
    ) -> Result<Option<ClosedSession>, SessionError> {
        let row = self
            .db
            .close_session(session.session_id, now, duration)
            .map_err(SessionError::Storage)?;
        let Some(row) = row else {
            warn!(
                session_id = session.session_id,
                "Session row was already closed; nothing recorded"
            );
            return Ok(None);
        };

        let closed = ClosedSession {
            session_id: row.id,
            game_id: row.game_id,
            duration: row.duration.unwrap_or(0),
            end_time: row.end_time.unwrap_or_else(|| format_timestamp(now)),
            reason,
        };
        info!(
            session_id = closed.session_id,
            game_id = closed.game_id,
            duration = closed.duration,
            reason = ?closed.reason,
            "Session ended"
        );
        Ok(Some(closed))
    }
}

fn wall_clock_secs(session: &ActiveSession, now: DateTime<Utc>) -> i64 {
    (now - session.started_at).num_seconds().max(0)
}
