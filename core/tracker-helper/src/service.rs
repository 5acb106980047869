//! Command handling and the per-session watch state.
//!
//! Sessions start `Pending` until a matching process shows up (or the
//! timeout expires), then stay `Active` until every tracked process is gone.

use playtime_daemon_protocol::tracker::{
    CommandEnvelope, ProcessEndedData, StartTrackingParams, TrackerCommand, TrackerEvent,
    TrackerMessage, TrackerResponse, TrackingFailedData, TrackingStartedData,
};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::watcher::{find_matches, live_set, MatchRule, ProcessInfo, ProcessSource};

pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug)]
enum WatchState {
    Pending { since: Instant, timeout: Duration },
    Active { since: Instant, pids: HashSet<u32> },
}

#[derive(Debug)]
struct WatchedSession {
    game_name: String,
    rule: MatchRule,
    track_children: bool,
    state: WatchState,
}

/// Result of handling one input line.
#[derive(Debug, Default)]
pub struct Outcome {
    pub messages: Vec<TrackerMessage>,
    pub shutdown: bool,
}

pub struct TrackerService<S: ProcessSource> {
    source: S,
    sessions: HashMap<i64, WatchedSession>,
    default_timeout: Duration,
}

impl<S: ProcessSource> TrackerService<S> {
    pub fn new(source: S, default_timeout: Duration) -> Self {
        Self {
            source,
            sessions: HashMap::new(),
            default_timeout,
        }
    }

    pub fn tracked_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn handle_line(&mut self, line: &str, now: Instant) -> Outcome {
        let envelope = match CommandEnvelope::parse(line) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(code = %err.code, "Rejected command line");
                return Outcome {
                    messages: vec![TrackerMessage::Response(TrackerResponse::failure(err.message))],
                    shutdown: false,
                };
            }
        };
        debug!(command = envelope.command.name(), "Command received");

        match envelope.command {
            TrackerCommand::StartTracking(params) => Outcome {
                messages: self.start_tracking(params, now),
                shutdown: false,
            },
            TrackerCommand::StopTracking(params) => Outcome {
                messages: vec![self.stop_tracking(params.session_id, now)],
                shutdown: false,
            },
            TrackerCommand::CheckSession(params) => Outcome {
                messages: vec![self.check_session(params.session_id, now)],
                shutdown: false,
            },
            TrackerCommand::GetAllSessions {} => Outcome {
                messages: vec![self.all_sessions(now)],
                shutdown: false,
            },
            TrackerCommand::CheckAll {} => Outcome {
                messages: vec![self.check_all()],
                shutdown: false,
            },
            TrackerCommand::Ping {} => Outcome {
                messages: vec![TrackerMessage::Response(TrackerResponse::ok(
                    json!({ "message": "pong" }),
                ))],
                shutdown: false,
            },
            TrackerCommand::Shutdown {} => {
                info!(sessions = self.sessions.len(), "Shutdown requested");
                self.sessions.clear();
                Outcome {
                    messages: vec![TrackerMessage::Response(TrackerResponse::ok(
                        json!({ "message": "shutting down" }),
                    ))],
                    shutdown: true,
                }
            }
        }
    }

    fn start_tracking(&mut self, params: StartTrackingParams, now: Instant) -> Vec<TrackerMessage> {
        let rule = MatchRule {
            exe_path: params
                .exe_path
                .as_deref()
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
            process_names: params
                .process_names
                .clone()
                .unwrap_or_default()
                .into_iter()
                .filter(|name| !name.trim().is_empty())
                .collect(),
        };
        if rule.is_empty() {
            return vec![TrackerMessage::Response(TrackerResponse::failure(
                "start_tracking needs exe_path or process_names",
            ))];
        }

        if self.sessions.remove(&params.session_id).is_some() {
            info!(session_id = params.session_id, "Replacing existing watch");
        }

        let snapshot = self.source.snapshot();
        let roots = find_matches(&snapshot, &rule);
        let session_id = params.session_id;

        let (state, status) = if roots.is_empty() {
            let timeout = params
                .timeout
                .map(Duration::from_secs)
                .unwrap_or(self.default_timeout);
            info!(session_id, game = %params.game_name, timeout_secs = timeout.as_secs(), "Waiting for game process");
            (WatchState::Pending { since: now, timeout }, "pending")
        } else {
            let pids = live_set(&snapshot, &roots, params.track_children);
            info!(session_id, game = %params.game_name, pids = ?pids, "Tracking game process");
            (WatchState::Active { since: now, pids }, "tracking")
        };

        self.sessions.insert(
            session_id,
            WatchedSession {
                game_name: params.game_name,
                rule,
                track_children: params.track_children,
                state,
            },
        );

        vec![TrackerMessage::Response(TrackerResponse::ok(json!({
            "session_id": session_id,
            "status": status,
            "tracking_started": status == "tracking",
            "pending": status == "pending",
        })))]
    }

    fn stop_tracking(&mut self, session_id: i64, now: Instant) -> TrackerMessage {
        match self.sessions.remove(&session_id) {
            Some(session) => {
                let runtime = match session.state {
                    WatchState::Active { since, .. } => now.saturating_duration_since(since),
                    WatchState::Pending { .. } => Duration::ZERO,
                };
                info!(session_id, "Stopped tracking");
                TrackerMessage::Response(TrackerResponse::ok(json!({
                    "session_id": session_id,
                    "stopped": true,
                    "runtime": runtime.as_secs_f64(),
                })))
            }
            None => TrackerMessage::Response(TrackerResponse::failure(format!(
                "session {} is not tracked",
                session_id
            ))),
        }
    }

    fn check_session(&mut self, session_id: i64, now: Instant) -> TrackerMessage {
        let active = matches!(
            self.sessions.get(&session_id).map(|session| &session.state),
            Some(WatchState::Active { .. })
        );
        let snapshot = if active { self.source.snapshot() } else { Vec::new() };
        let (is_running, status, runtime) = match self.sessions.get(&session_id) {
            Some(session) => match &session.state {
                WatchState::Pending { .. } => (false, "pending", Duration::ZERO),
                WatchState::Active { since, pids } => {
                    if still_running(&snapshot, session, pids) {
                        (true, "tracking", now.saturating_duration_since(*since))
                    } else {
                        (false, "ended", Duration::ZERO)
                    }
                }
            },
            None => (false, "untracked", Duration::ZERO),
        };
        TrackerMessage::Response(TrackerResponse::ok(json!({
            "session_id": session_id,
            "is_running": is_running,
            "status": status,
            "runtime": runtime.as_secs_f64(),
        })))
    }

    fn all_sessions(&self, now: Instant) -> TrackerMessage {
        let mut session_ids: Vec<i64> = self.sessions.keys().copied().collect();
        session_ids.sort_unstable();

        let sessions: Vec<Value> = session_ids
            .into_iter()
            .filter_map(|session_id| {
                let session = self.sessions.get(&session_id)?;
                Some(match &session.state {
                    WatchState::Pending { since, .. } => json!({
                        "session_id": session_id,
                        "game_name": session.game_name,
                        "status": "pending",
                        "elapsed_wait": now.saturating_duration_since(*since).as_secs_f64(),
                    }),
                    WatchState::Active { since, pids } => {
                        let mut pids: Vec<u32> = pids.iter().copied().collect();
                        pids.sort_unstable();
                        json!({
                            "session_id": session_id,
                            "game_name": session.game_name,
                            "status": "tracking",
                            "runtime": now.saturating_duration_since(*since).as_secs_f64(),
                            "pids": pids,
                        })
                    }
                })
            })
            .collect();
        TrackerMessage::Response(TrackerResponse::ok(json!({ "sessions": sessions })))
    }

    /// Reports liveness only; ended sessions are still announced by `tick`.
    fn check_all(&mut self) -> TrackerMessage {
        let snapshot = self.source.snapshot();
        let mut status = Map::new();
        for (session_id, session) in &self.sessions {
            if let WatchState::Active { pids, .. } = &session.state {
                status.insert(
                    session_id.to_string(),
                    Value::Bool(still_running(&snapshot, session, pids)),
                );
            }
        }
        TrackerMessage::Response(TrackerResponse::ok(json!({ "status": status })))
    }

    /// One monitor pass: promotes pending sessions, expires stale ones and
    /// reports sessions whose processes are all gone.
    pub fn tick(&mut self, now: Instant) -> Vec<TrackerMessage> {
        if self.sessions.is_empty() {
            return Vec::new();
        }
        let snapshot = self.source.snapshot();
        let mut messages = Vec::new();
        let mut finished = Vec::new();

        let mut session_ids: Vec<i64> = self.sessions.keys().copied().collect();
        session_ids.sort_unstable();

        for session_id in session_ids {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                continue;
            };
            match &mut session.state {
                WatchState::Pending { since, timeout } => {
                    let (since, timeout) = (*since, *timeout);
                    let roots = find_matches(&snapshot, &session.rule);
                    if !roots.is_empty() {
                        let pids = live_set(&snapshot, &roots, session.track_children);
                        info!(session_id, pids = ?pids, "Game process appeared");
                        session.state = WatchState::Active { since: now, pids };
                        messages.push(TrackerMessage::Notification(TrackerEvent::TrackingStarted(
                            TrackingStartedData {
                                session_id,
                                game_name: session.game_name.clone(),
                            },
                        )));
                    } else if now.saturating_duration_since(since) >= timeout {
                        warn!(session_id, "Game process never appeared");
                        finished.push(session_id);
                        messages.push(TrackerMessage::Notification(TrackerEvent::TrackingFailed(
                            TrackingFailedData {
                                session_id,
                                game_name: Some(session.game_name.clone()),
                                reason: "timeout".to_string(),
                            },
                        )));
                    }
                }
                WatchState::Active { since, pids } => {
                    let live =
                        current_live_set(&snapshot, &session.rule, pids, session.track_children);
                    if live.is_empty() {
                        let runtime = now.saturating_duration_since(*since).as_secs_f64();
                        info!(session_id, runtime, "Game process ended");
                        finished.push(session_id);
                        messages.push(TrackerMessage::Notification(TrackerEvent::ProcessEnded(
                            ProcessEndedData {
                                session_id,
                                runtime,
                            },
                        )));
                    } else {
                        *pids = live;
                    }
                }
            }
        }

        for session_id in finished {
            self.sessions.remove(&session_id);
        }
        messages
    }
}

/// Tracked pids still alive, plus fresh matches and (optionally) their children.
fn current_live_set(
    snapshot: &[ProcessInfo],
    rule: &MatchRule,
    pids: &HashSet<u32>,
    track_children: bool,
) -> HashSet<u32> {
    let mut roots = pids.clone();
    roots.extend(find_matches(snapshot, rule));
    live_set(snapshot, &roots, track_children)
}

fn still_running(snapshot: &[ProcessInfo], session: &WatchedSession, pids: &HashSet<u32>) -> bool {
    !current_live_set(snapshot, &session.rule, pids, session.track_children).is_empty()
}
