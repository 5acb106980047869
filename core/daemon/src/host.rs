//! The coordinator: a single thread that owns the session manager.
//!
//! Socket connections, helper reader threads, timers and the signal watcher
//! never touch session state. They post [`HostEvent`]s here and the loop
//! applies them one at a time.

use chrono::{DateTime, Utc};
use playtime_daemon_protocol::tracker::{TrackerEvent, TrackerMessage, TrackerResponse};
use playtime_daemon_protocol::{
    parse_game_id, parse_launch_game, parse_register_game, ErrorInfo, LaunchGameResult, Method,
    Request, Response, PROTOCOL_VERSION,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::mpsc::{Receiver, Sender};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::session_manager::{SessionError, SessionManager};
use crate::timers::{TimerId, TimerRegistry};
use crate::tracker_client::{TrackerChannel, TrackerSignal};

pub enum HostEvent {
    Request {
        request: Request,
        reply: Sender<Response>,
    },
    Tracker(TrackerSignal),
    ResolveTracking {
        session_id: i64,
    },
    OrphanSweep,
    Shutdown {
        reason: &'static str,
    },
}

pub struct Host<T: TrackerChannel> {
    manager: SessionManager<T>,
    timers: TimerRegistry,
    events: Sender<HostEvent>,
    pending_resolutions: HashMap<i64, TimerId>,
    monitor: MonitorConfig,
    started_at: DateTime<Utc>,
    stopped: bool,
}

impl<T: TrackerChannel> Host<T> {
    pub fn new(manager: SessionManager<T>, events: Sender<HostEvent>, monitor: MonitorConfig) -> Self {
        Self {
            manager,
            timers: TimerRegistry::new(),
            events,
            pending_resolutions: HashMap::new(),
            monitor,
            started_at: Utc::now(),
            stopped: false,
        }
    }

    pub fn run(mut self, events: Receiver<HostEvent>) {
        self.start_orphan_monitor();
        while let Ok(event) = events.recv() {
            if self.handle_event(event, Utc::now()).is_break() {
                break;
            }
        }
        self.shutdown(Utc::now());
    }

    fn start_orphan_monitor(&mut self) {
        let events = self.events.clone();
        self.timers
            .schedule_repeating(self.monitor.sweep_interval(), move || {
                let _ = events.send(HostEvent::OrphanSweep);
            });
    }

    pub fn handle_event(&mut self, event: HostEvent, now: DateTime<Utc>) -> ControlFlow<()> {
        match event {
            HostEvent::Request { request, reply } => {
                let stop = request.method == Method::Shutdown
                    && request.protocol_version == PROTOCOL_VERSION;
                let response = self.handle_request(request, now);
                let _ = reply.send(response);
                if stop {
                    info!("Shutdown requested over IPC");
                    return ControlFlow::Break(());
                }
            }
            HostEvent::Tracker(TrackerSignal::Message(message)) => {
                self.handle_tracker_message(message, now)
            }
            HostEvent::Tracker(TrackerSignal::Exited) => self.manager.tracker_mut().mark_exited(),
            HostEvent::ResolveTracking { session_id } => self.resolve_tracking(session_id),
            HostEvent::OrphanSweep => {
                let report = self
                    .manager
                    .sweep_orphans(now, self.monitor.long_session_threshold());
                debug!(
                    checked = report.checked,
                    removed = report.removed.len(),
                    long_running = report.long_running.len(),
                    errors = report.errors,
                    "Orphan sweep ran"
                );
            }
            HostEvent::Shutdown { reason } => {
                info!(reason, "Shutdown requested");
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Cancels timers, closes every session and stops the helper. Idempotent.
    pub fn shutdown(&mut self, now: DateTime<Utc>) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        let cancelled = self.timers.cancel_all();
        self.pending_resolutions.clear();
        let closed = self.manager.end_all_active_sessions(now);
        self.manager.tracker_mut().shutdown();
        info!(
            timers_cancelled = cancelled,
            sessions_closed = closed.len(),
            "Daemon shut down"
        );
    }

    fn handle_request(&mut self, request: Request, now: DateTime<Utc>) -> Response {
        if request.protocol_version != PROTOCOL_VERSION {
            return Response::error(
                request.id,
                "protocol_mismatch",
                "unsupported protocol version",
            );
        }

        let id = request.id;
        match request.method {
            Method::GetHealth => Response::ok(
                id,
                json!({
                    "status": "ok",
                    "pid": std::process::id(),
                    "version": env!("CARGO_PKG_VERSION"),
                    "protocol_version": PROTOCOL_VERSION,
                    "tracker_ready": self.manager.tracker().is_ready(),
                    "active_sessions": self.manager.active_count(),
                    "pending_timers": self.timers.pending(),
                    "uptime_secs": (now - self.started_at).num_seconds().max(0),
                }),
            ),
            Method::RegisterGame => {
                let params = match require_params(request.params).and_then(parse_register_game) {
                    Ok(params) => params,
                    Err(err) => return Response::error_with_info(id, err),
                };
                match self.manager.register_game(&params) {
                    Ok(game_id) => Response::ok(id, json!({ "game_id": game_id })),
                    Err(err) => session_error(id, err),
                }
            }
            Method::LaunchGame => {
                let params = match require_params(request.params).and_then(parse_launch_game) {
                    Ok(params) => params,
                    Err(err) => return Response::error_with_info(id, err),
                };
                match self
                    .manager
                    .launch_session(params.game_id, params.launch_command.as_deref(), now)
                {
                    Ok(launched) => {
                        if let Some(replaced) = &launched.replaced {
                            self.cancel_resolution(replaced.session_id);
                        }
                        self.schedule_resolution(launched.session_id, launched.resolve_after);
                        ok_json(
                            id,
                            &LaunchGameResult {
                                success: true,
                                session_id: launched.session_id,
                            },
                        )
                    }
                    Err(err) => session_error(id, err),
                }
            }
            Method::EndGameSession => {
                let params = match require_params(request.params).and_then(parse_game_id) {
                    Ok(params) => params,
                    Err(err) => return Response::error_with_info(id, err),
                };
                match self.manager.end_session(params.game_id, now) {
                    Ok(closed) => {
                        if let Some(closed) = &closed {
                            self.cancel_resolution(closed.session_id);
                        }
                        Response::ok(id, json!({ "success": true, "session": closed }))
                    }
                    Err(err) => session_error(id, err),
                }
            }
            Method::GetActiveSessions => ok_json(id, &self.manager.active_sessions(now)),
            Method::GetPlayTime => {
                let params = match require_params(request.params).and_then(parse_game_id) {
                    Ok(params) => params,
                    Err(err) => return Response::error_with_info(id, err),
                };
                match self.manager.play_time(params.game_id) {
                    Ok(stats) => ok_json(id, &stats),
                    Err(err) => session_error(id, err),
                }
            }
            Method::Shutdown => Response::ok(id, json!({ "shutting_down": true })),
        }
    }

    fn handle_tracker_message(&mut self, message: TrackerMessage, now: DateTime<Utc>) {
        match message {
            TrackerMessage::Response(response) if response.is_ready() => {
                self.manager.tracker_mut().mark_ready()
            }
            TrackerMessage::Response(TrackerResponse {
                success: false,
                error,
                ..
            }) => {
                warn!(error = ?error, "Tracker helper rejected a command");
            }
            TrackerMessage::Response(response) => {
                debug!(data = ?response.data, "Tracker helper acknowledged command");
            }
            TrackerMessage::Notification(TrackerEvent::ProcessEnded(data)) => {
                if let Some(closed) =
                    self.manager
                        .handle_process_ended(data.session_id, data.runtime_secs(), now)
                {
                    self.cancel_resolution(closed.session_id);
                }
            }
            TrackerMessage::Notification(TrackerEvent::TrackingStarted(data)) => {
                info!(session_id = data.session_id, game = %data.game_name, "Tracker found game process");
            }
            TrackerMessage::Notification(TrackerEvent::TrackingFailed(data)) => {
                warn!(
                    session_id = data.session_id,
                    reason = %data.reason,
                    "Tracker gave up; session will close on wall-clock time"
                );
            }
            TrackerMessage::Notification(TrackerEvent::Unknown { event, .. }) => {
                debug!(event = %event, "Ignoring unknown tracker notification");
            }
        }
    }

    fn schedule_resolution(&mut self, session_id: i64, delay: Duration) {
        let events = self.events.clone();
        let timer = self.timers.schedule_once(delay, move || {
            let _ = events.send(HostEvent::ResolveTracking { session_id });
        });
        self.pending_resolutions.insert(session_id, timer);
    }

    fn cancel_resolution(&mut self, session_id: i64) {
        if let Some(timer) = self.pending_resolutions.remove(&session_id) {
            self.timers.cancel(timer);
        }
    }

    fn resolve_tracking(&mut self, session_id: i64) {
        self.pending_resolutions.remove(&session_id);
        match self.manager.begin_tracking(session_id) {
            Ok(_) => {}
            Err(SessionError::SessionClosed { .. }) => {
                debug!(session_id, "Session ended before tracking started");
            }
            Err(SessionError::Tracker(err)) => {
                info!(session_id, error = %err, "Process tracking skipped; wall-clock only");
            }
            Err(err) => {
                warn!(session_id, error = %err, "Process tracking unavailable; wall-clock only");
            }
        }
    }
}

fn require_params(params: Option<Value>) -> Result<Value, ErrorInfo> {
    params.ok_or_else(|| ErrorInfo::new("missing_params", "params are required"))
}

fn ok_json<S: Serialize>(id: Option<String>, value: &S) -> Response {
    match serde_json::to_value(value) {
        Ok(data) => Response::ok(id, data),
        Err(err) => Response::error(id, "serialization_error", err.to_string()),
    }
}

fn session_error(id: Option<String>, err: SessionError) -> Response {
    Response::error(id, err.code(), err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::session_manager::tests::{FakeTracker, RecordingLauncher};
    use chrono::TimeZone;
    use playtime_core::HeuristicTables;
    use playtime_daemon_protocol::tracker::{ProcessEndedData, TrackerCommand};
    use std::sync::mpsc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 18, 0, 0).single().expect("valid time")
    }

    fn secs(value: i64) -> chrono::Duration {
        chrono::Duration::seconds(value)
    }

    fn request(method: Method, params: Option<Value>) -> Request {
        Request {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: Some("test".to_string()),
            params,
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        host: Host<FakeTracker>,
        _events: Receiver<HostEvent>,
    }

    impl Harness {
        fn new(ready: bool) -> Self {
            let dir = tempfile::tempdir().expect("temp dir");
            let db = Db::new(dir.path().join("playtime.db")).expect("db");
            let tracker = FakeTracker {
                ready,
                ..FakeTracker::default()
            };
            let manager = SessionManager::new(
                db,
                tracker,
                HeuristicTables::default(),
                Box::new(RecordingLauncher::default()),
            );
            let (tx, rx) = mpsc::channel();
            Self {
                dir,
                host: Host::new(manager, tx, MonitorConfig::default()),
                _events: rx,
            }
        }

        fn call(&mut self, method: Method, params: Option<Value>, now: DateTime<Utc>) -> Response {
            let (reply, response) = mpsc::channel();
            let flow = self.host.handle_event(
                HostEvent::Request {
                    request: request(method, params),
                    reply,
                },
                now,
            );
            assert!(flow.is_continue() || method == Method::Shutdown);
            response.recv().expect("response")
        }

        fn register(&mut self, title: &str) -> i64 {
            let response = self.call(Method::RegisterGame, Some(json!({ "title": title })), t0());
            assert!(response.ok, "register failed: {:?}", response.error);
            response.data.expect("data")["game_id"]
                .as_i64()
                .expect("game id")
        }
    }

    #[test]
    fn request_flow_tracks_play_time() {
        let mut harness = Harness::new(false);
        let game_id = harness.register("Generic Game");

        let launched = harness.call(
            Method::LaunchGame,
            Some(json!({ "game_id": game_id })),
            t0(),
        );
        assert!(launched.ok);
        let session_id = launched.data.expect("data")["session_id"]
            .as_i64()
            .expect("session id");

        let active = harness.call(Method::GetActiveSessions, None, t0() + secs(30));
        let active = active.data.expect("data");
        assert_eq!(active[0]["session_id"], session_id);
        assert_eq!(active[0]["current_duration"], 30);

        let ended = harness.call(
            Method::EndGameSession,
            Some(json!({ "game_id": game_id })),
            t0() + secs(90),
        );
        assert!(ended.ok);
        assert_eq!(ended.data.expect("data")["session"]["duration"], 90);

        let again = harness.call(
            Method::EndGameSession,
            Some(json!({ "game_id": game_id })),
            t0() + secs(95),
        );
        assert!(!again.ok);
        assert_eq!(again.error.expect("error").code, "not_found");

        let stats = harness.call(
            Method::GetPlayTime,
            Some(json!({ "game_id": game_id })),
            t0() + secs(100),
        );
        let stats = stats.data.expect("data");
        assert_eq!(stats["total_play_time"], 90);
        assert_eq!(stats["launch_count"], 1);
        assert_eq!(stats["session_count"], 1);
    }

    #[test]
    fn rejects_protocol_mismatch_and_missing_params() {
        let mut harness = Harness::new(false);
        let (reply, response) = mpsc::channel();
        let mut bad = request(Method::GetHealth, None);
        bad.protocol_version = PROTOCOL_VERSION + 1;
        let _ = harness
            .host
            .handle_event(HostEvent::Request { request: bad, reply }, t0());
        let response = response.recv().expect("response");
        assert_eq!(response.error.expect("error").code, "protocol_mismatch");

        let response = harness.call(Method::LaunchGame, None, t0());
        assert_eq!(response.error.expect("error").code, "missing_params");

        let response = harness.call(Method::GetPlayTime, Some(json!({ "game_id": 404 })), t0());
        assert_eq!(response.error.expect("error").code, "game_not_found");
    }

    #[test]
    fn helper_readiness_and_process_exit_close_session() {
        let mut harness = Harness::new(false);
        let game_id = harness.register("Generic Game");
        let launched = harness.call(Method::LaunchGame, Some(json!({ "game_id": game_id })), t0());
        let session_id = launched.data.expect("data")["session_id"]
            .as_i64()
            .expect("session id");

        let health = harness.call(Method::GetHealth, None, t0());
        assert_eq!(health.data.expect("data")["tracker_ready"], false);

        let _ = harness.host.handle_event(
            HostEvent::Tracker(TrackerSignal::Message(TrackerMessage::Response(
                TrackerResponse::ready(),
            ))),
            t0(),
        );
        assert!(harness.host.manager.tracker().is_ready());

        let _ = harness.host.handle_event(
            HostEvent::Tracker(TrackerSignal::Message(TrackerMessage::Notification(
                TrackerEvent::ProcessEnded(ProcessEndedData {
                    session_id,
                    runtime: 61.6,
                }),
            ))),
            t0() + secs(300),
        );
        assert_eq!(harness.host.manager.active_count(), 0);
        assert!(harness.host.pending_resolutions.is_empty());

        let stats = harness.host.manager.play_time(game_id).expect("stats");
        assert_eq!(stats.total_play_time, 62);

        let _ = harness
            .host
            .handle_event(HostEvent::Tracker(TrackerSignal::Exited), t0());
        assert!(!harness.host.manager.tracker().is_ready());
    }

    #[test]
    fn delayed_resolution_starts_tracking() {
        let mut harness = Harness::new(true);
        let install_dir = harness.dir.path().join("install");
        fs_err::create_dir_all(&install_dir).expect("install dir");
        fs_err::write(install_dir.join("Game.exe"), b"MZ").expect("exe");

        let response = harness.call(
            Method::RegisterGame,
            Some(json!({
                "title": "Some Game",
                "install_directory": install_dir.to_string_lossy(),
            })),
            t0(),
        );
        let game_id = response.data.expect("data")["game_id"].as_i64().expect("id");
        let launched = harness.call(Method::LaunchGame, Some(json!({ "game_id": game_id })), t0());
        let session_id = launched.data.expect("data")["session_id"]
            .as_i64()
            .expect("session id");

        let _ = harness
            .host
            .handle_event(HostEvent::ResolveTracking { session_id }, t0() + secs(3));
        match harness.host.manager.tracker().sent.last() {
            Some(TrackerCommand::StartTracking(params)) => {
                assert_eq!(params.session_id, session_id);
                assert!(params
                    .exe_path
                    .as_deref()
                    .is_some_and(|path| path.ends_with("Game.exe")));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn shutdown_closes_sessions_and_stops_helper_once() {
        let mut harness = Harness::new(true);
        let first_game = harness.register("Generic Game");
        let second_game = harness.register("Other Game");
        let launch_session = |harness: &mut Harness, game_id: i64, now: DateTime<Utc>| {
            let response =
                harness.call(Method::LaunchGame, Some(json!({ "game_id": game_id })), now);
            response.data.expect("data")["session_id"]
                .as_i64()
                .expect("session id")
        };
        let first_session = launch_session(&mut harness, first_game, t0());
        let second_session = launch_session(&mut harness, second_game, t0() + secs(4));

        let flow = harness.host.handle_event(
            HostEvent::Shutdown { reason: "test" },
            t0() + secs(10),
        );
        assert!(flow.is_break());
        harness.host.shutdown(t0() + secs(20));

        let manager = &harness.host.manager;
        let stopped: Vec<i64> = manager
            .tracker()
            .sent
            .iter()
            .filter_map(|command| match command {
                TrackerCommand::StopTracking(params) => Some(params.session_id),
                _ => None,
            })
            .collect();
        assert_eq!(stopped, vec![first_session, second_session]);
        assert_eq!(manager.tracker().shutdowns, 1);
        assert_eq!(manager.active_count(), 0);

        let total = |game_id| manager.play_time(game_id).expect("stats").total_play_time;
        assert_eq!(total(first_game), 10);
        assert_eq!(total(second_game), 6);
    }

    #[test]
    fn shutdown_method_breaks_loop_after_replying() {
        let mut harness = Harness::new(false);
        let (reply, response) = mpsc::channel();
        let flow = harness.host.handle_event(
            HostEvent::Request {
                request: request(Method::Shutdown, None),
                reply,
            },
            t0(),
        );
        assert!(flow.is_break());
        assert!(response.recv().expect("response").ok);
    }

    #[cfg(unix)]
    #[test]
    fn end_to_end_with_scripted_helper() {
        use crate::config::TrackerConfig;
        use crate::tracker_client::TrackerClient;
        use std::path::Path;

        let dir = tempfile::tempdir().expect("temp dir");
        let install_dir = dir.path().join("install");
        fs_err::create_dir_all(&install_dir).expect("install dir");
        fs_err::write(install_dir.join("Game.exe"), b"MZ").expect("exe");

        let script = r#"printf '%s\n' '{"success":true,"data":{"message":"ready"}}'
while read line; do
  case "$line" in
    *start_tracking*)
      sid=$(printf '%s' "$line" | sed 's/.*"session_id":\([0-9]*\).*/\1/')
      printf '{"type":"notification","event":"process_ended","data":{"session_id":%s,"runtime":42}}\n' "$sid" ;;
    *shutdown*) exit 0 ;;
  esac
done"#;

        let (tx, rx) = mpsc::channel();
        let notify = tx.clone();
        let tracker = TrackerClient::start(
            Path::new("/bin/sh"),
            &TrackerConfig {
                helper_args: vec!["-c".to_string(), script.to_string()],
                ..TrackerConfig::default()
            },
            move |signal| {
                let _ = notify.send(HostEvent::Tracker(signal));
            },
        )
        .expect("helper");

        let tables = HeuristicTables {
            short_delay_secs: 0,
            ..HeuristicTables::default()
        };
        let db = Db::new(dir.path().join("playtime.db")).expect("db");
        let manager = SessionManager::new(db, tracker, tables, Box::new(RecordingLauncher::default()));
        let host = Host::new(manager, tx.clone(), MonitorConfig::default());
        let worker = std::thread::spawn(move || host.run(rx));

        let call = |method: Method, params: Option<Value>| -> Response {
            let (reply, response) = mpsc::channel();
            tx.send(HostEvent::Request {
                request: request(method, params),
                reply,
            })
            .expect("send");
            response
                .recv_timeout(Duration::from_secs(5))
                .expect("response")
        };

        // Wait for the helper handshake so the resolution timer finds it ready.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while call(Method::GetHealth, None).data.expect("data")["tracker_ready"] != true {
            assert!(std::time::Instant::now() < deadline, "helper never became ready");
            std::thread::sleep(Duration::from_millis(20));
        }

        let registered = call(
            Method::RegisterGame,
            Some(json!({ "title": "Scripted", "install_directory": install_dir.to_string_lossy() })),
        );
        let game_id = registered.data.expect("data")["game_id"].as_i64().expect("id");
        assert!(call(Method::LaunchGame, Some(json!({ "game_id": game_id }))).ok);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let stats = call(Method::GetPlayTime, Some(json!({ "game_id": game_id })));
            if stats.data.expect("data")["total_play_time"] == 42 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "process_ended never applied");
            std::thread::sleep(Duration::from_millis(20));
        }

        assert!(call(Method::Shutdown, None).ok);
        worker.join().expect("host thread");
    }
}
