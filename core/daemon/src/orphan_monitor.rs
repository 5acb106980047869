//! Periodic reconciliation of the in-memory registry against the database.
//!
//! Entries whose row was closed by something else (or vanished) are dropped.
//! Sessions open for a very long time are only reported; they are never
//! closed here.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::db::Db;
use crate::registry::SessionRegistry;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    pub removed: Vec<i64>,
    pub long_running: Vec<i64>,
    pub errors: usize,
}

pub fn sweep(
    registry: &mut SessionRegistry,
    db: &Db,
    now: DateTime<Utc>,
    long_session_after: chrono::Duration,
) -> SweepReport {
    let mut entries = Vec::new();
    registry.for_each(|session| entries.push(session.clone()));

    let mut report = SweepReport::default();
    for session in entries {
        report.checked += 1;
        match db.get_session(session.session_id) {
            Ok(Some(row)) if row.end_time.is_some() => {
                registry.remove(session.game_id);
                report.removed.push(session.session_id);
                info!(
                    session_id = session.session_id,
                    game_id = session.game_id,
                    "Removed orphaned session; row already closed"
                );
            }
            Ok(Some(_)) => {
                let open_for = now - session.started_at;
                if open_for > long_session_after {
                    report.long_running.push(session.session_id);
                    warn!(
                        session_id = session.session_id,
                        title = %session.title,
                        open_hours = open_for.num_hours(),
                        "Session has been open for a long time"
                    );
                }
            }
            Ok(None) => {
                registry.remove(session.game_id);
                report.removed.push(session.session_id);
                warn!(
                    session_id = session.session_id,
                    "Removed orphaned session; row no longer exists"
                );
            }
            Err(err) => {
                report.errors += 1;
                warn!(
                    session_id = session.session_id,
                    error = %err,
                    "Orphan check failed for session"
                );
            }
        }
    }

    if !report.removed.is_empty() || !report.long_running.is_empty() {
        info!(
            checked = report.checked,
            removed = report.removed.len(),
            long_running = report.long_running.len(),
            "Orphan sweep finished"
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewGame;
    use crate::registry::ActiveSession;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().expect("valid time")
    }

    fn setup() -> (tempfile::TempDir, Db, i64) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("playtime.db")).expect("db");
        let game_id = db
            .upsert_game(&NewGame {
                title: "Game",
                platform: None,
                install_directory: None,
                launch_command: None,
            })
            .expect("game");
        (temp_dir, db, game_id)
    }

    fn index(registry: &mut SessionRegistry, session_id: i64, game_id: i64, started_at: DateTime<Utc>) {
        registry.insert(ActiveSession {
            session_id,
            game_id,
            title: "Game".to_string(),
            started_at,
        });
    }

    #[test]
    fn drops_entries_whose_row_is_closed() {
        let (_dir, db, game_id) = setup();
        let session_id = db.start_session(game_id, t0()).expect("start");
        db.close_session(session_id, t0() + chrono::Duration::seconds(10), 10)
            .expect("close");

        let mut registry = SessionRegistry::new();
        index(&mut registry, session_id, game_id, t0());

        let report = sweep(&mut registry, &db, t0(), chrono::Duration::hours(12));
        assert_eq!(report.removed, vec![session_id]);
        assert!(registry.is_empty());
    }

    #[test]
    fn drops_entries_without_a_row() {
        let (_dir, db, game_id) = setup();
        let mut registry = SessionRegistry::new();
        index(&mut registry, 77, game_id, t0());

        let report = sweep(&mut registry, &db, t0(), chrono::Duration::hours(12));
        assert_eq!(report.removed, vec![77]);
        assert!(registry.is_empty());
    }

    #[test]
    fn long_sessions_are_reported_not_closed() {
        let (_dir, db, game_id) = setup();
        let session_id = db.start_session(game_id, t0()).expect("start");
        let mut registry = SessionRegistry::new();
        index(&mut registry, session_id, game_id, t0());

        let later = t0() + chrono::Duration::hours(13);
        let report = sweep(&mut registry, &db, later, chrono::Duration::hours(12));
        assert_eq!(report.long_running, vec![session_id]);
        assert!(report.removed.is_empty());
        assert_eq!(registry.len(), 1);
        assert!(db
            .get_session(session_id)
            .expect("get")
            .expect("row")
            .end_time
            .is_none());
    }

    #[test]
    fn healthy_sessions_are_untouched() {
        let (_dir, db, game_id) = setup();
        let session_id = db.start_session(game_id, t0()).expect("start");
        let mut registry = SessionRegistry::new();
        index(&mut registry, session_id, game_id, t0());

        let report = sweep(
            &mut registry,
            &db,
            t0() + chrono::Duration::hours(1),
            chrono::Duration::hours(12),
        );
        assert_eq!(report.checked, 1);
        assert!(report.removed.is_empty());
        assert!(report.long_running.is_empty());
    }
}
