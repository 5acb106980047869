//! SQLite persistence for playtime-daemon.
//!
//! The daemon is the single writer. Two tables matter: `games`, which carries
//! the per-game aggregates, and `sessions`, one row per play interval. Schema
//! changes are additive: columns are added with `ALTER TABLE` and a
//! "duplicate column" failure means the column is already there.

use chrono::{DateTime, SecondsFormat, Utc};
use playtime_daemon_protocol::PlayTimeStats;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use std::path::PathBuf;

pub const DEFAULT_PLATFORM: &str = "manual";

pub struct Db {
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GameRow {
    pub id: i64,
    pub title: String,
    pub platform: String,
    pub install_directory: Option<String>,
    pub launch_command: Option<String>,
    pub total_play_time: i64,
    pub launch_count: i64,
    pub last_played: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGame<'a> {
    pub title: &'a str,
    pub platform: Option<&'a str>,
    pub install_directory: Option<&'a str>,
    pub launch_command: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRow {
    pub id: i64,
    pub game_id: i64,
    pub start_time: String,
    pub end_time: Option<String>,
    pub duration: Option<i64>,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, String> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    /// Inserts or refreshes a game keyed by `(platform, title)` and returns its id.
    /// Aggregates are never touched here.
    pub fn upsert_game(&self, game: &NewGame<'_>) -> Result<i64, String> {
        let platform = game.platform.unwrap_or(DEFAULT_PLATFORM);
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO games (title, platform, install_directory, launch_command) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(platform, title) DO UPDATE SET \
                    install_directory = COALESCE(excluded.install_directory, games.install_directory), \
                    launch_command = COALESCE(excluded.launch_command, games.launch_command)",
                params![
                    game.title,
                    platform,
                    game.install_directory,
                    game.launch_command
                ],
            )
            .map_err(|err| format!("Failed to upsert game: {}", err))?;

            conn.query_row(
                "SELECT id FROM games WHERE platform = ?1 AND title = ?2",
                params![platform, game.title],
                |row| row.get::<_, i64>(0),
            )
            .map_err(|err| format!("Failed to read game id: {}", err))
        })
    }

    pub fn get_game(&self, game_id: i64) -> Result<Option<GameRow>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT id, title, platform, install_directory, launch_command, \
                        COALESCE(total_play_time, 0), COALESCE(launch_count, 0), last_played \
                 FROM games WHERE id = ?1",
                params![game_id],
                |row| {
                    Ok(GameRow {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        platform: row.get(2)?,
                        install_directory: row.get(3)?,
                        launch_command: row.get(4)?,
                        total_play_time: row.get(5)?,
                        launch_count: row.get(6)?,
                        last_played: row.get(7)?,
                    })
                },
            )
            .optional()
            .map_err(|err| format!("Failed to query game: {}", err))
        })
    }

    /// Opens a session row and bumps `launch_count` / `last_played` in one
    /// transaction. Returns the new session id.
    pub fn start_session(&self, game_id: i64, now: DateTime<Utc>) -> Result<i64, String> {
        let started_at = format_timestamp(now);
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| format!("Failed to begin transaction: {}", err))?;
            tx.execute(
                "INSERT INTO sessions (game_id, start_time) VALUES (?1, ?2)",
                params![game_id, started_at],
            )
            .map_err(|err| format!("Failed to insert session: {}", err))?;
            let session_id = tx.last_insert_rowid();
            tx.execute(
                "UPDATE games SET launch_count = COALESCE(launch_count, 0) + 1, last_played = ?1 \
                 WHERE id = ?2",
                params![started_at, game_id],
            )
            .map_err(|err| format!("Failed to update launch aggregates: {}", err))?;
            tx.commit()
                .map_err(|err| format!("Failed to commit session start: {}", err))?;
            Ok(session_id)
        })
    }

    /// Closes an open session and adds its duration to the game's
    /// `total_play_time`, atomically.
    ///
    /// Returns `None` when the session does not exist or is already closed, so
    /// a second close never double-counts. `duration` is clamped at zero and
    /// `end_time` is never earlier than `start_time`.
    pub fn close_session(
        &self,
        session_id: i64,
        end_time: DateTime<Utc>,
        duration: i64,
    ) -> Result<Option<SessionRow>, String> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| format!("Failed to begin transaction: {}", err))?;

            let current = tx
                .query_row(
                    "SELECT id, game_id, start_time, end_time, duration FROM sessions WHERE id = ?1",
                    params![session_id],
                    session_from_row,
                )
                .optional()
                .map_err(|err| format!("Failed to query session: {}", err))?;

            let current = match current {
                Some(row) if row.end_time.is_none() => row,
                _ => return Ok(None),
            };

            let end_time = parse_rfc3339(&current.start_time)
                .map(|start| end_time.max(start))
                .unwrap_or(end_time);
            let ended_at = format_timestamp(end_time);
            let duration = duration.max(0);

            let updated = tx
                .execute(
                    "UPDATE sessions SET end_time = ?1, duration = ?2 \
                     WHERE id = ?3 AND end_time IS NULL",
                    params![ended_at, duration, session_id],
                )
                .map_err(|err| format!("Failed to close session: {}", err))?;
            if updated == 0 {
                return Ok(None);
            }

            tx.execute(
                "UPDATE games SET total_play_time = COALESCE(total_play_time, 0) + ?1 WHERE id = ?2",
                params![duration, current.game_id],
            )
            .map_err(|err| format!("Failed to update total play time: {}", err))?;

            tx.commit()
                .map_err(|err| format!("Failed to commit session close: {}", err))?;

            Ok(Some(SessionRow {
                end_time: Some(ended_at),
                duration: Some(duration),
                ..current
            }))
        })
    }

    pub fn get_session(&self, session_id: i64) -> Result<Option<SessionRow>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT id, game_id, start_time, end_time, duration FROM sessions WHERE id = ?1",
                params![session_id],
                session_from_row,
            )
            .optional()
            .map_err(|err| format!("Failed to query session: {}", err))
        })
    }

    /// Sessions left open, e.g. by a daemon that died before shutting down.
    pub fn count_open_sessions(&self) -> Result<i64, String> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM sessions WHERE end_time IS NULL",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map_err(|err| format!("Failed to count open sessions: {}", err))
        })
    }

    pub fn play_time_stats(&self, game_id: i64) -> Result<Option<PlayTimeStats>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT COALESCE(total_play_time, 0), COALESCE(launch_count, 0), last_played, \
                        (SELECT COUNT(*) FROM sessions WHERE game_id = ?1) \
                 FROM games WHERE id = ?1",
                params![game_id],
                |row| {
                    let total_play_time: i64 = row.get(0)?;
                    let session_count: i64 = row.get(3)?;
                    Ok(PlayTimeStats {
                        total_play_time,
                        launch_count: row.get(1)?,
                        last_played: row.get(2)?,
                        session_count,
                        average_session_time: total_play_time as f64
                            / session_count.max(1) as f64,
                    })
                },
            )
            .optional()
            .map_err(|err| format!("Failed to query play time: {}", err))
        })
    }

    fn init_schema(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS games (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    title TEXT NOT NULL,
                    platform TEXT NOT NULL DEFAULT 'manual',
                    install_directory TEXT,
                    launch_command TEXT,
                    launch_count INTEGER NOT NULL DEFAULT 0,
                    last_played TEXT,
                    total_play_time INTEGER NOT NULL DEFAULT 0,
                    UNIQUE(platform, title)
                 );
                 CREATE TABLE IF NOT EXISTS sessions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    game_id INTEGER NOT NULL REFERENCES games(id),
                    start_time TEXT NOT NULL,
                    end_time TEXT,
                    duration INTEGER
                 );
                 COMMIT;",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))?;

            for (table, column, definition) in EVOLVED_COLUMNS {
                add_column_if_missing(conn, table, column, definition)?;
            }

            conn.execute_batch(
                "CREATE INDEX IF NOT EXISTS idx_sessions_game_id ON sessions(game_id);
                 CREATE INDEX IF NOT EXISTS idx_games_last_played ON games(last_played);",
            )
            .map_err(|err| format!("Failed to create indexes: {}", err))?;
            Ok(())
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, String> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| format!("Failed to create daemon data dir: {}", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| format!("Failed to open sqlite db: {}", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to enable WAL: {}", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| format!("Failed to set synchronous: {}", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| format!("Failed to set busy_timeout: {}", err))?;

        Ok(conn)
    }
}

/// Columns that older databases may lack.
const EVOLVED_COLUMNS: &[(&str, &str, &str)] = &[
    ("games", "install_directory", "TEXT"),
    ("games", "launch_command", "TEXT"),
    ("games", "launch_count", "INTEGER NOT NULL DEFAULT 0"),
    ("games", "last_played", "TEXT"),
    ("games", "total_play_time", "INTEGER NOT NULL DEFAULT 0"),
    ("sessions", "end_time", "TEXT"),
    ("sessions", "duration", "INTEGER"),
];

fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<(), String> {
    let statement = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, definition);
    match conn.execute(&statement, []) {
        Ok(_) => {
            tracing::info!(table, column, "Added missing column");
            Ok(())
        }
        Err(err) if err.to_string().contains("duplicate column name") => Ok(()),
        Err(err) => Err(format!("Failed to add {}.{} column: {}", table, column, err)),
    }
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        game_id: row.get(1)?,
        start_time: row.get(2)?,
        end_time: row.get(3)?,
        duration: row.get(4)?,
    })
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn test_db() -> (tempfile::TempDir, Db) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("playtime.db")).expect("db init");
        (temp_dir, db)
    }

    fn at(value: &str) -> DateTime<Utc> {
        parse_rfc3339(value).expect("timestamp")
    }

    fn register(db: &Db, title: &str) -> i64 {
        db.upsert_game(&NewGame {
            title,
            platform: Some("steam"),
            install_directory: Some("/games/x"),
            launch_command: None,
        })
        .expect("upsert game")
    }

    #[test]
    fn upsert_game_is_keyed_by_platform_and_title() {
        let (_dir, db) = test_db();
        let first = register(&db, "Generic Game");
        let again = db
            .upsert_game(&NewGame {
                title: "Generic Game",
                platform: Some("steam"),
                install_directory: None,
                launch_command: Some("steam://rungameid/1"),
            })
            .expect("upsert again");
        assert_eq!(first, again);

        let game = db.get_game(first).expect("get").expect("row");
        assert_eq!(game.install_directory.as_deref(), Some("/games/x"));
        assert_eq!(game.launch_command.as_deref(), Some("steam://rungameid/1"));

        let other = db
            .upsert_game(&NewGame {
                title: "Generic Game",
                platform: None,
                install_directory: None,
                launch_command: None,
            })
            .expect("manual platform");
        assert_ne!(first, other);
    }

    #[test]
    fn start_session_updates_launch_aggregates() {
        let (_dir, db) = test_db();
        let game_id = register(&db, "Game");
        let now = at("2026-03-01T10:00:00Z");

        let session_id = db.start_session(game_id, now).expect("start");
        let session = db.get_session(session_id).expect("get").expect("row");
        assert_eq!(session.start_time, "2026-03-01T10:00:00Z");
        assert!(session.end_time.is_none());

        let game = db.get_game(game_id).expect("get").expect("row");
        assert_eq!(game.launch_count, 1);
        assert_eq!(game.last_played.as_deref(), Some("2026-03-01T10:00:00Z"));
    }

    #[test]
    fn close_session_adds_duration_once() {
        let (_dir, db) = test_db();
        let game_id = register(&db, "Game");
        let start = at("2026-03-01T10:00:00Z");
        let session_id = db.start_session(game_id, start).expect("start");

        let closed = db
            .close_session(session_id, start + Duration::seconds(90), 90)
            .expect("close")
            .expect("closed row");
        assert_eq!(closed.duration, Some(90));
        assert_eq!(closed.end_time.as_deref(), Some("2026-03-01T10:01:30Z"));

        let second = db
            .close_session(session_id, start + Duration::seconds(500), 500)
            .expect("close again");
        assert!(second.is_none());

        let game = db.get_game(game_id).expect("get").expect("row");
        assert_eq!(game.total_play_time, 90);
    }

    #[test]
    fn close_session_clamps_negative_duration_and_early_end() {
        let (_dir, db) = test_db();
        let game_id = register(&db, "Game");
        let start = at("2026-03-01T10:00:00Z");
        let session_id = db.start_session(game_id, start).expect("start");

        let closed = db
            .close_session(session_id, start - Duration::seconds(30), -30)
            .expect("close")
            .expect("closed row");
        assert_eq!(closed.duration, Some(0));
        assert_eq!(closed.end_time.as_deref(), Some("2026-03-01T10:00:00Z"));

        let game = db.get_game(game_id).expect("get").expect("row");
        assert_eq!(game.total_play_time, 0);
    }

    #[test]
    fn close_unknown_session_is_none() {
        let (_dir, db) = test_db();
        let result = db
            .close_session(999, at("2026-03-01T10:00:00Z"), 5)
            .expect("close");
        assert!(result.is_none());
    }

    #[test]
    fn play_time_stats_average_over_sessions() {
        let (_dir, db) = test_db();
        let game_id = register(&db, "Game");
        let start = at("2026-03-01T10:00:00Z");

        let first = db.start_session(game_id, start).expect("start");
        db.close_session(first, start + Duration::seconds(100), 100)
            .expect("close");
        let second = db
            .start_session(game_id, start + Duration::hours(1))
            .expect("start");
        db.close_session(second, start + Duration::hours(2), 300)
            .expect("close");

        let stats = db.play_time_stats(game_id).expect("stats").expect("row");
        assert_eq!(stats.total_play_time, 400);
        assert_eq!(stats.launch_count, 2);
        assert_eq!(stats.session_count, 2);
        assert!((stats.average_session_time - 200.0).abs() < f64::EPSILON);
        assert_eq!(stats.last_played.as_deref(), Some("2026-03-01T11:00:00Z"));

        assert!(db.play_time_stats(4242).expect("stats").is_none());
    }

    #[test]
    fn schema_init_is_idempotent() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("playtime.db");
        let db = Db::new(path.clone()).expect("first init");
        let game_id = register(&db, "Game");
        drop(db);

        let db = Db::new(path).expect("second init");
        assert!(db.get_game(game_id).expect("get").is_some());
        assert_eq!(db.count_open_sessions().expect("count"), 0);
    }

    #[test]
    fn evolves_legacy_schema_additively() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("legacy.db");
        {
            let conn = Connection::open(&path).expect("open legacy");
            conn.execute_batch(
                "CREATE TABLE games (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    title TEXT NOT NULL,
                    platform TEXT NOT NULL DEFAULT 'manual',
                    UNIQUE(platform, title)
                 );
                 CREATE TABLE sessions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    game_id INTEGER NOT NULL,
                    start_time TEXT NOT NULL
                 );
                 INSERT INTO games (title, platform) VALUES ('Old Game', 'steam');",
            )
            .expect("legacy schema");
        }

        let db = Db::new(path).expect("evolve");
        let game = db.get_game(1).expect("get").expect("row");
        assert_eq!(game.title, "Old Game");
        assert_eq!(game.total_play_time, 0);
        assert_eq!(game.launch_count, 0);

        let start = at("2026-03-01T10:00:00Z");
        let session_id = db.start_session(1, start).expect("start");
        db.close_session(session_id, start + Duration::seconds(60), 60)
            .expect("close")
            .expect("closed");
        assert_eq!(db.get_game(1).expect("get").expect("row").total_play_time, 60);
    }
}
