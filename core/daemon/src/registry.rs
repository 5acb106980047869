//! In-memory index of the sessions this daemon considers active.
//!
//! Keyed by game id: at most one open session per game.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSession {
    pub session_id: i64,
    pub game_id: i64,
    pub title: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    by_game: HashMap<i64, ActiveSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes `session`, returning whatever was indexed for the same game.
    pub fn insert(&mut self, session: ActiveSession) -> Option<ActiveSession> {
        self.by_game.insert(session.game_id, session)
    }

    pub fn lookup(&self, game_id: i64) -> Option<&ActiveSession> {
        self.by_game.get(&game_id)
    }

    pub fn remove(&mut self, game_id: i64) -> Option<ActiveSession> {
        self.by_game.remove(&game_id)
    }

    /// Visits entries in ascending game id order.
    pub fn for_each(&self, mut visit: impl FnMut(&ActiveSession)) {
        let mut game_ids: Vec<_> = self.by_game.keys().copied().collect();
        game_ids.sort_unstable();
        for game_id in game_ids {
            if let Some(session) = self.by_game.get(&game_id) {
                visit(session);
            }
        }
    }

    /// Game owning `session_id`, if that session is still indexed.
    pub fn game_for_session(&self, session_id: i64) -> Option<i64> {
        self.by_game
            .values()
            .find(|session| session.session_id == session_id)
            .map(|session| session.game_id)
    }

    pub fn len(&self) -> usize {
        self.by_game.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_game.is_empty()
    }
}
