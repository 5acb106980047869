//! IPC protocol types and validation for playtime-daemon.
//!
//! This crate is shared by the daemon, its clients and the tracker helper to
//! prevent schema drift. Two channels are described here:
//!
//! - the daemon socket (`Request` / `Response`), used by the UI layer and
//!   `playtime-ctl`;
//! - the tracker helper's stdio stream (see [`tracker`]), used between the
//!   daemon and `playtime-tracker`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod tracker;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_TITLE_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    RegisterGame,
    LaunchGame,
    EndGameSession,
    GetActiveSessions,
    GetPlayTime,
    Shutdown,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// Library-scanner boundary: upserts a game by `(platform, title)`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RegisterGameParams {
    pub title: String,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub install_directory: Option<String>,
    #[serde(default)]
    pub launch_command: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LaunchGameParams {
    pub game_id: i64,
    #[serde(default)]
    pub launch_command: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GameIdParams {
    pub game_id: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LaunchGameResult {
    pub success: bool,
    pub session_id: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ActiveSessionInfo {
    pub game_id: i64,
    pub session_id: i64,
    pub title: String,
    pub start_time: String,
    /// Seconds elapsed since `start_time`.
    pub current_duration: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PlayTimeStats {
    pub total_play_time: i64,
    pub launch_count: i64,
    pub last_played: Option<String>,
    pub session_count: i64,
    pub average_session_time: f64,
}

impl RegisterGameParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.title.trim().is_empty() {
            return Err(ErrorInfo::new("missing_field", "title is required"));
        }
        if self.title.chars().count() > MAX_TITLE_CHARS {
            return Err(ErrorInfo::new(
                "invalid_title",
                format!("title must be {} characters or fewer", MAX_TITLE_CHARS),
            ));
        }
        if let Some(dir) = &self.install_directory {
            if dir.trim().is_empty() {
                return Err(ErrorInfo::new(
                    "invalid_install_directory",
                    "install_directory must not be blank",
                ));
            }
        }
        Ok(())
    }
}

pub fn parse_register_game(params: Value) -> Result<RegisterGameParams, ErrorInfo> {
    let parsed: RegisterGameParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("register_game payload is invalid: {}", err),
        )
    })?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn parse_launch_game(params: Value) -> Result<LaunchGameParams, ErrorInfo> {
    let parsed: LaunchGameParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("launch_game payload is invalid: {}", err),
        )
    })?;
    require_game_id(parsed.game_id)?;
    Ok(parsed)
}

pub fn parse_game_id(params: Value) -> Result<GameIdParams, ErrorInfo> {
    let parsed: GameIdParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new("invalid_params", format!("game_id payload is invalid: {}", err))
    })?;
    require_game_id(parsed.game_id)?;
    Ok(parsed)
}

fn require_game_id(game_id: i64) -> Result<(), ErrorInfo> {
    if game_id <= 0 {
        return Err(ErrorInfo::new(
            "invalid_game_id",
            "game_id must be a positive integer",
        ));
    }
    Ok(())
}
