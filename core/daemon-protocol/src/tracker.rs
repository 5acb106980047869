//! Wire protocol between the daemon and the tracker helper process.
//!
//! Every message is one JSON object on one line. The daemon writes
//! [`CommandEnvelope`]s to the helper's stdin; the helper writes
//! [`TrackerMessage`]s (responses or notifications) to its stdout.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::ErrorInfo;

/// `data.message` value of the response a helper emits once it accepts commands.
pub const READY_MESSAGE: &str = "ready";

pub const EVENT_PROCESS_ENDED: &str = "process_ended";
pub const EVENT_TRACKING_STARTED: &str = "tracking_started";
pub const EVENT_TRACKING_FAILED: &str = "tracking_failed";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "command", content = "params", rename_all = "snake_case")]
pub enum TrackerCommand {
    StartTracking(StartTrackingParams),
    StopTracking(StopTrackingParams),
    /// Whether one session's processes are still running, with live runtime.
    CheckSession(CheckSessionParams),
    /// Every watched session, active or pending.
    GetAllSessions {},
    /// Liveness of every active session, keyed by session id.
    CheckAll {},
    Ping {},
    Shutdown {},
}

impl TrackerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            TrackerCommand::StartTracking(_) => "start_tracking",
            TrackerCommand::StopTracking(_) => "stop_tracking",
            TrackerCommand::CheckSession(_) => "check_session",
            TrackerCommand::GetAllSessions {} => "get_all_sessions",
            TrackerCommand::CheckAll {} => "check_all",
            TrackerCommand::Ping {} => "ping",
            TrackerCommand::Shutdown {} => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartTrackingParams {
    pub session_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exe_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_names: Option<Vec<String>>,
    pub game_name: String,
    #[serde(default)]
    pub track_children: bool,
    /// Seconds the helper keeps waiting for the process to appear.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StopTrackingParams {
    pub session_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckSessionParams {
    pub session_id: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CommandEnvelope {
    #[serde(flatten)]
    pub command: TrackerCommand,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl CommandEnvelope {
    pub fn new(command: TrackerCommand, timestamp: i64) -> Self {
        Self { command, timestamp }
    }

    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parses one command line. A missing `params` object is treated as `{}`.
    pub fn parse(line: &str) -> Result<Self, ErrorInfo> {
        let value: Value = serde_json::from_str(line.trim()).map_err(|err| {
            ErrorInfo::new("invalid_json", format!("command was not valid JSON: {}", err))
        })?;
        let mut object = match value {
            Value::Object(object) => object,
            _ => {
                return Err(ErrorInfo::new(
                    "invalid_command",
                    "command must be a JSON object",
                ))
            }
        };

        let timestamp = object
            .remove("timestamp")
            .and_then(|value| value.as_f64())
            .map(|value| value as i64)
            .unwrap_or(0);
        object
            .entry("params")
            .or_insert_with(|| Value::Object(Map::new()));

        let name = object
            .get("command")
            .and_then(|value| value.as_str())
            .map(str::to_string)
            .ok_or_else(|| ErrorInfo::new("missing_field", "command is required"))?;

        let command: TrackerCommand =
            serde_json::from_value(Value::Object(object)).map_err(|err| {
                if is_known_command(&name) {
                    ErrorInfo::new(
                        "invalid_params",
                        format!("invalid params for {}: {}", name, err),
                    )
                } else {
                    ErrorInfo::new("unknown_command", format!("Unknown command: {}", name))
                }
            })?;

        Ok(Self { command, timestamp })
    }
}

fn is_known_command(name: &str) -> bool {
    matches!(
        name,
        "start_tracking"
            | "stop_tracking"
            | "check_session"
            | "get_all_sessions"
            | "check_all"
            | "ping"
            | "shutdown"
    )
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackerResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Seconds since the Unix epoch, as emitted by the helper.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

impl TrackerResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            timestamp: None,
        }
    }

    pub fn ready() -> Self {
        Self::ok(json!({ "message": READY_MESSAGE }))
    }

    pub fn is_ready(&self) -> bool {
        self.success
            && self
                .data
                .as_ref()
                .and_then(|data| data.get("message"))
                .and_then(|message| message.as_str())
                == Some(READY_MESSAGE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessEndedData {
    pub session_id: i64,
    /// Seconds the tracked process was observed running.
    pub runtime: f64,
}

impl ProcessEndedData {
    /// Runtime rounded to whole seconds, clamped at zero.
    pub fn runtime_secs(&self) -> i64 {
        if self.runtime.is_finite() {
            self.runtime.max(0.0).round() as i64
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackingStartedData {
    pub session_id: i64,
    #[serde(default)]
    pub game_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackingFailedData {
    pub session_id: i64,
    #[serde(default)]
    pub game_name: Option<String>,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    ProcessEnded(ProcessEndedData),
    TrackingStarted(TrackingStartedData),
    TrackingFailed(TrackingFailedData),
    /// Notifications this build does not understand; kept for logging.
    Unknown { event: String, data: Value },
}

impl TrackerEvent {
    pub fn name(&self) -> &str {
        match self {
            TrackerEvent::ProcessEnded(_) => EVENT_PROCESS_ENDED,
            TrackerEvent::TrackingStarted(_) => EVENT_TRACKING_STARTED,
            TrackerEvent::TrackingFailed(_) => EVENT_TRACKING_FAILED,
            TrackerEvent::Unknown { event, .. } => event.as_str(),
        }
    }

    fn data(&self) -> Result<Value, serde_json::Error> {
        match self {
            TrackerEvent::ProcessEnded(data) => serde_json::to_value(data),
            TrackerEvent::TrackingStarted(data) => serde_json::to_value(data),
            TrackerEvent::TrackingFailed(data) => serde_json::to_value(data),
            TrackerEvent::Unknown { data, .. } => Ok(data.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackerMessage {
    Response(TrackerResponse),
    Notification(TrackerEvent),
}

impl TrackerMessage {
    /// Serializes the message as one protocol line (newline included).
    /// `timestamp` is seconds since the Unix epoch.
    pub fn to_line(&self, timestamp: f64) -> Result<String, serde_json::Error> {
        let value = match self {
            TrackerMessage::Response(response) => {
                let mut response = response.clone();
                response.timestamp = Some(timestamp);
                serde_json::to_value(response)?
            }
            TrackerMessage::Notification(event) => json!({
                "type": "notification",
                "event": event.name(),
                "data": event.data()?,
                "timestamp": timestamp,
            }),
        };
        let mut line = serde_json::to_string(&value)?;
        line.push('\n');
        Ok(line)
    }
}

/// Parses one line emitted by the helper.
pub fn parse_message(line: &str) -> Result<TrackerMessage, ErrorInfo> {
    let value: Value = serde_json::from_str(line.trim()).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("tracker line was not valid JSON: {}", err),
        )
    })?;

    if !value.is_object() {
        return Err(ErrorInfo::new(
            "invalid_message",
            "tracker message must be a JSON object",
        ));
    }

    if value.get("type").and_then(|kind| kind.as_str()) == Some("notification") {
        return parse_notification(&value).map(TrackerMessage::Notification);
    }

    if value.get("success").is_some() {
        let response: TrackerResponse = serde_json::from_value(value).map_err(|err| {
            ErrorInfo::new(
                "invalid_response",
                format!("tracker response is malformed: {}", err),
            )
        })?;
        return Ok(TrackerMessage::Response(response));
    }

    Err(ErrorInfo::new(
        "invalid_message",
        "tracker message is neither a response nor a notification",
    ))
}

fn parse_notification(value: &Value) -> Result<TrackerEvent, ErrorInfo> {
    let event = value
        .get("event")
        .and_then(|event| event.as_str())
        .ok_or_else(|| ErrorInfo::new("missing_field", "notification event is required"))?;
    let data = value.get("data").cloned().unwrap_or(Value::Null);

    let invalid = |err: serde_json::Error| {
        ErrorInfo::new(
            "invalid_notification",
            format!("{} payload is malformed: {}", event, err),
        )
    };

    match event {
        EVENT_PROCESS_ENDED => serde_json::from_value(data)
            .map(TrackerEvent::ProcessEnded)
            .map_err(invalid),
        EVENT_TRACKING_STARTED => serde_json::from_value(data)
            .map(TrackerEvent::TrackingStarted)
            .map_err(invalid),
        EVENT_TRACKING_FAILED => serde_json::from_value(data)
            .map(TrackerEvent::TrackingFailed)
            .map_err(invalid),
        other => Ok(TrackerEvent::Unknown {
            event: other.to_string(),
            data,
        }),
    }
}
