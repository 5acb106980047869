//! Daemon configuration and on-disk locations.
//!
//! Everything lives under `~/.playtime`. A missing config file means defaults.

use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SOCKET_ENV: &str = "PLAYTIME_SOCKET";
pub const TRACKER_BIN_ENV: &str = "PLAYTIME_TRACKER_BIN";
pub const DEBUG_LOG_ENV: &str = "PLAYTIME_DEBUG_LOG";

const SOCKET_NAME: &str = "daemon.sock";
const TRACKER_BIN_NAME: &str = "playtime-tracker";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DaemonConfig {
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub heuristics: HeuristicsConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackerConfig {
    /// Set to false to run with wall-clock tracking only.
    pub enabled: bool,
    pub helper_path: Option<PathBuf>,
    pub helper_args: Vec<String>,
    pub shutdown_grace_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            helper_path: None,
            helper_args: Vec::new(),
            shutdown_grace_ms: 1000,
        }
    }
}

impl TrackerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MonitorConfig {
    pub orphan_sweep_interval_secs: u64,
    /// Sessions open longer than this are reported, never closed.
    pub long_session_warn_hours: i64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            orphan_sweep_interval_secs: 3600,
            long_session_warn_hours: 12,
        }
    }
}

impl MonitorConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.orphan_sweep_interval_secs.max(1))
    }

    pub fn long_session_threshold(&self) -> chrono::Duration {
        chrono::Duration::hours(self.long_session_warn_hours.max(0))
    }
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct HeuristicsConfig {
    pub tables_path: Option<PathBuf>,
}

pub fn load_config(path: Option<PathBuf>) -> Result<DaemonConfig, String> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(DaemonConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| {
        format!(
            "Failed to read daemon config {}: {}",
            config_path.display(),
            err
        )
    })?;
    toml::from_str::<DaemonConfig>(&content).map_err(|err| {
        format!(
            "Failed to parse daemon config {}: {}",
            config_path.display(),
            err
        )
    })
}

pub fn playtime_home() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".playtime"))
}

pub fn daemon_data_dir() -> Result<PathBuf, String> {
    Ok(playtime_home()?.join("daemon"))
}

pub fn default_config_path() -> Result<PathBuf, String> {
    Ok(daemon_data_dir()?.join("config.toml"))
}

pub fn daemon_db_path() -> Result<PathBuf, String> {
    Ok(daemon_data_dir()?.join("playtime.db"))
}

pub fn daemon_socket_path() -> Result<PathBuf, String> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(playtime_home()?.join(SOCKET_NAME))
}

/// Heuristic table override: the configured path, else `heuristics.toml` in
/// the daemon data dir.
pub fn heuristics_path(config: &HeuristicsConfig) -> Option<PathBuf> {
    if let Some(path) = &config.tables_path {
        return Some(path.clone());
    }
    daemon_data_dir()
        .ok()
        .map(|dir| playtime_core::tables::tables_override_path(&dir))
}

/// Helper binary: env override, then config, then a `playtime-tracker`
/// next to the daemon executable.
pub fn resolve_helper_path(config: &TrackerConfig) -> Option<PathBuf> {
    if let Ok(path) = env::var(TRACKER_BIN_ENV) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    if let Some(path) = &config.helper_path {
        return Some(path.clone());
    }
    let current = env::current_exe().ok()?;
    sibling_binary(&current, TRACKER_BIN_NAME)
}

fn sibling_binary(current_exe: &Path, name: &str) -> Option<PathBuf> {
    let dir = current_exe.parent()?;
    let candidate = dir.join(format!("{}{}", name, env::consts::EXE_SUFFIX));
    Some(candidate)
}

pub fn debug_logging_requested() -> bool {
    env::var(DEBUG_LOG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_uses_defaults() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let config = load_config(Some(temp_dir.path().join("missing.toml"))).expect("load");
        assert!(config.tracker.enabled);
        assert_eq!(config.tracker.shutdown_grace(), Duration::from_secs(1));
        assert_eq!(config.monitor.sweep_interval(), Duration::from_secs(3600));
        assert_eq!(
            config.monitor.long_session_threshold(),
            chrono::Duration::hours(12)
        );
        assert!(config.heuristics.tables_path.is_none());
    }

    #[test]
    fn parses_partial_sections() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(
            &path,
            r#"
[tracker]
helper_path = "/opt/playtime/playtime-tracker"
helper_args = ["--verbose"]

[monitor]
orphan_sweep_interval_secs = 60
"#,
        )
        .expect("write config");

        let config = load_config(Some(path)).expect("load");
        assert_eq!(
            config.tracker.helper_path,
            Some(PathBuf::from("/opt/playtime/playtime-tracker"))
        );
        assert_eq!(config.tracker.helper_args, vec!["--verbose".to_string()]);
        assert_eq!(config.tracker.shutdown_grace_ms, 1000);
        assert_eq!(config.monitor.orphan_sweep_interval_secs, 60);
        assert_eq!(config.monitor.long_session_warn_hours, 12);
    }

    #[test]
    fn rejects_malformed_config() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(&path, "[monitor]\norphan_sweep_interval_secs = \"soon\"\n")
            .expect("write config");
        let err = load_config(Some(path)).expect_err("malformed");
        assert!(err.contains("Failed to parse daemon config"));
    }

    #[test]
    fn sibling_binary_sits_next_to_current_exe() {
        let path = sibling_binary(Path::new("/opt/playtime/bin/playtime-daemon"), "helper")
            .expect("sibling");
        assert_eq!(
            path,
            PathBuf::from(format!("/opt/playtime/bin/helper{}", env::consts::EXE_SUFFIX))
        );
    }
}
