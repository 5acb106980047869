//! Versioned lookup tables that drive executable resolution.
//!
//! The tables are data, not code: a copy is compiled into the binary and a
//! user-supplied TOML file with the same shape can replace it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CoreError, Result};

/// Highest `version` this build knows how to interpret.
pub const SUPPORTED_TABLES_VERSION: u32 = 1;

const BUILTIN_TABLES: &str = include_str!("../data/heuristics.toml");
const BUILTIN_ORIGIN: &str = "<builtin heuristics.toml>";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct KnownGame {
    pub title: String,
    pub executables: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct HeuristicTables {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_long_delay_secs")]
    pub long_delay_secs: u64,
    #[serde(default = "default_short_delay_secs")]
    pub short_delay_secs: u64,
    /// Subdirectory levels scanned below the install root.
    #[serde(default = "default_max_scan_depth")]
    pub max_scan_depth: usize,
    #[serde(default = "default_executable_extensions")]
    pub executable_extensions: Vec<String>,
    #[serde(default)]
    pub anti_cheat_titles: Vec<String>,
    #[serde(default)]
    pub preloader_titles: Vec<String>,
    #[serde(default)]
    pub deny_list: Vec<String>,
    #[serde(default)]
    pub known_games: Vec<KnownGame>,
}

fn default_version() -> u32 {
    SUPPORTED_TABLES_VERSION
}

fn default_long_delay_secs() -> u64 {
    60
}

fn default_short_delay_secs() -> u64 {
    3
}

fn default_max_scan_depth() -> usize {
    3
}

fn default_executable_extensions() -> Vec<String> {
    vec!["exe".to_string()]
}

impl Default for HeuristicTables {
    fn default() -> Self {
        Self {
            version: default_version(),
            long_delay_secs: default_long_delay_secs(),
            short_delay_secs: default_short_delay_secs(),
            max_scan_depth: default_max_scan_depth(),
            executable_extensions: default_executable_extensions(),
            anti_cheat_titles: Vec::new(),
            preloader_titles: Vec::new(),
            deny_list: Vec::new(),
            known_games: Vec::new(),
        }
    }
}

/// How a title behaves at launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TitleClass {
    /// Anti-cheat bootstrapper runs first and spawns the game later.
    AntiCheat,
    /// Engine preloader/splash process precedes the game.
    Preloader,
    Standard,
}

impl HeuristicTables {
    /// The tables compiled into this build.
    pub fn builtin() -> Result<Self> {
        Self::from_toml_str(BUILTIN_TABLES, Path::new(BUILTIN_ORIGIN))
    }

    pub fn from_toml_str(content: &str, origin: &Path) -> Result<Self> {
        let tables: HeuristicTables =
            toml::from_str(content).map_err(|err| CoreError::TablesMalformed {
                path: origin.to_path_buf(),
                details: err.to_string(),
            })?;
        if tables.version > SUPPORTED_TABLES_VERSION {
            return Err(CoreError::UnsupportedTablesVersion {
                found: tables.version,
                supported: SUPPORTED_TABLES_VERSION,
            });
        }
        Ok(tables)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs_err::read_to_string(path).map_err(|source| CoreError::Io {
            context: format!("reading heuristic tables {}", path.display()),
            source,
        })?;
        Self::from_toml_str(&content, path)
    }

    /// Loads `path` when it exists, otherwise the builtin tables.
    pub fn load_or_builtin(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) if path.exists() => Self::load(path),
            _ => Self::builtin(),
        }
    }

    pub fn classify(&self, title: &str) -> TitleClass {
        if self
            .anti_cheat_titles
            .iter()
            .any(|pattern| title_matches(title, pattern))
        {
            TitleClass::AntiCheat
        } else if self
            .preloader_titles
            .iter()
            .any(|pattern| title_matches(title, pattern))
        {
            TitleClass::Preloader
        } else {
            TitleClass::Standard
        }
    }

    /// Delay before tracking targets are resolved for `title`.
    pub fn tracking_delay(&self, title: &str) -> Duration {
        match self.classify(title) {
            TitleClass::AntiCheat | TitleClass::Preloader => {
                Duration::from_secs(self.long_delay_secs)
            }
            TitleClass::Standard => Duration::from_secs(self.short_delay_secs),
        }
    }

    pub fn known_game(&self, title: &str) -> Option<&KnownGame> {
        self.known_games
            .iter()
            .find(|game| title_matches(title, &game.title))
    }

    /// True when `file_name` looks like an uninstaller, updater, crash handler
    /// or anti-cheat binary.
    pub fn is_denied(&self, file_name: &str) -> bool {
        let lower = file_name.to_lowercase();
        self.deny_list
            .iter()
            .filter(|pattern| !pattern.trim().is_empty())
            .any(|pattern| lower.contains(&pattern.to_lowercase()))
    }

    pub fn has_executable_extension(&self, path: &Path) -> bool {
        let Some(extension) = path.extension().and_then(|ext| ext.to_str()) else {
            return false;
        };
        self.executable_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(extension))
    }
}

/// Default location of a user override file relative to a data directory.
pub fn tables_override_path(data_dir: &Path) -> PathBuf {
    data_dir.join("heuristics.toml")
}

/// Word-sequence match: every word of `pattern` appears contiguously in
/// `title`, ignoring case and punctuation. "Rust" matches "Rust (Staging)"
/// but not "Rusty Lake".
pub fn title_matches(title: &str, pattern: &str) -> bool {
    let pattern_words = title_words(pattern);
    if pattern_words.is_empty() {
        return false;
    }
    let title_words = title_words(title);
    title_words
        .windows(pattern_words.len())
        .any(|window| window == pattern_words.as_slice())
}

fn title_words(value: &str) -> Vec<String> {
    value
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| word.to_lowercase())
        .collect()
}
