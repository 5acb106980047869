//! Install-directory enumeration.

use serde::Serialize;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::tables::HeuristicTables;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutableCandidate {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Collects executables below `install_dir`, descending into at most
/// `max_scan_depth` levels of subdirectories. Unreadable entries are skipped;
/// a missing directory yields nothing.
///
/// Entries are visited in file-name order so results are stable.
pub fn enumerate_executables(install_dir: &Path, tables: &HeuristicTables) -> Vec<ExecutableCandidate> {
    if !install_dir.is_dir() {
        return Vec::new();
    }

    WalkDir::new(install_dir)
        // walkdir counts the file itself as a level.
        .max_depth(tables.max_scan_depth.saturating_add(1))
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                tracing::debug!(error = %err, "Skipping unreadable install entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| is_executable(entry.path(), tables))
        .filter_map(|entry| {
            let size = entry.metadata().ok()?.len();
            let name = entry.file_name().to_string_lossy().to_string();
            Some(ExecutableCandidate {
                name,
                path: entry.into_path(),
                size,
            })
        })
        .collect()
}

fn is_executable(path: &Path, tables: &HeuristicTables) -> bool {
    if tables.has_executable_extension(path) {
        return true;
    }
    has_exec_bit_without_extension(path)
}

#[cfg(unix)]
fn has_exec_bit_without_extension(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    if path.extension().is_some() {
        return false;
    }
    std::fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn has_exec_bit_without_extension(_path: &Path) -> bool {
    false
}
