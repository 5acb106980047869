//! Process table snapshots and matching.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use sysinfo::{ProcessRefreshKind, ProcessStatus, System, UpdateKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub parent: Option<u32>,
    pub name: String,
    pub exe: Option<PathBuf>,
}

/// Where process snapshots come from. Tests feed scripted tables.
pub trait ProcessSource {
    fn snapshot(&mut self) -> Vec<ProcessInfo>;
}

pub struct SysinfoSource {
    system: System,
}

impl SysinfoSource {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl ProcessSource for SysinfoSource {
    fn snapshot(&mut self) -> Vec<ProcessInfo> {
        self.system
            .refresh_processes_specifics(ProcessRefreshKind::new().with_exe(UpdateKind::OnlyIfNotSet));
        self.system
            .processes()
            .iter()
            .filter(|(_, process)| !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
            .map(|(pid, process)| ProcessInfo {
                pid: pid.as_u32(),
                parent: process.parent().map(|parent| parent.as_u32()),
                name: process.name().to_string(),
                exe: process.exe().map(Path::to_path_buf),
            })
            .collect()
    }
}

/// What a session is waiting for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatchRule {
    pub exe_path: Option<PathBuf>,
    pub process_names: Vec<String>,
}

impl MatchRule {
    pub fn is_empty(&self) -> bool {
        self.exe_path.is_none() && self.process_names.is_empty()
    }

    pub fn matches(&self, process: &ProcessInfo) -> bool {
        if let Some(expected) = &self.exe_path {
            if process.exe.as_deref() == Some(expected.as_path()) {
                return true;
            }
            if let Some(file_name) = expected.file_name().and_then(|name| name.to_str()) {
                if names_match(&process.name, file_name) {
                    return true;
                }
            }
        }
        self.process_names
            .iter()
            .any(|name| names_match(&process.name, name))
    }
}

/// Case-insensitive, ignoring a trailing `.exe` on either side. Linux
/// truncates process names to 15 bytes, so a 15-byte name also matches a
/// longer expected name with that prefix.
pub fn names_match(actual: &str, expected: &str) -> bool {
    let actual = strip_exe(&actual.to_lowercase());
    let expected = strip_exe(&expected.to_lowercase());
    if actual.is_empty() || expected.is_empty() {
        return false;
    }
    actual == expected || (actual.len() == 15 && expected.starts_with(&actual))
}

fn strip_exe(name: &str) -> String {
    name.strip_suffix(".exe").unwrap_or(name).to_string()
}

pub fn find_matches(snapshot: &[ProcessInfo], rule: &MatchRule) -> HashSet<u32> {
    snapshot
        .iter()
        .filter(|process| rule.matches(process))
        .map(|process| process.pid)
        .collect()
}

/// `roots` that are still alive plus, when asked, all of their descendants.
pub fn live_set(snapshot: &[ProcessInfo], roots: &HashSet<u32>, include_children: bool) -> HashSet<u32> {
    let alive: HashSet<u32> = snapshot.iter().map(|process| process.pid).collect();
    let mut live: HashSet<u32> = roots.intersection(&alive).copied().collect();
    if !include_children {
        return live;
    }

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for process in snapshot {
        if let Some(parent) = process.parent {
            children.entry(parent).or_default().push(process.pid);
        }
    }

    // Walk from every root, dead or not: a launcher may exit while its
    // children keep running, but they are only reachable if the kernel has
    // not reparented them yet.
    let mut stack: Vec<u32> = roots.iter().copied().collect();
    let mut seen: HashSet<u32> = HashSet::new();
    while let Some(pid) = stack.pop() {
        if !seen.insert(pid) {
            continue;
        }
        if let Some(kids) = children.get(&pid) {
            for kid in kids {
                live.insert(*kid);
                stack.push(*kid);
            }
        }
    }
    live
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(pid: u32, parent: Option<u32>, name: &str) -> ProcessInfo {
        ProcessInfo {
            pid,
            parent,
            name: name.to_string(),
            exe: None,
        }
    }

    #[test]
    fn names_ignore_case_and_exe_suffix() {
        assert!(names_match("r5apex.exe", "R5Apex.exe"));
        assert!(names_match("eldenring", "eldenring.exe"));
        assert!(!names_match("eldenring2", "eldenring.exe"));
        assert!(names_match("VALORANT-Win64-", "VALORANT-Win64-Shipping.exe"));
        assert!(!names_match("", "game"));
    }

    #[test]
    fn exe_rule_matches_path_or_file_name() {
        let rule = MatchRule {
            exe_path: Some(PathBuf::from("/games/x/Game.exe")),
            process_names: Vec::new(),
        };
        let mut by_path = process(1, None, "wine64-preload");
        by_path.exe = Some(PathBuf::from("/games/x/Game.exe"));
        assert!(rule.matches(&by_path));
        assert!(rule.matches(&process(2, None, "Game.exe")));
        assert!(!rule.matches(&process(3, None, "Other.exe")));
    }

    #[test]
    fn live_set_follows_descendants() {
        let snapshot = vec![
            process(10, Some(1), "launcher"),
            process(11, Some(10), "game"),
            process(12, Some(11), "renderer"),
            process(20, Some(1), "unrelated"),
        ];
        let roots: HashSet<u32> = [10].into_iter().collect();

        let live = live_set(&snapshot, &roots, true);
        let expected: HashSet<u32> = [10, 11, 12].into_iter().collect();
        assert_eq!(live, expected);

        let only_roots = live_set(&snapshot, &roots, false);
        assert_eq!(only_roots, roots);
    }

    #[test]
    fn live_set_keeps_children_of_exited_root() {
        let snapshot = vec![process(11, Some(10), "game")];
        let roots: HashSet<u32> = [10].into_iter().collect();
        let live = live_set(&snapshot, &roots, true);
        assert_eq!(live, [11].into_iter().collect());
    }

    #[test]
    fn sysinfo_sees_current_process() {
        let mut source = SysinfoSource::new();
        let me = std::process::id();
        assert!(source.snapshot().iter().any(|process| process.pid == me));
    }
}
