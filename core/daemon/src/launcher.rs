//! Starting games.
//!
//! A launch command is either a path to an executable, which is spawned
//! directly from its own directory, or anything else (store URIs such as
//! `steam://rungameid/...`, shortcuts), which goes to the platform opener.

use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use tracing::info;

pub trait GameLauncher: Send {
    fn launch(&self, command: &str) -> Result<(), String>;
}

pub struct SystemLauncher;

impl GameLauncher for SystemLauncher {
    fn launch(&self, command: &str) -> Result<(), String> {
        let target = command.trim();
        if target.is_empty() {
            return Err("launch command is empty".to_string());
        }

        let path = Path::new(target);
        let mut process = if path.is_file() {
            let mut process = Command::new(path);
            if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
                process.current_dir(dir);
            }
            process
        } else {
            opener_command(target)
        };
        process
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let mut child = process
            .spawn()
            .map_err(|err| format!("Failed to launch '{}': {}", target, err))?;
        info!(pid = child.id(), command = target, "Game launched");

        // Reap the launcher process so it never lingers as a zombie.
        thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(())
    }
}

#[cfg(target_os = "macos")]
fn opener_command(target: &str) -> Command {
    let mut command = Command::new("open");
    command.arg(target);
    command
}

#[cfg(windows)]
fn opener_command(target: &str) -> Command {
    let mut command = Command::new("cmd");
    command.args(["/C", "start", ""]).arg(target);
    command
}

#[cfg(all(unix, not(target_os = "macos")))]
fn opener_command(target: &str) -> Command {
    let mut command = Command::new("xdg-open");
    command.arg(target);
    command
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_is_rejected() {
        let err = SystemLauncher.launch("   ").expect_err("empty");
        assert!(err.contains("empty"));
    }

    #[cfg(unix)]
    #[test]
    fn executable_paths_are_spawned_directly() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempfile::tempdir().expect("temp dir");
        let marker = temp_dir.path().join("launched");
        let script = temp_dir.path().join("game.sh");
        fs_err::write(&script, "#!/bin/sh\ntouch launched\n").expect("write script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");

        SystemLauncher
            .launch(&script.to_string_lossy())
            .expect("launch");

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !marker.exists() && std::time::Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(marker.exists(), "script should run from its own directory");
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_file_fails_to_launch() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("notes.txt");
        fs_err::write(&path, "hello").expect("write");
        assert!(SystemLauncher.launch(&path.to_string_lossy()).is_err());
    }
}
