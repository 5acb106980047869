//! Host side of the tracker helper protocol.
//!
//! The helper is a child process speaking newline-delimited JSON: commands on
//! its stdin, responses and notifications on its stdout, free-form logs on
//! stderr. Readiness is owned by the coordinator thread; reader threads only
//! forward what they parse.

use chrono::Utc;
use playtime_daemon_protocol::tracker::{parse_message, CommandEnvelope, TrackerCommand, TrackerMessage};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::TrackerConfig;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// What the reader threads report back to the coordinator.
#[derive(Debug)]
pub enum TrackerSignal {
    Message(TrackerMessage),
    /// The helper's stdout reached EOF.
    Exited,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("tracker helper is not ready")]
    NotReady,
    #[error("tracker helper input is closed")]
    ChannelClosed,
    #[error("failed to write to tracker helper: {0}")]
    Write(String),
}

/// The seam between session bookkeeping and the helper process.
pub trait TrackerChannel {
    fn is_ready(&self) -> bool;

    /// Sends one command. Fails without writing when the helper is not ready.
    fn send_command(&mut self, command: TrackerCommand) -> Result<(), TrackerError>;

    fn mark_ready(&mut self);

    fn mark_exited(&mut self);

    /// Asks the helper to exit and reaps it. Idempotent.
    fn shutdown(&mut self);
}

pub struct TrackerClient {
    child: Option<Child>,
    writer: Option<Box<dyn Write + Send>>,
    ready: bool,
    grace: Duration,
}

impl TrackerClient {
    /// Spawns the helper and its reader threads. `notify` is called from those
    /// threads for every parsed stdout line and once at EOF.
    pub fn start<F>(helper: &Path, config: &TrackerConfig, notify: F) -> Result<Self, String>
    where
        F: Fn(TrackerSignal) + Send + 'static,
    {
        let mut command = Command::new(helper);
        command
            .args(&config.helper_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            // Keep terminal Ctrl-C away from the helper; the daemon stops it.
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command
            .spawn()
            .map_err(|err| format!("Failed to spawn tracker helper {}: {}", helper.display(), err))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| "Tracker helper stdin was not captured".to_string())?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "Tracker helper stdout was not captured".to_string())?;
        if let Some(stderr) = child.stderr.take() {
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(line) if !line.trim().is_empty() => {
                            debug!(target: "tracker_helper", "{}", line);
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
            });
        }

        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(error = %err, "Failed to read tracker helper output");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_message(&line) {
                    Ok(message) => notify(TrackerSignal::Message(message)),
                    Err(err) => {
                        warn!(code = %err.code, line = %line, "Ignoring unparseable tracker output");
                    }
                }
            }
            notify(TrackerSignal::Exited);
        });

        info!(pid = child.id(), helper = %helper.display(), "Tracker helper spawned");

        Ok(Self {
            child: Some(child),
            writer: Some(Box::new(stdin)),
            ready: false,
            grace: config.shutdown_grace(),
        })
    }

    /// A client with no helper. Every command fails with `NotReady`.
    pub fn detached() -> Self {
        Self {
            child: None,
            writer: None,
            ready: false,
            grace: Duration::ZERO,
        }
    }

    #[cfg(test)]
    fn with_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            child: None,
            writer: Some(writer),
            ready: false,
            grace: Duration::ZERO,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    fn write_command(&mut self, command: TrackerCommand) -> Result<(), TrackerError> {
        let writer = self.writer.as_mut().ok_or(TrackerError::ChannelClosed)?;
        let name = command.name();
        let line = CommandEnvelope::new(command, Utc::now().timestamp_millis())
            .to_line()
            .map_err(|err| TrackerError::Write(err.to_string()))?;

        let result = writer
            .write_all(line.as_bytes())
            .and_then(|_| writer.flush());
        match result {
            Ok(()) => {
                debug!(command = name, "Tracker command sent");
                Ok(())
            }
            Err(err) => {
                self.writer = None;
                self.ready = false;
                if err.kind() == std::io::ErrorKind::BrokenPipe {
                    Err(TrackerError::ChannelClosed)
                } else {
                    Err(TrackerError::Write(err.to_string()))
                }
            }
        }
    }
}

impl TrackerChannel for TrackerClient {
    fn is_ready(&self) -> bool {
        self.ready && self.writer.is_some()
    }

    fn send_command(&mut self, command: TrackerCommand) -> Result<(), TrackerError> {
        if !self.ready {
            return Err(TrackerError::NotReady);
        }
        self.write_command(command)
    }

    fn mark_ready(&mut self) {
        if self.writer.is_some() && !self.ready {
            info!(pid = ?self.pid(), "Tracker helper ready");
            self.ready = true;
        }
    }

    fn mark_exited(&mut self) {
        self.ready = false;
        self.writer = None;
        let Some(child) = self.child.as_mut() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                warn!(status = %status, "Tracker helper exited; tracking disabled");
                self.child = None;
            }
            Ok(None) => warn!("Tracker helper closed its output; tracking disabled"),
            Err(err) => warn!(error = %err, "Failed to query tracker helper status"),
        }
    }

    fn shutdown(&mut self) {
        self.ready = false;
        if self.writer.is_some() {
            if let Err(err) = self.write_command(TrackerCommand::Shutdown {}) {
                debug!(error = %err, "Tracker shutdown command not delivered");
            }
        }
        // Dropping stdin closes the pipe; the helper exits on EOF too.
        self.writer = None;

        if let Some(mut child) = self.child.take() {
            wait_or_kill(&mut child, self.grace);
        }
    }
}

impl Drop for TrackerClient {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.shutdown();
        }
    }
}

fn wait_or_kill(child: &mut Child, grace: Duration) {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                info!(status = %status, "Tracker helper stopped");
                return;
            }
            Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL_INTERVAL),
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "Failed to wait for tracker helper");
                break;
            }
        }
    }

    warn!(pid = child.id(), "Tracker helper did not exit in time; killing");
    if let Err(err) = child.kill() {
        warn!(error = %err, "Failed to kill tracker helper");
    }
    let _ = child.wait();
}
