//! playtime-tracker: watches game processes on behalf of playtime-daemon.
//!
//! Protocol: one JSON command per stdin line, one JSON response or
//! notification per stdout line. The first stdout line is always the ready
//! response. Logs go to stderr only, since stdout is the protocol channel.

use clap::Parser;
use playtime_daemon_protocol::tracker::{TrackerMessage, TrackerResponse};
use std::io::{self, BufRead, Write};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod service;
mod watcher;

use service::{TrackerService, DEFAULT_PENDING_TIMEOUT};
use watcher::SysinfoSource;

#[derive(Parser, Debug)]
#[command(name = "playtime-tracker")]
#[command(about = "Process watcher for playtime-daemon")]
struct Args {
    /// Milliseconds between process table scans.
    #[arg(long, default_value_t = 2000)]
    poll_interval_ms: u64,

    /// Seconds a session may wait for its process before giving up.
    #[arg(long, default_value_t = DEFAULT_PENDING_TIMEOUT.as_secs())]
    pending_timeout_secs: u64,
}

fn main() {
    init_logging();
    let args = Args::parse();

    let mut stdout = io::stdout().lock();
    if let Err(err) = emit(&mut stdout, &TrackerMessage::Response(TrackerResponse::ready())) {
        error!(error = %err, "Failed to announce readiness");
        std::process::exit(1);
    }
    info!(
        poll_interval_ms = args.poll_interval_ms,
        pending_timeout_secs = args.pending_timeout_secs,
        "Tracker ready"
    );

    let (lines_tx, lines_rx) = mpsc::channel::<String>();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if lines_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let poll_interval = Duration::from_millis(args.poll_interval_ms.max(10));
    let mut service = TrackerService::new(
        SysinfoSource::new(),
        Duration::from_secs(args.pending_timeout_secs),
    );
    let mut next_tick = Instant::now() + poll_interval;

    loop {
        let wait = next_tick.saturating_duration_since(Instant::now());
        match lines_rx.recv_timeout(wait) {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let outcome = service.handle_line(&line, Instant::now());
                if let Err(err) = emit_all(&mut stdout, &outcome.messages) {
                    error!(error = %err, "Output closed; exiting");
                    break;
                }
                if outcome.shutdown {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                let messages = service.tick(Instant::now());
                if let Err(err) = emit_all(&mut stdout, &messages) {
                    error!(error = %err, "Output closed; exiting");
                    break;
                }
                next_tick = Instant::now() + poll_interval;
            }
            Err(RecvTimeoutError::Disconnected) => {
                info!("Input closed; exiting");
                break;
            }
        }
    }
    info!(sessions = service.tracked_sessions(), "Tracker stopped");
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();
}

fn emit_all(out: &mut impl Write, messages: &[TrackerMessage]) -> io::Result<()> {
    for message in messages {
        emit(out, message)?;
    }
    Ok(())
}

fn emit(out: &mut impl Write, message: &TrackerMessage) -> io::Result<()> {
    let timestamp = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
    let line = message
        .to_line(timestamp)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    out.write_all(line.as_bytes())?;
    out.flush()
}
