//! Playtime daemon entrypoint.
//!
//! A single-writer service that owns game sessions: a socket listener with
//! strict request validation, a coordinator thread that serializes every
//! state change, a tracker helper child process, and SQLite persistence.

use fs_err as fs;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use playtime_core::HeuristicTables;
use playtime_daemon_protocol::{ErrorInfo, Request, Response, MAX_REQUEST_BYTES};

mod config;
mod db;
mod host;
mod launcher;
mod orphan_monitor;
mod registry;
mod session_manager;
mod signals;
mod timers;
mod tracker_client;

use db::Db;
use host::{Host, HostEvent};
use launcher::SystemLauncher;
use session_manager::SessionManager;
use tracker_client::TrackerClient;

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;
const REPLY_TIMEOUT_SECS: u64 = 30;

fn main() {
    init_logging();

    let config = match config::load_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load daemon config; using defaults");
            config::DaemonConfig::default()
        }
    };

    let socket_path = match config::daemon_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    let db_path = match config::daemon_db_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon database path");
            std::process::exit(1);
        }
    };

    let db = match Db::new(db_path) {
        Ok(db) => db,
        Err(err) => {
            error!(error = %err, "Failed to initialize daemon database");
            std::process::exit(1);
        }
    };
    match db.count_open_sessions() {
        Ok(0) => {}
        Ok(count) => warn!(count, "Sessions left open by a previous run remain unclosed"),
        Err(err) => warn!(error = %err, "Failed to count open sessions"),
    }

    let tables = load_tables(&config);
    let (events_tx, events_rx) = mpsc::channel::<HostEvent>();
    let tracker = start_tracker(&config, events_tx.clone());

    let manager = SessionManager::new(db, tracker, tables, Box::new(SystemLauncher));
    let host = Host::new(manager, events_tx.clone(), config.monitor.clone());
    let host_thread = thread::spawn(move || host.run(events_rx));

    signals::install(events_tx.clone());

    info!(path = %socket_path.display(), "Playtime daemon started");

    thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let events = events_tx.clone();
                    thread::spawn(move || handle_connection(stream, events));
                }
                Err(err) => {
                    warn!(error = %err, "Failed to accept daemon connection");
                }
            }
        }
    });

    if host_thread.join().is_err() {
        error!("Coordinator thread panicked");
    }
    if let Err(err) = remove_existing_socket(&socket_path) {
        warn!(error = %err, "Failed to remove daemon socket on exit");
    }
    info!("Playtime daemon stopped");
}

fn init_logging() {
    let filter = if config::debug_logging_requested() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_tables(config: &config::DaemonConfig) -> HeuristicTables {
    let path = config::heuristics_path(&config.heuristics);
    match HeuristicTables::load_or_builtin(path.as_deref()) {
        Ok(tables) => {
            info!(
                version = tables.version,
                known_games = tables.known_games.len(),
                "Heuristic tables loaded"
            );
            tables
        }
        Err(err) => {
            warn!(error = %err, "Failed to load heuristic tables; using builtin copy");
            HeuristicTables::builtin().unwrap_or_else(|err| {
                error!(error = %err, "Builtin heuristic tables are unusable; using empty tables");
                HeuristicTables::default()
            })
        }
    }
}

/// Spawns the helper. When that fails the daemon keeps running with
/// wall-clock tracking only.
fn start_tracker(config: &config::DaemonConfig, events: Sender<HostEvent>) -> TrackerClient {
    if !config.tracker.enabled {
        info!("Tracker helper disabled; wall-clock tracking only");
        return TrackerClient::detached();
    }
    let Some(helper) = config::resolve_helper_path(&config.tracker) else {
        warn!("Tracker helper path could not be resolved; wall-clock tracking only");
        return TrackerClient::detached();
    };

    match TrackerClient::start(&helper, &config.tracker, move |signal| {
        let _ = events.send(HostEvent::Tracker(signal));
    }) {
        Ok(client) => client,
        Err(err) => {
            warn!(error = %err, "Tracker helper unavailable; wall-clock tracking only");
            TrackerClient::detached()
        }
    }
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, events: Sender<HostEvent>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let id = request.id.clone();
    let (reply_tx, reply_rx) = mpsc::channel();
    let response = if events
        .send(HostEvent::Request {
            request,
            reply: reply_tx,
        })
        .is_err()
    {
        Response::error(id, "shutting_down", "daemon is shutting down")
    } else {
        match reply_rx.recv_timeout(Duration::from_secs(REPLY_TIMEOUT_SECS)) {
            Ok(response) => response,
            Err(_) => Response::error(id, "unavailable", "daemon did not answer in time"),
        }
    };
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => {
            if buffer[index + 1..].iter().any(|b| !b.is_ascii_whitespace()) {
                warn!("Extra bytes detected after newline; ignoring trailing data");
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
