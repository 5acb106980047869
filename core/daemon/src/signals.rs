//! SIGINT/SIGTERM handling.
//!
//! The handler only flips a flag; a watcher thread turns it into a
//! shutdown event for the coordinator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::thread;
use std::time::Duration;

use crate::host::HostEvent;

const WATCH_INTERVAL: Duration = Duration::from_millis(200);

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signal: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

pub fn install(events: Sender<HostEvent>) {
    let handler: extern "C" fn(libc::c_int) = on_signal;
    // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }

    thread::spawn(move || loop {
        thread::sleep(WATCH_INTERVAL);
        if SHUTDOWN_REQUESTED.swap(false, Ordering::SeqCst) {
            tracing::info!("Termination signal received");
            let _ = events.send(HostEvent::Shutdown { reason: "signal" });
            break;
        }
    });
}
