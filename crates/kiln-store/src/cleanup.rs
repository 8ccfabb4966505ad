//! Signal-driven lock cleanup.
//!
//! On SIGINT or SIGTERM every lock held by the process is released and
//! in-flight temporary files are removed before exiting, so other workers
//! are not left waiting on lockfiles of a dead process.

use std::sync::Arc;
use std::thread;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::warn;

use crate::fs::FsArtifactStore;

/// Install a handler that cleans up `store` and exits on SIGINT/SIGTERM.
///
/// The process exits with status `128 + signal`.
pub fn install_cleanup_handler(store: Arc<FsArtifactStore>) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    thread::Builder::new()
        .name("kiln-cleanup".into())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                warn!(signal, "shutdown signal received; releasing locks");
                store.emergency_cleanup();
                std::process::exit(128 + signal);
            }
        })?;
    Ok(())
}
