//! Config file change detection
//!
//! The file is polled for its modification time; creation and removal count
//! as changes too.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Spawn a background task signalling every change of `path`
pub fn spawn_config_watcher(
    path: PathBuf,
    poll_interval: Duration,
    shutdown: CancellationToken,
) -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let mut last = modified(&path);
        info!(
            "Watching config file {} for changes every {:?}",
            path.display(),
            poll_interval
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {
                    let current = modified(&path);
                    if current != last {
                        debug!("Config file {} changed", path.display());
                        last = current;
                        // A pending signal already covers this change
                        let _ = tx.try_send(());
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("Config watcher shutting down");
                    break;
                }
            }
        }
    });

    rx
}
