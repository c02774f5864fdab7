use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use super::SessionStore;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

/// Removes every directory under `root` last modified more than `retention`
/// before `now`. One directory failing does not stop the sweep.
pub fn sweep_expired<F>(root: &Path, now: SystemTime, retention: Duration, mut remove: F) -> SweepReport
where
    F: FnMut(&Path) -> io::Result<()>,
{
    let mut report = SweepReport::default();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return report,
        Err(err) => {
            warn!(root = %root.display(), error = %err, "cannot scan session root");
            return report;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(root = %root.display(), error = %err, "cannot read session entry");
                continue;
            }
        };
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        let modified = match entry.metadata().and_then(|meta| {
            if meta.is_dir() {
                meta.modified().map(Some)
            } else {
                Ok(None)
            }
        }) {
            Ok(Some(modified)) => modified,
            Ok(None) => continue,
            Err(err) => {
                warn!(session_id = %name, error = %err, "cannot stat session directory");
                report.failed.push(name);
                continue;
            }
        };
        report.scanned += 1;

        let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
        if age <= retention {
            continue;
        }
        match remove(&path) {
            Ok(()) => {
                info!(session_id = %name, age_secs = age.as_secs(), "removed expired session");
                report.removed.push(name);
            }
            Err(err) => {
                warn!(session_id = %name, error = %err, "failed to remove expired session");
                report.failed.push(name);
            }
        }
    }
    report
}

/// Sweeps once immediately, then every `interval`.
pub fn spawn_reaper(store: Arc<SessionStore>, retention: Duration, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match store.purge_expired(retention).await {
                Ok(report) => info!(
                    scanned = report.scanned,
                    removed = report.removed.len(),
                    failed = report.failed.len(),
                    "session sweep finished"
                ),
                Err(err) => warn!(error = %err, "session sweep failed"),
            }
        }
    })
}
