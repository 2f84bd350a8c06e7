//! Deletes old artifacts and logs.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use tracing::{debug, info, warn};

const SECONDS_PER_DAY: u64 = 86_400;

/// Remove regular files in `dir` whose name passes `name_filter` and that were
/// last modified more than `days` days before `now`.
///
/// Subdirectories are left alone. A file that cannot be removed is logged
/// and skipped.
///
/// # Errors
///
/// Fails only when `dir` itself cannot be listed.
pub async fn prune_older_than(
    dir: &Path,
    days: u32,
    name_filter: impl Fn(&str) -> bool,
    now: SystemTime,
) -> anyhow::Result<Vec<PathBuf>> {
    let age = Duration::from_secs(SECONDS_PER_DAY.saturating_mul(u64::from(days)));
    let Some(cutoff) = now.checked_sub(age) else {
        return Ok(Vec::new());
    };

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to list {}", dir.display()))?;
    let mut removed = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(&name_filter);
        if !matches {
            continue;
        }
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        if modified >= cutoff {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "removed old file");
                removed.push(path);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "could not remove old file"),
        }
    }
    if !removed.is_empty() {
        info!(dir = %dir.display(), count = removed.len(), days, "retention pruned files");
    }
    Ok(removed)
}
