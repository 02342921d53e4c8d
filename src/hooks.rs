//! Hooks directory lifecycle.
//!
//! Dropping a file into the hooks directory issues a command: the file
//! name selects it, the body carries parameters. The watcher consumes
//! each file (reads it, dispatches the parsed event, deletes it). Stale
//! hook files are cleared at startup so commands from a previous run are
//! not replayed.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::control;
use crate::engine::Engine;
use crate::state::ensure_dir;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Create the hooks directory if needed and drop any stale hook files.
pub fn prepare_dir(dir: &Path) -> Result<(), String> {
    ensure_dir(dir)?;
    clear_hooks(dir)
}

fn clear_hooks(dir: &Path) -> Result<(), String> {
    let entries =
        fs::read_dir(dir).map_err(|e| format!("cannot read hooks dir {}: {e}", dir.display()))?;
    for entry in entries.flatten() {
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        if let Err(e) = fs::remove_file(entry.path()) {
            log::warn!("failed to clear stale hook {:?}: {e}", entry.file_name());
        }
    }
    Ok(())
}

/// Watch the hooks directory until `keep_running` clears. Runs on the
/// tokio runtime owned by main; the real inotify plumbing is left to the
/// filesystem-watch collaborator, a poll keeps the dispatcher honest.
pub async fn watch(dir: PathBuf, engine: Arc<Engine>, keep_running: Arc<AtomicBool>) {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    while keep_running.load(Ordering::Relaxed) {
        ticker.tick().await;
        consume_pending(&dir, &engine);
    }
    log::debug!("hook watcher stopped");
}

/// Dispatch and delete every hook file currently in the directory, in
/// name order for determinism.
pub fn consume_pending(dir: &Path, engine: &Engine) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("cannot read hooks dir {}: {e}", dir.display());
            return;
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| e.file_type().map(|t| !t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .collect();
    paths.sort();

    for path in paths {
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
            continue;
        };
        let content = fs::read_to_string(&path).unwrap_or_default();
        if let Err(e) = fs::remove_file(&path) {
            log::warn!("failed to delete hook {}: {e}", path.display());
        }

        log::info!("hook: {name}");
        match control::parse_hook(&name, &content) {
            Ok(event) => engine.handle_hook(event),
            Err(e) => log::error!("{e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_dir_clears_stale_hooks() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("hooks");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("start_record"), "").unwrap();
        fs::write(dir.join("mute"), "").unwrap();

        prepare_dir(&dir).unwrap();
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    }
}
