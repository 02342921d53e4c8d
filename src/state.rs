//! State directory: one small file per value, polled by other processes
//! to learn the engine's status (`record`, `last_rec`, duration sidecars).

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Create `dir` if it does not exist. Rejects a plain file or a broken
/// symlink sitting where the directory should be.
pub fn ensure_dir(dir: &Path) -> Result<(), String> {
    match fs::metadata(dir) {
        Ok(md) => {
            if md.is_dir() {
                Ok(())
            } else {
                Err(format!(
                    "{} exists but is not a directory; remove it or replace it with a directory",
                    dir.display()
                ))
            }
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            if fs::symlink_metadata(dir).is_ok() {
                return Err(format!("{} is a broken symbolic link", dir.display()));
            }
            fs::create_dir_all(dir)
                .map_err(|e| format!("failed to create {}: {e}", dir.display()))?;
            log::info!("created dir: {}", dir.display());
            Ok(())
        }
        Err(e) => Err(format!("stat {} failed: {e}", dir.display())),
    }
}

/// Writes status files into a directory, one value per file.
#[derive(Debug, Clone)]
pub struct StateDir {
    dir: PathBuf,
}

impl StateDir {
    /// Open the state directory, creating it if necessary.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, String> {
        let dir = dir.into();
        ensure_dir(&dir)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Write `value` to `<statedir>/<name>`, replacing any previous contents.
    pub fn set(&self, name: &str, value: &str) -> Result<(), String> {
        let path = self.dir.join(name);
        fs::write(&path, value)
            .map_err(|e| format!("failed to write state file {}: {e}", path.display()))
    }

    pub fn get(&self, name: &str) -> Result<String, String> {
        let path = self.dir.join(name);
        fs::read_to_string(&path)
            .map_err(|e| format!("failed to read state file {}: {e}", path.display()))
    }
}
