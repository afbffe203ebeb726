use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

use crate::state::StateSnapshot;

pub(crate) const DEFAULT_MAX_ATTEMPTS: usize = 3;
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Result of one compare-and-swap cycle. When `committed` is false the
/// mutation was applied to the last snapshot we could read, in memory only.
#[derive(Debug)]
pub(crate) struct Update<T> {
    pub(crate) snapshot: StateSnapshot,
    pub(crate) value: T,
    pub(crate) committed: bool,
    pub(crate) error: Option<String>,
}

/// The JSON state file plus its sibling `.lock` file. The lock lives beside
/// the data because the data file's inode is replaced on every write.
#[derive(Debug, Clone)]
pub(crate) struct StateStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    max_attempts: usize,
}

impl StateStore {
    pub(crate) fn new(path: PathBuf, lock_timeout: Duration) -> Self {
        let mut lock_name = path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self {
            path,
            lock_path,
            lock_timeout,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub(crate) fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub(crate) fn load(&self) -> StateSnapshot {
        read_snapshot(&self.path).unwrap_or_default()
    }

    /// Lock, read, mutate, write to a temp file in the same directory, rename
    /// over the original, unlock. `mutate` may run more than once when a
    /// rename fails and the cycle is retried, always against a fresh read.
    pub(crate) fn update<T, F>(&self, mut mutate: F) -> Update<T>
    where
        F: FnMut(&mut StateSnapshot) -> T,
    {
        let mut last_error = String::new();
        for _ in 0..self.max_attempts {
            let lock = match self.acquire_lock() {
                Ok(lock) => lock,
                Err(err) => return self.fail_open(mutate, err),
            };

            let mut snapshot = read_snapshot(&self.path).unwrap_or_default();
            let value = mutate(&mut snapshot);
            let written = self.write_snapshot(&snapshot);
            let _ = FileExt::unlock(&lock);

            match written {
                Ok(()) => {
                    return Update {
                        snapshot,
                        value,
                        committed: true,
                        error: None,
                    }
                }
                Err(err) => last_error = err,
            }
        }
        self.fail_open(mutate, last_error)
    }

    fn fail_open<T, F>(&self, mut mutate: F, error: String) -> Update<T>
    where
        F: FnMut(&mut StateSnapshot) -> T,
    {
        let mut snapshot = self.load();
        let value = mutate(&mut snapshot);
        Update {
            snapshot,
            value,
            committed: false,
            error: Some(error),
        }
    }

    fn acquire_lock(&self) -> Result<File, String> {
        if let Some(parent) = self.lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                format!("failed to create state dir {}: {}", parent.display(), err)
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|err| {
                format!(
                    "failed to open lock file {}: {}",
                    self.lock_path.display(),
                    err
                )
            })?;

        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(file),
                Err(err) if err.kind() != ErrorKind::WouldBlock && !is_contended(&err) => {
                    return Err(format!(
                        "failed to lock {}: {}",
                        self.lock_path.display(),
                        err
                    ))
                }
                Err(_) => {}
            }
            if Instant::now() >= deadline {
                return Err(format!(
                    "timed out after {:?} waiting for {}",
                    self.lock_timeout,
                    self.lock_path.display()
                ));
            }
            thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    fn write_snapshot(&self, snapshot: &StateSnapshot) -> Result<(), String> {
        let dir = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(dir) => dir.to_path_buf(),
            None => PathBuf::from("."),
        };
        let mut temp = NamedTempFile::new_in(&dir)
            .map_err(|err| format!("failed to create temp state file in {}: {}", dir.display(), err))?;
        serde_json::to_writer_pretty(&mut temp, snapshot)
            .map_err(|err| format!("failed to serialize state: {}", err))?;
        temp.write_all(b"\n")
            .and_then(|()| temp.as_file().sync_all())
            .map_err(|err| format!("failed to write temp state file: {}", err))?;
        temp.persist(&self.path).map_err(|err| {
            format!(
                "failed to rename state file into {}: {}",
                self.path.display(),
                err.error
            )
        })?;
        Ok(())
    }
}

fn read_snapshot(path: &Path) -> Option<StateSnapshot> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

fn is_contended(err: &std::io::Error) -> bool {
    err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
