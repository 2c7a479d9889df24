//! Exclusive locking for shared store files.
//!
//! The ledger and the pack files are touched by independent hook invocations.
//! Appends and rewrites take an OS-level advisory lock (via fs2) on a sidecar
//! `.lock` file. A metadata file next to it records the holder for debugging.
//! Rewrites go through a temp file and an atomic rename so readers never see
//! a partial file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default time to wait for a contended lock before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Errors that can occur during lock operations.
#[derive(Error, Debug)]
pub enum LockError {
    /// Lock stayed held by another process for the whole timeout.
    #[error("timed out waiting for {path} (held by pid {pid})")]
    Timeout { path: String, pid: u32 },

    /// Lock stayed held and the holder left no readable metadata.
    #[error("timed out waiting for {0} (holder unknown)")]
    TimeoutNoMeta(String),

    /// I/O error during lock operations.
    #[error("lock I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize/deserialize metadata.
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Diagnostic metadata written alongside the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMetadata {
    /// Process ID of the lock holder.
    pub pid: u32,
    /// Unix timestamp when the lock was acquired.
    pub acquired_at: u64,
    /// What the holder is doing (e.g. "ledger-append").
    pub purpose: String,
    /// Version of errloop that acquired the lock.
    pub errloop_version: String,
}

impl LockMetadata {
    fn new(purpose: &str) -> Self {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());

        Self {
            pid: std::process::id(),
            acquired_at: now,
            purpose: purpose.to_string(),
            errloop_version: crate::VERSION.to_string(),
        }
    }
}

/// An acquired store lock. Released when dropped.
pub struct StoreLock {
    _lock_file: File,
    lock_path: PathBuf,
    meta_path: PathBuf,
}

impl StoreLock {
    /// Acquire the lock at `lock_path`, polling until `timeout` elapses.
    pub fn acquire(lock_path: &Path, purpose: &str, timeout: Duration) -> Result<Self, LockError> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        let deadline = Instant::now() + timeout;
        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if is_contended(&e) => {
                    if Instant::now() >= deadline {
                        return Err(read_holder_error(lock_path));
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(LockError::Io(e)),
            }
        }

        let lock = Self {
            _lock_file: lock_file,
            lock_path: lock_path.to_path_buf(),
            meta_path: metadata_path(lock_path),
        };
        lock.write_metadata(purpose)?;
        tracing::debug!(lock_path = %lock_path.display(), purpose, "Acquired store lock");
        Ok(lock)
    }

    fn write_metadata(&self, purpose: &str) -> Result<(), LockError> {
        let metadata = LockMetadata::new(purpose);
        let json = serde_json::to_string_pretty(&metadata)?;
        let mut file = File::create(&self.meta_path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.meta_path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    meta_path = %self.meta_path.display(),
                    error = %e,
                    "Failed to remove lock metadata"
                );
            }
        }
        tracing::debug!(lock_path = %self.lock_path.display(), "Released store lock");
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Sidecar lock path for a store file: `errors.jsonl` → `errors.jsonl.lock`.
#[must_use]
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut lock_path = path.to_path_buf();
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("store");
    lock_path.set_file_name(format!("{file_name}.lock"));
    lock_path
}

fn metadata_path(lock_path: &Path) -> PathBuf {
    let mut meta_path = lock_path.to_path_buf();
    let file_name = lock_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("lock");
    meta_path.set_file_name(format!("{file_name}.meta.json"));
    meta_path
}

fn read_holder_error(lock_path: &Path) -> LockError {
    let meta = fs::read_to_string(metadata_path(lock_path))
        .ok()
        .and_then(|s| serde_json::from_str::<LockMetadata>(&s).ok());
    match meta {
        Some(meta) => LockError::Timeout {
            path: lock_path.display().to_string(),
            pid: meta.pid,
        },
        None => LockError::TimeoutNoMeta(lock_path.display().to_string()),
    }
}

/// Replace `path` with `contents` under the store lock.
///
/// Writes to `<path>.tmp`, syncs, then renames over the target.
pub fn rewrite_atomic(
    path: &Path,
    contents: &[u8],
    purpose: &str,
    timeout: Duration,
) -> Result<(), LockError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let _guard = StoreLock::acquire(&lock_path_for(path), purpose, timeout)?;

    let mut tmp_path = path.to_path_buf();
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("store");
    tmp_path.set_file_name(format!("{file_name}.tmp"));

    {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(contents)?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}
