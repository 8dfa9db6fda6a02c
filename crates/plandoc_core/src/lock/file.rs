//! Cross-process advisory locks.
//!
//! One lock file per resource key under `<root>/locks/`, named by the BLAKE3
//! digest of the key. Exclusion comes from `fs2` advisory locks on the open
//! file; the file content (owner PID, acquisition time) is diagnostic only.

use super::holder::{check_resource, AcquireOutcome, LockHandle, LockId};
use crate::config::FileLockConfig;
use crate::error::{DenyReason, Result, StoreError};
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Instant, SystemTime};
use tracing::{debug, info, warn};

/// Outcome of the startup sweep of orphan lock files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Lock files inspected.
    pub scanned: usize,
    /// Orphans removed.
    pub removed: usize,
}

/// Cross-process lock manager over advisory file locks.
pub struct FileLockManager {
    dir: PathBuf,
    config: FileLockConfig,
    state: Mutex<FileLockState>,
    /// Serializes lock directory (re)creation.
    dir_gate: Mutex<()>,
}

#[derive(Default)]
struct FileLockState {
    initialized: bool,
    disposed: bool,
    held: HashMap<LockId, HeldFileLock>,
    created: HashSet<PathBuf>,
}

struct HeldFileLock {
    file: File,
    path: PathBuf,
    resource: String,
}

impl FileLockManager {
    /// Manager for lock files in `dir`. Call [`initialize`](Self::initialize)
    /// before anything else.
    pub fn new(dir: impl Into<PathBuf>, config: FileLockConfig) -> Self {
        Self {
            dir: dir.into(),
            config,
            state: Mutex::new(FileLockState::default()),
            dir_gate: Mutex::new(()),
        }
    }

    /// Lock directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Lock file path for a resource key.
    pub fn lock_path(&self, resource: &str) -> PathBuf {
        self.dir.join(lock_file_name(resource))
    }

    /// Creates the lock directory and sweeps orphan lock files older than the
    /// stale threshold. Only the first call sweeps.
    pub fn initialize(&self) -> Result<SweepReport> {
        let mut state = self.state.lock();
        if state.initialized {
            return Ok(SweepReport::default());
        }
        self.ensure_dir()?;
        let report = self.sweep_stale()?;
        state.initialized = true;
        state.disposed = false;
        info!(
            dir = %self.dir.display(),
            scanned = report.scanned,
            removed = report.removed,
            "file lock manager initialized"
        );
        Ok(report)
    }

    fn sweep_stale(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let threshold = self.config.stale_threshold();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("lock") {
                continue;
            }
            report.scanned += 1;

            let age = fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok());
            match age {
                Some(age) if age >= threshold => {}
                _ => continue,
            }

            let Ok(file) = OpenOptions::new().read(true).write(true).open(&path) else {
                continue;
            };
            // A live holder keeps the lock, so only unheld files are orphans.
            if file.try_lock_exclusive().is_ok() {
                match fs::remove_file(&path) {
                    Ok(()) => {
                        report.removed += 1;
                        warn!(path = %path.display(), "removed stale lock file");
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to remove stale lock file"),
                }
                let _ = FileExt::unlock(&file);
            }
        }
        Ok(report)
    }

    fn ensure_dir(&self) -> Result<()> {
        let _gate = self.dir_gate.lock();
        if !self.dir.is_dir() {
            fs::create_dir_all(&self.dir)?;
            debug!(dir = %self.dir.display(), "created lock directory");
        }
        Ok(())
    }

    fn check_usable(&self) -> Result<bool> {
        let state = self.state.lock();
        if !state.initialized {
            return Err(StoreError::NotInitialized("FileLockManager"));
        }
        Ok(!state.disposed)
    }

    /// Opens (creating if needed) the lock file, reporting whether this call
    /// created it.
    fn open_lock_file(&self, path: &Path) -> Result<(File, bool)> {
        let create = || OpenOptions::new().read(true).write(true).create_new(true).open(path);
        let result = match create() {
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // lock directory vanished underneath us
                self.ensure_dir()?;
                create()
            }
            other => other,
        };
        match result {
            Ok(file) => Ok((file, true)),
            // NotFound here means it was removed between the two opens; the
            // caller retries and recreates it
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let file = OpenOptions::new().read(true).write(true).open(path)?;
                Ok((file, false))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Tries to take the cross-process lock for `resource`, retrying until
    /// the configured acquire timeout.
    ///
    /// # Errors
    ///
    /// `NotInitialized` before `initialize()`, `EmptyResource` for a blank key,
    /// `Io` for filesystem failures other than contention.
    pub fn acquire(&self, resource: &str) -> Result<AcquireOutcome> {
        check_resource(resource)?;
        let timeout = self.config.acquire_timeout();
        let retry = self.config.retry_interval();
        let path = self.lock_path(resource);
        let deadline = Instant::now() + timeout;

        loop {
            if !self.check_usable()? {
                return Ok(AcquireOutcome::NotAcquired(DenyReason::Disposed));
            }

            match self.try_lock_once(resource, &path) {
                Ok(Some(handle)) => return Ok(AcquireOutcome::Acquired(handle)),
                Ok(None) => {}
                Err(StoreError::Io(e)) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(resource, "file lock wait timed out");
                return Ok(AcquireOutcome::NotAcquired(DenyReason::Timeout { waited: timeout }));
            }
            thread::sleep(retry.min(deadline - now));
        }
    }

    fn try_lock_once(&self, resource: &str, path: &Path) -> Result<Option<LockHandle>> {
        let (mut file, created) = self.open_lock_file(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        // The file may have been swept or replaced between open and lock.
        if !same_file(&file, path) {
            let _ = FileExt::unlock(&file);
            return Ok(None);
        }

        file.set_len(0)?;
        writeln!(
            file,
            "pid={}\nacquired_at={}\nresource={}",
            std::process::id(),
            chrono::Utc::now().to_rfc3339(),
            resource
        )?;
        file.sync_all()?;

        let lock_id = LockId::generate();
        let mut state = self.state.lock();
        if state.disposed {
            let _ = FileExt::unlock(&file);
            return Ok(None);
        }
        if created {
            state.created.insert(path.to_path_buf());
        }
        state.held.insert(
            lock_id.clone(),
            HeldFileLock {
                file,
                path: path.to_path_buf(),
                resource: resource.to_string(),
            },
        );
        debug!(resource, lock_id = %lock_id, path = %path.display(), "file lock acquired");

        Ok(Some(LockHandle {
            lock_id,
            resource: resource.to_string(),
            holder_id: std::process::id().to_string(),
            expires_at: None,
        }))
    }

    /// Releases a lock taken by this manager.
    ///
    /// A lock file removed or replaced by someone else is logged and treated
    /// as released.
    ///
    /// # Errors
    ///
    /// `NotInitialized` before `initialize()`, `UnknownLock` for ids this
    /// manager does not hold. Silent no-op after `dispose()`.
    pub fn release(&self, lock_id: &LockId) -> Result<()> {
        let held = {
            let mut state = self.state.lock();
            if !state.initialized {
                return Err(StoreError::NotInitialized("FileLockManager"));
            }
            if state.disposed {
                return Ok(());
            }
            state
                .held
                .remove(lock_id)
                .ok_or_else(|| StoreError::UnknownLock(lock_id.to_string()))?
        };
        unlock_held(&held);
        debug!(resource = %held.resource, lock_id = %lock_id, "file lock released");
        Ok(())
    }

    /// Runs `f` while holding the cross-process lock for `resource`.
    pub fn with_lock<T, F>(&self, resource: &str, f: F) -> Result<T>
    where
        F: FnOnce(&LockHandle) -> Result<T>,
    {
        let handle = self.acquire(resource)?.into_result(resource)?;
        let _guard = FileReleaseGuard {
            manager: self,
            lock_id: handle.lock_id.clone(),
        };
        f(&handle)
    }

    /// True if this manager or any other process holds `resource`.
    pub fn is_locked(&self, resource: &str) -> Result<bool> {
        check_resource(resource)?;
        {
            let state = self.state.lock();
            if !state.initialized {
                return Err(StoreError::NotInitialized("FileLockManager"));
            }
            if state.held.values().any(|h| h.resource == resource) {
                return Ok(true);
            }
        }
        let file = match OpenOptions::new().read(true).write(true).open(self.lock_path(resource)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                Ok(false)
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Number of locks held by this manager.
    pub fn held_count(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Releases every held lock and removes the lock files this instance
    /// created. Best-effort and idempotent.
    pub fn dispose(&self) {
        let (held, created) = {
            let mut state = self.state.lock();
            if state.disposed || !state.initialized {
                state.disposed = true;
                return;
            }
            state.disposed = true;
            (
                std::mem::take(&mut state.held),
                std::mem::take(&mut state.created),
            )
        };

        let released = held.len();
        for held in held.values() {
            unlock_held(held);
        }
        let mut removed = 0;
        for path in &created {
            match fs::remove_file(path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove lock file"),
            }
        }
        info!(released, removed, "file lock manager disposed");
    }
}

impl Drop for FileLockManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn unlock_held(held: &HeldFileLock) {
    if !held.path.exists() {
        warn!(
            resource = %held.resource,
            path = %held.path.display(),
            "lock file was removed externally while held"
        );
    } else if !same_file(&held.file, &held.path) {
        warn!(
            resource = %held.resource,
            path = %held.path.display(),
            "lock file was replaced externally while held"
        );
    }
    if let Err(e) = FileExt::unlock(&held.file) {
        warn!(resource = %held.resource, error = %e, "failed to unlock lock file");
    }
}

/// `<blake3 hex of key>.lock`
fn lock_file_name(resource: &str) -> String {
    format!("{}.lock", hex::encode(blake3::hash(resource.as_bytes()).as_bytes()))
}

#[cfg(unix)]
fn same_file(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (file.metadata(), fs::metadata(path)) {
        (Ok(open), Ok(on_disk)) => open.ino() == on_disk.ino() && open.dev() == on_disk.dev(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(_file: &File, path: &Path) -> bool {
    path.exists()
}

struct FileReleaseGuard<'a> {
    manager: &'a FileLockManager,
    lock_id: LockId,
}

impl Drop for FileReleaseGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.manager.release(&self.lock_id) {
            warn!(lock_id = %self.lock_id, error = %e, "failed to release scoped file lock");
        }
    }
}
