//! Advisory cross-process locking through exclusive file creation.
//!
//! A lock on `resource` is the sidecar file `<resource>.lock`, created with
//! `O_EXCL` semantics and holding a JSON [`LockRecord`]. Holders that die
//! without releasing are reclaimed once the record is older than the
//! configured stale threshold. Past that threshold mutual exclusion is given
//! up in favour of liveness.
//!
//! Only the holder whose `lockId` is still in the file may delete it, so a
//! holder that was reclaimed as stale cannot remove its successor's lock.

use crate::error::{Result, StoreError};
use crate::{machine, paths};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(30);

// A lock file is created empty and then written; give a writer this long
// before an unparseable record counts as garbage.
const CORRUPT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub timeout: Duration,
    pub retry_interval: Duration,
    pub stale_threshold: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            stale_threshold: DEFAULT_STALE_THRESHOLD,
        }
    }
}

impl LockOptions {
    /// Patience for long interactive authentication flows: wait up to ten
    /// minutes, and only treat a holder as dead after twelve.
    pub fn interactive_auth() -> Self {
        Self {
            timeout: Duration::from_secs(10 * 60),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            stale_threshold: Duration::from_secs(12 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub pid: u32,
    pub lock_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub hostname: String,
}

impl LockRecord {
    fn new(lock_id: &str) -> Self {
        Self {
            pid: std::process::id(),
            lock_id: lock_id.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            hostname: machine::hostname(),
        }
    }

    pub fn age(&self) -> Duration {
        let now = Utc::now().timestamp_millis();
        Duration::from_millis(now.saturating_sub(self.timestamp).max(0) as u64)
    }
}

#[derive(Debug)]
enum Holder {
    Vacant,
    Live(LockRecord),
    Stale(LockRecord),
    /// Unparseable and old enough to discard.
    Corrupt,
    /// Unparseable but possibly still being written.
    Settling,
}

/// A held lock. Released on drop; call [`LockGuard::release`] to observe
/// release errors.
#[derive(Debug)]
pub struct LockGuard {
    resource: PathBuf,
    lock_path: PathBuf,
    lock_id: String,
    reclaimed: Option<LockRecord>,
    released: bool,
}

impl LockGuard {
    pub fn resource(&self) -> &Path {
        &self.resource
    }

    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    /// The stale record this acquisition had to remove, if any.
    pub fn reclaimed(&self) -> Option<&LockRecord> {
        self.reclaimed.as_ref()
    }

    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match read_record(&self.lock_path) {
            Ok(Some(record)) if record.lock_id == self.lock_id => {
                match fs::remove_file(&self.lock_path) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            Ok(Some(record)) => {
                warn!(
                    resource = %self.resource.display(),
                    owner = %record.lock_id,
                    pid = record.pid,
                    "lock was reclaimed by another holder; leaving it in place"
                );
                Ok(())
            }
            Ok(None) => {
                warn!(resource = %self.resource.display(), "lock file vanished before release");
                Ok(())
            }
            Err(_) => {
                warn!(resource = %self.resource.display(), "lock file unreadable at release; leaving it in place");
                Ok(())
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(resource = %self.resource.display(), "lock release failed: {e}");
        }
    }
}

/// Block until the lock on `resource` is held or `opts.timeout` elapses.
pub fn acquire(resource: &Path, opts: &LockOptions) -> Result<LockGuard> {
    let lock_path = paths::lock_path(resource);
    if let Some(parent) = lock_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let lock_id = Uuid::new_v4().to_string();
    let started = Instant::now();
    let mut reclaimed = None;

    loop {
        match inspect(&lock_path, opts.stale_threshold) {
            Holder::Stale(record) => {
                if remove_if_unchanged(&lock_path, Some(&record.lock_id))? {
                    warn!(
                        resource = %resource.display(),
                        pid = record.pid,
                        host = %record.hostname,
                        age_ms = record.age().as_millis() as u64,
                        "reclaimed stale lock"
                    );
                    reclaimed = Some(record);
                }
                continue;
            }
            Holder::Corrupt => {
                if remove_if_unchanged(&lock_path, None)? {
                    warn!(resource = %resource.display(), "removed corrupt lock file");
                }
                continue;
            }
            Holder::Vacant => match try_create(&lock_path, &lock_id) {
                Ok(()) => {
                    debug!(resource = %resource.display(), lock_id = %lock_id, "lock acquired");
                    return Ok(LockGuard {
                        resource: resource.to_path_buf(),
                        lock_path,
                        lock_id,
                        reclaimed,
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            },
            Holder::Live(_) | Holder::Settling => {}
        }

        let waited = started.elapsed();
        if waited >= opts.timeout {
            return Err(StoreError::LockTimeout {
                resource: resource.to_path_buf(),
                waited,
            });
        }
        thread::sleep(opts.retry_interval.min(opts.timeout - waited));
    }
}

/// Run `f` inside the critical section for `resource`.
pub fn with_lock<T>(
    resource: &Path,
    opts: &LockOptions,
    f: impl FnOnce(&LockGuard) -> Result<T>,
) -> Result<T> {
    let mut guard = acquire(resource, opts)?;
    let out = f(&guard);
    if let Err(e) = guard.release() {
        warn!(resource = %resource.display(), "lock release failed: {e}");
    }
    out
}

/// Best-effort check; the answer may be stale by the time it returns.
pub fn is_locked(resource: &Path, stale_threshold: Duration) -> bool {
    matches!(
        inspect(&paths::lock_path(resource), stale_threshold),
        Holder::Live(_) | Holder::Settling
    )
}

/// Remove the lock file regardless of owner. Returns whether one existed.
pub fn force_unlock(resource: &Path) -> Result<bool> {
    match fs::remove_file(paths::lock_path(resource)) {
        Ok(()) => {
            warn!(resource = %resource.display(), "lock forcibly removed");
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Current holder of `resource`, if the lock file parses.
pub fn holder(resource: &Path) -> Result<Option<LockRecord>> {
    read_record(&paths::lock_path(resource))
}

fn try_create(lock_path: &Path, lock_id: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)?;
    let record = LockRecord::new(lock_id);
    let written = serde_json::to_vec(&record)
        .map_err(std::io::Error::from)
        .and_then(|bytes| file.write_all(&bytes))
        .and_then(|_| file.sync_all());
    if let Err(e) = written {
        let _ = fs::remove_file(lock_path);
        return Err(e);
    }
    Ok(())
}

fn read_record(lock_path: &Path) -> Result<Option<LockRecord>> {
    match fs::read(lock_path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn inspect(lock_path: &Path, stale_threshold: Duration) -> Holder {
    let bytes = match fs::read(lock_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Holder::Vacant,
        Err(_) => return Holder::Settling,
    };
    match serde_json::from_slice::<LockRecord>(&bytes) {
        Ok(record) if record.age() > stale_threshold => Holder::Stale(record),
        Ok(record) => Holder::Live(record),
        Err(_) => {
            let grace = stale_threshold.min(CORRUPT_GRACE);
            match file_age(lock_path) {
                Some(age) if age > grace => Holder::Corrupt,
                _ => Holder::Settling,
            }
        }
    }
}

fn file_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

/// Delete the lock file only if it still holds `expected` (or, when
/// `expected` is `None`, is still unparseable). Narrows the window in which
/// two waiters reclaiming the same stale lock could delete a fresh one.
fn remove_if_unchanged(lock_path: &Path, expected: Option<&str>) -> Result<bool> {
    let bytes = match fs::read(lock_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    let current = serde_json::from_slice::<LockRecord>(&bytes).ok();
    let unchanged = match (expected, &current) {
        (Some(id), Some(record)) => record.lock_id == id,
        (None, None) => true,
        _ => false,
    };
    if !unchanged {
        return Ok(false);
    }
    match fs::remove_file(lock_path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn quick() -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(300),
            retry_interval: Duration::from_millis(10),
            stale_threshold: Duration::from_secs(30),
        }
    }

    #[test]
    fn acquire_writes_record_and_release_removes_it() {
        let dir = tempdir().unwrap();
        let resource = dir.path().join("state");
        let mut guard = acquire(&resource, &quick()).unwrap();
        let record = holder(&resource).unwrap().unwrap();
        assert_eq!(record.lock_id, guard.lock_id());
        assert_eq!(record.pid, std::process::id());
        guard.release().unwrap();
        assert!(!paths::lock_path(&resource).exists());
        // second release is a no-op
        guard.release().unwrap();
    }

    #[test]
    fn held_lock_times_out_second_acquirer() {
        let dir = tempdir().unwrap();
        let resource = dir.path().join("state");
        let _held = acquire(&resource, &quick()).unwrap();
        let err = acquire(&resource, &quick()).unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { .. }));
        assert!(is_locked(&resource, DEFAULT_STALE_THRESHOLD));
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempdir().unwrap();
        let resource = dir.path().join("state");
        let dead = LockRecord {
            pid: 999_999,
            lock_id: "dead-holder".into(),
            timestamp: Utc::now().timestamp_millis() - 60_000,
            hostname: "elsewhere".into(),
        };
        fs::write(paths::lock_path(&resource), serde_json::to_vec(&dead).unwrap()).unwrap();
        assert!(!is_locked(&resource, DEFAULT_STALE_THRESHOLD));

        let guard = acquire(&resource, &quick()).unwrap();
        assert_eq!(guard.reclaimed().map(|r| r.lock_id.as_str()), Some("dead-holder"));
        assert_eq!(holder(&resource).unwrap().unwrap().lock_id, guard.lock_id());
    }

    #[test]
    fn corrupt_lock_is_removed_after_grace() {
        let dir = tempdir().unwrap();
        let resource = dir.path().join("state");
        fs::write(paths::lock_path(&resource), b"{not json").unwrap();
        thread::sleep(Duration::from_millis(80));
        let opts = LockOptions {
            stale_threshold: Duration::from_millis(50),
            ..quick()
        };
        let guard = acquire(&resource, &opts).unwrap();
        assert!(guard.reclaimed().is_none());
    }

    #[test]
    fn release_leaves_foreign_lock_alone() {
        let dir = tempdir().unwrap();
        let resource = dir.path().join("state");
        let mut guard = acquire(&resource, &quick()).unwrap();
        let usurper = LockRecord::new("someone-else");
        fs::write(paths::lock_path(&resource), serde_json::to_vec(&usurper).unwrap()).unwrap();
        guard.release().unwrap();
        assert_eq!(holder(&resource).unwrap().unwrap().lock_id, "someone-else");
    }

    #[test]
    fn force_unlock_reports_presence() {
        let dir = tempdir().unwrap();
        let resource = dir.path().join("state");
        assert!(!force_unlock(&resource).unwrap());
        let guard = acquire(&resource, &quick()).unwrap();
        assert!(force_unlock(&resource).unwrap());
        drop(guard);
        assert!(!is_locked(&resource, DEFAULT_STALE_THRESHOLD));
    }

    #[test]
    fn with_lock_releases_on_error() {
        let dir = tempdir().unwrap();
        let resource = dir.path().join("state");
        let out: Result<()> = with_lock(&resource, &quick(), |_| Err(StoreError::ReadOnly));
        assert!(matches!(out, Err(StoreError::ReadOnly)));
        assert!(!paths::lock_path(&resource).exists());
    }
}
