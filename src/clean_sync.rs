//! Clean-sync-required check (`spec.md` §4.8 step 6, §5 "Shared
//! resources", §9 "Clean-sync marker"). The original guards a shared ini
//! file with a SysV semaphore triple (ownership, readers, write-access);
//! this is a direct substitute using a cooperative file lock with the
//! same three-state semantics, per the Design Notes' explicit permission
//! to do so. Two sync processes racing on the same account serialize on
//! the lock file; the marker file itself records which accounts have
//! already been cleaned since this engine started managing them.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const LOCK_FILE_NAME: &str = ".clean-sync.lock";
const MARKER_FILE_NAME: &str = "clean-sync-marker.txt";
const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Held while the marker file is being read or rewritten — the
/// "write-access" slot of the original's semaphore triple. Dropping it
/// removes the lock file, releasing the next waiter.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn acquire_lock(base_dir: &Path) -> io::Result<LockGuard> {
    let path = base_dir.join(LOCK_FILE_NAME);
    let deadline = Instant::now() + LOCK_ACQUIRE_TIMEOUT;
    loop {
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => return Ok(LockGuard { path }),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "timed out waiting for clean-sync lock",
                    ));
                }
                std::thread::sleep(LOCK_POLL_INTERVAL);
            }
            Err(err) => return Err(err),
        }
    }
}

fn read_cleaned_accounts(base_dir: &Path) -> io::Result<Vec<String>> {
    let path = base_dir.join(MARKER_FILE_NAME);
    match fs::read_to_string(&path) {
        Ok(contents) => Ok(contents.lines().map(str::to_string).collect()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}

fn append_cleaned_accounts(base_dir: &Path, mut existing: Vec<String>, new_ids: &[String]) -> io::Result<()> {
    for id in new_ids {
        if !existing.iter().any(|e| e == id) {
            existing.push(id.clone());
        }
    }
    let path = base_dir.join(MARKER_FILE_NAME);
    fs::write(path, existing.join("\n"))
}

/// Outcome of one `ensure_clean` call. `PerformedBy` lists every account
/// id (the account itself plus any orphans) the caller must now wipe
/// from the local calendar store — this module owns only the marker, not
/// the deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanSyncStatus {
    AlreadyClean,
    PerformedBy(Vec<String>),
}

/// `spec.md` §4.8 step 6: on the first sync of `account_id` since this
/// marker file was created (or since it was last reset), report that a
/// clean sync is required for `account_id` and `orphan_account_ids`
/// (accounts the credential store no longer knows about). Subsequent
/// calls for the same `account_id` return `AlreadyClean` until the
/// marker file itself is deleted.
pub fn ensure_clean(
    base_dir: &Path,
    account_id: &str,
    orphan_account_ids: &[String],
) -> io::Result<CleanSyncStatus> {
    fs::create_dir_all(base_dir)?;
    let _lock = acquire_lock(base_dir)?;

    let cleaned = read_cleaned_accounts(base_dir)?;
    if cleaned.iter().any(|c| c == account_id) {
        return Ok(CleanSyncStatus::AlreadyClean);
    }

    let mut newly_cleaned = vec![account_id.to_string()];
    newly_cleaned.extend(orphan_account_ids.iter().cloned());
    append_cleaned_accounts(base_dir, cleaned, &newly_cleaned)?;

    Ok(CleanSyncStatus::PerformedBy(newly_cleaned))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_check_requires_clean_sync_including_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let status = ensure_clean(dir.path(), "acct-1", &["orphan-1".to_string()]).unwrap();
        assert_eq!(
            status,
            CleanSyncStatus::PerformedBy(vec!["acct-1".to_string(), "orphan-1".to_string()])
        );
    }

    #[test]
    fn second_check_for_same_account_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        ensure_clean(dir.path(), "acct-1", &[]).unwrap();
        let status = ensure_clean(dir.path(), "acct-1", &[]).unwrap();
        assert_eq!(status, CleanSyncStatus::AlreadyClean);
    }

    #[test]
    fn different_accounts_are_tracked_independently() {
        let dir = tempfile::tempdir().unwrap();
        ensure_clean(dir.path(), "acct-1", &[]).unwrap();
        let status = ensure_clean(dir.path(), "acct-2", &[]).unwrap();
        assert_eq!(status, CleanSyncStatus::PerformedBy(vec!["acct-2".to_string()]));
    }
}
