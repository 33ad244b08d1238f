//! Lock-scoped atomic mutation of one JSONL collection file.

use crate::document::Document;
use crate::error::BackendError;
use crate::jsonl::{read_documents_from_path, write_documents_to_path};
use chrono::Utc;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

const LOCK_ATTEMPTS: u32 = 200;
const LOCK_BACKOFF_BASE: Duration = Duration::from_millis(2);
const LOCK_BACKOFF_MAX: Duration = Duration::from_millis(50);
/// A lock file older than this is left over from a crashed writer.
const STALE_LOCK_AGE: Duration = Duration::from_secs(30);
const TOKEN_PREFIX: &str = "token=";

pub fn collection_lock_path(collection_path: &Path) -> PathBuf {
    let mut path: OsString = collection_path.as_os_str().to_os_string();
    path.push(".lock");
    PathBuf::from(path)
}

/// Execute one lock-scoped mutation against a collection JSONL path.
///
/// The mutator returns `(value, changed)`; `changed=true` persists the
/// collection before the lock is released. Errors from the mutator leave
/// the file untouched.
pub fn mutate_collection_jsonl<T, F>(path: impl AsRef<Path>, mutator: F) -> Result<T, BackendError>
where
    F: FnOnce(&mut Vec<Document>) -> Result<(T, bool), BackendError>,
{
    let path = path.as_ref();
    let _guard = CollectionLockGuard::acquire(path)?;

    let mut documents = read_documents_from_path(path)?;
    let (value, changed) = mutator(&mut documents)?;
    if changed {
        write_documents_to_path(path, &documents)?;
    }
    Ok(value)
}

struct CollectionLockGuard {
    lock_path: PathBuf,
    token: String,
    _file: File,
}

impl CollectionLockGuard {
    fn acquire(path: &Path) -> Result<Self, BackendError> {
        let lock_path = collection_lock_path(path);
        if let Some(parent) = lock_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .map_err(|e| BackendError::Io(0, format!("{}: {e}", lock_path.display())))?;
        }

        let token = Uuid::new_v4().to_string();
        let mut backoff = LOCK_BACKOFF_BASE;
        for attempt in 0..LOCK_ATTEMPTS {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    if let Err(err) = write!(
                        file,
                        "{TOKEN_PREFIX}{token}\npid={}\nutc={}\n",
                        std::process::id(),
                        Utc::now().to_rfc3339()
                    ) {
                        let _ = fs::remove_file(&lock_path);
                        return Err(BackendError::Io(
                            0,
                            format!("{}: {err}", lock_path.display()),
                        ));
                    }
                    return Ok(Self {
                        lock_path,
                        token,
                        _file: file,
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Some(observed) = stale_contents(&lock_path)
                        && break_stale_lock(&lock_path, &observed)
                    {
                        continue;
                    }
                    tracing::trace!(
                        attempt,
                        lock_path = %lock_path.display(),
                        "collection lock busy"
                    );
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(LOCK_BACKOFF_MAX);
                }
                Err(err) => {
                    return Err(BackendError::Io(
                        0,
                        format!("{}: {err}", lock_path.display()),
                    ));
                }
            }
        }

        Err(BackendError::Busy {
            lock_path: lock_path.display().to_string(),
        })
    }
}

fn lock_token(contents: &str) -> Option<&str> {
    contents
        .lines()
        .find_map(|line| line.strip_prefix(TOKEN_PREFIX))
}

fn is_stale(lock_path: &Path) -> bool {
    fs::metadata(lock_path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > STALE_LOCK_AGE)
}

/// Contents of the lock file if it is old enough to be left over.
fn stale_contents(lock_path: &Path) -> Option<String> {
    if !is_stale(lock_path) {
        return None;
    }
    fs::read_to_string(lock_path).ok()
}

/// Remove the lock file judged stale while it held `observed`.
///
/// The file is moved aside to a unique tombstone first. If the tombstone
/// turns out to be a different or fresh lock, another writer replaced the
/// stale one in the meantime and it is linked back into place.
fn break_stale_lock(lock_path: &Path, observed: &str) -> bool {
    let mut tombstone = lock_path.as_os_str().to_os_string();
    tombstone.push(format!(".stale-{}", Uuid::new_v4()));
    let tombstone = PathBuf::from(tombstone);
    if fs::rename(lock_path, &tombstone).is_err() {
        return false;
    }

    let taken = fs::read_to_string(&tombstone).ok();
    if taken.as_deref() == Some(observed) && is_stale(&tombstone) {
        tracing::warn!(
            lock_path = %lock_path.display(),
            holder = lock_token(observed).unwrap_or("unknown"),
            "removed stale collection lock"
        );
        let _ = fs::remove_file(&tombstone);
        return true;
    }

    if let Err(err) = fs::hard_link(&tombstone, lock_path) {
        tracing::warn!(
            lock_path = %lock_path.display(),
            error = %err,
            "could not restore a live collection lock"
        );
    }
    let _ = fs::remove_file(&tombstone);
    false
}

impl Drop for CollectionLockGuard {
    fn drop(&mut self) {
        match fs::read_to_string(&self.lock_path) {
            Ok(contents) if lock_token(&contents) == Some(self.token.as_str()) => {
                let _ = fs::remove_file(&self.lock_path);
            }
            Ok(_) => tracing::warn!(
                lock_path = %self.lock_path.display(),
                "collection lock was taken over while held"
            ),
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::UNIX_EPOCH;

    fn temp_path(prefix: &str) -> PathBuf {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "gridhub-atomic-{prefix}-{}-{unique}.jsonl",
            std::process::id()
        ))
    }

    #[test]
    fn unchanged_mutation_does_not_create_file() {
        let path = temp_path("unchanged");
        let count = mutate_collection_jsonl(&path, |docs| Ok((docs.len(), false)))
            .expect("mutation should succeed");
        assert_eq!(count, 0);
        assert!(!path.exists());
        assert!(!collection_lock_path(&path).exists());
    }

    #[test]
    fn failed_mutation_keeps_previous_contents() {
        let path = temp_path("failed");
        mutate_collection_jsonl(&path, |docs| {
            docs.push(json!({"_id": 1}).as_object().cloned().expect("object"));
            Ok(((), true))
        })
        .expect("seed");

        let err = mutate_collection_jsonl::<(), _>(&path, |docs| {
            docs.clear();
            Err(BackendError::InvalidDocument("rejected".to_string()))
        })
        .expect_err("mutator error propagates");
        assert!(matches!(err, BackendError::InvalidDocument(_)));

        let docs = read_documents_from_path(&path).expect("read");
        assert_eq!(docs.len(), 1);
        let _ = fs::remove_file(path);
    }

    fn age_lock_file(lock_path: &Path) {
        let file = OpenOptions::new()
            .write(true)
            .open(lock_path)
            .expect("open lock file");
        file.set_modified(SystemTime::now() - Duration::from_secs(120))
            .expect("backdate lock file");
    }

    #[test]
    fn stale_lock_from_crashed_writer_is_broken() {
        let path = temp_path("stale");
        let lock_path = collection_lock_path(&path);
        fs::write(&lock_path, "token=crashed\npid=1\n").expect("write stale lock");
        age_lock_file(&lock_path);

        mutate_collection_jsonl(&path, |docs| {
            docs.push(json!({"_id": 1}).as_object().cloned().expect("object"));
            Ok(((), true))
        })
        .expect("stale lock does not block");
        assert!(!lock_path.exists());
        let _ = fs::remove_file(path);
    }

    #[test]
    fn breaking_keeps_a_lock_that_replaced_the_stale_one() {
        let path = temp_path("replaced");
        let lock_path = collection_lock_path(&path);
        fs::write(&lock_path, "token=fresh\n").expect("write live lock");

        assert!(!break_stale_lock(&lock_path, "token=crashed\n"));
        assert_eq!(
            fs::read_to_string(&lock_path).expect("lock restored"),
            "token=fresh\n"
        );

        age_lock_file(&lock_path);
        assert!(!break_stale_lock(&lock_path, "token=crashed\n"));
        assert!(lock_path.exists());
        assert!(break_stale_lock(&lock_path, "token=fresh\n"));
        assert!(!lock_path.exists());
    }

    #[test]
    fn guard_leaves_a_lock_it_no_longer_owns() {
        let path = temp_path("foreign");
        let guard = CollectionLockGuard::acquire(&path).expect("acquire");
        let lock_path = collection_lock_path(&path);
        let contents = fs::read_to_string(&lock_path).expect("read lock");
        assert_eq!(lock_token(&contents), Some(guard.token.as_str()));

        fs::write(&lock_path, "token=successor\n").expect("take over");
        drop(guard);
        assert_eq!(
            fs::read_to_string(&lock_path).expect("successor lock kept"),
            "token=successor\n"
        );
        let _ = fs::remove_file(lock_path);
    }

    #[test]
    fn concurrent_mutations_serialize_on_the_lock() {
        let path = Arc::new(temp_path("concurrent"));
        let workers: Vec<_> = (0..8)
            .map(|i| {
                let path = Arc::clone(&path);
                thread::spawn(move || {
                    mutate_collection_jsonl(path.as_path(), |docs| {
                        docs.push(json!({"_id": i}).as_object().cloned().expect("object"));
                        Ok(((), true))
                    })
                    .expect("mutation should succeed");
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker should not panic");
        }

        let docs = read_documents_from_path(path.as_path()).expect("read");
        assert_eq!(docs.len(), 8);
        let _ = fs::remove_file(path.as_path());
    }
}
