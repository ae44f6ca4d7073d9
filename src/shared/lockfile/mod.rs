//! Cross-process advisory lock built on an exclusively-created marker file.
//!
//! The marker is zero-length. Its modification time identifies the holder: a guard
//! only removes the marker if it still carries the timestamp observed at creation,
//! so a holder whose lock was reclaimed as stale never deletes its successor's marker.
//!
//! A marker older than `stale_after` is treated as abandoned and removed. A holder
//! that is slow rather than dead can therefore lose mutual exclusion; availability
//! wins over strict exclusion here.

use rand::Rng;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

#[cfg(test)]
mod lockfile_test;

/// Advisory lock parameters.
#[derive(Debug, Clone)]
pub struct LockOptions {
    pub stale_after: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(120),
            max_attempts: 10,
            backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
        }
    }
}

/// Advisory lock on `path`.
#[derive(Debug, Clone)]
pub struct AdvisoryLock {
    path: PathBuf,
    opts: LockOptions,
}

/// Proof of holding an [`AdvisoryLock`].
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    token: SystemTime,
    released: bool,
}

impl AdvisoryLock {
    pub fn new(path: impl Into<PathBuf>, opts: LockOptions) -> Self {
        Self {
            path: path.into(),
            opts,
        }
    }

    /// Lock file sitting next to `target` (`<target>.lock`).
    pub fn beside(target: &Path, opts: LockOptions) -> Self {
        let mut name = target.as_os_str().to_owned();
        name.push(".lock");
        Self::new(PathBuf::from(name), opts)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tries to take the lock, backing off between attempts.
    ///
    /// Returns `None` once attempts are exhausted or the marker cannot be created at all;
    /// callers decide whether to continue without cross-process exclusion.
    pub async fn acquire(&self) -> Option<LockGuard> {
        let attempts = self.opts.max_attempts.max(1);
        let mut delay = self.opts.backoff;

        for attempt in 1..=attempts {
            match self.try_create().await {
                Ok(guard) => return Some(guard),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.remove_if_stale().await {
                        continue;
                    }
                }
                Err(e) => {
                    warn!(
                        component = "lockfile",
                        event = "create_failed",
                        path = ?self.path,
                        error = %e,
                        "cannot create lock marker"
                    );
                    return None;
                }
            }

            if attempt == attempts {
                break;
            }
            tokio::time::sleep(jittered(delay)).await;
            delay = (delay * 2).min(self.opts.max_backoff);
        }

        warn!(
            component = "lockfile",
            event = "acquire_exhausted",
            path = ?self.path,
            attempts,
            "lock not acquired"
        );
        None
    }

    async fn try_create(&self) -> std::io::Result<LockGuard> {
        tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await?;
        let token = tokio::fs::metadata(&self.path).await?.modified()?;
        Ok(LockGuard {
            path: self.path.clone(),
            token,
            released: false,
        })
    }

    /// Removes the marker when it is older than the staleness window.
    async fn remove_if_stale(&self) -> bool {
        let modified = match tokio::fs::metadata(&self.path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            // Vanished between the create attempt and now: retry right away.
            Err(e) if e.kind() == ErrorKind::NotFound => return true,
            Err(_) => return false,
        };
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if age < self.opts.stale_after {
            return false;
        }

        // NotFound means another contender reclaimed it first; either way retry now.
        let _ = tokio::fs::remove_file(&self.path).await;
        warn!(
            component = "lockfile",
            event = "stale_removed",
            path = ?self.path,
            age_secs = age.as_secs(),
            "removed abandoned lock marker"
        );
        true
    }
}

impl LockGuard {
    /// Removes the marker if this guard still owns it.
    pub async fn release(mut self) {
        self.released = true;
        match tokio::fs::metadata(&self.path).await.and_then(|m| m.modified()) {
            Ok(modified) if modified == self.token => {
                if let Err(e) = tokio::fs::remove_file(&self.path).await {
                    warn!(component = "lockfile", event = "release_failed", path = ?self.path, error = %e, "cannot remove lock marker");
                }
            }
            Ok(_) => {
                warn!(component = "lockfile", event = "release_skipped", path = ?self.path, "lock marker was taken over");
            }
            Err(e) => {
                debug!(component = "lockfile", event = "release_missing", path = ?self.path, error = %e, "lock marker already gone");
            }
        }
    }
}

// Last resort for guards dropped without `release` (cancelled task). Blocking fs
// calls; every normal path goes through `release`.
impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Ok(modified) = std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            if modified == self.token {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }
}

fn jittered(d: Duration) -> Duration {
    let ms = d.as_millis() as u64;
    if ms == 0 {
        return d;
    }
    let spread = (ms / 4).max(1);
    Duration::from_millis(ms - spread + rand::thread_rng().gen_range(0..=spread * 2))
}
