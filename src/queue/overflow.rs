//! Best-effort, line-delimited disk spill for jobs the in-memory queue cannot hold.
//!
//! Every touch of the file (append, recovery rewrite) runs inside two locks: an
//! in-process async mutex serializing this store's own operations and an advisory
//! marker file (`<path>.lock`) guarding against other processes.

use serde::Serialize;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::dedlog;
use crate::lockfile::{AdvisoryLock, LockOptions};

use super::job::{Job, Payload};

const COMPONENT: &str = "overflow";

#[derive(Debug, thiserror::Error)]
pub enum OverflowError {
    #[error("overflow file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encode overflow record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl OverflowError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Overflow store parameters.
#[derive(Debug, Clone)]
pub struct OverflowOptions {
    pub path: PathBuf,
    pub recover_interval: Duration,
    pub lock: LockOptions,
}

impl OverflowOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            recover_interval: Duration::from_secs(30),
            lock: LockOptions::default(),
        }
    }
}

/// Result of one recovery pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Jobs admitted back into the live queue.
    pub recovered: u64,
    /// Valid lines kept on disk because the queue filled up.
    pub retained: u64,
    /// Unparseable lines carried over untouched.
    pub malformed: u64,
}

/// Read-only view of the overflow file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OverflowSummary {
    pub records: u64,
    pub malformed: u64,
    pub bytes: u64,
}

/// Append-only overflow log for one queue.
pub struct OverflowStore<T> {
    opts: OverflowOptions,
    local: Mutex<()>,
    lock: AdvisoryLock,
    persisted: AtomicU64,
    recovered: AtomicU64,
    _payload: PhantomData<fn() -> T>,
}

impl<T: Payload> OverflowStore<T> {
    pub fn new(opts: OverflowOptions) -> Self {
        let lock = AdvisoryLock::beside(&opts.path, opts.lock.clone());
        Self {
            opts,
            local: Mutex::new(()),
            lock,
            persisted: AtomicU64::new(0),
            recovered: AtomicU64::new(0),
            _payload: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.opts.path
    }

    pub fn recover_interval(&self) -> Duration {
        self.opts.recover_interval
    }

    /// Jobs written to disk so far.
    pub fn persisted(&self) -> u64 {
        self.persisted.load(Ordering::Relaxed)
    }

    /// Jobs read back into a queue so far.
    pub fn recovered(&self) -> u64 {
        self.recovered.load(Ordering::Relaxed)
    }

    /// Appends one job. Failures are logged and reported as `false`, never raised.
    pub async fn persist(&self, job: &Job<T>) -> bool {
        let _local = self.local.lock().await;
        let guard = self.acquire_cross_process().await;

        let res = self.append(job).await;

        if let Some(guard) = guard {
            guard.release().await;
        }

        match res {
            Ok(()) => {
                self.persisted.fetch_add(1, Ordering::Relaxed);
                debug!(component = COMPONENT, event = "persisted", job_id = job.id, priority = job.priority, "job spilled to disk");
                true
            }
            Err(e) => {
                dedlog::err(COMPONENT, Some(&e as &dyn std::fmt::Display), "failed to persist overflow job");
                false
            }
        }
    }

    async fn append(&self, job: &Job<T>) -> Result<(), OverflowError> {
        let mut line = serde_json::to_vec(job)?;
        line.push(b'\n');

        let path = self.path();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| OverflowError::io(parent, e))?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| OverflowError::io(path, e))?;
        file.write_all(&line).await.map_err(|e| OverflowError::io(path, e))?;
        file.flush().await.map_err(|e| OverflowError::io(path, e))?;
        Ok(())
    }

    /// Streams the file back through `admit`.
    ///
    /// `admit` returns the job when the queue refused it; from then on admission
    /// stops and the remaining lines are copied into the replacement file, which is
    /// renamed over the original. A missing file is a no-op.
    pub async fn recover<F>(&self, mut admit: F) -> Result<RecoveryReport, OverflowError>
    where
        F: FnMut(Job<T>) -> Option<Job<T>>,
    {
        let _local = self.local.lock().await;

        let path = self.path().to_path_buf();
        if !fs::try_exists(&path).await.map_err(|e| OverflowError::io(&path, e))? {
            return Ok(RecoveryReport::default());
        }

        let guard = self.acquire_cross_process().await;
        let res = self.rewrite(&path, &mut admit).await;
        if let Some(guard) = guard {
            guard.release().await;
        }

        let report = match res {
            Ok(report) => report,
            Err(e) => {
                let _ = fs::remove_file(tmp_path_for(&path)).await;
                return Err(e);
            }
        };
        if report.recovered > 0 {
            self.recovered.fetch_add(report.recovered, Ordering::Relaxed);
            info!(
                component = COMPONENT,
                event = "recovered",
                path = ?path,
                recovered = report.recovered,
                retained = report.retained,
                malformed = report.malformed,
                "overflow jobs re-admitted"
            );
        }
        Ok(report)
    }

    async fn rewrite<F>(&self, path: &Path, admit: &mut F) -> Result<RecoveryReport, OverflowError>
    where
        F: FnMut(Job<T>) -> Option<Job<T>>,
    {
        let source = match fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(RecoveryReport::default()),
            Err(e) => return Err(OverflowError::io(path, e)),
        };

        let tmp_path = tmp_path_for(path);
        let tmp = fs::File::create(&tmp_path)
            .await
            .map_err(|e| OverflowError::io(&tmp_path, e))?;
        let mut out = BufWriter::new(tmp);

        let mut report = RecoveryReport::default();
        let mut admitting = true;
        let mut lines = BufReader::new(source).lines();

        while let Some(line) = lines.next_line().await.map_err(|e| OverflowError::io(path, e))? {
            if line.trim().is_empty() {
                continue;
            }

            let keep = match serde_json::from_str::<Job<T>>(&line) {
                Err(_) => {
                    report.malformed += 1;
                    true
                }
                Ok(job) if admitting => match admit(job) {
                    None => {
                        report.recovered += 1;
                        false
                    }
                    Some(_) => {
                        admitting = false;
                        report.retained += 1;
                        true
                    }
                },
                Ok(_) => {
                    report.retained += 1;
                    true
                }
            };

            if keep {
                out.write_all(line.as_bytes())
                    .await
                    .map_err(|e| OverflowError::io(&tmp_path, e))?;
                out.write_all(b"\n")
                    .await
                    .map_err(|e| OverflowError::io(&tmp_path, e))?;
            }
        }

        out.flush().await.map_err(|e| OverflowError::io(&tmp_path, e))?;
        drop(out);

        fs::rename(&tmp_path, path)
            .await
            .map_err(|e| OverflowError::io(path, e))?;
        Ok(report)
    }

    /// Counts records without touching the file or taking locks.
    pub async fn inspect(&self) -> Result<OverflowSummary, OverflowError> {
        let path = self.path();
        let file = match fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(OverflowSummary::default()),
            Err(e) => return Err(OverflowError::io(path, e)),
        };

        let mut summary = OverflowSummary::default();
        let mut lines = BufReader::new(file).lines();
        while let Some(line) = lines.next_line().await.map_err(|e| OverflowError::io(path, e))? {
            if line.trim().is_empty() {
                continue;
            }
            summary.bytes += line.len() as u64 + 1;
            match serde_json::from_str::<Job<T>>(&line) {
                Ok(_) => summary.records += 1,
                Err(_) => summary.malformed += 1,
            }
        }
        Ok(summary)
    }

    async fn acquire_cross_process(&self) -> Option<crate::lockfile::LockGuard> {
        let guard = self.lock.acquire().await;
        if guard.is_none() {
            warn!(
                component = COMPONENT,
                event = "lock_unavailable",
                path = ?self.lock.path(),
                "continuing without cross-process lock"
            );
        }
        guard
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}.tmp", std::process::id()));
    PathBuf::from(name)
}
