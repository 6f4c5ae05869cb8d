// SPDX-License-Identifier: MIT

//! Exclusive lock file held across a load-modify-save cycle
//!
//! The lock is a sidecar file created with create-new semantics. It records
//! the owner's pid and a random token; the guard only removes a lock file
//! that still carries its own token.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::common::error::{BatonError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    token: String,
    acquired_at: DateTime<Utc>,
}

impl LockInfo {
    fn new() -> Self {
        Self {
            pid: std::process::id(),
            token: uuid::Uuid::new_v4().to_string(),
            acquired_at: Utc::now(),
        }
    }

    fn age(&self) -> Duration {
        (Utc::now() - self.acquired_at).to_std().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    timeout: Duration,
    stale_after: Duration,
}

impl FileLock {
    pub fn new(path: PathBuf, timeout: Duration, stale_after: Duration) -> Self {
        Self {
            path,
            timeout,
            stale_after,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until the lock is ours, breaking it if its owner went quiet
    pub async fn acquire(&self) -> Result<LockGuard> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let started = Instant::now();
        loop {
            match self.try_acquire().await {
                Ok(guard) => {
                    log::debug!("Lock acquired: {}", self.path.display());
                    return Ok(guard);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.break_if_stale().await? {
                        continue;
                    }
                    if started.elapsed() >= self.timeout {
                        return Err(BatonError::LockTimeout {
                            path: self.path.clone(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn try_acquire(&self) -> std::io::Result<LockGuard> {
        let info = LockInfo::new();
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await?;

        let content = serde_json::to_vec(&info).map_err(std::io::Error::other)?;
        file.write_all(&content).await?;
        file.sync_all().await?;

        Ok(LockGuard {
            path: self.path.clone(),
            token: info.token,
        })
    }

    /// Remove an abandoned lock. Returns true when a lock was broken.
    async fn break_if_stale(&self) -> Result<bool> {
        let info = match read_info(&self.path).await {
            Ok(Some(info)) => info,
            // Vanished between our attempt and now: just retry
            Ok(None) => return Ok(true),
            // Unreadable (owner died mid-write): fall back to file age
            Err(_) => {
                let modified = fs::metadata(&self.path)
                    .await
                    .ok()
                    .and_then(|m| m.modified().ok());
                let age = modified
                    .and_then(|t| t.elapsed().ok())
                    .unwrap_or_default();
                if age < self.stale_after {
                    return Ok(false);
                }
                log::warn!("Removing unreadable stale lock {}", self.path.display());
                remove_if_present(&self.path).await?;
                return Ok(true);
            }
        };

        if info.age() < self.stale_after {
            return Ok(false);
        }

        // Only remove the exact lock we judged stale
        if let Ok(Some(current)) = read_info(&self.path).await {
            if current.token == info.token {
                log::warn!(
                    "Removing stale lock {} held by pid {} since {}",
                    self.path.display(),
                    info.pid,
                    info.acquired_at
                );
                remove_if_present(&self.path).await?;
            }
        }
        Ok(true)
    }
}

async fn read_info(path: &Path) -> Result<Option<LockInfo>> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Releases the lock on drop
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    token: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let owned = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|content| serde_json::from_str::<LockInfo>(&content).ok())
            .is_some_and(|info| info.token == self.token);

        if owned {
            if let Err(e) = std::fs::remove_file(&self.path) {
                log::warn!("Failed to release lock {}: {}", self.path.display(), e);
            } else {
                log::debug!("Lock released: {}", self.path.display());
            }
        }
    }
}
