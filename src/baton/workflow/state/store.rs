// SPDX-License-Identifier: MIT

//! Persistent storage for the workflow document

use async_trait::async_trait;
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::lock::{FileLock, LockGuard};
use crate::baton::workflow::loader::{validate, WorkflowLoader};
use crate::baton::workflow::types::Workflow;
use crate::common::config::CoordinatorConfig;
use crate::common::error::{BatonError, Result};

/// Access to one workflow document. No policy, only data.
///
/// `save` is a compare-and-swap on `Workflow::version`; callers that need a
/// consistent read-modify-write also hold `lock()` for the whole cycle.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn exists(&self) -> bool;

    async fn load(&self) -> Result<Workflow>;

    /// Persist `workflow`, bumping its version on success
    async fn save(&self, workflow: &mut Workflow) -> Result<()>;

    async fn lock(&self) -> Result<LockGuard>;

    /// Move a finished document out of the way; returns its new path
    async fn archive(&self) -> Result<PathBuf>;
}

#[derive(Deserialize)]
struct VersionProbe {
    #[serde(default)]
    version: u64,
}

/// Workflow document stored as pretty-printed JSON on the local filesystem
pub struct JsonGraphStore {
    path: PathBuf,
    lock: FileLock,
    loader: WorkflowLoader,
}

impl JsonGraphStore {
    pub fn new(
        path: impl Into<PathBuf>,
        lock_timeout: Duration,
        stale_lock_after: Duration,
    ) -> Self {
        let path = path.into();
        let lock = FileLock::new(sidecar(&path, "lock"), lock_timeout, stale_lock_after);
        Self {
            path,
            lock,
            loader: WorkflowLoader::new(),
        }
    }

    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self::new(
            config.workflow_path.clone(),
            config.lock_timeout,
            config.stale_lock_after,
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn disk_version(&self) -> Result<Option<u64>> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => {
                let probe: VersionProbe = serde_json::from_str(&content)
                    .map_err(|e| BatonError::malformed(e.to_string()))?;
                Ok(Some(probe.version))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write to a temporary sibling, sync, then rename over the target
    async fn write_atomic(&self, content: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let tmp_path = sidecar(&self.path, &format!("{}.tmp", std::process::id()));
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(content).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&tmp_path, &self.path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        log::debug!("Atomic write completed: {}", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl GraphStore for JsonGraphStore {
    async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    async fn load(&self) -> Result<Workflow> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BatonError::NotFound(self.path.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        self.loader.parse_json(&content)
    }

    async fn save(&self, workflow: &mut Workflow) -> Result<()> {
        validate(workflow)?;

        let found = self.disk_version().await?.unwrap_or(0);
        if found != workflow.version {
            return Err(BatonError::ConcurrentModification {
                expected: workflow.version,
                found,
            });
        }

        let mut next = workflow.clone();
        next.version += 1;
        next.refresh();

        let mut content = serde_json::to_vec_pretty(&next)?;
        content.push(b'\n');
        self.write_atomic(&content).await?;

        *workflow = next;
        Ok(())
    }

    async fn lock(&self) -> Result<LockGuard> {
        self.lock.acquire().await
    }

    async fn archive(&self) -> Result<PathBuf> {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("workflow");
        let target = self
            .path
            .with_file_name(format!("{}.{}.archived.json", stem, stamp));

        match fs::rename(&self.path, &target).await {
            Ok(()) => {
                log::info!("Archived workflow to {}", target.display());
                Ok(target)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(BatonError::NotFound(self.path.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// `dir/workflow.json` -> `dir/workflow.json.<suffix>`
fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
