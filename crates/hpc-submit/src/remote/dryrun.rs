//! In-memory platform implementation for dry runs.
//!
//! Performs no network I/O: jobs get synthetic ids, uploads and
//! downloads "stream" in fixed chunks so progress reporting and
//! cancellation checkpoints behave like the real thing.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{FileHandle, JobHandle, PlatformApi, ProgressFn, RemoteEntry, RemoteFileInfo};
use crate::error::{Result, SubmitError};
use crate::job::JobSpec;

/// Synthetic chunk count for simulated streams.
const CHUNKS: u64 = 10;

/// No-network [`PlatformApi`] used by `--dry-run` and tests.
pub struct DryRunPlatform {
    next_id: AtomicU64,
    /// Files "uploaded" per folder, for conflict checks and listings.
    folders: Mutex<HashMap<String, Vec<RemoteEntry>>>,
    /// Sizes for scripted downloads, keyed by file id.
    remote_files: Mutex<HashMap<String, RemoteFileInfo>>,
}

impl DryRunPlatform {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            folders: Mutex::new(HashMap::new()),
            remote_files: Mutex::new(HashMap::new()),
        }
    }

    /// Script a remote file so `resolve_download`/`download_file` find it.
    pub fn add_remote_file(&self, file_id: impl Into<String>, name: impl Into<String>, size: u64) {
        let file_id = file_id.into();
        self.remote_files.lock().expect("dry-run state poisoned").insert(
            file_id.clone(),
            RemoteFileInfo {
                file_id,
                name: name.into(),
                size,
            },
        );
    }

    fn next(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn stream(size: u64, progress: &ProgressFn, cancel: &CancellationToken) -> Result<()> {
        let chunk = (size / CHUNKS).max(1);
        let mut transferred = 0u64;
        while transferred < size {
            if cancel.is_cancelled() {
                return Err(SubmitError::Cancelled);
            }
            transferred = (transferred + chunk).min(size);
            progress(transferred, size);
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

impl Default for DryRunPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlatformApi for DryRunPlatform {
    async fn create_job(&self, spec: &JobSpec) -> Result<JobHandle> {
        let job_id = self.next("job");
        debug!("dry-run: created {} for spec {}", job_id, spec.name);
        Ok(JobHandle { job_id })
    }

    async fn submit_job(&self, handle: &JobHandle) -> Result<()> {
        debug!("dry-run: submitted {}", handle.job_id);
        Ok(())
    }

    async fn register_upload(&self, name: &str, size: u64, folder_id: &str) -> Result<FileHandle> {
        let mut folders = self.folders.lock().expect("dry-run state poisoned");
        folders.entry(folder_id.to_string()).or_default().push(RemoteEntry {
            id: self.next("file"),
            name: name.to_string(),
            size,
            is_folder: false,
        });
        Ok(FileHandle {
            upload_id: self.next("upload"),
            folder_id: folder_id.to_string(),
            name: name.to_string(),
        })
    }

    async fn upload_file(
        &self,
        local: &Path,
        handle: &FileHandle,
        progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let size = std::fs::metadata(local)?.len();
        debug!(
            "dry-run: uploading {:?} ({} bytes) as {}",
            local, size, handle.name
        );
        Self::stream(size, &progress, cancel).await
    }

    async fn resolve_download(&self, file_id: &str) -> Result<RemoteFileInfo> {
        self.remote_files
            .lock()
            .expect("dry-run state poisoned")
            .get(file_id)
            .cloned()
            .ok_or_else(|| SubmitError::api("resolve_download", format!("no such file {}", file_id), false))
    }

    async fn download_file(
        &self,
        file_id: &str,
        local: &Path,
        progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let info = self.resolve_download(file_id).await?;
        Self::stream(info.size, &progress, cancel).await?;
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(local, vec![0u8; info.size as usize])?;
        Ok(())
    }

    async fn list_folder(&self, folder_id: &str) -> Result<Vec<RemoteEntry>> {
        Ok(self
            .folders
            .lock()
            .expect("dry-run state poisoned")
            .get(folder_id)
            .cloned()
            .unwrap_or_default())
    }
}
