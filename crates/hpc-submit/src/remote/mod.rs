//! Remote platform API capability.
//!
//! The core owns no wire protocol. Everything it needs from the HPC
//! platform - job creation and submission, upload registration, file
//! download, folder listing - goes through this narrow trait, and every
//! failure is treated uniformly as "stage failed with message X".

mod dryrun;

pub use dryrun::DryRunPlatform;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::job::JobSpec;

/// Handle to a created (possibly not yet submitted) remote job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: String,
}

/// Handle to a registered upload slot.
#[derive(Debug, Clone)]
pub struct FileHandle {
    pub upload_id: String,
    pub folder_id: String,
    pub name: String,
}

/// Metadata for a remote file resolved ahead of a download.
#[derive(Debug, Clone)]
pub struct RemoteFileInfo {
    pub file_id: String,
    pub name: String,
    pub size: u64,
}

/// One entry of a folder listing.
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub is_folder: bool,
}

/// Byte-level progress callback: (transferred, total).
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// The remote platform capability.
///
/// Transfer methods take the cancellation token by value-reference so
/// the checkpoint semantics stay visible at each call site; they are
/// expected to stop at a chunk boundary once the token fires.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// Create the remote job resource for a spec.
    async fn create_job(&self, spec: &JobSpec) -> Result<JobHandle>;

    /// Submit a created job for execution.
    async fn submit_job(&self, handle: &JobHandle) -> Result<()>;

    /// Register an upload slot for a named file of known size.
    async fn register_upload(&self, name: &str, size: u64, folder_id: &str) -> Result<FileHandle>;

    /// Stream a local file into a registered slot.
    async fn upload_file(
        &self,
        local: &Path,
        handle: &FileHandle,
        progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Resolve a remote file id to its metadata (size known up front).
    async fn resolve_download(&self, file_id: &str) -> Result<RemoteFileInfo>;

    /// Stream a remote file to a local path.
    async fn download_file(
        &self,
        file_id: &str,
        local: &Path,
        progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// List a remote folder. Paginated on the wire; callers give this
    /// the longer timeout class.
    async fn list_folder(&self, folder_id: &str) -> Result<Vec<RemoteEntry>>;
}
