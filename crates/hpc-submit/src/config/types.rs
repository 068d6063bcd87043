//! Configuration type definitions with auto-tuning based on system resources.

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in bytes.
    pub total_memory_bytes: u64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        Self {
            total_memory_bytes: sys.total_memory(),
            cpu_cores: sys.cpus().len(),
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_bytes as f64 / (1024.0 * 1024.0 * 1024.0),
            self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Job submission behavior.
    pub submit: SubmitConfig,

    /// Ad hoc transfer service settings.
    #[serde(default)]
    pub transfer: TransferSettings,

    /// Directory scanner settings.
    #[serde(default)]
    pub scan: ScanConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.submit = self.submit.with_auto_tuning(&resources);
        self.transfer = self.transfer.with_auto_tuning(&resources);
        self
    }
}

/// Job submission configuration.
/// Pool sizes use Option<T> to distinguish between "not set" (use
/// auto-tuned default) and "explicitly set" (use provided value).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SubmitConfig {
    /// Project the jobs are billed against.
    #[serde(default)]
    pub project_id: String,

    /// Number of parallel tar workers. Auto-tuned if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tar_workers: Option<usize>,

    /// Number of parallel upload workers. Auto-tuned if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_workers: Option<usize>,

    /// Number of parallel job-submission workers. Auto-tuned if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit_workers: Option<usize>,

    /// Retries per transient API/transport failure (default: 2).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_limit: Option<usize>,

    /// How upload name collisions are handled (default: check_before_upload).
    #[serde(default)]
    pub conflict_mode: ConflictMode,

    /// Archive compression for the tar stage (default: gzip).
    #[serde(default)]
    pub compression: Compression,

    /// Timeout for single remote API calls, seconds (default: 60).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_timeout_secs: Option<u64>,

    /// Timeout for paginated listing calls, seconds (default: 300).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_list_timeout_secs: Option<u64>,

    /// Timeout for a directory scan, seconds (default: 120).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_timeout_secs: Option<u64>,
}

impl SubmitConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        let cores = resources.cpu_cores;

        // Tar is CPU-bound; scale with cores but stay modest.
        if self.tar_workers.is_none() {
            self.tar_workers = Some((cores / 2).clamp(1, 4));
        }

        // Uploads are network-bound; a few concurrent streams saturate
        // most uplinks.
        if self.upload_workers.is_none() {
            self.upload_workers = Some((cores / 2).clamp(2, 6));
        }

        // Submissions are cheap API calls; bounded to be polite to the
        // platform, not by local resources.
        if self.submit_workers.is_none() {
            self.submit_workers = Some(cores.clamp(2, 8));
        }

        info!(
            "Auto-tuned pools: tar={}, upload={}, submit={}",
            self.tar_workers.unwrap(),
            self.upload_workers.unwrap(),
            self.submit_workers.unwrap(),
        );

        self
    }

    // Accessor methods that return the effective value (with fallback
    // defaults). Used when the config hasn't been auto-tuned yet.

    pub fn get_tar_workers(&self) -> usize {
        self.tar_workers.unwrap_or(2)
    }

    pub fn get_upload_workers(&self) -> usize {
        self.upload_workers.unwrap_or(3)
    }

    pub fn get_submit_workers(&self) -> usize {
        self.submit_workers.unwrap_or(4)
    }

    pub fn get_retry_limit(&self) -> usize {
        self.retry_limit.unwrap_or(2)
    }

    pub fn get_api_timeout_secs(&self) -> u64 {
        self.api_timeout_secs.unwrap_or(60)
    }

    pub fn get_api_list_timeout_secs(&self) -> u64 {
        self.api_list_timeout_secs.unwrap_or(300)
    }

    pub fn get_scan_timeout_secs(&self) -> u64 {
        self.scan_timeout_secs.unwrap_or(120)
    }
}

/// Ad hoc transfer service configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransferSettings {
    /// Worker pool size for the standalone transfer queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Retries per transient transfer failure (default: 2).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_limit: Option<usize>,

    /// Minimum interval between progress events per task, milliseconds
    /// (default: 250).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_interval_ms: Option<u64>,
}

impl TransferSettings {
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        if self.workers.is_none() {
            self.workers = Some((resources.cpu_cores / 2).clamp(2, 8));
        }
        self
    }

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(3)
    }

    pub fn get_retry_limit(&self) -> usize {
        self.retry_limit.unwrap_or(2)
    }

    pub fn get_progress_interval_ms(&self) -> u64 {
        self.progress_interval_ms.unwrap_or(250)
    }
}

/// Directory scanner configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScanConfig {
    /// Primary matches to include (glob patterns on the file name).
    #[serde(default)]
    pub include: Vec<String>,

    /// Primary matches to exclude (glob patterns on the file name).
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// How an upload name collision at the destination is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictMode {
    /// List the destination folder before uploading; fail fast on a
    /// name collision.
    #[default]
    CheckBeforeUpload,

    /// Upload unconditionally and map the platform's conflict error.
    FailThenResolve,
}

/// Archive compression for the tar stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    /// Gzip-compressed tarball (.tar.gz).
    #[default]
    Gzip,

    /// Plain uncompressed tarball (.tar).
    None,
}
