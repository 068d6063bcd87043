//! Pipeline engine - per-job stage machine and run coordinator.
//!
//! Drives scanned or supplied job specs through tar -> upload -> create
//! -> submit, bounded by three independently sized worker pools. Every
//! stage transition is recorded on the job's [`JobState`] and persisted
//! before the next stage begins, so a restarted process can reload the
//! state file and present prior progress. One run may be active at a
//! time; a single cancellation token governs the whole run and takes
//! effect at stage checkpoints.

pub mod archive;

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Compression, Config, ConflictMode};
use crate::error::{Result, SubmitError};
use crate::events::{Event, EventBus, EventThrottle, LogLevel, Outcome};
use crate::job::{JobSource, JobSpec, SubmitMode};
use crate::remote::{PlatformApi, ProgressFn};
use crate::scanner::{self, ScanOutcome, ScanRequest};
use crate::state::{
    JobState, RunHeader, RunStats, Stage, StageStatus, StateFile, StateManager,
};

/// Metadata for the single currently active run. Its existence is the
/// sole "run active" signal.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub state_file: PathBuf,
    pub started_at: DateTime<Utc>,
    pub expected_jobs: usize,
    cancel: CancellationToken,
}

impl RunContext {
    /// The token governing this run; cancelling it signals in-flight
    /// per-job work to stop at its next checkpoint.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Result of a pipeline run. Computed, never thrown.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: String,
    pub outcome: Outcome,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub stats: RunStats,
    pub failed_jobs: Vec<String>,
}

impl RunResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Shared handles threaded into each per-job task.
struct JobCtx {
    api: Arc<dyn PlatformApi>,
    state: Arc<StateManager>,
    bus: Arc<EventBus>,
    throttle: Arc<EventThrottle>,
    cancel: CancellationToken,
    tar_sem: Arc<Semaphore>,
    upload_sem: Arc<Semaphore>,
    submit_sem: Arc<Semaphore>,
    retry_limit: usize,
    api_timeout: Duration,
    list_timeout: Duration,
    conflict_mode: ConflictMode,
    compression: Compression,
    staging: PathBuf,
}

/// Pipeline engine. One instance owns the singleton run slot.
pub struct PipelineEngine {
    api: Arc<dyn PlatformApi>,
    config: Config,
    bus: Arc<EventBus>,
    throttle: Arc<EventThrottle>,
    active: Mutex<Option<RunContext>>,
    state: Mutex<Option<Arc<StateManager>>>,
}

impl PipelineEngine {
    pub fn new(api: Arc<dyn PlatformApi>, config: Config, bus: Arc<EventBus>) -> Self {
        let interval = config.transfer.get_progress_interval_ms();
        Self {
            api,
            config,
            bus,
            throttle: Arc::new(EventThrottle::new(Duration::from_millis(interval))),
            active: Mutex::new(None),
            state: Mutex::new(None),
        }
    }

    /// Compose the scanner with a template to produce concrete specs.
    ///
    /// Each match becomes one spec: templated fields copied, the
    /// match's input files substituted as the source, and the name
    /// suffixed with the 1-based match index.
    pub async fn scan_to_specs(
        &self,
        template: &JobSpec,
        mut request: ScanRequest,
    ) -> Result<(Vec<JobSpec>, ScanOutcome)> {
        // Config-level filters apply when the request carries none.
        if request.include.is_empty() {
            request.include = self.config.scan.include.clone();
        }
        if request.exclude.is_empty() {
            request.exclude = self.config.scan.exclude.clone();
        }

        let timeout = Duration::from_secs(self.config.submit.get_scan_timeout_secs());
        let outcome = scanner::scan_with_timeout(request, timeout, Some(self.bus.clone())).await?;

        let specs = outcome
            .matches
            .iter()
            .enumerate()
            .map(|(i, m)| template.instantiate(i + 1, JobSource::Files(m.input_files.clone())))
            .collect();

        Ok((specs, outcome))
    }

    /// Start a run. Fails with [`SubmitError::AlreadyRunning`] (without
    /// touching the existing context) if one is active.
    pub fn start_run(
        &self,
        run_id: impl Into<String>,
        state_file: PathBuf,
        expected_jobs: usize,
    ) -> Result<RunContext> {
        let mut active = self.active.lock().expect("run slot poisoned");
        if active.is_some() {
            return Err(SubmitError::AlreadyRunning);
        }
        let ctx = RunContext {
            run_id: run_id.into(),
            state_file,
            started_at: Utc::now(),
            expected_jobs,
            cancel: CancellationToken::new(),
        };
        info!("starting run {} ({} jobs expected)", ctx.run_id, expected_jobs);
        *active = Some(ctx.clone());
        Ok(ctx)
    }

    /// True iff a run context exists.
    pub fn is_run_active(&self) -> bool {
        self.active.lock().expect("run slot poisoned").is_some()
    }

    /// Clear the run context unconditionally. Idempotent.
    pub fn end_run(&self) {
        let mut active = self.active.lock().expect("run slot poisoned");
        if let Some(ctx) = active.take() {
            // Releases any straggling per-job work.
            ctx.cancel.cancel();
            info!("ended run {}", ctx.run_id);
        }
        self.throttle.clear();
    }

    /// Cancel the active run. Precondition violation if none is active.
    pub fn cancel_run(&self) -> Result<()> {
        let active = self.active.lock().expect("run slot poisoned");
        match active.as_ref() {
            Some(ctx) => {
                info!("cancelling run {}", ctx.run_id);
                ctx.cancel.cancel();
                Ok(())
            }
            None => Err(SubmitError::NoActiveRun),
        }
    }

    /// Stats from the current state snapshot.
    pub fn get_run_stats(&self) -> RunStats {
        self.state
            .lock()
            .expect("state slot poisoned")
            .as_ref()
            .map(|m| m.stats())
            .unwrap_or_default()
    }

    /// Snapshot of every job state for the current (or just finished) run.
    pub fn get_job_states(&self) -> Vec<JobState> {
        self.state
            .lock()
            .expect("state slot poisoned")
            .as_ref()
            .map(|m| m.snapshot())
            .unwrap_or_default()
    }

    /// Reload a persisted state file; the file is authoritative for
    /// what happened in a previous process.
    pub fn load_history(path: &std::path::Path) -> Result<StateFile> {
        StateFile::load(path)
    }

    /// Drive the per-job stage machine for every spec under the active
    /// run's context. Per-job failures are captured on their JobState
    /// and never propagate out of the run; the aggregate outcome is
    /// computed from the final stats.
    pub async fn run_from_specs(&self, specs: Vec<JobSpec>) -> Result<RunResult> {
        let ctx = self
            .active
            .lock()
            .expect("run slot poisoned")
            .clone()
            .ok_or(SubmitError::NoActiveRun)?;

        let header = RunHeader {
            run_id: ctx.run_id.clone(),
            config_hash: self.config.hash(),
            started_at: ctx.started_at,
            expected_jobs: ctx.expected_jobs,
        };
        let states: Vec<JobState> = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let directory = match &spec.source {
                    JobSource::Directory(dir) => Some(dir.clone()),
                    JobSource::Files(files) => {
                        files.first().and_then(|f| f.parent().map(PathBuf::from))
                    }
                };
                JobState::new(i, spec.name.clone(), directory)
            })
            .collect();

        let manager = Arc::new(StateManager::create(
            ctx.state_file.clone(),
            header,
            states,
        )?);
        *self.state.lock().expect("state slot poisoned") = Some(manager.clone());

        let staging = std::env::temp_dir().join(format!("hpc-submit-{}", ctx.run_id));
        let job_ctx = Arc::new(JobCtx {
            api: self.api.clone(),
            state: manager.clone(),
            bus: self.bus.clone(),
            throttle: self.throttle.clone(),
            cancel: ctx.cancel_token(),
            tar_sem: Arc::new(Semaphore::new(self.config.submit.get_tar_workers())),
            upload_sem: Arc::new(Semaphore::new(self.config.submit.get_upload_workers())),
            submit_sem: Arc::new(Semaphore::new(self.config.submit.get_submit_workers())),
            retry_limit: self.config.submit.get_retry_limit(),
            api_timeout: Duration::from_secs(self.config.submit.get_api_timeout_secs()),
            list_timeout: Duration::from_secs(self.config.submit.get_api_list_timeout_secs()),
            conflict_mode: self.config.submit.conflict_mode,
            compression: self.config.submit.compression,
            staging,
        });

        info!(
            "running {} jobs (tar={}, upload={}, submit={} workers)",
            specs.len(),
            self.config.submit.get_tar_workers(),
            self.config.submit.get_upload_workers(),
            self.config.submit.get_submit_workers(),
        );
        self.bus.publish(Event::log(
            LogLevel::Info,
            format!("run {} started with {} jobs", ctx.run_id, specs.len()),
        ));

        let handles: Vec<_> = specs
            .into_iter()
            .enumerate()
            .map(|(index, spec)| {
                let job_ctx = job_ctx.clone();
                tokio::spawn(async move { run_job(job_ctx, index, spec).await })
            })
            .collect();

        for join_result in futures::future::join_all(handles).await {
            if let Err(e) = join_result {
                warn!("job task panicked: {}", e);
            }
        }

        let completed_at = Utc::now();
        let stats = manager.stats();
        let outcome = if ctx.cancel.is_cancelled() {
            Outcome::Cancelled
        } else if stats.failed > 0 {
            Outcome::Failed
        } else {
            Outcome::Completed
        };

        let failed_jobs = manager
            .snapshot()
            .into_iter()
            .filter(|j| j.outcome() == crate::state::JobOutcome::Failed)
            .map(|j| j.name)
            .collect();

        let result = RunResult {
            run_id: ctx.run_id.clone(),
            outcome,
            started_at: ctx.started_at,
            completed_at,
            duration_seconds: (completed_at - ctx.started_at).num_milliseconds() as f64 / 1000.0,
            stats,
            failed_jobs,
        };

        self.bus.publish(Event::complete(ctx.run_id, outcome));
        info!(
            "run {}: {:?} ({} completed, {} failed, {} pending, {} cancelled)",
            result.run_id,
            result.outcome,
            stats.completed,
            stats.failed,
            stats.pending,
            stats.cancelled
        );

        Ok(result)
    }
}

/// Acquire a stage permit, or bail out when the run is cancelled first.
async fn acquire(
    sem: &Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Result<tokio::sync::OwnedSemaphorePermit> {
    tokio::select! {
        permit = sem.clone().acquire_owned() => {
            permit.map_err(|_| SubmitError::Cancelled)
        }
        _ = cancel.cancelled() => Err(SubmitError::Cancelled),
    }
}

/// Retry transient failures up to `limit` extra attempts.
async fn retry<T, Fut, F>(limit: usize, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < limit => {
                attempt += 1;
                warn!("transient failure (attempt {}/{}): {}", attempt, limit, e);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Wrap an API call in its timeout class. A timeout is reported as an
/// ordinary (transient) stage failure, distinct from run cancellation.
async fn with_timeout<T, Fut>(duration: Duration, operation: &str, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(SubmitError::timeout(operation)),
    }
}

/// Record a stage transition: serialized state mutation, persisted
/// before the next stage begins, mirrored onto the bus. A failed
/// persist is logged and surfaced as an event; in-memory state stays
/// authoritative for the live run.
fn set_stage(ctx: &JobCtx, index: usize, job: &str, stage: Stage, status: StageStatus) {
    let persisted = ctx.state.update(index, |state| match stage {
        Stage::Tar => state.tar_status = status,
        Stage::Upload => state.upload_status = status,
        Stage::Submit => state.submit_status = status,
    });
    if let Err(e) = persisted {
        warn!("state persist failed for {}: {}", job, e);
        ctx.bus
            .publish(Event::error("state", format!("persist failed: {}", e)));
    }
    ctx.bus.publish(Event::state_change(job, stage.name(), status));
}

fn fail_stage(ctx: &JobCtx, index: usize, job: &str, stage: Stage, error: &SubmitError) {
    let message = error.to_string();
    if let Err(e) = ctx.state.update(index, |state| {
        state.mark_failed(stage, &message);
    }) {
        warn!("state persist failed for {}: {}", job, e);
    }
    ctx.bus.publish(Event::state_change(job, stage.name(), StageStatus::Failed));
    ctx.bus.publish(Event::error(
        format!("{}:{}", job, stage.name()),
        message,
    ));
}

fn cancel_stage(ctx: &JobCtx, index: usize, job: &str, stage: Stage) {
    if let Err(e) = ctx.state.update(index, |state| state.mark_cancelled(stage)) {
        warn!("state persist failed for {}: {}", job, e);
    }
    ctx.bus
        .publish(Event::state_change(job, stage.name(), StageStatus::Cancelled));
}

/// Destination folder for a job's input files.
fn job_folder(spec: &JobSpec) -> String {
    format!("{}/{}", spec.project_id, spec.name)
}

/// The per-job stage machine: tar -> upload -> create -> submit.
///
/// A job that has not yet acquired its first stage permit when the run
/// is cancelled is left pending (it "never started"); after that,
/// cancellation is recorded on the stage it interrupted.
async fn run_job(ctx: Arc<JobCtx>, index: usize, spec: JobSpec) {
    let job = spec.name.clone();

    // --- Tar ---------------------------------------------------------
    let mut started = false;
    let archive_path = if spec.needs_archive() {
        let permit = match acquire(&ctx.tar_sem, &ctx.cancel).await {
            Ok(permit) => permit,
            Err(_) => return, // never started
        };
        started = true;
        set_stage(&ctx, index, &job, Stage::Tar, StageStatus::Running);

        let dir = match &spec.source {
            JobSource::Directory(dir) => dir.clone(),
            JobSource::Files(_) => unreachable!("needs_archive is directory-only"),
        };
        let dest = ctx
            .staging
            .join(format!("{}.{}", job, archive::archive_extension(ctx.compression)));
        let compression = ctx.compression;
        let dest_clone = dest.clone();
        let result = tokio::task::spawn_blocking(move || {
            archive::archive_directory(&dir, &dest_clone, compression)
        })
        .await
        .unwrap_or_else(|e| Err(SubmitError::transfer(job.clone(), format!("tar task failed: {}", e))));
        drop(permit);

        match result {
            Ok(size) => {
                debug!("{}: archived {} bytes", job, size);
                set_stage(&ctx, index, &job, Stage::Tar, StageStatus::Completed);
                Some(dest)
            }
            Err(e) => {
                fail_stage(&ctx, index, &job, Stage::Tar, &e);
                return;
            }
        }
    } else {
        None
    };

    // --- Upload ------------------------------------------------------
    let permit = match acquire(&ctx.upload_sem, &ctx.cancel).await {
        Ok(permit) => permit,
        Err(_) => {
            if started {
                cancel_stage(&ctx, index, &job, Stage::Upload);
            }
            return;
        }
    };
    if !spec.needs_archive() {
        // Archiving is directory-only; explicit input files skip it.
        set_stage(&ctx, index, &job, Stage::Tar, StageStatus::Skipped);
    }
    set_stage(&ctx, index, &job, Stage::Upload, StageStatus::Running);

    let files: Vec<PathBuf> = match (&archive_path, &spec.source) {
        (Some(archive), _) => vec![archive.clone()],
        (None, JobSource::Files(files)) => files.clone(),
        (None, JobSource::Directory(_)) => unreachable!("directory jobs are archived"),
    };

    match upload_files(&ctx, index, &spec, &files).await {
        Ok(()) => {
            if let Err(e) = ctx.state.update(index, |state| {
                state.upload_status = StageStatus::Completed;
                state.upload_progress = 1.0;
            }) {
                warn!("state persist failed for {}: {}", job, e);
            }
            ctx.bus
                .publish(Event::state_change(&job, Stage::Upload.name(), StageStatus::Completed));
            ctx.throttle.clear_key(&job);
        }
        Err(SubmitError::Cancelled) => {
            cancel_stage(&ctx, index, &job, Stage::Upload);
            ctx.throttle.clear_key(&job);
            cleanup_archive(&archive_path);
            return;
        }
        Err(e) => {
            fail_stage(&ctx, index, &job, Stage::Upload, &e);
            ctx.throttle.clear_key(&job);
            cleanup_archive(&archive_path);
            return;
        }
    }
    drop(permit);
    cleanup_archive(&archive_path);

    // --- Create + Submit ---------------------------------------------
    let permit = match acquire(&ctx.submit_sem, &ctx.cancel).await {
        Ok(permit) => permit,
        Err(_) => {
            cancel_stage(&ctx, index, &job, Stage::Submit);
            return;
        }
    };
    set_stage(&ctx, index, &job, Stage::Submit, StageStatus::Running);

    let handle = match retry(ctx.retry_limit, || {
        with_timeout(ctx.api_timeout, "create_job", ctx.api.create_job(&spec))
    })
    .await
    {
        Ok(handle) => handle,
        Err(SubmitError::Cancelled) => {
            cancel_stage(&ctx, index, &job, Stage::Submit);
            return;
        }
        Err(e) => {
            fail_stage(&ctx, index, &job, Stage::Submit, &e);
            return;
        }
    };
    if let Err(e) = ctx.state.update(index, |state| {
        state.job_id = Some(handle.job_id.clone());
    }) {
        warn!("state persist failed for {}: {}", job, e);
    }

    match spec.submit_mode {
        SubmitMode::Submit => {
            match retry(ctx.retry_limit, || {
                with_timeout(ctx.api_timeout, "submit_job", ctx.api.submit_job(&handle))
            })
            .await
            {
                Ok(()) => {
                    info!("{}: submitted as {}", job, handle.job_id);
                    set_stage(&ctx, index, &job, Stage::Submit, StageStatus::Completed);
                }
                Err(SubmitError::Cancelled) => {
                    cancel_stage(&ctx, index, &job, Stage::Submit);
                }
                Err(e) => fail_stage(&ctx, index, &job, Stage::Submit, &e),
            }
        }
        SubmitMode::CreateOnly => {
            // Created but intentionally left unsubmitted.
            info!("{}: created as {} (not submitted)", job, handle.job_id);
            set_stage(&ctx, index, &job, Stage::Submit, StageStatus::Skipped);
        }
    }
    drop(permit);
}

/// Upload every input file, reporting fractional progress across the
/// whole set under the job's throttle key.
async fn upload_files(
    ctx: &Arc<JobCtx>,
    index: usize,
    spec: &JobSpec,
    files: &[PathBuf],
) -> Result<()> {
    let folder = job_folder(spec);
    let job = spec.name.clone();

    // Size is known up front for the aggregate fraction.
    let mut sizes = Vec::with_capacity(files.len());
    for file in files {
        sizes.push(std::fs::metadata(file)?.len());
    }
    let total: u64 = sizes.iter().sum();

    if ctx.conflict_mode == ConflictMode::CheckBeforeUpload {
        let listing = retry(ctx.retry_limit, || {
            with_timeout(ctx.list_timeout, "list_folder", ctx.api.list_folder(&folder))
        })
        .await?;
        ctx.bus.publish(Event::Enumeration {
            at: Utc::now(),
            folder_id: folder.clone(),
            entries: listing.len(),
            done: true,
        });
        for file in files {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if listing.iter().any(|entry| entry.name == name) {
                return Err(SubmitError::transfer(
                    name.clone(),
                    format!("already exists in {}", folder),
                ));
            }
        }
    }

    let mut done: u64 = 0;
    for (file, size) in files.iter().zip(&sizes) {
        if ctx.cancel.is_cancelled() {
            return Err(SubmitError::Cancelled);
        }
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input".to_string());

        let base = done;
        let ctx_for_progress = ctx.clone();
        let job_for_progress = job.clone();
        let progress: ProgressFn = Arc::new(move |transferred, _file_total| {
            let fraction = if total == 0 {
                1.0
            } else {
                (base + transferred) as f64 / total as f64
            };
            if ctx_for_progress.throttle.allow(&job_for_progress) {
                if let Err(e) = ctx_for_progress.state.update(index, |state| {
                    state.upload_progress = fraction;
                }) {
                    warn!("state persist failed for {}: {}", job_for_progress, e);
                }
                ctx_for_progress
                    .bus
                    .publish(Event::progress(&job_for_progress, fraction));
            }
        });

        retry(ctx.retry_limit, || async {
            let handle = with_timeout(
                ctx.api_timeout,
                "register_upload",
                ctx.api.register_upload(&name, *size, &folder),
            )
            .await?;
            ctx.api
                .upload_file(file, &handle, progress.clone(), &ctx.cancel)
                .await
        })
        .await?;

        done += size;
    }

    Ok(())
}

fn cleanup_archive(path: &Option<PathBuf>) {
    if let Some(path) = path {
        if let Err(e) = std::fs::remove_file(path) {
            debug!("could not remove staged archive {:?}: {}", path, e);
        }
    }
}
