//! Generic concurrent transfer queue.
//!
//! A fixed-size worker pool pulls task ids from an internal queue; each
//! worker owns one task at a time. The service is usable standalone and
//! by the pipeline, with per-task and global cooperative cancellation,
//! transparent retries for transient transport errors, and throttled
//! progress reporting (terminal transitions always delivered).

mod task;

pub use task::{
    TransferKind, TransferQueueStats, TransferRequest, TransferState, TransferTask,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TransferSettings;
use crate::error::{Result, SubmitError};
use crate::events::{Event, EventBus, EventThrottle};
use crate::remote::{PlatformApi, ProgressFn};

struct TaskEntry {
    task: TransferTask,
    request: TransferRequest,
    cancel: CancellationToken,
    pause_requested: Arc<AtomicBool>,
    seq: u64,
    started: Option<Instant>,
}

struct ServiceInner {
    api: Arc<dyn PlatformApi>,
    bus: Arc<EventBus>,
    throttle: EventThrottle,
    retry_limit: usize,
    tasks: Mutex<HashMap<Uuid, TaskEntry>>,
    queue_tx: async_channel::Sender<Uuid>,
    next_seq: AtomicU64,
}

/// How one execution attempt ended.
enum Finished {
    Completed,
    Paused,
    Cancelled,
    Failed(SubmitError),
}

/// Bounded-concurrency transfer service.
pub struct TransferService {
    inner: Arc<ServiceInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TransferService {
    /// Create the service and spawn its worker pool.
    pub fn new(
        api: Arc<dyn PlatformApi>,
        bus: Arc<EventBus>,
        settings: &TransferSettings,
    ) -> Self {
        let (queue_tx, queue_rx) = async_channel::unbounded::<Uuid>();

        let inner = Arc::new(ServiceInner {
            api,
            bus,
            throttle: EventThrottle::new(Duration::from_millis(
                settings.get_progress_interval_ms(),
            )),
            retry_limit: settings.get_retry_limit(),
            tasks: Mutex::new(HashMap::new()),
            queue_tx,
            next_seq: AtomicU64::new(0),
        });

        let pool_size = settings.get_workers();
        info!("starting transfer service with {} workers", pool_size);

        let workers = (0..pool_size)
            .map(|worker_id| {
                let inner = inner.clone();
                let rx = queue_rx.clone();
                tokio::spawn(async move {
                    while let Ok(id) = rx.recv().await {
                        inner.run_task(id).await;
                    }
                    debug!("transfer worker {} stopped", worker_id);
                })
            })
            .collect();

        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueue transfers, returning their task ids immediately.
    pub fn start_transfers(&self, requests: Vec<TransferRequest>) -> Vec<Uuid> {
        requests
            .into_iter()
            .map(|request| self.inner.enqueue(request))
            .collect()
    }

    /// Cooperatively cancel one task. No-op on terminal tasks.
    pub fn cancel_transfer(&self, id: Uuid) {
        self.inner.cancel(id);
    }

    /// Cancel every non-terminal task.
    pub fn cancel_all(&self) {
        let ids: Vec<Uuid> = {
            let tasks = self.inner.tasks.lock().expect("transfer registry poisoned");
            tasks
                .iter()
                .filter(|(_, e)| !e.task.state.is_terminal())
                .map(|(id, _)| *id)
                .collect()
        };
        for id in ids {
            self.inner.cancel(id);
        }
    }

    /// Pause an active task at its next checkpoint.
    pub fn pause_transfer(&self, id: Uuid) {
        let tasks = self.inner.tasks.lock().expect("transfer registry poisoned");
        if let Some(entry) = tasks.get(&id) {
            if matches!(entry.task.state, TransferState::Active) {
                entry.pause_requested.store(true, Ordering::Relaxed);
                entry.cancel.cancel();
            }
        }
    }

    /// Re-queue a paused task.
    pub fn resume_transfer(&self, id: Uuid) {
        let mut tasks = self.inner.tasks.lock().expect("transfer registry poisoned");
        if let Some(entry) = tasks.get_mut(&id) {
            if entry.task.state == TransferState::Paused {
                entry.cancel = CancellationToken::new();
                entry.pause_requested.store(false, Ordering::Relaxed);
                entry.task.state = TransferState::Queued;
                entry.task.transferred_bytes = 0;
                let _ = self.inner.queue_tx.try_send(id);
            }
        }
    }

    /// Re-queue a failed or cancelled task under a fresh id, preserving
    /// the original request. The original task stays in history.
    pub fn retry_transfer(&self, id: Uuid) -> Result<Uuid> {
        let request = {
            let tasks = self.inner.tasks.lock().expect("transfer registry poisoned");
            let entry = tasks
                .get(&id)
                .ok_or_else(|| SubmitError::transfer(id.to_string(), "no such transfer"))?;
            if !matches!(
                entry.task.state,
                TransferState::Failed | TransferState::Cancelled
            ) {
                return Err(SubmitError::transfer(
                    entry.task.name.clone(),
                    "only failed or cancelled transfers can be retried",
                ));
            }
            entry.request.clone()
        };
        Ok(self.inner.enqueue(request))
    }

    /// Per-state counts.
    pub fn get_stats(&self) -> TransferQueueStats {
        let tasks = self.inner.tasks.lock().expect("transfer registry poisoned");
        let mut stats = TransferQueueStats::default();
        for entry in tasks.values() {
            stats.count(entry.task.state);
        }
        stats
    }

    /// Stable snapshot of every task, in enqueue order.
    pub fn get_tasks(&self) -> Vec<TransferTask> {
        let tasks = self.inner.tasks.lock().expect("transfer registry poisoned");
        let mut entries: Vec<(u64, TransferTask)> = tasks
            .values()
            .map(|e| (e.seq, e.task.clone()))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, task)| task).collect()
    }

    /// One task by id.
    pub fn get_task(&self, id: Uuid) -> Option<TransferTask> {
        let tasks = self.inner.tasks.lock().expect("transfer registry poisoned");
        tasks.get(&id).map(|e| e.task.clone())
    }

    /// Drop terminal tasks from the registry.
    pub fn clear_completed(&self) {
        let mut tasks = self.inner.tasks.lock().expect("transfer registry poisoned");
        tasks.retain(|id, entry| {
            let keep = !entry.task.state.is_terminal();
            if !keep {
                self.inner.throttle.clear_key(&id.to_string());
            }
            keep
        });
    }

    /// Stop accepting work and wait for the workers to drain.
    pub async fn shutdown(&self) {
        self.inner.queue_tx.close();
        let workers: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.workers.lock().expect("transfer workers poisoned"));
        for worker in workers {
            let _ = worker.await;
        }
        self.inner.throttle.clear();
    }
}

impl ServiceInner {
    fn enqueue(&self, request: TransferRequest) -> Uuid {
        let id = Uuid::new_v4();
        let entry = TaskEntry {
            task: TransferTask::from_request(id, &request),
            request,
            cancel: CancellationToken::new(),
            pause_requested: Arc::new(AtomicBool::new(false)),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            started: None,
        };
        self.tasks
            .lock()
            .expect("transfer registry poisoned")
            .insert(id, entry);
        // Unbounded queue: only fails once the service is shut down.
        let _ = self.queue_tx.try_send(id);
        id
    }

    fn cancel(&self, id: Uuid) {
        let mut tasks = self.tasks.lock().expect("transfer registry poisoned");
        let Some(entry) = tasks.get_mut(&id) else {
            return;
        };
        match entry.task.state {
            // Not owned by a worker right now: finalize directly.
            TransferState::Queued | TransferState::Paused => {
                entry.cancel.cancel();
                entry.task.state = TransferState::Cancelled;
                let event = transfer_event(&entry.task);
                self.throttle.clear_key(&id.to_string());
                drop(tasks);
                self.bus.publish(event);
            }
            // A worker owns it: signal and let the worker finalize at
            // its next checkpoint.
            TransferState::Initializing | TransferState::Active => {
                entry.cancel.cancel();
            }
            _ => {}
        }
    }

    async fn run_task(self: &Arc<Self>, id: Uuid) {
        let (request, cancel, pause_requested) = {
            let mut tasks = self.tasks.lock().expect("transfer registry poisoned");
            let Some(entry) = tasks.get_mut(&id) else {
                return;
            };
            // Cancelled (or otherwise moved on) while still queued.
            if entry.task.state != TransferState::Queued {
                return;
            }
            entry.task.state = TransferState::Initializing;
            entry.started = Some(Instant::now());
            (
                entry.request.clone(),
                entry.cancel.clone(),
                entry.pause_requested.clone(),
            )
        };
        self.publish_snapshot(id);

        let mut attempt = 0;
        let outcome = loop {
            match self.execute_attempt(id, &request, &cancel).await {
                Ok(()) => break Finished::Completed,
                Err(SubmitError::Cancelled) => {
                    if pause_requested.load(Ordering::Relaxed) {
                        break Finished::Paused;
                    }
                    break Finished::Cancelled;
                }
                Err(e) if e.is_transient() && attempt < self.retry_limit => {
                    attempt += 1;
                    warn!(
                        "transfer {}: transient failure (attempt {}/{}): {}",
                        id, attempt, self.retry_limit, e
                    );
                }
                Err(e) => break Finished::Failed(e),
            }
        };

        let (event, failure) = {
            let mut tasks = self.tasks.lock().expect("transfer registry poisoned");
            let Some(entry) = tasks.get_mut(&id) else {
                return;
            };
            let mut failure = None;
            match outcome {
                Finished::Completed => {
                    entry.task.state = TransferState::Completed;
                    entry.task.transferred_bytes = entry.task.total_bytes;
                    entry.task.error = None;
                }
                Finished::Paused => {
                    entry.task.state = TransferState::Paused;
                }
                Finished::Cancelled => {
                    entry.task.state = TransferState::Cancelled;
                }
                Finished::Failed(e) => {
                    let message = e.to_string();
                    entry.task.state = TransferState::Failed;
                    entry.task.error = Some(message.clone());
                    failure = Some((entry.task.name.clone(), message));
                }
            }
            (transfer_event(&entry.task), failure)
        };

        // State transitions are always delivered, uncapped, so
        // observers never show stale in-progress after completion.
        self.throttle.clear_key(&id.to_string());
        self.bus.publish(event);
        if let Some((name, message)) = failure {
            self.bus.publish(Event::error(format!("transfer:{}", name), message));
        }
    }

    async fn execute_attempt(
        self: &Arc<Self>,
        id: Uuid,
        request: &TransferRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(SubmitError::Cancelled);
        }

        match request {
            TransferRequest::Upload {
                local_path,
                folder_id,
            } => {
                let size = std::fs::metadata(local_path)?.len();
                let name = request.name();
                let handle = self.api.register_upload(&name, size, folder_id).await?;
                self.set_active(id, size);
                let progress = self.progress_fn(id);
                self.api
                    .upload_file(local_path, &handle, progress, cancel)
                    .await
            }
            TransferRequest::Download {
                file_id,
                local_path,
            } => {
                let info = self.api.resolve_download(file_id).await?;
                self.set_active(id, info.size);
                let progress = self.progress_fn(id);
                self.api
                    .download_file(file_id, local_path, progress, cancel)
                    .await
            }
        }
    }

    /// Transition into `active` once the transport handshake succeeded.
    fn set_active(self: &Arc<Self>, id: Uuid, total_bytes: u64) {
        {
            let mut tasks = self.tasks.lock().expect("transfer registry poisoned");
            if let Some(entry) = tasks.get_mut(&id) {
                entry.task.state = TransferState::Active;
                entry.task.total_bytes = total_bytes;
                entry.task.transferred_bytes = 0;
                entry.started = Some(Instant::now());
            }
        }
        self.publish_snapshot(id);
    }

    fn progress_fn(self: &Arc<Self>, id: Uuid) -> ProgressFn {
        let inner = self.clone();
        Arc::new(move |transferred, total| {
            let snapshot = {
                let mut tasks = inner.tasks.lock().expect("transfer registry poisoned");
                let Some(entry) = tasks.get_mut(&id) else {
                    return;
                };
                entry.task.transferred_bytes = transferred;
                entry.task.total_bytes = total;
                if let Some(started) = entry.started {
                    let elapsed = started.elapsed().as_secs_f64();
                    if elapsed > 0.0 {
                        entry.task.speed_bps = transferred as f64 / elapsed;
                    }
                }
                entry.task.clone()
            };
            if inner.throttle.allow(&id.to_string()) {
                inner.bus.publish(transfer_event(&snapshot));
            }
        })
    }

    fn publish_snapshot(self: &Arc<Self>, id: Uuid) {
        let snapshot = {
            let tasks = self.tasks.lock().expect("transfer registry poisoned");
            tasks.get(&id).map(|e| e.task.clone())
        };
        if let Some(task) = snapshot {
            self.bus.publish(transfer_event(&task));
        }
    }
}

fn transfer_event(task: &TransferTask) -> Event {
    Event::Transfer {
        at: chrono::Utc::now(),
        task_id: task.id,
        state: task.state,
        transferred_bytes: task.transferred_bytes,
        total_bytes: task.total_bytes,
        speed_bps: task.speed_bps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobSpec;
    use crate::remote::{FileHandle, JobHandle, RemoteEntry, RemoteFileInfo};
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    /// Platform whose uploads park until a permit is released, so tests
    /// can observe mid-flight states deterministically.
    struct GatedPlatform {
        gate: Semaphore,
        attempts: AtomicUsize,
        /// Upload failures to inject before succeeding (transient).
        fail_first: AtomicUsize,
    }

    impl GatedPlatform {
        fn new() -> Self {
            Self {
                gate: Semaphore::new(0),
                attempts: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(0),
            }
        }

        fn failing(times: usize) -> Self {
            let platform = Self::new();
            platform.fail_first.store(times, Ordering::Relaxed);
            platform
        }

        fn release(&self, count: usize) {
            self.gate.add_permits(count);
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl PlatformApi for GatedPlatform {
        async fn create_job(&self, _spec: &JobSpec) -> Result<JobHandle> {
            Ok(JobHandle { job_id: "job-1".into() })
        }

        async fn submit_job(&self, _handle: &JobHandle) -> Result<()> {
            Ok(())
        }

        async fn register_upload(
            &self,
            name: &str,
            _size: u64,
            folder_id: &str,
        ) -> Result<FileHandle> {
            Ok(FileHandle {
                upload_id: "u-1".into(),
                folder_id: folder_id.into(),
                name: name.into(),
            })
        }

        async fn upload_file(
            &self,
            local: &Path,
            _handle: &FileHandle,
            progress: ProgressFn,
            cancel: &CancellationToken,
        ) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            let remaining = self.fail_first.load(Ordering::Relaxed);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::Relaxed);
                return Err(SubmitError::api("upload_file", "connection reset", true));
            }

            let size = std::fs::metadata(local)?.len();
            progress(size / 2, size);
            tokio::select! {
                permit = self.gate.acquire() => {
                    permit.expect("gate closed").forget();
                    progress(size, size);
                    Ok(())
                }
                _ = cancel.cancelled() => Err(SubmitError::Cancelled),
            }
        }

        async fn resolve_download(&self, file_id: &str) -> Result<RemoteFileInfo> {
            Ok(RemoteFileInfo {
                file_id: file_id.into(),
                name: "result.zip".into(),
                size: 64,
            })
        }

        async fn download_file(
            &self,
            _file_id: &str,
            _local: &Path,
            progress: ProgressFn,
            cancel: &CancellationToken,
        ) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            progress(32, 64);
            tokio::select! {
                permit = self.gate.acquire() => {
                    permit.expect("gate closed").forget();
                    progress(64, 64);
                    Ok(())
                }
                _ = cancel.cancelled() => Err(SubmitError::Cancelled),
            }
        }

        async fn list_folder(&self, _folder_id: &str) -> Result<Vec<RemoteEntry>> {
            Ok(vec![])
        }
    }

    fn settings(workers: usize, retries: usize) -> TransferSettings {
        TransferSettings {
            workers: Some(workers),
            retry_limit: Some(retries),
            progress_interval_ms: Some(1),
        }
    }

    fn upload_request(path: &Path) -> TransferRequest {
        TransferRequest::Upload {
            local_path: path.to_path_buf(),
            folder_id: "folder-1".into(),
        }
    }

    fn temp_input(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, vec![7u8; 256]).unwrap();
        path
    }

    async fn wait_for<F: Fn() -> bool>(condition: F, what: &str) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn test_pool_of_one_keeps_second_task_queued() {
        let dir = tempfile::TempDir::new().unwrap();
        let api = Arc::new(GatedPlatform::new());
        let bus = Arc::new(EventBus::new());
        let service = TransferService::new(api.clone(), bus, &settings(1, 0));

        let a = temp_input(&dir, "a.dat");
        let b = temp_input(&dir, "b.dat");
        let ids = service.start_transfers(vec![upload_request(&a), upload_request(&b)]);
        assert_eq!(ids.len(), 2);

        wait_for(|| service.get_stats().active == 1, "first task active").await;
        let stats = service.get_stats();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.queued, 1);

        // Second task only runs after the first reaches a terminal state.
        api.release(1);
        wait_for(|| service.get_stats().completed == 1, "first completion").await;
        wait_for(|| service.get_stats().active == 1, "second task active").await;
        api.release(1);
        wait_for(|| service.get_stats().completed == 2, "both completed").await;
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_allocates_new_id_and_keeps_original() {
        let dir = tempfile::TempDir::new().unwrap();
        // Fails more times than the retry budget allows.
        let api = Arc::new(GatedPlatform::failing(10));
        let bus = Arc::new(EventBus::new());
        let service = TransferService::new(api.clone(), bus, &settings(1, 1));

        let input = temp_input(&dir, "a.dat");
        let ids = service.start_transfers(vec![upload_request(&input)]);
        let original = ids[0];

        wait_for(|| service.get_stats().failed == 1, "task failure").await;
        // Budget of 1 retry means exactly 2 attempts.
        assert_eq!(api.attempts(), 2);
        let failed = service.get_task(original).unwrap();
        assert!(failed.error.as_deref().unwrap().contains("connection reset"));

        api.fail_first.store(0, Ordering::Relaxed);
        api.release(1);
        let retried = service.retry_transfer(original).unwrap();
        assert_ne!(retried, original);

        wait_for(|| service.get_stats().completed == 1, "retried completion").await;
        let tasks = service.get_tasks();
        assert_eq!(tasks.len(), 2);
        // Original stays failed in history until cleared.
        assert_eq!(service.get_task(original).unwrap().state, TransferState::Failed);
        assert_eq!(service.get_task(retried).unwrap().state, TransferState::Completed);

        service.clear_completed();
        assert!(service.get_tasks().is_empty());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_transient_errors_below_budget_are_invisible() {
        let dir = tempfile::TempDir::new().unwrap();
        let api = Arc::new(GatedPlatform::failing(2));
        let bus = Arc::new(EventBus::new());
        let service = TransferService::new(api.clone(), bus, &settings(1, 2));

        let input = temp_input(&dir, "a.dat");
        api.release(1);
        service.start_transfers(vec![upload_request(&input)]);

        wait_for(|| service.get_stats().completed == 1, "completion").await;
        assert_eq!(api.attempts(), 3);
        // The retries never surfaced as a failed state.
        assert_eq!(service.get_stats().failed, 0);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_active_task() {
        let dir = tempfile::TempDir::new().unwrap();
        let api = Arc::new(GatedPlatform::new());
        let bus = Arc::new(EventBus::new());
        let service = TransferService::new(api.clone(), bus, &settings(1, 3));

        let input = temp_input(&dir, "a.dat");
        let ids = service.start_transfers(vec![upload_request(&input)]);

        wait_for(|| service.get_stats().active == 1, "task active").await;
        service.cancel_transfer(ids[0]);
        wait_for(|| service.get_stats().cancelled == 1, "cancellation").await;
        // A cancellation is not a retryable transient failure.
        assert_eq!(api.attempts(), 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_all_covers_queued_and_active() {
        let dir = tempfile::TempDir::new().unwrap();
        let api = Arc::new(GatedPlatform::new());
        let bus = Arc::new(EventBus::new());
        let service = TransferService::new(api.clone(), bus, &settings(1, 0));

        let a = temp_input(&dir, "a.dat");
        let b = temp_input(&dir, "b.dat");
        service.start_transfers(vec![upload_request(&a), upload_request(&b)]);

        wait_for(|| service.get_stats().active == 1, "first active").await;
        service.cancel_all();
        wait_for(|| service.get_stats().cancelled == 2, "both cancelled").await;
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_terminal_states_are_sticky() {
        let dir = tempfile::TempDir::new().unwrap();
        let api = Arc::new(GatedPlatform::new());
        let bus = Arc::new(EventBus::new());
        let service = TransferService::new(api.clone(), bus, &settings(1, 0));

        let input = temp_input(&dir, "a.dat");
        api.release(1);
        let ids = service.start_transfers(vec![upload_request(&input)]);
        wait_for(|| service.get_stats().completed == 1, "completion").await;

        // No operation other than retry changes a terminal task.
        service.cancel_transfer(ids[0]);
        service.pause_transfer(ids[0]);
        service.resume_transfer(ids[0]);
        assert_eq!(service.get_task(ids[0]).unwrap().state, TransferState::Completed);
        assert!(service.retry_transfer(ids[0]).is_err());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let dir = tempfile::TempDir::new().unwrap();
        let api = Arc::new(GatedPlatform::new());
        let bus = Arc::new(EventBus::new());
        let service = TransferService::new(api.clone(), bus, &settings(1, 0));

        let input = temp_input(&dir, "a.dat");
        let ids = service.start_transfers(vec![upload_request(&input)]);

        wait_for(|| service.get_stats().active == 1, "task active").await;
        service.pause_transfer(ids[0]);
        wait_for(|| service.get_stats().paused == 1, "pause").await;

        api.release(1);
        service.resume_transfer(ids[0]);
        wait_for(|| service.get_stats().completed == 1, "completion after resume").await;
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_terminal_event_always_delivered() {
        let dir = tempfile::TempDir::new().unwrap();
        let api = Arc::new(GatedPlatform::new());
        let bus = Arc::new(EventBus::new());
        let mut sub = bus.subscribe_all();
        // Hour-long throttle interval: every progress event after the
        // first is suppressed, the terminal one must arrive anyway.
        let service = TransferService::new(
            api.clone(),
            bus.clone(),
            &TransferSettings {
                workers: Some(1),
                retry_limit: Some(0),
                progress_interval_ms: Some(3_600_000),
            },
        );

        let input = temp_input(&dir, "a.dat");
        api.release(1);
        service.start_transfers(vec![upload_request(&input)]);
        wait_for(|| service.get_stats().completed == 1, "completion").await;

        let mut saw_completed = false;
        while let Some(event) = sub.try_recv() {
            if let Event::Transfer { state, transferred_bytes, total_bytes, .. } = event {
                if state == TransferState::Completed {
                    saw_completed = true;
                    assert_eq!(transferred_bytes, total_bytes);
                }
            }
        }
        assert!(saw_completed, "terminal transfer event was throttled away");
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_download_resolves_size_up_front() {
        let dir = tempfile::TempDir::new().unwrap();
        let api = Arc::new(GatedPlatform::new());
        let bus = Arc::new(EventBus::new());
        let service = TransferService::new(api.clone(), bus, &settings(1, 0));

        let ids = service.start_transfers(vec![TransferRequest::Download {
            file_id: "file-7".into(),
            local_path: dir.path().join("result.zip"),
        }]);

        wait_for(|| service.get_stats().active == 1, "download active").await;
        assert_eq!(service.get_task(ids[0]).unwrap().total_bytes, 64);
        api.release(1);
        wait_for(|| service.get_stats().completed == 1, "download done").await;
        service.shutdown().await;
    }
}
