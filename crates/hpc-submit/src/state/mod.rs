//! File-based run state for resume capability.
//!
//! One self-describing JSON record per line: a `run` header followed by
//! one `job` record per job. The file is rewritten atomically (temp +
//! rename) as part of every mutation, so the file - not process memory -
//! is authoritative for what happened. Readers skip malformed rows
//! rather than failing the whole read.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SubmitError};

/// Record format version.
const STATE_VERSION: u32 = 1;

/// Status of one pipeline stage for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    /// Stage does not apply (tar for explicit-files jobs, submit for
    /// create-only jobs).
    Skipped,
    Completed,
    Failed,
    Cancelled,
}

impl StageStatus {
    /// Whether the stage finished without needing further work.
    pub fn is_done(&self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Skipped)
    }
}

/// Derived per-job outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Mutable per-job progress record for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    /// Ordinal index within the run.
    pub index: usize,

    /// Job name.
    pub name: String,

    /// Source directory, if the job has one.
    pub directory: Option<PathBuf>,

    /// Tar stage status.
    pub tar_status: StageStatus,

    /// Upload stage status.
    pub upload_status: StageStatus,

    /// Submit stage status (create folded in).
    pub submit_status: StageStatus,

    /// Fractional upload progress, 0.0 to 1.0.
    pub upload_progress: f64,

    /// Remote job id once created.
    pub job_id: Option<String>,

    /// Last error, if any stage failed.
    pub error: Option<String>,
}

impl JobState {
    /// Create a pending state for one job.
    pub fn new(index: usize, name: impl Into<String>, directory: Option<PathBuf>) -> Self {
        Self {
            index,
            name: name.into(),
            directory,
            tar_status: StageStatus::Pending,
            upload_status: StageStatus::Pending,
            submit_status: StageStatus::Pending,
            upload_progress: 0.0,
            job_id: None,
            error: None,
        }
    }

    /// Record a stage failure.
    pub fn mark_failed(&mut self, stage: Stage, error: &str) {
        *self.stage_mut(stage) = StageStatus::Failed;
        self.error = Some(error.to_string());
    }

    /// Record cancellation at a stage checkpoint.
    pub fn mark_cancelled(&mut self, stage: Stage) {
        *self.stage_mut(stage) = StageStatus::Cancelled;
    }

    fn stage_mut(&mut self, stage: Stage) -> &mut StageStatus {
        match stage {
            Stage::Tar => &mut self.tar_status,
            Stage::Upload => &mut self.upload_status,
            Stage::Submit => &mut self.submit_status,
        }
    }

    /// Status of a stage.
    pub fn stage(&self, stage: Stage) -> StageStatus {
        match stage {
            Stage::Tar => self.tar_status,
            Stage::Upload => self.upload_status,
            Stage::Submit => self.submit_status,
        }
    }

    /// Derived outcome across the three stages.
    pub fn outcome(&self) -> JobOutcome {
        let stages = [self.tar_status, self.upload_status, self.submit_status];
        if stages.contains(&StageStatus::Failed) || self.error.is_some() {
            JobOutcome::Failed
        } else if stages.contains(&StageStatus::Cancelled) {
            JobOutcome::Cancelled
        } else if stages.iter().all(StageStatus::is_done) {
            JobOutcome::Completed
        } else if stages.iter().all(|s| *s == StageStatus::Pending) {
            JobOutcome::Pending
        } else {
            JobOutcome::Running
        }
    }
}

/// The per-job pipeline stages, in strict order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Tar,
    Upload,
    Submit,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Tar => "tar",
            Stage::Upload => "upload",
            Stage::Submit => "submit",
        }
    }
}

/// Header record identifying the run a state file belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHeader {
    pub run_id: String,
    pub config_hash: String,
    pub started_at: DateTime<Utc>,
    pub expected_jobs: usize,
}

/// Per-outcome counts over a run's jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub cancelled: usize,
}

impl RunStats {
    /// Compute counts from job states; identical whether the states came
    /// from memory or from a reloaded file.
    pub fn from_states(states: &[JobState]) -> Self {
        let mut stats = RunStats {
            total: states.len(),
            ..Default::default()
        };
        for state in states {
            match state.outcome() {
                JobOutcome::Completed => stats.completed += 1,
                JobOutcome::Failed => stats.failed += 1,
                JobOutcome::Cancelled => stats.cancelled += 1,
                JobOutcome::Pending | JobOutcome::Running => stats.pending += 1,
            }
        }
        stats
    }
}

/// One line of the state file.
#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Record {
    Run {
        v: u32,
        #[serde(flatten)]
        header: RunHeader,
    },
    Job {
        v: u32,
        #[serde(flatten)]
        state: JobState,
    },
}

/// A loaded state file.
#[derive(Debug)]
pub struct StateFile {
    pub header: Option<RunHeader>,
    pub jobs: Vec<JobState>,
    /// Rows skipped because they failed to parse.
    pub malformed_rows: usize,
}

impl StateFile {
    /// Load a state file, skipping malformed rows.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let reader = BufReader::new(file);

        let mut header = None;
        let mut jobs: BTreeMap<usize, JobState> = BTreeMap::new();
        let mut malformed_rows = 0;

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Record>(&line) {
                Ok(Record::Run { header: h, .. }) => header = Some(h),
                Ok(Record::Job { state, .. }) => {
                    // Last record wins for a given index.
                    jobs.insert(state.index, state);
                }
                Err(e) => {
                    warn!(
                        "skipping malformed state row {} in {:?}: {}",
                        line_no + 1,
                        path.as_ref(),
                        e
                    );
                    malformed_rows += 1;
                }
            }
        }

        Ok(Self {
            header,
            jobs: jobs.into_values().collect(),
            malformed_rows,
        })
    }

    /// Validate that the config hash matches for resume.
    pub fn validate_config(&self, config_hash: &str) -> Result<()> {
        match &self.header {
            Some(header) if header.config_hash == config_hash => Ok(()),
            Some(_) => Err(SubmitError::ConfigChanged),
            None => Err(SubmitError::State("state file has no run header".into())),
        }
    }

    /// Recompute run stats from the persisted records.
    pub fn stats(&self) -> RunStats {
        RunStats::from_states(&self.jobs)
    }
}

/// Atomic write of the full state (temp file, then rename).
fn save(path: &Path, header: &RunHeader, jobs: &[JobState]) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&temp_path)?;
        let record = Record::Run {
            v: STATE_VERSION,
            header: header.clone(),
        };
        writeln!(file, "{}", serde_json::to_string(&record)?)?;
        for state in jobs {
            let record = Record::Job {
                v: STATE_VERSION,
                state: state.clone(),
            };
            writeln!(file, "{}", serde_json::to_string(&record)?)?;
        }
        file.flush()?;
    }
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

struct StateInner {
    header: RunHeader,
    jobs: Vec<JobState>,
    path: PathBuf,
}

/// Single writer over the shared JobState collection.
///
/// All pipeline workers mutate through [`StateManager::update`], which
/// serializes the mutation and persists the whole file before
/// returning. A failed persist surfaces to the caller without rolling
/// back the in-memory state: memory is authoritative for the live run,
/// persistence is best-effort durability.
pub struct StateManager {
    inner: Mutex<StateInner>,
}

impl StateManager {
    /// Create the manager with all jobs pending and persist the initial
    /// snapshot.
    pub fn create(path: PathBuf, header: RunHeader, jobs: Vec<JobState>) -> Result<Self> {
        save(&path, &header, &jobs)?;
        Ok(Self {
            inner: Mutex::new(StateInner { header, jobs, path }),
        })
    }

    /// Mutate one job's state, persisting before the next stage may begin.
    pub fn update<F>(&self, index: usize, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut JobState),
    {
        let mut inner = self.inner.lock().expect("state manager poisoned");
        let job = inner
            .jobs
            .iter_mut()
            .find(|j| j.index == index)
            .ok_or_else(|| SubmitError::State(format!("no job with index {}", index)))?;
        mutate(job);
        let StateInner { header, jobs, path } = &*inner;
        save(path, header, jobs)
    }

    /// Consistent snapshot of every job state.
    pub fn snapshot(&self) -> Vec<JobState> {
        self.inner.lock().expect("state manager poisoned").jobs.clone()
    }

    /// One job's current state.
    pub fn get(&self, index: usize) -> Option<JobState> {
        self.inner
            .lock()
            .expect("state manager poisoned")
            .jobs
            .iter()
            .find(|j| j.index == index)
            .cloned()
    }

    /// Current per-outcome counts.
    pub fn stats(&self) -> RunStats {
        RunStats::from_states(&self.inner.lock().expect("state manager poisoned").jobs)
    }

    /// Path of the backing file.
    pub fn path(&self) -> PathBuf {
        self.inner.lock().expect("state manager poisoned").path.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn header() -> RunHeader {
        RunHeader {
            run_id: "run-1".into(),
            config_hash: "abc123".into(),
            started_at: Utc::now(),
            expected_jobs: 2,
        }
    }

    fn two_jobs() -> Vec<JobState> {
        vec![
            JobState::new(0, "job-1", Some(PathBuf::from("/cases/a"))),
            JobState::new(1, "job-2", None),
        ]
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.state");
        let manager = StateManager::create(path.clone(), header(), two_jobs()).unwrap();

        manager
            .update(0, |job| {
                job.tar_status = StageStatus::Completed;
                job.upload_progress = 0.5;
            })
            .unwrap();

        let loaded = StateFile::load(&path).unwrap();
        assert_eq!(loaded.header.as_ref().unwrap().run_id, "run-1");
        assert_eq!(loaded.jobs.len(), 2);
        assert_eq!(loaded.jobs[0].tar_status, StageStatus::Completed);
        assert!((loaded.jobs[0].upload_progress - 0.5).abs() < f64::EPSILON);
        assert_eq!(loaded.malformed_rows, 0);
    }

    #[test]
    fn test_malformed_rows_are_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.state");
        let manager = StateManager::create(path.clone(), header(), two_jobs()).unwrap();
        drop(manager);

        // Corrupt the middle of the file.
        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines: Vec<&str> = content.lines().collect();
        lines.insert(2, "{not json at all");
        std::fs::write(&path, lines.join("\n")).unwrap();

        let loaded = StateFile::load(&path).unwrap();
        assert_eq!(loaded.malformed_rows, 1);
        assert_eq!(loaded.jobs.len(), 2);
        assert!(loaded.header.is_some());
    }

    #[test]
    fn test_stats_identical_in_memory_and_reloaded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.state");
        let mut jobs = two_jobs();
        jobs.push(JobState::new(2, "job-3", None));
        let manager = StateManager::create(path.clone(), header(), jobs).unwrap();

        manager
            .update(0, |job| {
                job.tar_status = StageStatus::Completed;
                job.upload_status = StageStatus::Completed;
                job.submit_status = StageStatus::Completed;
            })
            .unwrap();
        manager
            .update(1, |job| job.mark_failed(Stage::Upload, "connection reset"))
            .unwrap();

        let in_memory = manager.stats();
        let reloaded = StateFile::load(&path).unwrap().stats();
        assert_eq!(in_memory, reloaded);
        assert_eq!(in_memory.total, 3);
        assert_eq!(in_memory.completed, 1);
        assert_eq!(in_memory.failed, 1);
        assert_eq!(in_memory.pending, 1);
    }

    #[test]
    fn test_config_validation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.state");
        StateManager::create(path.clone(), header(), two_jobs()).unwrap();

        let loaded = StateFile::load(&path).unwrap();
        assert!(loaded.validate_config("abc123").is_ok());
        assert!(matches!(
            loaded.validate_config("different"),
            Err(SubmitError::ConfigChanged)
        ));
    }

    #[test]
    fn test_persist_failure_keeps_memory_state() {
        let dir = TempDir::new().unwrap();
        let state_dir = dir.path().join("state");
        std::fs::create_dir(&state_dir).unwrap();
        let path = state_dir.join("run.state");
        let manager = StateManager::create(path, header(), two_jobs()).unwrap();

        // Remove the directory under the manager so the next persist fails.
        std::fs::remove_dir_all(&state_dir).unwrap();

        let result = manager.update(0, |job| job.tar_status = StageStatus::Running);
        assert!(result.is_err());
        // In-memory state keeps the mutation.
        assert_eq!(manager.get(0).unwrap().tar_status, StageStatus::Running);
    }

    #[test]
    fn test_outcome_derivation() {
        let mut job = JobState::new(0, "j", None);
        assert_eq!(job.outcome(), JobOutcome::Pending);

        job.tar_status = StageStatus::Running;
        assert_eq!(job.outcome(), JobOutcome::Running);

        job.tar_status = StageStatus::Skipped;
        job.upload_status = StageStatus::Completed;
        job.submit_status = StageStatus::Completed;
        assert_eq!(job.outcome(), JobOutcome::Completed);

        job.mark_failed(Stage::Submit, "quota exceeded");
        assert_eq!(job.outcome(), JobOutcome::Failed);

        let mut cancelled = JobState::new(1, "k", None);
        cancelled.tar_status = StageStatus::Completed;
        cancelled.mark_cancelled(Stage::Upload);
        assert_eq!(cancelled.outcome(), JobOutcome::Cancelled);
    }

    #[test]
    fn test_update_unknown_index_is_an_error() {
        let dir = TempDir::new().unwrap();
        let manager =
            StateManager::create(dir.path().join("run.state"), header(), two_jobs()).unwrap();
        assert!(manager.update(99, |_| {}).is_err());
    }
}
