//! Job specification (Command pattern) for encapsulating submission work units.
//!
//! A JobSpec contains everything needed to submit one compute job:
//! where its inputs come from, what to run, and how to shape the
//! allocation. Specs are immutable once built; per-run progress lives
//! in [`crate::state::JobState`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Where a job's input files come from.
///
/// Exactly one of the two: a local directory (archived by the tar
/// stage) or explicit input-file references (tar stage skipped).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    /// A local directory, archived and uploaded as one tarball.
    Directory(PathBuf),

    /// Explicit input files, uploaded individually.
    Files(Vec<PathBuf>),
}

impl JobSource {
    /// The directory the job is associated with, if any.
    pub fn directory(&self) -> Option<&PathBuf> {
        match self {
            JobSource::Directory(dir) => Some(dir),
            JobSource::Files(_) => None,
        }
    }
}

/// Compute allocation shape for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeShape {
    /// Core type identifier on the remote platform (e.g. "cpu-std-64").
    pub core_type: String,

    /// Cores per slot.
    pub cores_per_slot: u32,

    /// Number of slots.
    pub slots: u32,

    /// Wall-clock limit in hours.
    pub walltime_hours: f64,
}

/// Whether a job is submitted for execution or only created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMode {
    /// Create the remote job resource and submit it for execution.
    #[default]
    Submit,

    /// Create the remote job resource but leave it unsubmitted.
    CreateOnly,
}

/// Declarative description of one unit of work to submit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Job name, unique within a run.
    pub name: String,

    /// Input source: a directory or explicit files.
    pub source: JobSource,

    /// Remote analysis code identifier.
    pub application: String,

    /// Analysis code version.
    pub version: String,

    /// Compute allocation shape.
    pub shape: ComputeShape,

    /// Command executed on the remote side.
    pub command: String,

    /// Opaque license settings forwarded to the platform.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub licenses: BTreeMap<String, String>,

    /// Free-form tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Project the job is billed against.
    pub project_id: String,

    /// Decompress the uploaded archive remotely before running.
    #[serde(default)]
    pub decompress: bool,

    /// Run at low priority.
    #[serde(default)]
    pub low_priority: bool,

    /// Submit for execution or create only.
    #[serde(default)]
    pub submit_mode: SubmitMode,
}

impl JobSpec {
    /// Create a spec with the required fields; optional fields via `with_*`.
    pub fn new(
        name: impl Into<String>,
        source: JobSource,
        application: impl Into<String>,
        version: impl Into<String>,
        shape: ComputeShape,
        command: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            application: application.into(),
            version: version.into(),
            shape,
            command: command.into(),
            licenses: BTreeMap::new(),
            tags: Vec::new(),
            project_id: project_id.into(),
            decompress: false,
            low_priority: false,
            submit_mode: SubmitMode::Submit,
        }
    }

    /// Set license settings.
    pub fn with_licenses(mut self, licenses: BTreeMap<String, String>) -> Self {
        self.licenses = licenses;
        self
    }

    /// Set tags.
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Set remote decompression.
    pub fn with_decompress(mut self, decompress: bool) -> Self {
        self.decompress = decompress;
        self
    }

    /// Set low-priority execution.
    pub fn with_low_priority(mut self, low_priority: bool) -> Self {
        self.low_priority = low_priority;
        self
    }

    /// Set the submit mode.
    pub fn with_submit_mode(mut self, mode: SubmitMode) -> Self {
        self.submit_mode = mode;
        self
    }

    /// Derive a concrete spec from this template for one scan match.
    ///
    /// Templated fields are copied; the source is replaced with the
    /// match's files, and the name gets a 1-based index suffix.
    pub fn instantiate(&self, index: usize, source: JobSource) -> JobSpec {
        let mut spec = self.clone();
        spec.name = format!("{}-{}", self.name, index);
        spec.source = source;
        spec
    }

    /// Whether the tar stage applies to this spec.
    ///
    /// Archiving is directory-only; explicit file lists skip it.
    pub fn needs_archive(&self) -> bool {
        matches!(self.source, JobSource::Directory(_))
    }
}
