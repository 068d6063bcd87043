//! # hpc-submit
//!
//! Batch job submission and transfer orchestration for a remote HPC
//! platform.
//!
//! This library provides the core functionality for turning job
//! specifications into a bounded-concurrency pipeline of
//! tar -> upload -> create -> submit stages, with support for:
//!
//! - **Directory scanning** with primary/secondary glob patterns
//! - **Parallel stages** with independently sized worker pools
//! - **Resume capability** via line-oriented JSON state files
//! - **A generic transfer queue** for ad hoc uploads and downloads
//! - **A typed event bus** with throttled progress streams
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hpc_submit::{Config, EventBus, PipelineEngine};
//! use hpc_submit::remote::DryRunPlatform;
//!
//! #[tokio::main]
//! async fn main() -> hpc_submit::Result<()> {
//!     let config = Config::load("config.yaml")?.with_auto_tuning();
//!     let bus = Arc::new(EventBus::new());
//!     let engine = PipelineEngine::new(Arc::new(DryRunPlatform::new()), config, bus);
//!
//!     let specs = vec![/* JobSpecs */];
//!     engine.start_run("run-1", "run.state".into(), specs.len())?;
//!     let result = engine.run_from_specs(specs).await?;
//!     engine.end_run();
//!     println!("{}", result.to_json()?);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod pipeline;
pub mod remote;
pub mod scanner;
pub mod state;
pub mod transfer;

// Re-exports for convenient access
pub use config::{Compression, Config, ConflictMode, ScanConfig, SubmitConfig, TransferSettings};
pub use error::{Result, SubmitError};
pub use events::{Event, EventBus, EventThrottle, Outcome, Subscription};
pub use job::{ComputeShape, JobSource, JobSpec, SubmitMode};
pub use pipeline::{PipelineEngine, RunContext, RunResult};
pub use scanner::{ScanOutcome, ScanRequest, SecondaryPattern};
pub use state::{JobState, RunStats, StageStatus, StateFile};
pub use transfer::{TransferRequest, TransferService, TransferState, TransferTask};
