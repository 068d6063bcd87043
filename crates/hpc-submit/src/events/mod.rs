//! In-process typed event bus.
//!
//! Every component publishes progress/log/error/completion events here;
//! zero or more independent subscribers (terminal logger, UI bridge)
//! consume them asynchronously. The bus only fans out - rate limiting
//! is an emission-side concern, see [`EventThrottle`].

mod bus;
mod throttle;

pub use bus::{EventBus, Subscription};
pub use throttle::EventThrottle;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::StageStatus;
use crate::transfer::TransferState;

/// Severity for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
}

/// Terminal outcome of a run or a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Failed,
    Cancelled,
}

/// A single bus event. Immutable once published.
///
/// Closed set: consumers match exhaustively so a new variant is a
/// compile-time-checked change everywhere it is handled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Fractional progress on a throttle key (task id or job name).
    Progress {
        at: DateTime<Utc>,
        key: String,
        fraction: f64,
        detail: Option<String>,
    },

    /// Free-form log line.
    Log {
        at: DateTime<Utc>,
        level: LogLevel,
        message: String,
    },

    /// A job stage changed status.
    StateChange {
        at: DateTime<Utc>,
        job: String,
        stage: String,
        status: StageStatus,
    },

    /// Something failed; always paired with an error field on the
    /// owning record - there is no silent failure path.
    Error {
        at: DateTime<Utc>,
        source: String,
        message: String,
    },

    /// A run (or standalone operation) reached its terminal outcome.
    Complete {
        at: DateTime<Utc>,
        run_id: String,
        outcome: Outcome,
    },

    /// A transfer task changed state or progressed.
    Transfer {
        at: DateTime<Utc>,
        task_id: Uuid,
        state: TransferState,
        transferred_bytes: u64,
        total_bytes: u64,
        speed_bps: f64,
    },

    /// Remote folder enumeration progress.
    Enumeration {
        at: DateTime<Utc>,
        folder_id: String,
        entries: usize,
        done: bool,
    },

    /// Directory scan progress.
    ScanProgress {
        at: DateTime<Utc>,
        scanned: usize,
        matched: usize,
        current: Option<String>,
    },
}

impl Event {
    /// Timestamp of the event, regardless of variant.
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Event::Progress { at, .. }
            | Event::Log { at, .. }
            | Event::StateChange { at, .. }
            | Event::Error { at, .. }
            | Event::Complete { at, .. }
            | Event::Transfer { at, .. }
            | Event::Enumeration { at, .. }
            | Event::ScanProgress { at, .. } => *at,
        }
    }

    pub fn progress(key: impl Into<String>, fraction: f64) -> Self {
        Event::Progress {
            at: Utc::now(),
            key: key.into(),
            fraction,
            detail: None,
        }
    }

    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Event::Log {
            at: Utc::now(),
            level,
            message: message.into(),
        }
    }

    pub fn state_change(
        job: impl Into<String>,
        stage: impl Into<String>,
        status: StageStatus,
    ) -> Self {
        Event::StateChange {
            at: Utc::now(),
            job: job.into(),
            stage: stage.into(),
            status,
        }
    }

    pub fn error(source: impl Into<String>, message: impl Into<String>) -> Self {
        Event::Error {
            at: Utc::now(),
            source: source.into(),
            message: message.into(),
        }
    }

    pub fn complete(run_id: impl Into<String>, outcome: Outcome) -> Self {
        Event::Complete {
            at: Utc::now(),
            run_id: run_id.into(),
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_tags_variant() {
        let event = Event::progress("job-1", 0.5);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"progress\""));
        assert!(json.contains("\"key\":\"job-1\""));
    }

    #[test]
    fn test_at_covers_every_variant() {
        let events = vec![
            Event::progress("k", 0.1),
            Event::log(LogLevel::Info, "hello"),
            Event::state_change("j", "tar", StageStatus::Running),
            Event::error("upload", "boom"),
            Event::complete("run-1", Outcome::Completed),
        ];
        for event in events {
            assert!(event.at() <= Utc::now());
        }
    }
}
