//! Transfer task types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Upload,
    Download,
}

/// Current state of a transfer task.
///
/// `queued → initializing → active → {completed, failed, cancelled}`,
/// with `paused` reachable from `active`. Terminal states are sticky;
/// only a retry revives the work, under a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Queued,
    Initializing,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    /// Whether the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Cancelled
        )
    }
}

/// Request for one transfer. Retained verbatim so a retry can re-queue
/// the same work under a fresh id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransferRequest {
    /// Upload a local file into a remote folder.
    Upload {
        local_path: PathBuf,
        folder_id: String,
    },

    /// Download a remote file to a local path.
    Download {
        file_id: String,
        local_path: PathBuf,
    },
}

impl TransferRequest {
    pub fn kind(&self) -> TransferKind {
        match self {
            TransferRequest::Upload { .. } => TransferKind::Upload,
            TransferRequest::Download { .. } => TransferKind::Download,
        }
    }

    /// Display name: the file name being moved.
    pub fn name(&self) -> String {
        match self {
            TransferRequest::Upload { local_path, .. } => local_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload".to_string()),
            TransferRequest::Download { file_id, local_path } => local_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file_id.clone()),
        }
    }

    pub fn source(&self) -> String {
        match self {
            TransferRequest::Upload { local_path, .. } => local_path.display().to_string(),
            TransferRequest::Download { file_id, .. } => file_id.clone(),
        }
    }

    pub fn destination(&self) -> String {
        match self {
            TransferRequest::Upload { folder_id, .. } => folder_id.clone(),
            TransferRequest::Download { local_path, .. } => local_path.display().to_string(),
        }
    }
}

/// One queued/active/terminal transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferTask {
    pub id: Uuid,
    pub kind: TransferKind,
    pub state: TransferState,
    pub name: String,
    pub source: String,
    pub destination: String,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub speed_bps: f64,
    pub error: Option<String>,
}

impl TransferTask {
    pub(crate) fn from_request(id: Uuid, request: &TransferRequest) -> Self {
        Self {
            id,
            kind: request.kind(),
            state: TransferState::Queued,
            name: request.name(),
            source: request.source(),
            destination: request.destination(),
            total_bytes: 0,
            transferred_bytes: 0,
            speed_bps: 0.0,
            error: None,
        }
    }

    /// Fractional progress, 0.0 to 1.0.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            if self.state == TransferState::Completed {
                1.0
            } else {
                0.0
            }
        } else {
            self.transferred_bytes as f64 / self.total_bytes as f64
        }
    }
}

/// Per-state counts over the task registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferQueueStats {
    pub queued: usize,
    pub initializing: usize,
    pub active: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl TransferQueueStats {
    pub fn count(&mut self, state: TransferState) {
        match state {
            TransferState::Queued => self.queued += 1,
            TransferState::Initializing => self.initializing += 1,
            TransferState::Active => self.active += 1,
            TransferState::Paused => self.paused += 1,
            TransferState::Completed => self.completed += 1,
            TransferState::Failed => self.failed += 1,
            TransferState::Cancelled => self.cancelled += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(TransferState::Completed.is_terminal());
        assert!(TransferState::Failed.is_terminal());
        assert!(TransferState::Cancelled.is_terminal());
        assert!(!TransferState::Queued.is_terminal());
        assert!(!TransferState::Active.is_terminal());
        assert!(!TransferState::Paused.is_terminal());
    }

    #[test]
    fn test_request_name_and_endpoints() {
        let upload = TransferRequest::Upload {
            local_path: PathBuf::from("/data/case.tar.gz"),
            folder_id: "folder-9".into(),
        };
        assert_eq!(upload.name(), "case.tar.gz");
        assert_eq!(upload.destination(), "folder-9");

        let download = TransferRequest::Download {
            file_id: "file-3".into(),
            local_path: PathBuf::from("/tmp/results.zip"),
        };
        assert_eq!(download.name(), "results.zip");
        assert_eq!(download.source(), "file-3");
    }

    #[test]
    fn test_fraction() {
        let request = TransferRequest::Upload {
            local_path: PathBuf::from("/data/a"),
            folder_id: "f".into(),
        };
        let mut task = TransferTask::from_request(Uuid::new_v4(), &request);
        assert_eq!(task.fraction(), 0.0);

        task.total_bytes = 200;
        task.transferred_bytes = 50;
        assert!((task.fraction() - 0.25).abs() < f64::EPSILON);

        // Zero-byte transfer reads as done only once completed.
        task.total_bytes = 0;
        task.transferred_bytes = 0;
        task.state = TransferState::Completed;
        assert_eq!(task.fraction(), 1.0);
    }
}
