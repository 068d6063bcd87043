//! Error types for the submission library.

use thiserror::Error;

/// Main error type for submission operations.
#[derive(Error, Debug)]
pub enum SubmitError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Scan failed: malformed primary pattern or zero matches.
    #[error("Scan error: {0}")]
    Scan(String),

    /// Remote platform API failure during any stage.
    #[error("API error during {operation}: {message}")]
    Api {
        operation: String,
        message: String,
        /// Transient failures are retried up to the configured limit.
        transient: bool,
    },

    /// A transfer failed for a specific file.
    #[error("Transfer failed for {name}: {message}")]
    Transfer { name: String, message: String },

    /// Run-state file error.
    #[error("State file error: {0}")]
    State(String),

    /// Config hash mismatch on resume.
    #[error("Config has changed since the run was started - cannot resume")]
    ConfigChanged,

    /// A run is already active.
    #[error("A run is already active")]
    AlreadyRunning,

    /// No run is active.
    #[error("No run is active")]
    NoActiveRun,

    /// The operation was cancelled (Ctrl-C, explicit cancel).
    #[error("Operation cancelled")]
    Cancelled,

    /// An external call exceeded its timeout.
    #[error("Timed out during {operation}")]
    Timeout { operation: String },

    /// IO error (file operations, archiving).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SubmitError {
    /// Create an API error.
    pub fn api(operation: impl Into<String>, message: impl Into<String>, transient: bool) -> Self {
        SubmitError::Api {
            operation: operation.into(),
            message: message.into(),
            transient,
        }
    }

    /// Create a Transfer error.
    pub fn transfer(name: impl Into<String>, message: impl Into<String>) -> Self {
        SubmitError::Transfer {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a Timeout error.
    pub fn timeout(operation: impl Into<String>) -> Self {
        SubmitError::Timeout {
            operation: operation.into(),
        }
    }

    /// Whether retrying the failed operation may succeed.
    ///
    /// Timeouts count as transient; cancellation and precondition
    /// violations never do.
    pub fn is_transient(&self) -> bool {
        match self {
            SubmitError::Api { transient, .. } => *transient,
            SubmitError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Format error with full details including error chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for submission operations.
pub type Result<T> = std::result::Result<T, SubmitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SubmitError::api("submit_job", "503", true).is_transient());
        assert!(!SubmitError::api("submit_job", "bad request", false).is_transient());
        assert!(SubmitError::timeout("list_folder").is_transient());
        assert!(!SubmitError::Cancelled.is_transient());
        assert!(!SubmitError::AlreadyRunning.is_transient());
    }

    #[test]
    fn test_format_detailed_includes_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.tar.gz");
        let err = SubmitError::from(io);
        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Error: IO error"));
        assert!(detailed.contains("missing.tar.gz"));
    }
}
