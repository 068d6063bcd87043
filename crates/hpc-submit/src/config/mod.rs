//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Compute a SHA256 hash of the configuration for resume validation.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
submit:
  project_id: p-0042
"#;

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.submit.project_id, "p-0042");
        assert_eq!(config.submit.get_retry_limit(), 2);
        assert_eq!(config.submit.conflict_mode, ConflictMode::CheckBeforeUpload);
        assert_eq!(config.submit.compression, Compression::Gzip);
        assert!(config.scan.include.is_empty());
    }

    #[test]
    fn test_hash_changes_with_content() {
        let a = Config::from_yaml(MINIMAL).unwrap();
        let b = Config::from_yaml("submit:\n  project_id: p-0043\n").unwrap();
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash(), Config::from_yaml(MINIMAL).unwrap().hash());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let yaml = "submit:\n  project_id: p-1\n  tar_workers: 0\n";
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_bad_exclude_pattern_rejected() {
        let yaml = "submit:\n  project_id: p-1\nscan:\n  exclude: [\"[\"]\n";
        assert!(Config::from_yaml(yaml).is_err());
    }
}
