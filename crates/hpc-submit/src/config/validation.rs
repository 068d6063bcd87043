//! Configuration validation.

use super::Config;
use crate::error::{Result, SubmitError};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Pool sizes - only check if explicitly set
    if let Some(0) = config.submit.tar_workers {
        return Err(SubmitError::Config(
            "submit.tar_workers must be at least 1".into(),
        ));
    }
    if let Some(0) = config.submit.upload_workers {
        return Err(SubmitError::Config(
            "submit.upload_workers must be at least 1".into(),
        ));
    }
    if let Some(0) = config.submit.submit_workers {
        return Err(SubmitError::Config(
            "submit.submit_workers must be at least 1".into(),
        ));
    }
    if let Some(0) = config.transfer.workers {
        return Err(SubmitError::Config(
            "transfer.workers must be at least 1".into(),
        ));
    }

    if let Some(0) = config.submit.api_timeout_secs {
        return Err(SubmitError::Config(
            "submit.api_timeout_secs must be at least 1".into(),
        ));
    }

    // Scanner filters must be well-formed globs
    for pattern in config.scan.include.iter().chain(&config.scan.exclude) {
        if let Err(e) = glob::Pattern::new(pattern) {
            return Err(SubmitError::Config(format!(
                "invalid scan filter pattern '{}': {}",
                pattern, e
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScanConfig, SubmitConfig, TransferSettings};

    fn valid_config() -> Config {
        Config {
            submit: SubmitConfig {
                project_id: "p-1".to_string(),
                ..Default::default()
            },
            transfer: TransferSettings::default(),
            scan: ScanConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_zero_upload_workers() {
        let mut config = valid_config();
        config.submit.upload_workers = Some(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unset_pools_are_fine() {
        let config = valid_config();
        assert!(config.submit.tar_workers.is_none());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_invalid_include_pattern() {
        let mut config = valid_config();
        config.scan.include = vec!["[oops".to_string()];
        assert!(validate(&config).is_err());
    }
}
