use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

/// The full configuration surface for a transfer run. Every field carries a
/// documented default; `load()` creates the file with those defaults on
/// first run if none exists yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    pub parallel_processes: usize,
    pub chunk_size: u64,
    pub small_file_threshold: u64,
    pub bundle_size: u64,
    pub remote_temp_dir: String,
    pub resume_transfer: bool,
    pub sjf_scheduling: bool,
    pub verify_after_reassembly: bool,
    pub verify_sizes: bool,
    pub aggressive_temp_cleanup: bool,
    pub retry_failed_chunks: bool,
    pub max_retries: u32,
    pub reassembly_timeout: u64,
    pub delete_temp_folder: bool,
    pub use_adb_shell_mode: bool,
}

const MIB: u64 = 1024 * 1024;

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            parallel_processes: 4,
            chunk_size: 100 * MIB,
            small_file_threshold: 10 * MIB,
            bundle_size: 50 * MIB,
            remote_temp_dir: "/sdcard/transfer_temp".to_string(),
            resume_transfer: true,
            sjf_scheduling: true,
            verify_after_reassembly: true,
            verify_sizes: true,
            aggressive_temp_cleanup: true,
            retry_failed_chunks: true,
            max_retries: 3,
            reassembly_timeout: 1800,
            delete_temp_folder: false,
            use_adb_shell_mode: true,
        }
    }
}

impl TransferConfig {
    /// Load config from file, or create one with defaults if absent.
    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;

        if config_path.exists() {
            debug!("loading config from {}", config_path.display());
            let content = fs::read_to_string(&config_path)?;
            serde_yaml::from_str(&content).map_err(TransferError::from)
        } else {
            debug!("config file not found, writing defaults");
            let config = Self::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::get_config_path()?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(self)?;
        fs::write(&config_path, content)?;

        debug!("config saved to {}", config_path.display());
        Ok(())
    }

    fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| TransferError::Config("could not determine config directory".to_string()))?;

        Ok(config_dir.join("nova-transfer").join("config.yaml"))
    }

    /// Sanity-check settings the way the original config layer warns instead
    /// of hard-failing where it can.
    pub fn validate(&self) -> Result<()> {
        if self.parallel_processes == 0 {
            return Err(TransferError::Config(
                "parallel_processes must be greater than 0".to_string(),
            ));
        }

        if self.chunk_size == 0 {
            return Err(TransferError::Config("chunk_size must be greater than 0".to_string()));
        }

        if self.small_file_threshold == 0 {
            warn!("small_file_threshold is 0; every file will be treated as large");
        }

        if self.max_retries > 20 {
            warn!("high retry ceiling configured: {}", self.max_retries);
        }

        if self.reassembly_timeout == 0 {
            return Err(TransferError::Config(
                "reassembly_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TransferConfig::default();
        assert_eq!(config.parallel_processes, 4);
        assert_eq!(config.chunk_size, 100 * MIB);
        assert_eq!(config.small_file_threshold, 10 * MIB);
        assert!(config.resume_transfer);
        assert!(config.use_adb_shell_mode);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = TransferConfig::default();
        config.parallel_processes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_defaults() {
        let config = TransferConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_roundtrip_yaml() {
        let config = TransferConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let back: TransferConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config, back);
    }
}
