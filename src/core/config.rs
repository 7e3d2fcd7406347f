//! Configuration management for apk-sigscan.

use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where packages, results and scratch data live
    pub storage: StorageConfig,
    /// Download stage settings
    pub download: DownloadConfig,
    /// Detection stage settings
    pub detect: DetectConfig,
    /// Orchestration and throttling settings
    pub pipeline: PipelineSettings,
    /// Logging settings
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigLoad(format!("Failed to read config file: {}", e)))?;

        serde_json::from_str(&contents)
            .map_err(|e| Error::ConfigLoad(format!("Failed to parse config file: {}", e)))
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigSave(format!("Failed to create config directory: {}", e))
            })?;
        }

        std::fs::write(path, contents)
            .map_err(|e| Error::ConfigSave(format!("Failed to write config file: {}", e)))
    }

    /// Load configuration from the given path, the default location, or defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }

        let config_path = Self::default_config_path();
        if config_path.exists() {
            match Self::load(&config_path) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config, using defaults: {}", e);
                }
            }
        }

        Ok(Self::default())
    }

    /// Get the default configuration file path.
    pub fn default_config_path() -> PathBuf {
        Self::data_dir().join("config.json")
    }

    /// Get the application data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("apk-sigscan")
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<()> {
        fn positive(field: &str, value: u64) -> Result<()> {
            if value == 0 {
                return Err(Error::ConfigInvalid {
                    field: field.to_string(),
                    message: "Must be greater than 0".to_string(),
                });
            }
            Ok(())
        }

        positive("download.pools", self.download.pools as u64)?;
        positive("download.threads_per_pool", self.download.threads_per_pool as u64)?;
        positive("download.batch_per_thread", self.download.batch_per_thread as u64)?;
        positive("download.error_count_limit", u64::from(self.download.error_count_limit))?;
        positive("detect.workers", self.detect.workers as u64)?;
        positive("detect.max_entry_size_mb", self.detect.max_entry_size_mb)?;
        positive("detect.max_entries", self.detect.max_entries as u64)?;
        positive("pipeline.batch_size", self.pipeline.batch_size as u64)?;
        positive("pipeline.poll_interval_ms", self.pipeline.poll_interval_ms)?;
        positive("pipeline.tick_interval_ms", self.pipeline.tick_interval_ms)?;
        positive("pipeline.timeout_secs", self.pipeline.timeout_secs)?;

        if self.detect.unpacker == UnpackerKind::Apktool && self.detect.apk_tool.is_none() {
            return Err(Error::ConfigInvalid {
                field: "detect.apk_tool".to_string(),
                message: "Required when detect.unpacker is \"apktool\"".to_string(),
            });
        }

        if self.detect.detect_tag.trim().is_empty() {
            return Err(Error::ConfigInvalid {
                field: "detect.detect_tag".to_string(),
                message: "Must not be empty".to_string(),
            });
        }

        Ok(())
    }
}

/// Storage locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory of the sharded package store
    pub apk_base_dir: PathBuf,
    /// Directory holding the result log and the download error log
    pub result_dir: PathBuf,
    /// Scratch directory for unpacking (defaults to `<result_dir>/temp`)
    pub work_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            apk_base_dir: PathBuf::from("apks"),
            result_dir: PathBuf::from("results"),
            work_dir: None,
        }
    }
}

impl StorageConfig {
    /// Get the effective scratch directory.
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| self.result_dir.join("temp"))
    }

    /// Path of the detection result log.
    pub fn result_file(&self) -> PathBuf {
        self.result_dir.join("detection_results.json")
    }

    /// Path of the final download error log.
    pub fn download_error_file(&self) -> PathBuf {
        self.result_dir.join("download_errors.tsv")
    }
}

/// Download stage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Number of independent download pools
    pub pools: usize,
    /// Threads per download pool
    pub threads_per_pool: usize,
    /// Tasks a thread takes from the queue in one batch
    pub batch_per_thread: usize,
    /// Failed attempts after which a transient failure becomes final
    pub error_count_limit: u32,
    /// Re-download packages that already exist locally
    pub overwrite: bool,
    /// Download endpoint
    pub endpoint: String,
    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Whole-request timeout in seconds
    pub read_timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            pools: 2,
            threads_per_pool: 10,
            batch_per_thread: 10,
            error_count_limit: 3,
            overwrite: false,
            endpoint: "https://androzoo.uni.lu/api/download".to_string(),
            connect_timeout_secs: 60,
            read_timeout_secs: 120,
        }
    }
}

/// Which unpacker implementation the detection stage uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum UnpackerKind {
    /// External apktool process
    Apktool,
    /// Built-in zip extraction
    Zip,
}

/// Detection stage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectConfig {
    /// Number of detection workers
    pub workers: usize,
    /// Signature-set version tag written with every result
    pub detect_tag: String,
    /// Delete local packages that matched no signature
    pub delete_unmatched: bool,
    /// Extensions skipped for content inspection (still path-matched)
    pub media_extensions: Vec<String>,
    /// Unpacker implementation
    pub unpacker: UnpackerKind,
    /// Path of the apktool executable
    pub apk_tool: Option<PathBuf>,
    /// Ask apktool to decode only the main classes
    pub main_classes_only: bool,
    /// Largest entry the zip unpacker inflates, in MB
    pub max_entry_size_mb: u64,
    /// Most entries the zip unpacker accepts in one package
    pub max_entries: usize,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            detect_tag: "sign_v1".to_string(),
            delete_unmatched: true,
            media_extensions: ["png", "jpeg", "gif", "jpg", "mp3", "mp4"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            unpacker: UnpackerKind::Apktool,
            apk_tool: None,
            main_classes_only: true,
            max_entry_size_mb: 100,
            max_entries: 50_000,
        }
    }
}

/// Orchestration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Overall wall-clock budget in seconds
    pub timeout_secs: u64,
    /// How long a consumer waits on an empty queue before re-checking the deadline
    pub poll_interval_ms: u64,
    /// Interval between throttling decisions
    pub tick_interval_ms: u64,
    /// Maximum combined depth of the detect and download queues
    pub batch_size: usize,
    /// Log download throughput every N downloads
    pub log_every_downloads: u64,
    /// Log detection throughput every N results
    pub log_every_results: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 80_000,
            poll_interval_ms: 5_000,
            tick_interval_ms: 10_000,
            batch_size: 1_000,
            log_every_downloads: 100,
            log_every_results: 50,
        }
    }
}

impl PipelineSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Append log output to this file instead of the console
    pub log_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.detect.apk_tool = Some(PathBuf::from("/usr/local/bin/apktool"));
        config
    }

    #[test]
    fn test_default_config_needs_tool() {
        assert!(Config::default().validate().is_err());
        assert!(valid_config().validate().is_ok());

        let mut config = Config::default();
        config.detect.unpacker = UnpackerKind::Zip;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test_config.json");

        let mut config = valid_config();
        config.pipeline.batch_size = 42;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.pipeline.batch_size, 42);
        assert_eq!(loaded.detect.apk_tool, config.detect.apk_tool);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{"detect": {"workers": 3, "unpacker": "zip"}}"#).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.detect.workers, 3);
        assert_eq!(loaded.detect.detect_tag, "sign_v1");
        assert_eq!(loaded.download.error_count_limit, 3);
        assert!(loaded.validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let mut config = valid_config();
        config.pipeline.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.download.error_count_limit = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.detect.max_entries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_storage_paths() {
        let storage = StorageConfig {
            result_dir: PathBuf::from("/r"),
            ..Default::default()
        };
        assert_eq!(storage.work_dir(), PathBuf::from("/r/temp"));
        assert_eq!(storage.result_file(), PathBuf::from("/r/detection_results.json"));
    }
}
