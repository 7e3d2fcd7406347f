//! Core type definitions shared by the pipeline stages.

use crate::detection::signature::Signature;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Build date used when the manifest row carries none.
const UNKNOWN_DATE: &str = "";

/// Market label used when the manifest row carries none.
const UNKNOWN_MARKET: &str = "Unknown";

/// A downloadable application package identified by its SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    /// Lower-case hex SHA-256 of the package bytes
    pub id: String,
    /// Application package name (e.g. "com.example.app")
    #[serde(alias = "pkg_id")]
    pub pkg_name: String,
    /// Build date of the dex code, `YYYY-MM-DD`, possibly empty
    #[serde(default)]
    pub dex_date: String,
    /// Market the package was collected from
    #[serde(default = "default_market")]
    pub market: String,
}

fn default_market() -> String {
    UNKNOWN_MARKET.to_string()
}

impl Package {
    /// Create a new package record.
    pub fn new(
        id: impl Into<String>,
        pkg_name: impl Into<String>,
        dex_date: impl Into<String>,
        market: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into().to_lowercase(),
            pkg_name: pkg_name.into(),
            dex_date: dex_date.into(),
            market: market.into(),
        }
    }

    /// Create a package that only carries an identifier and name.
    pub fn bare(id: impl Into<String>, pkg_name: impl Into<String>) -> Self {
        Self::new(id, pkg_name, UNKNOWN_DATE, UNKNOWN_MARKET)
    }

    /// Shard directories derived from the trailing characters of the identifier.
    ///
    /// Two levels of two characters each: `id[-4:-2]/id[-2:]`.
    pub fn shard_dir(&self) -> PathBuf {
        let tail = tail(&self.id, 4);
        let split = tail.len().saturating_sub(2);
        let mut dir = PathBuf::new();
        dir.push(tail.get(..split).unwrap_or_default());
        dir.push(tail.get(split..).unwrap_or_default());
        dir
    }

    /// File name of the stored package.
    pub fn file_name(&self) -> String {
        format!("{}_{}_{}.apk", self.pkg_name, self.dex_date, tail(&self.id, 6))
    }

    /// Storage path of the package relative to the storage base directory.
    pub fn relative_path(&self) -> PathBuf {
        self.shard_dir().join(self.file_name())
    }

    /// Absolute storage path under the given base directory.
    pub fn storage_path(&self, base_dir: &Path) -> PathBuf {
        base_dir.join(self.relative_path())
    }
}

/// Last `n` characters of an ASCII identifier (the whole string if shorter).
fn tail(id: &str, n: usize) -> &str {
    let start = id.len().saturating_sub(n);
    id.get(start..).unwrap_or(id)
}

/// A package whose bytes are expected at `apk_file`, ready for detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionTask {
    #[serde(flatten)]
    pub package: Package,
    /// Local path of the package bytes
    pub apk_file: PathBuf,
}

impl DetectionTask {
    /// Create a detection task for a package stored under `base_dir`.
    pub fn new(package: Package, base_dir: &Path) -> Self {
        let apk_file = package.storage_path(base_dir);
        Self { package, apk_file }
    }

    /// Identifier of the package.
    pub fn id(&self) -> &str {
        &self.package.id
    }
}

/// A package that must be fetched to `apk_file` before detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadTask {
    #[serde(flatten)]
    pub package: Package,
    /// Destination of the downloaded bytes
    pub apk_file: PathBuf,
    /// Number of failed attempts so far
    #[serde(default)]
    pub error_count: u32,
}

impl DownloadTask {
    /// Create a fresh download task for a package stored under `base_dir`.
    pub fn new(package: Package, base_dir: &Path) -> Self {
        let apk_file = package.storage_path(base_dir);
        Self {
            package,
            apk_file,
            error_count: 0,
        }
    }

    /// Identifier of the package.
    pub fn id(&self) -> &str {
        &self.package.id
    }

    /// A new task value for the next attempt, with the failure counted.
    pub fn retried(&self) -> Self {
        Self {
            package: self.package.clone(),
            apk_file: self.apk_file.clone(),
            error_count: self.error_count + 1,
        }
    }

    /// The detection task that follows a completed download.
    pub fn to_detection_task(&self) -> DetectionTask {
        DetectionTask {
            package: self.package.clone(),
            apk_file: self.apk_file.clone(),
        }
    }
}

/// Classification of a failed download attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The fetched bytes are provably not the requested package
    HashMismatch,
    /// Network or I/O failure; worth another attempt
    Transient,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::HashMismatch => "hash_mismatch",
            FailureKind::Transient => "transient",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one download attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Bytes fetched and verified
    Fetched { bytes: u64 },
    /// The destination already existed and overwrite is off
    Skipped,
    /// The attempt failed
    Failed { kind: FailureKind, message: String },
}

impl DownloadOutcome {
    /// Whether the package bytes are now available locally.
    pub fn is_available(&self) -> bool {
        matches!(self, DownloadOutcome::Fetched { .. } | DownloadOutcome::Skipped)
    }
}

/// A download attempt together with the task that produced it.
#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub task: DownloadTask,
    pub outcome: DownloadOutcome,
}

/// Persisted result of scanning one package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Package identifier
    pub id: String,
    /// Matched signatures, in library order
    pub detection: Vec<Signature>,
    /// Signature-set version tag active when detection ran
    pub detect_tag: String,
    /// Seconds since the Unix epoch
    pub detection_time: f64,
    /// The task that was scanned
    pub apk_meta: DetectionTask,
    /// Whether any signature matched
    pub is_hit: bool,
}

impl DetectionResult {
    /// Build a result for a finished detection.
    pub fn new(task: DetectionTask, detection: Vec<Signature>, detect_tag: impl Into<String>) -> Self {
        let is_hit = !detection.is_empty();
        Self {
            id: task.package.id.clone(),
            detection,
            detect_tag: detect_tag.into(),
            detection_time: now_epoch_secs(),
            apk_meta: task,
            is_hit,
        }
    }

    /// Distinct patterns recorded in this result.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.detection.iter().map(|s| s.pattern.as_str())
    }

    /// Local path of the scanned package.
    pub fn apk_file(&self) -> &Path {
        &self.apk_meta.apk_file
    }
}

/// Current time as fractional seconds since the Unix epoch.
pub fn now_epoch_secs() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}
