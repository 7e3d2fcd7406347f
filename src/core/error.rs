//! Error types and result handling for apk-sigscan.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our custom Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for apk-sigscan operations.
#[derive(Error, Debug)]
pub enum Error {
    // ===== I/O Errors =====
    #[error("Failed to read file: {path}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file: {path}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to delete file: {path}")]
    FileDelete {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to access directory: {path}")]
    DirectoryAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    // ===== Configuration Errors =====
    #[error("Failed to load configuration: {0}")]
    ConfigLoad(String),

    #[error("Failed to save configuration: {0}")]
    ConfigSave(String),

    #[error("Invalid configuration value: {field} - {message}")]
    ConfigInvalid { field: String, message: String },

    // ===== Input Errors =====
    #[error("Failed to load signatures: {0}")]
    SignatureLoad(String),

    #[error("Failed to load manifest {path}: {reason}")]
    ManifestLoad { path: PathBuf, reason: String },

    #[error("Failed to load credentials from {path}: {reason}")]
    CredentialLoad { path: PathBuf, reason: String },

    #[error("Malformed result record at {path}:{line}: {reason}")]
    ResultRecord {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Malformed task: {0}")]
    TaskDecode(String),

    // ===== Detection Errors =====
    #[error("Failed to unpack {path}: {reason}")]
    Unpack { path: PathBuf, reason: String },

    // ===== Download Errors =====
    #[error("Hash mismatch for {expected}: downloaded content hashes to {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Download failed: {id}")]
    DownloadFailed {
        id: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Server returned {status} for {id}")]
    HttpStatus { id: String, status: u16 },

    // ===== Concurrency Errors =====
    #[error("Channel send failed: {context}")]
    ChannelSend { context: String },

    #[error("Worker thread panicked: {name}")]
    WorkerPanic { name: String },

    #[error("Failed to spawn worker thread: {name}")]
    WorkerSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    // ===== Serialization Errors =====
    #[error("JSON serialization error")]
    JsonSerialize(#[from] serde_json::Error),

    #[error("CSV error")]
    Csv(#[from] csv::Error),

    // ===== Generic Errors =====
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Network(err.to_string())
    }
}

impl Error {
    /// Create a file read error.
    pub fn file_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileRead {
            path: path.into(),
            source,
        }
    }

    /// Create a file write error.
    pub fn file_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileWrite {
            path: path.into(),
            source,
        }
    }

    /// Create a file delete error.
    pub fn file_delete(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileDelete {
            path: path.into(),
            source,
        }
    }

    /// Create a directory access error.
    pub fn directory_access(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::DirectoryAccess {
            path: path.into(),
            source,
        }
    }

    /// Create an unpack error.
    pub fn unpack(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Unpack {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a channel send error.
    pub fn channel_send(context: impl Into<String>) -> Self {
        Self::ChannelSend {
            context: context.into(),
        }
    }

    /// Check if this error is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::TransientIo | ErrorCategory::Network
        )
    }

    /// Check if this error proves the fetched content is not the requested package.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Error::HashMismatch { .. })
    }

    /// Get a user-friendly suggestion for how to resolve this error.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::PathNotFound(_) => Some("Check that the path exists and is accessible"),
            Error::ConfigLoad(_) | Error::ConfigInvalid { .. } => {
                Some("Check your configuration file for syntax errors or missing fields")
            }
            Error::SignatureLoad(_) => {
                Some("Each line of the signature file must be {\"pname\": ..., \"signs\": [[pattern, confidence], ...]}")
            }
            Error::ManifestLoad { .. } => {
                Some("The manifest must be a CSV file with a header row (AndroZoo latest.csv layout)")
            }
            Error::CredentialLoad { .. } => {
                Some("Put the API key on its own line or as api_key=<key>")
            }
            Error::Unpack { .. } => Some("Check the apktool path or switch to the zip unpacker"),
            Error::Network(_) | Error::DownloadFailed { .. } | Error::HttpStatus { .. } => {
                Some("Check your network connection and API key, then rerun to resume")
            }
            Error::WorkerPanic { .. } => Some("Internal error: rerun to resume from the result log"),
            _ => None,
        }
    }

    /// Get the error category for logging and failure classification.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::FileRead { .. }
            | Error::FileWrite { .. }
            | Error::FileDelete { .. }
            | Error::DirectoryAccess { .. }
            | Error::PathNotFound(_)
            | Error::Io(_) => ErrorCategory::TransientIo,

            Error::Network(_) | Error::DownloadFailed { .. } | Error::HttpStatus { .. } => {
                ErrorCategory::Network
            }

            Error::HashMismatch { .. } => ErrorCategory::PermanentIntegrity,

            Error::Unpack { .. } => ErrorCategory::UnpackFailure,

            Error::TaskDecode(_) | Error::ResultRecord { .. } => ErrorCategory::TaskDecode,

            Error::ConfigLoad(_) | Error::ConfigSave(_) | Error::ConfigInvalid { .. } => {
                ErrorCategory::Configuration
            }

            Error::SignatureLoad(_)
            | Error::ManifestLoad { .. }
            | Error::CredentialLoad { .. }
            | Error::JsonSerialize(_)
            | Error::Csv(_) => ErrorCategory::Input,

            Error::ChannelSend { .. } | Error::WorkerPanic { .. } | Error::WorkerSpawn { .. } => {
                ErrorCategory::Concurrency
            }

            Error::Internal(_) | Error::Other(_) => ErrorCategory::Other,
        }
    }
}

/// Error category used to classify failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Local file or directory errors; retried up to a limit.
    TransientIo,
    /// Remote transport errors; retried up to a limit.
    Network,
    /// Content hash mismatch; never retried automatically.
    PermanentIntegrity,
    /// The archive tool failed; the package is undetectable.
    UnpackFailure,
    /// A task or result record could not be decoded.
    TaskDecode,
    Configuration,
    Input,
    Concurrency,
    Other,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TransientIo => write!(f, "I/O"),
            Self::Network => write!(f, "Network"),
            Self::PermanentIntegrity => write!(f, "Integrity"),
            Self::UnpackFailure => write!(f, "Unpack"),
            Self::TaskDecode => write!(f, "Decode"),
            Self::Configuration => write!(f, "Configuration"),
            Self::Input => write!(f, "Input"),
            Self::Concurrency => write!(f, "Concurrency"),
            Self::Other => write!(f, "Other"),
        }
    }
}
