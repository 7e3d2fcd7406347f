//! apk-sigscan: resumable download and signature scan of Android packages.
//!
//! Packages listed in a manifest are fetched from a remote repository,
//! verified against their SHA-256 identifier, matched against a signature
//! library and the verdicts appended to a JSON-lines result log. A run can
//! be interrupted at any time; the next run reconciles the manifest with the
//! log and only schedules what is still missing.

pub mod core;
pub mod credentials;
pub mod detection;
pub mod download;
pub mod manifest;
pub mod pipeline;
pub mod results;
pub mod ui;
pub mod utils;

// Re-export commonly used types
pub use crate::core::config::Config;
pub use crate::core::error::{Error, Result};
pub use crate::core::types::*;
