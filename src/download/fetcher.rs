//! Package sources and the verifying downloader.

use crate::core::error::{Error, Result};
use crate::core::types::{DownloadOutcome, DownloadTask, FailureKind};
use crate::utils::hash::HashingWriter;
use std::fs::File;
use std::io::{BufWriter, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Provides the bytes of a package by identifier.
///
/// Callers verify the content hash; a source only transports bytes.
pub trait PackageSource: Send + Sync {
    fn open(&self, id: &str) -> Result<Box<dyn Read + Send>>;
}

/// The AndroZoo download API.
pub struct AndroZooSource {
    endpoint: String,
    api_key: String,
    client: reqwest::blocking::Client,
}

impl AndroZooSource {
    /// Create a source with connect and whole-request timeouts.
    pub fn new(
        endpoint: &str,
        api_key: impl Into<String>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }
}

impl PackageSource for AndroZooSource {
    fn open(&self, id: &str) -> Result<Box<dyn Read + Send>> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("apikey", self.api_key.as_str()), ("sha256", id)])
            .send()
            .map_err(|e| Error::DownloadFailed {
                id: id.to_string(),
                source: Box::new(e.without_url()),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                id: id.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(Box::new(response))
    }
}

/// Fetches packages to their storage path and verifies their hash.
pub struct Downloader {
    source: Arc<dyn PackageSource>,
    overwrite: bool,
}

impl Downloader {
    pub fn new(source: Arc<dyn PackageSource>, overwrite: bool) -> Self {
        Self { source, overwrite }
    }

    /// Perform one download attempt.
    ///
    /// Bytes are streamed to a `.part` sibling and renamed into place only
    /// after the hash matched, so the destination never holds a partial or
    /// foreign package.
    pub fn download(&self, task: &DownloadTask) -> DownloadOutcome {
        if !self.overwrite && task.apk_file.exists() {
            log::debug!("{} already present, skipping download", task.id());
            return DownloadOutcome::Skipped;
        }

        let part = part_path(&task.apk_file);
        match self.fetch_to(task, &part) {
            Ok(bytes) => DownloadOutcome::Fetched { bytes },
            Err(e) => {
                remove_if_exists(&part);
                let kind = if e.is_integrity_failure() {
                    FailureKind::HashMismatch
                } else {
                    FailureKind::Transient
                };
                log::warn!(
                    "Download of {} failed ({}, attempt {}): {}",
                    task.id(),
                    kind,
                    task.error_count + 1,
                    e
                );
                DownloadOutcome::Failed {
                    kind,
                    message: e.to_string(),
                }
            }
        }
    }

    fn fetch_to(&self, task: &DownloadTask, part: &Path) -> Result<u64> {
        if let Some(parent) = task.apk_file.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::directory_access(parent, e))?;
        }

        let mut reader = self.source.open(task.id())?;
        let file = File::create(part).map_err(|e| Error::file_write(part, e))?;
        let mut writer = HashingWriter::new(BufWriter::new(file));

        std::io::copy(&mut reader, &mut writer).map_err(|e| Error::DownloadFailed {
            id: task.id().to_string(),
            source: Box::new(e),
        })?;
        let (_, digest, bytes) = writer.finish().map_err(|e| Error::file_write(part, e))?;

        if !digest.eq_ignore_ascii_case(task.id()) {
            return Err(Error::HashMismatch {
                expected: task.id().to_string(),
                actual: digest,
            });
        }

        std::fs::rename(part, &task.apk_file).map_err(|e| Error::file_write(&task.apk_file, e))?;
        log::debug!("Downloaded {} ({} bytes)", task.id(), bytes);
        Ok(bytes)
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

fn remove_if_exists(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove {}: {}", path.display(), e),
    }
}
