//! Append-only result logs.
//!
//! Detection results are stored as JSON lines, one record per scanned
//! package. Final download failures go to a tab-separated log next to it.
//! Both files are flushed after every record so a killed run loses at most
//! the record being written.

use crate::core::error::{Error, Result};
use crate::core::types::{DetectionResult, DownloadTask, FailureKind};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Open `path` for appending, creating parent directories.
fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::directory_access(parent, e))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::file_write(path, e))
}

/// Writer for the detection result log.
pub struct ResultLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl ResultLog {
    /// Open or create a result log for appending.
    pub fn open(path: &Path) -> Result<Self> {
        let file = open_append(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    /// Append one record and flush it.
    pub fn append(&mut self, result: &DetectionResult) -> Result<()> {
        serde_json::to_writer(&mut self.writer, result)?;
        self.writer
            .write_all(b"\n")
            .and_then(|_| self.writer.flush())
            .map_err(|e| Error::file_write(&self.path, e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Records read back from a result log.
#[derive(Debug, Default)]
pub struct LoadedResults {
    /// Well-formed records in file order (duplicates included)
    pub records: Vec<DetectionResult>,
    /// Number of non-blank lines that could not be decoded
    pub malformed: usize,
}

impl LoadedResults {
    /// Identifiers of every loaded record.
    pub fn ids(&self) -> HashSet<String> {
        self.records.iter().map(|r| r.id.clone()).collect()
    }
}

/// Read a result log, skipping blank and malformed lines.
///
/// A missing file reads as empty.
pub fn read_results(path: &Path) -> Result<LoadedResults> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::debug!("No result log at {}", path.display());
            return Ok(LoadedResults::default());
        }
        Err(e) => return Err(Error::file_read(path, e)),
    };

    let mut loaded = LoadedResults::default();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| Error::file_read(path, e))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<DetectionResult>(line) {
            Ok(record) => loaded.records.push(record),
            Err(e) => {
                let err = Error::ResultRecord {
                    path: path.to_path_buf(),
                    line: index + 1,
                    reason: e.to_string(),
                };
                log::warn!("Skipping record: {}", err);
                loaded.malformed += 1;
            }
        }
    }

    log::info!(
        "Read {} records from {} ({} malformed)",
        loaded.records.len(),
        path.display(),
        loaded.malformed
    );
    Ok(loaded)
}

/// Identifiers already present in a result log.
pub fn load_done_set(path: &Path) -> Result<HashSet<String>> {
    Ok(read_results(path)?.ids())
}

/// Writer for final download failures, one tab-separated line each:
/// `id, file, kind, message, error_count`.
pub struct DownloadErrorLog {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl DownloadErrorLog {
    pub fn open(path: &Path) -> Result<Self> {
        let file = open_append(path)?;
        let writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_writer(file);
        Ok(Self {
            path: path.to_path_buf(),
            writer,
        })
    }

    /// Record a final failure and flush it.
    pub fn record(&mut self, task: &DownloadTask, kind: FailureKind, message: &str) -> Result<()> {
        let file = task.apk_file.to_string_lossy();
        let error_count = task.error_count.to_string();
        let message = message.replace(['\t', '\n', '\r'], " ");
        self.writer.write_record([
            task.id(),
            file.as_ref(),
            kind.as_str(),
            message.as_str(),
            error_count.as_str(),
        ])?;
        self.writer
            .flush()
            .map_err(|e| Error::file_write(&self.path, e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{DetectionTask, Package};
    use crate::detection::signature::Signature;
    use tempfile::tempdir;

    fn result(id: &str, hit: bool) -> DetectionResult {
        let task = DetectionTask::new(Package::bare(id, "com.example"), Path::new("/apks"));
        let detection = if hit {
            vec![Signature::new("evil_sdk", "high", "Evil")]
        } else {
            Vec::new()
        };
        DetectionResult::new(task, detection, "sign_v1")
    }

    #[test]
    fn test_append_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("results.json");

        let mut log = ResultLog::open(&path).unwrap();
        log.append(&result("aa11", true)).unwrap();
        log.append(&result("bb22", false)).unwrap();
        drop(log);

        // Reopening appends rather than truncating.
        let mut log = ResultLog::open(&path).unwrap();
        log.append(&result("aa11", true)).unwrap();

        let loaded = read_results(&path).unwrap();
        assert_eq!(loaded.records.len(), 3);
        assert_eq!(loaded.malformed, 0);
        assert!(loaded.records[0].is_hit);
        assert_eq!(loaded.records[0].detection[0].pattern, "evil_sdk");

        let done = load_done_set(&path).unwrap();
        assert_eq!(done.len(), 2);
        assert!(done.contains("bb22"));
    }

    #[test]
    fn test_tolerates_bad_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.json");
        let good = serde_json::to_string(&result("cc33", false)).unwrap();
        std::fs::write(&path, format!("\n{}\n{{\"id\": \"truncated\n  \n", good)).unwrap();

        let loaded = read_results(&path).unwrap();
        assert_eq!(loaded.records.len(), 1);
        assert_eq!(loaded.malformed, 1);
    }

    #[test]
    fn test_missing_log_is_empty() {
        let dir = tempdir().unwrap();
        let loaded = read_results(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.records.is_empty());
    }

    #[test]
    fn test_download_error_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("download_errors.tsv");
        let task = DownloadTask::new(Package::bare("dd44", "com.bad"), Path::new("/apks"))
            .retried()
            .retried();

        let mut log = DownloadErrorLog::open(&path).unwrap();
        log.record(&task, FailureKind::Transient, "timed out\tafter 120s").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let fields: Vec<&str> = contents.trim_end().split('\t').collect();
        assert_eq!(fields.len(), 5);
        assert_eq!(fields[0], "dd44");
        assert_eq!(fields[2], "transient");
        assert_eq!(fields[3], "timed out after 120s");
        assert_eq!(fields[4], "2");
    }
}
