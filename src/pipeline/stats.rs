//! Counters owned by pipeline loops and the run summary built from them.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::time::Duration;

/// Items per second over `elapsed`.
pub fn rate(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

/// Counters of one download thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DownloadStats {
    pub attempted: u64,
    pub fetched: u64,
    pub skipped: u64,
    pub failed: u64,
    pub bytes: u64,
}

impl DownloadStats {
    pub fn merge(&mut self, other: &DownloadStats) {
        self.attempted += other.attempted;
        self.fetched += other.fetched;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.bytes += other.bytes;
    }
}

/// Counters of one detection worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Packages that produced a result
    pub detected: u64,
    pub hits: u64,
    /// Packages that could not be unpacked
    pub undetectable: u64,
    /// Tasks that failed with an error
    pub failed: u64,
}

impl WorkerStats {
    pub fn merge(&mut self, other: &WorkerStats) {
        self.detected += other.detected;
        self.hits += other.hits;
        self.undetectable += other.undetectable;
        self.failed += other.failed;
    }
}

/// Counters of the download-result sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DownloadSinkCounters {
    /// Completed downloads forwarded to the detect queue
    pub forwarded: u64,
    pub resubmitted: u64,
    pub final_errors: u64,
    pub hash_mismatches: u64,
}

/// Counters of the detect-result sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResultSinkCounters {
    pub persisted: u64,
    pub hits: u64,
    /// Local packages deleted after a non-hit
    pub deleted: u64,
    pub write_errors: u64,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub started_at: DateTime<Local>,
    pub elapsed_secs: f64,
    /// Tasks planned by the reconciler
    pub planned: u64,
    /// Download tasks handed to the download queue
    pub downloads_seeded: u64,
    pub downloads: DownloadStats,
    pub detection: WorkerStats,
    pub download_sink: DownloadSinkCounters,
    pub result_sink: ResultSinkCounters,
    /// Planned tasks that reached no terminal state before the deadline
    pub unfinished: u64,
}

impl RunStats {
    pub fn new(started_at: DateTime<Local>, planned: u64) -> Self {
        Self {
            started_at,
            elapsed_secs: 0.0,
            planned,
            downloads_seeded: 0,
            downloads: DownloadStats::default(),
            detection: WorkerStats::default(),
            download_sink: DownloadSinkCounters::default(),
            result_sink: ResultSinkCounters::default(),
            unfinished: 0,
        }
    }

    /// Tasks that reached a terminal state.
    pub fn finished(&self) -> u64 {
        self.result_sink.persisted
            + self.download_sink.final_errors
            + self.detection.undetectable
            + self.detection.failed
    }

    /// Recompute `unfinished` from the other counters.
    pub fn settle(&mut self, elapsed: Duration) {
        self.elapsed_secs = elapsed.as_secs_f64();
        self.unfinished = self.planned.saturating_sub(self.finished());
    }

    pub fn summary_lines(&self) -> Vec<String> {
        let elapsed = Duration::from_secs_f64(self.elapsed_secs);
        vec![
            format!(
                "Run started {} and lasted {:.1}s",
                self.started_at.format("%Y-%m-%d %H:%M:%S"),
                self.elapsed_secs
            ),
            format!(
                "Downloads: {} fetched, {} skipped, {} failed attempts, {} final errors ({} hash mismatches), {:.2}/s",
                self.downloads.fetched,
                self.downloads.skipped,
                self.downloads.failed,
                self.download_sink.final_errors,
                self.download_sink.hash_mismatches,
                rate(self.downloads.fetched, elapsed)
            ),
            format!(
                "Detection: {} results, {} hits, {} undetectable, {} errors, {:.2}/s",
                self.result_sink.persisted,
                self.result_sink.hits,
                self.detection.undetectable,
                self.detection.failed,
                rate(self.result_sink.persisted, elapsed)
            ),
            format!("Deleted {} non-matching packages", self.result_sink.deleted),
            format!("{} of {} planned tasks unfinished", self.unfinished, self.planned),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate() {
        assert_eq!(rate(10, Duration::ZERO), 0.0);
        assert!((rate(10, Duration::from_secs(4)) - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_merge() {
        let mut total = WorkerStats::default();
        total.merge(&WorkerStats {
            detected: 2,
            hits: 1,
            undetectable: 0,
            failed: 1,
        });
        total.merge(&WorkerStats {
            detected: 3,
            hits: 0,
            undetectable: 1,
            failed: 0,
        });
        assert_eq!(total.detected, 5);
        assert_eq!(total.failed, 1);
        assert_eq!(total.undetectable, 1);
    }

    #[test]
    fn test_unfinished() {
        let mut stats = RunStats::new(Local::now(), 10);
        stats.result_sink.persisted = 5;
        stats.download_sink.final_errors = 1;
        stats.detection.undetectable = 1;
        stats.settle(Duration::from_secs(2));
        assert_eq!(stats.unfinished, 3);
        assert_eq!(stats.summary_lines().len(), 5);
    }
}
