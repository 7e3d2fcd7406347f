//! Single-consumer sinks for download reports and detection results.

use crate::core::error::{Error, Result};
use crate::core::types::{DetectionTask, DownloadOutcome, DownloadReport, DownloadTask, FailureKind};
use crate::download::retry::{RetryDecision, RetryPolicy};
use crate::download::worker::DownloadPipelineConfig;
use crate::pipeline::channels::{Queue, Take};
use crate::pipeline::detect_worker::{remove_package, DetectPipelineConfig};
use crate::pipeline::stats::{rate, DownloadSinkCounters, ResultSinkCounters};
use crate::results::{DownloadErrorLog, ResultLog};
use std::thread::JoinHandle;
use std::time::Instant;

fn spawn_named<T, F>(name: &str, f: F) -> Result<JoinHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|source| Error::WorkerSpawn {
            name: name.to_string(),
            source,
        })
}

/// Routes download reports: completed downloads go to the detect queue,
/// failures are retried or recorded.
pub struct DownloadResultSink {
    config: DownloadPipelineConfig,
    detect_tasks: Queue<DetectionTask>,
    retry: RetryPolicy,
    error_log: DownloadErrorLog,
    log_every: u64,
}

impl DownloadResultSink {
    pub fn new(
        config: DownloadPipelineConfig,
        detect_tasks: Queue<DetectionTask>,
        retry: RetryPolicy,
        error_log: DownloadErrorLog,
        log_every: u64,
    ) -> Self {
        Self {
            config,
            detect_tasks,
            retry,
            error_log,
            log_every: log_every.max(1),
        }
    }

    pub fn spawn(self) -> Result<JoinHandle<DownloadSinkCounters>> {
        spawn_named("download-sink", move || self.run())
    }

    /// Consume reports until the deadline.
    pub fn run(mut self) -> DownloadSinkCounters {
        let mut counters = DownloadSinkCounters::default();
        let start = Instant::now();

        loop {
            let report = match self
                .config
                .channels
                .results
                .take(&self.config.deadline, self.config.poll_interval)
            {
                Take::Item(report) => report,
                Take::Empty => continue,
                Take::Expired | Take::Closed => break,
            };

            self.handle(report, &mut counters);

            if counters.forwarded > 0 && counters.forwarded % self.log_every == 0 {
                log::info!(
                    "Downloaded {} packages in {:.0}s ({:.2}/s), {} queued for download",
                    counters.forwarded,
                    start.elapsed().as_secs_f64(),
                    rate(counters.forwarded, start.elapsed()),
                    self.config.channels.tasks.depth()
                );
            }
        }

        counters
    }

    fn handle(&mut self, report: DownloadReport, counters: &mut DownloadSinkCounters) {
        let DownloadReport { task, outcome } = report;
        match outcome {
            DownloadOutcome::Fetched { .. } | DownloadOutcome::Skipped => {
                match self.detect_tasks.push(task.to_detection_task()) {
                    Ok(()) => counters.forwarded += 1,
                    Err(e) => log::error!("Could not forward {}: {}", task.id(), e),
                }
            }
            DownloadOutcome::Failed { kind, message } => match self.retry.decide(&task, kind) {
                RetryDecision::Resubmit(next) => {
                    log::debug!("Resubmitting {} (error count {})", next.id(), next.error_count);
                    match self.config.channels.tasks.push(next) {
                        Ok(()) => counters.resubmitted += 1,
                        Err(e) => log::error!("Could not resubmit {}: {}", task.id(), e),
                    }
                }
                RetryDecision::GiveUp(last) => self.record_final(&last, kind, &message, counters),
            },
        }
    }

    fn record_final(
        &mut self,
        task: &DownloadTask,
        kind: FailureKind,
        message: &str,
        counters: &mut DownloadSinkCounters,
    ) {
        log::warn!(
            "Giving up on {} after {} failed attempts ({})",
            task.id(),
            task.error_count,
            kind
        );
        counters.final_errors += 1;
        if kind == FailureKind::HashMismatch {
            counters.hash_mismatches += 1;
        }
        if let Err(e) = self.error_log.record(task, kind, message) {
            log::error!("Could not record download error for {}: {}", task.id(), e);
        }
    }
}

/// Persists detection results and removes packages that matched nothing.
pub struct DetectResultSink {
    config: DetectPipelineConfig,
    result_log: ResultLog,
    delete_unmatched: bool,
    log_every: u64,
    download_tasks: Option<Queue<DownloadTask>>,
}

impl DetectResultSink {
    pub fn new(
        config: DetectPipelineConfig,
        result_log: ResultLog,
        delete_unmatched: bool,
        log_every: u64,
    ) -> Self {
        Self {
            config,
            result_log,
            delete_unmatched,
            log_every: log_every.max(1),
            download_tasks: None,
        }
    }

    /// Include the download queue depth in progress lines.
    pub fn with_download_queue(mut self, queue: Queue<DownloadTask>) -> Self {
        self.download_tasks = Some(queue);
        self
    }

    pub fn spawn(self) -> Result<JoinHandle<ResultSinkCounters>> {
        spawn_named("result-sink", move || self.run())
    }

    /// Consume results until the deadline.
    pub fn run(mut self) -> ResultSinkCounters {
        let mut counters = ResultSinkCounters::default();
        let start = Instant::now();

        loop {
            let result = match self
                .config
                .channels
                .results
                .take(&self.config.deadline, self.config.poll_interval)
            {
                Take::Item(result) => result,
                Take::Empty => continue,
                Take::Expired | Take::Closed => break,
            };

            if let Err(e) = self.result_log.append(&result) {
                log::error!("Could not persist result for {}: {}", result.id, e);
                counters.write_errors += 1;
                continue;
            }
            counters.persisted += 1;

            if result.is_hit {
                counters.hits += 1;
            } else if self.delete_unmatched && remove_package(result.apk_file()) {
                counters.deleted += 1;
            }

            if counters.persisted % self.log_every == 0 {
                log::info!(
                    "Detected {} packages in {:.0}s ({:.2}/s, {} hits); queues: detect {}, download {}, results {}; deleted {}",
                    counters.persisted,
                    start.elapsed().as_secs_f64(),
                    rate(counters.persisted, start.elapsed()),
                    counters.hits,
                    self.config.channels.tasks.depth(),
                    self.download_tasks.as_ref().map_or(0, |q| q.depth()),
                    self.config.channels.results.depth(),
                    counters.deleted
                );
            }
        }

        counters
    }
}
