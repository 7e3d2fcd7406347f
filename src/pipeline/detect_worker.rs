//! Detection workers.

use crate::core::error::{Error, Result};
use crate::core::types::{DetectionResult, DetectionTask};
use crate::detection::matcher::{MatchOutcome, SignatureMatcher};
use crate::pipeline::channels::{ChannelPair, Deadline, Take};
use crate::pipeline::stats::WorkerStats;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// What the detection stage needs from the orchestrator.
#[derive(Clone)]
pub struct DetectPipelineConfig {
    pub channels: ChannelPair<DetectionTask, DetectionResult>,
    pub deadline: Deadline,
    pub poll_interval: Duration,
    pub workers: usize,
    /// Signature-set tag stamped on every result
    pub detect_tag: String,
}

/// Spawn the detection workers.
pub fn spawn_detect_workers(
    config: &DetectPipelineConfig,
    matcher: Arc<SignatureMatcher>,
) -> Result<Vec<JoinHandle<WorkerStats>>> {
    let mut handles = Vec::with_capacity(config.workers);

    for index in 0..config.workers {
        let name = format!("detect-{}", index);
        let config = config.clone();
        let matcher = Arc::clone(&matcher);
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || detect_loop(&config, &matcher))
            .map_err(|source| Error::WorkerSpawn { name, source })?;
        handles.push(handle);
    }

    log::info!("Started {} detection workers", config.workers);
    Ok(handles)
}

/// Consume detection tasks until the deadline.
///
/// A failing task is logged and its package removed; it never stops the loop.
pub fn detect_loop(config: &DetectPipelineConfig, matcher: &SignatureMatcher) -> WorkerStats {
    let mut stats = WorkerStats::default();

    loop {
        let task = match config.channels.tasks.take(&config.deadline, config.poll_interval) {
            Take::Item(task) => task,
            Take::Empty => continue,
            Take::Expired | Take::Closed => break,
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| matcher.detect(&task.apk_file)));
        match outcome {
            Ok(Ok(MatchOutcome::Matched { signatures, .. })) => {
                let result = DetectionResult::new(task, signatures, config.detect_tag.as_str());
                stats.detected += 1;
                if result.is_hit {
                    stats.hits += 1;
                }
                if let Err(e) = config.channels.results.push(result) {
                    log::error!("Dropping detection result: {}", e);
                    break;
                }
            }
            Ok(Ok(MatchOutcome::Undetectable)) => {
                log::warn!("{} is undetectable, removing {}", task.id(), task.apk_file.display());
                stats.undetectable += 1;
                remove_package(&task.apk_file);
            }
            Ok(Err(e)) => {
                log::warn!("Detection of {} failed: {}", task.id(), e);
                stats.failed += 1;
                remove_package(&task.apk_file);
            }
            Err(_) => {
                log::error!("Detection of {} panicked", task.id());
                stats.failed += 1;
                remove_package(&task.apk_file);
            }
        }
    }

    log::debug!(
        "Detection worker exiting: {} detected, {} hits",
        stats.detected,
        stats.hits
    );
    stats
}

/// Delete a local package, ignoring a file that is already gone.
pub fn remove_package(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            log::warn!("{}", Error::file_delete(path, e));
            false
        }
    }
}
