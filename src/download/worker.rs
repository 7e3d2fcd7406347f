//! Download worker pools.

use crate::core::error::{Error, Result};
use crate::core::types::{DownloadOutcome, DownloadReport, DownloadTask};
use crate::download::fetcher::Downloader;
use crate::pipeline::channels::{ChannelPair, Deadline, Take};
use crate::pipeline::stats::DownloadStats;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// What the download stage needs from the orchestrator.
#[derive(Clone)]
pub struct DownloadPipelineConfig {
    pub channels: ChannelPair<DownloadTask, DownloadReport>,
    pub deadline: Deadline,
    pub poll_interval: Duration,
    pub pools: usize,
    pub threads_per_pool: usize,
    pub batch_per_thread: usize,
}

/// Spawn `pools × threads_per_pool` download threads.
pub fn spawn_download_pools(
    config: &DownloadPipelineConfig,
    downloader: Arc<Downloader>,
) -> Result<Vec<JoinHandle<DownloadStats>>> {
    let mut handles = Vec::with_capacity(config.pools * config.threads_per_pool);

    for pool in 0..config.pools {
        for thread in 0..config.threads_per_pool {
            let name = format!("download-{}-{}", pool, thread);
            let config = config.clone();
            let downloader = Arc::clone(&downloader);
            let handle = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || download_loop(&config, &downloader))
                .map_err(|source| Error::WorkerSpawn { name, source })?;
            handles.push(handle);
        }
    }

    log::info!(
        "Started {} download pools with {} threads each",
        config.pools,
        config.threads_per_pool
    );
    Ok(handles)
}

/// Take batches of download tasks until the deadline and report every outcome.
pub fn download_loop(config: &DownloadPipelineConfig, downloader: &Downloader) -> DownloadStats {
    let mut stats = DownloadStats::default();
    let tasks = &config.channels.tasks;
    let batch_size = config.batch_per_thread.max(1);

    loop {
        let first = match tasks.take(&config.deadline, config.poll_interval) {
            Take::Item(task) => task,
            Take::Empty => continue,
            Take::Expired | Take::Closed => break,
        };

        let mut batch = Vec::with_capacity(batch_size);
        batch.push(first);
        while batch.len() < batch_size {
            match tasks.try_take() {
                Some(task) => batch.push(task),
                None => break,
            }
        }

        for task in batch {
            stats.attempted += 1;
            let outcome = downloader.download(&task);
            match &outcome {
                DownloadOutcome::Fetched { bytes } => {
                    stats.fetched += 1;
                    stats.bytes += bytes;
                }
                DownloadOutcome::Skipped => stats.skipped += 1,
                DownloadOutcome::Failed { .. } => stats.failed += 1,
            }

            if let Err(e) = config.channels.results.push(DownloadReport { task, outcome }) {
                log::error!("Dropping download report: {}", e);
                return stats;
            }
        }
    }

    log::debug!(
        "Download thread exiting: {} attempted, {} fetched",
        stats.attempted,
        stats.fetched
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FailureKind, Package};
    use crate::download::fetcher::testing::MemorySource;
    use tempfile::tempdir;

    fn config(deadline: Deadline) -> DownloadPipelineConfig {
        DownloadPipelineConfig {
            channels: ChannelPair::unbounded("download tasks", "download results"),
            deadline,
            poll_interval: Duration::from_millis(20),
            pools: 2,
            threads_per_pool: 2,
            batch_per_thread: 3,
        }
    }

    #[test]
    fn test_loop_reports_every_task() {
        let dir = tempdir().unwrap();
        let mut source = MemorySource::new();
        let good = source.add(b"good package");
        let downloader = Downloader::new(Arc::new(source), false);

        let config = config(Deadline::after(Duration::from_millis(300)));
        for id in [good.as_str(), "0badc0de"] {
            let task = DownloadTask::new(Package::bare(id, "com.example"), dir.path());
            config.channels.tasks.push(task).unwrap();
        }

        let stats = download_loop(&config, &downloader);
        assert_eq!(stats.attempted, 2);
        assert_eq!(stats.fetched, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(config.channels.results.depth(), 2);

        let mut kinds = Vec::new();
        while let Some(report) = config.channels.results.try_take() {
            if let DownloadOutcome::Failed { kind, .. } = report.outcome {
                kinds.push(kind);
            }
        }
        assert_eq!(kinds, vec![FailureKind::Transient]);
    }

    #[test]
    fn test_pools_stop_at_deadline() {
        let downloader = Arc::new(Downloader::new(Arc::new(MemorySource::new()), false));
        let config = config(Deadline::after(Duration::from_millis(100)));

        let handles = spawn_download_pools(&config, downloader).unwrap();
        assert_eq!(handles.len(), 4);

        let mut total = DownloadStats::default();
        for handle in handles {
            total.merge(&handle.join().unwrap());
        }
        assert_eq!(total.attempted, 0);
    }
}
