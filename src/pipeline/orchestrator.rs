//! Run supervision and download throttling.

use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::types::{DetectionTask, DownloadTask};
use crate::detection::matcher::SignatureMatcher;
use crate::detection::signature::SignatureLibrary;
use crate::detection::unpack::Unpacker;
use crate::download::fetcher::{Downloader, PackageSource};
use crate::download::retry::RetryPolicy;
use crate::download::worker::{spawn_download_pools, DownloadPipelineConfig};
use crate::pipeline::channels::{ChannelPair, Deadline, Queue};
use crate::pipeline::detect_worker::{spawn_detect_workers, DetectPipelineConfig};
use crate::pipeline::reconcile::ReconcilePlan;
use crate::pipeline::sinks::{DetectResultSink, DownloadResultSink};
use crate::pipeline::stats::{DownloadSinkCounters, DownloadStats, RunStats};
use crate::results::{DownloadErrorLog, ResultLog};
use chrono::Local;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

/// Bounds the combined depth of the detect and download queues.
#[derive(Debug, Clone, Copy)]
pub struct Throttle {
    batch_size: usize,
}

impl Throttle {
    pub fn new(batch_size: usize) -> Self {
        Self { batch_size }
    }

    /// How many download tasks may be enqueued now.
    pub fn capacity(&self, detect_depth: usize, download_depth: usize) -> usize {
        self.batch_size
            .saturating_sub(detect_depth.saturating_add(download_depth))
    }

    /// Move up to `capacity` pending tasks onto the download queue.
    pub fn seed(
        &self,
        pending: &mut VecDeque<DownloadTask>,
        downloads: &Queue<DownloadTask>,
        detect_depth: usize,
    ) -> Result<usize> {
        let count = self
            .capacity(detect_depth, downloads.depth())
            .min(pending.len());
        for task in pending.drain(..count) {
            downloads.push(task)?;
        }
        Ok(count)
    }
}

type DownloadSide = (Vec<JoinHandle<DownloadStats>>, JoinHandle<DownloadSinkCounters>);

/// Wires the stages together and supervises one run.
pub struct Orchestrator {
    config: Config,
    library: Arc<SignatureLibrary>,
    unpacker: Arc<dyn Unpacker>,
    source: Arc<dyn PackageSource>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        library: Arc<SignatureLibrary>,
        unpacker: Arc<dyn Unpacker>,
        source: Arc<dyn PackageSource>,
    ) -> Self {
        Self {
            config,
            library,
            unpacker,
            source,
        }
    }

    /// Execute a plan until the configured deadline.
    ///
    /// Carried-over results are persisted first. An empty plan returns at
    /// once; otherwise the run lasts until the deadline, after which every
    /// worker and sink is joined.
    pub fn run(&self, plan: ReconcilePlan) -> Result<RunStats> {
        let started_at = Local::now();
        let clock = Instant::now();
        let storage = &self.config.storage;
        let settings = &self.config.pipeline;

        let mut result_log = ResultLog::open(&storage.result_file())?;
        plan.persist_carried(&mut result_log)?;

        let mut stats = RunStats::new(started_at, plan.total_tasks() as u64);
        if plan.is_empty() {
            log::info!("Nothing to do");
            stats.settle(clock.elapsed());
            return Ok(stats);
        }

        let deadline = Deadline::after(settings.timeout());
        let detect = DetectPipelineConfig {
            channels: ChannelPair::unbounded("detect tasks", "detect results"),
            deadline,
            poll_interval: settings.poll_interval(),
            workers: self.config.detect.workers,
            detect_tag: self.library.tag().to_string(),
        };
        let download = DownloadPipelineConfig {
            channels: ChannelPair::unbounded("download tasks", "download results"),
            deadline,
            poll_interval: settings.poll_interval(),
            pools: self.config.download.pools,
            threads_per_pool: self.config.download.threads_per_pool,
            batch_per_thread: self.config.download.batch_per_thread,
        };

        let ReconcilePlan {
            detect_tasks,
            download_tasks,
            ..
        } = plan;
        for task in detect_tasks {
            detect.channels.tasks.push(task)?;
        }
        let mut pending: VecDeque<DownloadTask> = download_tasks.into();

        let matcher = SignatureMatcher::new(
            Arc::clone(&self.library),
            Arc::clone(&self.unpacker),
            storage.work_dir(),
        )
        .with_media_extensions(&self.config.detect.media_extensions);

        let detect_handles = spawn_detect_workers(&detect, Arc::new(matcher))?;
        let result_sink = DetectResultSink::new(
            detect.clone(),
            result_log,
            self.config.detect.delete_unmatched,
            settings.log_every_results,
        )
        .with_download_queue(download.channels.tasks.clone())
        .spawn()?;

        let download_side = if pending.is_empty() {
            None
        } else {
            Some(self.spawn_download_side(&download, detect.channels.tasks.clone())?)
        };

        let throttle = Throttle::new(settings.batch_size);
        while !deadline.expired() {
            if !pending.is_empty() {
                let seeded = throttle.seed(
                    &mut pending,
                    &download.channels.tasks,
                    detect.channels.tasks.depth(),
                )?;
                if seeded > 0 {
                    stats.downloads_seeded += seeded as u64;
                    log::debug!("Seeded {} downloads, {} pending", seeded, pending.len());
                    if pending.is_empty() {
                        log::info!("All {} downloads seeded", stats.downloads_seeded);
                    }
                }
            }
            std::thread::sleep(settings.tick_interval().min(deadline.remaining()));
        }
        log::info!("Deadline reached, waiting for workers to stop");

        for stats_part in join_all("detect worker", detect_handles) {
            stats.detection.merge(&stats_part);
        }
        if let Some((pool_handles, sink_handle)) = download_side {
            for stats_part in join_all("download thread", pool_handles) {
                stats.downloads.merge(&stats_part);
            }
            if let Some(counters) = join_all("download sink", vec![sink_handle]).pop() {
                stats.download_sink = counters;
            }
        }
        if let Some(counters) = join_all("result sink", vec![result_sink]).pop() {
            stats.result_sink = counters;
        }

        stats.settle(clock.elapsed());
        for line in stats.summary_lines() {
            log::info!("{}", line);
        }
        Ok(stats)
    }

    fn spawn_download_side(
        &self,
        download: &DownloadPipelineConfig,
        detect_tasks: Queue<DetectionTask>,
    ) -> Result<DownloadSide> {
        let downloader = Arc::new(Downloader::new(
            Arc::clone(&self.source),
            self.config.download.overwrite,
        ));
        let pools = spawn_download_pools(download, downloader)?;
        let sink = DownloadResultSink::new(
            download.clone(),
            detect_tasks,
            RetryPolicy::new(self.config.download.error_count_limit),
            DownloadErrorLog::open(&self.config.storage.download_error_file())?,
            self.config.pipeline.log_every_downloads,
        )
        .spawn()?;
        Ok((pools, sink))
    }
}

/// Join threads, logging the ones that panicked.
fn join_all<T>(what: &str, handles: Vec<JoinHandle<T>>) -> Vec<T> {
    handles
        .into_iter()
        .filter_map(|handle| {
            let name = handle.thread().name().unwrap_or(what).to_string();
            match handle.join() {
                Ok(value) => Some(value),
                Err(_) => {
                    log::error!("{}", Error::WorkerPanic { name });
                    None
                }
            }
        })
        .collect()
}
