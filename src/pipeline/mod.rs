//! The download, detect and persist pipeline.
//!
//! [`Reconciler`] turns a manifest and the result log into a [`ReconcilePlan`];
//! [`Orchestrator`] executes the plan with worker threads connected by
//! [`Queue`]s until the run deadline.

pub mod channels;
pub mod detect_worker;
pub mod orchestrator;
pub mod reconcile;
pub mod sinks;
pub mod stats;

pub use channels::{ChannelPair, Deadline, Queue, Take};
pub use detect_worker::{spawn_detect_workers, DetectPipelineConfig};
pub use orchestrator::{Orchestrator, Throttle};
pub use reconcile::{ReconcilePlan, ReconcileStats, Reconciler};
pub use sinks::{DetectResultSink, DownloadResultSink};
pub use stats::RunStats;
