//! Package download stage.
//!
//! Downloads are streamed from a [`PackageSource`], verified against the
//! package identifier and retried a bounded number of times.

pub mod fetcher;
pub mod retry;
pub mod worker;

pub use fetcher::{AndroZooSource, Downloader, PackageSource};
pub use retry::{RetryDecision, RetryPolicy};
pub use worker::{spawn_download_pools, DownloadPipelineConfig};
