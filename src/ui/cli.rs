//! Command-line interface definition.

use crate::core::config::{Config, UnpackerKind};
use crate::core::error::{Error, Result};
use crate::manifest::{parse_date, DateFilter};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// apk-sigscan: download Android packages and match them against signatures
#[derive(Parser, Debug)]
#[command(name = "apk-sigscan")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json)
    #[arg(long, default_value = "text", global = true)]
    pub format: OutputFormat,

    /// Configuration file to use instead of the default location
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine processing
    Json,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download, detect and persist until the timeout
    Run(RunArgs),

    /// Reconcile the manifest with the result log and report the plan
    Plan(RunArgs),

    /// Match a single local package against a signature file
    Detect {
        /// Package file to inspect
        file: PathBuf,

        /// Signature file (JSON lines)
        signatures: PathBuf,

        /// Path to the apktool executable
        #[arg(long)]
        apk_tool: Option<PathBuf>,

        /// Unpacker used for the content phase
        #[arg(long, value_enum)]
        unpacker: Option<UnpackerKind>,
    },

    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Inputs and overrides shared by `run` and `plan`.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Directory holding the sharded package store
    pub apk_base_dir: PathBuf,

    /// Package manifest (CSV with a header row)
    pub manifest: PathBuf,

    /// Signature file (JSON lines)
    pub signatures: PathBuf,

    /// Directory for the result log and download error log
    pub result_dir: PathBuf,

    /// File holding the repository API key
    pub api_key_file: PathBuf,

    /// Path to the apktool executable
    #[arg(long)]
    pub apk_tool: Option<PathBuf>,

    /// Tag identifying the signature set
    #[arg(long)]
    pub detect_tag: Option<String>,

    /// Number of detection workers
    #[arg(long)]
    pub detect_workers: Option<usize>,

    /// Number of download pools
    #[arg(long)]
    pub download_pools: Option<usize>,

    /// Threads per download pool
    #[arg(long)]
    pub download_threads: Option<usize>,

    /// Run duration in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Only packages with a dex date after this day (YYYY-MM-DD)
    #[arg(long)]
    pub after: Option<String>,

    /// Only packages with a dex date before this day (YYYY-MM-DD)
    #[arg(long)]
    pub before: Option<String>,

    /// Result log of an earlier signature set to reuse
    #[arg(long)]
    pub old_results: Option<PathBuf>,

    /// Unpacker used for the content phase
    #[arg(long, value_enum)]
    pub unpacker: Option<UnpackerKind>,

    /// Keep packages that matched no signature
    #[arg(long)]
    pub keep_unmatched: bool,
}

impl RunArgs {
    /// Apply the positional paths and overrides to a loaded configuration.
    pub fn apply(&self, config: &mut Config) {
        config.storage.apk_base_dir = self.apk_base_dir.clone();
        config.storage.result_dir = self.result_dir.clone();

        if let Some(tool) = &self.apk_tool {
            config.detect.apk_tool = Some(tool.clone());
        }
        if let Some(tag) = &self.detect_tag {
            config.detect.detect_tag = tag.clone();
        }
        if let Some(workers) = self.detect_workers {
            config.detect.workers = workers;
        }
        if let Some(pools) = self.download_pools {
            config.download.pools = pools;
        }
        if let Some(threads) = self.download_threads {
            config.download.threads_per_pool = threads;
        }
        if let Some(timeout) = self.timeout {
            config.pipeline.timeout_secs = timeout;
        }
        if let Some(unpacker) = self.unpacker {
            config.detect.unpacker = unpacker;
        }
        if self.keep_unmatched {
            config.detect.delete_unmatched = false;
        }
    }

    /// Parse `--after` and `--before` into a date filter.
    pub fn date_filter(&self) -> Result<DateFilter> {
        Ok(DateFilter::new(
            parse_bound("after", self.after.as_deref())?,
            parse_bound("before", self.before.as_deref())?,
        ))
    }
}

fn parse_bound(field: &str, value: Option<&str>) -> Result<Option<chrono::NaiveDate>> {
    value
        .map(|v| {
            parse_date(v).ok_or_else(|| Error::ConfigInvalid {
                field: field.to_string(),
                message: format!("'{}' is not a YYYY-MM-DD date", v),
            })
        })
        .transpose()
}

/// Configuration subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Reset configuration to defaults
    Reset {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Print configuration file location
    Path,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
