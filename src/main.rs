//! apk-sigscan: resumable download and signature scan of Android packages.
//!
//! This is the main entry point for the CLI application.

use apk_sigscan::core::config::Config;
use apk_sigscan::core::error::{Error, Result};
use apk_sigscan::credentials::load_api_key;
use apk_sigscan::detection::{build_unpacker, MatchOutcome, SignatureLibrary, SignatureMatcher};
use apk_sigscan::download::AndroZooSource;
use apk_sigscan::manifest::Manifest;
use apk_sigscan::pipeline::{Orchestrator, ReconcilePlan, ReconcileStats, Reconciler};
use apk_sigscan::ui::cli::{Cli, Commands, ConfigAction, OutputFormat, RunArgs};
use apk_sigscan::utils::logging::{init_logging, LogConfig};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            if let Some(hint) = e.suggestion() {
                eprintln!("Hint: {}", hint);
            }
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();
    let mut config = Config::load_or_default(cli.config.as_deref())?;

    let log_config = if cli.verbose {
        LogConfig {
            file_path: config.logging.log_file.clone(),
            ..LogConfig::verbose()
        }
    } else {
        LogConfig::from_config(&config)
    };
    init_logging(log_config)?;

    log::debug!("apk-sigscan v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Some(Commands::Run(args)) => {
            args.apply(&mut config);
            config.validate()?;
            run_pipeline(&config, &args, cli.format)
        }
        Some(Commands::Plan(args)) => {
            args.apply(&mut config);
            run_plan(&config, &args, cli.format)
        }
        Some(Commands::Detect {
            file,
            signatures,
            apk_tool,
            unpacker,
        }) => {
            if apk_tool.is_some() {
                config.detect.apk_tool = apk_tool;
            }
            if let Some(kind) = unpacker {
                config.detect.unpacker = kind;
            }
            run_detect(&config, &file, &signatures, cli.format)
        }
        Some(Commands::Config { action }) => {
            run_config(action, &config, cli.config.as_deref())
        }
        None => {
            println!("apk-sigscan - download Android packages and match them against signatures");
            println!();
            println!("Use --help for usage information");
            println!();
            println!("Quick start:");
            println!("  apk-sigscan plan <apk_dir> <manifest> <signs> <result_dir> <key_file>");
            println!("  apk-sigscan run  <apk_dir> <manifest> <signs> <result_dir> <key_file>");
            println!("  apk-sigscan detect <package.apk> <signs>");
            Ok(())
        }
    }
}

/// Load inputs and reconcile them with the result log.
fn build_plan(config: &Config, args: &RunArgs) -> Result<(Arc<SignatureLibrary>, ReconcilePlan)> {
    let library = Arc::new(SignatureLibrary::load(
        &args.signatures,
        config.detect.detect_tag.as_str(),
    )?);
    let manifest = Manifest::load(&args.manifest, &args.date_filter()?)?;

    let result_file = config.storage.result_file();
    let plan = Reconciler {
        manifest: &manifest,
        library: &library,
        apk_base_dir: &config.storage.apk_base_dir,
        result_file: &result_file,
        old_result_file: args.old_results.as_deref(),
    }
    .plan()?;

    Ok((library, plan))
}

/// Run the full pipeline until the timeout.
fn run_pipeline(config: &Config, args: &RunArgs, format: OutputFormat) -> Result<()> {
    let api_key = load_api_key(&args.api_key_file)?;
    std::fs::create_dir_all(&config.storage.result_dir)
        .map_err(|e| Error::directory_access(&config.storage.result_dir, e))?;
    let (library, plan) = build_plan(config, args)?;
    log_plan(&plan.stats);

    let unpacker = build_unpacker(&config.detect)?;
    let source = AndroZooSource::new(
        &config.download.endpoint,
        api_key,
        Duration::from_secs(config.download.connect_timeout_secs),
        Duration::from_secs(config.download.read_timeout_secs),
    )?;

    let orchestrator = Orchestrator::new(
        config.clone(),
        library,
        Arc::from(unpacker),
        Arc::new(source),
    );
    let stats = orchestrator.run(plan)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
        OutputFormat::Text => {
            for line in stats.summary_lines() {
                println!("{}", line);
            }
        }
    }
    Ok(())
}

/// Report what a run would do without downloading or scanning.
fn run_plan(config: &Config, args: &RunArgs, format: OutputFormat) -> Result<()> {
    let (_, plan) = build_plan(config, args)?;
    let stats = &plan.stats;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(stats)?),
        OutputFormat::Text => {
            println!("Manifest packages:     {}", stats.manifest);
            println!("Already done:          {}", stats.done);
            println!("Carried negatives:     {}", stats.carried_negative);
            println!("Deprecated rewrites:   {}", stats.deprecated);
            println!("Must redo:             {}", stats.must_redo);
            println!("Redo skipped:          {}", stats.redo_skipped);
            println!("Detect tasks:          {}", stats.detect_tasks);
            println!("Download tasks:        {}", stats.download_tasks);
        }
    }
    Ok(())
}

fn log_plan(stats: &ReconcileStats) {
    log::info!(
        "{} packages in manifest, {} done; {} to detect, {} to download",
        stats.manifest,
        stats.done,
        stats.detect_tasks,
        stats.download_tasks
    );
}

/// Match one local package and print the verdict.
fn run_detect(config: &Config, file: &Path, signatures: &Path, format: OutputFormat) -> Result<()> {
    if !file.exists() {
        return Err(Error::PathNotFound(file.to_path_buf()));
    }

    let library = Arc::new(SignatureLibrary::load(
        signatures,
        config.detect.detect_tag.as_str(),
    )?);
    let unpacker = build_unpacker(&config.detect)?;
    let work_dir = config
        .storage
        .work_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("apk-sigscan"));
    let matcher = SignatureMatcher::new(library, Arc::from(unpacker), work_dir)
        .with_media_extensions(&config.detect.media_extensions);

    let outcome = matcher.detect(file)?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&detect_report(file, &outcome))?)
        }
        OutputFormat::Text => match &outcome {
            MatchOutcome::Undetectable => println!("{}: could not be unpacked", file.display()),
            MatchOutcome::Matched { signatures, .. } if signatures.is_empty() => {
                println!("{}: no signatures matched", file.display())
            }
            MatchOutcome::Matched { signatures, .. } => {
                println!("{}: {} signatures matched", file.display(), signatures.len());
                for sig in signatures {
                    println!("  {:<40} {:<8} {}", sig.pattern, sig.confidence, sig.provider);
                }
            }
        },
    }
    Ok(())
}

/// JSON form of a single-file verdict; undetectable is distinct from no match.
fn detect_report(file: &Path, outcome: &MatchOutcome) -> serde_json::Value {
    match outcome {
        MatchOutcome::Matched {
            signatures,
            unpacked,
        } => serde_json::json!({
            "file": file.display().to_string(),
            "outcome": "matched",
            "is_hit": !signatures.is_empty(),
            "unpacked": unpacked,
            "signatures": signatures,
        }),
        MatchOutcome::Undetectable => serde_json::json!({
            "file": file.display().to_string(),
            "outcome": "undetectable",
            "is_hit": false,
            "signatures": [],
        }),
    }
}

/// Handle configuration commands.
fn run_config(action: ConfigAction, config: &Config, custom_path: Option<&Path>) -> Result<()> {
    let path: PathBuf = custom_path
        .map(Path::to_path_buf)
        .unwrap_or_else(Config::default_config_path);

    match action {
        ConfigAction::Show => {
            println!("{}", serde_json::to_string_pretty(config)?);
        }
        ConfigAction::Reset { yes } => {
            if !yes && path.exists() {
                println!("Refusing to overwrite {} without --yes", path.display());
                return Ok(());
            }
            log::info!("Resetting configuration to defaults...");
            Config::default().save(&path)?;
            println!("Configuration reset to defaults.");
        }
        ConfigAction::Path => {
            println!("{}", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use apk_sigscan::detection::Signature;

    #[test]
    fn test_detect_report_separates_undetectable() {
        let file = Path::new("/apks/p.apk");
        let undetectable = detect_report(file, &MatchOutcome::Undetectable);
        let clean = detect_report(
            file,
            &MatchOutcome::Matched {
                signatures: Vec::new(),
                unpacked: true,
            },
        );
        assert_eq!(undetectable["outcome"], "undetectable");
        assert_eq!(clean["outcome"], "matched");
        assert_ne!(undetectable, clean);

        let hit = detect_report(
            file,
            &MatchOutcome::Matched {
                signatures: vec![Signature::new("evil_sdk", "high", "Evil")],
                unpacked: false,
            },
        );
        assert_eq!(hit["is_hit"], true);
        assert_eq!(hit["signatures"][0]["pattern"], "evil_sdk");
    }
}
