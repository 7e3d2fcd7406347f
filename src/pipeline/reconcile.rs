//! Resumption and migration planning.
//!
//! Before any worker starts, the manifest is compared with the current run's
//! result log and, optionally, with the log of an older run that used a
//! different signature set. Packages already scanned are never planned
//! again. Older results are reused when the current library cannot change
//! their verdict and re-scanned otherwise.

use crate::core::error::Result;
use crate::core::types::{now_epoch_secs, DetectionResult, DetectionTask, DownloadTask, Package};
use crate::detection::signature::SignatureLibrary;
use crate::manifest::Manifest;
use crate::results::{read_results, ResultLog};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

/// How a record from an older run is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorVerdict {
    /// Every matched pattern was retired: rewritten as a zero-match result
    Deprecated,
    /// Nothing matched: reused as-is
    Negative,
    /// At least one matched pattern is still current: scanned again
    Redo,
}

/// Classify an older record against the current library.
pub fn classify_prior(record: &DetectionResult, library: &SignatureLibrary) -> PriorVerdict {
    if record.detection.is_empty() {
        return PriorVerdict::Negative;
    }
    if record.patterns().any(|p| library.contains_pattern(p)) {
        PriorVerdict::Redo
    } else {
        PriorVerdict::Deprecated
    }
}

/// Counts reported by the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    /// Packages in the manifest
    pub manifest: usize,
    /// Identifiers already in the current result log
    pub done: usize,
    pub carried_negative: usize,
    pub deprecated: usize,
    pub must_redo: usize,
    /// Must-redo records skipped because they could not be turned into a task
    pub redo_skipped: usize,
    pub detect_tasks: usize,
    pub download_tasks: usize,
}

/// The work planned for a run.
#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    /// Packages already stored locally
    pub detect_tasks: Vec<DetectionTask>,
    /// Packages that must be fetched first
    pub download_tasks: Vec<DownloadTask>,
    /// Older results reused without scanning, to be appended to the current log
    pub carried_results: Vec<DetectionResult>,
    pub stats: ReconcileStats,
}

impl ReconcilePlan {
    pub fn total_tasks(&self) -> usize {
        self.detect_tasks.len() + self.download_tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_tasks() == 0
    }

    /// Append carried-over results to the current run's log.
    pub fn persist_carried(&self, log: &mut ResultLog) -> Result<usize> {
        for result in &self.carried_results {
            log.append(result)?;
        }
        if !self.carried_results.is_empty() {
            log::info!(
                "Carried {} results over into {}",
                self.carried_results.len(),
                log.path().display()
            );
        }
        Ok(self.carried_results.len())
    }
}

/// Inputs of the reconciler.
pub struct Reconciler<'a> {
    pub manifest: &'a Manifest,
    pub library: &'a SignatureLibrary,
    /// Base directory of the package store
    pub apk_base_dir: &'a Path,
    /// The current run's result log
    pub result_file: &'a Path,
    /// Result log of an older run, if migrating
    pub old_result_file: Option<&'a Path>,
}

impl Reconciler<'_> {
    /// Compute the task set for this run.
    pub fn plan(&self) -> Result<ReconcilePlan> {
        let mut done = read_results(self.result_file)?.ids();
        let mut plan = ReconcilePlan::default();
        plan.stats.manifest = self.manifest.len();
        plan.stats.done = done.len();

        let mut redo = Vec::new();
        if let Some(old_file) = self.old_result_file {
            for record in latest_per_id(read_results(old_file)?.records) {
                if done.contains(&record.id) {
                    continue;
                }
                match classify_prior(&record, self.library) {
                    PriorVerdict::Deprecated => {
                        plan.stats.deprecated += 1;
                        done.insert(record.id.clone());
                        plan.carried_results.push(self.rewrite_deprecated(record));
                    }
                    PriorVerdict::Negative => {
                        plan.stats.carried_negative += 1;
                        done.insert(record.id.clone());
                        plan.carried_results.push(record);
                    }
                    PriorVerdict::Redo => {
                        plan.stats.must_redo += 1;
                        redo.push(record);
                    }
                }
            }
        }

        for package in self.manifest.iter() {
            if !done.contains(&package.id) {
                self.add_task(&mut plan, package.clone());
            }
        }

        for record in redo {
            if self.manifest.contains(&record.id) {
                continue;
            }
            match rebuild_package(&record) {
                Some(package) => self.add_task(&mut plan, package),
                None => {
                    log::warn!(
                        "Cannot rebuild task for {} from its older record, skipping",
                        record.id
                    );
                    plan.stats.redo_skipped += 1;
                }
            }
        }

        plan.stats.detect_tasks = plan.detect_tasks.len();
        plan.stats.download_tasks = plan.download_tasks.len();
        log::info!(
            "Plan: {} in manifest, {} done, {} carried negatives, {} deprecated, {} to redo; {} to detect, {} to download",
            plan.stats.manifest,
            plan.stats.done,
            plan.stats.carried_negative,
            plan.stats.deprecated,
            plan.stats.must_redo,
            plan.stats.detect_tasks,
            plan.stats.download_tasks
        );
        Ok(plan)
    }

    fn add_task(&self, plan: &mut ReconcilePlan, package: Package) {
        if package.storage_path(self.apk_base_dir).exists() {
            plan.detect_tasks
                .push(DetectionTask::new(package, self.apk_base_dir));
        } else {
            plan.download_tasks
                .push(DownloadTask::new(package, self.apk_base_dir));
        }
    }

    fn rewrite_deprecated(&self, record: DetectionResult) -> DetectionResult {
        DetectionResult {
            detection: Vec::new(),
            detect_tag: self.library.tag().to_string(),
            detection_time: now_epoch_secs(),
            is_hit: false,
            ..record
        }
    }
}

/// The last record of every identifier, in order of first appearance.
fn latest_per_id(records: Vec<DetectionResult>) -> Vec<DetectionResult> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut latest: Vec<DetectionResult> = Vec::new();
    for record in records {
        match slots.get(&record.id) {
            Some(&slot) => latest[slot] = record,
            None => {
                slots.insert(record.id.clone(), latest.len());
                latest.push(record);
            }
        }
    }
    latest
}

fn rebuild_package(record: &DetectionResult) -> Option<Package> {
    let package = &record.apk_meta.package;
    if package.id.is_empty() || !package.id.eq_ignore_ascii_case(&record.id) {
        return None;
    }
    Some(Package::new(
        package.id.clone(),
        package.pkg_name.clone(),
        package.dex_date.clone(),
        package.market.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::signature::Signature;
    use crate::results::{load_done_set, ResultLog};
    use std::path::PathBuf;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        base: PathBuf,
        current: PathBuf,
        old: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let base = dir.path().join("apks");
            let current = dir.path().join("current.json");
            let old = dir.path().join("old.json");
            Self {
                _dir: dir,
                base,
                current,
                old,
            }
        }

        fn store(&self, package: &Package) {
            let path = package.storage_path(&self.base);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"bytes").unwrap();
        }

        fn write_old(&self, records: &[DetectionResult]) {
            let mut log = ResultLog::open(&self.old).unwrap();
            for record in records {
                log.append(record).unwrap();
            }
        }

        fn plan(&self, manifest: &Manifest, library: &SignatureLibrary, with_old: bool) -> ReconcilePlan {
            Reconciler {
                manifest,
                library,
                apk_base_dir: &self.base,
                result_file: &self.current,
                old_result_file: with_old.then_some(self.old.as_path()),
            }
            .plan()
            .unwrap()
        }
    }

    fn package(id: &str) -> Package {
        Package::new(id, format!("com.app.{}", id), "2020-01-01", "play")
    }

    fn old_result(pkg: &Package, patterns: &[&str]) -> DetectionResult {
        let task = DetectionTask::new(pkg.clone(), Path::new("/old/apks"));
        let detection = patterns
            .iter()
            .map(|p| Signature::new(*p, "high", "Old"))
            .collect();
        DetectionResult::new(task, detection, "sign_v1")
    }

    fn library(patterns: &[&str]) -> SignatureLibrary {
        SignatureLibrary::new(
            patterns.iter().map(|p| Signature::new(*p, "high", "New")).collect(),
            "sign_v2",
        )
    }

    #[test]
    fn test_fresh_plan_splits_by_presence() {
        let fx = Fixture::new();
        let stored = package("aa01");
        let remote = package("bb02");
        fx.store(&stored);
        let manifest = Manifest::from_packages([stored.clone(), remote.clone()]);

        let plan = fx.plan(&manifest, &library(&["x"]), false);
        assert_eq!(plan.detect_tasks.len(), 1);
        assert_eq!(plan.detect_tasks[0].id(), "aa01");
        assert_eq!(plan.download_tasks.len(), 1);
        assert_eq!(plan.download_tasks[0].id(), "bb02");
        assert_eq!(plan.download_tasks[0].error_count, 0);
        assert!(plan.carried_results.is_empty());
    }

    #[test]
    fn test_done_ids_never_planned() {
        let fx = Fixture::new();
        let first = package("aa01");
        let second = package("bb02");
        let manifest = Manifest::from_packages([first.clone(), second.clone()]);

        let mut log = ResultLog::open(&fx.current).unwrap();
        log.append(&DetectionResult::new(
            DetectionTask::new(first, &fx.base),
            Vec::new(),
            "sign_v2",
        ))
        .unwrap();

        let plan = fx.plan(&manifest, &library(&["x"]), false);
        assert_eq!(plan.stats.done, 1);
        assert_eq!(plan.total_tasks(), 1);
        assert_eq!(plan.download_tasks[0].id(), "bb02");
    }

    #[test]
    fn test_deprecated_match_rewritten_without_scan() {
        let fx = Fixture::new();
        let pkg = package("aa01");
        fx.store(&pkg);
        fx.write_old(&[old_result(&pkg, &["A", "B"])]);
        let manifest = Manifest::from_packages([pkg.clone()]);

        let plan = fx.plan(&manifest, &library(&["C"]), true);
        assert!(plan.is_empty());
        assert_eq!(plan.stats.deprecated, 1);
        assert_eq!(plan.carried_results.len(), 1);

        let carried = &plan.carried_results[0];
        assert_eq!(carried.id, "aa01");
        assert!(carried.detection.is_empty());
        assert!(!carried.is_hit);
        assert_eq!(carried.detect_tag, "sign_v2");
    }

    #[test]
    fn test_negative_carried_and_partial_match_redone() {
        let fx = Fixture::new();
        let negative = package("aa01");
        let partial = package("bb02");
        let orphan = package("cc03");
        fx.write_old(&[
            old_result(&negative, &[]),
            old_result(&partial, &["A", "C"]),
            old_result(&orphan, &["C"]),
        ]);
        let manifest = Manifest::from_packages([negative.clone(), partial.clone()]);

        let plan = fx.plan(&manifest, &library(&["C"]), true);
        assert_eq!(plan.stats.carried_negative, 1);
        assert_eq!(plan.stats.must_redo, 2);
        assert_eq!(plan.carried_results.len(), 1);
        assert_eq!(plan.carried_results[0].detect_tag, "sign_v1");

        // The partial match comes from the manifest, the orphan from its record.
        let ids: Vec<_> = plan.download_tasks.iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec!["bb02", "cc03"]);
        assert_eq!(
            plan.download_tasks[1].apk_file,
            orphan.storage_path(&fx.base)
        );
    }

    #[test]
    fn test_resumption_is_idempotent() {
        let fx = Fixture::new();
        let packages: Vec<_> = ["aa01", "bb02", "cc03"].iter().map(|id| package(id)).collect();
        fx.store(&packages[0]);
        fx.write_old(&[old_result(&packages[1], &["retired"])]);
        let manifest = Manifest::from_packages(packages.clone());
        let lib = library(&["C"]);

        let first = fx.plan(&manifest, &lib, true);
        assert_eq!(first.total_tasks(), 2);

        // Simulate a complete run: carried results plus one result per task.
        let mut log = ResultLog::open(&fx.current).unwrap();
        first.persist_carried(&mut log).unwrap();
        for task in &first.detect_tasks {
            log.append(&DetectionResult::new(task.clone(), Vec::new(), "sign_v2"))
                .unwrap();
        }
        for task in &first.download_tasks {
            log.append(&DetectionResult::new(task.to_detection_task(), Vec::new(), "sign_v2"))
                .unwrap();
        }
        drop(log);

        let second = fx.plan(&manifest, &lib, true);
        assert!(second.is_empty());
        assert!(second.carried_results.is_empty());
        assert_eq!(load_done_set(&fx.current).unwrap().len(), 3);
    }

    #[test]
    fn test_latest_record_wins() {
        let pkg = package("aa01");
        let records = vec![old_result(&pkg, &["A"]), old_result(&pkg, &[])];
        let latest = latest_per_id(records);
        assert_eq!(latest.len(), 1);
        assert!(latest[0].detection.is_empty());
    }

    #[test]
    fn test_classify_prior() {
        let pkg = package("aa01");
        let lib = library(&["C"]);
        assert_eq!(classify_prior(&old_result(&pkg, &[]), &lib), PriorVerdict::Negative);
        assert_eq!(classify_prior(&old_result(&pkg, &["A"]), &lib), PriorVerdict::Deprecated);
        assert_eq!(classify_prior(&old_result(&pkg, &["A", "C"]), &lib), PriorVerdict::Redo);
    }
}
