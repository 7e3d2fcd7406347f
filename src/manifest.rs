//! Package manifest loading.
//!
//! The manifest is a CSV file in the AndroZoo `latest.csv` layout. Only four
//! columns are used: the SHA-256 (field 0), the dex date (field 3), the
//! package name (field 5) and the market (last field).

use crate::core::error::{Error, Result};
use crate::core::types::Package;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::path::Path;

const SHA256_FIELD: usize = 0;
const DEX_DATE_FIELD: usize = 3;
const PKG_NAME_FIELD: usize = 5;

/// Exclusive date bounds on the dex date.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateFilter {
    pub after: Option<NaiveDate>,
    pub before: Option<NaiveDate>,
}

impl DateFilter {
    pub fn new(after: Option<NaiveDate>, before: Option<NaiveDate>) -> Self {
        Self { after, before }
    }

    pub fn is_active(&self) -> bool {
        self.after.is_some() || self.before.is_some()
    }

    /// Whether a package with this dex date passes the filter.
    ///
    /// Both bounds must hold. With any bound set, an empty or unparsable
    /// date is rejected.
    pub fn accepts(&self, dex_date: &str) -> bool {
        if !self.is_active() {
            return true;
        }
        let Some(date) = parse_date(dex_date) else {
            return false;
        };
        self.after.map_or(true, |after| date > after) && self.before.map_or(true, |before| date < before)
    }
}

/// Parse a `YYYY-MM-DD` date.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()
}

/// Packages listed in a manifest, in file order, unique by identifier.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    packages: Vec<Package>,
    index: HashMap<String, usize>,
}

impl Manifest {
    /// Load a manifest, keeping rows that pass `filter`.
    pub fn load(path: &Path, filter: &DateFilter) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .map_err(|e| Error::ManifestLoad {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let mut manifest = Manifest::default();
        let mut skipped = 0usize;
        let mut filtered = 0usize;

        for (index, record) in reader.records().enumerate() {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    log::warn!("Skipping manifest row {}: {}", index + 2, e);
                    skipped += 1;
                    continue;
                }
            };

            let Some(package) = package_from_record(&record) else {
                log::warn!("Skipping short or empty manifest row {}", index + 2);
                skipped += 1;
                continue;
            };

            if !filter.accepts(&package.dex_date) {
                filtered += 1;
                continue;
            }
            manifest.insert(package);
        }

        log::info!(
            "Loaded {} packages from {} ({} skipped, {} outside date range)",
            manifest.len(),
            path.display(),
            skipped,
            filtered
        );
        Ok(manifest)
    }

    /// Build a manifest from packages; later duplicates are ignored.
    pub fn from_packages(packages: impl IntoIterator<Item = Package>) -> Self {
        let mut manifest = Manifest::default();
        for package in packages {
            manifest.insert(package);
        }
        manifest
    }

    fn insert(&mut self, package: Package) {
        if self.index.contains_key(&package.id) {
            log::debug!("Duplicate manifest entry {}", package.id);
            return;
        }
        self.index.insert(package.id.clone(), self.packages.len());
        self.packages.push(package);
    }

    pub fn get(&self, id: &str) -> Option<&Package> {
        self.index.get(id).map(|&i| &self.packages[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Package> {
        self.packages.iter()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

fn package_from_record(record: &csv::StringRecord) -> Option<Package> {
    if record.len() <= PKG_NAME_FIELD {
        return None;
    }

    let id = record.get(SHA256_FIELD)?.trim();
    if id.is_empty() {
        return None;
    }

    let dex_date = record
        .get(DEX_DATE_FIELD)
        .and_then(|d| d.split(' ').next())
        .unwrap_or_default()
        .trim();
    let pkg_name = record.get(PKG_NAME_FIELD)?.trim().trim_matches('"');
    let market = record.get(record.len() - 1).unwrap_or_default().trim();

    Some(Package::new(id, pkg_name, dex_date, market))
}
