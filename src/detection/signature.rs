//! Signature library types and loading.

use crate::core::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// A single detection signature.
///
/// The pattern is an exact substring, never a regular expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    /// Substring searched for in package bytes, entry paths and decoded content
    #[serde(alias = "sign_str")]
    pub pattern: String,
    /// Confidence label as given by the provider
    #[serde(deserialize_with = "label_from_any", default)]
    pub confidence: String,
    /// Name of the provider the pattern belongs to
    #[serde(default)]
    pub provider: String,
}

impl Signature {
    /// Create a new signature.
    pub fn new(
        pattern: impl Into<String>,
        confidence: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            confidence: confidence.into(),
            provider: provider.into(),
        }
    }
}

/// Accept a JSON string or number and keep it as a text label.
fn label_from_any<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(label(serde_json::Value::deserialize(deserializer)?))
}

fn label(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// One provider line of the signature file.
#[derive(Debug, Deserialize)]
struct ProviderEntry {
    #[serde(alias = "provider_name")]
    pname: String,
    #[serde(default)]
    signs: Vec<Vec<serde_json::Value>>,
}

/// The ordered set of signatures active for one run.
#[derive(Debug, Clone)]
pub struct SignatureLibrary {
    signatures: Vec<Signature>,
    tag: String,
    patterns: HashSet<String>,
}

impl SignatureLibrary {
    /// Build a library from signatures in match-report order.
    pub fn new(signatures: Vec<Signature>, tag: impl Into<String>) -> Self {
        let patterns = signatures.iter().map(|s| s.pattern.clone()).collect();
        Self {
            signatures,
            tag: tag.into(),
            patterns,
        }
    }

    /// Load a JSON-lines signature file.
    ///
    /// Each line is `{"pname": provider, "signs": [[pattern, confidence], ...]}`.
    /// Blank lines are ignored; any other malformed line fails the load.
    pub fn load(path: &Path, tag: impl Into<String>) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| Error::file_read(path, e))?;
        let reader = BufReader::new(file);
        let mut signatures = Vec::new();

        for (index, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| Error::file_read(path, e))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let entry: ProviderEntry = serde_json::from_str(line).map_err(|e| {
                Error::SignatureLoad(format!("{}:{}: {}", path.display(), index + 1, e))
            })?;

            for sign in entry.signs {
                // Items are [pattern, confidence, ...]; trailing fields are ignored.
                let mut fields = sign.into_iter();
                let pattern = match fields.next() {
                    Some(serde_json::Value::String(p)) => p,
                    other => {
                        return Err(Error::SignatureLoad(format!(
                            "{}:{}: expected a pattern string, found {}",
                            path.display(),
                            index + 1,
                            other.map_or_else(|| "nothing".to_string(), |v| v.to_string())
                        )))
                    }
                };
                if pattern.is_empty() {
                    log::warn!(
                        "Skipping empty pattern from provider {} at line {}",
                        entry.pname,
                        index + 1
                    );
                    continue;
                }
                let confidence = fields.next().map(label).unwrap_or_default();
                signatures.push(Signature::new(pattern, confidence, entry.pname.clone()));
            }
        }

        let library = Self::new(signatures, tag);
        log::info!(
            "Loaded {} signatures ({} unique patterns) from {}",
            library.len(),
            library.pattern_count(),
            path.display()
        );
        Ok(library)
    }

    /// Signatures in library order.
    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    /// Signature-set version tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Whether the pattern belongs to this library.
    pub fn contains_pattern(&self, pattern: &str) -> bool {
        self.patterns.contains(pattern)
    }

    /// Distinct patterns, in first-seen library order.
    pub fn unique_patterns(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.signatures
            .iter()
            .map(|s| s.pattern.as_str())
            .filter(|p| seen.insert(*p))
            .collect()
    }

    /// Number of distinct patterns.
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}
