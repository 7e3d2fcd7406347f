//! Signature matching engine.
//!
//! A package is tested in two phases. The raw bytes are searched first; only
//! patterns that survive are looked for in the unpacked tree, by entry path
//! and by decoded entry content. A pattern leaves the candidate set as soon as
//! it matches and is never tested again.

use crate::core::error::{Error, Result};
use crate::detection::decode::decode_escaped;
use crate::detection::signature::{Signature, SignatureLibrary};
use crate::detection::unpack::{ScratchDir, Unpacker};
use crate::utils::hash::HashCalculator;
use memchr::memmem;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// Extensions whose content is never inspected.
pub const DEFAULT_MEDIA_EXTENSIONS: &[&str] = &["png", "jpeg", "gif", "jpg", "mp3", "mp4"];

/// Result of matching one package.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// Matching completed; `signatures` may be empty.
    Matched {
        /// Every library record whose pattern matched, in library order
        signatures: Vec<Signature>,
        /// Whether the unpacked tree had to be inspected
        unpacked: bool,
    },
    /// The package could not be unpacked and some patterns were left untested.
    Undetectable,
}

impl MatchOutcome {
    /// Matched signatures, empty for undetectable packages.
    pub fn signatures(&self) -> &[Signature] {
        match self {
            MatchOutcome::Matched { signatures, .. } => signatures,
            MatchOutcome::Undetectable => &[],
        }
    }
}

/// Matches package files against a signature library.
pub struct SignatureMatcher {
    library: Arc<SignatureLibrary>,
    unpacker: Arc<dyn Unpacker>,
    work_dir: PathBuf,
    media_extensions: HashSet<String>,
}

impl SignatureMatcher {
    /// Create a matcher that unpacks into subdirectories of `work_dir`.
    pub fn new(
        library: Arc<SignatureLibrary>,
        unpacker: Arc<dyn Unpacker>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            library,
            unpacker,
            work_dir: work_dir.into(),
            media_extensions: DEFAULT_MEDIA_EXTENSIONS
                .iter()
                .map(|e| e.to_string())
                .collect(),
        }
    }

    /// Replace the set of extensions skipped for content inspection.
    pub fn with_media_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.media_extensions = extensions
            .into_iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_lowercase())
            .collect();
        self
    }

    pub fn library(&self) -> &SignatureLibrary {
        &self.library
    }

    /// Match one package file.
    ///
    /// Fails only when the package itself cannot be read.
    pub fn detect(&self, package_file: &Path) -> Result<MatchOutcome> {
        let bytes = std::fs::read(package_file).map_err(|e| Error::file_read(package_file, e))?;

        let mut remaining = self.library.unique_patterns();
        let mut matched: HashSet<&str> = HashSet::new();

        take_matches(&mut remaining, &mut matched, |p| {
            memmem::find(&bytes, p.as_bytes()).is_some()
        });

        let mut unpacked = false;
        if !remaining.is_empty() {
            let digest = HashCalculator::md5_bytes(&bytes);
            drop(bytes);

            std::fs::create_dir_all(&self.work_dir)
                .map_err(|e| Error::directory_access(&self.work_dir, e))?;
            let scratch = ScratchDir::new(self.work_dir.join(&digest));

            if let Err(e) = self.unpacker.unpack(package_file, scratch.path()) {
                log::warn!(
                    "{} could not unpack {}: {}",
                    self.unpacker.name(),
                    package_file.display(),
                    e
                );
                return Ok(MatchOutcome::Undetectable);
            }
            unpacked = true;

            self.match_tree(scratch.path(), &mut remaining, &mut matched);
        }

        let signatures = self
            .library
            .signatures()
            .iter()
            .filter(|s| matched.contains(s.pattern.as_str()))
            .cloned()
            .collect();

        Ok(MatchOutcome::Matched {
            signatures,
            unpacked,
        })
    }

    /// Test remaining patterns against every entry of an unpacked tree.
    fn match_tree<'a>(
        &self,
        root: &Path,
        remaining: &mut Vec<&'a str>,
        matched: &mut HashSet<&'a str>,
    ) {
        for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                    continue;
                }
            };

            let relative = relative_slash_path(root, entry.path());
            take_matches(remaining, matched, |p| relative.contains(p));

            if !remaining.is_empty() && entry.file_type().is_file() && !self.is_media(entry.path())
            {
                match std::fs::read(entry.path()) {
                    Ok(content) => {
                        let text = decode_escaped(&content);
                        take_matches(remaining, matched, |p| text.contains(p));
                    }
                    Err(e) => {
                        log::warn!("Skipping {}: {}", entry.path().display(), e);
                    }
                }
            }

            if remaining.is_empty() {
                break;
            }
        }
    }

    fn is_media(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.media_extensions.contains(&e.to_lowercase()))
            .unwrap_or(false)
    }
}

/// Move every pattern accepted by `hit` from `remaining` to `matched`.
fn take_matches<'a, F>(remaining: &mut Vec<&'a str>, matched: &mut HashSet<&'a str>, hit: F)
where
    F: Fn(&str) -> bool,
{
    remaining.retain(|pattern| {
        if hit(*pattern) {
            matched.insert(*pattern);
            false
        } else {
            true
        }
    });
}

/// Path of `path` below `root`, `/`-separated.
fn relative_slash_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::unpack::ZipUnpacker;
    use std::io::{Cursor, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    /// Counts invocations and delegates to the zip unpacker.
    struct CountingUnpacker {
        inner: ZipUnpacker,
        calls: AtomicUsize,
    }

    impl CountingUnpacker {
        fn new() -> Self {
            Self {
                inner: ZipUnpacker::new(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Unpacker for CountingUnpacker {
        fn unpack(&self, src: &Path, dest: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.unpack(src, dest)
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    /// Leaves a partial tree behind and fails.
    struct FailingUnpacker;

    impl Unpacker for FailingUnpacker {
        fn unpack(&self, src: &Path, dest: &Path) -> Result<()> {
            std::fs::create_dir_all(dest.join("partial")).unwrap();
            std::fs::write(dest.join("partial/junk.txt"), b"junk").unwrap();
            Err(Error::unpack(src, "simulated failure"))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    /// Writes a fixed tree regardless of the package contents.
    struct TreeUnpacker(Vec<(&'static str, &'static [u8])>);

    impl Unpacker for TreeUnpacker {
        fn unpack(&self, _src: &Path, dest: &Path) -> Result<()> {
            for (name, content) in &self.0 {
                let path = dest.join(name);
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(path, content).unwrap();
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "tree"
        }
    }

    /// A deflated zip package with the given entries.
    fn build_apk(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buffer);
            let options = SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            for (name, content) in entries {
                zip.start_file(*name, options).unwrap();
                zip.write_all(content).unwrap();
            }
            zip.finish().unwrap();
        }
        buffer.into_inner()
    }

    fn library(patterns: &[(&str, &str)]) -> Arc<SignatureLibrary> {
        let sigs = patterns
            .iter()
            .map(|(pattern, provider)| Signature::new(*pattern, "high", *provider))
            .collect();
        Arc::new(SignatureLibrary::new(sigs, "sign_test"))
    }

    fn remaining_scratch(work_dir: &Path) -> usize {
        match std::fs::read_dir(work_dir) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    #[test]
    fn test_raw_bytes_hit_skips_unpack() {
        let dir = tempdir().unwrap();
        let apk = dir.path().join("p1.apk");
        std::fs::write(&apk, b"PK\x03\x04 header evil_sdk trailer").unwrap();

        let unpacker = Arc::new(CountingUnpacker::new());
        let work_dir = dir.path().join("work");
        let matcher = SignatureMatcher::new(
            library(&[("evil_sdk", "Evil")]),
            unpacker.clone(),
            &work_dir,
        );

        let outcome = matcher.detect(&apk).unwrap();
        assert_eq!(unpacker.calls.load(Ordering::SeqCst), 0);
        match outcome {
            MatchOutcome::Matched { signatures, unpacked } => {
                assert!(!unpacked);
                assert_eq!(signatures.len(), 1);
                assert_eq!(signatures[0].provider, "Evil");
            }
            MatchOutcome::Undetectable => panic!("expected a match"),
        }
        assert_eq!(remaining_scratch(&work_dir), 0);
    }

    #[test]
    fn test_unpacked_content_hit_unpacks_once() {
        let dir = tempdir().unwrap();
        let apk = dir.path().join("p2.apk");
        // Deflate hides the repeated pattern from the raw-byte phase.
        let smali = "const-string v0, \"evil_sdk\"\n".repeat(64);
        std::fs::write(
            &apk,
            build_apk(&[("smali/a/B.smali", smali.as_bytes())]),
        )
        .unwrap();
        let raw = std::fs::read(&apk).unwrap();
        assert!(memmem::find(&raw, b"evil_sdk").is_none());

        let unpacker = Arc::new(CountingUnpacker::new());
        let work_dir = dir.path().join("work");
        let matcher = SignatureMatcher::new(
            library(&[("evil_sdk", "Evil")]),
            unpacker.clone(),
            &work_dir,
        );

        let outcome = matcher.detect(&apk).unwrap();
        assert_eq!(unpacker.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.signatures().len(), 1);
        assert!(matches!(outcome, MatchOutcome::Matched { unpacked: true, .. }));
        assert_eq!(remaining_scratch(&work_dir), 0);
    }

    #[test]
    fn test_path_match_and_media_skip() {
        let dir = tempdir().unwrap();
        let apk = dir.path().join("p3.apk");
        std::fs::write(&apk, b"opaque package bytes").unwrap();

        let work_dir = dir.path().join("work");
        let unpacker = TreeUnpacker(vec![
            ("smali/com/tracker/Beacon.smali", &b".class public LBeacon;"[..]),
            ("res/logo.PNG", &b"hidden_marker"[..]),
            ("assets/libs/empty.bin", &b""[..]),
        ]);
        let matcher = SignatureMatcher::new(
            library(&[
                ("com/tracker", "Tracker"),
                ("hidden_marker", "Other"),
                ("assets/libs", "Dir"),
            ]),
            Arc::new(unpacker),
            &work_dir,
        );

        let outcome = matcher.detect(&apk).unwrap();
        let providers: Vec<_> = outcome.signatures().iter().map(|s| s.provider.as_str()).collect();
        assert_eq!(providers, vec!["Tracker", "Dir"]);
        assert_eq!(remaining_scratch(&work_dir), 0);
    }

    #[test]
    fn test_media_extensions_configurable() {
        let dir = tempdir().unwrap();
        let apk = dir.path().join("p7.apk");
        std::fs::write(&apk, b"opaque package bytes").unwrap();

        let matcher = SignatureMatcher::new(
            library(&[("hidden_marker", "Other")]),
            Arc::new(TreeUnpacker(vec![("res/logo.png", &b"hidden_marker"[..])])),
            dir.path().join("work"),
        )
        .with_media_extensions(["mp4"]);

        assert_eq!(matcher.detect(&apk).unwrap().signatures().len(), 1);
    }

    #[test]
    fn test_shared_pattern_reports_every_provider() {
        let dir = tempdir().unwrap();
        let apk = dir.path().join("p4.apk");
        std::fs::write(&apk, b"raw adcorp.net bytes").unwrap();

        let matcher = SignatureMatcher::new(
            library(&[("adcorp.net", "AdCorp"), ("absent", "X"), ("adcorp.net", "Tracker")]),
            Arc::new(FailingUnpacker),
            dir.path().join("work"),
        );

        // "absent" forces an unpack, which fails.
        assert_eq!(matcher.detect(&apk).unwrap(), MatchOutcome::Undetectable);

        let matcher = SignatureMatcher::new(
            library(&[("adcorp.net", "AdCorp"), ("adcorp.net", "Tracker")]),
            Arc::new(FailingUnpacker),
            dir.path().join("work"),
        );
        let outcome = matcher.detect(&apk).unwrap();
        let providers: Vec<_> = outcome.signatures().iter().map(|s| s.provider.as_str()).collect();
        assert_eq!(providers, vec!["AdCorp", "Tracker"]);
    }

    #[test]
    fn test_highly_compressed_entry_is_inspected() {
        let dir = tempdir().unwrap();
        let apk = dir.path().join("p3.apk");
        let mut strings = String::from("const-string v0, \"evil_sdk\"\n");
        strings.push_str(&"    nop\n".repeat(20_000));
        std::fs::write(
            &apk,
            build_apk(&[("res/values/strings.xml", strings.as_bytes())]),
        )
        .unwrap();

        let work_dir = dir.path().join("work");
        let matcher = SignatureMatcher::new(
            library(&[("evil_sdk", "Evil")]),
            Arc::new(ZipUnpacker::new()),
            &work_dir,
        );

        let outcome = matcher.detect(&apk).unwrap();
        assert!(matches!(outcome, MatchOutcome::Matched { unpacked: true, .. }));
        assert_eq!(outcome.signatures().len(), 1);
        assert_eq!(remaining_scratch(&work_dir), 0);
    }

    #[test]
    fn test_entry_over_limit_is_undetectable() {
        let dir = tempdir().unwrap();
        let apk = dir.path().join("p4.apk");
        std::fs::write(&apk, build_apk(&[("assets/blob.bin", &[b'a'; 4096][..])])).unwrap();

        let work_dir = dir.path().join("work");
        let matcher = SignatureMatcher::new(
            library(&[("evil_sdk", "Evil")]),
            Arc::new(ZipUnpacker::new().with_max_size(1024)),
            &work_dir,
        );

        assert_eq!(matcher.detect(&apk).unwrap(), MatchOutcome::Undetectable);
        assert_eq!(remaining_scratch(&work_dir), 0);
    }

    #[test]
    fn test_unpack_failure_cleans_up() {
        let dir = tempdir().unwrap();
        let apk = dir.path().join("p5.apk");
        std::fs::write(&apk, b"nothing interesting").unwrap();

        let work_dir = dir.path().join("work");
        let matcher = SignatureMatcher::new(
            library(&[("evil_sdk", "Evil")]),
            Arc::new(FailingUnpacker),
            &work_dir,
        );

        assert_eq!(matcher.detect(&apk).unwrap(), MatchOutcome::Undetectable);
        assert!(work_dir.exists());
        assert_eq!(remaining_scratch(&work_dir), 0);
    }

    #[test]
    fn test_no_match_cleans_up() {
        let dir = tempdir().unwrap();
        let apk = dir.path().join("p6.apk");
        std::fs::write(&apk, build_apk(&[("classes.txt", &b"benign"[..])])).unwrap();

        let work_dir = dir.path().join("work");
        let matcher = SignatureMatcher::new(
            library(&[("evil_sdk", "Evil")]),
            Arc::new(ZipUnpacker::new()),
            &work_dir,
        );

        let outcome = matcher.detect(&apk).unwrap();
        assert_eq!(
            outcome,
            MatchOutcome::Matched {
                signatures: Vec::new(),
                unpacked: true
            }
        );
        assert_eq!(remaining_scratch(&work_dir), 0);
    }

    #[test]
    fn test_missing_package_is_error() {
        let dir = tempdir().unwrap();
        let matcher = SignatureMatcher::new(
            library(&[("evil_sdk", "Evil")]),
            Arc::new(ZipUnpacker::new()),
            dir.path().join("work"),
        );
        assert!(matcher.detect(&dir.path().join("missing.apk")).is_err());
    }

    #[test]
    fn test_take_matches_is_monotonic() {
        let mut remaining = vec!["a", "b", "c"];
        let mut matched = HashSet::new();

        take_matches(&mut remaining, &mut matched, |p| p == "b");
        assert_eq!(remaining, vec!["a", "c"]);

        // A matched pattern is no longer offered to later phases.
        take_matches(&mut remaining, &mut matched, |p| {
            assert_ne!(p, "b");
            p == "c"
        });
        assert_eq!(remaining, vec!["a"]);
        assert!(matched.contains("b") && matched.contains("c"));
    }

    #[test]
    fn test_relative_slash_path() {
        let root = Path::new("/w/abc");
        assert_eq!(
            relative_slash_path(root, &root.join("smali").join("com").join("x.smali")),
            "smali/com/x.smali"
        );
    }
}
