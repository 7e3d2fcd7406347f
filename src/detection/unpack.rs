//! Package unpacking collaborators and the scratch directory guard.

use crate::core::config::{DetectConfig, UnpackerKind};
use crate::core::error::{Error, Result};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use zip::ZipArchive;

/// Maximum size of a single extracted entry (100 MB).
pub const MAX_EXTRACT_SIZE: u64 = 100 * 1024 * 1024;

/// Maximum number of entries in one package.
pub const MAX_ARCHIVE_FILES: usize = 50_000;

/// Unpacks a package file into a directory tree.
pub trait Unpacker: Send + Sync {
    /// Unpack `src` into `dest`. `dest` may be partially populated on failure.
    fn unpack(&self, src: &Path, dest: &Path) -> Result<()>;

    /// Short name used in log lines.
    fn name(&self) -> &'static str;
}

/// Build the unpacker selected by the detection settings.
pub fn build_unpacker(config: &DetectConfig) -> Result<Box<dyn Unpacker>> {
    match config.unpacker {
        UnpackerKind::Apktool => {
            let tool = config.apk_tool.clone().ok_or_else(|| Error::ConfigInvalid {
                field: "detect.apk_tool".to_string(),
                message: "Required when detect.unpacker is \"apktool\"".to_string(),
            })?;
            Ok(Box::new(ApktoolUnpacker::new(tool, config.main_classes_only)))
        }
        UnpackerKind::Zip => Ok(Box::new(
            ZipUnpacker::new()
                .with_max_size(config.max_entry_size_mb.saturating_mul(1024 * 1024))
                .with_max_files(config.max_entries),
        )),
    }
}

/// Runs the external apktool decoder.
#[derive(Debug, Clone)]
pub struct ApktoolUnpacker {
    tool: PathBuf,
    main_classes_only: bool,
}

impl ApktoolUnpacker {
    pub fn new(tool: impl Into<PathBuf>, main_classes_only: bool) -> Self {
        Self {
            tool: tool.into(),
            main_classes_only,
        }
    }

    /// The decoder invocation: `<tool> d -f [--only-main-classes] -o <dest> <src>`.
    fn command(&self, src: &Path, dest: &Path) -> Command {
        let mut cmd = Command::new(&self.tool);
        cmd.arg("d").arg("-f");
        if self.main_classes_only {
            cmd.arg("--only-main-classes");
        }
        cmd.arg("-o")
            .arg(dest)
            .arg(src)
            .env_clear()
            .env("PATH", "/usr/bin")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }
}

impl Unpacker for ApktoolUnpacker {
    fn unpack(&self, src: &Path, dest: &Path) -> Result<()> {
        let status = self
            .command(src, dest)
            .status()
            .map_err(|e| Error::unpack(src, format!("failed to run {}: {}", self.tool.display(), e)))?;

        if !status.success() {
            return Err(Error::unpack(src, format!("apktool exited with {}", status)));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "apktool"
    }
}

/// Extracts the package's zip container without decoding resources or dex.
#[derive(Debug, Clone)]
pub struct ZipUnpacker {
    max_extract_size: u64,
    max_files: usize,
}

impl Default for ZipUnpacker {
    fn default() -> Self {
        Self::new()
    }
}

impl ZipUnpacker {
    pub fn new() -> Self {
        Self {
            max_extract_size: MAX_EXTRACT_SIZE,
            max_files: MAX_ARCHIVE_FILES,
        }
    }

    /// Set maximum entry size to extract.
    pub fn with_max_size(mut self, size: u64) -> Self {
        self.max_extract_size = size;
        self
    }

    /// Set maximum number of entries a package may hold.
    pub fn with_max_files(mut self, count: usize) -> Self {
        self.max_files = count;
        self
    }
}

impl Unpacker for ZipUnpacker {
    fn unpack(&self, src: &Path, dest: &Path) -> Result<()> {
        let file = File::open(src).map_err(|e| Error::file_read(src, e))?;
        let mut archive =
            ZipArchive::new(file).map_err(|e| Error::unpack(src, e.to_string()))?;

        std::fs::create_dir_all(dest).map_err(|e| Error::directory_access(dest, e))?;

        // Every entry must be extracted; a package that trips a limit is
        // reported as an unpack failure instead of being partially inspected.
        if archive.len() > self.max_files {
            return Err(Error::unpack(
                src,
                format!("{} entries exceed the limit of {}", archive.len(), self.max_files),
            ));
        }

        for i in 0..archive.len() {
            let entry = archive
                .by_index(i)
                .map_err(|e| Error::unpack(src, e.to_string()))?;

            let Some(relative) = entry.enclosed_name() else {
                return Err(Error::unpack(
                    src,
                    format!("unsafe entry path {}", entry.name()),
                ));
            };
            let out_path = dest.join(relative);

            if entry.is_dir() {
                std::fs::create_dir_all(&out_path)
                    .map_err(|e| Error::directory_access(&out_path, e))?;
                continue;
            }

            if entry.size() > self.max_extract_size {
                return Err(Error::unpack(
                    src,
                    format!("{} is {} bytes", entry.name(), entry.size()),
                ));
            }

            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::directory_access(parent, e))?;
            }
            let name = entry.name().to_string();
            let mut out = File::create(&out_path).map_err(|e| Error::file_write(&out_path, e))?;

            // Declared sizes can lie; bound what is actually inflated.
            let mut limited = entry.take(self.max_extract_size.saturating_add(1));
            let written = std::io::copy(&mut limited, &mut out)
                .map_err(|e| Error::unpack(src, format!("{}: {}", name, e)))?;
            if written > self.max_extract_size {
                return Err(Error::unpack(
                    src,
                    format!("{} inflates past {} bytes", name, self.max_extract_size),
                ));
            }
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "zip"
    }
}

/// Removes its directory tree when dropped.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    /// Take ownership of `path`; nothing is created.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove {}: {}", self.path.display(), e),
        }
    }
}
