//! Archive builder - bundles source directories into one zip file.
//!
//! The bundle is written to a temporary file in the output directory and
//! renamed into place only once it is complete, so a failed build never
//! leaves a truncated archive at the final path.

use crate::fs::walker::{walk_source, FileInfo, WalkOptions};
use crate::tier::{archive_file_name, BackupTier};
use crate::utils::errors::{BackupError, Result};
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Largest entry size that fits without zip64 extensions
const ZIP32_LIMIT: u64 = 0xFFFF_FFFF;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// A finished archive on local disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInfo {
    pub path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
    pub file_count: usize,
}

/// Builds archive bundles in a fixed output directory
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    output_dir: PathBuf,
    walk_options: WalkOptions,
}

impl ArchiveBuilder {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            walk_options: WalkOptions::default(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Build the archive for `timestamp` off the async runtime.
    pub async fn build(
        &self,
        sources: &[PathBuf],
        timestamp: NaiveDateTime,
        tier: BackupTier,
    ) -> Result<ArchiveInfo> {
        let builder = self.clone();
        let sources = sources.to_vec();
        tokio::task::spawn_blocking(move || builder.build_blocking(&sources, timestamp, tier))
            .await
            .map_err(|e| BackupError::Archive(format!("Archive task failed: {}", e)))?
    }

    /// Build the archive on the current thread.
    pub fn build_blocking(
        &self,
        sources: &[PathBuf],
        timestamp: NaiveDateTime,
        tier: BackupTier,
    ) -> Result<ArchiveInfo> {
        let file_name = archive_file_name(timestamp, tier);
        let destination = self.output_dir.join(&file_name);

        let files = self.collect_files(sources)?;

        std::fs::create_dir_all(&self.output_dir).map_err(|e| {
            BackupError::ArchiveWrite(format!(
                "Cannot create output directory {}: {}",
                self.output_dir.display(),
                e
            ))
        })?;

        let mut staging = tempfile::Builder::new()
            .prefix(".backup-")
            .suffix(".partial")
            .tempfile_in(&self.output_dir)
            .map_err(|e| {
                BackupError::ArchiveWrite(format!(
                    "Cannot create {} in {}: {}",
                    file_name,
                    self.output_dir.display(),
                    e
                ))
            })?;

        let file_count = write_bundle(staging.as_file_mut(), &files)?;

        staging.persist(&destination).map_err(|e| {
            BackupError::ArchiveWrite(format!(
                "Cannot move archive into place at {}: {}",
                destination.display(),
                e.error
            ))
        })?;

        let size_bytes = std::fs::metadata(&destination)?.len();
        info!(
            archive = %destination.display(),
            size_bytes,
            file_count,
            "Archive created"
        );

        Ok(ArchiveInfo {
            path: destination,
            file_name,
            size_bytes,
            file_count,
        })
    }

    fn collect_files(&self, sources: &[PathBuf]) -> Result<Vec<FileInfo>> {
        let mut all_files = Vec::new();
        for source in sources {
            info!(source = %source.display(), "Adding source");
            let files = walk_source(source, &self.walk_options).map_err(|e| {
                BackupError::Archive(format!("Cannot read source {}: {}", source.display(), e))
            })?;
            all_files.extend(files);
        }
        check_unique_entries(&all_files)?;
        Ok(all_files)
    }
}

/// Every file must land under its own entry name; two sources sharing a
/// base name would otherwise overwrite each other inside the bundle.
fn check_unique_entries(files: &[FileInfo]) -> Result<()> {
    let mut seen: HashMap<&str, &Path> = HashMap::with_capacity(files.len());
    for file in files {
        if let Some(previous) = seen.insert(file.entry_name.as_str(), file.path.as_path()) {
            return Err(BackupError::Archive(format!(
                "Entry {} is provided by both {} and {}; sources must have distinct names",
                file.entry_name,
                previous.display(),
                file.path.display()
            )));
        }
    }
    Ok(())
}

/// Write every file into a deflate-compressed zip on `out`.
/// Returns the number of entries written.
fn write_bundle<W: Write + Seek>(out: W, files: &[FileInfo]) -> Result<usize> {
    let mut zip = ZipWriter::new(out);
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    for file in files {
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(file.size >= ZIP32_LIMIT);

        let mut source = File::open(&file.path).map_err(|e| {
            BackupError::Archive(format!("Cannot open {}: {}", file.path.display(), e))
        })?;

        zip.start_file(file.entry_name.as_str(), options)
            .map_err(|e| BackupError::ArchiveWrite(format!("Cannot add {}: {}", file.entry_name, e)))?;

        // Read failures belong to the source, write failures to the destination.
        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(BackupError::Archive(format!(
                        "Cannot read {}: {}",
                        file.path.display(),
                        e
                    )))
                }
            };
            zip.write_all(&buf[..n]).map_err(|e| {
                BackupError::ArchiveWrite(format!("Cannot write {}: {}", file.entry_name, e))
            })?;
        }
    }

    zip.finish()
        .map_err(|e| BackupError::ArchiveWrite(format!("Cannot finalize archive: {}", e)))?;

    Ok(files.len())
}
