//! Directory traversal for archive sources.
//!
//! Every regular file below a source path is collected together with the
//! name it gets inside the bundle: its path relative to the *parent* of the
//! source, so `/srv/data/a.txt` from source `/srv/data` becomes `data/a.txt`.

use std::path::{Component, Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links to directories
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,
}

/// A file discovered below a source path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Name of the entry inside the bundle, `/`-separated
    pub entry_name: String,

    /// File size in bytes
    pub size: u64,
}

impl FileInfo {
    /// Create FileInfo from a DirEntry.
    /// Symlinks are resolved to their target; links to directories and
    /// broken links yield None.
    fn from_entry(entry: &DirEntry, base: &Path) -> std::io::Result<Option<Self>> {
        let path = entry.path().to_path_buf();
        let metadata = if entry.path_is_symlink() {
            match std::fs::metadata(&path) {
                Ok(resolved) if resolved.is_file() => resolved,
                _ => return Ok(None),
            }
        } else {
            let metadata = entry.metadata().map_err(std::io::Error::from)?;
            if !metadata.is_file() {
                return Ok(None);
            }
            metadata
        };

        Ok(Some(Self {
            entry_name: entry_name(&path, base),
            path,
            size: metadata.len(),
        }))
    }
}

/// Walk one source path and collect all regular files below it.
///
/// A source that is itself a file yields that single file. A source that
/// does not exist or cannot be read is an error.
pub fn walk_source(source: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let base = source.parent().unwrap_or(source);
    let mut files = Vec::new();

    let mut walker = WalkDir::new(source)
        .follow_links(options.follow_links)
        .sort_by_file_name();

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;

        if entry.file_type().is_dir() {
            continue;
        }

        if let Some(file_info) = FileInfo::from_entry(&entry, base)? {
            files.push(file_info);
        }
    }

    Ok(files)
}

/// Build the bundle-internal name of `path` relative to `base`.
fn entry_name(path: &Path, base: &Path) -> String {
    let relative = path.strip_prefix(base).unwrap_or(path);
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
