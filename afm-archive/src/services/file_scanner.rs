//! FITS file discovery under the intake root
//!
//! Walks the directory tree without following symlinks into loops, skips
//! system and hidden files, and keeps files with a FITS extension.

use crate::error::{ArchiveError, ArchiveResult};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

const FITS_EXTENSIONS: &[&str] = &["fits", "fit", "fts"];

pub struct FileScanner {
    ignore_patterns: Vec<String>,
    max_depth: Option<usize>,
}

impl FileScanner {
    pub fn new() -> Self {
        Self {
            ignore_patterns: vec![
                ".DS_Store".to_string(),
                "Thumbs.db".to_string(),
                "desktop.ini".to_string(),
                ".git".to_string(),
            ],
            max_depth: None,
        }
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    /// FITS files under `root`, sorted for a stable processing order
    pub fn scan(&self, root: &Path) -> ArchiveResult<Vec<PathBuf>> {
        if !root.exists() {
            return Err(ArchiveError::NotFound(format!("intake directory {}", root.display())));
        }
        if !root.is_dir() {
            return Err(ArchiveError::InvalidInput(format!("{} is not a directory", root.display())));
        }

        let mut visited_links = HashSet::new();
        let mut files = Vec::new();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .max_depth(self.max_depth.unwrap_or(usize::MAX))
            .into_iter()
            .filter_entry(|e| self.should_enter(e, &mut visited_links));

        for entry in walker {
            match entry {
                Ok(entry) if entry.file_type().is_file() && is_fits_path(entry.path()) => {
                    files.push(entry.path().to_path_buf());
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Error accessing entry: {}", e),
            }
        }

        files.sort();
        tracing::debug!(root = %root.display(), count = files.len(), "Scan complete");
        Ok(files)
    }

    fn should_enter(&self, entry: &DirEntry, visited_links: &mut HashSet<PathBuf>) -> bool {
        let name = entry.file_name().to_string_lossy();

        // Hidden entries below the root (the root itself may be hidden)
        if entry.depth() > 0 && name.starts_with('.') {
            return false;
        }
        if self.ignore_patterns.iter().any(|p| name == p.as_str()) {
            return false;
        }

        if entry.path_is_symlink() {
            if let Ok(canonical) = entry.path().canonicalize() {
                if !visited_links.insert(canonical) {
                    tracing::warn!("Symlink loop detected: {}", entry.path().display());
                    return false;
                }
            }
        }
        true
    }
}

impl Default for FileScanner {
    fn default() -> Self {
        Self::new()
    }
}

pub fn is_fits_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| FITS_EXTENSIONS.iter().any(|f| e.eq_ignore_ascii_case(f)))
        .unwrap_or(false)
}
