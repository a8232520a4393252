use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// The extraction strategy for a discovered file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Text,
    Pdf,
}

impl DocumentKind {
    /// Classify a path by extension, ignoring case.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "txt" => Some(Self::Text),
            "pdf" => Some(Self::Pdf),
            _ => None,
        }
    }
}

/// A discovered document file.
#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    /// Path relative to the input directory.
    pub relative_path: PathBuf,
    /// Fully resolved absolute path.
    pub absolute_path: PathBuf,
    pub kind: DocumentKind,
}

/// Recursively walk a directory and discover supported document files.
///
/// Skips hidden files/directories (names starting with `.`) and only
/// returns `.txt` and `.pdf` files.
pub fn discover_files(root: &Path) -> Result<Vec<DiscoveredFile>> {
    if !root.is_dir() {
        return Err(Error::Config(format!(
            "input path is not a directory: {}",
            root.display()
        )));
    }

    let canonical_root = root.canonicalize()?;
    let mut results = Vec::new();
    walk_dir(&canonical_root, &canonical_root, &mut results)?;
    results.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(results)
}

fn walk_dir(
    root: &Path,
    current: &Path,
    results: &mut Vec<DiscoveredFile>,
) -> Result<()> {
    for entry in std::fs::read_dir(current)? {
        let entry = entry?;
        let file_name = entry.file_name();
        if file_name.to_string_lossy().starts_with('.') {
            continue;
        }

        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            walk_dir(root, &path, results)?;
        } else if file_type.is_symlink() {
            // Broken symlinks are skipped.
            let Ok(resolved) = path.canonicalize() else {
                continue;
            };
            // Directory links are not followed to avoid cycles.
            if resolved.is_file()
                && let Some(kind) = DocumentKind::from_path(&resolved)
            {
                results.push(make_discovered(root, &path, resolved, kind));
            }
        } else if file_type.is_file()
            && let Some(kind) = DocumentKind::from_path(&path)
        {
            let abs = path.canonicalize()?;
            results.push(make_discovered(root, &path, abs, kind));
        }
    }

    Ok(())
}

fn make_discovered(
    root: &Path,
    original_path: &Path,
    absolute_path: PathBuf,
    kind: DocumentKind,
) -> DiscoveredFile {
    let relative_path = original_path
        .strip_prefix(root)
        .unwrap_or(original_path)
        .to_path_buf();

    DiscoveredFile {
        relative_path,
        absolute_path,
        kind,
    }
}
