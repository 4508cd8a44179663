//! Filesystem utilities for artifact building.
//!
//! Staging trees for the rebuild-style adapters and artifact replacement.

use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::entry::ContainerEntry;
use crate::error::{IoResultExt, PackError, Result};

/// Resolve a `/` separated container path below `root`.
///
/// Absolute paths and `..` components are rejected so an entry can never be
/// materialized outside the staging tree.
///
/// # Example
///
/// ```rust
/// use repackager::artifact::filesystem::entry_path;
/// use std::path::Path;
///
/// let path = entry_path(Path::new("/tmp/stage"), "docs/readme.txt").unwrap();
/// assert_eq!(path, Path::new("/tmp/stage/docs/readme.txt"));
/// assert!(entry_path(Path::new("/tmp/stage"), "../escape").is_err());
/// ```
pub fn entry_path(root: &Path, name: &str) -> Result<PathBuf> {
    let mut path = root.to_path_buf();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => {
                return Err(PackError::unsupported(format!(
                    "entry name '{name}' leaves the container root"
                )))
            }
        }
    }
    if path == root {
        return Err(PackError::unsupported(format!("entry name '{name}' is empty")));
    }
    Ok(path)
}

/// Materialize entries as a directory tree under `root`.
///
/// Directory entries become directories; file entries are written with their
/// parents created as needed.
///
/// # Arguments
///
/// * `root` - Staging directory (created if it doesn't exist)
/// * `entries` - Entries to write, named by their container path
pub fn stage_entries(root: &Path, entries: &[ContainerEntry]) -> Result<()> {
    fs::create_dir_all(root).at(root)?;

    for entry in entries {
        let dest = entry_path(root, &entry.path)?;
        if entry.is_dir {
            fs::create_dir_all(&dest).at(&dest)?;
        } else {
            entry.source.write_to(&dest)?;
        }
    }

    Ok(())
}

/// Move a file by renaming, with fallback to copy+delete.
///
/// Used to swap a rebuilt artifact from scratch storage into place.
///
/// # Arguments
///
/// * `src` - Source file path
/// * `dst` - Destination file path (replaced if present)
pub fn atomic_move(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Different filesystem, fall back to copy+delete
            fs::copy(src, dst).at(dst)?;
            fs::remove_file(src).at(src)?;
            Ok(())
        }
    }
}
