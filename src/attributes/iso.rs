//! Hidden flag patching for ISO 9660 images.
//!
//! The flag lives in each directory record. An image carries two trees for
//! the same files (primary and Joliet); both are patched so every reader
//! sees the entry as hidden. Primary records are matched to their Joliet
//! counterparts by extent, which is only unique for non-empty files.

use std::collections::HashSet;
use std::path::Path;

use crate::artifact::iso_tree::{IsoImage, Tree, FLAG_HIDDEN};
use crate::error::Result;
use crate::pattern::{any_match, WildcardPattern};

/// Set the hidden flag on files whose path matches any pattern.
pub fn apply_hidden(image: &Path, patterns: &[WildcardPattern]) -> Result<usize> {
    if patterns.is_empty() {
        return Ok(0);
    }
    mark_hidden(image, |path| any_match(patterns, path))
}

/// Set the hidden flag on files selected by `select`. Returns the number of
/// files newly hidden.
pub fn mark_hidden(image: &Path, select: impl Fn(&str) -> bool) -> Result<usize> {
    let mut iso = IsoImage::open_rw(image)?;
    let tree = iso.preferred_tree();
    let records = iso.walk(tree)?;

    let mut changed = 0;
    let mut extents = HashSet::new();
    for record in records.iter().filter(|r| !r.is_dir() && select(&r.path)) {
        if record.size > 0 {
            extents.insert(record.extent);
        }
        if record.is_hidden() {
            continue;
        }
        iso.write_flags(record.record_offset, record.flags | FLAG_HIDDEN)?;
        tracing::debug!("iso hidden flag -> {}", record.path);
        changed += 1;
    }

    if tree == Tree::Joliet && !extents.is_empty() {
        for record in iso.walk(Tree::Primary)? {
            if !record.is_dir() && !record.is_hidden() && extents.contains(&record.extent) {
                iso.write_flags(record.record_offset, record.flags | FLAG_HIDDEN)?;
            }
        }
    }

    Ok(changed)
}
