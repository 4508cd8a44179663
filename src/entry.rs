//! Container entries and the naming rules they must satisfy.
//!
//! An entry set is built once per packaging request from the input path,
//! then validated against the namespace of the target format before any
//! adapter touches the output.

use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::context::PackContext;
use crate::error::{IoResultExt, PackError, Result};

/// Where an entry's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentSource {
    /// File on the local filesystem.
    File(PathBuf),
    /// Bytes already held in memory (extracted from an existing container).
    Bytes(Vec<u8>),
    /// Listed from a container without reading the payload.
    Stored { size: u64 },
}

impl ContentSource {
    pub fn size(&self) -> Result<u64> {
        match self {
            Self::File(path) => Ok(fs::metadata(path).at(path)?.len()),
            Self::Bytes(bytes) => Ok(bytes.len() as u64),
            Self::Stored { size } => Ok(*size),
        }
    }

    /// Open the content for streaming.
    pub fn open(&self) -> Result<Box<dyn Read + '_>> {
        match self {
            Self::File(path) => Ok(Box::new(fs::File::open(path).at(path)?)),
            Self::Bytes(bytes) => Ok(Box::new(io::Cursor::new(bytes.as_slice()))),
            Self::Stored { .. } => Err(PackError::unsupported(
                "entry was listed without its content and cannot be read",
            )),
        }
    }

    pub fn read_all(&self) -> Result<Vec<u8>> {
        match self {
            Self::File(path) => fs::read(path).at(path),
            Self::Bytes(bytes) => Ok(bytes.clone()),
            Self::Stored { .. } => Err(PackError::unsupported(
                "entry was listed without its content and cannot be read",
            )),
        }
    }

    /// Materialize the content at `dest`, creating parent directories.
    pub fn write_to(&self, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).at(parent)?;
        }
        match self {
            Self::File(path) => {
                fs::copy(path, dest).at(path)?;
                Ok(())
            }
            Self::Bytes(bytes) => fs::write(dest, bytes).at(dest),
            Self::Stored { .. } => Err(PackError::unsupported(
                "entry was listed without its content and cannot be written",
            )),
        }
    }
}

/// Visibility flags carried by an entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Attributes {
    pub hidden: bool,
    pub read_only: bool,
}

/// How a format names its entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// Relative paths with directories are kept.
    Hierarchical,
    /// Only the basename survives; basenames must be unique.
    Flat,
}

/// One named byte stream inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEntry {
    /// Relative, `/` separated path as stored in the container.
    pub path: String,
    pub source: ContentSource,
    pub is_dir: bool,
    pub attributes: Attributes,
    /// Set once a nested path has been reduced to its basename.
    pub flattened: bool,
}

impl ContainerEntry {
    pub fn file(path: impl Into<String>, source: ContentSource) -> Self {
        Self {
            path: path.into(),
            source,
            is_dir: false,
            attributes: Attributes::default(),
            flattened: false,
        }
    }

    pub fn dir(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            source: ContentSource::Bytes(Vec::new()),
            is_dir: true,
            attributes: Attributes::default(),
            flattened: false,
        }
    }

    pub fn basename(&self) -> &str {
        basename(&self.path)
    }

    pub fn is_nested(&self) -> bool {
        self.path.contains('/')
    }

    /// Name this entry gets in the given namespace.
    pub fn name_in(&self, namespace: Namespace) -> &str {
        match namespace {
            Namespace::Hierarchical => &self.path,
            Namespace::Flat => self.basename(),
        }
    }

    /// Copy of the entry renamed for `namespace`.
    pub fn flatten_for(&self, namespace: Namespace) -> Self {
        let mut entry = self.clone();
        if namespace == Namespace::Flat && self.is_nested() {
            entry.path = self.basename().to_string();
            entry.flattened = true;
        }
        entry
    }
}

pub fn basename(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

/// Key used for collision checks. Flat namespaces end up on
/// case-insensitive targets (FAT volumes, cabinets, PDF viewers).
fn collision_key(name: &str, namespace: Namespace) -> String {
    match namespace {
        Namespace::Hierarchical => name.to_string(),
        Namespace::Flat => name.to_lowercase(),
    }
}

/// Build the entry set for an input path.
///
/// A single file yields one entry named by `rename` or its own file name.
/// A directory is walked recursively in sorted order and yields one entry per
/// regular file, named by its path relative to the input root.
pub fn collect_entries(
    ctx: &mut PackContext,
    input: &Path,
    rename: Option<&str>,
) -> Result<Vec<ContainerEntry>> {
    let metadata = fs::metadata(input)
        .map_err(|e| PackError::input_not_found(input, e.to_string()))?;

    if metadata.is_file() {
        let name = match rename {
            Some(name) => name.replace('\\', "/").trim_start_matches('/').to_string(),
            None => input
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| PackError::input_not_found(input, "input has no file name"))?,
        };
        return Ok(vec![ContainerEntry::file(
            name,
            ContentSource::File(input.to_path_buf()),
        )]);
    }

    if rename.is_some() {
        ctx.warn("rename ignored: input is a directory, entries keep their own names");
    }

    let mut entries = Vec::new();
    for item in WalkDir::new(input).sort_by_file_name() {
        let item = item.map_err(|e| {
            let path = e.path().unwrap_or(input).to_path_buf();
            match e.into_io_error() {
                Some(source) => PackError::io(path, source),
                None => PackError::input_not_found(path, "filesystem loop while walking input"),
            }
        })?;
        if !item.file_type().is_file() {
            continue;
        }

        let relative = item
            .path()
            .strip_prefix(input)
            .map_err(|_| PackError::input_not_found(item.path(), "entry escapes the input root"))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        entries.push(ContainerEntry::file(
            name,
            ContentSource::File(item.path().to_path_buf()),
        ));
    }

    if entries.is_empty() {
        return Err(PackError::input_not_found(input, "directory contains no files"));
    }

    tracing::debug!("collected {} entries from {}", entries.len(), input.display());
    Ok(entries)
}

/// Check that every entry maps to a distinct name in `namespace`.
pub fn validate_namespace(entries: &[ContainerEntry], namespace: Namespace) -> Result<()> {
    let mut seen: HashMap<String, &str> = HashMap::new();
    for entry in entries.iter().filter(|e| !e.is_dir) {
        let name = entry.name_in(namespace);
        if name.is_empty() {
            return Err(PackError::unsupported(format!(
                "entry '{}' has an empty name",
                entry.path
            )));
        }
        if let Some(first) = seen.insert(collision_key(name, namespace), &entry.path) {
            return Err(PackError::ConflictingEntryName {
                name: name.to_string(),
                first: first.to_string(),
                second: entry.path.clone(),
            });
        }
    }
    Ok(())
}

/// Check new entries against names already present in an existing container.
pub fn check_against_existing(
    new_entries: &[ContainerEntry],
    existing: &[ContainerEntry],
    namespace: Namespace,
) -> Result<()> {
    let present: HashMap<String, &str> = existing
        .iter()
        .filter(|e| !e.is_dir)
        .map(|e| (collision_key(e.name_in(namespace), namespace), e.path.as_str()))
        .collect();

    for entry in new_entries.iter().filter(|e| !e.is_dir) {
        let name = entry.name_in(namespace);
        if let Some(first) = present.get(&collision_key(name, namespace)) {
            return Err(PackError::ConflictingEntryName {
                name: name.to_string(),
                first: format!("{first} (existing container)"),
                second: entry.path.clone(),
            });
        }
    }
    Ok(())
}
