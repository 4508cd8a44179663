//! 7z adapter.
//!
//! Passwords are native: content is AES-256 encrypted ahead of LZMA2 while
//! the archive is written. `sevenz-rust` cannot append to an archive, so a
//! merge decodes every existing entry and writes a new archive with the union.

use std::path::Path;

use sevenz_rust::{
    AesEncoderOptions, Password, SevenZArchiveEntry, SevenZMethod, SevenZReader, SevenZWriter,
};

use super::filesystem::atomic_move;
use super::{Capabilities, FormatAdapter, MergeStyle, PasswordSupport};
use crate::context::PackContext;
use crate::entry::{ContainerEntry, ContentSource, Namespace};
use crate::error::{PackError, Result};
use crate::spec::{ContainerSpec, FormatKind, Mode};

fn sz_err(err: impl std::fmt::Display) -> PackError {
    PackError::container("7z", err)
}

fn password_for(password: Option<&str>) -> Password {
    password.map(Password::from).unwrap_or_else(Password::empty)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SevenZipAdapter;

impl SevenZipAdapter {
    fn write_archive(
        entries: &[ContainerEntry],
        output: &Path,
        password: Option<&str>,
    ) -> Result<()> {
        let mut writer = SevenZWriter::create(output).map_err(sz_err)?;
        if let Some(pw) = password {
            writer.set_content_methods(vec![
                AesEncoderOptions::new(Password::from(pw)).into(),
                SevenZMethod::LZMA2.into(),
            ]);
        }

        for entry in entries {
            let mut item = SevenZArchiveEntry::new();
            item.name = entry.path.trim_end_matches('/').to_string();
            if entry.is_dir {
                item.is_directory = true;
                item.has_stream = false;
                writer
                    .push_archive_entry::<&[u8]>(item, None)
                    .map_err(sz_err)?;
                continue;
            }
            item.has_stream = true;
            let reader = entry.source.open()?;
            writer
                .push_archive_entry(item, Some(reader))
                .map_err(|e| sz_err(format!("writing '{}': {e}", entry.path)))?;
        }

        writer.finish().map_err(sz_err)?;
        Ok(())
    }

    /// Every entry of `archive` with its content.
    fn extract_all(archive: &Path, password: Option<&str>) -> Result<Vec<ContainerEntry>> {
        let mut reader = SevenZReader::open(archive, password_for(password)).map_err(sz_err)?;
        let mut entries = Vec::new();
        reader
            .for_each_entries(|item, content| {
                if item.is_directory() {
                    entries.push(ContainerEntry::dir(item.name()));
                    return Ok(true);
                }
                let mut bytes = Vec::with_capacity(item.size() as usize);
                content.read_to_end(&mut bytes)?;
                entries.push(ContainerEntry::file(item.name(), ContentSource::Bytes(bytes)));
                Ok(true)
            })
            .map_err(sz_err)?;
        Ok(entries)
    }
}

impl FormatAdapter for SevenZipAdapter {
    fn kind(&self) -> FormatKind {
        FormatKind::SevenZip
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            merge: MergeStyle::Append,
            password: PasswordSupport::Native,
            hide: false,
            listable: true,
        }
    }

    fn namespace(&self, _mode: Mode) -> Namespace {
        Namespace::Hierarchical
    }

    fn build(
        &self,
        ctx: &mut PackContext,
        spec: &ContainerSpec,
        entries: &[ContainerEntry],
        output: &Path,
    ) -> Result<()> {
        Self::write_archive(entries, output, spec.password())?;
        if spec.password().is_some() {
            ctx.info(format!("packaged {} entries into AES-256 encrypted 7z", entries.len()));
        } else {
            ctx.info(format!("packaged {} entries into 7z", entries.len()));
        }
        Ok(())
    }

    fn merge(
        &self,
        ctx: &mut PackContext,
        spec: &ContainerSpec,
        existing: &Path,
        entries: &[ContainerEntry],
        output: &Path,
    ) -> Result<()> {
        let mut union = Self::extract_all(existing, spec.password())?;
        tracing::debug!("7z merge: {} existing entries in {}", union.len(), existing.display());
        union.extend_from_slice(entries);

        let scratch = ctx.scratch_dir("7z-merge")?;
        let staged = scratch.path().join("merged.7z");
        Self::write_archive(&union, &staged, spec.password())?;
        atomic_move(&staged, output)?;

        ctx.info(format!("rewrote 7z with {} new entries", entries.len()));
        Ok(())
    }

    fn list(&self, _ctx: &mut PackContext, container: &Path) -> Result<Vec<ContainerEntry>> {
        let reader = SevenZReader::open(container, Password::empty()).map_err(sz_err)?;
        Ok(reader
            .archive()
            .files
            .iter()
            .map(|item| {
                if item.is_directory() {
                    ContainerEntry::dir(item.name())
                } else {
                    ContainerEntry::file(item.name(), ContentSource::Stored { size: item.size() })
                }
            })
            .collect())
    }
}
