//! ZIP adapter.
//!
//! Fresh builds and appends go through the `zip` crate. ZIP has no password
//! mode worth keeping open during the build, so the password stage re-encodes
//! the finished archive with ZipCrypto, which drops the DOS attribute bits
//! applied by the earlier stages.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::path::Path;

use zip::unstable::write::FileOptionsExt;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::filesystem::atomic_move;
use super::{Capabilities, FormatAdapter, MergeStyle, PasswordSupport};
use crate::attributes::zip::{read_central_directory, DOS_HIDDEN, DOS_READ_ONLY};
use crate::context::{Degradation, PackContext};
use crate::entry::{ContainerEntry, ContentSource, Namespace};
use crate::error::{IoResultExt, PackError, Result};
use crate::spec::{ContainerSpec, FormatKind, Mode};

/// Compression level used by the password re-encode.
pub const REENCODE_LEVEL: i64 = 5;

fn zip_err(err: zip::result::ZipError) -> PackError {
    PackError::container("zip", err)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ZipAdapter;

impl ZipAdapter {
    fn write_entries<W: Write + Seek>(
        writer: &mut ZipWriter<W>,
        entries: &[ContainerEntry],
        options: SimpleFileOptions,
    ) -> Result<()> {
        for entry in entries {
            if entry.is_dir {
                writer
                    .add_directory(entry.path.trim_end_matches('/'), options)
                    .map_err(zip_err)?;
                continue;
            }
            writer.start_file(entry.path.as_str(), options).map_err(zip_err)?;
            let mut reader = entry.source.open()?;
            io::copy(&mut reader, writer)
                .map_err(|e| PackError::container("zip", format!("writing '{}': {e}", entry.path)))?;
        }
        Ok(())
    }

    /// Every entry of `archive` with its content, decrypted with `password` when given.
    fn extract_all(archive: &Path, password: Option<&str>) -> Result<Vec<ContainerEntry>> {
        let file = File::open(archive).at(archive)?;
        let mut zip = ZipArchive::new(file).map_err(zip_err)?;
        let mut entries = Vec::with_capacity(zip.len());

        for index in 0..zip.len() {
            let mut item = match password {
                Some(pw) => zip.by_index_decrypt(index, pw.as_bytes()).map_err(zip_err)?,
                None => zip.by_index(index).map_err(zip_err)?,
            };
            let name = item.name().to_string();
            if item.is_dir() {
                entries.push(ContainerEntry::dir(name.trim_end_matches('/')));
                continue;
            }
            let mut bytes = Vec::with_capacity(item.size() as usize);
            item.read_to_end(&mut bytes)
                .map_err(|e| PackError::container("zip", format!("reading '{name}': {e}")))?;
            entries.push(ContainerEntry::file(name, ContentSource::Bytes(bytes)));
        }

        Ok(entries)
    }
}

impl FormatAdapter for ZipAdapter {
    fn kind(&self) -> FormatKind {
        FormatKind::Zip
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            merge: MergeStyle::Append,
            password: PasswordSupport::PostProcess,
            hide: true,
            listable: true,
        }
    }

    fn namespace(&self, _mode: Mode) -> Namespace {
        Namespace::Hierarchical
    }

    fn build(
        &self,
        ctx: &mut PackContext,
        _spec: &ContainerSpec,
        entries: &[ContainerEntry],
        output: &Path,
    ) -> Result<()> {
        let file = File::create(output).at(output)?;
        let mut writer = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        Self::write_entries(&mut writer, entries, options)?;
        writer.finish().map_err(zip_err)?;

        ctx.info(format!("packaged {} entries into ZIP", entries.len()));
        Ok(())
    }

    fn merge(
        &self,
        ctx: &mut PackContext,
        _spec: &ContainerSpec,
        existing: &Path,
        entries: &[ContainerEntry],
        output: &Path,
    ) -> Result<()> {
        if existing != output {
            fs::copy(existing, output).at(existing)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(output)
            .at(output)?;
        let mut writer = ZipWriter::new_append(file).map_err(zip_err)?;
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        Self::write_entries(&mut writer, entries, options)?;
        writer.finish().map_err(zip_err)?;

        ctx.info(format!("appended {} entries to existing ZIP", entries.len()));
        Ok(())
    }

    fn list(&self, _ctx: &mut PackContext, container: &Path) -> Result<Vec<ContainerEntry>> {
        let bytes = fs::read(container).at(container)?;
        // Zip64 archives still list, just without flags.
        let dos: std::collections::HashMap<String, u8> = read_central_directory(&bytes)
            .map(|records| {
                records
                    .into_iter()
                    .map(|record| (record.name.clone(), record.dos_attributes()))
                    .collect()
            })
            .unwrap_or_default();

        let mut zip = ZipArchive::new(io::Cursor::new(bytes.as_slice())).map_err(zip_err)?;
        let mut entries = Vec::with_capacity(zip.len());
        for index in 0..zip.len() {
            let item = zip.by_index_raw(index).map_err(zip_err)?;
            let bits = dos.get(item.name()).copied().unwrap_or(0);
            let name = item.name().trim_end_matches('/').to_string();
            let mut entry = if item.is_dir() {
                ContainerEntry::dir(name)
            } else {
                ContainerEntry::file(name, ContentSource::Stored { size: item.size() })
            };
            entry.attributes.hidden = bits & DOS_HIDDEN != 0;
            entry.attributes.read_only = bits & DOS_READ_ONLY != 0;
            entries.push(entry);
        }
        Ok(entries)
    }

    fn apply_password(&self, ctx: &mut PackContext, artifact: &Path, password: &str) -> Result<()> {
        ctx.info("re-encoding ZIP with a password");

        let bytes = fs::read(artifact).at(artifact)?;
        let flagged = read_central_directory(&bytes)?
            .iter()
            .filter(|record| record.dos_attributes() & (DOS_HIDDEN | DOS_READ_ONLY) != 0)
            .count();

        let scratch = ctx.scratch_dir("zip-password")?;
        let entries = Self::extract_all(artifact, None)?;
        let staged = scratch.path().join("reencoded.zip");

        let file = File::create(&staged).at(&staged)?;
        let mut writer = ZipWriter::new(file);
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(REENCODE_LEVEL))
            .with_deprecated_encryption(password.as_bytes());
        Self::write_entries(&mut writer, &entries, options)?;
        writer.finish().map_err(zip_err)?;

        atomic_move(&staged, artifact)?;

        if flagged > 0 {
            ctx.warn(format!(
                "password re-encode dropped hidden/read-only flags from {flagged} entries"
            ));
            ctx.degrade(Degradation::AttributesDroppedByReencode);
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn read_zip(path: &Path, password: Option<&str>) -> Vec<(String, Vec<u8>)> {
        ZipAdapter::extract_all(path, password)
            .unwrap()
            .into_iter()
            .filter(|e| !e.is_dir)
            .map(|e| (e.path.clone(), e.source.read_all().unwrap()))
            .collect()
    }

    fn entry(name: &str, body: &[u8]) -> ContainerEntry {
        ContainerEntry::file(name, ContentSource::Bytes(body.to_vec()))
    }

    #[test]
    fn build_round_trips_entries() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out.zip");
        let spec = ContainerSpec::new(FormatKind::Zip, "in", &out);
        let mut ctx = PackContext::default();

        let entries = vec![entry("a.txt", b"alpha"), entry("sub/b.bin", &[1, 2, 3])];
        ZipAdapter.build(&mut ctx, &spec, &entries, &out).unwrap();

        assert_eq!(
            read_zip(&out, None),
            vec![
                ("a.txt".to_string(), b"alpha".to_vec()),
                ("sub/b.bin".to_string(), vec![1, 2, 3]),
            ]
        );
    }

    #[test]
    fn merge_appends_to_copy_of_existing() {
        let temp = TempDir::new().unwrap();
        let original = temp.path().join("original.zip");
        let out = temp.path().join("out.zip");
        let spec = ContainerSpec::new(FormatKind::Zip, "in", &out).with_backdoor(&original);
        let mut ctx = PackContext::default();

        ZipAdapter
            .build(&mut ctx, &spec, &[entry("old.txt", b"old")], &original)
            .unwrap();
        let before = fs::read(&original).unwrap();

        ZipAdapter
            .merge(&mut ctx, &spec, &original, &[entry("new.txt", b"new")], &out)
            .unwrap();

        assert_eq!(fs::read(&original).unwrap(), before);
        let names: Vec<String> = read_zip(&out, None).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["old.txt", "new.txt"]);

        let listed = ZipAdapter.list(&mut ctx, &out).unwrap();
        assert_eq!(listed[1].source, ContentSource::Stored { size: 3 });
    }

    #[test]
    fn password_reencode_requires_password() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out.zip");
        let spec = ContainerSpec::new(FormatKind::Zip, "in", &out);
        let mut ctx = PackContext::default();

        ZipAdapter
            .build(&mut ctx, &spec, &[entry("secret.txt", b"top secret!!!")], &out)
            .unwrap();
        ZipAdapter.apply_password(&mut ctx, &out, "hunter2").unwrap();

        let file = File::open(&out).unwrap();
        let mut zip = ZipArchive::new(file).unwrap();
        assert!(zip.by_index(0).is_err());
        assert_eq!(
            read_zip(&out, Some("hunter2")),
            vec![("secret.txt".to_string(), b"top secret!!!".to_vec())]
        );
        assert!(ctx.degradations().is_empty());
    }
}
