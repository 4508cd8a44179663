//! Microsoft cabinet adapter.
//!
//! Cabinets have no directory entries; names carry `\` separators instead.
//! A merge reads every existing file into memory and writes a new cabinet
//! holding the union in a single MSZIP folder.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use cab::{Cabinet, CabinetBuilder, CompressionType};

use super::{Capabilities, FormatAdapter, MergeStyle, PasswordSupport};
use crate::context::PackContext;
use crate::entry::{ContainerEntry, ContentSource, Namespace};
use crate::error::{IoResultExt, PackError, Result};
use crate::spec::{ContainerSpec, FormatKind, Mode};

fn cab_err(err: io::Error) -> PackError {
    PackError::container("cab", err)
}

/// Cabinet name for a `/` separated entry path.
pub fn cab_name(path: &str) -> String {
    path.trim_matches('/').replace('/', "\\")
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CabAdapter;

impl CabAdapter {
    fn write_cabinet(entries: &[ContainerEntry], output: &Path) -> Result<usize> {
        let files: Vec<&ContainerEntry> = entries.iter().filter(|e| !e.is_dir).collect();

        let mut builder = CabinetBuilder::new();
        {
            let folder = builder.add_folder(CompressionType::MsZip);
            for entry in &files {
                folder.add_file(cab_name(&entry.path));
            }
        }

        let file = File::create(output).at(output)?;
        let mut writer = builder.build(file).map_err(cab_err)?;
        let mut index = 0;
        while let Some(mut slot) = writer.next_file().map_err(cab_err)? {
            let entry = files
                .get(index)
                .ok_or_else(|| PackError::container("cab", "writer asked for more files than declared"))?;
            let mut reader = entry.source.open()?;
            io::copy(&mut reader, &mut slot)
                .map_err(|e| PackError::container("cab", format!("writing '{}': {e}", entry.path)))?;
            index += 1;
        }
        writer.finish().map_err(cab_err)?;
        Ok(files.len())
    }

    /// Every file of an existing cabinet with its content.
    fn extract_all(container: &Path) -> Result<Vec<ContainerEntry>> {
        let file = File::open(container).at(container)?;
        let mut cabinet = Cabinet::new(file).map_err(cab_err)?;

        let names: Vec<String> = cabinet
            .folder_entries()
            .flat_map(|folder| folder.file_entries())
            .map(|file| file.name().to_string())
            .collect();

        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let mut bytes = Vec::new();
            cabinet
                .read_file(&name)
                .and_then(|mut reader| reader.read_to_end(&mut bytes))
                .map_err(|e| PackError::container("cab", format!("reading '{name}': {e}")))?;
            entries.push(ContainerEntry::file(
                name.replace('\\', "/"),
                ContentSource::Bytes(bytes),
            ));
        }
        Ok(entries)
    }
}

impl FormatAdapter for CabAdapter {
    fn kind(&self) -> FormatKind {
        FormatKind::Cabinet
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            merge: MergeStyle::Rebuild,
            password: PasswordSupport::None,
            hide: false,
            listable: true,
        }
    }

    fn namespace(&self, mode: Mode) -> Namespace {
        match mode {
            Mode::Fresh => Namespace::Hierarchical,
            Mode::Merge => Namespace::Flat,
        }
    }

    fn build(
        &self,
        ctx: &mut PackContext,
        _spec: &ContainerSpec,
        entries: &[ContainerEntry],
        output: &Path,
    ) -> Result<()> {
        let count = Self::write_cabinet(entries, output)?;
        ctx.info(format!("packaged {count} files into cabinet"));
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
        let mut union = Self::extract_all(existing)?;
        let kept = union.len();
        ctx.info(format!("extracted {kept} files from existing cabinet"));

        for entry in entries.iter().filter(|e| !e.is_dir) {
            let flat = entry.flatten_for(Namespace::Flat);
            if flat.flattened {
                ctx.warn(format!("cabinet merge flattens '{}' to '{}'", entry.path, flat.path));
            }
            union.push(flat);
        }

        let count = Self::write_cabinet(&union, output)?;
        ctx.info(format!("rebuilt cabinet with {count} files ({} new)", count - kept));
        Ok(())
    }

    fn list(&self, _ctx: &mut PackContext, container: &Path) -> Result<Vec<ContainerEntry>> {
        let file = File::open(container).at(container)?;
        let cabinet = Cabinet::new(file).map_err(cab_err)?;
        Ok(cabinet
            .folder_entries()
            .flat_map(|folder| folder.file_entries())
            .map(|file| {
                ContainerEntry::file(
                    file.name().replace('\\', "/"),
                    ContentSource::Stored {
                        size: u64::from(file.uncompressed_size()),
                    },
                )
            })
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn read_cab(path: &Path) -> Vec<(String, Vec<u8>)> {
        CabAdapter::extract_all(path)
            .unwrap()
            .into_iter()
            .map(|e| (e.path.clone(), e.source.read_all().unwrap()))
            .collect()
    }

    fn entry(name: &str, body: &[u8]) -> ContainerEntry {
        ContainerEntry::file(name, ContentSource::Bytes(body.to_vec()))
    }

    #[test]
    fn names_use_backslashes() {
        assert_eq!(cab_name("sub/dir/file.txt"), "sub\\dir\\file.txt");
        assert_eq!(cab_name("file.txt"), "file.txt");
    }

    #[test]
    fn fresh_build_keeps_subpaths() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out.cab");
        let spec = ContainerSpec::new(FormatKind::Cabinet, "in", &out);

        CabAdapter
            .build(
                &mut PackContext::default(),
                &spec,
                &[entry("a.txt", b"alpha"), entry("sub/b.txt", b"beta")],
                &out,
            )
            .unwrap();

        assert_eq!(
            read_cab(&out),
            vec![
                ("a.txt".to_string(), b"alpha".to_vec()),
                ("sub/b.txt".to_string(), b"beta".to_vec()),
            ]
        );
    }

    #[test]
    fn merge_keeps_existing_bytes_and_flattens_new_entries() {
        let temp = TempDir::new().unwrap();
        let original = temp.path().join("original.cab");
        let out = temp.path().join("out.cab");
        let spec = ContainerSpec::new(FormatKind::Cabinet, "in", &out).with_backdoor(&original);
        let mut ctx = PackContext::default();

        let payload: Vec<u8> = (0..70_000u32).map(|i| (i % 241) as u8).collect();
        CabAdapter
            .build(
                &mut ctx,
                &spec,
                &[entry("setup/data.bin", &payload), entry("readme.txt", b"read me")],
                &original,
            )
            .unwrap();

        CabAdapter
            .merge(&mut ctx, &spec, &original, &[entry("tools/run.exe", b"MZ")], &out)
            .unwrap();

        let files = read_cab(&out);
        assert!(files.contains(&("setup/data.bin".to_string(), payload)));
        assert!(files.contains(&("readme.txt".to_string(), b"read me".to_vec())));
        assert!(files.contains(&("run.exe".to_string(), b"MZ".to_vec())));
        assert_eq!(files.len(), 3);
        assert!(ctx.diagnostics().iter().any(|d| d.message.contains("flattens")));
    }

    #[test]
    fn merge_in_place() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out.cab");
        let spec = ContainerSpec::new(FormatKind::Cabinet, "in", &out).with_backdoor(&out);
        let mut ctx = PackContext::default();

        CabAdapter.build(&mut ctx, &spec, &[entry("a.txt", b"a")], &out).unwrap();
        CabAdapter
            .merge(&mut ctx, &spec, &out, &[entry("b.txt", b"b")], &out)
            .unwrap();

        let listed = CabAdapter.list(&mut ctx, &out).unwrap();
        let names: Vec<&str> = listed.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        assert_eq!(listed[1].source, ContentSource::Stored { size: 1 });
    }
}
