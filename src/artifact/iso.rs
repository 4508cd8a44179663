//! ISO 9660 image adapter.
//!
//! Images are written by `xorriso` in mkisofs mode from a scratch staging
//! tree with Joliet names. Existing images are read in-crate (see
//! [`super::iso_tree`]); a merge extracts every entry, adds the new ones and
//! rebuilds the image from the union.

use std::fs::{self, File};
use std::path::Path;

use super::filesystem::{entry_path, stage_entries};
use super::iso_tree::{IsoImage, IsoRecord};
use super::{Capabilities, FormatAdapter, MergeStyle, PasswordSupport};
use crate::attributes::iso::mark_hidden;
use crate::context::PackContext;
use crate::entry::{Attributes, ContainerEntry, ContentSource, Namespace};
use crate::error::{IoResultExt, Result};
use crate::preflight::{check_required_tools, ISO_TOOLS};
use crate::process::Cmd;
use crate::spec::{ContainerSpec, FormatKind, Mode};

/// Volume label used when none can be derived from the output name.
pub const DEFAULT_LABEL: &str = "CDROM";

/// Maximum volume identifier length.
const LABEL_MAX: usize = 32;

/// Derive a volume label from the output file name.
///
/// Uppercased, restricted to `A-Z`, `0-9` and `_`, at most 32 characters.
pub fn volume_label(output: &Path) -> String {
    let label: String = output
        .file_stem()
        .map(|stem| stem.to_string_lossy())
        .unwrap_or_default()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .take(LABEL_MAX)
        .collect();

    if label.trim_matches('_').is_empty() {
        DEFAULT_LABEL.to_string()
    } else {
        label
    }
}

/// Run xorriso to create an image from a staging tree.
///
/// # Arguments
///
/// * `ctx` - Supplies the tool timeout
/// * `staging` - Directory whose contents become the image root
/// * `output` - Path for the output image
/// * `label` - Volume label
pub fn run_xorriso(ctx: &PackContext, staging: &Path, output: &Path, label: &str) -> Result<()> {
    Cmd::new("xorriso")
        .args(["-as", "mkisofs", "-o"])
        .arg_path(output)
        .args(["-V", label])
        .args(["-J", "-joliet-long", "-iso-level", "3"])
        .arg_path(staging)
        .timeout(ctx.tool_timeout())
        .error_msg("xorriso failed. Install xorriso.")
        .run()?;
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IsoAdapter;

impl IsoAdapter {
    fn write_image(
        &self,
        ctx: &mut PackContext,
        entries: &[ContainerEntry],
        output: &Path,
        label: &str,
    ) -> Result<()> {
        check_required_tools(ISO_TOOLS)?;

        let scratch = ctx.scratch_dir("iso")?;
        let staging = scratch.path().join("root");
        stage_entries(&staging, entries)?;

        if output.extension().map(|e| e.eq_ignore_ascii_case("img")).unwrap_or(false) {
            ctx.info("writing an ISO 9660 image with an .img extension");
        }
        run_xorriso(ctx, &staging, output, label)?;
        ctx.info(format!("built ISO image '{label}' with {} entries", entries.len()));
        Ok(())
    }

    /// Existing entries extracted into `staging`, as directory and file entries.
    fn extract(
        &self,
        image: &mut IsoImage,
        records: &[IsoRecord],
        staging: &Path,
    ) -> Result<Vec<ContainerEntry>> {
        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            let dest = entry_path(staging, &record.path)?;
            if record.is_dir() {
                fs::create_dir_all(&dest).at(&dest)?;
                entries.push(ContainerEntry::dir(record.path.clone()));
                continue;
            }
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).at(parent)?;
            }
            let mut out = File::create(&dest).at(&dest)?;
            image.copy_extent(record, &mut out)?;
            entries.push(ContainerEntry::file(record.path.clone(), ContentSource::File(dest)));
        }
        Ok(entries)
    }
}

impl FormatAdapter for IsoAdapter {
    fn kind(&self) -> FormatKind {
        FormatKind::Iso
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            merge: MergeStyle::Rebuild,
            password: PasswordSupport::None,
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
        spec: &ContainerSpec,
        entries: &[ContainerEntry],
        output: &Path,
    ) -> Result<()> {
        self.write_image(ctx, entries, output, &volume_label(&spec.output))
    }

    fn merge(
        &self,
        ctx: &mut PackContext,
        _spec: &ContainerSpec,
        existing: &Path,
        entries: &[ContainerEntry],
        output: &Path,
    ) -> Result<()> {
        let mut image = IsoImage::open(existing)?;
        let tree = image.preferred_tree();
        let records = image.walk(tree)?;
        let label = match image.volume_id() {
            "" => DEFAULT_LABEL.to_string(),
            id => id.to_string(),
        };
        let hidden: Vec<String> = records
            .iter()
            .filter(|r| !r.is_dir() && r.is_hidden())
            .map(|r| r.path.clone())
            .collect();

        let scratch = ctx.scratch_dir("iso-merge")?;
        let mut union = self.extract(&mut image, &records, scratch.path())?;
        drop(image);
        ctx.info(format!(
            "extracted {} entries from existing image '{}' ({:?} tree)",
            union.len(),
            label,
            tree
        ));

        union.extend_from_slice(entries);
        self.write_image(ctx, &union, output, &label)?;

        if !hidden.is_empty() {
            mark_hidden(output, |path| hidden.iter().any(|h| h == path))?;
            ctx.info(format!("restored hidden flag on {} existing entries", hidden.len()));
        }
        Ok(())
    }

    fn list(&self, _ctx: &mut PackContext, container: &Path) -> Result<Vec<ContainerEntry>> {
        let mut image = IsoImage::open(container)?;
        let tree = image.preferred_tree();
        Ok(image
            .walk(tree)?
            .into_iter()
            .map(|record| {
                let mut entry = if record.is_dir() {
                    ContainerEntry::dir(record.path.clone())
                } else {
                    ContainerEntry::file(
                        record.path.clone(),
                        ContentSource::Stored {
                            size: u64::from(record.size),
                        },
                    )
                };
                entry.attributes = Attributes {
                    hidden: record.is_hidden(),
                    read_only: false,
                };
                entry
            })
            .collect())
    }
}
