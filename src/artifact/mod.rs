//! Format adapters.
//!
//! One adapter per [`FormatKind`], all behind [`FormatAdapter`]:
//! - [`zip`] - ZIP archives (append merge, DOS attribute bits)
//! - [`sevenzip`] - 7z archives (native AES password)
//! - [`iso`] - ISO 9660 images built with xorriso, read in-crate via [`iso_tree`]
//! - [`cab`] - Microsoft cabinets (rebuild merge)
//! - [`pdf`] - PDF documents carrying attachments and an auto-launch script
//! - [`vhd`] - virtual disks populated through [`disk`]
//!
//! [`filesystem`] holds the staging helpers shared by the rebuild-style
//! adapters.

pub mod cab;
pub mod disk;
pub mod filesystem;
pub mod iso;
pub mod iso_tree;
pub mod pdf;
pub mod sevenzip;
pub mod vhd;
pub mod zip;

use std::path::Path;
use std::sync::Arc;

use crate::context::PackContext;
use crate::entry::{ContainerEntry, Namespace};
use crate::error::{PackError, Result};
use crate::spec::{ContainerSpec, FormatKind, Mode};
use disk::DiskHost;

/// How an adapter folds new entries into an existing container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStyle {
    /// Entries are appended one call at a time; the output is the next call's input.
    Append,
    /// The whole container is extracted and rebuilt from the union.
    Rebuild,
    /// Entries are copied onto the mounted container.
    CopyOnto,
}

/// How a format handles a password.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordSupport {
    None,
    /// Encrypted while the container is written.
    Native,
    /// Encrypted by a separate pass over the finished artifact.
    PostProcess,
}

/// Static description of what an adapter can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub merge: MergeStyle,
    pub password: PasswordSupport,
    /// Entries can carry a hidden flag.
    pub hide: bool,
    /// Existing containers can be listed.
    pub listable: bool,
}

/// Uniform interface over every container format.
pub trait FormatAdapter {
    fn kind(&self) -> FormatKind;

    fn capabilities(&self) -> Capabilities;

    /// Naming rules for entries in the given mode.
    fn namespace(&self, mode: Mode) -> Namespace;

    /// Write a fresh container holding `entries` to `output`.
    fn build(
        &self,
        ctx: &mut PackContext,
        spec: &ContainerSpec,
        entries: &[ContainerEntry],
        output: &Path,
    ) -> Result<()>;

    /// Write `existing` plus `entries` to `output`. `existing` may be `output`.
    fn merge(
        &self,
        ctx: &mut PackContext,
        spec: &ContainerSpec,
        existing: &Path,
        entries: &[ContainerEntry],
        output: &Path,
    ) -> Result<()>;

    /// Entries of an existing container, without their content.
    fn list(&self, _ctx: &mut PackContext, _container: &Path) -> Result<Vec<ContainerEntry>> {
        Err(PackError::unsupported(format!(
            "listing {} containers is not supported",
            self.kind()
        )))
    }

    /// Protect a finished artifact. Only called for [`PasswordSupport::PostProcess`].
    fn apply_password(&self, _ctx: &mut PackContext, _artifact: &Path, _password: &str) -> Result<()> {
        Ok(())
    }
}

/// Select the adapter for `kind`.
///
/// `host` is only used by the virtual disk adapter.
pub fn adapter_for(kind: FormatKind, host: Arc<dyn DiskHost>) -> Box<dyn FormatAdapter> {
    match kind {
        FormatKind::Zip => Box::new(zip::ZipAdapter),
        FormatKind::SevenZip => Box::new(sevenzip::SevenZipAdapter),
        FormatKind::Iso => Box::new(iso::IsoAdapter),
        FormatKind::Cabinet => Box::new(cab::CabAdapter),
        FormatKind::Pdf => Box::new(pdf::PdfAdapter),
        FormatKind::Vhd => Box::new(vhd::VhdAdapter::new(host)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(kind: FormatKind) -> Box<dyn FormatAdapter> {
        adapter_for(kind, Arc::new(disk::WindowsHost))
    }

    #[test]
    fn adapter_kind_matches_request() {
        for kind in [
            FormatKind::Zip,
            FormatKind::SevenZip,
            FormatKind::Iso,
            FormatKind::Cabinet,
            FormatKind::Pdf,
            FormatKind::Vhd,
        ] {
            assert_eq!(adapter(kind).kind(), kind);
        }
    }

    #[test]
    fn capability_table() {
        let zip = adapter(FormatKind::Zip).capabilities();
        assert_eq!(zip.merge, MergeStyle::Append);
        assert_eq!(zip.password, PasswordSupport::PostProcess);
        assert!(zip.hide);

        let seven = adapter(FormatKind::SevenZip).capabilities();
        assert_eq!(seven.password, PasswordSupport::Native);
        assert!(!seven.hide);

        let iso = adapter(FormatKind::Iso).capabilities();
        assert_eq!(iso.merge, MergeStyle::Rebuild);
        assert_eq!(iso.password, PasswordSupport::None);
        assert!(iso.hide);

        let cab = adapter(FormatKind::Cabinet).capabilities();
        assert_eq!(cab.merge, MergeStyle::Rebuild);
        assert!(!cab.hide);

        let pdf = adapter(FormatKind::Pdf).capabilities();
        assert_eq!(pdf.merge, MergeStyle::Append);
        assert_eq!(pdf.password, PasswordSupport::PostProcess);

        let vhd = adapter(FormatKind::Vhd).capabilities();
        assert_eq!(vhd.merge, MergeStyle::CopyOnto);
        assert_eq!(vhd.password, PasswordSupport::None);
        assert!(!vhd.listable);
    }

    #[test]
    fn namespaces_per_mode() {
        use Namespace::*;
        let cases = [
            (FormatKind::Zip, Hierarchical, Hierarchical),
            (FormatKind::SevenZip, Hierarchical, Hierarchical),
            (FormatKind::Iso, Hierarchical, Hierarchical),
            (FormatKind::Cabinet, Hierarchical, Flat),
            (FormatKind::Pdf, Flat, Flat),
            (FormatKind::Vhd, Flat, Flat),
        ];
        for (kind, fresh, merge) in cases {
            let adapter = adapter(kind);
            assert_eq!(adapter.namespace(Mode::Fresh), fresh, "{kind} fresh");
            assert_eq!(adapter.namespace(Mode::Merge), merge, "{kind} merge");
        }
    }
}
