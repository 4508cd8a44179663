//! Virtual disk adapter.
//!
//! Thin layer over [`VhdSessionManager`]: the disk lifecycle (letter
//! arbitration, diskpart scripts, mount verification, detach) lives in
//! [`super::disk`].

use std::path::Path;
use std::sync::Arc;

use super::disk::{DiskHost, VhdSessionManager};
use super::{Capabilities, FormatAdapter, MergeStyle, PasswordSupport};
use crate::context::PackContext;
use crate::entry::{ContainerEntry, Namespace};
use crate::error::Result;
use crate::spec::{ContainerSpec, FormatKind, Mode};

pub struct VhdAdapter {
    sessions: VhdSessionManager,
}

impl VhdAdapter {
    pub fn new(host: Arc<dyn DiskHost>) -> Self {
        Self {
            sessions: VhdSessionManager::new(host),
        }
    }
}

impl FormatAdapter for VhdAdapter {
    fn kind(&self) -> FormatKind {
        FormatKind::Vhd
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            merge: MergeStyle::CopyOnto,
            password: PasswordSupport::None,
            hide: false,
            listable: false,
        }
    }

    fn namespace(&self, _mode: Mode) -> Namespace {
        Namespace::Flat
    }

    fn build(
        &self,
        ctx: &mut PackContext,
        spec: &ContainerSpec,
        entries: &[ContainerEntry],
        _output: &Path,
    ) -> Result<()> {
        let session = self.sessions.run(ctx, spec, entries, None)?;
        ctx.info(format!(
            "created {} MB {} virtual disk {}",
            session.size_mb(),
            session.filesystem().diskpart_name(),
            session.backing_file().display()
        ));
        Ok(())
    }

    fn merge(
        &self,
        ctx: &mut PackContext,
        spec: &ContainerSpec,
        existing: &Path,
        entries: &[ContainerEntry],
        _output: &Path,
    ) -> Result<()> {
        let session = self.sessions.run(ctx, spec, entries, Some(existing))?;
        ctx.info(format!(
            "copied {} entries onto virtual disk {}",
            entries.len(),
            session.backing_file().display()
        ));
        Ok(())
    }
}
