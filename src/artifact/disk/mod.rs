//! Virtual disk sessions.
//!
//! A session creates (or opens) a VHD/VHDX backing file, mounts it on a drive
//! letter through `diskpart`, copies entries onto the volume root and detaches
//! it again. Host interaction goes through [`DiskHost`] so the lifecycle can
//! be driven against a simulated host.
//!
//! The mount and detach checks are directory probes on the mount path after
//! [`host::SETTLE_DELAY`]. A mount that takes longer than that reads as a
//! mismatch; diskpart offers no structured status to wait on instead.

pub mod host;
pub mod letters;
pub mod scripts;

pub use host::{DiskHost, WindowsHost};

use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::context::PackContext;
use crate::entry::ContainerEntry;
use crate::error::{IoResultExt, PackError, Result};
use crate::spec::{ContainerSpec, VhdFilesystem};
use scripts::{ScriptKind, ScriptParams};

/// Nested-path warnings emitted per session before going quiet.
const MAX_FLATTEN_WARNINGS: usize = 3;

/// Lifecycle of one virtual disk session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VhdState {
    Unattached,
    Creating,
    Opening,
    MountRequested,
    Mounted,
    Writing,
    DetachRequested,
    Detached,
    /// Detach was requested but the volume is still reachable.
    LeakedMount,
}

/// One backing file and the volume it is mounted as.
#[derive(Debug, Clone)]
pub struct VhdSession {
    backing_file: PathBuf,
    letter: char,
    filesystem: VhdFilesystem,
    size_mb: u64,
    state: VhdState,
}

impl VhdSession {
    fn new(backing_file: PathBuf, letter: char, filesystem: VhdFilesystem, size_mb: u64) -> Self {
        Self {
            backing_file,
            letter,
            filesystem,
            size_mb,
            state: VhdState::Unattached,
        }
    }

    pub fn backing_file(&self) -> &Path {
        &self.backing_file
    }

    pub fn letter(&self) -> char {
        self.letter
    }

    pub fn filesystem(&self) -> VhdFilesystem {
        self.filesystem
    }

    pub fn size_mb(&self) -> u64 {
        self.size_mb
    }

    pub fn state(&self) -> VhdState {
        self.state
    }

    fn transition(&mut self, ctx: &mut PackContext, state: VhdState) {
        self.state = state;
        ctx.set_vhd_state(state);
    }

    fn params(&self) -> ScriptParams<'_> {
        ScriptParams {
            file: &self.backing_file,
            size_mb: self.size_mb,
            filesystem: self.filesystem,
            letter: self.letter,
        }
    }
}

/// Drives a [`VhdSession`] from creation to detach.
#[derive(Clone)]
pub struct VhdSessionManager {
    host: Arc<dyn DiskHost>,
}

impl VhdSessionManager {
    pub fn new(host: Arc<dyn DiskHost>) -> Self {
        Self { host }
    }

    /// Populate `spec.output` with `entries`.
    ///
    /// With `existing` set, that disk is copied to the output (unless it is
    /// the output) and mounted as is; otherwise a fresh disk is created and
    /// formatted. Generated scripts live in a scratch directory that is gone
    /// when this returns, whichever way it returns.
    pub fn run(
        &self,
        ctx: &mut PackContext,
        spec: &ContainerSpec,
        entries: &[ContainerEntry],
        existing: Option<&Path>,
    ) -> Result<VhdSession> {
        self.check_preconditions(spec)?;

        let backing_file = absolute(&spec.output)?;
        if let Some(existing) = existing {
            let existing = absolute(existing)?;
            if existing != backing_file {
                fs::copy(&existing, &backing_file).at(&existing)?;
            }
        }

        let letter = match spec.vhd.letter {
            Some(letter) => letter,
            None => {
                let occupied = self.host.occupied_letters(ctx)?;
                ctx.info(format!(
                    "drive letters currently occupied: {}",
                    occupied.iter().map(|c| format!("{c}:")).collect::<Vec<_>>().join(" ")
                ));
                letters::allocate_letter(None, &occupied, &mut rand::thread_rng())?
            }
        };
        ctx.info(format!("virtual disk will be mounted on {letter}:"));

        let mut session = VhdSession::new(backing_file, letter, spec.vhd.filesystem, spec.vhd.size_mb);
        ctx.set_vhd_state(session.state);

        let scratch = ctx.scratch_dir("vhd")?;
        let outcome = self.drive(ctx, &mut session, scratch.path(), entries, existing.is_some());
        drop(scratch);

        outcome.map(|()| session)
    }

    fn check_preconditions(&self, spec: &ContainerSpec) -> Result<()> {
        if spec.password().is_some() {
            return Err(PackError::unsupported(
                "virtual disks do not support password protection",
            ));
        }
        if !self.host.supports_mounting() {
            return Err(PackError::unsupported(
                "virtual disk packaging needs a host that can attach and mount volumes (Windows with diskpart)",
            ));
        }
        if !self.host.is_elevated() {
            return Err(PackError::unsupported(
                "virtual disk packaging must run elevated (Administrator) so diskpart can create and mount the disk",
            ));
        }
        Ok(())
    }

    fn drive(
        &self,
        ctx: &mut PackContext,
        session: &mut VhdSession,
        scratch: &Path,
        entries: &[ContainerEntry],
        open_existing: bool,
    ) -> Result<()> {
        let (state, kind) = if open_existing {
            (VhdState::Opening, ScriptKind::MountExisting)
        } else {
            ctx.info(format!(
                "creating {} MB dynamic disk formatted {}",
                session.size_mb,
                session.filesystem.diskpart_name().to_uppercase()
            ));
            (VhdState::Creating, ScriptKind::CreateAndMount)
        };
        session.transition(ctx, state);

        let script = scripts::write_script(scratch, kind, &session.params())?;
        session.transition(ctx, VhdState::MountRequested);
        if let Err(err) = self
            .host
            .run_diskpart(ctx, &script)
            .map(|output| tracing::debug!("diskpart returned:\n{}", output))
        {
            ctx.error(format!("diskpart could not attach {}", session.backing_file.display()));
            self.best_effort_detach(ctx, session, scratch);
            return Err(err);
        }

        self.host.settle();
        self.verify_mount(ctx, session, scratch)?;

        session.transition(ctx, VhdState::Writing);
        let written = self.write_entries(ctx, session, entries);
        if let Err(err) = &written {
            ctx.error(format!("writing onto {}: failed: {}", session.letter, err));
            if is_access_denied(err) {
                ctx.warn("access was denied on the mounted volume; try another letter with --vhd-letter");
            }
        }

        self.detach(ctx, session, scratch)?;
        written
    }

    fn verify_mount(&self, ctx: &mut PackContext, session: &mut VhdSession, scratch: &Path) -> Result<()> {
        if self.host.volume_present(session.letter) {
            ctx.info(format!("mounted {} on {}:", session.backing_file.display(), session.letter));
            session.transition(ctx, VhdState::Mounted);
            return Ok(());
        }

        ctx.warn(format!(
            "volume did not appear on {}: ; looking for the letter the system picked",
            session.letter
        ));
        let helper = scripts::write_helper(scratch)?;
        let discovered = match self.host.find_mounted_vhd_letter(ctx, &helper) {
            Ok(letter) => letter,
            Err(err) => {
                ctx.warn(format!("mounted disk lookup failed: {err}"));
                None
            }
        };

        match discovered {
            Some(letter) if self.host.volume_present(letter) => {
                ctx.warn(format!("system mounted the virtual disk on {letter}: instead"));
                session.letter = letter;
                session.transition(ctx, VhdState::Mounted);
                Ok(())
            }
            _ => {
                let expected = session.letter;
                self.best_effort_detach(ctx, session, scratch);
                Err(PackError::MountMismatch {
                    letter: expected,
                    message: "could not locate where the system mounted the virtual disk; \
                              pass a free letter explicitly with --vhd-letter"
                        .to_string(),
                })
            }
        }
    }

    fn write_entries(
        &self,
        ctx: &mut PackContext,
        session: &VhdSession,
        entries: &[ContainerEntry],
    ) -> Result<()> {
        let root = self.host.mount_root(session.letter);
        let mut warnings = 0;

        for entry in entries.iter().filter(|e| !e.is_dir) {
            if entry.is_nested() && warnings < MAX_FLATTEN_WARNINGS {
                ctx.warn(format!(
                    "virtual disks hold no subdirectories; '{}' goes to the volume root",
                    entry.path
                ));
                warnings += 1;
            }
            let dest = root.join(entry.basename());
            entry.source.write_to(&dest)?;
            tracing::debug!("{} => {}", entry.path, dest.display());
        }

        ctx.info(format!("packaged {} file(s) onto {}:", entries.len(), session.letter));
        Ok(())
    }

    fn detach(&self, ctx: &mut PackContext, session: &mut VhdSession, scratch: &Path) -> Result<()> {
        session.transition(ctx, VhdState::DetachRequested);

        let script = scripts::write_script(scratch, ScriptKind::Detach, &session.params());
        let ran = script.and_then(|script| self.host.run_diskpart(ctx, &script));
        if let Err(err) = &ran {
            ctx.error(format!("detach step failed: {err}"));
        }

        // Only a volume that still resolves counts as leaked.
        if !self.host.volume_present(session.letter) {
            if ran.is_ok() {
                ctx.info(format!("detached virtual disk from {}:", session.letter));
            } else {
                ctx.warn(format!("no volume on {}: after the failed detach step", session.letter));
            }
            session.transition(ctx, VhdState::Detached);
            return Ok(());
        }

        session.transition(ctx, VhdState::LeakedMount);
        let remediation = scripts::detach_remediation(&session.backing_file);
        ctx.error(format!(
            "virtual disk is still mounted on {}: and must be detached manually",
            session.letter
        ));
        Err(PackError::DetachFailure {
            letter: session.letter,
            remediation,
        })
    }

    /// Detach after a failed mount so no anonymous volume stays attached.
    fn best_effort_detach(&self, ctx: &mut PackContext, session: &mut VhdSession, scratch: &Path) {
        if let Err(err) = self.detach(ctx, session, scratch) {
            ctx.error(err.to_string());
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().at(Path::new("."))?;
    Ok(cwd.join(path))
}

fn is_access_denied(err: &PackError) -> bool {
    matches!(err, PackError::Io { source, .. } if source.kind() == io::ErrorKind::PermissionDenied)
}


#[cfg(test)]
mod tests {
    use super::fake::FakeHost;
    use super::*;
    use crate::context::{ContextSettings, Level};
    use crate::error::ErrorKind;
    use crate::entry::ContentSource;
    use crate::spec::{FormatKind, VhdOptions};
    use tempfile::TempDir;

    struct Fixture {
        temp: TempDir,
        ctx: PackContext,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let scratch = temp.path().join("scratch");
            fs::create_dir_all(&scratch).unwrap();
            let ctx = PackContext::new(ContextSettings {
                scratch_root: Some(scratch),
                ..Default::default()
            });
            Self { temp, ctx }
        }

        fn spec(&self, letter: Option<char>) -> ContainerSpec {
            let output = self.temp.path().join("out.vhd");
            ContainerSpec::new(FormatKind::Vhd, self.temp.path().join("in"), output).with_vhd(
                VhdOptions {
                    letter,
                    ..Default::default()
                },
            )
        }

        fn host(&self) -> FakeHost {
            FakeHost::new(self.temp.path())
        }
    }

    fn entry(path: &str, body: &str) -> ContainerEntry {
        ContainerEntry::file(path, ContentSource::Bytes(body.as_bytes().to_vec()))
    }

    fn run(
        fx: &mut Fixture,
        host: FakeHost,
        spec: &ContainerSpec,
        entries: &[ContainerEntry],
    ) -> (Arc<FakeHost>, Result<VhdSession>) {
        let host = Arc::new(host);
        let manager = VhdSessionManager::new(host.clone());
        let result = manager.run(&mut fx.ctx, spec, entries, None);
        (host, result)
    }

    #[test]
    fn fresh_disk_is_created_written_and_detached() {
        let mut fx = Fixture::new();
        let spec = fx.spec(Some('V'));
        let host = fx.host();
        let (host, result) = run(&mut fx, host, &spec, &[entry("payload.exe", "MZ")]);

        let session = result.unwrap();
        assert_eq!(session.state(), VhdState::Detached);
        assert_eq!(session.letter(), 'V');
        assert_eq!(fx.ctx.vhd_state(), Some(VhdState::Detached));
        assert!(spec.output.exists());
        assert_eq!(fs::read(host.detached_dir().join("payload.exe")).unwrap(), b"MZ");
        assert_eq!(host.mounted(), None);

        let seen = host.scripts_seen();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].ends_with("diskpart-create-vhd.txt"));
        assert!(seen.iter().all(|p| !p.exists()));
    }

    #[test]
    fn random_letter_avoids_occupied() {
        let mut fx = Fixture::new();
        let spec = fx.spec(None);
        let mut host = fx.host();
        host.occupied = letters::alphabet().filter(|c| *c != 'M').collect();
        let (_, result) = run(&mut fx, host, &spec, &[entry("a.txt", "a")]);
        assert_eq!(result.unwrap().letter(), 'M');
    }

    #[test]
    fn leaked_mount_reports_remediation_and_cleans_scripts() {
        let mut fx = Fixture::new();
        let spec = fx.spec(Some('L'));
        let mut host = fx.host();
        host.leak = true;
        let (host, result) = run(&mut fx, host, &spec, &[entry("a.txt", "a")]);

        match result.unwrap_err() {
            PackError::DetachFailure { letter, remediation } => {
                assert_eq!(letter, 'L');
                assert!(remediation.contains("detach vdisk"));
                assert!(remediation.contains("out.vhd"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fx.ctx.vhd_state(), Some(VhdState::LeakedMount));
        assert!(!host.scripts_seen().is_empty());
        assert!(host.scripts_seen().iter().all(|p| !p.exists()));
        assert_eq!(host.mounted(), Some('L'));
    }

    #[test]
    fn failed_attach_is_not_reported_as_leaked() {
        let mut fx = Fixture::new();
        let spec = fx.spec(Some('Q'));
        let mut host = fx.host();
        host.diskpart_fails = true;
        let (host, result) = run(&mut fx, host, &spec, &[entry("a.txt", "a")]);

        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalToolFailure);
        assert!(!host.volume_present('Q'));
        assert_eq!(fx.ctx.vhd_state(), Some(VhdState::Detached));
        assert!(!fx
            .ctx
            .diagnostics()
            .iter()
            .any(|d| d.message.contains("detached manually")));
        assert!(host.scripts_seen().iter().all(|p| !p.exists()));
    }

    #[test]
    fn write_failure_still_detaches() {
        let mut fx = Fixture::new();
        let spec = fx.spec(Some('W'));
        let mut host = fx.host();
        // a directory in the way of the file makes the copy fail
        host.preexisting_dirs = vec!["report.doc".to_string()];
        let (host, result) = run(&mut fx, host, &spec, &[entry("report.doc", "doc")]);

        assert!(matches!(result.unwrap_err(), PackError::Io { .. }));
        assert_eq!(fx.ctx.vhd_state(), Some(VhdState::Detached));
        assert_eq!(host.mounted(), None);
        let seen = host.scripts_seen();
        assert!(seen.last().unwrap().ends_with("diskpart-detach-vhd.txt"));
        assert!(seen.iter().all(|p| !p.exists()));
    }

    #[test]
    fn reassigned_letter_is_rediscovered_once() {
        let mut fx = Fixture::new();
        let spec = fx.spec(Some('R'));
        let mut host = fx.host();
        host.reassign = Some('S');
        let (host, result) = run(&mut fx, host, &spec, &[entry("a.txt", "a")]);

        let session = result.unwrap();
        assert_eq!(session.letter(), 'S');
        assert_eq!(session.state(), VhdState::Detached);
        assert_eq!(host.helper_runs(), 1);
        assert!(fx
            .ctx
            .diagnostics()
            .iter()
            .any(|d| d.level == Level::Warn && d.message.contains("S:")));
    }

    #[test]
    fn unresolved_mismatch_fails_and_detaches() {
        let mut fx = Fixture::new();
        let spec = fx.spec(Some('R'));
        let mut host = fx.host();
        host.reassign = Some('S');
        host.helper_finds = false;
        let (host, result) = run(&mut fx, host, &spec, &[entry("a.txt", "a")]);

        let err = result.unwrap_err();
        assert!(matches!(err, PackError::MountMismatch { letter: 'R', .. }));
        assert!(err.to_string().contains("--vhd-letter"));
        assert_eq!(host.helper_runs(), 1);
        assert!(host.scripts_seen().iter().all(|p| !p.exists()));
    }

    #[test]
    fn nested_entries_are_flattened_with_capped_warnings() {
        let mut fx = Fixture::new();
        let spec = fx.spec(Some('N'));
        let entries: Vec<ContainerEntry> = (0..5)
            .map(|i| entry(&format!("dir{i}/file{i}.txt"), "x"))
            .collect();
        let host = fx.host();
        let (host, result) = run(&mut fx, host, &spec, &entries);

        result.unwrap();
        let flatten_warnings = fx
            .ctx
            .diagnostics()
            .iter()
            .filter(|d| d.level == Level::Warn && d.message.contains("volume root"))
            .count();
        assert_eq!(flatten_warnings, 3);
        for i in 0..5 {
            assert!(host.detached_dir().join(format!("file{i}.txt")).exists());
        }
    }

    #[test]
    fn existing_disk_is_copied_and_mounted() {
        let mut fx = Fixture::new();
        let spec = fx.spec(Some('E'));
        let original = fx.temp.path().join("original.vhd");
        fs::write(&original, b"existing disk").unwrap();

        let host = Arc::new(fx.host());
        let manager = VhdSessionManager::new(host.clone());
        manager
            .run(&mut fx.ctx, &spec, &[entry("a.txt", "a")], Some(&original))
            .unwrap();

        assert_eq!(fs::read(&spec.output).unwrap(), b"existing disk");
        assert!(host.scripts_seen()[0].ends_with("diskpart-mount-vhd.txt"));
    }

    #[test]
    fn preconditions_reject_before_any_script() {
        let mut fx = Fixture::new();
        let spec = fx.spec(Some('P')).with_password("pw");
        let host = fx.host();
        let (host, result) = run(&mut fx, host, &spec, &[entry("a.txt", "a")]);
        assert!(matches!(result.unwrap_err(), PackError::UnsupportedOption(_)));
        assert!(host.scripts_seen().is_empty());

        let spec = fx.spec(Some('P'));
        let mut host = fx.host();
        host.elevated = false;
        let (host, result) = run(&mut fx, host, &spec, &[entry("a.txt", "a")]);
        assert!(matches!(result.unwrap_err(), PackError::UnsupportedOption(_)));
        assert!(host.scripts_seen().is_empty());
        assert!(!spec.output.exists());
    }
}
