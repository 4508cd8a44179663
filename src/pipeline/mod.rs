//! The repackaging pipeline.
//!
//! One request runs these steps in a fixed order:
//!
//! 1. option validation and host tool preflight (nothing written yet)
//! 2. entry collection and name validation against the format's namespace,
//!    including names already present in a backdoor source
//! 3. adapter build or merge
//! 4. hide stage, then attribute pass
//! 5. password stage
//!
//! Any failure aborts the remaining steps. Whatever was already written to
//! the output is left in place for the caller to inspect or remove.

mod validate;

pub use validate::check_options;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::artifact::disk::{DiskHost, WindowsHost};
use crate::artifact::{adapter_for, FormatAdapter, MergeStyle, PasswordSupport};
use crate::attributes::{attribute_pass, hide_stage};
use crate::context::{ContextSettings, PackContext};
use crate::entry::{check_against_existing, collect_entries, validate_namespace, ContainerEntry};
use crate::error::{IoResultExt, Result};
use crate::preflight::check_spec_tools;
use crate::result::PackagingResult;
use crate::spec::{ContainerSpec, FormatKind, Mode};

/// Package `spec.input` into `spec.output` with default settings on this host.
pub fn package(spec: &ContainerSpec) -> PackagingResult {
    package_with(ContextSettings::default(), spec, Arc::new(WindowsHost))
}

/// Package with explicit settings and virtual disk host.
pub fn package_with(
    settings: ContextSettings,
    spec: &ContainerSpec,
    host: Arc<dyn DiskHost>,
) -> PackagingResult {
    let mut ctx = PackContext::new(settings);
    let adapter = adapter_for(spec.kind, host);
    let outcome = run(&mut ctx, spec, adapter.as_ref());
    PackagingResult::finish(ctx, &spec.output, outcome)
}

/// Entries of an existing container, without their content.
pub fn list_container(
    settings: ContextSettings,
    kind: FormatKind,
    container: &Path,
) -> Result<Vec<ContainerEntry>> {
    let mut ctx = PackContext::new(settings);
    adapter_for(kind, Arc::new(WindowsHost)).list(&mut ctx, container)
}

fn run(ctx: &mut PackContext, spec: &ContainerSpec, adapter: &dyn FormatAdapter) -> Result<()> {
    let caps = adapter.capabilities();
    let mode = spec.mode();
    check_options(spec, caps)?;
    check_spec_tools(spec)?;

    let namespace = adapter.namespace(mode);
    let entries = collect_entries(ctx, &spec.input, spec.rename.as_deref())?;
    validate_namespace(&entries, namespace)?;

    if let Some(backdoor) = &spec.backdoor {
        if caps.listable {
            let existing = adapter.list(ctx, backdoor)?;
            check_against_existing(&entries, &existing, namespace)?;
            tracing::debug!("backdoor source holds {} entries", existing.len());
        }
    }

    remove_stale_output(ctx, spec)?;
    ctx.info(format!(
        "packaging {} entries into {} ({})",
        entries.len(),
        spec.output.display(),
        match mode {
            Mode::Fresh => "fresh",
            Mode::Merge => "backdoor",
        }
    ));

    write_container(ctx, spec, adapter, &entries)?;

    hide_stage(ctx, spec, &spec.output)?;
    attribute_pass(ctx, spec, &spec.output)?;

    if let Some(password) = spec.password() {
        match caps.password {
            PasswordSupport::PostProcess => adapter.apply_password(ctx, &spec.output, password)?,
            PasswordSupport::Native => tracing::debug!("password applied while writing"),
            PasswordSupport::None => {}
        }
    }

    Ok(())
}

/// Remove an output left over from an earlier run, unless it is the
/// backdoor source being extended in place.
fn remove_stale_output(ctx: &mut PackContext, spec: &ContainerSpec) -> Result<()> {
    if !spec.output.exists() {
        return Ok(());
    }
    if let Some(backdoor) = &spec.backdoor {
        if same_file(backdoor, &spec.output) {
            return Ok(());
        }
    }
    fs::remove_file(&spec.output).at(&spec.output)?;
    ctx.info(format!("removed existing output {}", spec.output.display()));
    Ok(())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn write_container(
    ctx: &mut PackContext,
    spec: &ContainerSpec,
    adapter: &dyn FormatAdapter,
    entries: &[ContainerEntry],
) -> Result<()> {
    let output = spec.output.as_path();

    if adapter.capabilities().merge != MergeStyle::Append {
        return match &spec.backdoor {
            Some(existing) => adapter.merge(ctx, spec, existing, entries, output),
            None => adapter.build(ctx, spec, entries, output),
        };
    }

    // Append formats take the first entry through build/merge and every
    // further one as a single-entry merge into the output.
    let (first, rest) = match entries.split_first() {
        Some(split) => split,
        None => return Ok(()),
    };
    match &spec.backdoor {
        Some(existing) => adapter.merge(ctx, spec, existing, std::slice::from_ref(first), output)?,
        None => adapter.build(ctx, spec, std::slice::from_ref(first), output)?,
    }
    for entry in rest {
        adapter.merge(ctx, spec, output, std::slice::from_ref(entry), output)?;
    }
    Ok(())
}
