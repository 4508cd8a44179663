//! Preflight checks for host tools.
//!
//! Formats that shell out validate their tools before anything is written,
//! so a missing binary surfaces as one clear error instead of a half-built
//! artifact.
//!
//! # Example
//!
//! ```rust
//! use repackager::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("xorriso") {
//!     println!("xorriso not installed");
//! }
//!
//! let tools = &[("xorriso", "xorriso"), ("qpdf", "qpdf")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use crate::error::{PackError, Result};
use crate::spec::{ContainerSpec, FormatKind};

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools needed to build an ISO image. Each tuple is (command_name, package_name).
pub const ISO_TOOLS: &[(&str, &str)] = &[("xorriso", "xorriso")];

/// Tools needed to encrypt a PDF document.
pub const PDF_PASSWORD_TOOLS: &[(&str, &str)] = &[("qpdf", "qpdf")];

/// Check that specific tools are available.
///
/// # Arguments
///
/// * `tools` - Slice of (command, package) tuples
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err(ExternalToolFailure)` listing every missing tool and its package
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<(&str, &str)> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .copied()
        .collect();

    if missing.is_empty() {
        return Ok(());
    }

    let msg = missing
        .iter()
        .map(|(t, p)| format!("  {} (install: {})", t, p))
        .collect::<Vec<_>>()
        .join("\n");
    Err(PackError::ExternalToolFailure {
        tool: missing
            .iter()
            .map(|(t, _)| *t)
            .collect::<Vec<_>>()
            .join(", "),
        message: format!("missing required host tools:\n{}", msg),
        output: String::new(),
    })
}

/// Tools a packaging request will shell out to.
///
/// The virtual-disk tools (`diskpart`, `powershell`, `wmic`) are not listed
/// here; their availability is part of the host mount capability check.
pub fn tools_for(spec: &ContainerSpec) -> Vec<(&'static str, &'static str)> {
    let mut tools = Vec::new();
    if spec.kind == FormatKind::Iso {
        tools.extend_from_slice(ISO_TOOLS);
    }
    if spec.kind == FormatKind::Pdf && spec.password().is_some() {
        tools.extend_from_slice(PDF_PASSWORD_TOOLS);
    }
    tools
}

/// Check the tools a packaging request needs.
pub fn check_spec_tools(spec: &ContainerSpec) -> Result<()> {
    check_required_tools(&tools_for(spec))
}
