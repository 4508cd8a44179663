//! Host seam for virtual disk operations.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use super::letters::parse_wmic_csv;
use crate::context::PackContext;
use crate::error::Result;
use crate::preflight::command_exists;
use crate::process::Cmd;

/// Pause after attaching a disk before its mount path is probed.
pub const SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Everything the session manager needs from the operating system.
pub trait DiskHost: Send + Sync {
    /// Whether this host can attach and mount virtual disks at all.
    fn supports_mounting(&self) -> bool;

    fn is_elevated(&self) -> bool;

    /// Drive letters currently in use.
    fn occupied_letters(&self, ctx: &PackContext) -> Result<BTreeSet<char>>;

    /// Run `diskpart /s <script>`. Returns the captured output.
    fn run_diskpart(&self, ctx: &PackContext, script: &Path) -> Result<String>;

    /// Run the `Get-MountedVHDDrive` helper and return the first letter it reports.
    fn find_mounted_vhd_letter(&self, ctx: &PackContext, helper: &Path) -> Result<Option<char>>;

    /// Root directory of a mounted volume.
    fn mount_root(&self, letter: char) -> PathBuf;

    /// Mount check. A directory probe, so a slow mount can read as absent.
    fn volume_present(&self, letter: char) -> bool {
        self.mount_root(letter).is_dir()
    }

    fn settle(&self);
}

/// Windows implementation driving `diskpart`, `wmic` and `powershell`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsHost;

impl DiskHost for WindowsHost {
    fn supports_mounting(&self) -> bool {
        cfg!(windows) && command_exists("diskpart")
    }

    fn is_elevated(&self) -> bool {
        // `net session` only succeeds from an elevated prompt.
        Cmd::new("net")
            .arg("session")
            .allow_fail()
            .run()
            .map(|result| result.success())
            .unwrap_or(false)
    }

    fn occupied_letters(&self, ctx: &PackContext) -> Result<BTreeSet<char>> {
        let result = Cmd::new("wmic")
            .args(["LOGICALDISK", "LIST", "BRIEF", "/format:csv"])
            .timeout(ctx.tool_timeout())
            .error_msg("listing logical disks failed")
            .run()?;
        Ok(parse_wmic_csv(&result.stdout))
    }

    fn run_diskpart(&self, ctx: &PackContext, script: &Path) -> Result<String> {
        let result = Cmd::new("diskpart")
            .arg("/s")
            .arg_path(script)
            .timeout(ctx.tool_timeout())
            .error_msg(format!("diskpart script {} failed", script.display()))
            .run()?;
        Ok(result.combined())
    }

    fn find_mounted_vhd_letter(&self, ctx: &PackContext, helper: &Path) -> Result<Option<char>> {
        let command = format!(
            ". '{}' ; (Get-MountedVHDDrive)[0].DeviceID",
            helper.display()
        );
        let result = Cmd::new("powershell")
            .args(["-NoProfile", "-ExecutionPolicy", "Bypass", "-Command"])
            .arg(command)
            .timeout(ctx.tool_timeout())
            .allow_fail()
            .run()?;
        if !result.success() {
            tracing::debug!("Get-MountedVHDDrive failed: {}", result.combined());
            return Ok(None);
        }
        Ok(parse_device_id(&result.stdout))
    }

    fn mount_root(&self, letter: char) -> PathBuf {
        PathBuf::from(format!("{letter}:\\"))
    }

    fn settle(&self) {
        thread::sleep(SETTLE_DELAY);
    }
}

/// First `X:` style device id in helper output.
fn parse_device_id(output: &str) -> Option<char> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| {
            let mut chars = line.chars();
            match (chars.next(), chars.next()) {
                (Some(c), Some(':')) | (Some(c), None) if c.is_ascii_alphabetic() => {
                    Some(c.to_ascii_uppercase())
                }
                _ => None,
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_parsing() {
        assert_eq!(parse_device_id("E:\r\n"), Some('E'));
        assert_eq!(parse_device_id("\n  f:  \n"), Some('F'));
        assert_eq!(parse_device_id(""), None);
        assert_eq!(parse_device_id("Cannot index into a null array."), None);
    }

    #[test]
    fn windows_mount_root() {
        assert_eq!(WindowsHost.mount_root('X'), PathBuf::from("X:\\"));
    }

    #[cfg(not(windows))]
    #[test]
    fn mounting_unsupported_off_windows() {
        assert!(!WindowsHost.supports_mounting());
    }
}
