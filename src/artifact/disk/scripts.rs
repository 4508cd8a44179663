//! diskpart and PowerShell script generation.
//!
//! Scripts are rendered from fixed templates by placeholder substitution and
//! written into the session's scratch directory.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{IoResultExt, Result};
use crate::spec::VhdFilesystem;

const CREATE_TEMPLATE: &str = "\
create vdisk file=\"<<<FILE>>>\" maximum=<<<SIZE_IN_MB>>> type=expandable
select vdisk file=\"<<<FILE>>>\"
attach vdisk
create partition primary
format fs=<<<FILESYSTEM>>> quick
assign letter=<<<DRIVE_LETTER>>>
exit
";

const MOUNT_TEMPLATE: &str = "\
select vdisk file=\"<<<FILE>>>\"
attach vdisk
select partition 1
assign letter=<<<DRIVE_LETTER>>>
exit
";

const DETACH_TEMPLATE: &str = "\
select vdisk file=\"<<<FILE>>>\"
detach vdisk
exit
";

/// Defines `Get-MountedVHDDrive`, listing logical disks that live on
/// attached virtual disks.
pub const MOUNTED_VHD_HELPER: &str = r#"function Get-MountedVHDDrive {
    $disks = Get-CimInstance -ClassName Win32_DiskDrive | Where-Object { $_.Model -match 'Virtual Disk' }
    foreach ($disk in $disks) {
        $partitions = Get-CimAssociatedInstance -InputObject $disk -ResultClassName Win32_DiskPartition
        foreach ($partition in $partitions) {
            Get-CimAssociatedInstance -InputObject $partition -ResultClassName Win32_LogicalDisk
        }
    }
}
"#;

/// File name of the helper inside the scratch directory.
pub const MOUNTED_VHD_HELPER_NAME: &str = "Get-MountedVHDDrive.ps1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    /// Create, format and mount a new dynamic disk.
    CreateAndMount,
    /// Attach an existing disk and mount its first partition.
    MountExisting,
    Detach,
}

impl ScriptKind {
    fn template(self) -> &'static str {
        match self {
            Self::CreateAndMount => CREATE_TEMPLATE,
            Self::MountExisting => MOUNT_TEMPLATE,
            Self::Detach => DETACH_TEMPLATE,
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            Self::CreateAndMount => "diskpart-create-vhd.txt",
            Self::MountExisting => "diskpart-mount-vhd.txt",
            Self::Detach => "diskpart-detach-vhd.txt",
        }
    }
}

/// Values substituted into a template.
#[derive(Debug, Clone)]
pub struct ScriptParams<'a> {
    pub file: &'a Path,
    pub size_mb: u64,
    pub filesystem: VhdFilesystem,
    pub letter: char,
}

pub fn render(kind: ScriptKind, params: &ScriptParams<'_>) -> String {
    kind.template()
        .replace("<<<FILE>>>", &params.file.to_string_lossy())
        .replace("<<<SIZE_IN_MB>>>", &params.size_mb.to_string())
        .replace("<<<FILESYSTEM>>>", params.filesystem.diskpart_name())
        .replace("<<<DRIVE_LETTER>>>", &params.letter.to_string())
}

/// Render `kind` and write it into `dir`. Returns the script path.
pub fn write_script(dir: &Path, kind: ScriptKind, params: &ScriptParams<'_>) -> Result<PathBuf> {
    let path = dir.join(kind.file_name());
    let body = render(kind, params);
    tracing::debug!("diskpart script {}:\n{}", path.display(), body);
    fs::write(&path, body).at(&path)?;
    Ok(path)
}

pub fn write_helper(dir: &Path) -> Result<PathBuf> {
    let path = dir.join(MOUNTED_VHD_HELPER_NAME);
    fs::write(&path, MOUNTED_VHD_HELPER).at(&path)?;
    Ok(path)
}

/// Manual steps for an operator when a disk stays attached.
pub fn detach_remediation(file: &Path) -> String {
    format!(
        "To detach the virtual disk manually, run these from an elevated prompt:\n\
         \n\
         cmd> diskpart\n\
         DISKPART> list vdisk\n\
         DISKPART> select vdisk file=\"{file}\"\n\
         DISKPART> detach vdisk\n",
        file = file.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn params(file: &Path) -> ScriptParams<'_> {
        ScriptParams {
            file,
            size_mb: 2048,
            filesystem: VhdFilesystem::Ntfs,
            letter: 'V',
        }
    }

    #[test]
    fn create_script_substitutes_every_placeholder() {
        let file = Path::new("C:\\out\\disk.vhdx");
        let script = render(ScriptKind::CreateAndMount, &params(file));
        assert!(!script.contains("<<<"));
        assert!(script.contains("create vdisk file=\"C:\\out\\disk.vhdx\" maximum=2048"));
        assert!(script.contains("format fs=ntfs quick"));
        assert!(script.contains("assign letter=V"));
    }

    #[test]
    fn detach_script_targets_backing_file() {
        let file = Path::new("disk.vhd");
        let script = render(ScriptKind::Detach, &params(file));
        assert_eq!(
            script.lines().collect::<Vec<_>>(),
            vec!["select vdisk file=\"disk.vhd\"", "detach vdisk", "exit"]
        );
    }

    #[test]
    fn scripts_land_in_the_given_directory() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("disk.vhd");
        let path = write_script(temp.path(), ScriptKind::MountExisting, &params(&file)).unwrap();
        assert!(path.starts_with(temp.path()));
        assert!(fs::read_to_string(path).unwrap().contains("select partition 1"));
    }

    #[test]
    fn remediation_names_the_file() {
        let text = detach_remediation(Path::new("D:\\payload.vhd"));
        assert!(text.contains("select vdisk file=\"D:\\payload.vhd\""));
        assert!(text.contains("detach vdisk"));
    }
}
