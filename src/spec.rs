//! Packaging request: target format, paths and per-format options.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::PackError;
use crate::pattern::WildcardPattern;

/// Container kinds the engine can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    /// ZIP archive with directory support and DOS attribute bits.
    Zip,
    /// 7z archive with native AES password support.
    SevenZip,
    /// ISO 9660 optical disc image with Joliet names (`.iso`, `.img`).
    Iso,
    /// Microsoft cabinet.
    Cabinet,
    /// PDF document carrying the input as embedded attachments.
    Pdf,
    /// Virtual hard disk populated through diskpart (`.vhd`, `.vhdx`).
    Vhd,
}

/// Extension lookup table. Several extensions may map to the same kind.
const EXTENSIONS: &[(&str, FormatKind)] = &[
    ("zip", FormatKind::Zip),
    ("7z", FormatKind::SevenZip),
    ("iso", FormatKind::Iso),
    ("img", FormatKind::Iso),
    ("cab", FormatKind::Cabinet),
    ("pdf", FormatKind::Pdf),
    ("vhd", FormatKind::Vhd),
    ("vhdx", FormatKind::Vhd),
];

impl FormatKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        EXTENSIONS
            .iter()
            .find(|(candidate, _)| *candidate == ext)
            .map(|(_, kind)| *kind)
    }

    /// Infer the kind from an output path's extension.
    pub fn from_path(path: &Path) -> Result<Self, PackError> {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default();
        Self::from_extension(ext).ok_or_else(|| PackError::UnsupportedFormat(ext.to_string()))
    }

    /// All recognised extensions, in lookup-table order.
    pub fn extensions() -> impl Iterator<Item = &'static str> {
        EXTENSIONS.iter().map(|(ext, _)| *ext)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::SevenZip => "7z",
            Self::Iso => "iso",
            Self::Cabinet => "cab",
            Self::Pdf => "pdf",
            Self::Vhd => "vhd",
        }
    }
}

impl fmt::Display for FormatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FormatKind {
    type Err = PackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s).ok_or_else(|| PackError::UnsupportedFormat(s.to_string()))
    }
}

/// Filesystem used when formatting a fresh virtual disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VhdFilesystem {
    Fat,
    #[default]
    Fat32,
    Ntfs,
}

impl VhdFilesystem {
    /// Value substituted into the diskpart `format fs=` clause.
    pub fn diskpart_name(self) -> &'static str {
        match self {
            Self::Fat => "fat",
            Self::Fat32 => "fat32",
            Self::Ntfs => "ntfs",
        }
    }
}

impl FromStr for VhdFilesystem {
    type Err = PackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fat" => Ok(Self::Fat),
            "fat32" => Ok(Self::Fat32),
            "ntfs" => Ok(Self::Ntfs),
            other => Err(PackError::unsupported(format!(
                "unsupported VHD filesystem '{other}' (expected fat, fat32 or ntfs)"
            ))),
        }
    }
}

/// Default size of a freshly created dynamic VHD.
pub const DEFAULT_VHD_SIZE_MB: u64 = 1024;

/// Virtual-disk specific options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhdOptions {
    pub size_mb: u64,
    /// Explicit mount letter; a free one is picked at random when `None`.
    pub letter: Option<char>,
    pub filesystem: VhdFilesystem,
}

impl Default for VhdOptions {
    fn default() -> Self {
        Self {
            size_mb: DEFAULT_VHD_SIZE_MB,
            letter: None,
            filesystem: VhdFilesystem::default(),
        }
    }
}

/// Parse a user supplied drive letter such as `"x"`, `"X"` or `"X:"`.
pub fn parse_drive_letter(raw: &str) -> Result<char, PackError> {
    let trimmed = raw.trim().trim_end_matches(['\\', '/']).trim_end_matches(':');
    let mut chars = trimmed.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => Ok(c.to_ascii_uppercase()),
        _ => Err(PackError::unsupported(format!(
            "invalid drive letter '{raw}' (expected a single letter A-Z)"
        ))),
    }
}

/// Whether the pipeline builds from scratch or merges into an existing container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Fresh,
    Merge,
}

/// One packaging request.
///
/// Constructed once by the caller and only borrowed by the pipeline.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub kind: FormatKind,
    pub output: PathBuf,
    pub input: PathBuf,
    pub backdoor: Option<PathBuf>,
    pub rename: Option<String>,
    pub password: Option<String>,
    pub hide: Vec<WildcardPattern>,
    pub vhd: VhdOptions,
    /// ZIP only: mark Office documents (and hidden entries) read-only.
    pub read_only_bypass: bool,
}

impl ContainerSpec {
    pub fn new(kind: FormatKind, input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            output: output.into(),
            input: input.into(),
            backdoor: None,
            rename: None,
            password: None,
            hide: Vec::new(),
            vhd: VhdOptions::default(),
            read_only_bypass: true,
        }
    }

    /// Build a spec whose kind is inferred from the output extension.
    pub fn for_output(
        input: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
    ) -> Result<Self, PackError> {
        let output = output.into();
        let kind = FormatKind::from_path(&output)?;
        Ok(Self::new(kind, input, output))
    }

    pub fn with_backdoor(mut self, path: impl Into<PathBuf>) -> Self {
        self.backdoor = Some(path.into());
        self
    }

    pub fn with_rename(mut self, name: impl Into<String>) -> Self {
        self.rename = Some(name.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_hide(mut self, patterns: Vec<WildcardPattern>) -> Self {
        self.hide = patterns;
        self
    }

    pub fn with_vhd(mut self, vhd: VhdOptions) -> Self {
        self.vhd = vhd;
        self
    }

    pub fn with_read_only_bypass(mut self, enabled: bool) -> Self {
        self.read_only_bypass = enabled;
        self
    }

    pub fn mode(&self) -> Mode {
        if self.backdoor.is_some() {
            Mode::Merge
        } else {
            Mode::Fresh
        }
    }

    /// Password, treating an empty string as absent.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref().filter(|pw| !pw.is_empty())
    }
}
