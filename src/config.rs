//! Optional TOML configuration.
//!
//! ```toml
//! [tools]
//! timeout_secs = 120
//! scratch_dir = "/var/tmp/repackager"
//!
//! [zip]
//! read_only_bypass = false
//!
//! [vhd]
//! size_mb = 2048
//! filesystem = "ntfs"
//! ```
//!
//! Every key is optional; command line flags override the file.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::context::{ContextSettings, DEFAULT_TOOL_TIMEOUT};
use crate::spec::{VhdFilesystem, DEFAULT_VHD_SIZE_MB};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    tools: Option<ToolsToml>,
    zip: Option<ZipToml>,
    vhd: Option<VhdToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ToolsToml {
    timeout_secs: Option<u64>,
    scratch_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ZipToml {
    read_only_bypass: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VhdToml {
    size_mb: Option<u64>,
    filesystem: Option<String>,
}

/// Resolved configuration with defaults filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub tool_timeout: Duration,
    pub scratch_dir: Option<PathBuf>,
    pub read_only_bypass: bool,
    pub vhd_size_mb: u64,
    pub vhd_filesystem: VhdFilesystem,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            scratch_dir: None,
            read_only_bypass: true,
            vhd_size_mb: DEFAULT_VHD_SIZE_MB,
            vhd_filesystem: VhdFilesystem::default(),
        }
    }
}

impl Config {
    pub fn context_settings(&self) -> ContextSettings {
        ContextSettings {
            scratch_root: self.scratch_dir.clone(),
            tool_timeout: self.tool_timeout,
        }
    }
}

/// `<config dir>/repackager/config.toml`, when the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("repackager").join("config.toml"))
}

/// Load an explicit config file, or the default one if it exists.
pub fn load(explicit: Option<&Path>) -> Result<Config> {
    match explicit {
        Some(path) => load_file(path),
        None => match default_config_path() {
            Some(path) if path.is_file() => load_file(&path),
            _ => Ok(Config::default()),
        },
    }
}

pub fn load_file(path: &Path) -> Result<Config> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading config '{}'", path.display()))?;
    parse(&text).with_context(|| format!("parsing config '{}'", path.display()))
}

fn parse(text: &str) -> Result<Config> {
    let parsed: ConfigToml = toml::from_str(text)?;
    let mut config = Config::default();

    if let Some(tools) = parsed.tools {
        if let Some(secs) = tools.timeout_secs {
            if secs == 0 {
                bail!("tools.timeout_secs must be greater than zero");
            }
            config.tool_timeout = Duration::from_secs(secs);
        }
        config.scratch_dir = tools.scratch_dir;
    }

    if let Some(zip) = parsed.zip {
        config.read_only_bypass = zip.read_only_bypass.unwrap_or(config.read_only_bypass);
    }

    if let Some(vhd) = parsed.vhd {
        if let Some(size) = vhd.size_mb {
            if size == 0 {
                bail!("vhd.size_mb must be greater than zero");
            }
            config.vhd_size_mb = size;
        }
        if let Some(filesystem) = vhd.filesystem {
            config.vhd_filesystem = filesystem.parse()?;
        }
    }

    Ok(config)
}
