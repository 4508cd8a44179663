//! Per-operation context threaded through every stage.
//!
//! Holds the settings a stage may need (scratch location, tool timeout) and
//! collects what the stages report back (diagnostics, degradations, virtual
//! disk state). Diagnostics are forwarded to `tracing` as they are recorded,
//! so the injected subscriber decides where they end up.

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

use crate::artifact::disk::VhdState;
use crate::error::{IoResultExt, Result};

/// Default bound for every external tool invocation.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// A property the artifact lost because of a later stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Degradation {
    /// ZIP password re-encode discarded hidden/read-only flags.
    AttributesDroppedByReencode,
    /// PDF encryption keeps viewers from running the auto-launch script.
    AutoLaunchDisabledByEncryption,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub level: Level,
    pub message: String,
}

/// Settings the caller can tune for one packaging operation.
#[derive(Debug, Clone)]
pub struct ContextSettings {
    /// Parent directory for scratch directories; the system temp dir when `None`.
    pub scratch_root: Option<PathBuf>,
    pub tool_timeout: Duration,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            scratch_root: None,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }
}

#[derive(Debug)]
pub struct PackContext {
    settings: ContextSettings,
    diagnostics: Vec<Diagnostic>,
    degradations: Vec<Degradation>,
    vhd_state: Option<VhdState>,
}

impl PackContext {
    pub fn new(settings: ContextSettings) -> Self {
        Self {
            settings,
            diagnostics: Vec::new(),
            degradations: Vec::new(),
            vhd_state: None,
        }
    }

    pub fn tool_timeout(&self) -> Duration {
        self.settings.tool_timeout
    }

    /// Create a scratch directory that is removed when the guard drops.
    pub fn scratch_dir(&self, purpose: &str) -> Result<TempDir> {
        let prefix = format!("repackager-{purpose}-");
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        match &self.settings.scratch_root {
            Some(root) => builder.tempdir_in(root).at(root),
            None => builder.tempdir().at(&std::env::temp_dir()),
        }
    }

    pub fn info(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{}", message);
        self.push(Level::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{}", message);
        self.push(Level::Warn, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{}", message);
        self.push(Level::Error, message);
    }

    fn push(&mut self, level: Level, message: String) {
        self.diagnostics.push(Diagnostic { level, message });
    }

    pub fn degrade(&mut self, degradation: Degradation) {
        if !self.degradations.contains(&degradation) {
            self.degradations.push(degradation);
        }
    }

    pub fn set_vhd_state(&mut self, state: VhdState) {
        tracing::debug!("virtual disk session -> {:?}", state);
        self.vhd_state = Some(state);
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn degradations(&self) -> &[Degradation] {
        &self.degradations
    }

    pub fn vhd_state(&self) -> Option<VhdState> {
        self.vhd_state
    }

    pub(crate) fn into_parts(self) -> (Vec<Diagnostic>, Vec<Degradation>, Option<VhdState>) {
        (self.diagnostics, self.degradations, self.vhd_state)
    }
}

impl Default for PackContext {
    fn default() -> Self {
        Self::new(ContextSettings::default())
    }
}
