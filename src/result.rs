//! Outcome of one packaging request.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::artifact::disk::VhdState;
use crate::context::{Degradation, Diagnostic, PackContext};
use crate::error::{ErrorKind, IoResultExt, PackError, Result};

/// Why a request failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
    /// Tool output or remediation steps attached to the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<&PackError> for Failure {
    fn from(err: &PackError) -> Self {
        let detail = match err {
            PackError::ExternalToolFailure { output, .. } if !output.is_empty() => {
                Some(output.clone())
            }
            PackError::DetachFailure { remediation, .. } => Some(remediation.clone()),
            _ => None,
        };
        Self {
            kind: err.kind(),
            message: err.to_string(),
            detail,
        }
    }
}

/// Everything a caller learns about a packaging request.
///
/// `success` implies the artifact exists at `artifact`. Degradations are
/// listed even on success: they describe properties the artifact lost.
#[derive(Debug, Clone, Serialize)]
pub struct PackagingResult {
    pub success: bool,
    pub artifact: PathBuf,
    pub diagnostics: Vec<Diagnostic>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    pub degradations: Vec<Degradation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vhd_state: Option<VhdState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl PackagingResult {
    /// Close out a request from its context and outcome.
    pub(crate) fn finish(ctx: PackContext, artifact: &Path, outcome: Result<()>) -> Self {
        let mut ctx = ctx;
        let (failure, digest) = match outcome.and_then(|()| sha256_file(artifact)) {
            Ok(digest) => (None, Some(digest)),
            Err(err) => {
                ctx.error(err.to_string());
                (Some(Failure::from(&err)), None)
            }
        };

        let (diagnostics, degradations, vhd_state) = ctx.into_parts();
        Self {
            success: failure.is_none() && artifact.is_file(),
            artifact: artifact.to_path_buf(),
            diagnostics,
            failure,
            degradations,
            vhd_state,
            sha256: digest.as_ref().map(|(sha, _)| sha.clone()),
            size: digest.map(|(_, size)| size),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.failure.as_ref().map(|f| f.kind)
    }
}

/// SHA-256 hex digest and size of a file.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let file = File::open(path).at(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = reader.read(&mut buf).at(path)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn digest_of_known_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("abc.txt");
        fs::write(&path, b"abc").unwrap();

        let (sha, size) = sha256_file(&path).unwrap();
        assert_eq!(
            sha,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(size, 3);
    }

    #[test]
    fn failure_keeps_remediation() {
        let err = PackError::DetachFailure {
            letter: 'X',
            remediation: "cmd> diskpart".into(),
        };
        let failure = Failure::from(&err);
        assert_eq!(failure.kind, ErrorKind::DetachFailure);
        assert_eq!(failure.detail.as_deref(), Some("cmd> diskpart"));
    }

    #[test]
    fn missing_artifact_is_not_success() {
        let temp = TempDir::new().unwrap();
        let result = PackagingResult::finish(
            PackContext::default(),
            &temp.path().join("never-written.zip"),
            Ok(()),
        );
        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ErrorKind::Io));
        assert!(result.sha256.is_none());
    }

    #[test]
    fn serializes_to_json() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out.zip");
        fs::write(&path, b"PK").unwrap();
        let result = PackagingResult::finish(PackContext::default(), &path, Ok(()));

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["size"], 2);
        assert!(json.get("failure").is_none());
    }
}
