//! Option checks that run before anything is written.

use std::path::{Component, Path};

use crate::artifact::{Capabilities, PasswordSupport};
use crate::error::{PackError, Result};
use crate::spec::{ContainerSpec, FormatKind};

/// Reject requests the target format cannot honour.
pub fn check_options(spec: &ContainerSpec, caps: Capabilities) -> Result<()> {
    if !spec.input.exists() {
        return Err(PackError::input_not_found(&spec.input, "no such file or directory"));
    }

    if let Some(backdoor) = &spec.backdoor {
        if !backdoor.is_file() {
            return Err(PackError::input_not_found(backdoor, "backdoor source must be an existing file"));
        }
        if let Ok(kind) = FormatKind::from_path(backdoor) {
            if kind != spec.kind {
                return Err(PackError::unsupported(format!(
                    "backdoor source '{}' is a {kind} container, output is {}",
                    backdoor.display(),
                    spec.kind
                )));
            }
        }
    }

    if spec.password().is_some() && caps.password == PasswordSupport::None {
        return Err(PackError::unsupported(format!(
            "{} containers cannot be password protected",
            spec.kind
        )));
    }

    // qpdf reads the password from an argument file, one argument per line
    let multiline = spec.password().is_some_and(|pw| pw.contains(['\n', '\r']));
    if spec.kind == FormatKind::Pdf && multiline {
        return Err(PackError::unsupported("PDF passwords cannot contain line breaks"));
    }

    if !spec.hide.is_empty() && !caps.hide {
        return Err(PackError::unsupported(format!(
            "{} containers cannot carry hidden entries",
            spec.kind
        )));
    }

    if let Some(rename) = &spec.rename {
        check_rename(rename)?;
    }

    Ok(())
}

/// A rename must stay relative and inside the container root.
fn check_rename(rename: &str) -> Result<()> {
    let normalized = rename.replace('\\', "/");
    let escapes = normalized.starts_with('/')
        || Path::new(&normalized)
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        || normalized.split('/').any(|part| part == "..")
        || normalized.chars().nth(1) == Some(':');

    if rename.trim().is_empty() || escapes {
        return Err(PackError::unsupported(format!(
            "entry name '{rename}' must be a relative path inside the container"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::MergeStyle;
    use crate::pattern::parse_pattern_list;
    use std::fs;
    use tempfile::TempDir;

    fn caps(password: PasswordSupport, hide: bool) -> Capabilities {
        Capabilities {
            merge: MergeStyle::Append,
            password,
            hide,
            listable: true,
        }
    }

    fn input(temp: &TempDir) -> std::path::PathBuf {
        let path = temp.path().join("secret.txt");
        fs::write(&path, "hello, world!").unwrap();
        path
    }

    #[test]
    fn rename_must_stay_inside() {
        assert!(check_rename("invoice.doc").is_ok());
        assert!(check_rename("docs/invoice.doc").is_ok());
        assert!(check_rename("../invoice.doc").is_err());
        assert!(check_rename("docs\\..\\..\\x").is_err());
        assert!(check_rename("/etc/passwd").is_err());
        assert!(check_rename("C:\\x.exe").is_err());
        assert!(check_rename("  ").is_err());
    }

    #[test]
    fn missing_input_and_backdoor() {
        let temp = TempDir::new().unwrap();
        let spec = ContainerSpec::new(FormatKind::Zip, temp.path().join("nope"), "out.zip");
        let err = check_options(&spec, caps(PasswordSupport::PostProcess, true)).unwrap_err();
        assert!(matches!(err, PackError::InputNotFound { .. }));

        let spec = ContainerSpec::new(FormatKind::Zip, input(&temp), "out.zip")
            .with_backdoor(temp.path().join("orig.zip"));
        let err = check_options(&spec, caps(PasswordSupport::PostProcess, true)).unwrap_err();
        assert!(matches!(err, PackError::InputNotFound { .. }));
    }

    #[test]
    fn backdoor_of_another_format() {
        let temp = TempDir::new().unwrap();
        let other = temp.path().join("orig.7z");
        fs::write(&other, b"7z").unwrap();
        let spec = ContainerSpec::new(FormatKind::Zip, input(&temp), "out.zip").with_backdoor(&other);
        let err = check_options(&spec, caps(PasswordSupport::PostProcess, true)).unwrap_err();
        assert!(matches!(err, PackError::UnsupportedOption(_)));
    }

    #[test]
    fn unsupported_password_and_hide() {
        let temp = TempDir::new().unwrap();
        let spec = ContainerSpec::new(FormatKind::Cabinet, input(&temp), "out.cab").with_password("pw");
        let err = check_options(&spec, caps(PasswordSupport::None, false)).unwrap_err();
        assert!(matches!(err, PackError::UnsupportedOption(_)));

        let spec = ContainerSpec::new(FormatKind::Pdf, input(&temp), "out.pdf").with_password("a\nb");
        let err = check_options(&spec, caps(PasswordSupport::PostProcess, false)).unwrap_err();
        assert!(matches!(err, PackError::UnsupportedOption(_)));

        let spec = ContainerSpec::new(FormatKind::SevenZip, input(&temp), "out.7z")
            .with_hide(parse_pattern_list("*.exe").unwrap());
        let err = check_options(&spec, caps(PasswordSupport::Native, false)).unwrap_err();
        assert!(matches!(err, PackError::UnsupportedOption(_)));
    }
}
