//! Visibility and read-only flags on already-built containers.
//!
//! Two stages run after the adapter: the hide stage (user patterns, ZIP and
//! ISO) and the attribute pass (Office documents marked read-only inside ZIP
//! archives, so extractors cannot tag them with a zone identifier).

pub mod iso;
pub mod zip;

use std::path::Path;

use crate::context::PackContext;
use crate::entry::Attributes;
use crate::error::{PackError, Result};
use crate::pattern::WildcardPattern;
use crate::spec::{ContainerSpec, FormatKind};

/// Office document extensions the attribute pass marks read-only.
pub const OFFICE_EXTENSIONS: &[&str] = &[
    "doc", "docx", "docm", "dot", "dotm", "xls", "xlsx", "xlsm", "xlam", "xltm", "ppt", "pptx",
    "pptm", "ppsm", "potm", "ppam",
];

/// Flags to set on every entry matching any of `patterns`.
#[derive(Debug, Clone)]
pub struct AttributeRule {
    pub patterns: Vec<WildcardPattern>,
    pub set: Attributes,
}

/// Rule marking Office documents read-only.
pub fn office_rule() -> AttributeRule {
    AttributeRule {
        patterns: OFFICE_EXTENSIONS
            .iter()
            .filter_map(|ext| WildcardPattern::new(&format!("*.{ext}")).ok())
            .collect(),
        set: Attributes {
            hidden: false,
            read_only: true,
        },
    }
}

/// Rule for the user's hide patterns.
pub fn hide_rule(spec: &ContainerSpec) -> AttributeRule {
    AttributeRule {
        patterns: spec.hide.clone(),
        set: Attributes {
            hidden: true,
            read_only: spec.kind == FormatKind::Zip && spec.read_only_bypass,
        },
    }
}

/// Apply the hide patterns to `artifact`. Returns the number of entries changed.
pub fn hide_stage(ctx: &mut PackContext, spec: &ContainerSpec, artifact: &Path) -> Result<usize> {
    if spec.hide.is_empty() {
        return Ok(0);
    }

    let changed = match spec.kind {
        FormatKind::Zip => zip::apply_rules(artifact, &[hide_rule(spec)])?,
        FormatKind::Iso => iso::apply_hidden(artifact, &spec.hide)?,
        other => {
            return Err(PackError::unsupported(format!(
                "{other} containers cannot carry hidden entries"
            )))
        }
    };

    let patterns: Vec<&str> = spec.hide.iter().map(|p| p.as_str()).collect();
    if changed == 0 {
        ctx.warn(format!("hide patterns matched no entries: {}", patterns.join(",")));
    } else {
        ctx.info(format!("marked {changed} entries hidden ({})", patterns.join(",")));
    }
    Ok(changed)
}

/// Mark Office documents read-only inside ZIP archives unless disabled.
pub fn attribute_pass(ctx: &mut PackContext, spec: &ContainerSpec, artifact: &Path) -> Result<usize> {
    if spec.kind != FormatKind::Zip || !spec.read_only_bypass {
        return Ok(0);
    }

    let changed = zip::apply_rules(artifact, &[office_rule()])?;
    if changed > 0 {
        ctx.info(format!("marked {changed} Office documents read-only"));
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn office_rule_covers_every_extension() {
        let rule = office_rule();
        assert_eq!(rule.patterns.len(), OFFICE_EXTENSIONS.len());
        assert!(rule.set.read_only && !rule.set.hidden);
        assert!(crate::pattern::any_match(&rule.patterns, "Invoice.DOCM"));
        assert!(!crate::pattern::any_match(&rule.patterns, "invoice.pdf"));
    }

    #[test]
    fn hide_rule_read_only_follows_bypass() {
        let spec = ContainerSpec::new(FormatKind::Zip, "in", "out.zip");
        assert!(hide_rule(&spec).set.read_only);
        assert!(!hide_rule(&spec.clone().with_read_only_bypass(false)).set.read_only);

        let iso = ContainerSpec::new(FormatKind::Iso, "in", "out.iso");
        assert!(!hide_rule(&iso).set.read_only);
    }

    #[test]
    fn hide_stage_rejects_formats_without_flags() {
        let spec = ContainerSpec::new(FormatKind::Cabinet, "in", "out.cab")
            .with_hide(crate::pattern::parse_pattern_list("*.exe").unwrap());
        let err = hide_stage(&mut PackContext::default(), &spec, Path::new("out.cab")).unwrap_err();
        assert!(matches!(err, PackError::UnsupportedOption(_)));
    }

    #[test]
    fn attribute_pass_skips_other_formats() {
        let spec = ContainerSpec::new(FormatKind::SevenZip, "in", "missing.7z");
        assert_eq!(
            attribute_pass(&mut PackContext::default(), &spec, Path::new("missing.7z")).unwrap(),
            0
        );
    }
}
