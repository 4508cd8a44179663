//! In-place DOS attribute patching for ZIP archives.
//!
//! Only the central directory is touched: for each matching record the low
//! byte of the external attributes gains the requested DOS bits. Records made
//! on a Unix host are switched to MS-DOS so Windows extractors honour the
//! bits. Everything else in the file stays byte-identical.

use std::fs;
use std::path::Path;

use super::AttributeRule;
use crate::error::{IoResultExt, PackError, Result};
use crate::pattern::any_match;

pub const DOS_READ_ONLY: u8 = 0x01;
pub const DOS_HIDDEN: u8 = 0x02;

const EOCD_SIGNATURE: u32 = 0x0605_4b50;
const EOCD_LEN: usize = 22;
const ZIP64_LOCATOR_SIGNATURE: u32 = 0x0706_4b50;
const CENTRAL_SIGNATURE: u32 = 0x0201_4b50;
const CENTRAL_HEADER_LEN: usize = 46;

const HOST_MSDOS: u8 = 0;
const HOST_UNIX: u8 = 3;

/// One central directory record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CentralRecord {
    pub name: String,
    pub made_by: u16,
    pub external_attributes: u32,
    /// Byte offset of the record in the archive.
    offset: usize,
}

impl CentralRecord {
    pub fn host(&self) -> u8 {
        (self.made_by >> 8) as u8
    }

    pub fn dos_attributes(&self) -> u8 {
        (self.external_attributes & 0xff) as u8
    }

    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }
}

fn malformed(message: impl Into<String>) -> PackError {
    PackError::container("zip", message.into())
}

fn u16_at(bytes: &[u8], at: usize) -> Result<u16> {
    bytes
        .get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| malformed("truncated archive"))
}

fn u32_at(bytes: &[u8], at: usize) -> Result<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| malformed("truncated archive"))
}

fn find_eocd(bytes: &[u8]) -> Result<usize> {
    if bytes.len() < EOCD_LEN {
        return Err(malformed("file too small to be a ZIP archive"));
    }
    // The record sits at the end, followed by a comment of at most 64 KiB.
    let lowest = bytes.len().saturating_sub(EOCD_LEN + u16::MAX as usize);
    (lowest..=bytes.len() - EOCD_LEN)
        .rev()
        .find(|&at| u32_at(bytes, at).map(|sig| sig == EOCD_SIGNATURE).unwrap_or(false))
        .ok_or_else(|| malformed("end of central directory not found"))
}

/// Parse every central directory record.
pub fn read_central_directory(bytes: &[u8]) -> Result<Vec<CentralRecord>> {
    let eocd = find_eocd(bytes)?;
    if eocd >= 20 && u32_at(bytes, eocd - 20)? == ZIP64_LOCATOR_SIGNATURE {
        return Err(PackError::unsupported("Zip64 archives cannot be attribute-patched"));
    }

    let count = u16_at(bytes, eocd + 10)?;
    let cd_offset = u32_at(bytes, eocd + 16)?;
    if count == u16::MAX || cd_offset == u32::MAX {
        return Err(PackError::unsupported("Zip64 archives cannot be attribute-patched"));
    }

    let mut records = Vec::with_capacity(count as usize);
    let mut at = cd_offset as usize;
    for _ in 0..count {
        if u32_at(bytes, at)? != CENTRAL_SIGNATURE {
            return Err(malformed(format!("bad central directory signature at offset {at}")));
        }
        let name_len = u16_at(bytes, at + 28)? as usize;
        let extra_len = u16_at(bytes, at + 30)? as usize;
        let comment_len = u16_at(bytes, at + 32)? as usize;
        let name_start = at + CENTRAL_HEADER_LEN;
        let name = bytes
            .get(name_start..name_start + name_len)
            .ok_or_else(|| malformed("truncated entry name"))?;

        records.push(CentralRecord {
            name: String::from_utf8_lossy(name).into_owned(),
            made_by: u16_at(bytes, at + 4)?,
            external_attributes: u32_at(bytes, at + 38)?,
            offset: at,
        });
        at = name_start + name_len + extra_len + comment_len;
    }

    Ok(records)
}

/// Flags the rules grant to `name`.
fn flags_for(name: &str, rules: &[AttributeRule]) -> u8 {
    rules
        .iter()
        .filter(|rule| any_match(&rule.patterns, name))
        .fold(0, |flags, rule| {
            let mut flags = flags;
            if rule.set.hidden {
                flags |= DOS_HIDDEN;
            }
            if rule.set.read_only {
                flags |= DOS_READ_ONLY;
            }
            flags
        })
}

/// Patch file records matching `rules`. Returns how many records changed.
///
/// With no patterns in any rule the archive is not even opened.
pub fn apply_rules(archive: &Path, rules: &[AttributeRule]) -> Result<usize> {
    if rules.iter().all(|rule| rule.patterns.is_empty()) {
        return Ok(0);
    }

    let mut bytes = fs::read(archive).at(archive)?;
    let records = read_central_directory(&bytes)?;

    let mut patched = 0;
    for record in records.iter().filter(|r| !r.is_dir()) {
        let flags = flags_for(record.name.trim_start_matches('/'), rules);
        if flags == 0 || record.dos_attributes() & flags == flags {
            continue;
        }

        let attributes = record.external_attributes | u32::from(flags);
        bytes[record.offset + 38..record.offset + 42].copy_from_slice(&attributes.to_le_bytes());
        if record.host() == HOST_UNIX {
            let made_by = (u16::from(HOST_MSDOS) << 8) | (record.made_by & 0xff);
            bytes[record.offset + 4..record.offset + 6].copy_from_slice(&made_by.to_le_bytes());
        }
        tracing::debug!("zip attributes {:#04x} -> {}", flags, record.name);
        patched += 1;
    }

    if patched > 0 {
        fs::write(archive, &bytes).at(archive)?;
    }
    Ok(patched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::zip::ZipAdapter;
    use crate::artifact::FormatAdapter;
    use crate::context::PackContext;
    use crate::entry::{Attributes, ContainerEntry, ContentSource};
    use crate::pattern::parse_pattern_list;
    use crate::spec::{ContainerSpec, FormatKind};
    use tempfile::TempDir;

    fn archive(temp: &TempDir, names: &[&str]) -> std::path::PathBuf {
        let out = temp.path().join("out.zip");
        let spec = ContainerSpec::new(FormatKind::Zip, "in", &out);
        let entries: Vec<ContainerEntry> = names
            .iter()
            .map(|n| ContainerEntry::file(*n, ContentSource::Bytes(n.as_bytes().to_vec())))
            .collect();
        ZipAdapter
            .build(&mut PackContext::default(), &spec, &entries, &out)
            .unwrap();
        out
    }

    fn hide(patterns: &str) -> Vec<AttributeRule> {
        vec![AttributeRule {
            patterns: parse_pattern_list(patterns).unwrap(),
            set: Attributes {
                hidden: true,
                read_only: false,
            },
        }]
    }

    #[test]
    fn matching_records_gain_flags_and_others_stay_identical() {
        let temp = TempDir::new().unwrap();
        let out = archive(&temp, &["icon1.ico", "icon2.ico", "run.lnk", "readme.txt"]);
        let before = read_central_directory(&fs::read(&out).unwrap()).unwrap();

        let patched = apply_rules(&out, &hide("icon?.*")).unwrap();
        assert_eq!(patched, 2);

        let after = read_central_directory(&fs::read(&out).unwrap()).unwrap();
        for (old, new) in before.iter().zip(after.iter()) {
            if old.name.starts_with("icon") {
                assert_eq!(new.dos_attributes() & DOS_HIDDEN, DOS_HIDDEN);
                assert_eq!(new.dos_attributes() & !DOS_HIDDEN, old.dos_attributes() & !DOS_HIDDEN);
                assert_eq!(new.host(), HOST_MSDOS);
            } else {
                assert_eq!(new, old);
            }
        }
    }

    #[test]
    fn untouched_bytes_outside_patched_records() {
        let temp = TempDir::new().unwrap();
        let out = archive(&temp, &["a.doc", "b.txt"]);
        let before = fs::read(&out).unwrap();

        apply_rules(
            &out,
            &[AttributeRule {
                patterns: parse_pattern_list("*.doc").unwrap(),
                set: Attributes {
                    hidden: false,
                    read_only: true,
                },
            }],
        )
        .unwrap();
        let after = fs::read(&out).unwrap();
        assert_eq!(before.len(), after.len());

        let record = read_central_directory(&after)
            .unwrap()
            .into_iter()
            .find(|r| r.name == "a.doc")
            .unwrap();
        let patched_range = [record.offset + 4..record.offset + 6, record.offset + 38..record.offset + 42];
        for (i, (x, y)) in before.iter().zip(after.iter()).enumerate() {
            if !patched_range.iter().any(|r| r.contains(&i)) {
                assert_eq!(x, y, "byte {i} changed");
            }
        }
        assert_eq!(record.dos_attributes() & DOS_READ_ONLY, DOS_READ_ONLY);
    }

    #[test]
    fn empty_rules_are_a_noop() {
        let temp = TempDir::new().unwrap();
        let out = archive(&temp, &["a.txt"]);
        let before = fs::read(&out).unwrap();
        assert_eq!(apply_rules(&out, &hide("")).unwrap(), 0);
        assert_eq!(apply_rules(&out, &[]).unwrap(), 0);
        assert_eq!(fs::read(&out).unwrap(), before);

        // Never opened: a missing archive is fine too.
        assert_eq!(apply_rules(&temp.path().join("missing.zip"), &[]).unwrap(), 0);
    }

    #[test]
    fn second_pass_changes_nothing() {
        let temp = TempDir::new().unwrap();
        let out = archive(&temp, &["evil.exe"]);
        assert_eq!(apply_rules(&out, &hide("evil.exe")).unwrap(), 1);
        let once = fs::read(&out).unwrap();
        assert_eq!(apply_rules(&out, &hide("evil.exe")).unwrap(), 0);
        assert_eq!(fs::read(&out).unwrap(), once);
    }

    #[test]
    fn garbage_is_rejected() {
        let err = read_central_directory(b"definitely not a zip archive").unwrap_err();
        assert!(matches!(err, PackError::Container { .. }));
    }
}
