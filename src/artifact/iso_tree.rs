//! ISO 9660 reader with Joliet support.
//!
//! Reads the volume descriptors, walks the Joliet directory tree (falling
//! back to the primary tree) and exposes each directory record's location so
//! the hide stage can flip its flag byte in place.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{IoResultExt, PackError, Result};

pub const SECTOR_SIZE: u64 = 2048;

/// First volume descriptor sector.
const DESCRIPTOR_START: u64 = 16;
const DESCRIPTOR_LIMIT: u64 = 64;
const MAGIC: &[u8; 5] = b"CD001";

const TYPE_PRIMARY: u8 = 1;
const TYPE_SUPPLEMENTARY: u8 = 2;
const TYPE_TERMINATOR: u8 = 255;

const JOLIET_ESCAPES: [&[u8; 3]; 3] = [b"%/@", b"%/C", b"%/E"];

const RECORD_MIN_LEN: usize = 34;
/// Offset of the flag byte inside a directory record.
pub const FLAGS_OFFSET: u64 = 25;

pub const FLAG_HIDDEN: u8 = 0x01;
pub const FLAG_DIRECTORY: u8 = 0x02;
const FLAG_MULTI_EXTENT: u8 = 0x80;

const MAX_DEPTH: usize = 32;

fn malformed(message: impl Into<String>) -> PackError {
    PackError::container("iso", message.into())
}

/// Which directory hierarchy to walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tree {
    Primary,
    Joliet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DirRef {
    extent: u32,
    length: u32,
}

/// One directory record found while walking a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoRecord {
    /// `/` separated path from the root, without version suffix.
    pub path: String,
    pub extent: u32,
    pub size: u32,
    pub flags: u8,
    /// Absolute byte offset of the record in the image.
    pub record_offset: u64,
}

impl IsoRecord {
    pub fn is_dir(&self) -> bool {
        self.flags & FLAG_DIRECTORY != 0
    }

    pub fn is_hidden(&self) -> bool {
        self.flags & FLAG_HIDDEN != 0
    }
}

/// An open ISO 9660 image.
#[derive(Debug)]
pub struct IsoImage {
    file: File,
    path: PathBuf,
    volume_id: String,
    primary_root: DirRef,
    joliet_root: Option<DirRef>,
}

impl IsoImage {
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_file(File::open(path).at(path)?, path)
    }

    /// Open for in-place flag patching.
    pub fn open_rw(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path).at(path)?;
        Self::from_file(file, path)
    }

    fn from_file(file: File, path: &Path) -> Result<Self> {
        let mut image = Self {
            file,
            path: path.to_path_buf(),
            volume_id: String::new(),
            primary_root: DirRef { extent: 0, length: 0 },
            joliet_root: None,
        };

        let mut primary = None;
        for sector in DESCRIPTOR_START..DESCRIPTOR_LIMIT {
            let descriptor = image.read_at(sector * SECTOR_SIZE, SECTOR_SIZE as usize)?;
            if &descriptor[1..6] != MAGIC {
                return Err(malformed(format!("no ISO 9660 volume descriptor at sector {sector}")));
            }
            match descriptor[0] {
                TYPE_PRIMARY if primary.is_none() => {
                    image.volume_id = String::from_utf8_lossy(&descriptor[40..72])
                        .trim_end()
                        .to_string();
                    primary = Some(root_ref(&descriptor)?);
                }
                TYPE_SUPPLEMENTARY if image.joliet_root.is_none() => {
                    if JOLIET_ESCAPES.iter().any(|esc| &descriptor[88..91] == *esc) {
                        image.joliet_root = Some(root_ref(&descriptor)?);
                    }
                }
                TYPE_TERMINATOR => break,
                _ => {}
            }
        }

        image.primary_root = primary.ok_or_else(|| malformed("primary volume descriptor missing"))?;
        Ok(image)
    }

    pub fn volume_id(&self) -> &str {
        &self.volume_id
    }

    pub fn has_joliet(&self) -> bool {
        self.joliet_root.is_some()
    }

    /// Joliet when present, otherwise the primary tree.
    pub fn preferred_tree(&self) -> Tree {
        if self.has_joliet() {
            Tree::Joliet
        } else {
            Tree::Primary
        }
    }

    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset)).at(&self.path)?;
        self.file.read_exact(&mut buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                malformed(format!("image truncated at offset {offset}"))
            } else {
                PackError::io(&self.path, e)
            }
        })?;
        Ok(buf)
    }

    /// Every record below the root of `tree`, parents before children.
    pub fn walk(&mut self, tree: Tree) -> Result<Vec<IsoRecord>> {
        let root = match tree {
            Tree::Primary => self.primary_root,
            Tree::Joliet => self
                .joliet_root
                .ok_or_else(|| malformed("image has no Joliet tree"))?,
        };

        let mut records = Vec::new();
        let mut visited = HashSet::new();
        self.walk_dir(tree, root, "", 0, &mut visited, &mut records)?;
        Ok(records)
    }

    fn walk_dir(
        &mut self,
        tree: Tree,
        dir: DirRef,
        prefix: &str,
        depth: usize,
        visited: &mut HashSet<u32>,
        out: &mut Vec<IsoRecord>,
    ) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(malformed("directory tree too deep"));
        }
        if !visited.insert(dir.extent) {
            return Err(malformed(format!("directory loop at extent {}", dir.extent)));
        }

        let base = u64::from(dir.extent) * SECTOR_SIZE;
        let data = self.read_at(base, dir.length as usize)?;
        let mut offset = 0usize;

        while offset < data.len() {
            let len = data[offset] as usize;
            if len == 0 {
                // Records never span sectors; the rest of this one is padding.
                offset = (offset / SECTOR_SIZE as usize + 1) * SECTOR_SIZE as usize;
                continue;
            }
            let raw = data
                .get(offset..offset + len)
                .filter(|raw| raw.len() >= RECORD_MIN_LEN)
                .ok_or_else(|| malformed(format!("bad directory record at offset {}", base + offset as u64)))?;
            let record_offset = base + offset as u64;
            offset += len;

            let id_len = raw[32] as usize;
            let id = raw
                .get(33..33 + id_len)
                .ok_or_else(|| malformed("directory record identifier overflows record"))?;
            if id == [0] || id == [1] {
                continue;
            }

            let flags = raw[25];
            if flags & FLAG_MULTI_EXTENT != 0 {
                return Err(PackError::unsupported(
                    "ISO images with multi-extent files cannot be rebuilt",
                ));
            }

            let name = decode_name(id, tree);
            let path = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            let record = IsoRecord {
                path,
                extent: le_u32(&raw[2..6]),
                size: le_u32(&raw[10..14]),
                flags,
                record_offset,
            };

            let child = record.is_dir().then(|| DirRef {
                extent: record.extent,
                length: record.size,
            });
            let child_prefix = record.path.clone();
            out.push(record);
            if let Some(child) = child {
                self.walk_dir(tree, child, &child_prefix, depth + 1, visited, out)?;
            }
        }

        Ok(())
    }

    /// Stream a file record's content into `writer`.
    pub fn copy_extent<W: Write>(&mut self, record: &IsoRecord, writer: &mut W) -> Result<u64> {
        self.file
            .seek(SeekFrom::Start(u64::from(record.extent) * SECTOR_SIZE))
            .at(&self.path)?;
        let copied = io::copy(&mut (&mut self.file).take(u64::from(record.size)), writer)
            .at(&self.path)?;
        if copied != u64::from(record.size) {
            return Err(malformed(format!("'{}' extends past the end of the image", record.path)));
        }
        Ok(copied)
    }

    pub fn read_extent(&mut self, record: &IsoRecord) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(record.size as usize);
        self.copy_extent(record, &mut buf)?;
        Ok(buf)
    }

    /// Overwrite the flag byte of the record at `record_offset`.
    pub fn write_flags(&mut self, record_offset: u64, flags: u8) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(record_offset + FLAGS_OFFSET))
            .at(&self.path)?;
        self.file.write_all(&[flags]).at(&self.path)
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn root_ref(descriptor: &[u8]) -> Result<DirRef> {
    let root = &descriptor[156..156 + RECORD_MIN_LEN];
    if root[0] as usize != RECORD_MIN_LEN {
        return Err(malformed("bad root directory record"));
    }
    Ok(DirRef {
        extent: le_u32(&root[2..6]),
        length: le_u32(&root[10..14]),
    })
}

/// Decode an identifier and drop the `;1` version suffix.
fn decode_name(id: &[u8], tree: Tree) -> String {
    let name = match tree {
        Tree::Joliet => {
            let units: Vec<u16> = id
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        Tree::Primary => String::from_utf8_lossy(id).into_owned(),
    };
    let name = match name.split_once(';') {
        Some((base, _)) => base.to_string(),
        None => name,
    };
    match tree {
        // "README." is how level 1 spells an extensionless name
        Tree::Primary => name.trim_end_matches('.').to_string(),
        Tree::Joliet => name,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    fn both_endian32(value: u32) -> Vec<u8> {
        let mut out = value.to_le_bytes().to_vec();
        out.extend_from_slice(&value.to_be_bytes());
        out
    }

    fn record(extent: u32, size: u32, flags: u8, id: &[u8]) -> Vec<u8> {
        let pad = usize::from(id.len() % 2 == 0);
        let len = 33 + id.len() + pad;
        let mut out = vec![len as u8, 0];
        out.extend(both_endian32(extent));
        out.extend(both_endian32(size));
        out.extend([0u8; 7]);
        out.extend([flags, 0, 0, 1, 0, 0, 1, id.len() as u8]);
        out.extend_from_slice(id);
        out.extend(std::iter::repeat(0).take(pad));
        out
    }

    fn descriptor(kind: u8, root_extent: u32, joliet: bool) -> Vec<u8> {
        let mut sector = vec![0u8; SECTOR_SIZE as usize];
        sector[0] = kind;
        sector[1..6].copy_from_slice(MAGIC);
        sector[6] = 1;
        let label = b"TESTVOL";
        sector[40..72].fill(b' ');
        sector[40..40 + label.len()].copy_from_slice(label);
        if joliet {
            sector[88..91].copy_from_slice(b"%/E");
        }
        let root = record(root_extent, SECTOR_SIZE as u32, FLAG_DIRECTORY, &[0]);
        sector[156..156 + root.len()].copy_from_slice(&root);
        sector
    }

    fn dir_sector(extent: u32, files: &[(Vec<u8>, u32, u32)]) -> Vec<u8> {
        let mut sector = Vec::new();
        sector.extend(record(extent, SECTOR_SIZE as u32, FLAG_DIRECTORY, &[0]));
        sector.extend(record(extent, SECTOR_SIZE as u32, FLAG_DIRECTORY, &[1]));
        for (id, file_extent, size) in files {
            sector.extend(record(*file_extent, *size, 0, id));
        }
        sector.resize(SECTOR_SIZE as usize, 0);
        sector
    }

    /// Minimal image with a flat root in both the primary and Joliet trees.
    pub(crate) fn tiny_iso(files: &[(&str, &[u8])]) -> Vec<u8> {
        let primary_root = 19;
        let joliet_root = 20;
        let first_data = 21;

        let mut image = vec![0u8; (16 * SECTOR_SIZE) as usize];
        image.extend(descriptor(TYPE_PRIMARY, primary_root, false));
        image.extend(descriptor(TYPE_SUPPLEMENTARY, joliet_root, true));
        image.extend(descriptor(TYPE_TERMINATOR, 0, false));

        let mut primary = Vec::new();
        let mut joliet = Vec::new();
        for (i, (name, body)) in files.iter().enumerate() {
            let extent = first_data + i as u32;
            primary.push((format!("{};1", name.to_uppercase()).into_bytes(), extent, body.len() as u32));
            let ucs2: Vec<u8> = name.encode_utf16().flat_map(|u| u.to_be_bytes()).collect();
            joliet.push((ucs2, extent, body.len() as u32));
        }
        image.extend(dir_sector(primary_root, &primary));
        image.extend(dir_sector(joliet_root, &joliet));

        for (_, body) in files {
            let mut sector = body.to_vec();
            sector.resize(SECTOR_SIZE as usize, 0);
            image.extend(sector);
        }
        image
    }

    fn write_tiny(temp: &TempDir) -> PathBuf {
        let path = temp.path().join("tiny.iso");
        std::fs::write(&path, tiny_iso(&[("readme.txt", b"hello"), ("Payload.exe", b"MZ\x90")])).unwrap();
        path
    }

    #[test]
    fn joliet_tree_is_preferred() {
        let temp = TempDir::new().unwrap();
        let mut image = IsoImage::open(&write_tiny(&temp)).unwrap();
        assert_eq!(image.volume_id(), "TESTVOL");
        assert_eq!(image.preferred_tree(), Tree::Joliet);

        let records = image.walk(Tree::Joliet).unwrap();
        let names: Vec<&str> = records.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(names, vec!["readme.txt", "Payload.exe"]);
        assert_eq!(image.read_extent(&records[1]).unwrap(), b"MZ\x90");
    }

    #[test]
    fn primary_names_drop_version() {
        let temp = TempDir::new().unwrap();
        let mut image = IsoImage::open(&write_tiny(&temp)).unwrap();
        let records = image.walk(Tree::Primary).unwrap();
        assert_eq!(records[0].path, "README.TXT");
        assert_eq!(records[0].extent, image.walk(Tree::Joliet).unwrap()[0].extent);
    }

    #[test]
    fn flag_byte_round_trips() {
        let temp = TempDir::new().unwrap();
        let path = write_tiny(&temp);
        let mut image = IsoImage::open_rw(&path).unwrap();
        let record = image.walk(Tree::Joliet).unwrap().remove(0);
        image.write_flags(record.record_offset, record.flags | FLAG_HIDDEN).unwrap();

        let mut reopened = IsoImage::open(&path).unwrap();
        assert!(reopened.walk(Tree::Joliet).unwrap()[0].is_hidden());
    }

    #[test]
    fn rejects_non_iso() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("not.iso");
        std::fs::write(&path, vec![0u8; 40 * SECTOR_SIZE as usize]).unwrap();
        assert!(matches!(IsoImage::open(&path).unwrap_err(), PackError::Container { .. }));
    }

    #[test]
    fn decode_handles_both_trees() {
        assert_eq!(decode_name(b"FILE.;1", Tree::Primary), "FILE");
        let joliet: Vec<u8> = "naïve.txt;1".encode_utf16().flat_map(|u| u.to_be_bytes()).collect();
        assert_eq!(decode_name(&joliet, Tree::Joliet), "naïve.txt");
    }
}
