//! PDF adapter.
//!
//! Every input file becomes an embedded attachment (flat, unique names) and
//! gets a document-level script that asks the viewer to open it. A fresh
//! document has one blank 200x200 page; a merge keeps every page of the
//! existing document and extends its name trees.
//!
//! The password stage encrypts the finished document with `qpdf`. Viewers do
//! not run document scripts in encrypted files, so the result is recorded as
//! [`Degradation::AutoLaunchDisabledByEncryption`].

use std::fs;
use std::path::{Path, PathBuf};

use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};

use super::filesystem::atomic_move;
use super::{Capabilities, FormatAdapter, MergeStyle, PasswordSupport};
use crate::context::{Degradation, PackContext};
use crate::entry::{ContainerEntry, ContentSource, Namespace};
use crate::error::{IoResultExt, PackError, Result};
use crate::preflight::{check_required_tools, PDF_PASSWORD_TOOLS};
use crate::process::Cmd;
use crate::spec::{ContainerSpec, FormatKind, Mode};

/// Side of the placeholder page of a fresh document, in points.
pub const PLACEHOLDER_PAGE_SIZE: i64 = 200;

/// Name trees deeper than this are rejected.
const MAX_TREE_DEPTH: usize = 32;

/// qpdf exit code for "succeeded with warnings".
const QPDF_WARNINGS: i32 = 3;

/// Extensions Acrobat Reader refuses to open from an attachment by default.
pub const ACROBAT_BLOCKED_EXTENSIONS: &[&str] = &[
    "acm", "ad", "ade", "adp", "air", "app", "application", "appref-ms", "arc", "arj", "asa", "asp",
    "aspx", "asx", "ax", "bas", "bat", "bz", "bz2", "cab", "cer", "cfg", "chi", "chm", "class",
    "clb", "cmd", "cnt", "cnv", "com", "command", "cpl", "cpx", "crt", "crx", "csh", "der",
    "desklink", "desktop", "dll", "drv", "exe", "fdf", "fon", "fxp", "gadget", "glk", "grp", "gz",
    "hex", "hlp", "hqx", "hta", "htt", "ime", "inf", "ini", "ins", "isp", "its", "jar", "jnlp",
    "job", "js", "jse", "ksh", "library-ms", "lnk", "local", "lzh", "mad", "maf", "mag", "mam",
    "manifest", "mapimail", "maq", "mar", "mas", "mat", "mau", "mav", "maw", "mda", "mdb", "mde",
    "mdt", "mdw", "mdz", "mmc", "mof", "msc", "msh", "msh1", "msh1xml", "msh2", "msh2xml",
    "mshxml", "msi", "msp", "mst", "mui", "mydocs", "nls", "ocx", "ops", "pcd", "pdf", "perl",
    "pi", "pif", "pkg", "pl", "plg", "prf", "prg", "ps1", "ps1xml", "ps2", "ps2xml", "psc1",
    "psc2", "pst", "py", "pyc", "pyd", "pyo", "rar", "rb", "reg", "scf", "scr", "sct", "sea",
    "search-ms", "searchconnector-ms", "shb", "shs", "sit", "sys", "tar", "taz", "term", "tgz",
    "tlb", "tmp", "tool", "tsp", "url", "vb", "vbe", "vbs", "vsmacros", "vss", "vst", "vsw", "vxd",
    "webloc", "website", "ws", "wsc", "wsf", "wsh", "xbap", "xnk", "xpi", "z", "zfsendtotarget",
    "zip", "zlo", "zoo", "docm", "xlsm", "xlam", "xltm", "dotm", "ppam", "pptm", "ppsm", "potm",
];

fn pdf_err(err: lopdf::Error) -> PackError {
    PackError::container("pdf", err)
}

/// Script that asks the viewer to launch the attachment `name`.
pub fn launch_script(name: &str) -> String {
    format!(
        "this.exportDataObject({{ cName: \"{}\", nLaunch: 2 }});",
        name.replace('\\', "\\\\").replace('"', "\\\"")
    )
}

/// Whether Acrobat will refuse to open an attachment with this name.
pub fn is_blocked_by_acrobat(name: &str) -> bool {
    match name.rsplit_once('.') {
        Some((_, ext)) => {
            let ext = ext.to_ascii_lowercase();
            ACROBAT_BLOCKED_EXTENSIONS.contains(&ext.as_str())
        }
        None => false,
    }
}

/// Text of a PDF string object: UTF-16BE with a byte order mark, else bytes.
fn decode_text(bytes: &[u8]) -> String {
    match bytes {
        [0xfe, 0xff, rest @ ..] => {
            let units: Vec<u16> = rest
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

type NameTree = Vec<(String, Object)>;

/// Leaf entries of a name tree, following `Kids`.
fn read_name_tree(doc: &Document, node: &Object, depth: usize) -> Result<NameTree> {
    if depth > MAX_TREE_DEPTH {
        return Err(PackError::container("pdf", "name tree nested too deeply"));
    }
    let (_, node) = doc.dereference(node).map_err(pdf_err)?;
    let node = node.as_dict().map_err(pdf_err)?;

    let mut leaves = Vec::new();
    if let Ok(names) = node.get(b"Names").and_then(|n| doc.dereference(n)) {
        let names = names.1.as_array().map_err(pdf_err)?;
        for pair in names.chunks_exact(2) {
            let key = match doc.dereference(&pair[0]).map_err(pdf_err)?.1 {
                Object::String(bytes, _) => decode_text(bytes),
                other => {
                    return Err(PackError::container(
                        "pdf",
                        format!("name tree key is not a string: {other:?}"),
                    ))
                }
            };
            leaves.push((key, pair[1].clone()));
        }
    }
    if let Ok(kids) = node.get(b"Kids").and_then(|k| doc.dereference(k)) {
        for kid in kids.1.as_array().map_err(pdf_err)? {
            leaves.extend(read_name_tree(doc, kid, depth + 1)?);
        }
    }
    Ok(leaves)
}

/// Flat name tree node holding `leaves` in key order.
fn name_tree_node(mut leaves: NameTree) -> Dictionary {
    leaves.sort_by(|a, b| a.0.cmp(&b.0));
    let names: Vec<Object> = leaves
        .into_iter()
        .flat_map(|(key, value)| [Object::string_literal(key), value])
        .collect();
    dictionary! { "Names" => names }
}

fn catalog_id(doc: &Document) -> Result<ObjectId> {
    doc.trailer
        .get(b"Root")
        .and_then(Object::as_reference)
        .map_err(pdf_err)
}

/// The catalog's `Names` dictionary, or an empty one.
fn names_dictionary(doc: &Document) -> Result<Dictionary> {
    let catalog = doc
        .get_object(catalog_id(doc)?)
        .and_then(Object::as_dict)
        .map_err(pdf_err)?;
    match catalog.get(b"Names") {
        Ok(names) => Ok(doc
            .dereference(names)
            .and_then(|(_, obj)| obj.as_dict())
            .map_err(pdf_err)?
            .clone()),
        Err(_) => Ok(Dictionary::new()),
    }
}

fn name_tree(doc: &Document, names: &Dictionary, key: &[u8]) -> Result<NameTree> {
    match names.get(key) {
        Ok(root) => read_name_tree(doc, root, 0),
        Err(_) => Ok(Vec::new()),
    }
}

/// Document with a single blank page.
fn blank_document() -> Document {
    let mut doc = Document::with_version("1.7");
    let pages_id = doc.new_object_id();
    let content_id = doc.add_object(Stream::new(dictionary! {}, Vec::new()));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "MediaBox" => vec![0.into(), 0.into(), PLACEHOLDER_PAGE_SIZE.into(), PLACEHOLDER_PAGE_SIZE.into()],
        "Resources" => dictionary! {},
        "Contents" => content_id,
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PdfAdapter;

impl PdfAdapter {
    /// Embed `entries` as attachments with launch scripts.
    fn attach(ctx: &mut PackContext, doc: &mut Document, entries: &[ContainerEntry]) -> Result<()> {
        let mut names = names_dictionary(doc)?;
        let mut files = name_tree(doc, &names, b"EmbeddedFiles")?;
        let mut scripts = name_tree(doc, &names, b"JavaScript")?;

        for entry in entries.iter().filter(|e| !e.is_dir) {
            let name = entry.basename().to_string();
            if let Some((existing, _)) = files.iter().find(|(n, _)| n.eq_ignore_ascii_case(&name)) {
                return Err(PackError::ConflictingEntryName {
                    name: name.clone(),
                    first: format!("{existing} (existing attachment)"),
                    second: entry.path.clone(),
                });
            }
            if is_blocked_by_acrobat(&name) {
                ctx.warn(format!(
                    "Acrobat Reader blocks opening attachments like '{name}' by default; \
                     prefer an extension such as .doc or .xls"
                ));
            }

            let data = entry.source.read_all()?;
            let size = data.len() as i64;
            let stream_id = doc.add_object(Stream::new(
                dictionary! {
                    "Type" => "EmbeddedFile",
                    "Params" => dictionary! { "Size" => size },
                },
                data,
            ));
            let filespec_id = doc.add_object(dictionary! {
                "Type" => "Filespec",
                "F" => Object::string_literal(name.as_str()),
                "UF" => Object::string_literal(name.as_str()),
                "EF" => dictionary! { "F" => stream_id },
            });
            files.push((name.clone(), filespec_id.into()));

            let script = launch_script(&name);
            tracing::debug!("pdf launch script: {}", script);
            let action_id = doc.add_object(dictionary! {
                "Type" => "Action",
                "S" => "JavaScript",
                "JS" => Object::string_literal(script),
            });
            scripts.retain(|(key, _)| key != &name);
            scripts.push((name.clone(), action_id.into()));

            ctx.info(format!("embedded '{name}' ({size} bytes) with launch script"));
        }

        let files_id = doc.add_object(name_tree_node(files));
        let scripts_id = doc.add_object(name_tree_node(scripts));
        names.set("EmbeddedFiles", files_id);
        names.set("JavaScript", scripts_id);

        let root = catalog_id(doc)?;
        doc.get_object_mut(root)
            .and_then(Object::as_dict_mut)
            .map_err(pdf_err)?
            .set("Names", names);
        Ok(())
    }

    fn load(existing: &Path) -> Result<Document> {
        let doc = Document::load(existing).map_err(pdf_err)?;
        if doc.is_encrypted() {
            return Err(PackError::unsupported(format!(
                "'{}' is encrypted and cannot be extended",
                existing.display()
            )));
        }
        Ok(doc)
    }

    fn save(doc: &mut Document, output: &Path) -> Result<()> {
        doc.save(output)
            .map_err(|e| PackError::container("pdf", format!("writing {}: {e}", output.display())))?;
        Ok(())
    }
}

impl FormatAdapter for PdfAdapter {
    fn kind(&self) -> FormatKind {
        FormatKind::Pdf
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            merge: MergeStyle::Append,
            password: PasswordSupport::PostProcess,
            hide: false,
            listable: true,
        }
    }

    fn namespace(&self, _mode: Mode) -> Namespace {
        Namespace::Flat
    }

    fn build(
        &self,
        ctx: &mut PackContext,
        _spec: &ContainerSpec,
        entries: &[ContainerEntry],
        output: &Path,
    ) -> Result<()> {
        ctx.info("creating a PDF with a single blank page");
        let mut doc = blank_document();
        Self::attach(ctx, &mut doc, entries)?;
        Self::save(&mut doc, output)
    }

    fn merge(
        &self,
        ctx: &mut PackContext,
        _spec: &ContainerSpec,
        existing: &Path,
        entries: &[ContainerEntry],
        output: &Path,
    ) -> Result<()> {
        let mut doc = Self::load(existing)?;
        tracing::debug!(
            "pdf merge: keeping {} pages of {}",
            doc.get_pages().len(),
            existing.display()
        );
        Self::attach(ctx, &mut doc, entries)?;
        Self::save(&mut doc, output)
    }

    fn list(&self, _ctx: &mut PackContext, container: &Path) -> Result<Vec<ContainerEntry>> {
        let doc = Self::load(container)?;
        let names = names_dictionary(&doc)?;
        let mut entries = Vec::new();
        for (name, filespec) in name_tree(&doc, &names, b"EmbeddedFiles")? {
            let size = doc
                .dereference(&filespec)
                .and_then(|(_, spec)| spec.as_dict())
                .and_then(|spec| spec.get(b"EF"))
                .and_then(|ef| doc.dereference(ef))
                .and_then(|(_, ef)| ef.as_dict())
                .and_then(|ef| ef.get(b"F"))
                .and_then(|stream| doc.dereference(stream))
                .and_then(|(_, stream)| stream.as_stream())
                .map(|stream| stream.content.len() as u64)
                .unwrap_or(0);
            entries.push(ContainerEntry::file(name, ContentSource::Stored { size }));
        }
        Ok(entries)
    }

    fn apply_password(&self, ctx: &mut PackContext, artifact: &Path, password: &str) -> Result<()> {
        check_required_tools(PDF_PASSWORD_TOOLS)?;
        ctx.info("encrypting PDF with AES-256");

        let scratch = ctx.scratch_dir("pdf-password")?;
        let staged = scratch.path().join("encrypted.pdf");
        let args = write_encrypt_args(scratch.path(), password)?;
        let mut at_args = std::ffi::OsString::from("@");
        at_args.push(args.as_os_str());
        let result = Cmd::new("qpdf")
            .arg(at_args)
            .arg_path(artifact)
            .arg_path(&staged)
            .timeout(ctx.tool_timeout())
            .allow_fail()
            .run()?;

        let code = result.status.and_then(|s| s.code());
        if !result.success() && code != Some(QPDF_WARNINGS) {
            return Err(PackError::ExternalToolFailure {
                tool: "qpdf".to_string(),
                message: match code {
                    Some(code) => format!("encryption failed (exit code {code})"),
                    None => "encryption timed out".to_string(),
                },
                output: result.combined(),
            });
        }
        atomic_move(&staged, artifact)?;

        ctx.warn("encrypted PDFs do not run document scripts: the attachment will not auto-launch");
        ctx.degrade(Degradation::AutoLaunchDisabledByEncryption);
        Ok(())
    }
}

/// qpdf `@file` arguments for AES-256 encryption, so the password never
/// shows up on a command line. One argument per line.
fn write_encrypt_args(dir: &Path, password: &str) -> Result<PathBuf> {
    if password.contains(['\n', '\r']) {
        return Err(PackError::unsupported(
            "PDF passwords cannot contain line breaks",
        ));
    }
    let path = dir.join("qpdf-encrypt.args");
    let body = format!("--encrypt\n{password}\n{password}\n256\n--\n");
    fs::write(&path, body).at(&path)?;
    Ok(path)
}
