use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use repackager::artifact::disk::WindowsHost;
use repackager::config::{self, Config};
use repackager::entry::ContainerEntry;
use repackager::pattern::parse_pattern_list;
use repackager::pipeline::{list_container, package_with};
use repackager::spec::{parse_drive_letter, ContainerSpec, FormatKind, VhdOptions};
use repackager::PackagingResult;

#[derive(Parser, Debug)]
#[command(name = "repackager")]
#[command(author, version, about = "Package files and directories into ZIP, 7z, ISO, CAB, PDF and VHD containers", long_about = None)]
struct Cli {
    /// Input file or directory (the container to inspect with --list)
    infile: PathBuf,

    /// Output container; the format follows its extension unless --out-format is given
    #[arg(required_unless_present = "list")]
    outfile: Option<PathBuf>,

    /// Existing container to add the input to
    #[arg(short = 'i', long)]
    backdoor: Option<PathBuf>,

    /// Name of the entry inside the container (single file input only)
    #[arg(short = 'n', long)]
    filename: Option<String>,

    /// Password for formats that support one (zip, 7z, pdf)
    #[arg(short, long)]
    password: Option<String>,

    /// Output format: zip, 7z, iso, img, cab, pdf, vhd, vhdx
    #[arg(long = "out-format")]
    out_format: Option<String>,

    /// Comma separated wildcard patterns of entries to hide (zip, iso)
    #[arg(short = 'H', long)]
    hide: Option<String>,

    /// Do not mark Office documents and hidden entries read-only in ZIP archives
    #[arg(long = "zip-noreadonly")]
    zip_noreadonly: bool,

    /// Size of a new virtual disk in megabytes
    #[arg(long = "vhd-size")]
    vhd_size: Option<u64>,

    /// Drive letter to mount the virtual disk on (random free letter otherwise)
    #[arg(long = "vhd-letter")]
    vhd_letter: Option<String>,

    /// Filesystem of a new virtual disk: fat, fat32, ntfs
    #[arg(long = "vhd-filesystem")]
    vhd_filesystem: Option<String>,

    /// Config file (default: <config dir>/repackager/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// List the entries of the container given as input and exit
    #[arg(long)]
    list: bool,

    /// Print the result as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Debug output
    #[arg(short, long)]
    debug: bool,
}

#[derive(Serialize)]
struct ListedEntry<'a> {
    path: &'a str,
    is_dir: bool,
    size: u64,
    hidden: bool,
}

fn init_tracing(cli: &Cli) {
    let default = if cli.debug {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = config::load(cli.config.as_deref())?;
    if cli.list {
        return list(&cli, &config);
    }

    let spec = build_spec(&cli, &config)?;
    let result = package_with(config.context_settings(), &spec, Arc::new(WindowsHost));
    report(&cli, &result)?;

    if let Some(failure) = &result.failure {
        bail!("packaging failed: {}", failure.message);
    }
    if !result.success {
        bail!("packaging failed: no artifact at {}", result.artifact.display());
    }
    Ok(())
}

fn format_for(explicit: Option<&str>, path: &Path) -> Result<FormatKind> {
    let kind = match explicit {
        Some(name) => name.parse()?,
        None => FormatKind::from_path(path)
            .with_context(|| format!("cannot infer the format of '{}'; use --out-format", path.display()))?,
    };
    Ok(kind)
}

fn build_spec(cli: &Cli, config: &Config) -> Result<ContainerSpec> {
    let Some(outfile) = &cli.outfile else {
        bail!("an output file is required");
    };
    let kind = format_for(cli.out_format.as_deref(), outfile)?;

    let vhd = VhdOptions {
        size_mb: cli.vhd_size.unwrap_or(config.vhd_size_mb),
        letter: cli.vhd_letter.as_deref().map(parse_drive_letter).transpose()?,
        filesystem: match &cli.vhd_filesystem {
            Some(raw) => raw.parse()?,
            None => config.vhd_filesystem,
        },
    };
    if vhd.size_mb == 0 {
        bail!("--vhd-size must be greater than zero");
    }

    let mut spec = ContainerSpec::new(kind, &cli.infile, outfile)
        .with_vhd(vhd)
        .with_read_only_bypass(config.read_only_bypass && !cli.zip_noreadonly);
    if let Some(backdoor) = &cli.backdoor {
        spec = spec.with_backdoor(backdoor);
    }
    if let Some(name) = &cli.filename {
        spec = spec.with_rename(name);
    }
    if let Some(password) = &cli.password {
        spec = spec.with_password(password);
    }
    if let Some(raw) = &cli.hide {
        spec = spec.with_hide(parse_pattern_list(raw).context("parsing --hide patterns")?);
    }
    Ok(spec)
}

fn list(cli: &Cli, config: &Config) -> Result<()> {
    let kind = format_for(cli.out_format.as_deref(), &cli.infile)?;
    let entries = list_container(config.context_settings(), kind, &cli.infile)
        .with_context(|| format!("listing '{}'", cli.infile.display()))?;

    let listed: Vec<ListedEntry> = entries.iter().map(listed_entry).collect();
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&listed)?);
        return Ok(());
    }
    for entry in &listed {
        let flag = if entry.hidden { 'H' } else { ' ' };
        if entry.is_dir {
            println!("{flag} {:>12}  {}/", "-", entry.path);
        } else {
            println!("{flag} {:>12}  {}", entry.size, entry.path);
        }
    }
    println!("{} entries", listed.len());
    Ok(())
}

fn listed_entry(entry: &ContainerEntry) -> ListedEntry<'_> {
    ListedEntry {
        path: &entry.path,
        is_dir: entry.is_dir,
        size: entry.source.size().unwrap_or(0),
        hidden: entry.attributes.hidden,
    }
}

fn report(cli: &Cli, result: &PackagingResult) -> Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    if !result.success {
        return Ok(());
    }

    println!("Created {}", result.artifact.display());
    if let (Some(sha), Some(size)) = (&result.sha256, result.size) {
        println!("  sha256 {sha}");
        println!("  size   {size} bytes");
    }
    for degradation in &result.degradations {
        println!("  note   {degradation:?}");
    }
    Ok(())
}
