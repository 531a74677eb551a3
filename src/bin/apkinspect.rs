//! Command line front end: decode manifests and audit APK structure.

use anyhow::{bail, Context, Result};
use apkinspect::android::binary_xml::DEFAULT_LITE_ELEMENTS;
use apkinspect::android::{
    apk_tampering_check, get_manifest, get_manifest_lite, manifest_tampering_indicators,
    AuditConfig, ZipEntries,
};
use clap::{ArgAction, Parser};
use log::{info, LevelFilter};
use serde::Serialize;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "apkinspect")]
#[command(version)]
#[command(about = "Decode Android binary manifests and report APK tampering", long_about = None)]
#[command(after_help = "Examples:\n  \
  apkinspect app.apk                    print the decoded AndroidManifest.xml\n  \
  apkinspect app.apk --lite             leading manifest attributes as JSON\n  \
  apkinspect app.apk --analyze --strict archive and manifest tamper report\n  \
  apkinspect --axml AndroidManifest.xml decode a bare binary XML file")]
struct Cli {
    /// APK file to inspect
    #[arg(value_name = "APK", required_unless_present = "axml")]
    apk: Option<PathBuf>,

    /// Read a bare binary XML file instead of an APK
    #[arg(long, value_name = "FILE", conflicts_with = "apk")]
    axml: Option<PathBuf>,

    /// Print the reconstructed manifest (default)
    #[arg(long, group = "mode")]
    manifest: bool,

    /// Print the attributes of the leading elements as JSON
    #[arg(long, group = "mode")]
    lite: bool,

    /// Print the tamper report as JSON
    #[arg(long, group = "mode")]
    analyze: bool,

    /// Print the local file headers as JSON
    #[arg(long, group = "mode")]
    list_local: bool,

    /// Print the central directory records as JSON
    #[arg(long, group = "mode")]
    list_central: bool,

    /// Compare every header field and report duplicate end records
    #[arg(long)]
    strict: bool,

    /// Number of element chunks read by --lite
    #[arg(long, value_name = "N", default_value_t = DEFAULT_LITE_ELEMENTS)]
    elements: usize,

    /// -v info, -vv debug, -vvv trace
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Manifest,
    Lite,
    Analyze,
    ListLocal,
    ListCentral,
}

impl Cli {
    fn mode(&self) -> Mode {
        if self.manifest {
            Mode::Manifest
        } else if self.lite {
            Mode::Lite
        } else if self.analyze {
            Mode::Analyze
        } else if self.list_local {
            Mode::ListLocal
        } else if self.list_central {
            Mode::ListCentral
        } else {
            Mode::Manifest
        }
    }
}

fn init_logging(verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    TermLogger::init(level, Config::default(), TerminalMode::Stderr, ColorChoice::Auto)
        .context("failed to initialise logging")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Binary XML input: only the manifest oriented modes make sense.
fn run_axml(cli: &Cli, path: &Path, config: &AuditConfig) -> Result<()> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    info!("[cli] {} bytes of binary XML", data.len());

    match cli.mode() {
        Mode::ListLocal | Mode::ListCentral => {
            bail!("--list-local and --list-central need an APK")
        }
        Mode::Lite => print_json(&get_manifest_lite(&data, cli.elements)?),
        Mode::Analyze => print_json(&manifest_tampering_indicators(&data, config)?),
        Mode::Manifest => {
            println!("{}", get_manifest(&data)?);
            Ok(())
        }
    }
}

fn run_apk(cli: &Cli, path: &Path, config: &AuditConfig) -> Result<()> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    info!("[cli] {} bytes of archive", raw.len());

    let mode = cli.mode();
    if mode == Mode::Analyze {
        return print_json(&apk_tampering_check(&raw, config)?);
    }

    let entries = ZipEntries::parse(&raw)?;
    match mode {
        Mode::ListLocal => return print_json(&entries.local),
        Mode::ListCentral => return print_json(&entries.central),
        _ => {}
    }

    let manifest = entries
        .manifest_bytes(&raw)
        .context("failed to extract AndroidManifest.xml")?;
    if mode == Mode::Lite {
        print_json(&get_manifest_lite(&manifest, cli.elements)?)
    } else {
        println!("{}", get_manifest(&manifest)?);
        Ok(())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let config = AuditConfig::default().with_strict(cli.strict);
    match (&cli.axml, &cli.apk) {
        (Some(path), _) => run_axml(&cli, path, &config),
        (None, Some(path)) => run_apk(&cli, path, &config),
        (None, None) => bail!("an APK or --axml FILE is required"),
    }
}
