//! kpf-repack - Repack Kindle Previewer KPF containers

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use serde::Serialize;

use kpf_repack::{Packer, RepackedBook, Repacker, Result};

#[derive(Parser)]
#[command(name = "kpf-repack")]
#[command(version, about = "Repack Kindle Previewer KPF containers", long_about = None)]
#[command(after_help = "EXAMPLES:
    kpf-repack book.kpf               List decoded fragments
    kpf-repack book.kpf book.json     Write fragment manifest
    kpf-repack -vv --keep --work-dir tmp book.kpf   Keep descrambled database")]
struct Cli {
    /// Input KPF container
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output manifest (JSON); lists fragments when omitted
    #[arg(value_name = "OUTPUT")]
    output: Option<PathBuf>,

    /// Directory for intermediate files (default: fresh temporary directory)
    #[arg(short, long, value_name = "DIR")]
    work_dir: Option<PathBuf>,

    /// Keep unpacked container and descrambled database
    #[arg(short, long, requires = "work_dir")]
    keep: bool,

    /// More logging (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    // Held until the run finishes; dropping it removes the directory
    let temp;
    let work_dir = match &cli.work_dir {
        Some(dir) => dir.as_path(),
        None => {
            temp = tempfile::tempdir()?;
            temp.path()
        }
    };

    let repacker = Repacker::new(log::logger()).keep_intermediate(cli.keep);
    match &cli.output {
        Some(output) => repacker.convert(&cli.input, output, work_dir, &ManifestPacker),
        None => {
            let book = repacker.read(&cli.input, work_dir)?;
            list(&book)?;
            Ok(())
        }
    }
}

fn list(book: &RepackedBook) -> io::Result<()> {
    let mut out = io::stdout().lock();
    writeln!(
        out,
        "Shared: {} v{} (max_id {})",
        book.shared.name, book.shared.version, book.shared.max_id
    )?;
    writeln!(out, "Local symbols: {}", book.symbols.len())?;
    writeln!(out, "Fragments: {}", book.fragments.len())?;
    for frag in &book.fragments {
        writeln!(out, "  {:<8} {:<40} {:>8}", frag.ftype().text, frag.fid().text, frag.data().len())?;
    }
    Ok(())
}

/// Writes the decoded fragment set as a JSON manifest.
struct ManifestPacker;

#[derive(Serialize)]
struct Manifest<'a> {
    shared: SharedTable<'a>,
    max_id: u64,
    symbols: &'a [String],
    fragments: Vec<FragmentEntry<'a>>,
}

#[derive(Serialize)]
struct SharedTable<'a> {
    name: &'a str,
    version: i64,
    max_id: u64,
}

#[derive(Serialize)]
struct FragmentEntry<'a> {
    #[serde(rename = "type")]
    ftype: &'a str,
    id: &'a str,
    sid: Option<u64>,
    version: i32,
    compression: i32,
    drm: i32,
    size: usize,
}

impl Packer for ManifestPacker {
    fn pack(&self, book: &RepackedBook, to: &Path) -> Result<()> {
        let manifest = Manifest {
            shared: SharedTable {
                name: &book.shared.name,
                version: book.shared.version,
                max_id: book.shared.max_id,
            },
            max_id: book.max_id(),
            symbols: book.symbols.symbols(),
            fragments: book
                .fragments
                .iter()
                .map(|frag| FragmentEntry {
                    ftype: &frag.ftype().text,
                    id: &frag.fid().text,
                    sid: frag.fid().sid,
                    version: frag.version(),
                    compression: frag.compression(),
                    drm: frag.drm(),
                    size: frag.data().len(),
                })
                .collect(),
        };

        let mut out = BufWriter::new(File::create(to)?);
        serde_json::to_writer_pretty(&mut out, &manifest).map_err(io::Error::from)?;
        out.flush()?;
        Ok(())
    }
}
