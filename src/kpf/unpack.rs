//! KPF container extraction.

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek};
use std::path::Path;

use zip::ZipArchive;

use crate::error::{Error, Result};

/// Extract every entry of the KPF container at `kpf` into `dir`.
///
/// Returns the number of files written. Entries whose names would land
/// outside `dir` abort extraction.
pub fn unpack_kpf(kpf: &Path, dir: &Path) -> Result<usize> {
    let file = File::open(kpf)?;
    extract(BufReader::new(file), dir)
}

fn extract<R: Read + Seek>(reader: R, dir: &Path) -> Result<usize> {
    let mut archive = ZipArchive::new(reader)?;
    fs::create_dir_all(dir)?;

    let mut written = 0;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(name) = entry.enclosed_name() else {
            return Err(Error::UnsafeEntry(entry.name().to_string()));
        };
        let target = dir.join(name);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        written += 1;
    }
    Ok(written)
}
