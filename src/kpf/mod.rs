//! KPF repacking pipeline.
//!
//! Kindle Previewer stores a converted book as a KPF container: a zip archive
//! holding, among other resources, the book itself as a scrambled SQLite
//! database at `resources/book.kdf`. Repacking runs these stages in order:
//!
//! 1. [`unpack`] the container into a scratch directory
//! 2. [`descramble`] the database into a plain SQLite file
//! 3. verify the table catalog ([`schema`])
//! 4. read the optional lookup tables ([`tables`])
//! 5. decode the fragments ([`fragments`])
//! 6. hand the decoded book to a [`Packer`]
//!
//! The first failing stage stops the run. Problems confined to one fragment
//! are logged and the fragment is left out.

pub mod descramble;
pub mod fragments;
pub mod schema;
pub mod tables;
pub mod unpack;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::Log;
use rusqlite::{Connection, OpenFlags};

use crate::error::{Error, Result};
use crate::kfx::fragment::Fragment;
use crate::kfx::ion::ImportedTable;
use crate::kfx::symbols::LocalSymbols;
use crate::log_sink::LogSink;

pub use fragments::FragmentDecoder;

/// Scratch sub-directory the container is unpacked into.
pub const DIR_KDF: &str = "KDF";
/// Scrambled book database, relative to the unpacked container.
pub const BOOK_KDF: &str = "resources/book.kdf";
/// Descrambled book database, relative to [`DIR_KDF`].
pub const BOOK_SQLITE: &str = "book.sqlite";

/// A fully decoded book, ready for packing.
#[derive(Debug, Clone)]
pub struct RepackedBook {
    /// Fragments in database row order.
    pub fragments: Vec<Fragment>,
    /// Local symbols referenced by the fragments, numbered from one past the
    /// system and shared tables.
    pub symbols: LocalSymbols,
    /// Shared table the fragments' `$<sid>` symbols refer to.
    pub shared: ImportedTable,
}

impl RepackedBook {
    /// Highest symbol id used by the book.
    pub fn max_id(&self) -> u64 {
        self.symbols.max_id()
    }
}

/// Final stage writing a decoded book to its destination.
pub trait Packer {
    fn pack(&self, book: &RepackedBook, to: &Path) -> Result<()>;
}

/// Runs the repacking pipeline.
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use kpf_repack::kpf::Repacker;
///
/// let book = Repacker::new(log::logger())
///     .keep_intermediate(true)
///     .read(Path::new("book.kpf"), Path::new("/tmp/work"))?;
/// println!("{} fragments", book.fragments.len());
/// # Ok::<(), kpf_repack::Error>(())
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Repacker<'a> {
    log: LogSink<'a>,
    keep_intermediate: bool,
}

impl<'a> Repacker<'a> {
    pub fn new(log: &'a dyn Log) -> Self {
        Self {
            log: LogSink::new(log),
            keep_intermediate: false,
        }
    }

    /// Keep the unpacked container and descrambled database after the run.
    pub fn keep_intermediate(mut self, keep: bool) -> Self {
        self.keep_intermediate = keep;
        self
    }

    /// Repack `from` into `to` using `work_dir` for scratch files.
    pub fn convert(&self, from: &Path, to: &Path, work_dir: &Path, packer: &dyn Packer) -> Result<()> {
        let start = Instant::now();
        self.log.debug(format_args!("Repacking to KFX - start"));

        let result = self
            .read(from, work_dir)
            .and_then(|book| packer.pack(&book, to));

        self.log.debug(format_args!(
            "Repacking to KFX - done: elapsed={:?} from={} to={}",
            start.elapsed(),
            from.display(),
            to.display()
        ));
        result
    }

    /// Unpack and decode the container at `from`.
    pub fn read(&self, from: &Path, work_dir: &Path) -> Result<RepackedBook> {
        let kdf_dir = work_dir.join(DIR_KDF);
        let result = self.read_in(from, &kdf_dir);
        if !self.keep_intermediate {
            self.remove_scratch(&kdf_dir);
        }
        result
    }

    fn read_in(&self, from: &Path, kdf_dir: &Path) -> Result<RepackedBook> {
        let count = unpack::unpack_kpf(from, kdf_dir)?;
        self.log.debug(format_args!(
            "Unpacked {count} files from {} into {}",
            from.display(),
            kdf_dir.display()
        ));

        let kdf_book = kdf_dir.join(BOOK_KDF);
        if !kdf_book.is_file() {
            return Err(Error::MissingEntry(BOOK_KDF));
        }
        let sql_file: PathBuf = kdf_dir.join(BOOK_SQLITE);
        descramble::descramble_file(&kdf_book, &sql_file)?;

        let db = Connection::open_with_flags(
            &sql_file,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let book = self.decode(&db)?;
        if let Err((_, err)) = db.close() {
            self.log
                .warn(format_args!("Unable to close database cleanly: {err}"));
        }
        Ok(book)
    }

    /// Decode an already descrambled book database.
    pub fn decode(&self, db: &Connection) -> Result<RepackedBook> {
        let tables = schema::read_schema(db).inspect_err(|err| {
            self.log.warn(format_args!(
                "Bad book database, possibly new kindle previewer was installed recently: {err}"
            ));
        })?;
        self.log.debug(format_args!(
            "Book database tables: {}",
            tables.iter().collect::<Vec<_>>().join(" ")
        ));

        let eid_symbols = tables::read_kfxid_translations(db, &tables, self.log)?;
        let element_types = tables::read_fragment_properties(db, &tables)?;

        let mut decoder = FragmentDecoder::new(db, eid_symbols.as_ref(), &element_types, self.log)?;
        decoder.read_fragments()?;
        Ok(decoder.into_book())
    }

    fn remove_scratch(&self, dir: &Path) {
        if !dir.exists() {
            return;
        }
        if let Err(err) = fs::remove_dir_all(dir) {
            self.log.warn(format_args!(
                "Unable to remove intermediate files {}: {err}",
                dir.display()
            ));
        }
    }
}

/// Repack the KPF container `from` into `to`.
///
/// `work_dir` receives scratch files, which are removed afterwards. All
/// diagnostics go to `log`.
pub fn convert_from_kpf(
    from: &Path,
    to: &Path,
    work_dir: &Path,
    log: &dyn Log,
    packer: &dyn Packer,
) -> Result<()> {
    Repacker::new(log).convert(from, to, work_dir, packer)
}
