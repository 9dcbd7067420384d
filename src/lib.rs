//! # kpf-repack
//!
//! Repack Kindle Previewer KPF containers into a dereferenced set of KFX
//! fragments.
//!
//! ## Pipeline
//!
//! - Unpack the KPF zip container
//! - Descramble the embedded `book.kdf` into a plain SQLite database
//! - Verify the database schema against the known table definitions
//! - Decode fragments under the book's Ion symbol table, resolving element
//!   id references to KFX symbols
//!
//! The decoded [`RepackedBook`] is handed to a [`Packer`], which writes the
//! final output.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::path::Path;
//! use kpf_repack::{Packer, RepackedBook, Result, convert_from_kpf};
//!
//! struct Count;
//!
//! impl Packer for Count {
//!     fn pack(&self, book: &RepackedBook, _to: &Path) -> Result<()> {
//!         println!("{} fragments", book.fragments.len());
//!         Ok(())
//!     }
//! }
//!
//! convert_from_kpf(
//!     Path::new("book.kpf"),
//!     Path::new("book.kfx"),
//!     Path::new("/tmp/work"),
//!     log::logger(),
//!     &Count,
//! )?;
//! # Ok::<(), kpf_repack::Error>(())
//! ```

pub mod error;
pub mod kfx;
pub mod kpf;
pub mod log_sink;

pub use error::{Error, Result};
pub use kfx::fragment::Fragment;
pub use kfx::symbols::{LocalSymbols, SymbolToken};
pub use kpf::{Packer, RepackedBook, Repacker, convert_from_kpf};
pub use log_sink::LogSink;
