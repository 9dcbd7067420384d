//! Error types for KPF repacking.

use std::fmt;
use std::io;

use bstr::ByteSlice;
use thiserror::Error;

/// Raw bytes rendered as an escaped byte string in error messages.
#[derive(Clone, PartialEq, Eq)]
pub struct Found(pub Vec<u8>);

impl fmt::Debug for Found {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0.as_bstr())
    }
}

impl fmt::Display for Found {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<&[u8]> for Found {
    fn from(bytes: &[u8]) -> Self {
        Found(bytes.to_vec())
    }
}

/// Errors that abort a conversion.
///
/// Problems confined to a single fragment are never reported through this
/// type; the decoder logs them and moves on.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    // --- structural ---
    #[error("container entry escapes the working directory: {0}")]
    UnsafeEntry(String),

    #[error("unable to find {0} in container")]
    MissingEntry(&'static str),

    #[error("unexpected SQLite file length: {0}")]
    FileLength(usize),

    #[error("unexpected SQLite file signature: {found}")]
    Signature { found: Found },

    #[error("unexpected fingerprint at offset {offset:#x}: {found}")]
    Fingerprint { offset: usize, found: Found },

    #[error("unexpected fingerprint header at offset {offset:#x}: {found}")]
    FrameHeader { offset: usize, found: Found },

    // --- schema ---
    #[error("unexpected database table {name}[{sql}]")]
    UnexpectedTable { name: String, sql: String },

    #[error("unexpected database table name {name} for [{sql}], expected {expected}")]
    TableNameMismatch {
        name: String,
        sql: String,
        expected: &'static str,
    },

    #[error("unable to find some of expected tables: {}", .0.join(" "))]
    MissingTables(Vec<&'static str>),

    #[error("fragment property has unknown key: {key} ({id}:{value})")]
    UnknownPropertyKey {
        key: String,
        id: String,
        value: String,
    },

    #[error("unable to find {0} fragment")]
    MissingFragment(&'static str),

    #[error("unable to decode KDF {fragment} fragment: {source}")]
    IonDecode {
        fragment: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("unexpected value {0} for KDF $ion_symbol_table fragment")]
    UnexpectedSymbolTableValue(String),

    #[error("unexpected imports for KDF $ion_symbol_table fragment: {0}")]
    UnexpectedImports(String),

    #[error("unexpected value in KDF max_id fragment: {0}")]
    MaxId(String),

    #[error(
        "max_id ({fragment}) in KDF max_id fragment is not equal to number of symbols in KDF $ion_symbol_table fragment ({symbol_table})"
    )]
    MaxIdMismatch { fragment: u64, symbol_table: u64 },

    // --- format ---
    #[error("unexpected KDF fragment type ({payload_type}) with id ({id}) size {size}")]
    UnexpectedPayloadType {
        payload_type: String,
        id: String,
        size: usize,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
