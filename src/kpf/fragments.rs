//! Fragment decoding from the book database.
//!
//! Decoding runs in two phases. The bootstrap phase reads the book's
//! `$ion_symbol_table` fragment and cross-checks its size against the
//! separately stored `max_id` fragment. The second phase walks every other
//! row of `fragments`, wrapping resources and re-encoding Ion values with
//! element ids replaced by their KFX symbols.

use std::io;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension};
use thiserror::Error;

use super::RepackedBook;
use super::tables::{Eid, EidSymbols, ElementTypes};
use crate::error::{Error, Result};
use crate::kfx::fragment::Fragment;
use crate::kfx::ion::{ION_MAGIC, ImportedTable, IonReader, IonValue, SymbolTable, system, to_binary};
use crate::kfx::symbols::{LocalSymbols, SymbolToken, create_symbol_token, parse_literal, sym};
use crate::log_sink::LogSink;

/// Fragment holding the book's local symbol table.
pub const SYMBOL_TABLE_ID: &str = "$ion_symbol_table";
/// Fragment holding the symbol table's max id.
pub const MAX_ID: &str = "max_id";
/// Name of the vendor shared symbol table.
pub const SHARED_TABLE_NAME: &str = "YJ_symbols";
/// Prefix of resource fragment ids.
pub const RESOURCE_PREFIX: &str = "resource/";
/// Fragment id used when a book carries no navigation data.
pub const NAVIGATION_PLACEHOLDER: &str = "book_navigation";

/// Fragment type of resources stored by path.
const RAW_MEDIA_TYPE: &str = "$417";
/// Second annotation tolerated after the fragment type.
const FRAGMENT_MARKER: &str = "$608";

/// Row payload, by `payload_type`.
#[derive(Debug)]
enum Payload {
    Blob(Vec<u8>),
    Path(Vec<u8>),
    Unsupported { payload_type: String, size: usize },
}

impl Payload {
    fn new(payload_type: String, data: Vec<u8>) -> Self {
        match payload_type.as_str() {
            "blob" => Payload::Blob(data),
            "path" => Payload::Path(data),
            _ => Payload::Unsupported {
                payload_type,
                size: data.len(),
            },
        }
    }
}

/// Why a single fragment was left out. Never aborts the conversion.
#[derive(Error, Debug)]
enum Skip {
    #[error("unable to read value annotations: {0}")]
    Unreadable(io::Error),

    #[error("unable to read value annotations: empty value")]
    NoValue,

    #[error("fragment must have annotation")]
    NotAnnotated,

    #[error("fragment should have single annotation, found {0}")]
    Annotations(usize),

    #[error("fragment cannot be empty")]
    Typeless,

    #[error("symbol id {0} has no text")]
    UnknownSymbol(u64),

    #[error("unable to resolve symbol {0}")]
    UnresolvedSymbol(String),

    #[error("unsupported element reference {0}")]
    UnsupportedElement(Eid),
}

/// Read the book's symbol table and verify it against `max_id`.
///
/// The symbol table fragment must hold nothing but the table, import exactly
/// `$ion` and `YJ_symbols`, and define as many symbols as `max_id` says.
pub fn read_symbol_table(db: &Connection, log: LogSink<'_>) -> Result<SymbolTable> {
    let ist = query_blob(db, SYMBOL_TABLE_ID)?;
    let decode_err = |source| Error::IonDecode {
        fragment: SYMBOL_TABLE_ID,
        source,
    };
    let mut reader = IonReader::new(&ist).map_err(decode_err)?;
    if let Some(value) = reader.next().map_err(decode_err)? {
        return Err(Error::UnexpectedSymbolTableValue(format!("{value:?}")));
    }
    let table = reader.into_symbol_table();

    let names: Vec<_> = table.imports().iter().map(|t| t.name.as_str()).collect();
    if names != [system::TABLE_NAME, SHARED_TABLE_NAME] {
        return Err(Error::UnexpectedImports(table.to_string()));
    }

    let blob = query_blob(db, MAX_ID)?;
    let decode_err = |source| Error::IonDecode {
        fragment: MAX_ID,
        source,
    };
    let mut reader = IonReader::new(&blob).map_err(decode_err)?;
    let max_id = match reader.next().map_err(decode_err)? {
        Some(IonValue::Int(n)) => u64::try_from(n).map_err(|_| Error::MaxId(n.to_string()))?,
        Some(other) => return Err(Error::MaxId(format!("{other:?}"))),
        None => return Err(Error::MaxId("<nil>".to_string())),
    };
    if max_id != table.max_id() {
        return Err(Error::MaxIdMismatch {
            fragment: max_id,
            symbol_table: table.max_id(),
        });
    }

    log.debug(format_args!("Symbol table: {table}"));
    Ok(table)
}

fn query_blob(db: &Connection, id: &'static str) -> Result<Vec<u8>> {
    db.query_row(
        "SELECT payload_value FROM fragments WHERE id = ?1 AND payload_type = 'blob';",
        [id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or(Error::MissingFragment(id))
}

/// Decodes the rows of the `fragments` table into [`Fragment`]s.
///
/// Borrows the database for its whole lifetime and owns the local symbols
/// allocated while decoding.
pub struct FragmentDecoder<'a> {
    db: &'a Connection,
    eid_symbols: Option<&'a EidSymbols>,
    element_types: &'a ElementTypes,
    log: LogSink<'a>,
    symbol_table: SymbolTable,
    symbols: LocalSymbols,
    fragments: Vec<Fragment>,
}

impl<'a> FragmentDecoder<'a> {
    /// Bootstrap the decoder from the book's symbol table.
    pub fn new(
        db: &'a Connection,
        eid_symbols: Option<&'a EidSymbols>,
        element_types: &'a ElementTypes,
        log: LogSink<'a>,
    ) -> Result<Self> {
        let symbol_table = read_symbol_table(db, log)?;
        let symbols = LocalSymbols::new(symbol_table.shared_max_id() + 1);
        Ok(Self {
            db,
            eid_symbols,
            element_types,
            log,
            symbol_table,
            symbols,
            fragments: Vec::with_capacity(128),
        })
    }

    pub fn symbol_table(&self) -> &SymbolTable {
        &self.symbol_table
    }

    /// Fragments decoded so far, in row order.
    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// Decode every row except the two bootstrap fragments.
    ///
    /// Malformed fragments are logged and skipped. A payload type other than
    /// `blob` or `path` stops decoding; fragments decoded before it are kept.
    pub fn read_fragments(&mut self) -> Result<()> {
        let db = self.db;
        let mut stmt = db.prepare(
            "SELECT id, payload_type, payload_value FROM fragments WHERE id != 'max_id' AND id != '$ion_symbol_table';",
        )?;
        let mut rows = stmt.query([])?;

        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let payload_type: String = row.get(1)?;
            let data = match row.get_ref(2)? {
                ValueRef::Blob(bytes) | ValueRef::Text(bytes) => bytes.to_vec(),
                ValueRef::Null => Vec::new(),
                // Numbers are read as their text
                ValueRef::Integer(n) => n.to_string().into_bytes(),
                ValueRef::Real(f) => f.to_string().into_bytes(),
            };
            self.read_fragment(id, Payload::new(payload_type, data))?;
        }

        self.log.debug(format_args!(
            "Decoded {} fragments, {} local symbols",
            self.fragments.len(),
            self.symbols.len()
        ));
        Ok(())
    }

    fn read_fragment(&mut self, id: String, payload: Payload) -> Result<()> {
        match payload {
            Payload::Blob(data) if data.is_empty() => {
                let element_type = self.element_types.get(&id).map_or("", String::as_str);
                self.log.debug(format_args!(
                    "Empty KDF fragment (data is empty), ignoring: id={id} type={element_type}"
                ));
            }
            // Normally this does not happen - there is "path" record for that
            Payload::Blob(data) if !data.starts_with(&ION_MAGIC) => self.push_resource(id, data),
            Payload::Blob(data) if data.len() == ION_MAGIC.len() => {
                if id != NAVIGATION_PLACEHOLDER {
                    self.log
                        .warn(format_args!("Empty KDF fragment (BVM only), ignoring: id={id}"));
                }
            }
            Payload::Blob(data) => match self.decode_value(&id, &data) {
                Ok(fragment) => self.fragments.push(fragment),
                Err(skip) => self
                    .log
                    .error(format_args!("KDF fragment {id} skipped: {skip}")),
            },
            Payload::Path(data) => self.push_resource(id, data),
            Payload::Unsupported { payload_type, size } => {
                return Err(Error::UnexpectedPayloadType {
                    payload_type,
                    id,
                    size,
                });
            }
        }
        Ok(())
    }

    fn push_resource(&mut self, id: String, data: Vec<u8>) {
        let id = if id.starts_with(RESOURCE_PREFIX) {
            id
        } else {
            format!("{RESOURCE_PREFIX}{id}")
        };
        let ftype = create_symbol_token(RAW_MEDIA_TYPE, &mut self.symbols, self.log);
        let fid = create_symbol_token(&id, &mut self.symbols, self.log);
        self.fragments.push(Fragment::new(ftype, fid, data));
    }

    /// Decode an annotated Ion fragment under the book's symbol table.
    fn decode_value(&mut self, id: &str, data: &[u8]) -> std::result::Result<Fragment, Skip> {
        let mut reader = IonReader::resume(&data[ION_MAGIC.len()..], &self.symbol_table);
        let value = reader.next().map_err(Skip::Unreadable)?.ok_or(Skip::NoValue)?;

        let IonValue::Annotated(annotations, inner) = value else {
            return Err(Skip::NotAnnotated);
        };
        match annotations.as_slice() {
            [_] => {}
            [_, marker] if self.symbol_table.text(*marker).as_deref() == Some(FRAGMENT_MARKER) => {}
            other => return Err(Skip::Annotations(other.len())),
        }
        if matches!(*inner, IonValue::Null) {
            return Err(Skip::Typeless);
        }
        let ftype_text = self
            .symbol_table
            .text(annotations[0])
            .ok_or(Skip::UnknownSymbol(annotations[0]))?;

        let mut rewriter = Rewriter {
            table: &self.symbol_table,
            symbols: &mut self.symbols,
            eid_symbols: self.eid_symbols,
            log: self.log,
        };
        let value = rewriter.rewrite(*inner)?;

        let ftype = rewriter.token(&ftype_text)?;
        let fid = rewriter.token(id)?;
        Ok(Fragment::new(ftype, fid, to_binary(&value)))
    }

    /// The decoded book: fragments, allocated local symbols and the shared import.
    pub fn into_book(self) -> RepackedBook {
        let shared = self
            .symbol_table
            .imports()
            .last()
            .cloned()
            .unwrap_or_else(ImportedTable::system);
        RepackedBook {
            fragments: self.fragments,
            symbols: self.symbols,
            shared,
        }
    }
}

/// Moves a decoded value into the output symbol space.
///
/// Every symbol is resolved to text under the book's table and re-created as
/// a token against the local symbols; element ids are replaced by their
/// translated symbols along the way.
struct Rewriter<'r> {
    table: &'r SymbolTable,
    symbols: &'r mut LocalSymbols,
    eid_symbols: Option<&'r EidSymbols>,
    log: LogSink<'r>,
}

impl Rewriter<'_> {
    fn rewrite(&mut self, value: IonValue) -> std::result::Result<IonValue, Skip> {
        Ok(match value {
            IonValue::Symbol(sid) => IonValue::Symbol(self.sid(sid)?),
            IonValue::List(items) => IonValue::List(self.rewrite_all(items)?),
            IonValue::Sexp(items) => IonValue::Sexp(self.rewrite_all(items)?),
            IonValue::Struct(fields) => {
                let mut out = Vec::with_capacity(fields.len());
                for (name, value) in fields {
                    let text = self.text(name)?;
                    let value = match value {
                        IonValue::Int(eid) if is_element_id_field(&text) && self.eid_symbols.is_some() => {
                            IonValue::Symbol(self.element(eid)?)
                        }
                        other => self.rewrite(other)?,
                    };
                    out.push((self.resolve(&text)?, value));
                }
                IonValue::Struct(out)
            }
            IonValue::Annotated(annotations, inner) => {
                let annotations = annotations
                    .into_iter()
                    .map(|sid| self.sid(sid))
                    .collect::<std::result::Result<_, _>>()?;
                IonValue::Annotated(annotations, Box::new(self.rewrite(*inner)?))
            }
            scalar => scalar,
        })
    }

    fn rewrite_all(&mut self, items: Vec<IonValue>) -> std::result::Result<Vec<IonValue>, Skip> {
        items.into_iter().map(|item| self.rewrite(item)).collect()
    }

    fn text(&self, sid: u64) -> std::result::Result<String, Skip> {
        self.table.text(sid).ok_or(Skip::UnknownSymbol(sid))
    }

    /// Token for `text`; unresolved text skips the fragment.
    fn token(&mut self, text: &str) -> std::result::Result<SymbolToken, Skip> {
        let token = create_symbol_token(text, self.symbols, self.log);
        if token.is_unknown() {
            return Err(Skip::UnresolvedSymbol(token.text));
        }
        Ok(token)
    }

    /// Output id for `text`.
    fn resolve(&mut self, text: &str) -> std::result::Result<u64, Skip> {
        let token = create_symbol_token(text, self.symbols, self.log);
        token.sid.ok_or(Skip::UnresolvedSymbol(token.text))
    }

    fn sid(&mut self, sid: u64) -> std::result::Result<u64, Skip> {
        let text = self.text(sid)?;
        self.resolve(&text)
    }

    fn element(&self, eid: Eid) -> std::result::Result<u64, Skip> {
        self.eid_symbols
            .and_then(|eids| eids.get(&eid))
            .and_then(|token| token.sid)
            .ok_or(Skip::UnsupportedElement(eid))
    }
}

fn is_element_id_field(text: &str) -> bool {
    parse_literal(text).is_some_and(|sid| sym::ELEMENT_ID_FIELDS.contains(&sid))
}
