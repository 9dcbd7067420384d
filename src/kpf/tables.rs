//! Optional lookup tables of the book database.

use std::collections::HashMap;

use rusqlite::Connection;

use super::schema::{FRAGMENT_PROPERTIES, KFXID_TRANSLATION, TableSet};
use crate::error::{Error, Result};
use crate::kfx::symbols::{SymbolToken, create_local_symbol_token};
use crate::log_sink::LogSink;

/// Element id used by the book database before ids are rewritten to symbols.
pub type Eid = i64;

/// Element id to KFX symbol translations from `kfxid_translation`.
pub type EidSymbols = HashMap<Eid, SymbolToken>;

/// Fragment id to element type from `fragment_properties`.
pub type ElementTypes = HashMap<String, String>;

/// Read `kfxid_translation`; `None` when the book has no such table.
///
/// Stored values are always `$<digits>`; rows that are not resolve to the
/// unknown token and are logged.
pub fn read_kfxid_translations(
    db: &Connection,
    tables: &TableSet,
    log: LogSink<'_>,
) -> Result<Option<EidSymbols>> {
    if !tables.contains(KFXID_TRANSLATION) {
        return Ok(None);
    }

    let mut stmt = db.prepare("SELECT eid, kfxid FROM kfxid_translation;")?;
    let mut rows = stmt.query([])?;

    let mut eid_symbols = EidSymbols::new();
    while let Some(row) = rows.next()? {
        let eid: Eid = row.get(0)?;
        let kfxid: String = row.get(1)?;
        eid_symbols.insert(eid, create_local_symbol_token(&kfxid, log));
    }
    Ok(Some(eid_symbols))
}

/// Read element types from `fragment_properties`.
///
/// Only `child` (ignored) and `element_type` keys are understood; any other
/// key means the schema grew in a way this crate does not model.
pub fn read_fragment_properties(db: &Connection, tables: &TableSet) -> Result<ElementTypes> {
    let mut element_types = ElementTypes::new();
    if !tables.contains(FRAGMENT_PROPERTIES) {
        return Ok(element_types);
    }

    let mut stmt = db.prepare("SELECT id, key, value FROM fragment_properties;")?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let id: String = row.get(0)?;
        let key: String = row.get(1)?;
        let value: String = row.get(2)?;
        match key.as_str() {
            "child" => {}
            "element_type" => {
                element_types.insert(id, value);
            }
            _ => return Err(Error::UnknownPropertyKey { key, id, value }),
        }
    }
    Ok(element_types)
}
