//! Book database schema check.
//!
//! Amazon is known to change the KDF schema between Kindle Previewer
//! releases without notice, so table definitions are matched byte for byte
//! against the ones this crate understands.

use std::collections::BTreeSet;

use rusqlite::Connection;

use crate::error::{Error, Result};

pub const INDEX_INFO: &str = "index_info";
pub const KFXID_TRANSLATION: &str = "kfxid_translation";
pub const FRAGMENT_PROPERTIES: &str = "fragment_properties";
pub const FRAGMENTS: &str = "fragments";
pub const GC_FRAGMENT_PROPERTIES: &str = "gc_fragment_properties";
pub const GC_REACHABLE: &str = "gc_reachable";
pub const CAPABILITIES: &str = "capabilities";

/// Known table definitions and the table name each one must carry.
pub const KNOWN_TABLES: [(&str, &str); 7] = [
    (
        "CREATE TABLE index_info(namespace char(256), index_name char(256), property char(40), primary key (namespace, index_name)) without rowid",
        INDEX_INFO,
    ),
    (
        "CREATE TABLE kfxid_translation(eid INTEGER, kfxid char(40), primary key(eid)) without rowid",
        KFXID_TRANSLATION,
    ),
    (
        "CREATE TABLE fragment_properties(id char(40), key char(40), value char(40), primary key (id, key, value)) without rowid",
        FRAGMENT_PROPERTIES,
    ),
    (
        "CREATE TABLE fragments(id char(40), payload_type char(10), payload_value blob, primary key (id))",
        FRAGMENTS,
    ),
    (
        "CREATE TABLE gc_fragment_properties(id varchar(40), key varchar(40), value varchar(40), primary key (id, key, value)) without rowid",
        GC_FRAGMENT_PROPERTIES,
    ),
    (
        "CREATE TABLE gc_reachable(id varchar(40), primary key (id)) without rowid",
        GC_REACHABLE,
    ),
    (
        "CREATE TABLE capabilities(key char(20), version smallint, primary key (key, version)) without rowid",
        CAPABILITIES,
    ),
];

/// Tables every book database must have.
pub const MUST_HAVE: [&str; 2] = [CAPABILITIES, FRAGMENTS];

/// Canonical table name for an exact table definition.
pub fn known_table(sql: &str) -> Option<&'static str> {
    KNOWN_TABLES
        .iter()
        .find(|(definition, _)| *definition == sql)
        .map(|(_, name)| *name)
}

/// Set of verified tables present in the book database.
///
/// Computed once by [`read_schema`]; readers consult it to decide whether an
/// optional table exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSet {
    tables: BTreeSet<&'static str>,
}

impl TableSet {
    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.tables.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl FromIterator<&'static str> for TableSet {
    fn from_iter<I: IntoIterator<Item = &'static str>>(iter: I) -> Self {
        Self {
            tables: iter.into_iter().collect(),
        }
    }
}

/// Verify the table catalog of the book database.
///
/// Every table must match a known definition under its canonical name, and
/// all [`MUST_HAVE`] tables must be present.
pub fn read_schema(db: &Connection) -> Result<TableSet> {
    let mut stmt = db.prepare("SELECT name, sql FROM sqlite_master WHERE type='table';")?;
    let mut rows = stmt.query([])?;

    let mut tables = BTreeSet::new();
    while let Some(row) = rows.next()? {
        let name: String = row.get(0)?;
        let sql: String = row.get(1)?;
        let Some(expected) = known_table(&sql) else {
            return Err(Error::UnexpectedTable { name, sql });
        };
        if expected != name {
            return Err(Error::TableNameMismatch {
                name,
                sql,
                expected,
            });
        }
        tables.insert(expected);
    }

    let absent: Vec<_> = MUST_HAVE
        .iter()
        .copied()
        .filter(|name| !tables.contains(name))
        .collect();
    if !absent.is_empty() {
        return Err(Error::MissingTables(absent));
    }

    Ok(TableSet { tables })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(name: &str) -> &'static str {
        KNOWN_TABLES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(sql, _)| *sql)
            .unwrap()
    }

    fn db_with(tables: &[&str]) -> Connection {
        let db = Connection::open_in_memory().unwrap();
        for name in tables {
            db.execute_batch(definition(name)).unwrap();
        }
        db
    }

    #[test]
    fn test_all_known_tables_accepted() {
        let names: Vec<_> = KNOWN_TABLES.iter().map(|(_, n)| *n).collect();
        let db = db_with(&names);
        let tables = read_schema(&db).unwrap();
        assert_eq!(tables.len(), 7);
        assert!(tables.contains(KFXID_TRANSLATION));
    }

    #[test]
    fn test_minimal_schema() {
        let db = db_with(&[CAPABILITIES, FRAGMENTS]);
        let tables = read_schema(&db).unwrap();
        assert_eq!(tables.iter().collect::<Vec<_>>(), [CAPABILITIES, FRAGMENTS]);
        assert!(!tables.contains(FRAGMENT_PROPERTIES));
    }

    #[test]
    fn test_whitespace_difference_is_unexpected() {
        let db = db_with(&[CAPABILITIES]);
        db.execute_batch(
            "CREATE TABLE fragments(id char(40),  payload_type char(10), payload_value blob, primary key (id))",
        )
        .unwrap();
        match read_schema(&db) {
            Err(Error::UnexpectedTable { name, .. }) => assert_eq!(name, FRAGMENTS),
            other => panic!("expected unexpected table, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_table_rejected() {
        let db = db_with(&[CAPABILITIES, FRAGMENTS]);
        db.execute_batch("CREATE TABLE extras(id char(40))").unwrap();
        assert!(matches!(
            read_schema(&db),
            Err(Error::UnexpectedTable { name, .. }) if name == "extras"
        ));
    }

    #[test]
    fn test_missing_fragments_named() {
        let db = db_with(&[CAPABILITIES, INDEX_INFO, KFXID_TRANSLATION, GC_REACHABLE]);
        match read_schema(&db) {
            Err(Error::MissingTables(absent)) => assert_eq!(absent, [FRAGMENTS]),
            other => panic!("expected missing tables, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_both_named() {
        let db = db_with(&[GC_REACHABLE]);
        let err = read_schema(&db).unwrap_err();
        assert_eq!(
            err.to_string(),
            "unable to find some of expected tables: capabilities fragments"
        );
    }

    #[test]
    fn test_renamed_table_is_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.sqlite");
        {
            let db = Connection::open(&path).unwrap();
            for name in [CAPABILITIES, FRAGMENTS, GC_REACHABLE] {
                db.execute_batch(definition(name)).unwrap();
            }
            db.execute_batch(
                "PRAGMA writable_schema=ON;
                 UPDATE sqlite_master SET name='gc_reachable2' WHERE name='gc_reachable';
                 PRAGMA writable_schema=OFF;",
            )
            .unwrap();
        }

        let db = Connection::open(&path).unwrap();
        match read_schema(&db) {
            Err(Error::TableNameMismatch {
                name, expected, ..
            }) => {
                assert_eq!(name, "gc_reachable2");
                assert_eq!(expected, GC_REACHABLE);
            }
            other => panic!("expected table name mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_known_table_lookup_is_exact() {
        assert_eq!(known_table(definition(GC_REACHABLE)), Some(GC_REACHABLE));
        assert_eq!(known_table(&definition(GC_REACHABLE).to_lowercase()), None);
    }
}
