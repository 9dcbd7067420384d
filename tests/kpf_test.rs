//! End-to-end tests over synthetic KPF containers.

use std::cell::RefCell;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{Level, Log, Metadata, Record};
use rusqlite::{Connection, params};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use kpf_repack::kfx::ion::{IonParser, IonValue, IonWriter, system, to_binary};
use kpf_repack::kpf::descramble::{WRAPPER_OFFSET, scramble};
use kpf_repack::kpf::fragments::{MAX_ID, SYMBOL_TABLE_ID};
use kpf_repack::kpf::schema::KNOWN_TABLES;
use kpf_repack::kpf::{BOOK_KDF, BOOK_SQLITE, DIR_KDF, FragmentDecoder, descramble, schema, tables};
use kpf_repack::{Error, LogSink, Packer, RepackedBook, Repacker, Result, convert_from_kpf};

/// YJ_symbols size used by the fixtures.
const YJ_MAX_ID: i64 = 842;
const SHARED_MAX_ID: u64 = 9 + YJ_MAX_ID as u64;

#[derive(Default)]
struct Capture {
    records: Mutex<Vec<(Level, String)>>,
}

impl Capture {
    fn contains(&self, level: Level, needle: &str) -> bool {
        self.records
            .lock()
            .unwrap()
            .iter()
            .any(|(l, msg)| *l == level && msg.contains(needle))
    }
}

impl Log for Capture {
    fn enabled(&self, _: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        self.records
            .lock()
            .unwrap()
            .push((record.level(), record.args().to_string()));
    }

    fn flush(&self) {}
}

/// Packer that keeps the book it was handed.
#[derive(Default)]
struct Recorder {
    book: RefCell<Option<RepackedBook>>,
}

impl Packer for Recorder {
    fn pack(&self, book: &RepackedBook, to: &Path) -> Result<()> {
        fs::write(to, b"packed")?;
        *self.book.borrow_mut() = Some(book.clone());
        Ok(())
    }
}

/// Builder for a book database on disk.
struct BookDb {
    path: PathBuf,
    db: Connection,
}

impl BookDb {
    fn new(dir: &Path, tables: &[&str]) -> Self {
        let path = dir.join("plain.sqlite");
        let db = Connection::open(&path).unwrap();
        for (sql, name) in KNOWN_TABLES {
            if tables.contains(&name) {
                db.execute_batch(sql).unwrap();
            }
        }
        Self { path, db }
    }

    fn minimal(dir: &Path) -> Self {
        let book = Self::new(dir, &["capabilities", "fragments"]);
        book.insert(SYMBOL_TABLE_ID, "blob", &symbol_table(YJ_MAX_ID));
        book.insert(MAX_ID, "blob", &to_binary(&IonValue::Int(SHARED_MAX_ID as i64)));
        book
    }

    fn insert(&self, id: &str, payload_type: &str, data: &[u8]) {
        self.db
            .execute(
                "INSERT INTO fragments (id, payload_type, payload_value) VALUES (?1, ?2, ?3)",
                params![id, payload_type, data],
            )
            .unwrap();
    }

    /// Close the database and return its file bytes.
    fn finish(self) -> Vec<u8> {
        self.db.close().unwrap();
        fs::read(&self.path).unwrap()
    }
}

fn symbol_table(yj_max_id: i64) -> Vec<u8> {
    let import = IonValue::Struct(vec![
        (system::NAME, IonValue::String("YJ_symbols".into())),
        (system::VERSION, IonValue::Int(10)),
        (system::MAX_ID, IonValue::Int(yj_max_id)),
    ]);
    to_binary(&IonValue::Annotated(
        vec![system::ION_SYMBOL_TABLE],
        Box::new(IonValue::Struct(vec![(system::IMPORTS, IonValue::List(vec![import]))])),
    ))
}

fn annotated(ftype: u64, value: IonValue) -> Vec<u8> {
    let mut writer = IonWriter::new();
    writer.write_bvm();
    writer.write_value(&IonValue::Annotated(vec![ftype], Box::new(value)));
    writer.into_bytes()
}

/// Zip a scrambled copy of `plain` into a KPF container.
fn write_kpf(dir: &Path, plain: &[u8]) -> PathBuf {
    let kpf = dir.join("book.kpf");
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    zip.start_file("book.kcb", options).unwrap();
    zip.write_all(b"{}").unwrap();
    zip.start_file(BOOK_KDF, options).unwrap();
    zip.write_all(&scramble(plain)).unwrap();
    fs::write(&kpf, zip.finish().unwrap().into_inner()).unwrap();
    kpf
}

#[test]
fn test_repacks_valid_container() {
    let dir = tempfile::tempdir().unwrap();
    let book = BookDb::minimal(dir.path());
    book.insert(
        "c0",
        "blob",
        &annotated(260, IonValue::Struct(vec![(176, IonValue::String("body".into()))])),
    );
    book.insert("images/cover.jpg", "blob", &[0xff, 0xd8, 0xff, 0xe0]);
    book.insert("book_navigation", "blob", &[0xe0, 0x01, 0x00, 0xea]);
    let kpf = write_kpf(dir.path(), &book.finish());

    let work = dir.path().join("work");
    let out = dir.path().join("book.kfx");
    let capture = Capture::default();
    let packer = Recorder::default();
    convert_from_kpf(&kpf, &out, &work, &capture, &packer).unwrap();

    let book = packer.book.borrow_mut().take().unwrap();
    assert_eq!(book.shared.name, "YJ_symbols");
    assert_eq!(book.shared.max_id, YJ_MAX_ID as u64);
    assert_eq!(book.fragments.len(), 2);

    let section = &book.fragments[0];
    assert_eq!(section.ftype().text, "$260");
    assert_eq!(section.fid().text, "c0");
    assert_eq!(section.fid().sid, Some(SHARED_MAX_ID + 1));
    let value = IonParser::new(section.data()).parse().unwrap();
    assert_eq!(value.get(176), Some(&IonValue::String("body".into())));

    let cover = &book.fragments[1];
    assert_eq!(cover.ftype().sid, Some(417));
    assert_eq!(cover.fid().text, "resource/images/cover.jpg");
    assert_eq!(book.symbols.symbols(), ["c0", "resource/images/cover.jpg"]);

    assert_eq!(fs::read(&out).unwrap(), b"packed");
    assert!(!work.join(DIR_KDF).exists());
    assert!(capture.contains(Level::Debug, "Repacking to KFX - done"));
}

#[test]
fn test_unsupported_payload_stops_conversion() {
    let dir = tempfile::tempdir().unwrap();
    let book = BookDb::minimal(dir.path());
    book.insert("c0", "blob", &annotated(260, IonValue::Struct(vec![])));
    book.insert("images/cover.jpg", "blob", &[0x89, b'P', b'N', b'G']);
    book.insert("x0", "link", b"elsewhere");
    let kpf = write_kpf(dir.path(), &book.finish());

    let work = dir.path().join("work");
    let capture = Capture::default();
    let packer = Recorder::default();
    let err = convert_from_kpf(&kpf, &dir.path().join("out.kfx"), &work, &capture, &packer).unwrap_err();
    match err {
        Error::UnexpectedPayloadType {
            payload_type,
            id,
            size,
        } => assert_eq!((payload_type.as_str(), id.as_str(), size), ("link", "x0", 9)),
        other => panic!("expected payload type error, got {other:?}"),
    }
    assert!(packer.book.borrow().is_none());
    assert!(!work.join(DIR_KDF).exists());

    // Both rows before the unsupported one were decoded
    let err = Repacker::new(&capture)
        .keep_intermediate(true)
        .read(&kpf, &work)
        .unwrap_err();
    assert!(matches!(err, Error::UnexpectedPayloadType { .. }));
    let db = Connection::open(work.join(DIR_KDF).join(BOOK_SQLITE)).unwrap();
    let tables = schema::read_schema(&db).unwrap();
    let types = tables::read_fragment_properties(&db, &tables).unwrap();
    let mut decoder = FragmentDecoder::new(&db, None, &types, LogSink::new(&capture)).unwrap();
    assert!(decoder.read_fragments().is_err());
    assert_eq!(decoder.fragments().len(), 2);
}

#[test]
fn test_keep_intermediate_leaves_plain_database() {
    let dir = tempfile::tempdir().unwrap();
    let plain = BookDb::minimal(dir.path()).finish();
    let kpf = write_kpf(dir.path(), &plain);

    let work = dir.path().join("work");
    let capture = Capture::default();
    let book = Repacker::new(&capture).keep_intermediate(true).read(&kpf, &work).unwrap();
    assert!(book.fragments.is_empty());

    let kdf = work.join(DIR_KDF);
    assert_eq!(fs::read(kdf.join(BOOK_SQLITE)).unwrap(), plain);
    assert!(kdf.join(BOOK_KDF).is_file());
}

#[test]
fn test_element_ids_resolved_through_translation_table() {
    let dir = tempfile::tempdir().unwrap();
    let book = BookDb::new(
        dir.path(),
        &["capabilities", "fragments", "kfxid_translation", "fragment_properties"],
    );
    book.insert(SYMBOL_TABLE_ID, "blob", &symbol_table(YJ_MAX_ID));
    book.insert(MAX_ID, "blob", &to_binary(&IonValue::Int(SHARED_MAX_ID as i64)));
    book.db
        .execute_batch(
            "INSERT INTO kfxid_translation VALUES (1001, '$1500');
             INSERT INTO fragment_properties VALUES ('c0', 'element_type', 'storyline');",
        )
        .unwrap();
    book.insert(
        "c0",
        "blob",
        &annotated(
            259,
            IonValue::Struct(vec![(
                146,
                IonValue::List(vec![IonValue::Struct(vec![(155, IonValue::Int(1001))])]),
            )]),
        ),
    );
    let kpf = write_kpf(dir.path(), &book.finish());

    let capture = Capture::default();
    let book = Repacker::new(&capture).read(&kpf, &dir.path().join("work")).unwrap();
    let value = IonParser::new(book.fragments[0].data()).parse().unwrap();
    let content = &value.get(146).unwrap().as_list().unwrap()[0];
    assert_eq!(content.get(155), Some(&IonValue::Symbol(1500)));
}

#[test]
fn test_schema_drift_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let book = BookDb::minimal(dir.path());
    book.db
        .execute_batch("CREATE TABLE reading_order(id char(40))")
        .unwrap();
    let kpf = write_kpf(dir.path(), &book.finish());

    let capture = Capture::default();
    let err = Repacker::new(&capture)
        .read(&kpf, &dir.path().join("work"))
        .unwrap_err();
    assert!(matches!(err, Error::UnexpectedTable { ref name, .. } if name == "reading_order"));
    assert!(capture.contains(Level::Warn, "possibly new kindle previewer"));
}

#[test]
fn test_max_id_mismatch_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let book = BookDb::new(dir.path(), &["capabilities", "fragments"]);
    book.insert(SYMBOL_TABLE_ID, "blob", &symbol_table(33));
    book.insert(MAX_ID, "blob", &to_binary(&IonValue::Int(43)));
    let kpf = write_kpf(dir.path(), &book.finish());

    let capture = Capture::default();
    let err = Repacker::new(&capture)
        .read(&kpf, &dir.path().join("work"))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::MaxIdMismatch {
            fragment: 43,
            symbol_table: 42
        }
    ));
}

#[test]
fn test_corrupt_frame_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let plain = BookDb::minimal(dir.path()).finish();
    let mut scrambled = scramble(&plain);
    scrambled[WRAPPER_OFFSET] ^= 0x01;
    let kdf = dir.path().join("book.kdf");
    fs::write(&kdf, scrambled).unwrap();

    let err = descramble::descramble_file(&kdf, &dir.path().join("book.sqlite")).unwrap_err();
    assert!(matches!(err, Error::Fingerprint { offset, .. } if offset == WRAPPER_OFFSET));
}

#[test]
fn test_container_without_book() {
    let dir = tempfile::tempdir().unwrap();
    let kpf = dir.path().join("empty.kpf");
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    zip.start_file("book.kcb", SimpleFileOptions::default()).unwrap();
    zip.write_all(b"{}").unwrap();
    fs::write(&kpf, zip.finish().unwrap().into_inner()).unwrap();

    let capture = Capture::default();
    let err = Repacker::new(&capture)
        .read(&kpf, &dir.path().join("work"))
        .unwrap_err();
    assert!(matches!(err, Error::MissingEntry(BOOK_KDF)));
}
