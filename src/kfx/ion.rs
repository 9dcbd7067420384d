//! Amazon Ion binary format subset.
//!
//! Ion is Amazon's data serialization format used in KFX ebooks. This covers
//! what repacking needs: parsing and re-emitting fragment values, and reading
//! top-level streams that carry local symbol tables.
//!
//! Reference: <https://amazon-ion.github.io/ion-docs/docs/binary.html>

use std::borrow::Cow;
use std::fmt;
use std::io;

/// Ion binary version marker (BVM)
pub const ION_MAGIC: [u8; 4] = [0xe0, 0x01, 0x00, 0xea];

/// System symbol ids from the `$ion` table.
pub mod system {
    pub const ION: u64 = 1;
    pub const ION_SYMBOL_TABLE: u64 = 3;
    pub const NAME: u64 = 4;
    pub const VERSION: u64 = 5;
    pub const IMPORTS: u64 = 6;
    pub const SYMBOLS: u64 = 7;
    pub const MAX_ID: u64 = 8;

    /// Name of the system symbol table.
    pub const TABLE_NAME: &str = "$ion";
    /// Highest symbol id defined by the system table.
    pub const MAX_SYMBOL_ID: u64 = 9;
}

/// Ion type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum IonType {
    Null = 0,
    Bool = 1,
    PosInt = 2,
    NegInt = 3,
    Float = 4,
    Decimal = 5,
    Timestamp = 6,
    Symbol = 7,
    String = 8,
    Clob = 9,
    Blob = 10,
    List = 11,
    Sexp = 12,
    Struct = 13,
    Annotation = 14,
}

impl IonType {
    fn from_nibble(n: u8) -> Option<Self> {
        match n {
            0 => Some(IonType::Null),
            1 => Some(IonType::Bool),
            2 => Some(IonType::PosInt),
            3 => Some(IonType::NegInt),
            4 => Some(IonType::Float),
            5 => Some(IonType::Decimal),
            6 => Some(IonType::Timestamp),
            7 => Some(IonType::Symbol),
            8 => Some(IonType::String),
            9 => Some(IonType::Clob),
            10 => Some(IonType::Blob),
            11 => Some(IonType::List),
            12 => Some(IonType::Sexp),
            13 => Some(IonType::Struct),
            14 => Some(IonType::Annotation),
            _ => None, // Reserved (15)
        }
    }
}

/// Parsed Ion value.
///
/// Symbols are stored as raw ids; resolve them through the [`SymbolTable`]
/// that was in effect when the value was read. Decimals and timestamps are
/// kept as their encoded bytes so they survive a re-encode untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum IonValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Vec<u8>),
    Timestamp(Vec<u8>),
    Symbol(u64),
    String(String),
    Clob(Vec<u8>),
    Blob(Vec<u8>),
    List(Vec<IonValue>),
    Sexp(Vec<IonValue>),
    /// Struct fields as (symbol_id, value) pairs in parse order
    Struct(Vec<(u64, IonValue)>),
    /// Annotated value: (annotation symbol IDs, inner value)
    Annotated(Vec<u64>, Box<IonValue>),
}

impl IonValue {
    #[inline]
    pub fn as_string(&self) -> Option<&str> {
        match self {
            IonValue::String(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            IonValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    #[inline]
    pub fn as_symbol(&self) -> Option<u64> {
        match self {
            IonValue::Symbol(id) => Some(*id),
            _ => None,
        }
    }

    #[inline]
    pub fn as_list(&self) -> Option<&[IonValue]> {
        match self {
            IonValue::List(items) => Some(items),
            _ => None,
        }
    }

    #[inline]
    pub fn as_struct(&self) -> Option<&[(u64, IonValue)]> {
        match self {
            IonValue::Struct(fields) => Some(fields),
            _ => None,
        }
    }

    /// Get field from struct by symbol ID. O(n) scan - optimal for small structs.
    #[inline]
    pub fn get(&self, symbol_id: u64) -> Option<&IonValue> {
        self.as_struct()?
            .iter()
            .find(|(k, _)| *k == symbol_id)
            .map(|(_, v)| v)
    }

    /// Annotation ids if this is an annotated value.
    pub fn annotations(&self) -> &[u64] {
        match self {
            IonValue::Annotated(annotations, _) => annotations,
            _ => &[],
        }
    }

    /// Unwrap annotated value to get inner value.
    pub fn unwrap_annotated(&self) -> &IonValue {
        match self {
            IonValue::Annotated(_, inner) => inner.unwrap_annotated(),
            other => other,
        }
    }
}

/// Deepest container nesting accepted by [`IonParser`].
pub const MAX_DEPTH: usize = 100;

/// Ion binary parser over a single buffer.
pub struct IonParser<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> IonParser<'a> {
    /// Create a new parser for the given data.
    #[inline]
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            depth: 0,
        }
    }

    /// Parse Ion data starting with the BVM marker.
    pub fn parse(&mut self) -> io::Result<IonValue> {
        if !self.data.starts_with(&ION_MAGIC) {
            return Err(invalid("not Ion data (missing BVM)"));
        }
        self.pos = ION_MAGIC.len();
        self.skip_padding()?;
        if self.at_end() {
            return Ok(IonValue::Null);
        }
        self.parse_value()
    }

    #[inline]
    pub fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// True if a BVM starts at the current position.
    fn at_bvm(&self) -> bool {
        self.data[self.pos..].starts_with(&ION_MAGIC)
    }

    /// Skip NOP padding at the current position.
    fn skip_padding(&mut self) -> io::Result<()> {
        while self.skip_pad()? {}
        Ok(())
    }

    /// Skip one NOP pad if one starts at the current position.
    fn skip_pad(&mut self) -> io::Result<bool> {
        if self.at_end() {
            return Ok(false);
        }
        let type_byte = self.data[self.pos];
        if type_byte >> 4 != 0 || type_byte == 0x0f {
            return Ok(false);
        }
        self.pos += 1;
        let length = match type_byte & 0x0f {
            14 => self.read_varuint()? as usize,
            n => n as usize,
        };
        self.read_bytes(length)?;
        Ok(true)
    }

    /// Parse a single Ion value at current position.
    fn parse_value(&mut self) -> io::Result<IonValue> {
        if self.depth >= MAX_DEPTH {
            return Err(invalid("nesting too deep"));
        }
        self.depth += 1;
        let value = self.parse_typed();
        self.depth -= 1;
        value
    }

    fn parse_typed(&mut self) -> io::Result<IonValue> {
        let type_byte = self.read_bytes(1)?[0];
        let type_code = type_byte >> 4;
        let length_code = type_byte & 0x0f;

        let Some(ion_type) = IonType::from_nibble(type_code) else {
            return Err(invalid("reserved Ion type code"));
        };

        // Null is encoded as length_code 15 for any type
        if length_code == 15 {
            return match ion_type {
                IonType::Annotation => Err(invalid("invalid annotation wrapper")),
                _ => Ok(IonValue::Null),
            };
        }

        if ion_type == IonType::Bool {
            return match length_code {
                0 => Ok(IonValue::Bool(false)),
                1 => Ok(IonValue::Bool(true)),
                _ => Err(invalid("invalid bool length")),
            };
        }

        // Get actual length; struct length code 1 is the sorted form with a VarUInt length
        let length = match (ion_type, length_code) {
            (_, 14) | (IonType::Struct, 1) => self.read_varuint()? as usize,
            (_, n) => n as usize,
        };

        match ion_type {
            IonType::Null => Err(invalid("NOP padding in value position")),

            IonType::Bool => Err(invalid("invalid bool length")),

            IonType::PosInt => {
                let value = self.read_uint(length)?;
                i64::try_from(value)
                    .map(IonValue::Int)
                    .map_err(|_| invalid("positive integer too large for i64"))
            }

            IonType::NegInt => {
                let value = self.read_uint(length)?;
                if value == 0 {
                    return Err(invalid("negative zero integer"));
                }
                // i64::MIN has magnitude 2^63, which fits in u64 but not as positive i64.
                if value > (i64::MAX as u64) + 1 {
                    return Err(invalid("negative integer too large for i64"));
                }
                Ok(IonValue::Int((value as i64).wrapping_neg()))
            }

            IonType::Float => {
                let value = match length {
                    0 => 0.0, // Positive zero
                    4 => {
                        let mut bytes = [0u8; 4];
                        bytes.copy_from_slice(self.read_bytes(4)?);
                        f32::from_be_bytes(bytes) as f64
                    }
                    8 => {
                        let mut bytes = [0u8; 8];
                        bytes.copy_from_slice(self.read_bytes(8)?);
                        f64::from_be_bytes(bytes)
                    }
                    _ => return Err(invalid("invalid float length")),
                };
                Ok(IonValue::Float(value))
            }

            IonType::Decimal => Ok(IonValue::Decimal(self.read_bytes(length)?.to_vec())),

            IonType::Timestamp => Ok(IonValue::Timestamp(self.read_bytes(length)?.to_vec())),

            IonType::Symbol => Ok(IonValue::Symbol(self.read_uint(length)?)),

            IonType::String => {
                let bytes = self.read_bytes(length)?;
                let s = std::str::from_utf8(bytes)
                    .map_err(|_| invalid("string is not valid UTF-8"))?;
                Ok(IonValue::String(s.to_string()))
            }

            IonType::Clob => Ok(IonValue::Clob(self.read_bytes(length)?.to_vec())),

            IonType::Blob => Ok(IonValue::Blob(self.read_bytes(length)?.to_vec())),

            IonType::List => Ok(IonValue::List(self.parse_sequence(length)?)),

            IonType::Sexp => Ok(IonValue::Sexp(self.parse_sequence(length)?)),

            IonType::Struct => {
                let end = self.container_end(length)?;
                let mut fields = Vec::new();
                while self.pos < end {
                    let field_name = self.read_varuint()?;
                    if self.pos >= end {
                        return Err(invalid("struct field without value"));
                    }
                    // A padded field's name is ignored together with the padding
                    if self.skip_pad()? {
                        continue;
                    }
                    fields.push((field_name, self.parse_value()?));
                }
                self.expect_end(end)?;
                Ok(IonValue::Struct(fields))
            }

            IonType::Annotation => {
                let end = self.container_end(length)?;

                let ann_len = self.read_varuint()? as usize;
                let ann_end = self.container_end(ann_len)?;
                if ann_len == 0 || ann_end >= end {
                    return Err(invalid("annotation wrapper without value"));
                }

                let mut annotations = Vec::new();
                while self.pos < ann_end {
                    annotations.push(self.read_varuint()?);
                }

                let inner = self.parse_value()?;
                if matches!(inner, IonValue::Annotated(..)) {
                    return Err(invalid("nested annotation wrapper"));
                }
                self.expect_end(end)?;

                Ok(IonValue::Annotated(annotations, Box::new(inner)))
            }
        }
    }

    fn parse_sequence(&mut self, length: usize) -> io::Result<Vec<IonValue>> {
        let end = self.container_end(length)?;
        let mut items = Vec::new();
        while self.pos < end {
            self.skip_padding()?;
            if self.pos >= end {
                break;
            }
            items.push(self.parse_value()?);
        }
        self.expect_end(end)?;
        Ok(items)
    }

    fn container_end(&self, length: usize) -> io::Result<usize> {
        match self.pos.checked_add(length) {
            Some(end) if end <= self.data.len() => Ok(end),
            _ => Err(eof()),
        }
    }

    fn expect_end(&self, end: usize) -> io::Result<()> {
        if self.pos != end {
            return Err(invalid("value overruns its container"));
        }
        Ok(())
    }

    /// Read bytes from current position.
    #[inline]
    fn read_bytes(&mut self, len: usize) -> io::Result<&'a [u8]> {
        let end = self.container_end(len)?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    /// Read a VarUInt (7 bits per byte, MSB set on last byte).
    #[inline]
    fn read_varuint(&mut self) -> io::Result<u64> {
        let mut result: u64 = 0;
        loop {
            let byte = self.read_bytes(1)?[0];
            if result >> 57 != 0 {
                return Err(invalid("VarUInt too large"));
            }
            result = (result << 7) | (byte & 0x7f) as u64;
            if byte & 0x80 != 0 {
                return Ok(result);
            }
        }
    }

    /// Read unsigned integer (big-endian, up to 8 bytes).
    #[inline]
    fn read_uint(&mut self, len: usize) -> io::Result<u64> {
        if len > 8 {
            return Err(invalid("integer too large (> 8 bytes)"));
        }
        let bytes = self.read_bytes(len)?;
        Ok(bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64))
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

fn eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "unexpected end of data")
}

// =============================================================================
// Symbol tables
// =============================================================================

/// A shared table imported by a local symbol table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedTable {
    pub name: String,
    pub version: i64,
    pub max_id: u64,
}

impl ImportedTable {
    pub fn system() -> Self {
        Self {
            name: system::TABLE_NAME.to_string(),
            version: 1,
            max_id: system::MAX_SYMBOL_ID,
        }
    }
}

/// Symbol table in effect while reading an Ion stream.
///
/// The system table is always the first import. Shared tables are known only
/// by name and size, so their symbols have no text beyond `$<sid>`.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolTable {
    imports: Vec<ImportedTable>,
    symbols: Vec<Option<String>>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::system()
    }
}

impl SymbolTable {
    pub fn system() -> Self {
        Self {
            imports: vec![ImportedTable::system()],
            symbols: Vec::new(),
        }
    }

    pub fn imports(&self) -> &[ImportedTable] {
        &self.imports
    }

    /// Local symbols declared by the table itself.
    pub fn local_symbols(&self) -> &[Option<String>] {
        &self.symbols
    }

    /// Highest id covered by the imports.
    pub fn shared_max_id(&self) -> u64 {
        self.imports.iter().map(|t| t.max_id).sum()
    }

    /// Highest id defined by this table.
    pub fn max_id(&self) -> u64 {
        self.shared_max_id() + self.symbols.len() as u64
    }

    /// Text of a symbol id in KFX notation.
    ///
    /// Imported ids have no text of their own and render as `$<sid>`, which is
    /// how KFX names shared-table symbols. Local ids resolve to their declared
    /// text. Returns `None` for `$0`, ids past the table and local symbols
    /// declared without text.
    pub fn text(&self, sid: u64) -> Option<String> {
        if sid == 0 || sid > self.max_id() {
            return None;
        }
        let shared = self.shared_max_id();
        if sid <= shared {
            return Some(format!("${sid}"));
        }
        self.symbols[(sid - shared - 1) as usize].clone()
    }

    /// Build the table described by a `$ion_symbol_table` struct.
    ///
    /// `current` is the table in effect, used when the struct appends to it.
    fn from_struct(value: &IonValue, current: &SymbolTable) -> io::Result<Self> {
        let mut table = SymbolTable::system();

        match value.get(system::IMPORTS) {
            Some(IonValue::Symbol(system::ION_SYMBOL_TABLE)) => {
                table = current.clone();
            }
            Some(IonValue::List(imports)) => {
                for import in imports {
                    let Some(name) = import.get(system::NAME).and_then(IonValue::as_string) else {
                        continue;
                    };
                    if name == system::TABLE_NAME {
                        continue;
                    }
                    let version = import
                        .get(system::VERSION)
                        .and_then(IonValue::as_int)
                        .filter(|v| *v > 0)
                        .unwrap_or(1);
                    let max_id = import
                        .get(system::MAX_ID)
                        .and_then(IonValue::as_int)
                        .and_then(|v| u64::try_from(v).ok())
                        .ok_or_else(|| {
                            invalid(&format!("import {name} does not declare max_id"))
                        })?;
                    table.imports.push(ImportedTable {
                        name: name.to_string(),
                        version,
                        max_id,
                    });
                }
            }
            _ => {}
        }

        if let Some(IonValue::List(symbols)) = value.get(system::SYMBOLS) {
            table
                .symbols
                .extend(symbols.iter().map(|s| s.as_string().map(str::to_string)));
        }

        Ok(table)
    }
}

impl fmt::Display for SymbolTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "$ion_symbol_table::{{imports:[")?;
        for (i, import) in self.imports.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(
                f,
                "{{name:\"{}\",version:{},max_id:{}}}",
                import.name, import.version, import.max_id
            )?;
        }
        write!(f, "],symbols:{},max_id:{}}}", self.symbols.len(), self.max_id())
    }
}

// =============================================================================
// Stream reader
// =============================================================================

/// Reader over a top-level Ion stream.
///
/// System values (version markers and local symbol tables) are consumed and
/// update [`IonReader::symbol_table`]; user values are returned by
/// [`IonReader::next`].
pub struct IonReader<'a> {
    parser: IonParser<'a>,
    symbols: Cow<'a, SymbolTable>,
}

impl<'a> IonReader<'a> {
    /// Reader over a complete stream, which must start with a BVM.
    pub fn new(data: &'a [u8]) -> io::Result<Self> {
        if !data.starts_with(&ION_MAGIC) {
            return Err(invalid("not Ion data (missing BVM)"));
        }
        Ok(Self {
            parser: IonParser::new(data),
            symbols: Cow::Owned(SymbolTable::system()),
        })
    }

    /// Reader over a stream body decoded under an already established table.
    pub fn resume(data: &'a [u8], symbols: &'a SymbolTable) -> Self {
        Self {
            parser: IonParser::new(data),
            symbols: Cow::Borrowed(symbols),
        }
    }

    pub fn symbol_table(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn into_symbol_table(self) -> SymbolTable {
        self.symbols.into_owned()
    }

    /// Next user value, or `None` at the end of the stream.
    pub fn next(&mut self) -> io::Result<Option<IonValue>> {
        loop {
            self.parser.skip_padding()?;
            if self.parser.at_end() {
                return Ok(None);
            }
            if self.parser.at_bvm() {
                self.parser.pos += ION_MAGIC.len();
                self.symbols = Cow::Owned(SymbolTable::system());
                continue;
            }
            let value = self.parser.parse_value()?;
            if let IonValue::Annotated(annotations, inner) = &value
                && annotations.first() == Some(&system::ION_SYMBOL_TABLE)
                && matches!(**inner, IonValue::Struct(_))
            {
                self.symbols = Cow::Owned(SymbolTable::from_struct(inner, &self.symbols)?);
                continue;
            }
            return Ok(Some(value));
        }
    }
}

// =============================================================================
// Writer
// =============================================================================

/// Ion binary writer.
#[derive(Debug, Default)]
pub struct IonWriter {
    buf: Vec<u8>,
}

impl IonWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_bvm(&mut self) {
        self.buf.extend_from_slice(&ION_MAGIC);
    }

    pub fn write_value(&mut self, value: &IonValue) {
        match value {
            IonValue::Null => self.buf.push(0x0f),
            IonValue::Bool(b) => self.buf.push(0x10 | *b as u8),
            IonValue::Int(n) => {
                let code = if *n < 0 { 0x30 } else { 0x20 };
                self.write_typed(code, &uint_bytes(n.unsigned_abs()));
            }
            IonValue::Float(f) => self.write_typed(0x40, &f.to_be_bytes()),
            IonValue::Decimal(bytes) => self.write_typed(0x50, bytes),
            IonValue::Timestamp(bytes) => self.write_typed(0x60, bytes),
            IonValue::Symbol(sid) => self.write_typed(0x70, &uint_bytes(*sid)),
            IonValue::String(s) => self.write_typed(0x80, s.as_bytes()),
            IonValue::Clob(bytes) => self.write_typed(0x90, bytes),
            IonValue::Blob(bytes) => self.write_typed(0xa0, bytes),
            IonValue::List(items) => self.write_sequence(0xb0, items),
            IonValue::Sexp(items) => self.write_sequence(0xc0, items),
            IonValue::Struct(fields) => {
                let mut body = IonWriter::new();
                for (name, value) in fields {
                    write_varuint(&mut body.buf, *name);
                    body.write_value(value);
                }
                self.write_typed(0xd0, &body.buf);
            }
            IonValue::Annotated(annotations, inner) => {
                let mut ids = Vec::new();
                for id in annotations {
                    write_varuint(&mut ids, *id);
                }
                let mut body = Vec::new();
                write_varuint(&mut body, ids.len() as u64);
                body.extend_from_slice(&ids);
                let mut value = IonWriter::new();
                value.write_value(inner);
                body.extend_from_slice(&value.buf);
                self.write_typed(0xe0, &body);
            }
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn write_sequence(&mut self, code: u8, items: &[IonValue]) {
        let mut body = IonWriter::new();
        for item in items {
            body.write_value(item);
        }
        self.write_typed(code, &body.buf);
    }

    fn write_typed(&mut self, code: u8, body: &[u8]) {
        // Struct length code 1 means "sorted"; never emit it for a plain length
        if body.len() < 14 && !(code == 0xd0 && body.len() == 1) {
            self.buf.push(code | body.len() as u8);
        } else {
            self.buf.push(code | 14);
            write_varuint(&mut self.buf, body.len() as u64);
        }
        self.buf.extend_from_slice(body);
    }
}

/// Minimal big-endian magnitude bytes (empty for zero).
fn uint_bytes(n: u64) -> Vec<u8> {
    let bytes = n.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    bytes[skip..].to_vec()
}

fn write_varuint(buf: &mut Vec<u8>, mut n: u64) {
    let mut groups = vec![(n & 0x7f) as u8 | 0x80];
    n >>= 7;
    while n > 0 {
        groups.push((n & 0x7f) as u8);
        n >>= 7;
    }
    buf.extend(groups.iter().rev());
}

/// Encode a single value as a complete stream (BVM + value).
pub fn to_binary(value: &IonValue) -> Vec<u8> {
    let mut writer = IonWriter::new();
    writer.write_bvm();
    writer.write_value(value);
    writer.into_bytes()
}
