//! KFX symbol tokens and local symbol management.
//!
//! KFX names shared vocabulary `$<sid>` after its id in the `YJ_symbols`
//! shared table; everything else (fragment ids, resource names) is a local
//! symbol allocated per book.

use std::collections::HashMap;
use std::fmt;

use crate::log_sink::LogSink;

/// Well-known symbol ids from the YJ_symbols shared table.
pub mod sym {
    /// $155 - id
    pub const ID: u64 = 155;
    /// $185 - position anchor element
    pub const POSITION_ID: u64 = 185;
    /// $417 - bcRawMedia, the fragment type of resources stored by path
    pub const RAW_MEDIA: u64 = 417;
    /// $598 - kfx_id
    pub const KFX_ID: u64 = 598;
    /// $608 - marker annotation trailing some fragment type annotations
    pub const FRAGMENT_MARKER: u64 = 608;
    /// $754 - referenced element
    pub const ELEMENT_REF: u64 = 754;

    /// Struct fields whose integer values are element ids.
    pub const ELEMENT_ID_FIELDS: [u64; 4] = [ID, POSITION_ID, KFX_ID, ELEMENT_REF];
}

/// A symbol's text together with its resolved id.
///
/// `sid` is `None` when the text could not be mapped to an id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolToken {
    pub text: String,
    pub sid: Option<u64>,
}

impl SymbolToken {
    pub fn new(text: impl Into<String>, sid: u64) -> Self {
        Self {
            text: text.into(),
            sid: Some(sid),
        }
    }

    pub fn unknown(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sid: None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.sid.is_none()
    }
}

impl fmt::Display for SymbolToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sid {
            Some(sid) => write!(f, "{}({sid})", self.text),
            None => write!(f, "{}(?)", self.text),
        }
    }
}

/// Parse a `$<digits>` literal reference.
///
/// The id is only meaningful while it stays within the shared table; that
/// bound depends on the YJ_symbols version and is not checked here.
pub fn parse_literal(text: &str) -> Option<u64> {
    let digits = text.strip_prefix('$')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Local symbols allocated while repacking one book.
#[derive(Debug, Clone, Default)]
pub struct LocalSymbols {
    /// Local symbols in allocation order
    symbols: Vec<String>,
    /// Map from symbol name to ID
    symbol_map: HashMap<String, u64>,
    /// First local ID (one past the shared tables)
    first_id: u64,
}

impl LocalSymbols {
    /// Start allocating local ids at `first_id`.
    pub fn new(first_id: u64) -> Self {
        Self {
            symbols: Vec::new(),
            symbol_map: HashMap::new(),
            first_id,
        }
    }

    /// Get or create a local symbol ID for a name.
    pub fn get_or_intern(&mut self, name: &str) -> u64 {
        if let Some(&id) = self.symbol_map.get(name) {
            return id;
        }

        let id = self.first_id + self.symbols.len() as u64;
        self.symbols.push(name.to_string());
        self.symbol_map.insert(name.to_string(), id);
        id
    }

    /// Get symbol ID without interning.
    pub fn get(&self, name: &str) -> Option<u64> {
        self.symbol_map.get(name).copied()
    }

    pub fn first_id(&self) -> u64 {
        self.first_id
    }

    /// Highest allocated id, or `first_id - 1` when nothing was allocated.
    pub fn max_id(&self) -> u64 {
        (self.first_id + self.symbols.len() as u64).saturating_sub(1)
    }

    /// Local symbols in allocation order, for the output `$ion_symbol_table`.
    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Create a token for `text`, allocating a local symbol when needed.
///
/// Plain names go through `symbols`; `$<digits>` is taken as a literal id.
/// Anything else starting with `$` cannot be resolved and is logged.
pub fn create_symbol_token(text: &str, symbols: &mut LocalSymbols, log: LogSink<'_>) -> SymbolToken {
    if !text.starts_with('$') {
        return SymbolToken::new(text, symbols.get_or_intern(text));
    }
    if let Some(sid) = parse_literal(text) {
        return SymbolToken::new(text, sid);
    }
    log.warn(format_args!("Unable to interpret ion symbol: {text}"));
    SymbolToken::unknown(text)
}

/// Create a token for a `$<digits>` literal without touching local symbols.
pub fn create_local_symbol_token(text: &str, log: LogSink<'_>) -> SymbolToken {
    match parse_literal(text) {
        Some(sid) => SymbolToken::new(text, sid),
        None => {
            // cannot parse symbol name - should never happen
            log.warn(format_args!("Unable to interpret local ion symbol: {text}"));
            SymbolToken::unknown(text)
        }
    }
}
