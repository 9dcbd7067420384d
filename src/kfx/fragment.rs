//! KFX fragment representation.
//!
//! A fragment is the fundamental unit of KFX content: a type symbol, an id
//! symbol and an opaque payload (Ion for structured content, raw bytes for
//! media).

use super::symbols::SymbolToken;

pub const DEFAULT_FRAGMENT_VERSION: i32 = 1;
/// No compression
pub const DEFAULT_COMPRESSION: i32 = 0;
/// No DRM
pub const DEFAULT_DRM_SCHEME: i32 = 0;

/// A decoded fragment, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    version: i32,
    compression: i32,
    drm: i32,
    ftype: SymbolToken,
    fid: SymbolToken,
    data: Vec<u8>,
}

impl Fragment {
    pub fn new(ftype: SymbolToken, fid: SymbolToken, data: Vec<u8>) -> Self {
        Self {
            version: DEFAULT_FRAGMENT_VERSION,
            compression: DEFAULT_COMPRESSION,
            drm: DEFAULT_DRM_SCHEME,
            ftype,
            fid,
            data,
        }
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn compression(&self) -> i32 {
        self.compression
    }

    pub fn drm(&self) -> i32 {
        self.drm
    }

    /// Fragment type (e.g. `$260` section, `$417` raw media)
    pub fn ftype(&self) -> &SymbolToken {
        &self.ftype
    }

    pub fn fid(&self) -> &SymbolToken {
        &self.fid
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}
