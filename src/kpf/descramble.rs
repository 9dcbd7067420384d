//! Unscrambling of `book.kdf`.
//!
//! `book.kdf` is a SQLite database with obfuscation frames spliced in at
//! fixed positions:
//!
//! ```text
//! | signature + plain (1 KiB) | frame (1 KiB) | plain (1 MiB) | frame (1 KiB) | plain ... |
//! ```
//!
//! Each frame opens with a 4 byte fingerprint and a 5 byte header. Dropping
//! every frame yields the original database file.

use std::fs;
use std::path::Path;

use crate::error::{Error, Found, Result};

/// Plain bytes before the first frame.
pub const WRAPPER_OFFSET: usize = 0x400;
/// Size of one obfuscation frame.
pub const WRAPPER_LENGTH: usize = 0x400;
/// Plain bytes between two frames.
pub const WRAPPER_FRAME_LENGTH: usize = 0x100000;

pub const SIGNATURE: &[u8; 16] = b"SQLite format 3\x00";
pub const FINGERPRINT: &[u8; 4] = b"\xfa\x50\x0a\x5f";
pub const FRAME_HEADER: &[u8; 5] = b"\x01\x00\x00\x40\x20";

/// Remove obfuscation frames from a scrambled database image.
pub fn descramble(data: &[u8]) -> Result<Vec<u8>> {
    // The first frame must be present
    if data.len() <= SIGNATURE.len() || data.len() < WRAPPER_OFFSET + WRAPPER_LENGTH {
        return Err(Error::FileLength(data.len()));
    }
    if !data.starts_with(SIGNATURE) {
        return Err(Error::Signature {
            found: Found::from(&data[..SIGNATURE.len()]),
        });
    }

    let mut plain = Vec::with_capacity(data.len());
    let (mut prev, mut curr) = (0, WRAPPER_OFFSET);
    while curr + WRAPPER_LENGTH <= data.len() {
        check_frame(&data[curr..curr + WRAPPER_LENGTH], curr)?;
        plain.extend_from_slice(&data[prev..curr]);
        prev = curr + WRAPPER_LENGTH;
        curr = prev + WRAPPER_FRAME_LENGTH;
    }
    plain.extend_from_slice(&data[prev..]);

    Ok(plain)
}

fn check_frame(frame: &[u8], offset: usize) -> Result<()> {
    let (fingerprint, rest) = frame.split_at(FINGERPRINT.len());
    if fingerprint != FINGERPRINT {
        return Err(Error::Fingerprint {
            offset,
            found: Found::from(fingerprint),
        });
    }
    let header = &rest[..FRAME_HEADER.len()];
    if header != FRAME_HEADER {
        return Err(Error::FrameHeader {
            offset,
            found: Found::from(header),
        });
    }
    Ok(())
}

/// Unscramble `from` into a plain SQLite file at `to`.
pub fn descramble_file(from: &Path, to: &Path) -> Result<()> {
    let data = fs::read(from)?;
    let plain = descramble(&data)?;
    fs::write(to, plain)?;
    Ok(())
}

/// Insert obfuscation frames into a plain database image.
///
/// Inverse of [`descramble`]; frame filler past the header is zeroed. The
/// first frame is always written once `plain` reaches it.
pub fn scramble(plain: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; WRAPPER_LENGTH];
    frame[..FINGERPRINT.len()].copy_from_slice(FINGERPRINT);
    frame[FINGERPRINT.len()..FINGERPRINT.len() + FRAME_HEADER.len()].copy_from_slice(FRAME_HEADER);

    let head = plain.len().min(WRAPPER_OFFSET);
    let mut out = Vec::with_capacity(plain.len() + plain.len() / WRAPPER_FRAME_LENGTH * WRAPPER_LENGTH + WRAPPER_LENGTH);
    out.extend_from_slice(&plain[..head]);

    if head < WRAPPER_OFFSET {
        return out;
    }
    let mut pos = head;
    loop {
        let end = (pos + WRAPPER_FRAME_LENGTH).min(plain.len());
        out.extend_from_slice(&frame);
        out.extend_from_slice(&plain[pos..end]);
        pos = end;
        if pos == plain.len() {
            return out;
        }
    }
}
