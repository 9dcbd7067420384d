//! KFX building blocks.
//!
//! KFX is Amazon's latest Kindle format, successor to KF8/AZW3.
//! It uses Amazon's Ion binary format for structured data.
//!
//! ## Module structure
//!
//! - `ion` - Amazon Ion binary parser, writer and stream reader
//! - `symbols` - Symbol tokens and local symbol allocation
//! - `fragment` - KFX fragment representation

pub mod fragment;
pub mod ion;
pub mod symbols;
