// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

use crate::guid;

pub mod compression;
pub mod depex;
pub mod descriptor;
pub mod file;
pub mod firmware;
pub mod flash;
pub mod me;
pub mod nvram;
pub mod padding;
pub mod region;
pub mod section;
pub mod volume;

pub use firmware::{Context, Firmware, Node, Visitor, parse};

/// Errors produced while decoding or encoding individual structures.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{what}: {reason} (data: {context})")]
    MalformedHeader {
        what: &'static str,
        reason: String,
        context: String,
    },
    #[error("{what}: Need {needed} bytes, but only {available} are available")]
    TruncatedBuffer {
        what: &'static str,
        needed: u64,
        available: u64,
    },
    #[error("{what}: Unsupported variant: {detail}")]
    UnsupportedVariant { what: &'static str, detail: String },
    #[error("{what}: Size {size:#x} exceeds the field's range")]
    SizeTooLarge { what: &'static str, size: u64 },
    #[error("{what}: Need {needed:#x} bytes, but only {available:#x} are available")]
    InsufficientSpace {
        what: &'static str,
        needed: u64,
        available: u64,
    },
    #[error("Non-contiguous layout: {0}")]
    NonContiguousLayout(String),
    #[error("Overlapping regions: {0} overlaps with the previous region")]
    OverlappingRegions(descriptor::FlashRegionType),
    #[error("Erase polarity mismatch: image uses {expected:#04x}, but volume uses {actual:#04x}")]
    PolarityMismatch { expected: u8, actual: u8 },
    #[error("Depex opcode {0} should not have nil guid")]
    DepExMissingGuid(depex::DepExOpCode),
    #[error("Depex opcode {0} should not have a guid")]
    DepExUnexpectedGuid(depex::DepExOpCode),
    #[error("Unknown depex opcode: {0:#04x}")]
    DepExUnknownOpcode(u8),
    #[error("Depex ended without an END opcode")]
    DepExMissingEnd,
    #[error("Empty dependency expression")]
    DepExEmpty,
    #[error(transparent)]
    Guid(#[from] guid::Error),
    #[error("Codec failure")]
    Codec(#[from] compression::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn malformed(what: &'static str, reason: impl Into<String>, buf: &[u8]) -> Self {
        Self::MalformedHeader {
            what,
            reason: reason.into(),
            context: crate::util::context(buf),
        }
    }

    pub(crate) fn truncated(what: &'static str, needed: usize, available: usize) -> Self {
        Self::TruncatedBuffer {
            what,
            needed: needed as u64,
            available: available as u64,
        }
    }
}
