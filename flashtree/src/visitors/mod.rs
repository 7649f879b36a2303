// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Operations over the node tree. Each operation is a [`Visitor`] that the
//! caller applies to the root with [`Firmware::apply`].
//!
//! [`Visitor`]: crate::format::Visitor
//! [`Firmware::apply`]: crate::format::Firmware::apply

use std::io;

use thiserror::Error;

use crate::format::{self, descriptor::FlashRegionType};

pub mod assemble;
pub mod buffers;
pub mod count;
pub mod create_fv;
pub mod find;
pub mod flatten;
pub mod insert;
pub mod nvram_compact;
pub mod offsets;
pub mod remove;
pub mod repack;
pub mod replace;
pub mod tighten_me;
pub mod validate;

pub use assemble::Assemble;
pub use buffers::{AttachBuffers, ExtractBuffers};
pub use count::Count;
pub use create_fv::CreateFv;
pub use find::{Find, Predicate};
pub use flatten::Flatten;
pub use insert::{Insert, Preposition};
pub use nvram_compact::NVarCompact;
pub use offsets::SetOffsets;
pub use remove::Remove;
pub use repack::Repack;
pub use replace::ReplaceSection;
pub use tighten_me::TightenMe;
pub use validate::Validate;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{op}: No node matched")]
    NoMatch { op: &'static str },
    #[error("{op}: Expected exactly one match, but found {count}")]
    AmbiguousMatch { op: &'static str, count: usize },
    #[error("{what}: Need {needed:#x} bytes, but only {available:#x} are available")]
    InsufficientSpace {
        what: String,
        needed: u64,
        available: u64,
    },
    #[error("Non-contiguous layout: {0}")]
    NonContiguousLayout(String),
    #[error("Image has no {0} region")]
    MissingRegion(FlashRegionType),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid pattern")]
    Regex(#[from] regex::Error),
    #[error("Firmware format error")]
    Format(#[from] format::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Require exactly one match for operation `op`.
pub(crate) fn expect_one(op: &'static str, count: usize) -> Result<()> {
    match count {
        0 => Err(Error::NoMatch { op }),
        1 => Ok(()),
        count => Err(Error::AmbiguousMatch { op, count }),
    }
}
