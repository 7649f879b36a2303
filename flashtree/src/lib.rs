// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

//! flashtree parses UEFI/Intel flash images into a typed tree, lets callers
//! edit that tree through visitors and reassembles a consistent image.
//!
//! The semver versioning covers the CLI only. All Rust APIs can change at any
//! time, even in patch releases.

pub mod cli;
pub mod format;
pub mod guid;
pub mod util;
pub mod visitors;
