// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

pub mod args;
pub mod codec;
pub mod completion;
pub mod edit;
pub mod ffs;
pub mod image;
