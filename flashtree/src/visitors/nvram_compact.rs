// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use tracing::debug;

use crate::{
    format::{Node, Visitor},
    visitors::Result,
};

/// Collapse every NVAR store to the latest value of each variable.
#[derive(Clone, Copy, Debug, Default)]
pub struct NVarCompact {
    pub stores: usize,
    pub removed: usize,
}

impl Visitor for NVarCompact {
    fn visit(&mut self, mut node: Node<'_>) -> Result<()> {
        node.apply_children(self)?;

        if let Node::NVarStore(store) = node {
            for entry in &mut store.entries {
                entry.assemble()?;
            }

            let before = store.entries.len();
            store.compact()?;

            debug!("Compacted NVAR store from {before} to {} entries", store.entries.len());
            self.stores += 1;
            self.removed += before.saturating_sub(store.entries.len());
        }

        Ok(())
    }
}
