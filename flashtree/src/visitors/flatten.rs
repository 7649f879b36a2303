// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use serde::Serialize;

use crate::{
    format::{Node, Visitor},
    util::NumBytes,
    visitors::Result,
};

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FlatNode {
    /// Index of the parent in [`Flatten::nodes`].
    pub parent: Option<usize>,
    pub depth: usize,
    #[serde(rename = "Type")]
    pub type_name: &'static str,
    pub size: u64,
    pub summary: String,
}

/// Pre-order list of every node with a link to its parent.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Flatten {
    pub nodes: Vec<FlatNode>,
    #[serde(skip)]
    parent: Option<usize>,
    #[serde(skip)]
    depth: usize,
}

fn summary(node: &Node<'_>) -> String {
    match node {
        Node::FlashImage(n) => format!("{} regions", n.regions.len()),
        Node::FlashDescriptor(n) => format!("map at {:#x}", n.map_offset),
        Node::BiosRegion(n) => format!("at {:#x}, {} elements", n.region_offset, n.elements.len()),
        Node::BiosPadding(n) => format!("at {:#x}", n.offset),
        Node::MeRegion(n) => format!("at {:#x}, used {:#x}", n.region_offset, n.free_space_offset),
        Node::RawRegion(n) => format!("{} at {:#x}", n.region_type, n.region_offset),
        Node::FirmwareVolume(n) => {
            let label = crate::guid::volume_label(&n.file_system_guid)
                .map_or_else(|| n.file_system_guid.to_string(), str::to_owned);
            match n.fv_name {
                Some(name) => format!("{label} {name} at {:#x}", n.fv_offset),
                None => format!("{label} at {:#x}", n.fv_offset),
            }
        }
        Node::File(n) => match n.name() {
            Some(name) => format!("{} {} {name}", n.guid, n.file_type),
            None => format!("{} {}", n.guid, n.file_type),
        },
        Node::Section(n) => match (&n.name, &n.guid_defined) {
            (Some(name), _) => format!("{} {name:?}", n.section_type),
            (None, Some(g)) => format!("{} {}", n.section_type, g.guid),
            (None, None) => n.section_type.to_string(),
        },
        Node::NVarStore(n) => format!("{} entries", n.entries.len()),
        Node::NVar(n) => format!("{:?} {} {}", n.entry_type, n.guid, n.name),
    }
}

impl Visitor for Flatten {
    fn visit(&mut self, mut node: Node<'_>) -> Result<()> {
        let index = self.nodes.len();
        self.nodes.push(FlatNode {
            parent: self.parent,
            depth: self.depth,
            type_name: node.type_name(),
            size: node.buf().len() as u64,
            summary: summary(&node),
        });

        let (parent, depth) = (self.parent, self.depth);
        self.parent = Some(index);
        self.depth += 1;
        node.apply_children(self)?;
        self.parent = parent;
        self.depth = depth;

        Ok(())
    }
}

impl Flatten {
    /// One line per node, indented by depth.
    pub fn render(&self) -> String {
        let mut out = String::new();

        for node in &self.nodes {
            out.push_str(&format!(
                "{:indent$}{} [{:?}] {}\n",
                "",
                node.type_name,
                NumBytes(node.size),
                node.summary,
                indent = node.depth * 2,
            ));
        }

        out
    }
}
