// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::collections::BTreeMap;

use serde::Serialize;

use crate::{
    format::{Node, Visitor},
    visitors::Result,
};

/// Number of nodes per node type, file type and section type.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Count {
    pub firmware_types: BTreeMap<String, usize>,
    pub file_types: BTreeMap<String, usize>,
    pub section_types: BTreeMap<String, usize>,
}

impl Visitor for Count {
    fn visit(&mut self, mut node: Node<'_>) -> Result<()> {
        *self.firmware_types.entry(node.type_name().to_owned()).or_default() += 1;

        match &node {
            Node::File(f) => {
                *self.file_types.entry(f.file_type.to_string()).or_default() += 1;
            }
            Node::Section(s) => {
                *self.section_types.entry(s.section_type.to_string()).or_default() += 1;
            }
            _ => {}
        }

        node.apply_children(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        format::{
            Firmware,
            file::{File, FileType},
            section::{Section, SectionType},
        },
        guid::Guid,
    };

    #[test]
    fn counts_nested_nodes() {
        let sections = vec![
            Section::new_ui("Shell").unwrap(),
            Section::new_leaf(SectionType::PE32, &[0; 16]).unwrap(),
        ];
        let file = File::new(Guid([1; 16]), FileType::APPLICATION, sections, 0xff).unwrap();

        let mut count = Count::default();
        Firmware::File(file).apply(&mut count).unwrap();

        assert_eq!(count.firmware_types["File"], 1);
        assert_eq!(count.firmware_types["Section"], 2);
        assert_eq!(count.file_types.len(), 1);
        assert_eq!(count.section_types["USER_INTERFACE"], 1);
        assert_eq!(count.section_types["PE32"], 1);
    }
}
