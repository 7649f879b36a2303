// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use tracing::debug;

use crate::{
    format::{
        Firmware, Node, Visitor,
        section::{Section, SectionType},
    },
    visitors::{
        Error, Result, expect_one,
        find::{Predicate, file_matches},
    },
};

/// Replace the data of every section of one type inside exactly one matching
/// file. Parsed children of a replaced section are dropped.
#[derive(Debug)]
pub struct ReplaceSection {
    predicate: Predicate,
    section_type: SectionType,
    data: Vec<u8>,
    dry_run: bool,
    matches: usize,
    pub replaced: usize,
}

impl ReplaceSection {
    pub fn new(predicate: Predicate, section_type: SectionType, data: Vec<u8>) -> Self {
        Self {
            predicate,
            section_type,
            data,
            dry_run: false,
            matches: 0,
            replaced: 0,
        }
    }

    pub fn run(&mut self, fw: &mut Firmware) -> Result<()> {
        self.dry_run = true;
        self.matches = 0;
        fw.apply(self)?;
        expect_one("replace-section", self.matches)?;

        self.dry_run = false;
        fw.apply(self)?;

        if self.replaced == 0 {
            return Err(Error::NoMatch {
                op: "replace-section",
            });
        }

        Ok(())
    }

    fn replace_in(&mut self, sections: &mut [Section]) -> Result<()> {
        for section in sections {
            if section.section_type == self.section_type {
                debug!("Replacing {} section data", section.section_type);
                section.set_data(&self.data)?;
                self.replaced += 1;
            } else {
                self.replace_in(&mut section.encapsulated)?;
            }
        }

        Ok(())
    }
}

impl Visitor for ReplaceSection {
    fn visit(&mut self, mut node: Node<'_>) -> Result<()> {
        if let Node::File(file) = &mut node
            && file_matches(file, &self.predicate)
        {
            self.matches += 1;

            if !self.dry_run {
                return self.replace_in(&mut file.sections);
            }
        }

        node.apply_children(self)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        format::file::{File, FileType},
        guid::Guid,
        visitors::Assemble,
    };

    fn file(name: &str) -> File {
        let inner = vec![
            Section::new_leaf(SectionType::PE32, b"old code").unwrap(),
            Section::new_ui(name).unwrap(),
        ];
        let sections = vec![Section::new_guid_defined(Guid([0x77; 16]), inner).unwrap()];
        File::new(Guid([1; 16]), FileType::DRIVER, sections, 0xff).unwrap()
    }

    #[test]
    fn replaces_nested_section() {
        let mut fw = Firmware::File(file("Shell"));
        ReplaceSection::new(Predicate::by_name("Shell").unwrap(), SectionType::PE32, b"new".to_vec())
            .run(&mut fw)
            .unwrap();
        fw.apply(&mut Assemble::new()).unwrap();

        let Firmware::File(f) = &fw else {
            unreachable!();
        };
        let inner = &f.sections[0].encapsulated;
        assert_eq!(inner[0].data(), b"new");
        assert_eq!(f.name(), Some("Shell"));
        assert!(f.header_checksum_ok());
    }

    #[test]
    fn missing_section_type() {
        let mut fw = Firmware::File(file("Shell"));
        let result = ReplaceSection::new(Predicate::by_name("Shell").unwrap(), SectionType::TE, vec![])
            .run(&mut fw);

        assert_matches!(result, Err(Error::NoMatch { .. }));
    }
}
