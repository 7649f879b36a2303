// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, sync::Arc};

use regex::Regex;

use crate::{
    format::{
        Firmware, Node, Visitor,
        file::{File, FileType},
        section::{Section, SectionType},
    },
    guid::Guid,
    visitors::Result,
};

/// A composable test over nodes.
#[derive(Clone)]
pub struct Predicate(Arc<dyn Fn(&Node<'_>) -> bool + Send + Sync>);

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Predicate").finish_non_exhaustive()
    }
}

impl Predicate {
    pub fn new(f: impl Fn(&Node<'_>) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn matches(&self, node: &Node<'_>) -> bool {
        (self.0)(node)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Self::new(move |n| !self.matches(n))
    }

    pub fn and(self, other: Self) -> Self {
        Self::new(move |n| self.matches(n) && other.matches(n))
    }

    /// Files with the given name GUID.
    pub fn by_guid(guid: Guid) -> Self {
        Self::new(move |n| matches!(n, Node::File(f) if f.guid == guid))
    }

    pub fn by_file_type(file_type: FileType) -> Self {
        Self::new(move |n| matches!(n, Node::File(f) if f.file_type == file_type))
    }

    /// Files whose GUID or user interface name fully matches `pattern`.
    pub fn by_name(pattern: &str) -> Result<Self> {
        let re = anchored(pattern)?;

        Ok(Self::new(move |n| match n {
            Node::File(f) => re.is_match(&f.guid.to_string()),
            Node::Section(s) => ui_name_matches(&re, s),
            _ => false,
        }))
    }

    /// Like [`Self::by_name`], but also matching volumes by their name GUID.
    pub fn by_volume_or_name(pattern: &str) -> Result<Self> {
        let re = anchored(pattern)?;

        Ok(Self::new(move |n| match n {
            Node::FirmwareVolume(fv) => fv.fv_name.is_some_and(|g| re.is_match(&g.to_string())),
            Node::File(f) => re.is_match(&f.guid.to_string()),
            Node::Section(s) => ui_name_matches(&re, s),
            _ => false,
        }))
    }
}

fn anchored(pattern: &str) -> Result<Regex> {
    Ok(Regex::new(&format!("^(?:{pattern})$"))?)
}

fn ui_name_matches(re: &Regex, section: &Section) -> bool {
    section.section_type == SectionType::USER_INTERFACE
        && section.name.as_deref().is_some_and(|n| re.is_match(n))
}

/// Whether the file itself or one of its sections (outside nested volumes)
/// matches. A file and its user interface section are a single unit.
pub fn file_matches(file: &mut File, predicate: &Predicate) -> bool {
    fn any_section(sections: &mut [Section], predicate: &Predicate) -> bool {
        sections.iter_mut().any(|s| {
            predicate.matches(&Node::Section(s)) || any_section(&mut s.encapsulated, predicate)
        })
    }

    predicate.matches(&Node::File(file)) || any_section(&mut file.sections, predicate)
}

/// Collect copies of every matching node. Matching sections report their
/// enclosing file instead.
#[derive(Debug)]
pub struct Find {
    predicate: Predicate,
    pub matches: Vec<Firmware>,
    in_file: bool,
    file_hit: bool,
}

impl Find {
    pub fn new(predicate: Predicate) -> Self {
        Self {
            predicate,
            matches: vec![],
            in_file: false,
            file_hit: false,
        }
    }
}

impl Visitor for Find {
    fn visit(&mut self, mut node: Node<'_>) -> Result<()> {
        let hit = self.predicate.matches(&node);

        if matches!(node, Node::File(_)) {
            let mut inner = Self {
                in_file: true,
                ..Self::new(self.predicate.clone())
            };
            node.apply_children(&mut inner)?;

            if hit || inner.file_hit {
                self.matches.push(node.to_firmware());
            }
            self.matches.extend(inner.matches);

            return Ok(());
        }

        if self.in_file && matches!(node, Node::Section(_)) {
            self.file_hit |= hit;
        } else if hit {
            self.matches.push(node.to_firmware());
        }

        node.apply_children(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::volume::FirmwareVolume;

    fn volume() -> Firmware {
        let mut fv = FirmwareVolume::new_empty(0x2000, Guid([0x10; 16]), 0xff).unwrap();
        for (i, name) in ["Shell", "Setup"].into_iter().enumerate() {
            let sections = vec![
                Section::new_leaf(SectionType::PE32, &[0u8; 8]).unwrap(),
                Section::new_ui(name).unwrap(),
            ];
            let file = File::new(Guid([i as u8 + 1; 16]), FileType::DRIVER, sections, 0xff).unwrap();
            fv.files.push(file);
        }
        fv.assemble(false).unwrap();

        Firmware::FirmwareVolume(fv)
    }

    fn found(fw: &mut Firmware, predicate: Predicate) -> Vec<Firmware> {
        let mut find = Find::new(predicate);
        fw.apply(&mut find).unwrap();
        find.matches
    }

    #[test]
    fn name_match_returns_file() {
        let mut fw = volume();
        let matches = found(&mut fw, Predicate::by_name("Set.*").unwrap());

        assert_eq!(matches.len(), 1);
        let Firmware::File(f) = &matches[0] else {
            panic!("Expected file, got {}", matches[0].type_name());
        };
        assert_eq!(f.name(), Some("Setup"));
    }

    #[test]
    fn guid_and_name_agree() {
        let mut fw = volume();
        let guid = Guid([2; 16]);

        let by_guid = found(&mut fw, Predicate::by_guid(guid));
        let by_guid_str = found(&mut fw, Predicate::by_name(&guid.to_string()).unwrap());
        assert_eq!(by_guid.len(), 1);
        assert_eq!(by_guid_str.len(), 1);
    }

    #[test]
    fn pattern_is_anchored() {
        let mut fw = volume();
        assert!(found(&mut fw, Predicate::by_name("Shel").unwrap()).is_empty());
    }

    #[test]
    fn combinators() {
        let mut fw = volume();
        let drivers = Predicate::by_file_type(FileType::DRIVER);
        let shell = Predicate::by_guid(Guid([1; 16]));

        assert_eq!(found(&mut fw, drivers.clone()).len(), 2);
        assert_eq!(found(&mut fw, drivers.and(shell.not())).len(), 1);
    }

    #[test]
    fn file_unit_matching() {
        let Firmware::FirmwareVolume(mut fv) = volume() else {
            unreachable!();
        };
        let p = Predicate::by_name("Shell").unwrap();

        assert!(file_matches(&mut fv.files[0], &p));
        assert!(!file_matches(&mut fv.files[1], &p));
    }
}
