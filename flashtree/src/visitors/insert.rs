// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    format::{Firmware, Node, Visitor, file::File},
    visitors::{
        Result, expect_one,
        find::{Predicate, file_matches},
    },
};

/// Where to put the new file relative to the target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Preposition {
    /// First file of the target volume.
    Front,
    /// Last file of the target volume.
    End,
    /// Directly before the target file.
    Before,
    /// Directly after the target file.
    After,
    /// In place of the target file.
    Replace,
}

impl Preposition {
    fn targets_volume(self) -> bool {
        matches!(self, Self::Front | Self::End)
    }
}

impl fmt::Display for Preposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Front => "front",
            Self::End => "end",
            Self::Before => "before",
            Self::After => "after",
            Self::Replace => "replace",
        })
    }
}

impl FromStr for Preposition {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "front" => Ok(Self::Front),
            "end" => Ok(Self::End),
            "before" => Ok(Self::Before),
            "after" => Ok(Self::After),
            "replace" => Ok(Self::Replace),
            _ => Err(format!("Unknown insert position: {s:?}")),
        }
    }
}

/// Insert a file relative to exactly one target. Front and end insertion
/// target a volume, the other prepositions target a file.
#[derive(Debug)]
pub struct Insert {
    file: File,
    preposition: Preposition,
    predicate: Predicate,
    /// Only count targets.
    dry_run: bool,
    matches: usize,
}

impl Insert {
    pub fn new(file: File, preposition: Preposition, predicate: Predicate) -> Self {
        Self {
            file,
            preposition,
            predicate,
            dry_run: false,
            matches: 0,
        }
    }

    pub fn run(&mut self, fw: &mut Firmware) -> Result<()> {
        self.dry_run = true;
        self.matches = 0;
        fw.apply(self)?;
        expect_one("insert", self.matches)?;

        self.dry_run = false;
        self.matches = 0;
        fw.apply(self)
    }
}

impl Visitor for Insert {
    fn visit(&mut self, mut node: Node<'_>) -> Result<()> {
        if !self.dry_run && self.matches > 0 {
            return Ok(());
        }

        if self.preposition.targets_volume() {
            if self.predicate.matches(&node)
                && let Node::FirmwareVolume(fv) = &mut node
            {
                self.matches += 1;

                if !self.dry_run {
                    debug!("Inserting file {} at {} of volume", self.file.guid, self.preposition);
                    let file = self.file.clone();
                    match self.preposition {
                        Preposition::Front => fv.files.insert(0, file),
                        _ => fv.files.push(file),
                    }
                    return Ok(());
                }
            }
        } else if let Node::FirmwareVolume(fv) = &mut node {
            let mut target = None;
            for (i, file) in fv.files.iter_mut().enumerate() {
                if file_matches(file, &self.predicate) {
                    self.matches += 1;
                    target.get_or_insert(i);
                }
            }

            if !self.dry_run && let Some(i) = target {
                debug!("Inserting file {} {} {}", self.file.guid, self.preposition, fv.files[i].guid);
                let file = self.file.clone();
                match self.preposition {
                    Preposition::Before => fv.files.insert(i, file),
                    Preposition::After => fv.files.insert(i + 1, file),
                    _ => fv.files[i] = file,
                }
                return Ok(());
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
        format::{
            file::FileType,
            section::{Section, SectionType},
            volume::FirmwareVolume,
        },
        guid::Guid,
        visitors::{Assemble, Error},
    };

    fn driver(i: u8, name: &str) -> File {
        let sections = vec![
            Section::new_leaf(SectionType::PE32, &[i; 8]).unwrap(),
            Section::new_ui(name).unwrap(),
        ];
        File::new(Guid([i; 16]), FileType::DRIVER, sections, 0xff).unwrap()
    }

    fn volume() -> Firmware {
        let mut fv = FirmwareVolume::new_empty(0x2000, Guid([0x10; 16]), 0xff).unwrap();
        fv.files = vec![driver(1, "A"), driver(2, "B")];
        fv.assemble(false).unwrap();
        Firmware::FirmwareVolume(fv)
    }

    fn names(fw: &Firmware) -> Vec<&str> {
        let Firmware::FirmwareVolume(fv) = fw else {
            unreachable!();
        };
        fv.files.iter().filter_map(File::name).collect()
    }

    #[test]
    fn relative_to_file() {
        let cases = [
            (Preposition::Before, vec!["A", "N", "B"]),
            (Preposition::After, vec!["A", "B", "N"]),
            (Preposition::Replace, vec!["A", "N"]),
        ];

        for (preposition, expected) in cases {
            let mut fw = volume();
            Insert::new(driver(9, "N"), preposition, Predicate::by_name("B").unwrap())
                .run(&mut fw)
                .unwrap();
            fw.apply(&mut Assemble::new()).unwrap();

            assert_eq!(names(&fw), expected, "{preposition}");
        }
    }

    #[test]
    fn relative_to_volume() {
        let any_volume = Predicate::new(|n| matches!(n, Node::FirmwareVolume(_)));

        let mut fw = volume();
        Insert::new(driver(9, "N"), Preposition::Front, any_volume.clone())
            .run(&mut fw)
            .unwrap();
        assert_eq!(names(&fw), ["N", "A", "B"]);

        let mut fw = volume();
        Insert::new(driver(9, "N"), Preposition::End, any_volume)
            .run(&mut fw)
            .unwrap();
        assert_eq!(names(&fw), ["A", "B", "N"]);
    }

    #[test]
    fn target_must_be_unique() {
        let mut fw = volume();
        let result = Insert::new(driver(9, "N"), Preposition::After, Predicate::by_name("A|B").unwrap())
            .run(&mut fw);

        assert_matches!(result, Err(Error::AmbiguousMatch { op: "insert", count: 2 }));
        assert_eq!(names(&fw), ["A", "B"]);
    }
}
