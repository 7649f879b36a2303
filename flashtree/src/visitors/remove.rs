// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use tracing::{debug, info};

use crate::{
    format::{Firmware, Node, Visitor, file::File},
    visitors::{
        Error, Result,
        find::{Predicate, file_matches},
    },
};

/// Remove matching files from their volumes.
#[derive(Debug)]
pub struct Remove {
    predicate: Predicate,
    /// Replace removed files with pad files of the same size so that the
    /// remaining files keep their offsets.
    pad: bool,
    /// Invert the predicate: remove every file that does not match.
    keep_matching: bool,
    pub removed: usize,
}

impl Remove {
    pub fn new(predicate: Predicate, pad: bool) -> Self {
        Self {
            predicate,
            pad,
            keep_matching: false,
            removed: 0,
        }
    }

    /// Remove every non-pad file that does not match `keep`.
    pub fn all_except(keep: Predicate) -> Self {
        Self {
            keep_matching: true,
            ..Self::new(keep, false)
        }
    }

    /// Apply to `fw` and fail if nothing was removed.
    pub fn run(&mut self, fw: &mut Firmware) -> Result<()> {
        fw.apply(self)?;

        if self.removed == 0 && !self.keep_matching {
            return Err(Error::NoMatch { op: "remove" });
        }

        info!("Removed {} files", self.removed);

        Ok(())
    }

    fn should_remove(&self, file: &mut File) -> bool {
        if self.keep_matching {
            !file.is_pad() && !file_matches(file, &self.predicate)
        } else {
            file_matches(file, &self.predicate)
        }
    }
}

impl Visitor for Remove {
    fn visit(&mut self, mut node: Node<'_>) -> Result<()> {
        if let Node::FirmwareVolume(fv) = &mut node {
            let polarity = fv.polarity();
            let files = std::mem::take(&mut fv.files);
            let before = files.len();

            for mut file in files {
                if !self.should_remove(&mut file) {
                    fv.files.push(file);
                    continue;
                }

                debug!("Removing file {} ({:?})", file.guid, file.name());
                self.removed += 1;

                if self.pad {
                    fv.files.push(File::new_pad(file.buf.len() as u64, polarity)?);
                }
            }

            // Assembly leaves volumes without files untouched.
            if fv.files.is_empty() && before > 0 {
                let start = (fv.data_offset as usize).min(fv.buf.len());
                fv.buf[start..].fill(polarity);
                fv.free_space = (fv.buf.len() - start) as u64;
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
        visitors::Assemble,
    };

    fn volume(names: &[&str]) -> Firmware {
        let mut fv = FirmwareVolume::new_empty(0x2000, Guid([0x10; 16]), 0xff).unwrap();
        for (i, name) in names.iter().enumerate() {
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

    fn names(fw: &Firmware) -> Vec<String> {
        let Firmware::FirmwareVolume(fv) = fw else {
            unreachable!();
        };
        fv.files
            .iter()
            .map(|f| f.name().unwrap_or("<pad>").to_owned())
            .collect()
    }

    #[test]
    fn remove_by_name() {
        let mut fw = volume(&["A", "B", "C"]);
        Remove::new(Predicate::by_name("B").unwrap(), false).run(&mut fw).unwrap();
        fw.apply(&mut Assemble::new()).unwrap();

        assert_eq!(names(&fw), ["A", "C"]);
        assert_eq!(fw.buf().len(), 0x2000);
    }

    #[test]
    fn remove_with_pad_keeps_offsets() {
        let mut fw = volume(&["A", "B", "C"]);
        let Firmware::FirmwareVolume(fv) = &fw else {
            unreachable!();
        };
        let c_offset = fv.buf.len() - fv.free_space as usize - fv.files[2].buf.len();

        Remove::new(Predicate::by_name("B").unwrap(), true).run(&mut fw).unwrap();
        fw.apply(&mut Assemble::new()).unwrap();

        assert_eq!(names(&fw), ["A", "<pad>", "C"]);
        let Firmware::FirmwareVolume(fv) = &fw else {
            unreachable!();
        };
        let c = &fv.files[2].buf;
        assert_eq!(&fv.buf[c_offset..c_offset + c.len()], c.as_slice());
    }

    #[test]
    fn remove_all_except() {
        let mut fw = volume(&["A", "B", "C"]);
        let keep = Predicate::by_name("A|C").unwrap();
        Remove::all_except(keep).run(&mut fw).unwrap();

        assert_eq!(names(&fw), ["A", "C"]);
    }

    #[test]
    fn no_match() {
        let mut fw = volume(&["A"]);
        assert_matches!(
            Remove::new(Predicate::by_name("Z").unwrap(), false).run(&mut fw),
            Err(Error::NoMatch { op: "remove" })
        );
    }
}
