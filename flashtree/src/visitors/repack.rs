// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use tracing::{debug, info};

use crate::{
    format::{
        Firmware, Node, Visitor,
        file::File,
        section::{GuidDefinedAttributes, Section},
        volume::FirmwareVolume,
    },
    guid,
    visitors::{
        Error, Result, expect_one,
        find::{Predicate, file_matches},
    },
};

/// Nested volumes only carry the low attribute bits. Alignment fields do not
/// apply to them.
const NESTED_ATTRIBUTES_MASK: u32 = 0xffff;

/// Turn a volume image file whose files are compressed one by one into a
/// file holding a single compressed volume of uncompressed files.
#[derive(Debug)]
pub struct Repack {
    predicate: Predicate,
    dry_run: bool,
    matches: usize,
    block_size: u32,
}

impl Repack {
    pub fn new(predicate: Predicate) -> Self {
        Self {
            predicate,
            dry_run: false,
            matches: 0,
            block_size: 0,
        }
    }

    pub fn run(&mut self, fw: &mut Firmware) -> Result<()> {
        self.dry_run = true;
        self.matches = 0;
        fw.apply(self)?;
        expect_one("repack", self.matches)?;

        self.dry_run = false;
        fw.apply(self)
    }

    fn repack(&self, file: &mut File) -> Result<()> {
        let index = file
            .sections
            .iter()
            .position(|s| find_volume(s).is_some())
            .ok_or_else(|| Error::InvalidArgument(format!("File {} has no volume image", file.guid)))?;

        let section = file.sections.remove(index);
        let mut fv = take_volume(section).ok_or_else(|| {
            Error::InvalidArgument(format!("File {} has no volume image", file.guid))
        })?;

        let mut files = std::mem::take(&mut fv.files);
        for f in &mut files {
            if let [s] = f.sections.as_slice()
                && is_compressed(s)
            {
                debug!("Decompressing file {}", f.guid);
                let mut s = f.sections.remove(0);
                f.sections = std::mem::take(&mut s.encapsulated);
                f.assemble()?;
            }
        }

        let nested = FirmwareVolume::with_files(
            fv.attributes & NESTED_ATTRIBUTES_MASK,
            self.block_size,
            files,
        )?;
        info!("Repacked volume of {} files into one compressed section", nested.files.len());

        let image = Section::new_volume_image(nested)?;
        let compressed = Section::new_guid_defined(guid::LZMA, vec![image])?;
        file.sections.insert(index, compressed);
        file.assemble()?;

        Ok(())
    }
}

fn is_compressed(section: &Section) -> bool {
    section.guid_defined.as_ref().is_some_and(|g| {
        g.attributes.contains(GuidDefinedAttributes::PROCESSING_REQUIRED) && g.codec.is_some()
    }) && !section.encapsulated.is_empty()
}

fn find_volume(section: &Section) -> Option<&FirmwareVolume> {
    match &section.volume {
        Some(fv) => Some(fv),
        None => section.encapsulated.iter().find_map(find_volume),
    }
}

fn take_volume(mut section: Section) -> Option<FirmwareVolume> {
    match section.volume.take() {
        Some(fv) => Some(*fv),
        None => section.encapsulated.into_iter().find_map(take_volume),
    }
}

impl Visitor for Repack {
    fn visit(&mut self, mut node: Node<'_>) -> Result<()> {
        if let Node::FirmwareVolume(fv) = &node {
            let outer = std::mem::replace(&mut self.block_size, fv.block_size());
            node.apply_children(self)?;
            self.block_size = outer;
            return Ok(());
        }

        if let Node::File(file) = &mut node
            && file_matches(file, &self.predicate)
        {
            self.matches += 1;
            if !self.dry_run {
                return self.repack(file);
            }
        }

        node.apply_children(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        format::{Context, file::FileType, section::SectionType},
        guid::Guid,
    };

    fn compressed_file(i: u8) -> File {
        let inner = vec![Section::new_leaf(SectionType::PE32, &[i; 64]).unwrap()];
        let sections = vec![Section::new_guid_defined(guid::LZMA, inner).unwrap()];
        File::new(Guid([i; 16]), FileType::DRIVER, sections, 0xff).unwrap()
    }

    #[test]
    fn files_end_up_uncompressed_in_one_section() {
        let fv = FirmwareVolume::with_files(0x0004_feff, 0x1000, vec![compressed_file(1), compressed_file(2)])
            .unwrap();
        let sections = vec![
            Section::new_volume_image(fv).unwrap(),
            Section::new_ui("Outer").unwrap(),
        ];
        let outer = File::new(Guid([9; 16]), FileType::FIRMWARE_VOLUME_IMAGE, sections, 0xff).unwrap();

        let mut fw = Firmware::File(outer);
        Repack::new(Predicate::by_name("Outer").unwrap()).run(&mut fw).unwrap();

        let parsed = File::parse(fw.buf(), &mut Context::default()).unwrap();
        assert_eq!(parsed.name(), Some("Outer"));

        let wrapper = &parsed.sections[0];
        assert_eq!(wrapper.guid_defined.as_ref().map(|g| g.guid), Some(guid::LZMA));
        let nested = wrapper.encapsulated[0].volume.as_ref().unwrap();
        assert_eq!(nested.files.len(), 2);
        for f in &nested.files {
            assert_eq!(f.sections[0].section_type, SectionType::PE32);
        }
    }
}
