// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::mem;

use tracing::trace;

use crate::{
    format::{Node, Visitor},
    visitors::Result,
};

/// Regenerate every buffer from its children, bottom up. Must run after any
/// edit before the buffers of the edited node's ancestors can be trusted.
#[derive(Debug)]
pub struct Assemble {
    /// A file or section below the current volume needs 64-bit sizes.
    use_ffs3: bool,
    polarity: u8,
}

impl Default for Assemble {
    fn default() -> Self {
        Self {
            use_ffs3: false,
            polarity: 0xff,
        }
    }
}

impl Assemble {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Visitor for Assemble {
    fn visit(&mut self, mut node: Node<'_>) -> Result<()> {
        // Volumes track FFS3 promotion for their own subtree only.
        let outer_ffs3 = if let Node::FirmwareVolume(fv) = &node {
            self.polarity = fv.polarity();
            Some(mem::take(&mut self.use_ffs3))
        } else {
            None
        };

        if let Node::BiosRegion(region) = &node
            && let Some(p) = region.polarity()
        {
            self.polarity = p;
        }

        node.apply_children(self)?;

        trace!("Assembling {}", node.type_name());

        match node {
            Node::FlashImage(n) => n.assemble()?,
            Node::FlashDescriptor(n) => n.assemble()?,
            Node::BiosRegion(n) => n.assemble(n.polarity().unwrap_or(self.polarity))?,
            Node::FirmwareVolume(n) => {
                n.assemble(self.use_ffs3)?;
                self.use_ffs3 = outer_ffs3.unwrap_or_default();
            }
            Node::File(n) => self.use_ffs3 |= n.assemble()?,
            Node::Section(n) => self.use_ffs3 |= n.assemble()?,
            Node::NVarStore(n) => n.assemble()?,
            Node::NVar(n) => n.assemble()?,
            Node::BiosPadding(_) | Node::MeRegion(_) | Node::RawRegion(_) => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        format::{
            Context, Firmware,
            file::{File, FileType},
            section::{Section, SectionType},
            volume::FirmwareVolume,
        },
        guid::Guid,
    };

    #[test]
    fn edit_propagates_to_volume() {
        let mut fv = FirmwareVolume::new_empty(0x2000, Guid([0x33; 16]), 0xff).unwrap();
        let file = File::new(
            Guid([0x44; 16]),
            FileType::FREEFORM,
            vec![Section::new_leaf(SectionType::RAW, b"before").unwrap()],
            0xff,
        )
        .unwrap();
        fv.files.push(file);
        fv.assemble(false).unwrap();

        let mut fw = Firmware::FirmwareVolume(fv);
        if let Firmware::FirmwareVolume(fv) = &mut fw {
            fv.files[0].sections[0].set_data(b"after!").unwrap();
        }
        fw.apply(&mut Assemble::new()).unwrap();

        let parsed = FirmwareVolume::parse(fw.buf(), &mut Context::default()).unwrap();
        assert!(parsed.checksum_ok());
        assert_eq!(parsed.files[0].sections[0].data(), b"after!");
        assert!(parsed.files[0].header_checksum_ok());
    }
}
