// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use crate::{
    format::{Node, Visitor, region::Region},
    visitors::Result,
};

/// Recompute the absolute offsets of regions, BIOS paddings and top level
/// volumes from the current buffer sizes.
#[derive(Clone, Copy, Debug, Default)]
pub struct SetOffsets;

impl Visitor for SetOffsets {
    fn visit(&mut self, node: Node<'_>) -> Result<()> {
        match node {
            Node::FlashImage(flash) => {
                let mut offset = flash.ifd.buf.len() as u64;

                for region in &mut flash.regions {
                    match region {
                        Region::Bios(r) => r.region_offset = offset,
                        Region::Me(r) => r.region_offset = offset,
                        Region::Raw(r) => r.region_offset = offset,
                    }
                    offset += region.buf().len() as u64;

                    if let Region::Bios(r) = region {
                        r.apply(self)?;
                    }
                }
            }
            Node::BiosRegion(bios) => {
                let mut offset = bios.region_offset;

                for element in &mut bios.elements {
                    element.set_offset(offset);
                    offset += element.buf().len() as u64;
                }
            }
            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{
        Firmware,
        region::{BiosElement, BiosPadding, BiosRegion},
    };

    #[test]
    fn bios_elements_are_packed() {
        let padding = |len| {
            BiosElement::Padding(BiosPadding {
                buf: vec![0xff; len],
                ..Default::default()
            })
        };
        let region = BiosRegion {
            region_offset: 0x8000,
            elements: vec![padding(0x10), padding(0x20), padding(0x30)],
            ..Default::default()
        };

        let mut fw = Firmware::BiosRegion(region);
        fw.apply(&mut SetOffsets).unwrap();

        let Firmware::BiosRegion(region) = fw else {
            unreachable!();
        };
        let offsets = region.elements.iter().map(BiosElement::offset).collect::<Vec<_>>();
        assert_eq!(offsets, [0x8000, 0x8010, 0x8030]);
    }
}
