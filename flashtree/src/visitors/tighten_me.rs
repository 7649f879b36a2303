// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use tracing::info;

use crate::{
    format::{
        Node, Visitor,
        descriptor::{FlashRegion, FlashRegionType, REGION_BLOCK_SIZE},
        flash::FlashImage,
        padding,
        region::{BiosElement, BiosPadding, Region},
    },
    util::NumBytes,
    visitors::{Error, Result},
};

/// Shrink the ME region to the space its partitions use and give the freed
/// blocks to the BIOS region that directly follows it.
#[derive(Clone, Copy, Debug, Default)]
pub struct TightenMe {
    pub reclaimed: u64,
}

impl TightenMe {
    fn tighten(&mut self, flash: &mut FlashImage) -> Result<()> {
        let me_index = flash
            .regions
            .iter()
            .position(|r| matches!(r, Region::Me(_)))
            .ok_or(Error::MissingRegion(FlashRegionType::Me))?;
        let bios_index = flash
            .regions
            .iter()
            .position(|r| matches!(r, Region::Bios(_)))
            .ok_or(Error::MissingRegion(FlashRegionType::Bios))?;

        let me_end = flash.regions[me_index].offset() + flash.regions[me_index].buf().len() as u64;
        let bios_start = flash.regions[bios_index].offset();
        if me_end != bios_start {
            return Err(Error::NonContiguousLayout(format!(
                "ME region ends at {me_end:#x}, but BIOS region starts at {bios_start:#x}"
            )));
        }

        let Region::Me(me) = &mut flash.regions[me_index] else {
            return Err(Error::MissingRegion(FlashRegionType::Me));
        };

        let used = padding::round(me.free_space_offset, REGION_BLOCK_SIZE).ok_or_else(|| {
            Error::InvalidArgument(format!("ME free space offset {:#x}", me.free_space_offset))
        })?;
        let me_len = me.buf.len() as u64;
        if used >= me_len {
            info!("ME region is already tight");
            return Ok(());
        }
        let delta = me_len - used;

        let me_region = FlashRegion::from_offsets(me.region_offset, me.region_offset + used)
            .ok_or_else(|| Error::InvalidArgument("ME region would become empty".to_owned()))?;
        me.buf.truncate(used as usize);
        me.flash_region = Some(me_region);

        let Region::Bios(bios) = &mut flash.regions[bios_index] else {
            return Err(Error::MissingRegion(FlashRegionType::Bios));
        };

        let start = bios_start - delta;
        let bios_region = FlashRegion::from_offsets(start, bios_start + bios.length)
            .ok_or_else(|| Error::NonContiguousLayout(format!("BIOS region at {start:#x}")))?;
        let polarity = bios.polarity().unwrap_or(0xff);

        bios.elements.insert(
            0,
            BiosElement::Padding(BiosPadding {
                buf: vec![polarity; delta as usize],
                offset: start,
                ..Default::default()
            }),
        );
        bios.region_offset = start;
        bios.length += delta;
        bios.flash_region = Some(bios_region);

        for (region_type, region) in [
            (FlashRegionType::Me, me_region),
            (FlashRegionType::Bios, bios_region),
        ] {
            if let Some(r) = flash.ifd.region_mut(region_type) {
                *r = region;
            }
        }

        self.reclaimed = delta;
        info!("Moved {:?} from the ME region to the BIOS region", NumBytes(delta));

        Ok(())
    }
}

impl Visitor for TightenMe {
    fn visit(&mut self, node: Node<'_>) -> Result<()> {
        match node {
            Node::FlashImage(flash) => self.tighten(flash),
            _ => Err(Error::InvalidArgument(
                "Only flash descriptor images have an ME region".to_owned(),
            )),
        }
    }
}
