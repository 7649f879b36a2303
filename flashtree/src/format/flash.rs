// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Descriptor mode flash images: the flash descriptor followed by the regions
//! it describes.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    format::{
        Context, Error, Result,
        descriptor::{self, FlashDescriptor, FlashRegionType},
        firmware::{Node, Visitor},
        me::MeRegion,
        region::{BiosRegion, RawRegion, Region},
    },
    util::NumBytes,
    visitors,
};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FlashImage {
    #[serde(skip)]
    pub buf: Vec<u8>,
    pub extract_path: String,

    pub ifd: FlashDescriptor,
    /// Sorted by offset. Gaps are filled with [`FlashRegionType::Unknown`]
    /// raw regions.
    pub regions: Vec<Region>,
    pub flash_size: u64,
}

impl FlashImage {
    pub fn parse(buf: &[u8], ctx: &mut Context) -> Result<Self> {
        let ifd = FlashDescriptor::parse(buf)?;

        let mut layout = vec![];
        for (index, region) in ifd.regions.iter().enumerate().skip(1) {
            let region_type = FlashRegionType::from_index(index);
            if !region.valid() {
                continue;
            }
            if region.end_offset() > buf.len() as u64 {
                warn!(
                    "{region_type} region {:#x}..{:#x} extends past the end of the image ({:#x})",
                    region.base_offset(),
                    region.end_offset(),
                    buf.len(),
                );
                continue;
            }

            layout.push((region_type, *region));
        }

        layout.sort_by_key(|(_, r)| r.base_offset());

        let mut regions = vec![];
        let mut cursor = descriptor::DESCRIPTOR_SIZE as u64;

        for (region_type, flash_region) in layout {
            let start = flash_region.base_offset();
            let end = flash_region.end_offset();

            if start < cursor {
                return Err(Error::OverlappingRegions(region_type));
            } else if start > cursor {
                regions.push(Region::Raw(gap(buf, cursor, start)));
            }

            debug!("{region_type} region at {start:#x} of {:?}", NumBytes(end - start));

            // Bounds were checked against the buffer length above.
            let data = &buf[start as usize..end as usize];
            let region = match region_type {
                FlashRegionType::Bios => Region::Bios(BiosRegion::parse(data, Some(flash_region), ctx)?),
                FlashRegionType::Me => Region::Me(MeRegion::parse(data, Some(flash_region))),
                _ => Region::Raw(RawRegion {
                    buf: data.to_vec(),
                    region_type,
                    flash_region: Some(flash_region),
                    region_offset: start,
                    ..Default::default()
                }),
            };

            regions.push(region);
            cursor = end;
        }

        let flash_size = buf.len() as u64;
        if cursor < flash_size {
            regions.push(Region::Raw(gap(buf, cursor, flash_size)));
        }

        Ok(Self {
            buf: buf.to_vec(),
            ifd,
            regions,
            flash_size,
            ..Default::default()
        })
    }

    pub fn region(&self, region_type: FlashRegionType) -> Option<&Region> {
        self.regions.iter().find(|r| r.region_type() == region_type)
    }

    /// Concatenate the descriptor and regions. The regions must tile the
    /// image exactly, from the end of the descriptor to the flash size.
    pub fn assemble(&mut self) -> Result<()> {
        self.regions.sort_by_key(Region::offset);

        let mut buf = self.ifd.buf.clone();
        let mut cursor = buf.len() as u64;

        for region in &self.regions {
            let start = region.offset();
            let region_type = region.region_type();

            if start < cursor {
                return Err(Error::OverlappingRegions(region_type));
            } else if start > cursor {
                return Err(Error::NonContiguousLayout(format!(
                    "Gap before {region_type} region: {cursor:#x}..{start:#x}"
                )));
            }

            if let Some(fr) = region.flash_region()
                && region_type != FlashRegionType::Unknown
                && (fr.base_offset() != start || fr.end_offset() != start + region.buf().len() as u64)
            {
                return Err(Error::NonContiguousLayout(format!(
                    "{region_type} region spans {start:#x}..{:#x}, but descriptor says {:#x}..{:#x}",
                    start + region.buf().len() as u64,
                    fr.base_offset(),
                    fr.end_offset(),
                )));
            }

            buf.extend_from_slice(region.buf());
            cursor = buf.len() as u64;
        }

        if cursor != self.flash_size {
            return Err(Error::NonContiguousLayout(format!(
                "Regions end at {cursor:#x}, but flash size is {:#x}",
                self.flash_size,
            )));
        }

        self.buf = buf;

        Ok(())
    }

    pub fn apply(&mut self, v: &mut dyn Visitor) -> visitors::Result<()> {
        v.visit(Node::FlashImage(self))
    }

    pub fn apply_children(&mut self, v: &mut dyn Visitor) -> visitors::Result<()> {
        self.ifd.apply(v)?;

        for region in &mut self.regions {
            region.apply(v)?;
        }

        Ok(())
    }
}

fn gap(buf: &[u8], start: u64, end: u64) -> RawRegion {
    debug!("Unclaimed space at {start:#x}..{end:#x}");

    RawRegion::new(&buf[start as usize..end as usize], FlashRegionType::Unknown, start)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::format::descriptor::FlashRegion;

    fn image(layout: &[(FlashRegionType, u64, u64)], size: usize) -> Vec<u8> {
        let regions = layout
            .iter()
            .map(|(t, s, e)| (*t, FlashRegion::from_offsets(*s, *e).unwrap()))
            .collect::<Vec<_>>();
        let ifd = descriptor::build(&regions).unwrap();

        let mut buf = ifd.buf;
        buf.resize(size, 0xff);
        buf
    }

    #[test]
    fn gaps_are_filled() {
        let buf = image(&[(FlashRegionType::Gbe, 0x3000, 0x4000)], 0x6000);
        let mut flash = FlashImage::parse(&buf, &mut Context::default()).unwrap();

        let layout = flash
            .regions
            .iter()
            .map(|r| (r.region_type(), r.offset(), r.buf().len()))
            .collect::<Vec<_>>();
        assert_eq!(layout, [
            (FlashRegionType::Unknown, 0x1000, 0x2000),
            (FlashRegionType::Gbe, 0x3000, 0x1000),
            (FlashRegionType::Unknown, 0x4000, 0x2000),
        ]);

        flash.assemble().unwrap();
        assert_eq!(flash.buf, buf);
    }

    #[test]
    fn overlap_is_an_error() {
        let buf = image(&[
            (FlashRegionType::Gbe, 0x1000, 0x3000),
            (FlashRegionType::Pd, 0x2000, 0x4000),
        ], 0x4000);

        assert_matches!(
            FlashImage::parse(&buf, &mut Context::default()),
            Err(Error::OverlappingRegions(FlashRegionType::Pd))
        );
    }

    #[test]
    fn region_past_end_is_skipped() {
        let buf = image(&[(FlashRegionType::Gbe, 0x1000, 0x9000)], 0x2000);
        let flash = FlashImage::parse(&buf, &mut Context::default()).unwrap();

        assert_eq!(flash.regions.len(), 1);
        assert_eq!(flash.regions[0].region_type(), FlashRegionType::Unknown);
    }

    #[test]
    fn assemble_rejects_gap() {
        let buf = image(&[(FlashRegionType::Gbe, 0x1000, 0x2000)], 0x3000);
        let mut flash = FlashImage::parse(&buf, &mut Context::default()).unwrap();
        flash.regions.pop();

        assert_matches!(flash.assemble(), Err(Error::NonContiguousLayout(_)));
    }
}
