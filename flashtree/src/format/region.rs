// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use memchr::memmem;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    format::{
        Context, Error, Result,
        descriptor::{FlashRegion, FlashRegionType},
        firmware::{Node, Visitor},
        me::MeRegion,
        volume::{self, FirmwareVolume},
    },
    util::NumBytes,
    visitors,
};

/// Opaque bytes between firmware volumes. Kept verbatim.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BiosPadding {
    #[serde(skip)]
    pub buf: Vec<u8>,
    pub extract_path: String,

    /// Absolute offset within the flash image.
    pub offset: u64,
}

impl BiosPadding {
    pub fn apply(&mut self, v: &mut dyn Visitor) -> visitors::Result<()> {
        v.visit(Node::BiosPadding(self))
    }

    pub fn apply_children(&mut self, _v: &mut dyn Visitor) -> visitors::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "Type", content = "Value")]
pub enum BiosElement {
    #[serde(rename = "FirmwareVolume")]
    Volume(FirmwareVolume),
    #[serde(rename = "BIOSPadding")]
    Padding(BiosPadding),
}

impl BiosElement {
    pub fn buf(&self) -> &[u8] {
        match self {
            Self::Volume(fv) => &fv.buf,
            Self::Padding(p) => &p.buf,
        }
    }

    /// Absolute offset within the flash image.
    pub fn offset(&self) -> u64 {
        match self {
            Self::Volume(fv) => fv.fv_offset,
            Self::Padding(p) => p.offset,
        }
    }

    pub fn set_offset(&mut self, offset: u64) {
        match self {
            Self::Volume(fv) => fv.fv_offset = offset,
            Self::Padding(p) => p.offset = offset,
        }
    }

    pub fn apply(&mut self, v: &mut dyn Visitor) -> visitors::Result<()> {
        match self {
            Self::Volume(fv) => fv.apply(v),
            Self::Padding(p) => p.apply(v),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BiosRegion {
    #[serde(skip)]
    pub buf: Vec<u8>,
    pub extract_path: String,

    /// Bounds from the flash descriptor. Absent for standalone BIOS images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flash_region: Option<FlashRegion>,
    /// Absolute offset within the flash image.
    pub region_offset: u64,
    pub length: u64,
    pub elements: Vec<BiosElement>,
}

impl BiosRegion {
    /// Split the region into firmware volumes and the padding between them.
    /// Volume signatures are searched for at 8-byte aligned header offsets
    /// and candidates that fail to parse are skipped.
    pub fn parse(buf: &[u8], flash_region: Option<FlashRegion>, ctx: &mut Context) -> Result<Self> {
        let base = flash_region.map_or(0, |r| r.base_offset());
        let finder = memmem::Finder::new(volume::SIGNATURE);
        let mut elements = vec![];
        let mut cursor = 0;
        let mut search = 0;

        while let Some(pos) = buf.get(search..).and_then(|b| finder.find(b)).map(|p| p + search) {
            search = pos + 1;

            let Some(start) = pos.checked_sub(volume::SIGNATURE_OFFSET) else {
                continue;
            };
            if start % volume::FILE_ALIGNMENT != 0 || start < cursor {
                continue;
            }

            let mut fv = match FirmwareVolume::parse(&buf[start..], ctx) {
                Ok(fv) => fv,
                Err(e @ Error::PolarityMismatch { .. }) => return Err(e),
                Err(e) => {
                    warn!("Skipping volume candidate at {:#x}: {e}", base + start as u64);
                    continue;
                }
            };

            if start > cursor {
                elements.push(BiosElement::Padding(BiosPadding {
                    buf: buf[cursor..start].to_vec(),
                    offset: base + cursor as u64,
                    ..Default::default()
                }));
            }

            debug!(
                "Found volume at {:#x} of {:?}",
                base + start as u64,
                NumBytes(fv.length),
            );

            fv.fv_offset = base + start as u64;
            cursor = start + fv.buf.len();
            search = cursor;
            elements.push(BiosElement::Volume(fv));
        }

        if cursor < buf.len() {
            elements.push(BiosElement::Padding(BiosPadding {
                buf: buf[cursor..].to_vec(),
                offset: base + cursor as u64,
                ..Default::default()
            }));
        }

        Ok(Self {
            buf: buf.to_vec(),
            flash_region,
            region_offset: base,
            length: buf.len() as u64,
            elements,
            ..Default::default()
        })
    }

    /// Erase polarity of the first volume, if any.
    pub fn polarity(&self) -> Option<u8> {
        self.elements.iter().find_map(|e| match e {
            BiosElement::Volume(fv) => Some(fv.polarity()),
            BiosElement::Padding(_) => None,
        })
    }

    pub fn volumes(&self) -> impl Iterator<Item = &FirmwareVolume> {
        self.elements.iter().filter_map(|e| match e {
            BiosElement::Volume(fv) => Some(fv),
            BiosElement::Padding(_) => None,
        })
    }

    /// Concatenate the elements into a region sized buffer filled with the
    /// erase polarity.
    pub fn assemble(&mut self, polarity: u8) -> Result<()> {
        let length = usize::try_from(self.length).map_err(|_| Error::SizeTooLarge {
            what: "BIOS region",
            size: self.length,
        })?;

        let mut buf = Vec::with_capacity(length);
        for element in &self.elements {
            buf.extend_from_slice(element.buf());
        }

        if buf.len() > length {
            return Err(Error::InsufficientSpace {
                what: "BIOS region",
                needed: buf.len() as u64,
                available: self.length,
            });
        }

        buf.resize(length, polarity);
        self.buf = buf;

        Ok(())
    }

    pub fn apply(&mut self, v: &mut dyn Visitor) -> visitors::Result<()> {
        v.visit(Node::BiosRegion(self))
    }

    pub fn apply_children(&mut self, v: &mut dyn Visitor) -> visitors::Result<()> {
        for element in &mut self.elements {
            element.apply(v)?;
        }

        Ok(())
    }
}

/// A region whose contents are not interpreted.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RawRegion {
    #[serde(skip)]
    pub buf: Vec<u8>,
    pub extract_path: String,

    pub region_type: FlashRegionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flash_region: Option<FlashRegion>,
    /// Absolute offset within the flash image.
    pub region_offset: u64,
}

impl RawRegion {
    pub fn new(buf: &[u8], region_type: FlashRegionType, region_offset: u64) -> Self {
        Self {
            buf: buf.to_vec(),
            region_type,
            flash_region: FlashRegion::from_offsets(region_offset, region_offset + buf.len() as u64),
            region_offset,
            ..Default::default()
        }
    }

    pub fn apply(&mut self, v: &mut dyn Visitor) -> visitors::Result<()> {
        v.visit(Node::RawRegion(self))
    }

    pub fn apply_children(&mut self, _v: &mut dyn Visitor) -> visitors::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "Type", content = "Value")]
pub enum Region {
    #[serde(rename = "BIOSRegion")]
    Bios(BiosRegion),
    #[serde(rename = "MERegion")]
    Me(MeRegion),
    #[serde(rename = "RawRegion")]
    Raw(RawRegion),
}

impl Region {
    pub fn region_type(&self) -> FlashRegionType {
        match self {
            Self::Bios(_) => FlashRegionType::Bios,
            Self::Me(_) => FlashRegionType::Me,
            Self::Raw(r) => r.region_type,
        }
    }

    pub fn buf(&self) -> &[u8] {
        match self {
            Self::Bios(r) => &r.buf,
            Self::Me(r) => &r.buf,
            Self::Raw(r) => &r.buf,
        }
    }

    pub fn flash_region(&self) -> Option<&FlashRegion> {
        match self {
            Self::Bios(r) => r.flash_region.as_ref(),
            Self::Me(r) => r.flash_region.as_ref(),
            Self::Raw(r) => r.flash_region.as_ref(),
        }
    }

    /// Absolute offset within the flash image.
    pub fn offset(&self) -> u64 {
        match self {
            Self::Bios(r) => r.region_offset,
            Self::Me(r) => r.region_offset,
            Self::Raw(r) => r.region_offset,
        }
    }

    pub fn apply(&mut self, v: &mut dyn Visitor) -> visitors::Result<()> {
        match self {
            Self::Bios(r) => r.apply(v),
            Self::Me(r) => r.apply(v),
            Self::Raw(r) => r.apply(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::Guid;

    #[test]
    fn volumes_and_padding() {
        let fv = FirmwareVolume::new_empty(0x1000, Guid([0x11; 16]), 0xff).unwrap();

        let mut buf = vec![0xaa; 0x100];
        buf.extend_from_slice(&fv.buf);
        buf.extend_from_slice(&[0xbb; 0x28]);
        buf.extend_from_slice(&fv.buf);

        let region = BiosRegion::parse(&buf, FlashRegion::from_offsets(0x10000, 0x20000), &mut Context::default())
            .unwrap();

        let offsets = region.elements.iter().map(BiosElement::offset).collect::<Vec<_>>();
        assert_eq!(offsets, [0x10000, 0x10100, 0x11100, 0x11128]);
        assert!(matches!(region.elements[0], BiosElement::Padding(_)));
        assert!(matches!(region.elements[3], BiosElement::Volume(_)));
        assert_eq!(region.polarity(), Some(0xff));
    }

    #[test]
    fn misaligned_signature_is_padding() {
        let fv = FirmwareVolume::new_empty(0x1000, Guid([0x11; 16]), 0xff).unwrap();
        let mut buf = vec![0u8; 4];
        buf.extend_from_slice(&fv.buf);

        let region = BiosRegion::parse(&buf, None, &mut Context::default()).unwrap();
        assert_eq!(region.elements.len(), 1);
        assert!(matches!(region.elements[0], BiosElement::Padding(_)));
    }

    #[test]
    fn assemble_fills_polarity() {
        let fv = FirmwareVolume::new_empty(0x1000, Guid([0x11; 16]), 0x00).unwrap();
        let mut region = BiosRegion::parse(&fv.buf, None, &mut Context::default()).unwrap();
        region.length = 0x2000;
        region.assemble(0x00).unwrap();

        assert_eq!(region.buf.len(), 0x2000);
        assert!(region.buf[0x1000..].iter().all(|b| *b == 0));
    }
}
