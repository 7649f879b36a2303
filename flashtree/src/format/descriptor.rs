// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Intel flash descriptor (IFD), the first 4 KiB of a descriptor mode image.

use std::fmt;

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, IntoBytes, little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    format::{
        Error, Result,
        firmware::{Node, Visitor},
    },
    util, visitors,
};

pub const SIGNATURE: [u8; 4] = [0x5a, 0xa5, 0xf0, 0x0f];
pub const DESCRIPTOR_SIZE: usize = 0x1000;
/// Region base and limit fields are in units of this many bytes.
pub const REGION_BLOCK_SIZE: u64 = 0x1000;
pub const NUM_REGIONS: usize = 16;
pub const NUM_MASTERS: usize = 3;

/// Descriptor map bases are in units of this many bytes.
const BASE_UNIT: usize = 16;
const MAP_SIZE: usize = 16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FlashRegionType {
    #[serde(rename = "FD")]
    Descriptor,
    #[serde(rename = "BIOS")]
    Bios,
    #[serde(rename = "ME")]
    Me,
    #[serde(rename = "GbE")]
    Gbe,
    #[serde(rename = "PD")]
    Pd,
    DevExp1,
    #[serde(rename = "BIOS2")]
    Bios2,
    Microcode,
    #[serde(rename = "EC")]
    Ec,
    DevExp2,
    #[serde(rename = "IE")]
    Ie,
    #[serde(rename = "10GbE1")]
    TenGbe1,
    #[serde(rename = "10GbE2")]
    TenGbe2,
    Reserved1,
    Reserved2,
    #[serde(rename = "PTT")]
    Ptt,
    #[default]
    Unknown,
}

impl FlashRegionType {
    const ORDER: [Self; NUM_REGIONS] = [
        Self::Descriptor,
        Self::Bios,
        Self::Me,
        Self::Gbe,
        Self::Pd,
        Self::DevExp1,
        Self::Bios2,
        Self::Microcode,
        Self::Ec,
        Self::DevExp2,
        Self::Ie,
        Self::TenGbe1,
        Self::TenGbe2,
        Self::Reserved1,
        Self::Reserved2,
        Self::Ptt,
    ];

    /// Type of the region at `index` in the region section.
    pub fn from_index(index: usize) -> Self {
        Self::ORDER.get(index).copied().unwrap_or(Self::Unknown)
    }

    pub fn index(self) -> Option<usize> {
        Self::ORDER.iter().position(|t| *t == self)
    }
}

impl fmt::Display for FlashRegionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Descriptor => "FD",
            Self::Bios => "BIOS",
            Self::Me => "ME",
            Self::Gbe => "GbE",
            Self::Pd => "PD",
            Self::DevExp1 => "DevExp1",
            Self::Bios2 => "BIOS2",
            Self::Microcode => "Microcode",
            Self::Ec => "EC",
            Self::DevExp2 => "DevExp2",
            Self::Ie => "IE",
            Self::TenGbe1 => "10GbE1",
            Self::TenGbe2 => "10GbE2",
            Self::Reserved1 => "Reserved1",
            Self::Reserved2 => "Reserved2",
            Self::Ptt => "PTT",
            Self::Unknown => "Unknown",
        };

        f.write_str(name)
    }
}

/// Region bounds in units of [`REGION_BLOCK_SIZE`]. `limit` is inclusive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashRegion {
    pub base: u16,
    pub limit: u16,
}

impl FlashRegion {
    /// Create a region covering `[start, end)`. Both must be block aligned.
    pub fn from_offsets(start: u64, end: u64) -> Option<Self> {
        if start % REGION_BLOCK_SIZE != 0 || end % REGION_BLOCK_SIZE != 0 || end <= start {
            return None;
        }

        Some(Self {
            base: u16::try_from(start / REGION_BLOCK_SIZE).ok()?,
            limit: u16::try_from(end / REGION_BLOCK_SIZE - 1).ok()?,
        })
    }

    pub fn valid(&self) -> bool {
        self.limit > 0 && self.limit >= self.base && self.base != 0xffff && self.limit != 0xffff
    }

    pub fn base_offset(&self) -> u64 {
        u64::from(self.base) * REGION_BLOCK_SIZE
    }

    pub fn end_offset(&self) -> u64 {
        (u64::from(self.limit) + 1) * REGION_BLOCK_SIZE
    }
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawFlashRegion {
    base: little_endian::U16,
    limit: little_endian::U16,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawMasterEntry {
    requester_id: little_endian::U16,
    read: u8,
    write: u8,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
    Unaligned,
)]
#[repr(C)]
pub struct DescriptorMap {
    // FLMAP0
    pub component_base: u8,
    pub number_of_flash_chips: u8,
    pub region_base: u8,
    pub number_of_regions: u8,
    // FLMAP1
    pub master_base: u8,
    pub number_of_masters: u8,
    pub pch_straps_base: u8,
    pub number_of_pch_straps: u8,
    // FLMAP2
    pub proc_straps_base: u8,
    pub number_of_proc_straps: u8,
    pub icc_table_base: u8,
    pub number_of_icc_table_entries: u8,
    // FLMAP3
    pub dmi_table_base: u8,
    pub number_of_dmi_table_entries: u8,
    pub reserved0: u8,
    pub reserved1: u8,
}

impl DescriptorMap {
    fn region_offset(&self) -> usize {
        usize::from(self.region_base) * BASE_UNIT
    }

    fn master_offset(&self) -> usize {
        usize::from(self.master_base) * BASE_UNIT
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterEntry {
    pub requester_id: u16,
    pub read: u8,
    pub write: u8,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FlashDescriptor {
    #[serde(skip)]
    pub buf: Vec<u8>,
    pub extract_path: String,

    /// Offset of the descriptor map within the descriptor.
    pub map_offset: usize,
    pub descriptor_map: DescriptorMap,
    pub regions: [FlashRegion; NUM_REGIONS],
    pub masters: [MasterEntry; NUM_MASTERS],
}

/// Locate the flash signature. Returns the offset of the descriptor map.
pub fn find_map(buf: &[u8]) -> Option<usize> {
    [16, 0]
        .into_iter()
        .find(|o| buf.get(*o..*o + 4) == Some(SIGNATURE.as_slice()))
        .map(|o| o + 4)
}

impl FlashDescriptor {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let map_offset = find_map(buf).ok_or_else(|| {
            Error::malformed("Flash descriptor", "Flash signature not found", buf)
        })?;

        let buf = buf
            .get(..DESCRIPTOR_SIZE)
            .ok_or_else(|| Error::truncated("Flash descriptor", DESCRIPTOR_SIZE, buf.len()))?;

        let (descriptor_map, _) = DescriptorMap::read_from_prefix(&buf[map_offset..])
            .map_err(|_| Error::truncated("Descriptor map", map_offset + MAP_SIZE, buf.len()))?;

        let region_offset = descriptor_map.region_offset();
        let region_len = NUM_REGIONS * size_of::<RawFlashRegion>();
        let region_buf = util::subslice(buf, region_offset, region_len)
            .ok_or_else(|| Error::truncated("Region section", region_offset + region_len, buf.len()))?;

        let mut regions = [FlashRegion::default(); NUM_REGIONS];
        for (region, raw) in regions.iter_mut().zip(region_buf.chunks_exact(4)) {
            let (raw, _) = RawFlashRegion::read_from_prefix(raw)
                .map_err(|_| Error::truncated("Flash region", 4, raw.len()))?;
            *region = FlashRegion {
                base: raw.base.get(),
                limit: raw.limit.get(),
            };
        }

        let master_offset = descriptor_map.master_offset();
        let master_len = NUM_MASTERS * size_of::<RawMasterEntry>();
        let master_buf = util::subslice(buf, master_offset, master_len)
            .ok_or_else(|| Error::truncated("Master section", master_offset + master_len, buf.len()))?;

        let mut masters = [MasterEntry::default(); NUM_MASTERS];
        for (master, raw) in masters.iter_mut().zip(master_buf.chunks_exact(4)) {
            let (raw, _) = RawMasterEntry::read_from_prefix(raw)
                .map_err(|_| Error::truncated("Master entry", 4, raw.len()))?;
            *master = MasterEntry {
                requester_id: raw.requester_id.get(),
                read: raw.read,
                write: raw.write,
            };
        }

        Ok(Self {
            buf: buf.to_vec(),
            map_offset,
            descriptor_map,
            regions,
            masters,
            ..Default::default()
        })
    }

    pub fn region(&self, region_type: FlashRegionType) -> Option<&FlashRegion> {
        region_type.index().map(|i| &self.regions[i])
    }

    pub fn region_mut(&mut self, region_type: FlashRegionType) -> Option<&mut FlashRegion> {
        region_type.index().map(|i| &mut self.regions[i])
    }

    /// Problems with the descriptor map that would make the tables unreadable
    /// by the chipset.
    pub fn validate(&self) -> Vec<String> {
        let mut findings = vec![];

        if find_map(&self.buf).is_none() {
            findings.push("Flash descriptor: signature not found".to_owned());
        }

        let region_offset = self.descriptor_map.region_offset();
        let master_offset = self.descriptor_map.master_offset();

        if region_offset + NUM_REGIONS * 4 > DESCRIPTOR_SIZE {
            findings.push(format!(
                "Flash descriptor: region base {region_offset:#x} out of bounds"
            ));
        }
        if master_offset + NUM_MASTERS * 4 > DESCRIPTOR_SIZE {
            findings.push(format!(
                "Flash descriptor: master base {master_offset:#x} out of bounds"
            ));
        }
        if region_offset == master_offset {
            findings.push(format!(
                "Flash descriptor: region and master sections share offset {region_offset:#x}"
            ));
        }

        findings
    }

    /// Write the modelled tables back into the descriptor. Everything else in
    /// the sector is left untouched.
    pub fn assemble(&mut self) -> Result<()> {
        if self.buf.len() < DESCRIPTOR_SIZE {
            self.buf.resize(DESCRIPTOR_SIZE, 0xff);
        }

        let map = self.descriptor_map;
        write_at(&mut self.buf, self.map_offset, map.as_bytes(), "Descriptor map")?;

        let mut regions = Vec::with_capacity(NUM_REGIONS * 4);
        for region in &self.regions {
            let raw = RawFlashRegion {
                base: region.base.into(),
                limit: region.limit.into(),
            };
            regions.extend_from_slice(raw.as_bytes());
        }
        write_at(&mut self.buf, map.region_offset(), &regions, "Region section")?;

        let mut masters = Vec::with_capacity(NUM_MASTERS * 4);
        for master in &self.masters {
            let raw = RawMasterEntry {
                requester_id: master.requester_id.into(),
                read: master.read,
                write: master.write,
            };
            masters.extend_from_slice(raw.as_bytes());
        }
        write_at(&mut self.buf, map.master_offset(), &masters, "Master section")?;

        Ok(())
    }

    pub fn apply(&mut self, v: &mut dyn Visitor) -> visitors::Result<()> {
        v.visit(Node::FlashDescriptor(self))
    }

    pub fn apply_children(&mut self, _v: &mut dyn Visitor) -> visitors::Result<()> {
        Ok(())
    }
}

fn write_at(buf: &mut [u8], offset: usize, data: &[u8], what: &'static str) -> Result<()> {
    let len = buf.len();
    buf.get_mut(offset..offset + data.len())
        .ok_or_else(|| Error::truncated(what, offset + data.len(), len))?
        .copy_from_slice(data);

    Ok(())
}

/// Build a minimal descriptor sector with the given regions. Used to create
/// images from scratch.
pub fn build(regions: &[(FlashRegionType, FlashRegion)]) -> Result<FlashDescriptor> {
    let mut buf = vec![0xff; DESCRIPTOR_SIZE];
    buf[16..20].copy_from_slice(&SIGNATURE);

    let map = DescriptorMap {
        component_base: 0x03,
        number_of_flash_chips: 0,
        region_base: 0x04,
        number_of_regions: 0,
        master_base: 0x08,
        number_of_masters: 0x02,
        ..Default::default()
    };

    let mut descriptor = FlashDescriptor {
        buf: vec![],
        map_offset: 20,
        descriptor_map: map,
        ..Default::default()
    };
    descriptor.regions = [FlashRegion {
        base: 0x7fff,
        limit: 0,
    }; NUM_REGIONS];
    descriptor.regions[0] = FlashRegion { base: 0, limit: 0 };

    for (region_type, region) in regions {
        if let Some(r) = descriptor.region_mut(*region_type) {
            *r = *region;
        }
    }

    descriptor.buf = buf;
    descriptor.assemble()?;

    FlashDescriptor::parse(&descriptor.buf)
}
