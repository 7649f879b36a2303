// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Intel ME region. Only the `$FPT` partition table is interpreted, which is
//! enough to know how much of the region is actually used.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zerocopy::{FromBytes, little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    format::{
        Error, Result,
        descriptor::FlashRegion,
        firmware::{Node, Visitor},
    },
    util::NumBytes,
    visitors,
};

pub const FPT_SIGNATURE: &[u8; 4] = b"$FPT";
/// Possible offsets of the partition table. Some images have a 16-byte
/// ROM bypass vector in front of it.
const FPT_OFFSETS: [usize; 2] = [0, 16];
const FPT_HEADER_SIZE: usize = 32;
const FPT_ENTRY_SIZE: usize = 32;
const UNUSED: u32 = 0xffff_ffff;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawFptHeader {
    signature: [u8; 4],
    num_fpt_entries: little_endian::U32,
    header_version: u8,
    entry_version: u8,
    header_length: u8,
    header_checksum: u8,
    flash_cycle_life: little_endian::U16,
    flash_cycle_limit: little_endian::U16,
    uma_size: little_endian::U32,
    flags: little_endian::U32,
    fit_major: little_endian::U16,
    fit_minor: little_endian::U16,
    fit_hotfix: little_endian::U16,
    fit_build: little_endian::U16,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawFptEntry {
    name: [u8; 4],
    owner: [u8; 4],
    offset: little_endian::U32,
    length: little_endian::U32,
    reserved: [little_endian::U32; 3],
    flags: little_endian::U32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeFptHeader {
    pub num_fpt_entries: u32,
    pub header_version: u8,
    pub entry_version: u8,
    pub header_length: u8,
    pub header_checksum: u8,
    pub flags: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeFptEntry {
    pub name: String,
    pub owner: String,
    pub offset: u32,
    pub length: u32,
    pub flags: u32,
}

impl MeFptEntry {
    /// End of the partition, if it has a valid location.
    pub fn end(&self) -> Option<u64> {
        if self.offset == UNUSED || self.length == UNUSED {
            None
        } else {
            Some(u64::from(self.offset) + u64::from(self.length))
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeFpt {
    /// Offset of the table within the region.
    pub padding_offset: usize,
    pub header: MeFptHeader,
    pub entries: Vec<MeFptEntry>,
}

impl MeFpt {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let padding_offset = FPT_OFFSETS
            .into_iter()
            .find(|o| buf.get(*o..*o + 4) == Some(FPT_SIGNATURE.as_slice()))
            .ok_or_else(|| Error::malformed("ME partition table", "$FPT signature not found", buf))?;

        let (raw, mut rest) = RawFptHeader::read_from_prefix(&buf[padding_offset..]).map_err(|_| {
            Error::truncated("ME partition table header", padding_offset + FPT_HEADER_SIZE, buf.len())
        })?;

        let count = raw.num_fpt_entries.get();
        let mut entries = vec![];

        for _ in 0..count {
            let (entry, next) = RawFptEntry::read_from_prefix(rest).map_err(|_| Error::TruncatedBuffer {
                what: "ME partition table entries",
                needed: (padding_offset + FPT_HEADER_SIZE) as u64
                    + u64::from(count) * FPT_ENTRY_SIZE as u64,
                available: buf.len() as u64,
            })?;
            rest = next;

            entries.push(MeFptEntry {
                name: ascii_field(&entry.name),
                owner: ascii_field(&entry.owner),
                offset: entry.offset.get(),
                length: entry.length.get(),
                flags: entry.flags.get(),
            });
        }

        Ok(Self {
            padding_offset,
            header: MeFptHeader {
                num_fpt_entries: count,
                header_version: raw.header_version,
                entry_version: raw.entry_version,
                header_length: raw.header_length,
                header_checksum: raw.header_checksum,
                flags: raw.flags.get(),
            },
            entries,
        })
    }

    /// One past the highest byte used by any partition.
    pub fn free_space_offset(&self) -> u64 {
        self.entries
            .iter()
            .filter_map(MeFptEntry::end)
            .max()
            .unwrap_or_default()
    }
}

fn ascii_field(raw: &[u8]) -> String {
    raw.iter()
        .take_while(|b| **b != 0 && **b != 0xff)
        .map(|b| char::from(*b))
        .collect()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MeRegion {
    #[serde(skip)]
    pub buf: Vec<u8>,
    pub extract_path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flash_region: Option<FlashRegion>,
    /// Absolute offset within the flash image.
    pub region_offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fpt: Option<MeFpt>,
    /// One past the highest byte used by a partition, relative to the region.
    pub free_space_offset: u64,
}

impl MeRegion {
    pub fn parse(buf: &[u8], flash_region: Option<FlashRegion>) -> Self {
        let mut region = Self {
            buf: buf.to_vec(),
            flash_region,
            region_offset: flash_region.map_or(0, |r| r.base_offset()),
            ..Default::default()
        };

        match MeFpt::parse(buf) {
            Ok(fpt) => {
                region.free_space_offset = fpt.free_space_offset();
                debug!(
                    "ME partition table has {} entries, {:?} used",
                    fpt.entries.len(),
                    NumBytes(region.free_space_offset),
                );
                region.fpt = Some(fpt);
            }
            Err(e) => {
                warn!("Could not parse ME partition table: {e}");
                region.free_space_offset = buf.len() as u64;
            }
        }

        region
    }

    pub fn apply(&mut self, v: &mut dyn Visitor) -> visitors::Result<()> {
        v.visit(Node::MeRegion(self))
    }

    pub fn apply_children(&mut self, _v: &mut dyn Visitor) -> visitors::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use zerocopy::IntoBytes;

    use super::*;

    pub(crate) fn build_fpt(offset: usize, entries: &[(&[u8; 4], u32, u32)]) -> Vec<u8> {
        let mut buf = vec![0u8; offset];
        let header = RawFptHeader {
            signature: *FPT_SIGNATURE,
            num_fpt_entries: (entries.len() as u32).into(),
            header_version: 0x20,
            entry_version: 0x10,
            header_length: FPT_HEADER_SIZE as u8,
            header_checksum: 0,
            flash_cycle_life: 0.into(),
            flash_cycle_limit: 0.into(),
            uma_size: 0.into(),
            flags: 0.into(),
            fit_major: 0.into(),
            fit_minor: 0.into(),
            fit_hotfix: 0.into(),
            fit_build: 0.into(),
        };
        buf.extend_from_slice(header.as_bytes());

        for (name, offset, length) in entries {
            let entry = RawFptEntry {
                name: **name,
                owner: [0xff; 4],
                offset: (*offset).into(),
                length: (*length).into(),
                reserved: [0.into(); 3],
                flags: 0.into(),
            };
            buf.extend_from_slice(entry.as_bytes());
        }

        buf.resize(0x4000, 0xff);
        buf
    }

    #[test]
    fn free_space_from_partitions() {
        let buf = build_fpt(16, &[
            (b"FTPR", 0x1000, 0x800),
            (b"NFTP", 0x2000, 0x300),
            (b"MDMV", UNUSED, UNUSED),
        ]);

        let region = MeRegion::parse(&buf, None);
        let fpt = region.fpt.as_ref().unwrap();
        assert_eq!(fpt.padding_offset, 16);
        assert_eq!(fpt.entries[1].name, "NFTP");
        assert_eq!(region.free_space_offset, 0x2300);
    }

    #[test]
    fn missing_table() {
        let region = MeRegion::parse(&[0xff; 0x100], None);
        assert!(region.fpt.is_none());
        assert_eq!(region.free_space_offset, 0x100);
    }
}
