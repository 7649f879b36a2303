// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

//! AMI NVAR variable stores.
//!
//! A store is a sequence of `NVAR` entries followed by free space. The GUIDs
//! of entries that reference them by index are kept in a table at the very
//! end of the store, growing backwards: index `i` lives at
//! `end - (i + 1) * 16`.
//!
//! Updating a variable does not rewrite it in place. Instead, the `next`
//! field of the latest entry is pointed at a new data-only entry that holds
//! the new value and borrows the name and GUID from the head of the chain.

use std::collections::HashMap;

use bitflags::bitflags;
use bstr::ByteSlice;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zerocopy::{FromBytes, IntoBytes, little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    format::{
        Error, Result,
        firmware::{Node, Visitor},
    },
    guid::Guid,
    util, visitors,
};

pub const SIGNATURE: &[u8; 4] = b"NVAR";
pub const HEADER_SIZE: usize = 10;

const GUID_SIZE: usize = 16;
const HASH_SIZE: usize = 32;

bitflags! {
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
    pub struct NVarAttributes: u8 {
        const RUNTIME = 1 << 0;
        /// The name is ASCII instead of UCS-2.
        const ASCII_NAME = 1 << 1;
        /// The GUID is stored inline instead of as a table index.
        const GUID = 1 << 2;
        /// Nameless entry holding a newer value for a previous entry.
        const DATA_ONLY = 1 << 3;
        const EXT_HEADER = 1 << 4;
        const HW_ERROR_RECORD = 1 << 5;
        const AUTH_WRITE = 1 << 6;
        const VALID = 1 << 7;

        const _ = !0;
    }

    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
    pub struct NVarExtAttributes: u8 {
        const CHECKSUM = 1 << 0;
        const AUTH_WRITE = 1 << 4;
        const TIME_BASED = 1 << 5;

        const _ = !0;
    }
}

/// Extended attribute bits this parser does not understand.
const UNKNOWN_EXT_MASK: u8 = 0xce;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NVarEntryType {
    /// Not marked valid.
    #[default]
    Invalid,
    /// Data-only entry that no other entry links to.
    InvalidLink,
    /// Superseded entry whose `next` field points at a newer one.
    Link,
    /// Latest data-only entry of a chain.
    Data,
    /// Standalone entry with name, GUID and data.
    Full,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    signature: [u8; 4],
    size: little_endian::U16,
    next: [u8; 3],
    attributes: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NVarExtHeader {
    pub attributes: NVarExtAttributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// Hex encoded SHA-256 of authenticated variables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// The whole extended header, including the trailing size field.
    #[serde(with = "hex")]
    pub raw: Vec<u8>,
}

impl NVarExtHeader {
    fn parse(entry: &[u8], attributes: NVarAttributes) -> Result<(Self, bool)> {
        let len = entry.len();
        let size = entry
            .get(len.saturating_sub(2)..)
            .filter(|s| s.len() == 2)
            .map(|s| usize::from(u16::from_le_bytes([s[0], s[1]])))
            .ok_or_else(|| Error::truncated("NVAR extended header size", 2, len))?;

        if size < 3 || size > len - HEADER_SIZE {
            return Err(Error::malformed(
                "NVAR extended header",
                format!("Size {size:#x} out of bounds"),
                entry,
            ));
        }

        let raw = &entry[len - size..];
        let ext_attributes = NVarExtAttributes::from_bits_retain(raw[0]);
        let mut unknown = raw[0] & UNKNOWN_EXT_MASK != 0;

        let checksum = ext_attributes
            .contains(NVarExtAttributes::CHECKSUM)
            .then(|| raw[size - 3]);

        let (timestamp, hash) = if attributes.contains(NVarAttributes::AUTH_WRITE) {
            match raw.get(1..1 + 8 + HASH_SIZE) {
                Some(auth) => {
                    let mut ts = [0u8; 8];
                    ts.copy_from_slice(&auth[..8]);
                    (Some(u64::from_le_bytes(ts)), Some(hex::encode(&auth[8..])))
                }
                None => {
                    unknown = true;
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let header = Self {
            attributes: ext_attributes,
            checksum,
            timestamp,
            hash,
            raw: raw.to_vec(),
        };

        Ok((header, unknown))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NVar {
    #[serde(skip)]
    pub buf: Vec<u8>,
    pub extract_path: String,

    /// Offset of the entry within its store.
    pub offset: u64,
    pub entry_type: NVarEntryType,
    pub attributes: NVarAttributes,
    /// Offset of the next entry in the chain, relative to this one.
    pub next: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid_index: Option<u8>,
    pub guid: Guid,
    pub name: String,
    /// Offset of the variable data relative to the entry start.
    pub data_offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext_header: Option<NVarExtHeader>,
    /// The extended header has attributes or a layout this parser does not
    /// understand. The entry is kept verbatim.
    #[serde(default)]
    pub unknown_format: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nvar_store: Option<NVarStore>,
}

/// Value of the `next` field marking the end of a chain.
pub fn next_sentinel(polarity: u8) -> u32 {
    if polarity == 0xff { 0xff_ffff } else { 0 }
}

impl NVar {
    /// Parse the entry at the start of `buf`. Names and GUIDs of data-only
    /// entries are resolved later by the store.
    fn parse(buf: &[u8], offset: u64, polarity: u8, guids: &mut GuidTable<'_>) -> Result<Self> {
        let (raw, _) = RawHeader::read_from_prefix(buf)
            .map_err(|_| Error::truncated("NVAR header", HEADER_SIZE, buf.len()))?;

        if &raw.signature != SIGNATURE {
            return Err(Error::malformed("NVAR header", "Invalid signature", buf));
        }

        let size = usize::from(raw.size.get());
        if size < HEADER_SIZE {
            return Err(Error::malformed(
                "NVAR header",
                format!("Size {size:#x} is smaller than the header"),
                buf,
            ));
        }
        let entry = buf
            .get(..size)
            .ok_or_else(|| Error::truncated("NVAR entry", size, buf.len()))?;

        let attributes = NVarAttributes::from_bits_retain(raw.attributes);
        let mut var = Self {
            buf: entry.to_vec(),
            offset,
            attributes,
            next: util::read_u24(raw.next),
            data_offset: HEADER_SIZE as u64,
            ..Default::default()
        };

        let mut data_end = size;
        if attributes.contains(NVarAttributes::EXT_HEADER) {
            let (ext, unknown) = NVarExtHeader::parse(entry, attributes)?;
            if unknown {
                warn!("NVAR entry at {offset:#x} has an unknown extended header format");
            }
            data_end -= ext.raw.len();
            var.unknown_format = unknown;
            var.ext_header = Some(ext);
        }

        if !attributes.contains(NVarAttributes::DATA_ONLY) {
            let mut cursor = HEADER_SIZE;

            if attributes.contains(NVarAttributes::GUID) {
                var.guid = entry
                    .get(cursor..data_end)
                    .and_then(Guid::from_slice)
                    .ok_or_else(|| Error::truncated("NVAR GUID", GUID_SIZE, data_end - cursor))?;
                cursor += GUID_SIZE;
            } else {
                let index = *entry
                    .get(cursor..data_end)
                    .and_then(|s| s.first())
                    .ok_or_else(|| Error::truncated("NVAR GUID index", 1, 0))?;
                var.guid_index = Some(index);
                var.guid = guids.get(index)?;
                cursor += 1;
            }

            let name_buf = entry.get(cursor..data_end).unwrap_or_default();
            let consumed = if attributes.contains(NVarAttributes::ASCII_NAME) {
                let n = name_buf.find_byte(0).map_or(name_buf.len(), |n| n + 1);
                var.name = name_buf[..n].trim_end_with(|c| c == '\0').to_str_lossy().into_owned();
                n
            } else {
                let (name, n) = util::decode_ucs2(name_buf);
                var.name = name;
                n
            };
            cursor += consumed;

            var.data_offset = cursor as u64;
        }

        let data = &var.buf[var.data_offset as usize..data_end];
        if attributes.contains(NVarAttributes::VALID) && data.starts_with(SIGNATURE) {
            match NVarStore::parse(data, polarity) {
                Ok(store) => var.nvar_store = Some(store),
                Err(e) => debug!("NVAR data at {offset:#x} is not a nested store: {e}"),
            }
        }

        Ok(var)
    }

    fn ext_len(&self) -> usize {
        self.ext_header.as_ref().map_or(0, |e| e.raw.len())
    }

    /// Variable contents, between the name and the extended header.
    pub fn data(&self) -> &[u8] {
        let end = self.buf.len().saturating_sub(self.ext_len());
        self.buf
            .get(self.data_offset as usize..end)
            .unwrap_or_default()
    }

    fn is_valid(&self) -> bool {
        self.attributes.contains(NVarAttributes::VALID)
    }

    /// Rebuild the entry around new data, keeping the header fields, name,
    /// GUID reference and extended header metadata.
    pub fn rebuild(&mut self, data: &[u8]) -> Result<()> {
        let prefix_len = self.data_offset as usize;
        let prefix = self
            .buf
            .get(HEADER_SIZE..prefix_len)
            .ok_or_else(|| Error::truncated("NVAR entry", prefix_len, self.buf.len()))?
            .to_vec();
        let mut ext = self.ext_header.as_ref().map(|e| e.raw.clone()).unwrap_or_default();

        let size = HEADER_SIZE + prefix.len() + data.len() + ext.len();
        let size16 = u16::try_from(size).map_err(|_| Error::SizeTooLarge {
            what: "NVAR entry",
            size: size as u64,
        })?;

        if let Some(header) = &mut self.ext_header
            && header.attributes.contains(NVarExtAttributes::CHECKSUM)
            && !self.unknown_format
            && ext.len() >= 3
        {
            let sum = util::checksum8(data)
                .wrapping_add(util::checksum8(&size16.to_le_bytes()))
                .wrapping_add(self.attributes.bits());
            let checksum = sum.wrapping_neg();
            let pos = ext.len() - 3;
            ext[pos] = checksum;
            header.checksum = Some(checksum);
            header.raw.clone_from(&ext);
        }

        let raw = RawHeader {
            signature: *SIGNATURE,
            size: size16.into(),
            next: util::write_u24(self.next),
            attributes: self.attributes.bits(),
        };

        let mut buf = Vec::with_capacity(size);
        buf.extend_from_slice(raw.as_bytes());
        buf.extend_from_slice(&prefix);
        buf.extend_from_slice(data);
        buf.extend_from_slice(&ext);

        self.buf = buf;

        Ok(())
    }

    /// Re-serialize valid entries that carry a nested store.
    pub fn assemble(&mut self) -> Result<()> {
        if !self.is_valid() {
            return Ok(());
        }

        if let Some(store) = &self.nvar_store {
            let data = store.buf.clone();
            self.rebuild(&data)?;
        }

        Ok(())
    }

    pub fn apply(&mut self, v: &mut dyn Visitor) -> visitors::Result<()> {
        v.visit(Node::NVar(self))
    }

    pub fn apply_children(&mut self, v: &mut dyn Visitor) -> visitors::Result<()> {
        if let Some(store) = &mut self.nvar_store {
            store.apply(v)?;
        }

        Ok(())
    }
}

/// Lazily read view of the GUID table at the end of a store.
struct GuidTable<'a> {
    buf: &'a [u8],
    guids: Vec<Guid>,
}

impl<'a> GuidTable<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, guids: vec![] }
    }

    fn get(&mut self, index: u8) -> Result<Guid> {
        let index = usize::from(index);

        while self.guids.len() <= index {
            let i = self.guids.len();
            let offset = self
                .buf
                .len()
                .checked_sub((i + 1) * GUID_SIZE)
                .ok_or_else(|| Error::truncated("NVAR GUID table", (i + 1) * GUID_SIZE, self.buf.len()))?;
            let guid = Guid::from_slice(&self.buf[offset..])
                .ok_or_else(|| Error::truncated("NVAR GUID table", GUID_SIZE, 0))?;
            self.guids.push(guid);
        }

        Ok(self.guids[index])
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NVarStore {
    #[serde(skip)]
    pub buf: Vec<u8>,
    pub extract_path: String,

    pub entries: Vec<NVar>,
    /// GUID table in index order. Stored reversed at the end of the buffer.
    pub guid_store: Vec<Guid>,
    /// Offset of the first byte after the last entry.
    pub free_space_offset: u64,
    pub polarity: u8,
}

impl NVarStore {
    /// Parse a store occupying all of `buf`.
    pub fn parse(buf: &[u8], polarity: u8) -> Result<Self> {
        let mut table = GuidTable::new(buf);
        let mut entries: Vec<NVar> = vec![];
        let mut offset = 0;

        loop {
            let Some(remain) = buf.get(offset..) else {
                break;
            };
            if remain.len() < HEADER_SIZE
                || util::is_erased(remain, polarity)
                || !remain.starts_with(SIGNATURE)
            {
                break;
            }

            let entry = NVar::parse(remain, offset as u64, polarity, &mut table)?;
            offset += entry.buf.len();
            entries.push(entry);
        }

        if entries.is_empty() {
            return Err(Error::malformed("NVAR store", "No entries", buf));
        }

        let guid_store = table.guids;
        let table_start = buf.len() - guid_store.len() * GUID_SIZE;
        if offset > table_start {
            return Err(Error::malformed(
                "NVAR store",
                format!("Entries end at {offset:#x}, past the GUID table at {table_start:#x}"),
                buf,
            ));
        }

        resolve_links(&mut entries, polarity);

        Ok(Self {
            buf: buf.to_vec(),
            entries,
            guid_store,
            free_space_offset: offset as u64,
            polarity,
            ..Default::default()
        })
    }

    fn guid_table_len(&self) -> usize {
        self.guid_store.len() * GUID_SIZE
    }

    /// Concatenate the entries, erase fill up to the GUID table and append
    /// the table. The store keeps its size.
    pub fn assemble(&mut self) -> Result<()> {
        let size = self.buf.len();
        let table_start = size.checked_sub(self.guid_table_len()).unwrap_or_default();

        let mut buf = Vec::with_capacity(size);
        for entry in &self.entries {
            buf.extend_from_slice(&entry.buf);
        }

        if buf.len() > table_start {
            return Err(Error::InsufficientSpace {
                what: "NVAR store",
                needed: (buf.len() + self.guid_table_len()) as u64,
                available: size as u64,
            });
        }

        self.free_space_offset = buf.len() as u64;
        buf.resize(table_start, self.polarity);
        for guid in self.guid_store.iter().rev() {
            buf.extend_from_slice(guid.bytes());
        }

        self.buf = buf;

        Ok(())
    }

    /// Keep only the latest value of every variable. Each chain collapses
    /// into a single full entry and invalid entries are dropped.
    pub fn compact(&mut self) -> Result<()> {
        let sentinel = next_sentinel(self.polarity);
        let by_offset = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.offset, i))
            .collect::<HashMap<_, _>>();

        let mut compacted = vec![];

        for entry in &self.entries {
            match entry.entry_type {
                NVarEntryType::Full => compacted.push(entry.clone()),
                NVarEntryType::Link if !entry.attributes.contains(NVarAttributes::DATA_ONLY) => {
                    let mut latest = entry;
                    for _ in 0..self.entries.len() {
                        if latest.next == sentinel {
                            break;
                        }
                        let target = latest.offset + u64::from(latest.next);
                        match by_offset.get(&target).map(|i| &self.entries[*i]) {
                            Some(e) if e.attributes.contains(NVarAttributes::DATA_ONLY) => {
                                latest = e;
                            }
                            _ => break,
                        }
                    }

                    let mut full = entry.clone();
                    full.next = sentinel;
                    full.entry_type = NVarEntryType::Full;
                    full.rebuild(latest.data())?;
                    compacted.push(full);
                }
                _ => {}
            }
        }

        let mut offset = 0;
        for entry in &mut compacted {
            entry.offset = offset;
            offset += entry.buf.len() as u64;
        }

        self.entries = compacted;
        self.assemble()
    }

    pub fn apply(&mut self, v: &mut dyn Visitor) -> visitors::Result<()> {
        v.visit(Node::NVarStore(self))
    }

    pub fn apply_children(&mut self, v: &mut dyn Visitor) -> visitors::Result<()> {
        for entry in &mut self.entries {
            entry.apply(v)?;
        }

        Ok(())
    }
}

/// Classify entries and let data-only entries inherit the name and GUID of
/// the chain they belong to.
fn resolve_links(entries: &mut [NVar], polarity: u8) {
    let sentinel = next_sentinel(polarity);
    // Target offset -> index of the chain head.
    let mut links = HashMap::new();

    for i in 0..entries.len() {
        let head = if entries[i].attributes.contains(NVarAttributes::DATA_ONLY) {
            links.remove(&entries[i].offset)
        } else {
            Some(i)
        };

        if let Some(h) = head
            && h != i
        {
            let (guid, name, guid_index) =
                (entries[h].guid, entries[h].name.clone(), entries[h].guid_index);
            let entry = &mut entries[i];
            entry.guid = guid;
            entry.name = name;
            entry.guid_index = guid_index;
        }

        let entry = &mut entries[i];
        entry.entry_type = if !entry.is_valid() {
            NVarEntryType::Invalid
        } else if head.is_none() {
            NVarEntryType::InvalidLink
        } else if entry.next != sentinel {
            NVarEntryType::Link
        } else if entry.attributes.contains(NVarAttributes::DATA_ONLY) {
            NVarEntryType::Data
        } else {
            NVarEntryType::Full
        };

        if entry.next != sentinel
            && let Some(h) = head
        {
            links.insert(entry.offset + u64::from(entry.next), h);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(attributes: NVarAttributes, next: u32, body: &[u8]) -> Vec<u8> {
        let size = (HEADER_SIZE + body.len()) as u16;
        let raw = RawHeader {
            signature: *SIGNATURE,
            size: size.into(),
            next: util::write_u24(next),
            attributes: attributes.bits(),
        };
        let mut buf = raw.as_bytes().to_vec();
        buf.extend_from_slice(body);
        buf
    }

    fn named(index: u8, name: &str, data: &[u8]) -> Vec<u8> {
        let mut body = vec![index];
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        body.extend_from_slice(data);
        body
    }

    fn store_with_chain() -> Vec<u8> {
        let valid = NVarAttributes::VALID | NVarAttributes::ASCII_NAME;
        let first = entry(valid, 0, &named(0, "Setup", &[1]));
        let link_next = first.len() as u32;
        let first = entry(valid, link_next, &named(0, "Setup", &[1]));
        let update = entry(NVarAttributes::VALID | NVarAttributes::DATA_ONLY, 0xff_ffff, &[2]);
        let other = entry(valid, 0xff_ffff, &named(0, "Boot", &[3, 4]));
        let dead = entry(NVarAttributes::ASCII_NAME, 0xff_ffff, &named(0, "Old", &[5]));
        let orphan = entry(NVarAttributes::VALID | NVarAttributes::DATA_ONLY, 0xff_ffff, &[6]);

        let mut buf = [first, update, other, dead, orphan].concat();
        buf.resize(256 - GUID_SIZE, 0xff);
        buf.extend_from_slice(&[0x11; GUID_SIZE]);
        buf
    }

    #[test]
    fn parse_chain() {
        let store = NVarStore::parse(&store_with_chain(), 0xff).unwrap();
        let types = store.entries.iter().map(|e| e.entry_type).collect::<Vec<_>>();

        assert_eq!(
            types,
            [
                NVarEntryType::Link,
                NVarEntryType::Data,
                NVarEntryType::Full,
                NVarEntryType::Invalid,
                NVarEntryType::InvalidLink,
            ]
        );
        assert_eq!(store.entries[1].name, "Setup");
        assert_eq!(store.entries[1].guid, Guid([0x11; GUID_SIZE]));
        assert_eq!(store.entries[1].data(), &[2]);
        assert_eq!(store.guid_store.len(), 1);
    }

    #[test]
    fn compact_keeps_latest() {
        let mut store = NVarStore::parse(&store_with_chain(), 0xff).unwrap();
        assert_eq!(store.entries.len(), 5);

        store.compact().unwrap();
        assert_eq!(store.entries.len(), 2);
        assert_eq!(store.buf.len(), 256);

        let reparsed = NVarStore::parse(&store.buf, 0xff).unwrap();
        assert_eq!(reparsed.entries.len(), 2);
        assert_eq!(reparsed.entries[0].name, "Setup");
        assert_eq!(reparsed.entries[0].data(), &[2]);
        assert_eq!(reparsed.entries[0].entry_type, NVarEntryType::Full);
        assert_eq!(reparsed.entries[1].name, "Boot");
        assert_eq!(reparsed.entries[1].data(), &[3, 4]);
    }

    #[test]
    fn ext_header_checksum() {
        let attributes = NVarAttributes::VALID | NVarAttributes::ASCII_NAME | NVarAttributes::EXT_HEADER;
        let mut body = named(0, "Var", &[7, 8]);
        body.extend_from_slice(&[0x01, 0x00, 0x04, 0x00]);
        let mut buf = entry(attributes, 0xff_ffff, &body);
        buf.resize(64 - GUID_SIZE, 0xff);
        buf.extend_from_slice(&[0x22; GUID_SIZE]);

        let mut store = NVarStore::parse(&buf, 0xff).unwrap();
        let var = &mut store.entries[0];
        assert!(!var.unknown_format);
        assert_eq!(var.data(), &[7, 8]);

        var.rebuild(&[9]).unwrap();
        let checksum = var.ext_header.as_ref().and_then(|e| e.checksum).unwrap();
        let size = var.buf.len() as u16;
        let sum = 9u8
            .wrapping_add(util::checksum8(&size.to_le_bytes()))
            .wrapping_add(attributes.bits())
            .wrapping_add(checksum);
        assert_eq!(sum, 0);
        assert_eq!(var.data(), &[9]);
    }

    #[test]
    fn unknown_ext_format_is_flagged() {
        let attributes = NVarAttributes::VALID | NVarAttributes::ASCII_NAME | NVarAttributes::EXT_HEADER;
        let mut body = named(0, "Var", &[1]);
        body.extend_from_slice(&[0x80, 0x03, 0x00]);
        let mut buf = entry(attributes, 0xff_ffff, &body);
        buf.resize(64 - GUID_SIZE, 0xff);
        buf.extend_from_slice(&[0x22; GUID_SIZE]);

        let store = NVarStore::parse(&buf, 0xff).unwrap();
        assert!(store.entries[0].unknown_format);
    }

    #[test]
    fn rejects_missing_guid_table() {
        let valid = NVarAttributes::VALID | NVarAttributes::ASCII_NAME;
        let buf = entry(valid, 0xff_ffff, &named(5, "X", &[]));
        assert!(NVarStore::parse(&buf, 0xff).is_err());
    }
}
