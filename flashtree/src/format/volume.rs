// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zerocopy::{FromBytes, IntoBytes, little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    format::{
        Context, Error, Result,
        file::{self, File},
        firmware::{Node, Visitor},
        padding,
    },
    guid::{self, Guid},
    util::{self, NumBytes},
    visitors,
};

pub const SIGNATURE: &[u8; 4] = b"_FVH";
/// Offset of [`SIGNATURE`] from the start of the volume.
pub const SIGNATURE_OFFSET: usize = 40;
/// Files start 8-byte aligned relative to the volume.
pub const FILE_ALIGNMENT: usize = 8;
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

pub const ATTRIB_ERASE_POLARITY: u32 = 0x0000_0800;
pub const ATTRIB_ALIGNMENT: u32 = 0x001f_0000;
/// Attributes of volumes created from scratch.
const DEFAULT_ATTRIBUTES: u32 = 0x0004_feff;
pub const REVISION: u8 = 2;

const RAW_HEADER_SIZE: usize = 56;
const BLOCK_ENTRY_SIZE: usize = 8;
const EXT_HEADER_SIZE: usize = 20;
const LENGTH_OFFSET: usize = 32;
const CHECKSUM_OFFSET: usize = 50;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    zero_vector: [u8; 16],
    file_system_guid: Guid,
    length: little_endian::U64,
    signature: [u8; 4],
    attributes: little_endian::U32,
    header_length: little_endian::U16,
    checksum: little_endian::U16,
    ext_header_offset: little_endian::U16,
    reserved: u8,
    revision: u8,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawBlock {
    count: little_endian::U32,
    size: little_endian::U32,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawExtHeader {
    fv_name: Guid,
    ext_header_size: little_endian::U32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub count: u32,
    pub size: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FirmwareVolume {
    #[serde(skip)]
    pub buf: Vec<u8>,
    pub extract_path: String,

    pub file_system_guid: Guid,
    pub length: u64,
    pub attributes: u32,
    pub header_len: u16,
    pub checksum: u16,
    pub ext_header_offset: u16,
    pub revision: u8,
    pub blocks: Vec<Block>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fv_name: Option<Guid>,
    /// Offset of the first file.
    pub data_offset: u64,
    /// Absolute offset within the flash image, if known.
    pub fv_offset: u64,
    pub free_space: u64,
    /// Allow assembly to grow the volume past [`Self::length`].
    #[serde(default)]
    pub resizable: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<File>,
}

impl FirmwareVolume {
    /// Parse the volume at the start of `buf`. Trailing data is ignored.
    pub fn parse(buf: &[u8], ctx: &mut Context) -> Result<Self> {
        let (raw, _) = RawHeader::read_from_prefix(buf)
            .map_err(|_| Error::truncated("Firmware volume header", RAW_HEADER_SIZE, buf.len()))?;

        if &raw.signature != SIGNATURE {
            return Err(Error::malformed(
                "Firmware volume header",
                "Invalid signature",
                buf,
            ));
        }

        let length = raw.length.get();
        let header_len = usize::from(raw.header_length.get());

        let len = usize::try_from(length)
            .ok()
            .filter(|n| *n <= buf.len())
            .ok_or(Error::TruncatedBuffer {
                what: "Firmware volume",
                needed: length,
                available: buf.len() as u64,
            })?;

        if header_len < RAW_HEADER_SIZE || header_len > len {
            return Err(Error::malformed(
                "Firmware volume header",
                format!("Header length {header_len:#x} out of bounds"),
                buf,
            ));
        }

        let buf = &buf[..len];

        let mut blocks = vec![];
        let mut offset = RAW_HEADER_SIZE;
        while let Some(entry) = buf.get(offset..header_len.min(offset + BLOCK_ENTRY_SIZE)) {
            let Ok((block, _)) = RawBlock::read_from_prefix(entry) else {
                break;
            };
            if block.count.get() == 0 && block.size.get() == 0 {
                break;
            }
            blocks.push(Block {
                count: block.count.get(),
                size: block.size.get(),
            });
            offset += BLOCK_ENTRY_SIZE;
        }

        let attributes = raw.attributes.get();
        let polarity = polarity_of(attributes);
        ctx.set_polarity(polarity)?;

        let ext_header_offset = raw.ext_header_offset.get();
        let (fv_name, data_offset) = if ext_header_offset != 0 {
            let ext_off = usize::from(ext_header_offset);
            let (ext, _) = buf
                .get(ext_off..)
                .and_then(|b| RawExtHeader::read_from_prefix(b).ok())
                .ok_or_else(|| Error::truncated("Firmware volume extended header", ext_off + EXT_HEADER_SIZE, len))?;
            let end = ext_off as u64 + u64::from(ext.ext_header_size.get());
            (Some(ext.fv_name), end)
        } else {
            (None, header_len as u64)
        };

        let data_offset = padding::round(data_offset, FILE_ALIGNMENT as u64)
            .filter(|o| *o <= length)
            .ok_or_else(|| {
                Error::malformed(
                    "Firmware volume header",
                    format!("Data offset {data_offset:#x} past the end of the volume"),
                    buf,
                )
            })?;

        let mut fv = Self {
            buf: buf.to_vec(),
            file_system_guid: raw.file_system_guid,
            length,
            attributes,
            header_len: raw.header_length.get(),
            checksum: raw.checksum.get(),
            ext_header_offset,
            revision: raw.revision,
            blocks,
            fv_name,
            data_offset,
            ..Default::default()
        };

        if fv.is_ffs() {
            if let Err(e) = fv.parse_files(ctx) {
                warn!("Leaving volume {} opaque: {e}", fv.file_system_guid);
                fv.files.clear();
            }
        } else {
            warn!(
                "Leaving volume with file system {} ({}) opaque",
                fv.file_system_guid,
                guid::volume_label(&fv.file_system_guid).unwrap_or("unknown"),
            );
        }

        Ok(fv)
    }

    fn parse_files(&mut self, ctx: &mut Context) -> Result<()> {
        let polarity = self.polarity();
        let mut offset = self.data_offset as usize;

        loop {
            offset += padding::calc(offset, FILE_ALIGNMENT);
            let Some(remain) = self.buf.get(offset..) else {
                break;
            };
            if remain.len() < file::HEADER_SIZE
                || util::is_erased(&remain[..file::HEADER_SIZE], polarity)
            {
                break;
            }

            let file = File::parse(remain, ctx)?;
            offset += file.buf.len();
            self.files.push(file);
        }

        self.free_space = self.length.saturating_sub(offset as u64);
        debug!(
            "Volume {} has {} files and {:?} free",
            self.file_system_guid,
            self.files.len(),
            NumBytes(self.free_space),
        );

        Ok(())
    }

    /// Create an empty FFS2 volume of `size` bytes, which must be a multiple
    /// of the default block size.
    pub fn new_empty(size: u64, name: Guid, polarity: u8) -> Result<Self> {
        let block_size = u64::from(DEFAULT_BLOCK_SIZE);
        if size == 0 || size % block_size != 0 {
            return Err(Error::UnsupportedVariant {
                what: "Firmware volume size",
                detail: format!("{size:#x} is not a multiple of {block_size:#x}"),
            });
        }

        let count = u32::try_from(size / block_size).map_err(|_| Error::SizeTooLarge {
            what: "Firmware volume",
            size,
        })?;

        let mut attributes = DEFAULT_ATTRIBUTES & !ATTRIB_ERASE_POLARITY;
        if polarity == 0xff {
            attributes |= ATTRIB_ERASE_POLARITY;
        }

        let blocks = [Block {
            count,
            size: DEFAULT_BLOCK_SIZE,
        }];
        let mut buf = build_header(guid::FFS2, size, attributes, &blocks, Some(name))?;
        buf.resize(size as usize, polarity);

        Self::parse(&buf, &mut Context::default())
    }

    /// Create a resizable FFS2 volume holding `files`, used for volumes
    /// nested inside sections.
    pub fn with_files(attributes: u32, block_size: u32, files: Vec<File>) -> Result<Self> {
        let block_size = if block_size == 0 {
            DEFAULT_BLOCK_SIZE
        } else {
            block_size
        };
        let blocks = [Block {
            count: 1,
            size: block_size,
        }];

        let header = build_header(guid::FFS2, u64::from(block_size), attributes, &blocks, None)?;
        let mut fv = Self {
            file_system_guid: guid::FFS2,
            length: u64::from(block_size),
            attributes,
            header_len: header.len() as u16,
            revision: REVISION,
            blocks: blocks.to_vec(),
            data_offset: header.len() as u64,
            resizable: true,
            files,
            buf: header,
            ..Default::default()
        };
        fv.assemble(false)?;

        Ok(fv)
    }

    pub fn polarity(&self) -> u8 {
        polarity_of(self.attributes)
    }

    /// Whether the volume uses a file system this crate parses.
    pub fn is_ffs(&self) -> bool {
        self.file_system_guid == guid::FFS2 || self.file_system_guid == guid::FFS3
    }

    pub fn block_size(&self) -> u32 {
        self.blocks.first().map_or(DEFAULT_BLOCK_SIZE, |b| b.size)
    }

    pub fn signature_ok(&self) -> bool {
        self.buf.get(SIGNATURE_OFFSET..SIGNATURE_OFFSET + 4) == Some(SIGNATURE.as_slice())
    }

    /// Whether the 16-bit words of the header sum to zero.
    pub fn checksum_ok(&self) -> bool {
        self.buf
            .get(..usize::from(self.header_len))
            .is_some_and(|h| util::checksum16(h) == 0)
    }

    /// Rebuild the volume from its header and files. Opaque volumes are left
    /// untouched. `use_ffs3` promotes an FFS2 volume to FFS3.
    pub fn assemble(&mut self, use_ffs3: bool) -> Result<()> {
        if self.files.is_empty() {
            return Ok(());
        }

        let polarity = self.polarity();
        let prev_end = padding::round(
            self.length.saturating_sub(self.free_space),
            FILE_ALIGNMENT as u64,
        );
        let data_offset = self.data_offset as usize;
        let mut buf = self
            .buf
            .get(..data_offset)
            .ok_or_else(|| Error::truncated("Firmware volume header", data_offset, self.buf.len()))?
            .to_vec();

        for file in &self.files {
            let mut offset = buf.len() + padding::calc(buf.len(), FILE_ALIGNMENT);
            let alignment = file.alignment();

            if alignment > FILE_ALIGNMENT as u64 {
                let data = (offset + file.header_len()) as u64;
                let mut gap = padding::calc(data, alignment);

                if gap > 0 {
                    // A pad file needs room for its own header.
                    while gap < file::HEADER_SIZE as u64 {
                        gap += alignment;
                    }

                    let pad = File::new_pad(gap, polarity)?;
                    buf.resize(offset, polarity);
                    buf.extend_from_slice(&pad.buf);
                    offset = buf.len();
                }
            }

            buf.resize(offset, polarity);
            buf.extend_from_slice(&file.buf);
        }

        let used = buf.len() as u64;
        if used > self.length {
            if !self.resizable {
                return Err(Error::InsufficientSpace {
                    what: "Firmware volume",
                    needed: used,
                    available: self.length,
                });
            }

            let block_size = u64::from(self.block_size());
            let length = padding::round(used, block_size).ok_or(Error::SizeTooLarge {
                what: "Firmware volume",
                size: used,
            })?;
            let count = u32::try_from(length / block_size).map_err(|_| Error::SizeTooLarge {
                what: "Firmware volume",
                size: length,
            })?;

            match self.blocks.first_mut() {
                Some(b) => b.count = count,
                None => self.blocks.push(Block {
                    count,
                    size: block_size as u32,
                }),
            }
            self.length = length;
        }

        let length = usize::try_from(self.length).map_err(|_| Error::SizeTooLarge {
            what: "Firmware volume",
            size: self.length,
        })?;
        buf.resize(length, polarity);
        self.free_space = self.length - used;

        // Data past the files survives as long as they still end in the same
        // place.
        if let Some(end) = padding::round(used, FILE_ALIGNMENT as u64)
            && Some(end) == prev_end
            && let Ok(end) = usize::try_from(end)
            && let Some(tail) = self.buf.get(end..length)
        {
            buf[end..].copy_from_slice(tail);
        }

        if use_ffs3 && self.file_system_guid == guid::FFS2 {
            debug!("Promoting volume to FFS3");
            self.file_system_guid = guid::FFS3;
        }

        self.buf = buf;
        self.write_header();

        Ok(())
    }

    /// Write the modelled header fields back and recompute the checksum.
    fn write_header(&mut self) {
        let header_len = usize::from(self.header_len).min(self.buf.len());

        self.buf[16..32].copy_from_slice(self.file_system_guid.bytes());
        self.buf[LENGTH_OFFSET..LENGTH_OFFSET + 8].copy_from_slice(&self.length.to_le_bytes());

        for (i, block) in self.blocks.iter().enumerate() {
            let offset = RAW_HEADER_SIZE + i * BLOCK_ENTRY_SIZE;
            if offset + BLOCK_ENTRY_SIZE > header_len {
                break;
            }
            self.buf[offset..offset + 4].copy_from_slice(&block.count.to_le_bytes());
            self.buf[offset + 4..offset + 8].copy_from_slice(&block.size.to_le_bytes());
        }

        self.buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].fill(0);
        self.checksum = util::checksum16(&self.buf[..header_len]).wrapping_neg();
        self.buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&self.checksum.to_le_bytes());
    }

    pub fn apply(&mut self, v: &mut dyn Visitor) -> visitors::Result<()> {
        v.visit(Node::FirmwareVolume(self))
    }

    pub fn apply_children(&mut self, v: &mut dyn Visitor) -> visitors::Result<()> {
        for file in &mut self.files {
            file.apply(v)?;
        }

        Ok(())
    }
}

fn polarity_of(attributes: u32) -> u8 {
    if attributes & ATTRIB_ERASE_POLARITY != 0 {
        0xff
    } else {
        0x00
    }
}

/// Serialize a volume header, block map and optional extended header with a
/// valid checksum.
fn build_header(
    file_system_guid: Guid,
    length: u64,
    attributes: u32,
    blocks: &[Block],
    name: Option<Guid>,
) -> Result<Vec<u8>> {
    let header_len = RAW_HEADER_SIZE + (blocks.len() + 1) * BLOCK_ENTRY_SIZE;
    let ext_header_offset = if name.is_some() { header_len } else { 0 };

    let raw = RawHeader {
        zero_vector: [0; 16],
        file_system_guid,
        length: length.into(),
        signature: *SIGNATURE,
        attributes: attributes.into(),
        header_length: u16::try_from(header_len)
            .map_err(|_| Error::SizeTooLarge {
                what: "Firmware volume header",
                size: header_len as u64,
            })?
            .into(),
        checksum: 0.into(),
        ext_header_offset: (ext_header_offset as u16).into(),
        reserved: 0,
        revision: REVISION,
    };

    let mut buf = raw.as_bytes().to_vec();
    for block in blocks.iter().chain(std::iter::once(&Block::default())) {
        let raw = RawBlock {
            count: block.count.into(),
            size: block.size.into(),
        };
        buf.extend_from_slice(raw.as_bytes());
    }

    let checksum = util::checksum16(&buf).wrapping_neg();
    buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&checksum.to_le_bytes());

    if let Some(fv_name) = name {
        let ext = RawExtHeader {
            fv_name,
            ext_header_size: (EXT_HEADER_SIZE as u32).into(),
        };
        buf.extend_from_slice(ext.as_bytes());
        padding::extend_to_alignment(&mut buf, FILE_ALIGNMENT, 0xff);
    }

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::format::{file::FileType, section::Section};

    fn name() -> Guid {
        "01234567-89AB-CDEF-0123-456789ABCDEF".parse().unwrap()
    }

    #[test]
    fn empty_volume() {
        let fv = FirmwareVolume::new_empty(0x2000, name(), 0xff).unwrap();

        assert_eq!(fv.buf.len(), 0x2000);
        assert_eq!(fv.length, 0x2000);
        assert_eq!(fv.header_len, 72);
        assert_eq!(fv.fv_name, Some(name()));
        assert_eq!(fv.data_offset, 96);
        assert_eq!(fv.blocks, [Block { count: 2, size: 4096 }]);
        assert_eq!(fv.polarity(), 0xff);
        assert!(fv.checksum_ok());
        assert!(fv.files.is_empty());

        assert_matches!(
            FirmwareVolume::new_empty(0x1800, name(), 0xff),
            Err(Error::UnsupportedVariant { .. })
        );
    }

    #[test]
    fn assemble_files() {
        let mut fv = FirmwareVolume::new_empty(0x1000, name(), 0xff).unwrap();
        let ui = Section::new_ui("A").unwrap();
        let file = File::new(name(), FileType::DRIVER, vec![ui], 0xff).unwrap();
        fv.files.push(file.clone());
        fv.files.push(file);
        fv.assemble(false).unwrap();

        assert_eq!(fv.buf.len(), 0x1000);
        assert!(fv.checksum_ok());

        let parsed = FirmwareVolume::parse(&fv.buf, &mut Context::default()).unwrap();
        assert_eq!(parsed.files.len(), 2);
        assert_eq!(parsed.files[1].name(), Some("A"));
        assert_eq!(parsed.free_space, fv.free_space);
    }

    #[test]
    fn alignment_inserts_pad_file() {
        let mut fv = FirmwareVolume::new_empty(0x2000, name(), 0xff).unwrap();
        let mut file = File::new_raw(name(), FileType::RAW, &[1, 2, 3, 4], 0xff).unwrap();
        file.set_alignment(4096).unwrap();
        file.assemble().unwrap();
        fv.files.push(file);
        fv.assemble(false).unwrap();

        let parsed = FirmwareVolume::parse(&fv.buf, &mut Context::default()).unwrap();
        assert_eq!(parsed.files.len(), 2);
        assert!(parsed.files[0].is_pad());
        assert_eq!((0x60 + parsed.files[0].buf.len() + file::HEADER_SIZE) % 4096, 0);
    }

    #[test]
    fn no_space() {
        let mut fv = FirmwareVolume::new_empty(0x1000, name(), 0xff).unwrap();
        let big = File::new_raw(name(), FileType::RAW, &[0u8; 0x1000], 0xff).unwrap();
        fv.files.push(big);

        assert_matches!(fv.assemble(false), Err(Error::InsufficientSpace { .. }));

        fv.resizable = true;
        fv.assemble(true).unwrap();
        assert_eq!(fv.length, 0x2000);
        assert_eq!(fv.blocks[0].count, 2);
        assert_eq!(fv.file_system_guid, guid::FFS3);
        assert!(fv.checksum_ok());
    }

    #[test]
    fn trailing_data_survives_unchanged_layout() {
        let mut fv = FirmwareVolume::new_empty(0x1000, name(), 0xff).unwrap();
        let ui = Section::new_ui("A").unwrap();
        fv.files.push(File::new(name(), FileType::DRIVER, vec![ui], 0xff).unwrap());
        fv.assemble(false).unwrap();
        fv.buf[0xff0..].fill(0x5a);

        let mut parsed = FirmwareVolume::parse(&fv.buf, &mut Context::default()).unwrap();
        parsed.assemble(false).unwrap();
        assert_eq!(parsed.buf, fv.buf);

        parsed.files.push(File::new_raw(name(), FileType::RAW, &[1; 8], 0xff).unwrap());
        parsed.assemble(false).unwrap();
        assert!(parsed.buf[0xff0..].iter().all(|b| *b == 0xff));
    }

    #[test]
    fn opaque_volume_types() {
        let mut fv = FirmwareVolume::new_empty(0x1000, name(), 0xff).unwrap();
        fv.file_system_guid = guid::EVSA;
        fv.write_header();

        let parsed = FirmwareVolume::parse(&fv.buf, &mut Context::default()).unwrap();
        assert!(parsed.files.is_empty());
        assert_eq!(parsed.buf, fv.buf);
    }

    #[test]
    fn polarity_mismatch() {
        let a = FirmwareVolume::new_empty(0x1000, name(), 0xff).unwrap();
        let b = FirmwareVolume::new_empty(0x1000, name(), 0x00).unwrap();

        let mut ctx = Context::default();
        FirmwareVolume::parse(&a.buf, &mut ctx).unwrap();
        assert_matches!(
            FirmwareVolume::parse(&b.buf, &mut ctx),
            Err(Error::PolarityMismatch { .. })
        );

        ctx.allow_polarity_mismatch = true;
        FirmwareVolume::parse(&b.buf, &mut ctx).unwrap();
    }
}
