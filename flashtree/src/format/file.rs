// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, str::FromStr};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::warn;
use zerocopy::{FromBytes, IntoBytes, little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    format::{
        Context, Error, Result,
        firmware::{Node, Visitor},
        nvram::NVarStore,
        section::{self, Section, SectionType},
    },
    guid::{self, Guid},
    util, visitors,
};

pub const HEADER_SIZE: usize = 24;
pub const LARGE_HEADER_SIZE: usize = 32;
/// Largest size that fits the 24-bit size field.
pub const MAX_SMALL_SIZE: u64 = 0xff_ffff;
/// Body checksum of files without [`FileAttributes::CHECKSUM`].
pub const EMPTY_BODY_CHECKSUM: u8 = 0xaa;

const HEADER_CHECKSUM_OFFSET: usize = 16;
const BODY_CHECKSUM_OFFSET: usize = 17;
const STATE_OFFSET: usize = 23;

/// HEADER_CONSTRUCTION | HEADER_VALID | DATA_VALID, before applying the
/// erase polarity.
const STATE_VALID: u8 = 0x07;

const ALIGNMENTS: [u64; 8] = [1, 16, 128, 512, 1 << 10, 4 << 10, 32 << 10, 64 << 10];
const ALIGNMENTS_2: [u64; 8] = [
    128 << 10,
    256 << 10,
    512 << 10,
    1 << 20,
    2 << 20,
    4 << 20,
    8 << 20,
    16 << 20,
];

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileType(pub u8);

impl FileType {
    pub const ALL: Self = Self(0x00);
    pub const RAW: Self = Self(0x01);
    pub const FREEFORM: Self = Self(0x02);
    pub const SEC_CORE: Self = Self(0x03);
    pub const PEI_CORE: Self = Self(0x04);
    pub const DXE_CORE: Self = Self(0x05);
    pub const PEIM: Self = Self(0x06);
    pub const DRIVER: Self = Self(0x07);
    pub const COMBINED_PEIM_DRIVER: Self = Self(0x08);
    pub const APPLICATION: Self = Self(0x09);
    pub const MM: Self = Self(0x0a);
    pub const FIRMWARE_VOLUME_IMAGE: Self = Self(0x0b);
    pub const COMBINED_MM_DXE: Self = Self(0x0c);
    pub const MM_CORE: Self = Self(0x0d);
    pub const MM_STANDALONE: Self = Self(0x0e);
    pub const MM_CORE_STANDALONE: Self = Self(0x0f);
    pub const PAD: Self = Self(0xf0);

    const NAMES: &[(Self, &'static str)] = &[
        (Self::ALL, "ALL"),
        (Self::RAW, "RAW"),
        (Self::FREEFORM, "FREEFORM"),
        (Self::SEC_CORE, "SEC_CORE"),
        (Self::PEI_CORE, "PEI_CORE"),
        (Self::DXE_CORE, "DXE_CORE"),
        (Self::PEIM, "PEIM"),
        (Self::DRIVER, "DRIVER"),
        (Self::COMBINED_PEIM_DRIVER, "COMBINED_PEIM_DRIVER"),
        (Self::APPLICATION, "APPLICATION"),
        (Self::MM, "MM"),
        (Self::FIRMWARE_VOLUME_IMAGE, "FIRMWARE_VOLUME_IMAGE"),
        (Self::COMBINED_MM_DXE, "COMBINED_MM_DXE"),
        (Self::MM_CORE, "MM_CORE"),
        (Self::MM_STANDALONE, "MM_STANDALONE"),
        (Self::MM_CORE_STANDALONE, "MM_CORE_STANDALONE"),
        (Self::PAD, "PAD"),
    ];

    pub fn name(self) -> Option<&'static str> {
        Self::NAMES.iter().find(|(t, _)| *t == self).map(|(_, n)| *n)
    }

    /// Whether the file body is a stream of sections.
    pub fn has_sections(self) -> bool {
        (Self::FREEFORM.0..=Self::MM_CORE_STANDALONE.0).contains(&self.0)
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(n) => f.write_str(n),
            None => write!(f, "{:#04x}", self.0),
        }
    }
}

impl fmt::Debug for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for FileType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let name = s.strip_prefix("EFI_FV_FILETYPE_").unwrap_or(s);
        if let Some((t, _)) = Self::NAMES.iter().find(|(_, n)| n.eq_ignore_ascii_case(name)) {
            return Ok(*t);
        }

        let hex = s.strip_prefix("0x").unwrap_or(s);
        u8::from_str_radix(hex, 16)
            .map(Self)
            .map_err(|_| format!("Unknown file type: {s:?}"))
    }
}

bitflags! {
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
    pub struct FileAttributes: u8 {
        /// An 8-byte size follows the common header.
        const LARGE_FILE = 1 << 0;
        /// Selects the large alignment table.
        const DATA_ALIGNMENT_2 = 1 << 1;
        const FIXED = 1 << 2;
        const DATA_ALIGNMENT = 0b111 << 3;
        /// The body checksum covers the file data.
        const CHECKSUM = 1 << 6;

        const _ = !0;
    }
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    name: Guid,
    header_checksum: u8,
    body_checksum: u8,
    file_type: u8,
    attributes: u8,
    size: [u8; 3],
    state: u8,
}

/// State byte of a valid file on flash with the given erase polarity.
pub fn valid_state(polarity: u8) -> u8 {
    if polarity == 0xff {
        !STATE_VALID
    } else {
        STATE_VALID
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct File {
    #[serde(skip)]
    pub buf: Vec<u8>,
    pub extract_path: String,

    pub guid: Guid,
    pub file_type: FileType,
    pub attributes: FileAttributes,
    pub state: u8,
    pub header_checksum: u8,
    pub body_checksum: u8,
    /// Total size including the header.
    pub extended_size: u64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sections: Vec<Section>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nvar_store: Option<NVarStore>,
}

impl File {
    /// Parse the file at the start of `buf`. Trailing data is ignored.
    pub fn parse(buf: &[u8], ctx: &mut Context) -> Result<Self> {
        let (raw, rest) = RawHeader::read_from_prefix(buf)
            .map_err(|_| Error::truncated("File header", HEADER_SIZE, buf.len()))?;
        let attributes = FileAttributes::from_bits_retain(raw.attributes);

        let sentinel = util::read_u24(raw.size) == section::SIZE_SENTINEL;
        if sentinel != attributes.contains(FileAttributes::LARGE_FILE) {
            return Err(Error::malformed(
                "File",
                format!("Size sentinel does not agree with attributes {attributes:?}"),
                buf,
            ));
        }

        let (header_len, size) = if attributes.contains(FileAttributes::LARGE_FILE) {
            let (ext, _) = little_endian::U64::read_from_prefix(rest)
                .map_err(|_| Error::truncated("File extended size", LARGE_HEADER_SIZE, buf.len()))?;
            (LARGE_HEADER_SIZE, ext.get())
        } else {
            (HEADER_SIZE, u64::from(util::read_u24(raw.size)))
        };

        if size < header_len as u64 {
            return Err(Error::malformed(
                "File",
                format!("Size {size:#x} is smaller than the header"),
                buf,
            ));
        }

        let len = usize::try_from(size)
            .ok()
            .filter(|n| *n <= buf.len())
            .ok_or(Error::TruncatedBuffer {
                what: "File",
                needed: size,
                available: buf.len() as u64,
            })?;

        let mut file = Self {
            buf: buf[..len].to_vec(),
            guid: raw.name,
            file_type: FileType(raw.file_type),
            attributes,
            state: raw.state,
            header_checksum: raw.header_checksum,
            body_checksum: raw.body_checksum,
            extended_size: size,
            ..Default::default()
        };

        let body = &file.buf[header_len..];

        if file.file_type.has_sections() {
            file.sections = section::parse_sections(body, ctx)?;
        } else if file.file_type == FileType::RAW && file.guid == guid::NVAR {
            match NVarStore::parse(body, ctx.polarity()) {
                Ok(store) => file.nvar_store = Some(store),
                Err(e) => warn!("NVAR file {} left opaque: {e}", file.guid),
            }
        }

        Ok(file)
    }

    /// Build a file from sections.
    pub fn new(guid: Guid, file_type: FileType, sections: Vec<Section>, polarity: u8) -> Result<Self> {
        let mut file = Self {
            guid,
            file_type,
            state: valid_state(polarity),
            sections,
            ..Default::default()
        };
        let body = section::join(&file.sections);
        file.rebuild(&body)?;
        Ok(file)
    }

    /// Build a file with an opaque body.
    pub fn new_raw(guid: Guid, file_type: FileType, data: &[u8], polarity: u8) -> Result<Self> {
        let mut file = Self {
            guid,
            file_type,
            state: valid_state(polarity),
            ..Default::default()
        };
        file.rebuild(data)?;
        Ok(file)
    }

    /// Build a pad file occupying exactly `size` bytes, including the header.
    pub fn new_pad(size: u64, polarity: u8) -> Result<Self> {
        let header_len = if size > MAX_SMALL_SIZE {
            LARGE_HEADER_SIZE
        } else {
            HEADER_SIZE
        };
        let body_len = size
            .checked_sub(header_len as u64)
            .and_then(|n| usize::try_from(n).ok())
            .ok_or(Error::SizeTooLarge {
                what: "Pad file",
                size,
            })?;

        let mut file = Self {
            guid: Guid([0xff; 16]),
            file_type: FileType::PAD,
            attributes: if header_len == LARGE_HEADER_SIZE {
                FileAttributes::LARGE_FILE
            } else {
                FileAttributes::empty()
            },
            state: valid_state(polarity),
            ..Default::default()
        };
        file.rebuild(&vec![polarity; body_len])?;
        Ok(file)
    }

    pub fn header_len(&self) -> usize {
        if self.attributes.contains(FileAttributes::LARGE_FILE) {
            LARGE_HEADER_SIZE
        } else {
            HEADER_SIZE
        }
    }

    pub fn body(&self) -> &[u8] {
        self.buf.get(self.header_len()..).unwrap_or_default()
    }

    /// Required alignment of the file data in bytes.
    pub fn alignment(&self) -> u64 {
        let index = usize::from((self.attributes & FileAttributes::DATA_ALIGNMENT).bits() >> 3);

        if self.attributes.contains(FileAttributes::DATA_ALIGNMENT_2) {
            ALIGNMENTS_2[index]
        } else {
            ALIGNMENTS[index]
        }
    }

    /// Set the data alignment. Only the values from the two alignment tables
    /// are representable.
    pub fn set_alignment(&mut self, alignment: u64) -> Result<()> {
        let (large, index) = if let Some(i) = ALIGNMENTS.iter().position(|a| *a == alignment) {
            (false, i)
        } else if let Some(i) = ALIGNMENTS_2.iter().position(|a| *a == alignment) {
            (true, i)
        } else {
            return Err(Error::UnsupportedVariant {
                what: "File alignment",
                detail: format!("{alignment:#x}"),
            });
        };

        self.attributes.remove(FileAttributes::DATA_ALIGNMENT | FileAttributes::DATA_ALIGNMENT_2);
        self.attributes |= FileAttributes::from_bits_retain((index as u8) << 3);
        self.attributes.set(FileAttributes::DATA_ALIGNMENT_2, large);

        Ok(())
    }

    pub fn is_pad(&self) -> bool {
        self.file_type == FileType::PAD
    }

    /// Text of the first user interface section, searching through
    /// encapsulation sections.
    pub fn name(&self) -> Option<&str> {
        fn find(sections: &[Section]) -> Option<&str> {
            sections.iter().find_map(|s| {
                if s.section_type == SectionType::USER_INTERFACE {
                    s.name.as_deref()
                } else {
                    find(&s.encapsulated)
                }
            })
        }

        find(&self.sections)
    }

    fn compute_header_checksum(header: &[u8]) -> u8 {
        let mut header = header.to_vec();
        header[HEADER_CHECKSUM_OFFSET] = 0;
        header[BODY_CHECKSUM_OFFSET] = 0;
        header[STATE_OFFSET] = 0;

        util::checksum8(&header).wrapping_neg()
    }

    fn compute_body_checksum(&self, body: &[u8]) -> u8 {
        if self.attributes.contains(FileAttributes::CHECKSUM) {
            util::checksum8(body).wrapping_neg()
        } else {
            EMPTY_BODY_CHECKSUM
        }
    }

    /// Whether the stored header checksum makes the header sum to zero,
    /// ignoring the body checksum and state bytes.
    pub fn header_checksum_ok(&self) -> bool {
        self.buf
            .get(..self.header_len())
            .is_some_and(|h| Self::compute_header_checksum(h) == h[HEADER_CHECKSUM_OFFSET])
    }

    pub fn body_checksum_ok(&self) -> bool {
        self.buf
            .get(BODY_CHECKSUM_OFFSET)
            .is_some_and(|c| self.compute_body_checksum(self.body()) == *c)
    }

    /// Regenerate the buffer from the sections or the NVAR store. Opaque files
    /// are left untouched. Returns whether the file needed a large header,
    /// which requires an FFS3 volume.
    pub fn assemble(&mut self) -> Result<bool> {
        let body = if !self.sections.is_empty() {
            section::join(&self.sections)
        } else if let Some(store) = &self.nvar_store {
            store.buf.clone()
        } else {
            return Ok(self.header_len() == LARGE_HEADER_SIZE);
        };

        self.rebuild(&body)
    }

    /// A large header is kept once chosen, so the size of the file only
    /// changes with its body.
    fn rebuild(&mut self, body: &[u8]) -> Result<bool> {
        let large = self.attributes.contains(FileAttributes::LARGE_FILE)
            || (HEADER_SIZE + body.len()) as u64 > MAX_SMALL_SIZE;
        self.attributes.set(FileAttributes::LARGE_FILE, large);

        let header_len = self.header_len();
        let size = (header_len + body.len()) as u64;

        let raw = RawHeader {
            name: self.guid,
            header_checksum: 0,
            body_checksum: 0,
            file_type: self.file_type.0,
            attributes: self.attributes.bits(),
            size: if large {
                util::write_u24(section::SIZE_SENTINEL)
            } else {
                util::write_u24(size as u32)
            },
            state: self.state,
        };

        let mut buf = Vec::with_capacity(header_len + body.len());
        buf.extend_from_slice(raw.as_bytes());
        if large {
            buf.extend_from_slice(&size.to_le_bytes());
        }

        self.header_checksum = Self::compute_header_checksum(&buf);
        self.body_checksum = self.compute_body_checksum(body);
        buf[HEADER_CHECKSUM_OFFSET] = self.header_checksum;
        buf[BODY_CHECKSUM_OFFSET] = self.body_checksum;
        buf.extend_from_slice(body);

        self.buf = buf;
        self.extended_size = size;

        Ok(large)
    }

    pub fn apply(&mut self, v: &mut dyn Visitor) -> visitors::Result<()> {
        v.visit(Node::File(self))
    }

    pub fn apply_children(&mut self, v: &mut dyn Visitor) -> visitors::Result<()> {
        for section in &mut self.sections {
            section.apply(v)?;
        }
        if let Some(store) = &mut self.nvar_store {
            store.apply(v)?;
        }

        Ok(())
    }
}
