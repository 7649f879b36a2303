// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Sections are the payload containers inside files. Encapsulation sections
//! (compression, GUID-defined) hold further sections, firmware volume image
//! sections hold a nested volume and everything else is a leaf.

use std::{fmt, str::FromStr};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zerocopy::{FromBytes, IntoBytes, little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    format::{
        Context, Error, Result,
        compression::{self, Codec},
        depex::{self, DepExOp},
        firmware::{Node, Visitor},
        nvram::NVarStore,
        padding,
        volume::FirmwareVolume,
    },
    guid::Guid,
    util, visitors,
};

pub const HEADER_SIZE: usize = 4;
pub const EXT_HEADER_SIZE: usize = 8;
/// Value of the 24-bit size field when the real size follows the header.
pub const SIZE_SENTINEL: u32 = 0xff_ffff;
/// Sections inside a file or encapsulation section start 4-byte aligned.
pub const ALIGNMENT: usize = 4;

const GUID_DEFINED_HEADER_SIZE: usize = 20;
const COMPRESSION_HEADER_SIZE: usize = 5;
const NOT_COMPRESSED: u8 = 0;

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SectionType(pub u8);

impl SectionType {
    pub const COMPRESSION: Self = Self(0x01);
    pub const GUID_DEFINED: Self = Self(0x02);
    pub const DISPOSABLE: Self = Self(0x03);
    pub const PE32: Self = Self(0x10);
    pub const PIC: Self = Self(0x11);
    pub const TE: Self = Self(0x12);
    pub const DXE_DEPEX: Self = Self(0x13);
    pub const VERSION: Self = Self(0x14);
    pub const USER_INTERFACE: Self = Self(0x15);
    pub const COMPATIBILITY16: Self = Self(0x16);
    pub const FIRMWARE_VOLUME_IMAGE: Self = Self(0x17);
    pub const FREEFORM_SUBTYPE_GUID: Self = Self(0x18);
    pub const RAW: Self = Self(0x19);
    pub const PEI_DEPEX: Self = Self(0x1b);
    pub const MM_DEPEX: Self = Self(0x1c);

    const NAMES: &[(Self, &'static str)] = &[
        (Self::COMPRESSION, "COMPRESSION"),
        (Self::GUID_DEFINED, "GUID_DEFINED"),
        (Self::DISPOSABLE, "DISPOSABLE"),
        (Self::PE32, "PE32"),
        (Self::PIC, "PIC"),
        (Self::TE, "TE"),
        (Self::DXE_DEPEX, "DXE_DEPEX"),
        (Self::VERSION, "VERSION"),
        (Self::USER_INTERFACE, "USER_INTERFACE"),
        (Self::COMPATIBILITY16, "COMPATIBILITY16"),
        (Self::FIRMWARE_VOLUME_IMAGE, "FIRMWARE_VOLUME_IMAGE"),
        (Self::FREEFORM_SUBTYPE_GUID, "FREEFORM_SUBTYPE_GUID"),
        (Self::RAW, "RAW"),
        (Self::PEI_DEPEX, "PEI_DEPEX"),
        (Self::MM_DEPEX, "MM_DEPEX"),
    ];

    pub fn name(self) -> Option<&'static str> {
        Self::NAMES.iter().find(|(t, _)| *t == self).map(|(_, n)| *n)
    }

    pub fn is_depex(self) -> bool {
        matches!(self, Self::DXE_DEPEX | Self::PEI_DEPEX | Self::MM_DEPEX)
    }
}

impl fmt::Display for SectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(n) => f.write_str(n),
            None => write!(f, "{:#04x}", self.0),
        }
    }
}

impl fmt::Debug for SectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for SectionType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Some((t, _)) = Self::NAMES.iter().find(|(_, n)| n.eq_ignore_ascii_case(s)) {
            return Ok(*t);
        }

        let hex = s.strip_prefix("0x").unwrap_or(s);
        u8::from_str_radix(hex, 16)
            .map(Self)
            .map_err(|_| format!("Unknown section type: {s:?}"))
    }
}

bitflags! {
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
    pub struct GuidDefinedAttributes: u16 {
        /// The payload must be decoded with the codec named by the GUID.
        const PROCESSING_REQUIRED = 1 << 0;
        const AUTH_STATUS_VALID = 1 << 1;

        const _ = !0;
    }
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    size: [u8; 3],
    section_type: u8,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawGuidDefined {
    guid: Guid,
    data_offset: little_endian::U16,
    attributes: little_endian::U16,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawCompression {
    uncompressed_length: little_endian::U32,
    compression_type: u8,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuidDefined {
    pub guid: Guid,
    pub attributes: GuidDefinedAttributes,
    /// Name of the codec resolved from [`Self::guid`], if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    /// Vendor bytes between the fixed header and the data (eg. a CRC32).
    #[serde(with = "hex", default)]
    pub extra: Vec<u8>,
}

impl GuidDefined {
    fn codec(&self) -> Option<&'static dyn Codec> {
        if self.attributes.contains(GuidDefinedAttributes::PROCESSING_REQUIRED) {
            compression::codec_for_guid(&self.guid)
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionHeader {
    pub uncompressed_length: u32,
    pub compression_type: u8,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Section {
    #[serde(skip)]
    pub buf: Vec<u8>,
    pub extract_path: String,

    pub section_type: SectionType,
    /// Total size including the header.
    pub extended_size: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid_defined: Option<GuidDefined>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionHeader>,

    /// Text of a user interface section.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_number: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depex: Vec<DepExOp>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub encapsulated: Vec<Section>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<Box<FirmwareVolume>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nvar_store: Option<NVarStore>,
}

impl Section {
    /// Parse the section at the start of `buf`. Trailing data is ignored.
    pub fn parse(buf: &[u8], ctx: &mut Context) -> Result<Self> {
        let (raw, _) = RawHeader::read_from_prefix(buf)
            .map_err(|_| Error::truncated("Section header", HEADER_SIZE, buf.len()))?;
        let size = util::read_u24(raw.size);

        let (header_len, extended_size) = if size == SIZE_SENTINEL {
            let ext = buf
                .get(HEADER_SIZE..)
                .and_then(|b| little_endian::U32::read_from_prefix(b).ok())
                .ok_or_else(|| Error::truncated("Section extended size", EXT_HEADER_SIZE, buf.len()))?
                .0;
            (EXT_HEADER_SIZE, u64::from(ext.get()))
        } else {
            (HEADER_SIZE, u64::from(size))
        };

        if extended_size < header_len as u64 {
            return Err(Error::malformed(
                "Section",
                format!("Size {extended_size:#x} is smaller than the header"),
                buf,
            ));
        }

        let len = usize::try_from(extended_size)
            .ok()
            .filter(|n| *n <= buf.len())
            .ok_or_else(|| Error::TruncatedBuffer {
                what: "Section",
                needed: extended_size,
                available: buf.len() as u64,
            })?;

        let mut section = Self {
            buf: buf[..len].to_vec(),
            section_type: SectionType(raw.section_type),
            extended_size,
            ..Default::default()
        };

        section.decode_payload(header_len, ctx)?;

        Ok(section)
    }

    fn decode_payload(&mut self, header_len: usize, ctx: &mut Context) -> Result<()> {
        let body = &self.buf[header_len..];

        match self.section_type {
            SectionType::GUID_DEFINED => {
                let (raw, _) = RawGuidDefined::read_from_prefix(body).map_err(|_| {
                    Error::truncated("GUID-defined section header", GUID_DEFINED_HEADER_SIZE, body.len())
                })?;

                let data_offset = usize::from(raw.data_offset.get());
                let fixed_end = header_len + GUID_DEFINED_HEADER_SIZE;
                if data_offset < fixed_end || data_offset > self.buf.len() {
                    return Err(Error::malformed(
                        "GUID-defined section",
                        format!("Data offset {data_offset:#x} out of bounds"),
                        &self.buf,
                    ));
                }

                let mut info = GuidDefined {
                    guid: raw.guid,
                    attributes: GuidDefinedAttributes::from_bits_retain(raw.attributes.get()),
                    codec: None,
                    extra: self.buf[fixed_end..data_offset].to_vec(),
                };
                info.codec = compression::codec_for_guid(&info.guid).map(|c| c.name().to_owned());

                let data = &self.buf[data_offset..];

                if info.attributes.contains(GuidDefinedAttributes::PROCESSING_REQUIRED) {
                    match info.codec() {
                        Some(codec) => match codec.decode(data) {
                            Ok(plain) => self.encapsulated = try_parse_sections(&plain, ctx),
                            Err(e) => warn!("Leaving {} section opaque: {e}", codec.name()),
                        },
                        None => debug!("No codec for GUID-defined section {}", info.guid),
                    }
                } else {
                    self.encapsulated = try_parse_sections(data, ctx);
                }

                self.guid_defined = Some(info);
            }
            SectionType::COMPRESSION => {
                let (raw, data) = RawCompression::read_from_prefix(body).map_err(|_| {
                    Error::truncated("Compression section header", COMPRESSION_HEADER_SIZE, body.len())
                })?;

                if raw.compression_type == NOT_COMPRESSED {
                    self.encapsulated = try_parse_sections(data, ctx);
                } else {
                    debug!(
                        "Compression type {:#04x} is not supported, leaving opaque",
                        raw.compression_type,
                    );
                }

                self.compression = Some(CompressionHeader {
                    uncompressed_length: raw.uncompressed_length.get(),
                    compression_type: raw.compression_type,
                });
            }
            SectionType::USER_INTERFACE => {
                self.name = Some(util::decode_ucs2(body).0);
            }
            SectionType::VERSION => {
                let build = body
                    .get(..2)
                    .ok_or_else(|| Error::truncated("Version section", 2, body.len()))?;
                self.build_number = Some(u16::from_le_bytes([build[0], build[1]]));
                self.version = Some(util::decode_ucs2(&body[2..]).0);
            }
            t if t.is_depex() => match depex::parse(body) {
                Ok(ops) => self.depex = ops,
                Err(e) => warn!("Leaving {t} section opaque: {e}"),
            },
            SectionType::FIRMWARE_VOLUME_IMAGE => match FirmwareVolume::parse(body, ctx) {
                Ok(fv) => self.volume = Some(Box::new(fv)),
                Err(e) => debug!("Volume image section is not a volume: {e}"),
            },
            SectionType::RAW if body.starts_with(crate::format::nvram::SIGNATURE) => {
                match NVarStore::parse(body, ctx.polarity()) {
                    Ok(store) => self.nvar_store = Some(store),
                    Err(e) => debug!("Raw section is not an NVAR store: {e}"),
                }
            }
            _ => {}
        }

        Ok(())
    }

    pub fn header_len(&self) -> usize {
        match self.buf.get(..3) {
            Some(s) if util::read_u24([s[0], s[1], s[2]]) == SIZE_SENTINEL => EXT_HEADER_SIZE,
            _ => HEADER_SIZE,
        }
    }

    /// Offset of the data after the common and type specific headers.
    pub fn data_offset(&self) -> usize {
        let header_len = self.header_len();

        if self.guid_defined.is_some() {
            self.buf
                .get(header_len + 16..header_len + 18)
                .map_or(header_len, |b| usize::from(u16::from_le_bytes([b[0], b[1]])))
        } else if self.compression.is_some() {
            header_len + COMPRESSION_HEADER_SIZE
        } else {
            header_len
        }
    }

    /// Section data after all headers. For processed GUID-defined sections,
    /// this is the encoded form.
    pub fn data(&self) -> &[u8] {
        self.buf.get(self.data_offset()..).unwrap_or_default()
    }

    /// Build a leaf section holding `data` verbatim.
    pub fn new_leaf(section_type: SectionType, data: &[u8]) -> Result<Self> {
        let mut section = Self {
            section_type,
            ..Default::default()
        };
        section.build(&[], data)?;
        Ok(section)
    }

    pub fn new_ui(name: &str) -> Result<Self> {
        let mut section = Self {
            section_type: SectionType::USER_INTERFACE,
            name: Some(name.to_owned()),
            ..Default::default()
        };
        section.assemble()?;
        Ok(section)
    }

    pub fn new_version(build_number: u16, version: &str) -> Result<Self> {
        let mut section = Self {
            section_type: SectionType::VERSION,
            build_number: Some(build_number),
            version: Some(version.to_owned()),
            ..Default::default()
        };
        section.assemble()?;
        Ok(section)
    }

    pub fn new_depex(section_type: SectionType, ops: Vec<DepExOp>) -> Result<Self> {
        if !section_type.is_depex() {
            return Err(Error::UnsupportedVariant {
                what: "DepEx section",
                detail: format!("{section_type} is not a dependency section type"),
            });
        }

        let mut section = Self {
            section_type,
            depex: ops,
            ..Default::default()
        };
        section.assemble()?;
        Ok(section)
    }

    /// Build a GUID-defined section around `children`. When `guid` names a
    /// known codec, the children are encoded with it.
    pub fn new_guid_defined(guid: Guid, children: Vec<Section>) -> Result<Self> {
        let codec = compression::codec_for_guid(&guid);
        let attributes = if codec.is_some() {
            GuidDefinedAttributes::PROCESSING_REQUIRED
        } else {
            GuidDefinedAttributes::empty()
        };

        let mut section = Self {
            section_type: SectionType::GUID_DEFINED,
            guid_defined: Some(GuidDefined {
                guid,
                attributes,
                codec: codec.map(|c| c.name().to_owned()),
                extra: vec![],
            }),
            encapsulated: children,
            ..Default::default()
        };
        section.assemble()?;
        Ok(section)
    }

    pub fn new_volume_image(volume: FirmwareVolume) -> Result<Self> {
        let mut section = Self {
            section_type: SectionType::FIRMWARE_VOLUME_IMAGE,
            volume: Some(Box::new(volume)),
            ..Default::default()
        };
        section.assemble()?;
        Ok(section)
    }

    /// Replace the data of this section, dropping any parsed children and
    /// semantic fields. Type specific headers are kept.
    pub fn set_data(&mut self, data: &[u8]) -> Result<bool> {
        self.encapsulated.clear();
        self.volume = None;
        self.nvar_store = None;
        self.name = None;
        self.build_number = None;
        self.version = None;
        self.depex.clear();

        let type_header = self.type_header(data.len())?;
        self.build(&type_header, data)
    }

    /// Regenerate the buffer from children or semantic fields. Opaque leaf
    /// sections are left untouched. Returns whether the section needed an
    /// extended header, which requires an FFS3 volume.
    pub fn assemble(&mut self) -> Result<bool> {
        let payload = if !self.encapsulated.is_empty() {
            let plain = join(&self.encapsulated);
            match self.guid_defined.as_ref().and_then(GuidDefined::codec) {
                Some(codec) => codec.encode(&plain)?,
                None => plain,
            }
        } else if let Some(fv) = &self.volume {
            fv.buf.clone()
        } else if let Some(store) = &self.nvar_store {
            store.buf.clone()
        } else if let (SectionType::USER_INTERFACE, Some(name)) = (self.section_type, &self.name) {
            util::encode_ucs2(name)
        } else if let (SectionType::VERSION, Some(build)) = (self.section_type, self.build_number) {
            let mut payload = build.to_le_bytes().to_vec();
            payload.extend(util::encode_ucs2(self.version.as_deref().unwrap_or_default()));
            payload
        } else if self.section_type.is_depex() && !self.depex.is_empty() {
            depex::encode(&self.depex)?
        } else {
            return Ok(self.header_len() == EXT_HEADER_SIZE);
        };

        let type_header = self.type_header(payload.len())?;
        if let Some(c) = &mut self.compression
            && c.compression_type == NOT_COMPRESSED
        {
            c.uncompressed_length = payload.len() as u32;
        }

        self.build(&type_header, &payload)
    }

    /// Type specific header, excluding the data offset of GUID-defined
    /// sections, which is patched in by [`Self::build`].
    fn type_header(&self, payload_len: usize) -> Result<Vec<u8>> {
        if let Some(info) = &self.guid_defined {
            let raw = RawGuidDefined {
                guid: info.guid,
                data_offset: 0.into(),
                attributes: info.attributes.bits().into(),
            };
            let mut header = raw.as_bytes().to_vec();
            header.extend_from_slice(&info.extra);
            Ok(header)
        } else if let Some(c) = &self.compression {
            let length = if c.compression_type == NOT_COMPRESSED {
                u32::try_from(payload_len).map_err(|_| Error::SizeTooLarge {
                    what: "Compression section",
                    size: payload_len as u64,
                })?
            } else {
                c.uncompressed_length
            };
            let raw = RawCompression {
                uncompressed_length: length.into(),
                compression_type: c.compression_type,
            };
            Ok(raw.as_bytes().to_vec())
        } else {
            Ok(vec![])
        }
    }

    fn build(&mut self, type_header: &[u8], payload: &[u8]) -> Result<bool> {
        let body_len = (type_header.len() + payload.len()) as u64;
        let mut total = HEADER_SIZE as u64 + body_len;
        let extended = total >= u64::from(SIZE_SENTINEL);
        if extended {
            total += (EXT_HEADER_SIZE - HEADER_SIZE) as u64;
        }

        let ext_size = u32::try_from(total).map_err(|_| Error::SizeTooLarge {
            what: "Section",
            size: total,
        })?;

        let mut buf = Vec::with_capacity(total as usize);
        let raw = RawHeader {
            size: util::write_u24(if extended { SIZE_SENTINEL } else { ext_size }),
            section_type: self.section_type.0,
        };
        buf.extend_from_slice(raw.as_bytes());
        if extended {
            buf.extend_from_slice(&ext_size.to_le_bytes());
        }

        let header_len = buf.len();
        buf.extend_from_slice(type_header);

        if self.guid_defined.is_some() {
            let data_offset = u16::try_from(buf.len()).map_err(|_| Error::SizeTooLarge {
                what: "GUID-defined section data offset",
                size: buf.len() as u64,
            })?;
            buf[header_len + 16..header_len + 18].copy_from_slice(&data_offset.to_le_bytes());
        }

        buf.extend_from_slice(payload);

        self.buf = buf;
        self.extended_size = total;

        Ok(extended)
    }

    pub fn apply(&mut self, v: &mut dyn Visitor) -> visitors::Result<()> {
        v.visit(Node::Section(self))
    }

    pub fn apply_children(&mut self, v: &mut dyn Visitor) -> visitors::Result<()> {
        for section in &mut self.encapsulated {
            section.apply(v)?;
        }
        if let Some(fv) = &mut self.volume {
            fv.apply(v)?;
        }
        if let Some(store) = &mut self.nvar_store {
            store.apply(v)?;
        }

        Ok(())
    }
}

/// Parse a stream of 4-byte aligned sections. Parsing stops at the end of the
/// buffer or when the remaining bytes are erased.
pub fn parse_sections(buf: &[u8], ctx: &mut Context) -> Result<Vec<Section>> {
    let polarity = ctx.polarity();
    let mut sections = vec![];
    let mut offset = 0;

    loop {
        offset += padding::calc(offset, ALIGNMENT);
        let Some(remain) = buf.get(offset..) else {
            break;
        };
        if remain.is_empty() || util::is_erased(remain, polarity) || util::is_erased(remain, 0) {
            break;
        }

        let section = Section::parse(remain, ctx)?;
        offset += section.buf.len();
        sections.push(section);
    }

    Ok(sections)
}

/// Speculatively parse encapsulated content. Any failure leaves the parent
/// section opaque.
fn try_parse_sections(buf: &[u8], ctx: &mut Context) -> Vec<Section> {
    match parse_sections(buf, ctx) {
        Ok(s) => s,
        Err(e) => {
            warn!("Leaving encapsulated sections opaque: {e}");
            vec![]
        }
    }
}

/// Concatenate section buffers, zero padding each to the section alignment.
pub fn join(sections: &[Section]) -> Vec<u8> {
    let mut buf = vec![];

    for (i, section) in sections.iter().enumerate() {
        if i > 0 {
            padding::extend_to_alignment(&mut buf, ALIGNMENT, 0);
        }
        buf.extend_from_slice(&section.buf);
    }

    buf
}
