// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Mixed-endian 16-byte identifiers as used throughout UEFI firmware.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use thiserror::Error;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Canonical string form. Also used in error messages.
const TEMPLATE: &str = "01234567-89AB-CDEF-0123-456789ABCDEF";

/// Byte lengths of the field groups that are stored little-endian. The
/// remaining eight single-byte groups are unaffected by reversal.
const FIELD_LENGTHS: [usize; 11] = [4, 2, 2, 1, 1, 1, 1, 1, 1, 1, 1];

/// Positions of the hyphens in [`TEMPLATE`].
const HYPHENS: [usize; 4] = [8, 13, 18, 23];

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error("guid string not correct, need string of the format \n{TEMPLATE}\n, got \n{0}")]
    BadLength(String),
    #[error("guid string has invalid hex digits or separators: {0:?}")]
    BadFormat(String),
}

#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
    Unaligned,
)]
#[repr(transparent)]
pub struct Guid(pub [u8; 16]);

fn reverse_fields(bytes: &mut [u8; 16]) {
    let mut offset = 0;

    for len in FIELD_LENGTHS {
        bytes[offset..offset + len].reverse();
        offset += len;
    }
}

impl Guid {
    pub const ZERO: Self = Self([0u8; 16]);

    /// Build a GUID from its canonical fields, storing them in the on-disk
    /// mixed-endian order.
    pub const fn new(d1: u32, d2: u16, d3: u16, d4: [u8; 8]) -> Self {
        let a = d1.to_le_bytes();
        let b = d2.to_le_bytes();
        let c = d3.to_le_bytes();

        Self([
            a[0], a[1], a[2], a[3], b[0], b[1], c[0], c[1], d4[0], d4[1], d4[2], d4[3], d4[4],
            d4[5], d4[6], d4[7],
        ])
    }

    pub fn from_slice(buf: &[u8]) -> Option<Self> {
        buf.get(..16)?.try_into().ok().map(Self)
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl FromStr for Guid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != TEMPLATE.len() {
            return Err(Error::BadLength(s.to_owned()));
        }

        let raw = s.as_bytes();
        if HYPHENS.iter().any(|i| raw[*i] != b'-') {
            return Err(Error::BadFormat(s.to_owned()));
        }

        let stripped = s.replace('-', "");
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(&stripped, &mut bytes).map_err(|_| Error::BadFormat(s.to_owned()))?;

        reverse_fields(&mut bytes);

        Ok(Self(bytes))
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut b = self.0;
        reverse_fields(&mut b);

        write!(
            f,
            "{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-\
             {:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12], b[13],
            b[14], b[15],
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for Guid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Guid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Firmware file system v1. Recognized, but not parsed.
pub const FFS1: Guid = Guid::new(
    0x7a9354d9,
    0x0468,
    0x444a,
    [0x81, 0xce, 0x0b, 0xf6, 0x17, 0xd8, 0x90, 0xdf],
);
pub const FFS2: Guid = Guid::new(
    0x8c8ce578,
    0x8a3d,
    0x4f1c,
    [0x99, 0x35, 0x89, 0x61, 0x85, 0xc3, 0x2d, 0xd3],
);
pub const FFS3: Guid = Guid::new(
    0x5473c07a,
    0x3dcb,
    0x4dca,
    [0xbd, 0x6f, 0x1e, 0x96, 0x89, 0xe7, 0x34, 0x9a],
);
pub const EVSA: Guid = Guid::new(
    0xfff12b8d,
    0x7696,
    0x4c8b,
    [0xa9, 0x85, 0x27, 0x47, 0x07, 0x5b, 0x4f, 0x50],
);
/// File name (and volume type) of AMI NVAR variable stores.
pub const NVAR: Guid = Guid::new(
    0xcef5b9a3,
    0x476d,
    0x497f,
    [0x9f, 0xdc, 0xe9, 0x81, 0x43, 0xe0, 0x42, 0x2c],
);
pub const EVSA2: Guid = Guid::new(
    0x00504624,
    0x8a59,
    0x4eeb,
    [0xbd, 0x0f, 0x6b, 0x36, 0xe9, 0x61, 0x28, 0xe0],
);
pub const APPLE_BOOT: Guid = Guid::new(
    0x04adeead,
    0x61ff,
    0x4d31,
    [0xb6, 0xba, 0x64, 0xf8, 0xbf, 0x90, 0x1f, 0x5a],
);
pub const APPLE_BOOT2: Guid = Guid::new(
    0xbd001b8c,
    0x6a71,
    0x487b,
    [0xa1, 0x4f, 0x0c, 0x2a, 0x2d, 0xcf, 0x7a, 0x5d],
);
pub const PFH1: Guid = Guid::new(
    0x16b45da2,
    0x7d70,
    0x4aea,
    [0xa5, 0x8d, 0x76, 0x0e, 0x9e, 0xcb, 0x84, 0x1d],
);
pub const PFH2: Guid = Guid::new(
    0xe360bdba,
    0xc3ce,
    0x46be,
    [0x8f, 0x37, 0xb2, 0x31, 0xe5, 0xcb, 0x9f, 0x35],
);

/// GUID-defined section processed with raw LZMA.
pub const LZMA: Guid = Guid::new(
    0xee4e5898,
    0x3914,
    0x4259,
    [0x9d, 0x6e, 0xdc, 0x7b, 0xd7, 0x94, 0x03, 0xcf],
);
/// GUID-defined section processed with LZMA and the x86 BCJ filter.
pub const LZMA_X86: Guid = Guid::new(
    0xd42ae6bd,
    0x1352,
    0x4bfb,
    [0x90, 0x9a, 0xca, 0x72, 0xa6, 0xea, 0xe8, 0x89],
);

/// Human readable labels for well-known volume file system GUIDs.
pub fn volume_label(guid: &Guid) -> Option<&'static str> {
    const LABELS: &[(Guid, &str)] = &[
        (FFS1, "FFS1"),
        (FFS2, "FFS2"),
        (FFS3, "FFS3"),
        (EVSA, "NVRAM_EVSA"),
        (NVAR, "NVRAM_NVAR"),
        (EVSA2, "NVRAM_EVSA2"),
        (APPLE_BOOT, "APPLE_BOOT"),
        (APPLE_BOOT2, "APPLE_BOOT2"),
        (PFH1, "PFH1"),
        (PFH2, "PFH2"),
    ];

    LABELS.iter().find(|(g, _)| g == guid).map(|(_, l)| *l)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_canonical() {
        let guid: Guid = TEMPLATE.parse().unwrap();
        assert_eq!(
            guid.0,
            [
                0x67, 0x45, 0x23, 0x01, 0xab, 0x89, 0xef, 0xcd, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
                0xcd, 0xef,
            ],
        );
        assert_eq!(guid.to_string(), TEMPLATE);
    }

    #[test]
    fn parse_lowercase_canonicalizes() {
        let guid: Guid = "ee4e5898-3914-4259-9d6e-dc7bd79403cf".parse().unwrap();
        assert_eq!(guid, LZMA);
        assert_eq!(guid.to_string(), "EE4E5898-3914-4259-9D6E-DC7BD79403CF");
    }

    #[test]
    fn round_trip_bytes() {
        for seed in 0..=255u8 {
            let mut bytes = [0u8; 16];
            for (i, b) in bytes.iter_mut().enumerate() {
                *b = seed.wrapping_mul(31).wrapping_add(i as u8 * 17);
            }
            let guid = Guid(bytes);
            assert_eq!(guid.to_string().parse::<Guid>().unwrap(), guid);
        }
    }

    #[test]
    fn parse_errors() {
        let err = "ABC".parse::<Guid>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "guid string not correct, need string of the format \n\
             01234567-89AB-CDEF-0123-456789ABCDEF\n, got \nABC",
        );
        assert_matches!(
            "0123456789AB-CDEF-0123-456789ABCDEF-".parse::<Guid>(),
            Err(Error::BadFormat(_))
        );
        assert_matches!(
            "0123456Z-89AB-CDEF-0123-456789ABCDEF".parse::<Guid>(),
            Err(Error::BadFormat(_))
        );
    }
}
