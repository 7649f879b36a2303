// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;

use num_traits::PrimInt;

/// Number of bytes of context included in header parse errors.
const CONTEXT_LEN: usize = 20;

/// A small wrapper to format a number as a size in bytes.
#[derive(Clone, Copy)]
pub struct NumBytes<T: PrimInt>(pub T);

impl<T: PrimInt + fmt::Debug> fmt::Debug for NumBytes<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == T::one() {
            write!(f, "<{:?} byte>", self.0)
        } else {
            write!(f, "<{:?} bytes>", self.0)
        }
    }
}

/// Check if a byte slice consists entirely of the erase polarity byte. An
/// empty slice counts as erased.
pub fn is_erased(buf: &[u8], polarity: u8) -> bool {
    buf.iter().all(|b| *b == polarity)
}

/// 8-bit wrapping sum of all bytes.
pub fn checksum8(buf: &[u8]) -> u8 {
    buf.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// 16-bit wrapping sum of all little-endian words. A trailing odd byte is
/// treated as the low half of a final word.
pub fn checksum16(buf: &[u8]) -> u16 {
    buf.chunks(2).fold(0u16, |sum, c| {
        let word = u16::from_le_bytes([c[0], c.get(1).copied().unwrap_or(0)]);
        sum.wrapping_add(word)
    })
}

pub fn read_u24(buf: [u8; 3]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], 0])
}

/// Encode the low 24 bits of a value. Callers must have checked the range.
pub fn write_u24(value: u32) -> [u8; 3] {
    let b = value.to_le_bytes();
    [b[0], b[1], b[2]]
}

/// Hex dump of the first few bytes of a buffer for error messages.
pub fn context(buf: &[u8]) -> String {
    hex::encode(&buf[..buf.len().min(CONTEXT_LEN)])
}

/// Bounds-checked `&buf[offset..offset + len]`.
pub fn subslice(buf: &[u8], offset: usize, len: usize) -> Option<&[u8]> {
    let end = offset.checked_add(len)?;
    buf.get(offset..end)
}

/// Decode a NUL-terminated UCS-2 string. Returns the string and the number of
/// bytes consumed, including the terminator. Unterminated input consumes the
/// whole buffer.
pub fn decode_ucs2(buf: &[u8]) -> (String, usize) {
    let mut units = vec![];
    let mut consumed = 0;

    for c in buf.chunks_exact(2) {
        consumed += 2;
        let unit = u16::from_le_bytes([c[0], c[1]]);
        if unit == 0 {
            break;
        }
        units.push(unit);
    }

    (String::from_utf16_lossy(&units), consumed)
}

/// Encode a string as NUL-terminated UCS-2.
pub fn encode_ucs2(s: &str) -> Vec<u8> {
    s.encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(u16::to_le_bytes)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksums() {
        assert_eq!(checksum8(&[0x01, 0xff, 0x10]), 0x10);
        assert_eq!(checksum16(&[0x01, 0x00, 0xff, 0xff]), 0x0000);
        assert_eq!(checksum16(&[0x34, 0x12, 0x01]), 0x1235);
    }

    #[test]
    fn ucs2_round_trip() {
        let encoded = encode_ucs2("Shell");
        assert_eq!(encoded.len(), 12);
        assert_eq!(decode_ucs2(&encoded), ("Shell".to_owned(), 12));

        // Trailing data after the terminator is not consumed.
        let mut data = encoded.clone();
        data.extend_from_slice(b"\xaa\xbb");
        assert_eq!(decode_ucs2(&data), ("Shell".to_owned(), 12));
    }

    #[test]
    fn erased() {
        assert!(is_erased(&[], 0xff));
        assert!(is_erased(&[0xff; 8], 0xff));
        assert!(!is_erased(&[0xff; 8], 0x00));
    }

    #[test]
    fn bounds() {
        assert_eq!(subslice(b"foobar", 3, 3), Some(&b"bar"[..]));
        assert_eq!(subslice(b"foobar", 4, 3), None);
        assert_eq!(subslice(b"foobar", usize::MAX, 2), None);
    }
}
