// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use num_traits::PrimInt;

/// Calculate the amount of padding that needs to be added to align the
/// specified offset to a multiple of `alignment`.
pub fn calc<N: PrimInt>(offset: N, alignment: N) -> N {
    let r = offset % alignment;
    if r == N::zero() {
        N::zero()
    } else {
        alignment - r
    }
}

/// Round to the next multiple of the alignment.
pub fn round<N: PrimInt>(offset: N, alignment: N) -> Option<N> {
    let remain = calc(offset, alignment);
    offset.checked_add(&remain)
}

/// Append `fill` bytes until the buffer length is a multiple of `alignment`.
/// Returns the number of bytes appended.
pub fn extend_to_alignment(buf: &mut Vec<u8>, alignment: usize, fill: u8) -> usize {
    let padding = calc(buf.len(), alignment);
    buf.resize(buf.len() + padding, fill);
    padding
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calc_and_round() {
        assert_eq!(calc(0u64, 8), 0);
        assert_eq!(calc(1u64, 8), 7);
        assert_eq!(calc(8u64, 8), 0);
        assert_eq!(round(9u32, 4), Some(12));
        assert_eq!(round(u32::MAX, 4), None);
    }

    #[test]
    fn extend() {
        let mut buf = vec![1, 2, 3];
        assert_eq!(extend_to_alignment(&mut buf, 4, 0xff), 1);
        assert_eq!(buf, [1, 2, 3, 0xff]);
        assert_eq!(extend_to_alignment(&mut buf, 4, 0xff), 0);
    }
}
