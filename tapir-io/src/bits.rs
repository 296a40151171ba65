//! Small numeric helpers shared by the wire codecs.

/// Reverse the bit order of every byte, independent of its position.
pub fn reverse_bits_in_place(data: &mut [u8]) {
    for b in data {
        *b = b.reverse_bits();
    }
}

/// Number of set bits in the upper nibble.
pub const fn high_nibble_ones(b: u8) -> usize {
    (b >> 4).count_ones() as usize
}

pub const fn low_nibble(b: u8) -> u8 {
    b & 0x0f
}

/// `None` unless `src` is exactly 4 bytes long.
pub fn load_u32_le(src: &[u8]) -> Option<u32> {
    src.try_into().ok().map(u32::from_le_bytes)
}

/// Bits of `old` selected by `mask` are replaced by `value`.
pub const fn merge_masked(old: u32, mask: u32, value: u32) -> u32 {
    (old & !mask) | value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse() {
        let mut data = [0x01, 0x80, 0xaa, 0x99, 0x55, 0x66, 0x00, 0xff];
        reverse_bits_in_place(&mut data);
        assert_eq!(data, [0x80, 0x01, 0x55, 0x99, 0xaa, 0x66, 0x00, 0xff]);
    }

    #[test]
    fn nibbles() {
        assert_eq!(high_nibble_ones(0x00), 0);
        assert_eq!(high_nibble_ones(0x80), 1);
        assert_eq!(high_nibble_ones(0x5f), 2);
        assert_eq!(high_nibble_ones(0xf0), 4);
        assert_eq!(low_nibble(0x3b), 0x0b);
    }

    #[test]
    fn masked() {
        assert_eq!(merge_masked(0xffff_0000, 0x0000_ff00, 0x0000_1200), 0xffff_1200);
        assert_eq!(merge_masked(0x1234_5678, 0xf000_0000, 0), 0x0234_5678);
    }

    #[test]
    fn load() {
        assert_eq!(load_u32_le(&[0x78, 0x56, 0x34, 0x12]), Some(0x1234_5678));
        assert_eq!(load_u32_le(&[0x78, 0x56, 0x34]), None);
    }
}
