//! Packed bitfields
//!
//! Wire and resume bitfields are packed most-significant-bit first: piece 0 is
//! bit 7 of byte 0.

/// Pack a bool sequence into bytes, MSB first
pub fn pack(bits: &[bool]) -> Vec<u8> {
    let mut bitfield = vec![0u8; bits.len().div_ceil(8)];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            bitfield[i / 8] |= 1 << (7 - (i % 8));
        }
    }
    bitfield
}

/// Unpack `len` bits from a packed bitfield; missing bytes read as zero
pub fn unpack(bitfield: &[u8], len: usize) -> Vec<bool> {
    (0..len).map(|i| has_bit(bitfield, i)).collect()
}

/// Test a single bit of a packed bitfield
pub fn has_bit(bitfield: &[u8], index: usize) -> bool {
    bitfield
        .get(index / 8)
        .is_some_and(|byte| (byte >> (7 - (index % 8))) & 1 == 1)
}

/// Whether any bit beyond `len` is set; such trailing bits are invalid on the wire
pub fn has_spare_bits(bitfield: &[u8], len: usize) -> bool {
    let total = bitfield.len() * 8;
    (len..total).any(|i| has_bit(bitfield, i))
}
