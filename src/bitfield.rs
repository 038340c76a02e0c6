//! A fixed-length bit vector used both for a peer's piece availability and
//! for the torrent's own verified-piece set.

use bitvec::prelude::{BitVec, Msb0};

/// A `P`-bit vector where bit `i` means "piece `i` is available", read from
/// the most significant bit down, matching the wire's BITFIELD message
/// layout (e.g. `0b1100_0001` means pieces 0, 1, and 7 are set).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BitField(BitVec<u8, Msb0>);

impl BitField {
    /// Creates a bitfield of `len` bits, all initially unset.
    pub fn new(len: usize) -> Self {
        Self(BitVec::repeat(false, len))
    }

    /// Parses a bitfield from the raw bytes as sent on the wire, truncating
    /// (or padding) to exactly `piece_count` bits.
    ///
    /// The wire representation may be longer than the logical number of
    /// pieces if the piece count isn't a multiple of 8; the trailing pad
    /// bits are dropped.
    pub fn from_wire_bytes(bytes: &[u8], piece_count: usize) -> Self {
        let mut bits: BitVec<u8, Msb0> = BitVec::from_slice(bytes);
        bits.resize(piece_count, false);
        Self(bits)
    }

    /// Returns the raw bytes as they'd be sent on the wire (padded with
    /// trailing zero bits to a byte boundary).
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        self.0.clone().into_vec()
    }

    /// Returns the bitfield's hex-encoded wire representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_wire_bytes())
    }

    /// Parses a bitfield from its hex-encoded wire representation.
    pub fn from_hex(hex: &str, piece_count: usize) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex)?;
        Ok(Self::from_wire_bytes(&bytes, piece_count))
    }

    /// The number of pieces this bitfield tracks.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns whether piece `index` is set.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn get(&self, index: usize) -> bool {
        self.0[index]
    }

    /// Sets or clears piece `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn set(&mut self, index: usize, value: bool) {
        self.0.set(index, value);
    }

    /// Resizes the bitfield in place to `piece_count` bits, truncating or
    /// zero-extending as needed.
    pub fn resize(&mut self, piece_count: usize) {
        self.0.resize(piece_count, false);
    }

    /// Returns true iff every bit is set.
    pub fn is_all_set(&self) -> bool {
        !self.0.is_empty() && self.0.all()
    }

    /// Returns true iff no bit is set.
    pub fn is_none_set(&self) -> bool {
        self.0.not_any()
    }

    /// Returns the number of set bits.
    pub fn count_set(&self) -> usize {
        self.0.count_ones()
    }

    /// Iterates the indices of all set pieces, in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(i, bit)| if *bit { Some(i) } else { None })
    }

    /// Returns the index of the first set bit at or after `from`, if any.
    pub fn first_set_from(&self, from: usize) -> Option<usize> {
        (from..self.0.len()).find(|&i| self.0[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_roundtrip() {
        let mut bf = BitField::new(10);
        bf.set(0, true);
        bf.set(1, true);
        bf.set(7, true);
        bf.set(9, true);

        let bytes = bf.to_wire_bytes();
        let back = BitField::from_wire_bytes(&bytes, 10);
        assert_eq!(bf, back);
    }

    #[test]
    fn test_hex_roundtrip() {
        let mut bf = BitField::new(16);
        bf.set(3, true);
        bf.set(15, true);

        let hex = bf.to_hex();
        let back = BitField::from_hex(&hex, 16).unwrap();
        assert_eq!(bf, back);
    }

    #[test]
    fn test_resize_truncates_trailing_wire_padding() {
        // 9 pieces need 2 bytes on the wire, with 7 padding bits.
        let bf = BitField::from_wire_bytes(&[0b1000_0000, 0b1000_0000], 9);
        assert_eq!(bf.len(), 9);
        assert!(bf.get(0));
        assert!(bf.get(8));
    }

    #[test]
    fn test_is_all_set() {
        let mut bf = BitField::new(3);
        assert!(!bf.is_all_set());
        bf.set(0, true);
        bf.set(1, true);
        assert!(!bf.is_all_set());
        bf.set(2, true);
        assert!(bf.is_all_set());
    }

    #[test]
    fn test_empty_bitfield_is_not_all_set() {
        let bf = BitField::new(0);
        assert!(!bf.is_all_set());
    }

    #[test]
    fn test_iter_set() {
        let mut bf = BitField::new(5);
        bf.set(1, true);
        bf.set(4, true);
        assert_eq!(bf.iter_set().collect::<Vec<_>>(), vec![1, 4]);
    }

    #[test]
    fn test_first_set_from() {
        let mut bf = BitField::new(5);
        bf.set(3, true);
        assert_eq!(bf.first_set_from(0), Some(3));
        assert_eq!(bf.first_set_from(4), None);
    }
}
