//! The torrent's own set of hash-verified pieces, as distinct from a peer's
//! advertised availability ([`crate::bitfield::BitField`]). This is the
//! bitfield that is persisted across restarts and broadcast to peers via
//! HAVE/BITFIELD messages.

use crate::bitfield::BitField;

/// The set of pieces this torrent has already downloaded and verified.
///
/// Unlike a peer's bitfield, which only ever grows monotonically from the
/// peer's perspective, our own verified bitfield starts empty (or is restored
/// from a persisted session) and gains a bit each time a piece passes hash
/// verification.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct VerifiedBitfield(BitField);

impl VerifiedBitfield {
    /// Creates a bitfield of `piece_count` bits, all initially unset (nothing
    /// downloaded yet).
    pub fn new(piece_count: usize) -> Self {
        Self(BitField::new(piece_count))
    }

    /// Restores a verified bitfield from its persisted hex representation.
    pub fn from_hex(
        hex: &str,
        piece_count: usize,
    ) -> Result<Self, hex::FromHexError> {
        Ok(Self(BitField::from_hex(hex, piece_count)?))
    }

    /// Serializes the bitfield for persistence.
    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    /// Returns the raw bytes as sent in a BITFIELD message.
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        self.0.to_wire_bytes()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns whether piece `index` has been verified.
    pub fn has(&self, index: usize) -> bool {
        self.0.get(index)
    }

    /// Marks piece `index` as verified. Idempotent.
    pub fn set(&mut self, index: usize) {
        self.0.set(index, true);
    }

    /// Clears piece `index`, e.g. after a later re-check finds it corrupt on
    /// disk.
    pub fn unset(&mut self, index: usize) {
        self.0.set(index, false);
    }

    /// Returns true iff every piece has been verified, i.e. the torrent is
    /// complete.
    pub fn is_complete(&self) -> bool {
        self.0.is_all_set()
    }

    /// The number of verified pieces.
    pub fn count_verified(&self) -> usize {
        self.0.count_set()
    }

    /// Iterates the indices of all verified pieces, in ascending order.
    pub fn iter_verified(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter_set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_is_complete() {
        let mut vb = VerifiedBitfield::new(3);
        assert!(!vb.is_complete());
        vb.set(0);
        vb.set(1);
        assert!(!vb.is_complete());
        vb.set(2);
        assert!(vb.is_complete());
        assert_eq!(vb.count_verified(), 3);
    }

    #[test]
    fn test_hex_roundtrip_preserves_state() {
        let mut vb = VerifiedBitfield::new(10);
        vb.set(2);
        vb.set(9);
        let hex = vb.to_hex();
        let restored = VerifiedBitfield::from_hex(&hex, 10).unwrap();
        assert_eq!(vb, restored);
    }

    #[test]
    fn test_unset_clears_piece() {
        let mut vb = VerifiedBitfield::new(4);
        vb.set(1);
        assert!(vb.has(1));
        vb.unset(1);
        assert!(!vb.has(1));
    }
}
