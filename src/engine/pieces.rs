use bytes::Bytes;
use rand::Rng;

use crate::error::PieceIndexError;

/// Which pieces of the shared file a peer holds.
///
/// Bits are packed LSB-first: piece `i` lives in bit `i % 8` of byte
/// `i / 8`, the layout Java's `BitSet::toByteArray` produces. The length
/// never changes and bits are only ever set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PieceSet {
    size: usize,
    bits: Vec<u8>,
}

impl PieceSet {
    pub fn empty(size: usize) -> PieceSet {
        PieceSet {
            size,
            bits: vec![0; size.div_ceil(8)],
        }
    }

    pub fn full(size: usize) -> PieceSet {
        let mut set = PieceSet {
            size,
            bits: vec![0xFF; size.div_ceil(8)],
        };

        set.clear_spare_bits();
        set
    }

    /// Builds a set from a BITFIELD payload. Missing trailing bytes read as
    /// zero, extra bytes and spare bits are ignored.
    pub fn from_bytes(data: &[u8], size: usize) -> PieceSet {
        let mut bits = data.to_vec();
        bits.resize(size.div_ceil(8), 0);

        let mut set = PieceSet { size, bits };
        set.clear_spare_bits();
        set
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.size {
            return false;
        }

        (self.bits[index / 8] >> (index % 8)) & 1 == 1
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn has_all(&self) -> bool {
        self.count() == self.size
    }

    pub fn mark_received(&mut self, index: usize) -> Result<(), PieceIndexError> {
        if index >= self.size {
            return Err(PieceIndexError { index, size: self.size });
        }

        self.bits[index / 8] |= 1 << (index % 8);
        Ok(())
    }

    /// True if `other` holds at least one piece we don't.
    pub fn has_interesting_pieces(&self, other: &PieceSet) -> bool {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .any(|(mine, theirs)| theirs & !mine != 0)
    }

    /// Indices held by `other` but not by us, in ascending order.
    pub fn remaining_pieces(&self, other: &PieceSet) -> Vec<usize> {
        (0..self.size.min(other.size))
            .filter(|&i| other.has(i) && !self.has(i))
            .collect()
    }

    pub fn random_remaining_piece<R: Rng + ?Sized>(&self, other: &PieceSet, rng: &mut R) -> Option<usize> {
        let remaining = self.remaining_pieces(other);

        if remaining.is_empty() {
            None
        }
        else {
            Some(remaining[rng.gen_range(0..remaining.len())])
        }
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.size;

        if spare > 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= 0xFFu8 >> spare;
            }
        }
    }
}
