//! A small set of bounds-checked helpers over [`crate::Bitfield`].
//!
//! `bitvec`'s own indexing panics on out-of-range access, but the wire
//! bitfield we receive from a peer may legitimately be padded (or, for a
//! misbehaving peer, simply wrong), so every access the engine performs
//! against a peer- or self-owned bitfield goes through these bounds-checked
//! variants instead of raw indexing.

use crate::Bitfield;

pub trait BitfieldExt {
    /// Returns whether the piece at `index` is set. Out-of-range indices
    /// return `false` rather than panicking.
    fn has(&self, index: usize) -> bool;
    /// Sets the piece at `index`. Out-of-range indices are a no-op.
    fn set_piece(&mut self, index: usize);
    /// Clears the piece at `index`. Out-of-range indices are a no-op.
    fn clear_piece(&mut self, index: usize);
    /// Returns the number of set bits (pieces present).
    fn count(&self) -> usize;
}

impl BitfieldExt for Bitfield {
    fn has(&self, index: usize) -> bool {
        self.get(index).map(|b| *b).unwrap_or(false)
    }

    fn set_piece(&mut self, index: usize) {
        if let Some(mut bit) = self.get_mut(index) {
            *bit = true;
        }
    }

    fn clear_piece(&mut self, index: usize) {
        if let Some(mut bit) = self.get_mut(index) {
            *bit = false;
        }
    }

    fn count(&self) -> usize {
        self.count_ones()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::{BitVec, Msb0};

    fn bitfield(len: usize) -> Bitfield {
        BitVec::<Msb0, u8>::repeat(false, len)
    }

    #[test]
    fn out_of_range_access_is_a_noop() {
        let mut bf = bitfield(4);
        assert!(!bf.has(100));
        bf.set_piece(100);
        bf.clear_piece(100);
        assert_eq!(bf.count(), 0);
    }

    #[test]
    fn set_and_clear_roundtrip() {
        let mut bf = bitfield(8);
        bf.set_piece(0);
        bf.set_piece(7);
        assert!(bf.has(0));
        assert!(bf.has(7));
        assert!(!bf.has(1));
        assert_eq!(bf.count(), 2);

        bf.clear_piece(0);
        assert!(!bf.has(0));
        assert_eq!(bf.count(), 1);
    }
}
