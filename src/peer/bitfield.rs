use bytes::Bytes;

use super::error::PeerError;

/// Piece availability, one bit per piece, numbered from the high bit of
/// the first byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    pieces: usize,
}

impl Bitfield {
    /// An all-zero bitfield for `pieces` pieces.
    pub fn empty(pieces: usize) -> Self {
        Self {
            bits: vec![0; pieces.div_ceil(8)],
            pieces,
        }
    }

    /// An all-one bitfield for `pieces` pieces.
    pub fn full(pieces: usize) -> Self {
        let mut bitfield = Self {
            bits: vec![0xff; pieces.div_ceil(8)],
            pieces,
        };
        bitfield.mask_tail();
        bitfield
    }

    /// Parses a BITFIELD payload.
    ///
    /// The byte length must be exactly `ceil(pieces / 8)` and the spare
    /// bits of the last byte must be zero; anything else is a protocol
    /// violation and closes the connection.
    pub fn from_wire(payload: &Bytes, pieces: usize) -> Result<Self, PeerError> {
        if payload.len() != pieces.div_ceil(8) {
            return Err(PeerError::Protocol("bitfield wrong size"));
        }

        let bitfield = Self {
            bits: payload.to_vec(),
            pieces,
        };

        let mut masked = bitfield.clone();
        masked.mask_tail();
        if masked.bits != bitfield.bits {
            return Err(PeerError::Protocol("bitfield spare bits set"));
        }

        Ok(bitfield)
    }

    pub fn has(&self, piece: usize) -> bool {
        if piece >= self.pieces {
            return false;
        }
        self.bits[piece / 8] & (0x80 >> (piece % 8)) != 0
    }

    pub fn set(&mut self, piece: usize) {
        if piece < self.pieces {
            self.bits[piece / 8] |= 0x80 >> (piece % 8);
        }
    }

    pub fn unset(&mut self, piece: usize) {
        if piece < self.pieces {
            self.bits[piece / 8] &= !(0x80 >> (piece % 8));
        }
    }

    /// Number of pieces present.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Total number of pieces the bitfield covers.
    pub fn len(&self) -> usize {
        self.pieces
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.pieces
    }

    /// The wire form.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    /// Iterates pieces present in `self` and absent in `other`.
    pub fn newer_than<'a>(&'a self, other: &'a Bitfield) -> impl Iterator<Item = usize> + 'a {
        (0..self.pieces).filter(|&i| self.has(i) && !other.has(i))
    }

    fn mask_tail(&mut self) {
        let spare = self.bits.len() * 8 - self.pieces;
        if spare > 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= 0xffu8 << spare;
            }
        }
    }
}
