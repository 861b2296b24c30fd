use std::fmt;

/// A fixed-length bit array packed MSB-first, the way availability travels on the wire.
///
/// The length is fixed at construction. Indexing past it is a programming error and panics.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Bitfield {
    len: usize,
    bytes: Vec<u8>,
}

impl Bitfield {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            bytes: vec![0; len.div_ceil(8)],
        }
    }

    /// A bitfield with every bit set.
    pub fn full(len: usize) -> Self {
        let mut bitfield = Self {
            len,
            bytes: vec![0xff; len.div_ceil(8)],
        };
        bitfield.clear_spare_bits();
        bitfield
    }

    /// Reads `len` bits from a packed buffer. Missing bytes read as zero, surplus bytes and
    /// spare bits in the last byte are dropped.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Self {
        let n_bytes = len.div_ceil(8);
        let mut packed = vec![0; n_bytes];
        let copied = n_bytes.min(bytes.len());
        packed[..copied].copy_from_slice(&bytes[..copied]);
        let mut bitfield = Self { len, bytes: packed };
        bitfield.clear_spare_bits();
        bitfield
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set(&mut self, i: usize) {
        self.check_bounds(i);
        self.bytes[i / 8] |= mask(i);
    }

    pub fn unset(&mut self, i: usize) {
        self.check_bounds(i);
        self.bytes[i / 8] &= !mask(i);
    }

    pub fn is_set(&self, i: usize) -> bool {
        self.check_bounds(i);
        self.bytes[i / 8] & mask(i) != 0
    }

    /// Number of set bits.
    pub fn cardinality(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.cardinality() == self.len
    }

    /// Unsets every bit.
    pub fn clear(&mut self) {
        self.bytes.iter_mut().for_each(|b| *b = 0);
    }

    pub fn and(&self, other: &Bitfield) -> Bitfield {
        self.combine(other, |a, b| a & b)
    }

    pub fn or(&self, other: &Bitfield) -> Bitfield {
        self.combine(other, |a, b| a | b)
    }

    pub fn xor(&self, other: &Bitfield) -> Bitfield {
        self.combine(other, |a, b| a ^ b)
    }

    /// Bits set here but not in `other`, over the common prefix.
    pub fn difference(&self, other: &Bitfield) -> Bitfield {
        self.xor(&self.and(other))
    }

    /// Ascending indices of set bits.
    pub fn set_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|&i| self.is_set(i))
    }

    /// Ascending indices of unset bits.
    pub fn unset_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|&i| !self.is_set(i))
    }

    // results are truncated to the shorter operand
    fn combine(&self, other: &Bitfield, op: impl Fn(u8, u8) -> u8) -> Bitfield {
        let len = self.len.min(other.len);
        let bytes = self
            .bytes
            .iter()
            .zip(&other.bytes)
            .take(len.div_ceil(8))
            .map(|(&a, &b)| op(a, b))
            .collect();
        let mut bitfield = Bitfield { len, bytes };
        bitfield.clear_spare_bits();
        bitfield
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bytes.len() * 8 - self.len;
        if spare > 0 {
            if let Some(last) = self.bytes.last_mut() {
                *last &= 0xff << spare;
            }
        }
    }

    fn check_bounds(&self, i: usize) {
        assert!(
            i < self.len,
            "bit index {i} out of range for a bitfield of length {}",
            self.len
        );
    }
}

fn mask(i: usize) -> u8 {
    0x80 >> (i % 8)
}

impl fmt::Debug for Bitfield {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits: String = (0..self.len)
            .map(|i| if self.is_set(i) { '1' } else { '0' })
            .collect();
        write!(f, "Bitfield({}/{} [{bits}])", self.cardinality(), self.len)
    }
}

#[cfg(test)]
mod test_bitfield {
    use super::*;

    fn from_indices(len: usize, indices: &[usize]) -> Bitfield {
        let mut bitfield = Bitfield::new(len);
        indices.iter().for_each(|&i| bitfield.set(i));
        bitfield
    }

    #[test]
    fn set_and_unset() {
        let mut bitfield = Bitfield::new(10);
        bitfield.set(0);
        bitfield.set(9);
        assert!(bitfield.is_set(0));
        assert!(bitfield.is_set(9));
        assert!(!bitfield.is_set(5));
        assert_eq!(bitfield.cardinality(), 2);

        bitfield.unset(0);
        assert!(!bitfield.is_set(0));
        assert_eq!(bitfield.cardinality(), 1);
    }

    #[test]
    fn packs_msb_first() {
        let bitfield = from_indices(12, &[0, 7, 8]);
        assert_eq!(bitfield.to_bytes(), vec![0b1000_0001, 0b1000_0000]);
    }

    #[test]
    #[should_panic]
    fn out_of_range_panics() {
        Bitfield::new(8).set(8);
    }

    #[test]
    fn xor_counts_differing_positions() {
        let a = from_indices(20, &[1, 3, 5, 17]);
        let b = from_indices(20, &[1, 4, 5, 19]);
        assert_eq!(a.xor(&b).cardinality(), 4);
        assert_eq!(a.xor(&b).set_indices().collect::<Vec<_>>(), vec![3, 4, 17, 19]);
    }

    #[test]
    fn and_is_zero_where_either_is_zero() {
        let a = from_indices(16, &[0, 2, 4, 6, 8]);
        let b = from_indices(16, &[2, 3, 8, 15]);
        let and = a.and(&b);
        for i in 0..16 {
            if !a.is_set(i) || !b.is_set(i) {
                assert!(!and.is_set(i));
            }
        }
        assert_eq!(and.set_indices().collect::<Vec<_>>(), vec![2, 8]);
    }

    #[test]
    fn or_recovers_exclusive_bits() {
        let a = from_indices(9, &[0, 1, 8]);
        let b = from_indices(9, &[1, 2, 7]);
        let exclusive = a.or(&b).difference(&a);
        assert_eq!(exclusive.set_indices().collect::<Vec<_>>(), vec![2, 7]);
    }

    #[test]
    fn mismatched_lengths_truncate() {
        let a = Bitfield::full(13);
        let b = Bitfield::full(5);
        let or = a.or(&b);
        assert_eq!(or.len(), 5);
        assert_eq!(or.cardinality(), 5);
        assert_eq!(or.to_bytes(), vec![0b1111_1000]);
    }

    #[test]
    fn buffer_round_trip_for_odd_lengths() {
        for len in [1, 7, 8, 9, 15, 16, 17, 33] {
            let bitfield = from_indices(len, &(0..len).step_by(3).collect::<Vec<_>>());
            let restored = Bitfield::from_bytes(&bitfield.to_bytes(), len);
            assert_eq!(restored, bitfield, "length {len}");
        }
    }

    #[test]
    fn from_bytes_masks_spare_bits() {
        let bitfield = Bitfield::from_bytes(&[0xff, 0xff], 10);
        assert_eq!(bitfield.cardinality(), 10);
        assert_eq!(bitfield.to_bytes(), vec![0xff, 0b1100_0000]);
    }

    #[test]
    fn unset_indices_ascending() {
        let bitfield = from_indices(6, &[0, 2, 3]);
        assert_eq!(bitfield.unset_indices().collect::<Vec<_>>(), vec![1, 4, 5]);
        assert!(!bitfield.is_complete());
        assert!(Bitfield::full(6).is_complete());
    }
}
