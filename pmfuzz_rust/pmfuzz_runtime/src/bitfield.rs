//! Saturating counters stored as fixed-width bit fields.
//!
//! A counter occupies `width` bytes of an arena. Its value is the position of the highest bit that
//! differs from the base bit, so counting needs no arithmetic on the stored bytes and can never
//! overflow into a neighboring counter. A counter saturates once that bit is the most significant
//! bit of the field.

use std::sync::atomic::AtomicU8;

use bitvec::order::Lsb0;
use bitvec::slice::BitSlice;

/// Largest value a single access counter can represent in the byte encoding.
pub const COUNTER_CAP: usize = 255;

/// Width in bytes of a bit-field counter.
pub const ELEMENT_WIDTH: usize = (COUNTER_CAP / 8).next_power_of_two();

type Bits = BitSlice<AtomicU8, Lsb0>;

/// A byte region split into equally sized bit-field counters.
pub struct BitFieldArena<'a> {
    bytes: &'a [AtomicU8],
    width: usize,
}

impl<'a> BitFieldArena<'a> {
    /// Split `bytes` into counters of `width` bytes each. Trailing bytes that do not fill a whole
    /// counter are never touched.
    pub fn new(bytes: &'a [AtomicU8], width: usize) -> Self {
        assert!(width > 0, "BUG: bit field width must not be zero");
        BitFieldArena { bytes, width }
    }

    /// Number of counters in the arena.
    pub fn len(&self) -> usize {
        self.bytes.len() / self.width
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The counter at `index`, using `base` as the value of untouched bits.
    pub fn field(&self, index: usize, base: bool) -> Option<BitField<'a>> {
        if index >= self.len() {
            return None;
        }
        let start = index * self.width;
        Some(BitField {
            bits: BitSlice::from_slice(&self.bytes[start..start + self.width]),
            base,
        })
    }
}

/// A single saturating counter.
pub struct BitField<'a> {
    bits: &'a Bits,
    base: bool,
}

impl<'a> BitField<'a> {
    /// Width of the counter in bits, which is also its saturation value.
    pub fn width(&self) -> usize {
        self.bits.len()
    }

    /// Index of the highest bit that is not the base bit.
    fn boundary(&self) -> Option<usize> {
        if self.base {
            self.bits.last_zero()
        } else {
            self.bits.last_one()
        }
    }

    /// Number of recorded accesses, saturating at `width()`.
    pub fn read(&self) -> usize {
        self.boundary().map_or(0, |idx| idx + 1)
    }

    pub fn is_saturated(&self) -> bool {
        self.read() == self.width()
    }

    /// Record one more access. Moves the boundary up by one bit; a saturated counter is left
    /// unchanged.
    pub fn advance(&self) {
        let next = self.read();
        if next == self.width() {
            return;
        }
        self.bits.set_aliased(next, !self.base);
        if next > 0 {
            self.bits.set_aliased(next - 1, self.base);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_bytes(len: usize, fill: u8) -> Vec<AtomicU8> {
        (0..len).map(|_| AtomicU8::new(fill)).collect()
    }

    fn load(bytes: &[AtomicU8]) -> Vec<u8> {
        bytes
            .iter()
            .map(|b| b.load(std::sync::atomic::Ordering::Relaxed))
            .collect()
    }

    #[test]
    fn test_element_width() {
        assert_eq!(ELEMENT_WIDTH, 32);
    }

    #[test]
    fn test_advance_counts_and_saturates() {
        let bytes = arena_bytes(2 * ELEMENT_WIDTH, 0);
        let arena = BitFieldArena::new(&bytes, ELEMENT_WIDTH);
        let field = arena.field(1, false).unwrap();
        let width = field.width();
        assert_eq!(width, ELEMENT_WIDTH * 8);
        let mut previous = field.read();
        for n in 1..=(width + 10) {
            field.advance();
            let count = field.read();
            assert_eq!(count, n.min(width));
            assert!(count >= previous);
            previous = count;
        }
        assert!(field.is_saturated());
        // the neighboring counter is untouched
        assert_eq!(arena.field(0, false).unwrap().read(), 0);
        assert!(load(&bytes[..ELEMENT_WIDTH]).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_saturated_field_is_unchanged() {
        let bytes = arena_bytes(4, 0);
        let arena = BitFieldArena::new(&bytes, 4);
        let field = arena.field(0, false).unwrap();
        for _ in 0..32 {
            field.advance();
        }
        let before = load(&bytes);
        assert_eq!(before, vec![0, 0, 0, 0x80]);
        field.advance();
        assert_eq!(load(&bytes), before);
    }

    #[test]
    fn test_bit_layout() {
        let bytes = arena_bytes(2, 0);
        let arena = BitFieldArena::new(&bytes, 2);
        let field = arena.field(0, false).unwrap();
        field.advance();
        assert_eq!(load(&bytes), vec![0x01, 0x00]);
        field.advance();
        assert_eq!(load(&bytes), vec![0x02, 0x00]);
        for _ in 0..7 {
            field.advance();
        }
        assert_eq!(load(&bytes), vec![0x00, 0x01]);
    }

    #[test]
    fn test_base_one() {
        let bytes = arena_bytes(1, 0xFF);
        let arena = BitFieldArena::new(&bytes, 1);
        let field = arena.field(0, true).unwrap();
        assert_eq!(field.read(), 0);
        field.advance();
        assert_eq!(load(&bytes), vec![0xFE]);
        field.advance();
        assert_eq!(load(&bytes), vec![0xFD]);
        for _ in 0..20 {
            field.advance();
        }
        assert_eq!(field.read(), 8);
        assert_eq!(load(&bytes), vec![0x7F]);
    }

    #[test]
    fn test_out_of_range_field() {
        let bytes = arena_bytes(ELEMENT_WIDTH * 3 + 5, 0);
        let arena = BitFieldArena::new(&bytes, ELEMENT_WIDTH);
        assert_eq!(arena.len(), 3);
        assert!(arena.field(2, false).is_some());
        assert!(arena.field(3, false).is_none());
    }
}
