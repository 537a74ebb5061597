//! Bit-addressable read/write stream for replication payloads
//!
//! Updates pack many small fields (flags, slot indices, quantized values), so
//! the wire format is addressed in bits rather than bytes. A stream is scratch
//! memory for one send/receive cycle: the managers build one per message and
//! never carry it across ticks.

use bitvec::prelude::*;

use crate::util::vec3::{Quat, Vec3};

/// Errors that can occur while reading from a stream
#[derive(Debug, thiserror::Error)]
pub enum BitStreamError {
    #[error("Read past end of stream: wanted {wanted} bits, {available} available")]
    Exhausted { wanted: usize, available: usize },
    #[error("Bit width {0} out of range (1-64)")]
    InvalidWidth(usize),
}

/// Growable bit buffer with independent read and write cursors.
///
/// Writes grow the buffer; reads fail with [`BitStreamError::Exhausted`] when
/// they would pass the written length. Both cursors can be repositioned, which
/// the destroy-message writer uses to patch an offset field after its
/// variable-size payload is known.
#[derive(Debug, Default, Clone)]
pub struct BitStream {
    bits: BitVec<u8, Lsb0>,
    read_pos: usize,
    write_pos: usize,
}

impl BitStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap received bytes for reading
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut bits = BitVec::with_capacity(data.len() * 8);
        bits.extend_from_bitslice(data.view_bits::<Lsb0>());
        Self {
            bits,
            read_pos: 0,
            write_pos: data.len() * 8,
        }
    }

    /// Written length in bits
    pub fn len_bits(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// True once the read cursor has consumed the written length
    pub fn is_exhausted(&self) -> bool {
        self.read_pos >= self.bits.len()
    }

    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    pub fn set_read_pos(&mut self, pos: usize) {
        self.read_pos = pos;
    }

    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    /// Reposition the write cursor (backtracking write for patched fields).
    /// Writing before the end overwrites in place.
    pub fn set_write_pos(&mut self, pos: usize) {
        self.write_pos = pos;
    }

    /// Advance the write cursor to the next byte boundary, zero-padding
    pub fn align_write_to_byte(&mut self) {
        self.write_pos = (self.write_pos + 7) & !7;
        if self.bits.len() < self.write_pos {
            self.bits.resize(self.write_pos, false);
        }
    }

    /// Advance the read cursor to the next byte boundary
    pub fn align_read_to_byte(&mut self) {
        self.read_pos = (self.read_pos + 7) & !7;
    }

    /// Reset both cursors and drop all content
    pub fn clear(&mut self) {
        self.bits.clear();
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Copy out the written content, zero-padded to whole bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.as_raw_slice()[..self.bits.len().div_ceil(8)].to_vec()
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    fn ensure_len(&mut self, end: usize) {
        if self.bits.len() < end {
            self.bits.resize(end, false);
        }
    }

    pub fn write_bool(&mut self, value: bool) {
        self.ensure_len(self.write_pos + 1);
        self.bits.set(self.write_pos, value);
        self.write_pos += 1;
    }

    /// Write the low `width` bits of `value`
    pub fn write_bits(&mut self, value: u32, width: usize) {
        debug_assert!((1..=32).contains(&width));
        let end = self.write_pos + width;
        self.ensure_len(end);
        self.bits[self.write_pos..end].store_le(value);
        self.write_pos = end;
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write_bits(u32::from(value), 8);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_bits(u32::from(value), 16);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_bits(value, 32);
    }

    pub fn write_u64(&mut self, value: u64) {
        let end = self.write_pos + 64;
        self.ensure_len(end);
        self.bits[self.write_pos..end].store_le(value);
        self.write_pos = end;
    }

    pub fn write_f32(&mut self, value: f32) {
        self.write_u32(value.to_bits());
    }

    pub fn write_vec3(&mut self, value: Vec3) {
        self.write_f32(value.x);
        self.write_f32(value.y);
        self.write_f32(value.z);
    }

    pub fn write_quat(&mut self, value: Quat) {
        self.write_f32(value.x);
        self.write_f32(value.y);
        self.write_f32(value.z);
        self.write_f32(value.w);
    }

    /// Splice another stream's written content in at the write cursor
    pub fn append(&mut self, other: &BitStream) {
        let end = self.write_pos + other.bits.len();
        self.ensure_len(end);
        self.bits[self.write_pos..end].copy_from_bitslice(&other.bits);
        self.write_pos = end;
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    fn take(&mut self, width: usize) -> Result<std::ops::Range<usize>, BitStreamError> {
        let end = self.read_pos + width;
        if end > self.bits.len() {
            return Err(BitStreamError::Exhausted {
                wanted: width,
                available: self.bits.len().saturating_sub(self.read_pos),
            });
        }
        let range = self.read_pos..end;
        self.read_pos = end;
        Ok(range)
    }

    pub fn read_bool(&mut self) -> Result<bool, BitStreamError> {
        let range = self.take(1)?;
        Ok(self.bits[range.start])
    }

    /// Read `width` bits as an unsigned integer
    pub fn read_bits(&mut self, width: usize) -> Result<u32, BitStreamError> {
        if !(1..=32).contains(&width) {
            return Err(BitStreamError::InvalidWidth(width));
        }
        let range = self.take(width)?;
        Ok(self.bits[range].load_le())
    }

    pub fn read_u8(&mut self) -> Result<u8, BitStreamError> {
        self.read_bits(8).map(|v| v as u8)
    }

    pub fn read_u16(&mut self) -> Result<u16, BitStreamError> {
        self.read_bits(16).map(|v| v as u16)
    }

    pub fn read_u32(&mut self) -> Result<u32, BitStreamError> {
        self.read_bits(32)
    }

    pub fn read_u64(&mut self) -> Result<u64, BitStreamError> {
        let range = self.take(64)?;
        Ok(self.bits[range].load_le())
    }

    pub fn read_f32(&mut self) -> Result<f32, BitStreamError> {
        self.read_u32().map(f32::from_bits)
    }

    pub fn read_vec3(&mut self) -> Result<Vec3, BitStreamError> {
        Ok(Vec3::new(self.read_f32()?, self.read_f32()?, self.read_f32()?))
    }

    pub fn read_quat(&mut self) -> Result<Quat, BitStreamError> {
        Ok(Quat::new(
            self.read_f32()?,
            self.read_f32()?,
            self.read_f32()?,
            self.read_f32()?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bool_roundtrip() {
        let mut bs = BitStream::new();
        bs.write_bool(true);
        bs.write_bool(false);
        bs.write_bool(true);

        assert_eq!(bs.len_bits(), 3);
        assert!(bs.read_bool().unwrap());
        assert!(!bs.read_bool().unwrap());
        assert!(bs.read_bool().unwrap());
        assert!(bs.is_exhausted());
    }

    #[test]
    fn test_mixed_widths_roundtrip() {
        let mut bs = BitStream::new();
        bs.write_bool(true);
        bs.write_bits(0b101, 3);
        bs.write_u8(0xAB);
        bs.write_u16(54321);
        bs.write_u32(0xDEAD_BEEF);
        bs.write_u64(u64::MAX - 7);
        bs.write_f32(3.5);

        assert!(bs.read_bool().unwrap());
        assert_eq!(bs.read_bits(3).unwrap(), 0b101);
        assert_eq!(bs.read_u8().unwrap(), 0xAB);
        assert_eq!(bs.read_u16().unwrap(), 54321);
        assert_eq!(bs.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(bs.read_u64().unwrap(), u64::MAX - 7);
        assert_eq!(bs.read_f32().unwrap(), 3.5);
        assert!(bs.is_exhausted());
    }

    #[test]
    fn test_read_past_end_fails() {
        let mut bs = BitStream::new();
        bs.write_u8(1);

        assert_eq!(bs.read_u8().unwrap(), 1);
        assert!(matches!(
            bs.read_u8(),
            Err(BitStreamError::Exhausted { wanted: 8, available: 0 })
        ));
    }

    #[test]
    fn test_partial_read_past_end_reports_available() {
        let mut bs = BitStream::new();
        bs.write_bits(0b11, 2);

        let err = bs.read_u8().unwrap_err();
        assert!(matches!(err, BitStreamError::Exhausted { wanted: 8, available: 2 }));
    }

    #[test]
    fn test_align_write_pads_with_zeros() {
        let mut bs = BitStream::new();
        bs.write_bits(0b111, 3);
        bs.align_write_to_byte();
        bs.write_u8(0xFF);

        assert_eq!(bs.len_bits(), 16);
        assert_eq!(bs.read_bits(3).unwrap(), 0b111);
        assert_eq!(bs.read_bits(5).unwrap(), 0);
        assert_eq!(bs.read_u8().unwrap(), 0xFF);
    }

    #[test]
    fn test_align_read_resyncs() {
        let mut bs = BitStream::new();
        bs.write_bool(true);
        bs.align_write_to_byte();
        bs.write_u16(999);

        bs.read_bool().unwrap();
        bs.align_read_to_byte();
        assert_eq!(bs.read_u16().unwrap(), 999);
    }

    #[test]
    fn test_backtracking_write_patches_in_place() {
        // Same pattern the destroy message uses: reserve a u16, write a
        // variable payload, then come back and patch the reserved field.
        let mut bs = BitStream::new();
        bs.write_u8(7);
        let patch_pos = bs.write_pos();
        bs.write_u16(0); // placeholder
        bs.write_u32(0xCAFE_F00D);

        let end = bs.write_pos();
        bs.set_write_pos(patch_pos);
        bs.write_u16(1234);
        bs.set_write_pos(end);

        assert_eq!(bs.read_u8().unwrap(), 7);
        assert_eq!(bs.read_u16().unwrap(), 1234);
        assert_eq!(bs.read_u32().unwrap(), 0xCAFE_F00D);
        assert_eq!(bs.len_bits(), 8 + 16 + 32);
    }

    #[test]
    fn test_append_splices_at_bit_granularity() {
        let mut payload = BitStream::new();
        payload.write_bits(0b10110, 5);
        payload.write_u8(0x42);

        let mut bs = BitStream::new();
        bs.write_u8(3);
        bs.append(&payload);

        assert_eq!(bs.read_u8().unwrap(), 3);
        assert_eq!(bs.read_bits(5).unwrap(), 0b10110);
        assert_eq!(bs.read_u8().unwrap(), 0x42);
        assert!(bs.is_exhausted());
    }

    #[test]
    fn test_bytes_roundtrip() {
        let mut bs = BitStream::new();
        bs.write_bool(true);
        bs.write_u32(42);
        bs.align_write_to_byte();

        let bytes = bs.to_bytes();
        let mut rx = BitStream::from_bytes(&bytes);
        assert!(rx.read_bool().unwrap());
        assert_eq!(rx.read_u32().unwrap(), 42);
    }

    #[test]
    fn test_vec3_quat_roundtrip() {
        let mut bs = BitStream::new();
        bs.write_vec3(Vec3::new(1.0, -2.5, 3.25));
        bs.write_quat(Quat::new(0.0, 0.5, -0.5, 1.0));

        assert_eq!(bs.read_vec3().unwrap(), Vec3::new(1.0, -2.5, 3.25));
        assert_eq!(bs.read_quat().unwrap(), Quat::new(0.0, 0.5, -0.5, 1.0));
    }

    #[test]
    fn test_clear_resets_cursors() {
        let mut bs = BitStream::new();
        bs.write_u64(1);
        bs.read_u32().unwrap();
        bs.clear();

        assert!(bs.is_empty());
        assert_eq!(bs.read_pos(), 0);
        assert_eq!(bs.write_pos(), 0);
    }

    #[test]
    fn test_randomized_roundtrip() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED);

        for _ in 0..100 {
            let mut bs = BitStream::new();
            let mut expected = Vec::new();
            for _ in 0..rng.gen_range(1..64) {
                let width = rng.gen_range(1..=32usize);
                let value = rng.gen::<u32>() & (u32::MAX >> (32 - width));
                bs.write_bits(value, width);
                expected.push((value, width));
            }
            for (value, width) in expected {
                assert_eq!(bs.read_bits(width).unwrap(), value);
            }
            assert!(bs.is_exhausted());
        }
    }
}
