//! Bit-level message buffers
//!
//! Records are packed LSB-first into a `bitvec` buffer so ranged fields can
//! use exactly the number of bits their range needs.

use bitvec::prelude::*;

/// Ran past the end of the buffer while reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Read past end of message: wanted {requested} bits at position {position}, {remaining} left")]
pub struct OutOfBits {
    pub position: usize,
    pub requested: usize,
    pub remaining: usize,
}

/// Growable bit writer
#[derive(Debug, Default, Clone)]
pub struct BitWriter {
    bits: BitVec<u8, Lsb0>,
}

impl BitWriter {
    pub fn new() -> Self {
        Self {
            bits: BitVec::with_capacity(256 * 8),
        }
    }

    #[inline]
    pub fn write_bit(&mut self, bit: bool) {
        self.bits.push(bit);
    }

    /// Write the low `count` bits of `value`, least significant first
    pub fn write_bits(&mut self, value: u64, count: u32) {
        debug_assert!(count <= 64);
        if count == 0 {
            return;
        }
        self.bits
            .extend_from_bitslice(&value.view_bits::<Lsb0>()[..count as usize]);
    }

    #[inline]
    pub fn write_u8(&mut self, value: u8) {
        self.write_bits(value as u64, 8);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.bits.extend_from_bitslice(bytes.view_bits::<Lsb0>());
    }

    /// Unsigned LEB128-style varint (7 bits per group)
    pub fn write_varint(&mut self, mut value: u64) {
        loop {
            let group = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                self.write_u8(group);
                return;
            }
            self.write_u8(group | 0x80);
        }
    }

    pub fn bit_len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Finish the message, zero-padding the final byte
    pub fn into_bytes(mut self) -> Vec<u8> {
        self.bits.set_uninitialized(false);
        self.bits.into_vec()
    }
}

/// Bit reader over a borrowed message
pub struct BitReader<'a> {
    bits: &'a BitSlice<u8, Lsb0>,
    position: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            bits: data.view_bits::<Lsb0>(),
            position: 0,
        }
    }

    fn take(&mut self, count: usize) -> Result<&'a BitSlice<u8, Lsb0>, OutOfBits> {
        if count > self.remaining_bits() {
            return Err(OutOfBits {
                position: self.position,
                requested: count,
                remaining: self.remaining_bits(),
            });
        }
        let slice = &self.bits[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }

    pub fn read_bit(&mut self) -> Result<bool, OutOfBits> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bits(&mut self, count: u32) -> Result<u64, OutOfBits> {
        debug_assert!(count <= 64);
        if count == 0 {
            return Ok(0);
        }
        Ok(self.take(count as usize)?.load_le::<u64>())
    }

    pub fn read_u8(&mut self) -> Result<u8, OutOfBits> {
        Ok(self.read_bits(8)? as u8)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, OutOfBits> {
        let slice = self.take(len * 8)?;
        Ok(slice.chunks(8).map(|byte| byte.load_le::<u8>()).collect())
    }

    /// Returns `None` when the varint runs longer than 64 bits
    pub fn read_varint(&mut self) -> Result<Option<u64>, OutOfBits> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let group = self.read_u8()?;
            value |= ((group & 0x7F) as u64) << shift;
            if group & 0x80 == 0 {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining_bits(&self) -> usize {
        self.bits.len() - self.position
    }
}
