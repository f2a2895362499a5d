//! Fixed-width registers packed into a little-endian bit stream.
//!
//! Register `i` of a `w`-bit array occupies bits `[i * w, (i + 1) * w)`, where bit `b` of the
//! stream is bit `b % 8` of byte `b / 8`. This is the layout of the serialized HyperLogLog state.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MAX_BIT_SIZE: u32 = 32;

/// An owned array of `len` registers of `bit_size` bits each.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PackedRegisterArray {
    bytes: Vec<u8>,
    bit_size: u32,
    len: usize,
}

impl PackedRegisterArray {
    /// Creates an array of `len` zero registers.
    ///
    /// # Panics
    ///
    /// Panics if `bit_size` is not in `1..=32`.
    pub fn new(bit_size: u32, len: usize) -> Self {
        assert!(
            (1..=MAX_BIT_SIZE).contains(&bit_size),
            "bit size must be in 1..=32, got {bit_size}"
        );
        Self {
            bytes: vec![0; Self::length_in_bytes(len, bit_size)],
            bit_size,
            len,
        }
    }

    /// Interprets `bytes` as `len` registers of `bit_size` bits.
    ///
    /// Fails if the byte count is not exactly [`Self::length_in_bytes`].
    pub fn from_bytes(bit_size: u32, len: usize, bytes: Vec<u8>) -> Result<Self> {
        assert!(
            (1..=MAX_BIT_SIZE).contains(&bit_size),
            "bit size must be in 1..=32, got {bit_size}"
        );
        if bytes.len() != Self::length_in_bytes(len, bit_size) {
            return Err(Error::InvalidStateLength(bytes.len()));
        }
        Ok(Self {
            bytes,
            bit_size,
            len,
        })
    }

    /// Number of bytes needed for `len` registers of `bit_size` bits.
    pub const fn length_in_bytes(len: usize, bit_size: u32) -> usize {
        (len * bit_size as usize + 7) >> 3
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bit_size(&self) -> u32 {
        self.bit_size
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    #[inline]
    fn mask(&self) -> u64 {
        u64::MAX >> (64 - self.bit_size)
    }

    /// Byte address and bit shift of register `idx`.
    #[inline]
    fn locate(&self, idx: usize) -> (usize, u32) {
        assert!(
            idx < self.len,
            "register index {idx} out of range for length {}",
            self.len
        );
        let addr_in_bits = idx * self.bit_size as usize;
        (addr_in_bits >> 3, (addr_in_bits & 7) as u32)
    }

    /// Loads up to 8 bytes starting at `addr`, zero padded past the end of the buffer.
    #[inline]
    fn load_window(&self, addr: usize) -> u64 {
        let mut window = [0u8; 8];
        if addr + 8 <= self.bytes.len() {
            window.copy_from_slice(&self.bytes[addr..addr + 8]);
        } else {
            let available = self.bytes.len() - addr;
            window[..available].copy_from_slice(&self.bytes[addr..]);
        }
        u64::from_le_bytes(window)
    }

    #[inline]
    fn store_window(&mut self, addr: usize, window: u64) {
        let end = (addr + 8).min(self.bytes.len());
        self.bytes[addr..end].copy_from_slice(&window.to_le_bytes()[..end - addr]);
    }

    /// Returns the value of register `idx`.
    #[inline]
    pub fn get(&self, idx: usize) -> u64 {
        let (addr, shift) = self.locate(idx);
        (self.load_window(addr) >> shift) & self.mask()
    }

    /// Sets register `idx` to the low `bit_size` bits of `value` and returns the previous value.
    #[inline]
    pub fn set(&mut self, idx: usize, value: u64) -> u64 {
        let (addr, shift) = self.locate(idx);
        let mask = self.mask();
        let window = self.load_window(addr);
        let old = (window >> shift) & mask;
        self.store_window(
            addr,
            (window & !(mask << shift)) | ((value & mask) << shift),
        );
        old
    }

    /// Replaces register `idx` with `f(old, value)` and returns the old value.
    #[inline]
    pub fn update<F>(&mut self, idx: usize, value: u64, f: F) -> u64
    where
        F: FnOnce(u64, u64) -> u64,
    {
        let old = self.get(idx);
        let new = f(old, value);
        if new != old {
            self.set(idx, new);
        }
        old
    }

    /// Raises register `idx` to `value` if it is currently smaller. Returns the old value.
    #[inline]
    pub fn update_max(&mut self, idx: usize, value: u64) -> u64 {
        self.update(idx, value, u64::max)
    }

    /// Sets all registers to zero.
    pub fn clear(&mut self) {
        self.bytes.fill(0);
    }

    /// Iterates over all register values in index order.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len).map(move |idx| self.get(idx))
    }

    /// Number of indices at which both arrays hold the same value.
    pub fn num_equal_components(&self, other: &PackedRegisterArray) -> usize {
        self.iter()
            .zip(other.iter())
            .filter(|(a, b)| a == b)
            .count()
    }
}
