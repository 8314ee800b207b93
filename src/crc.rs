//! Cyclic checksum whose width scales with the amount of protected data.

use crate::bigint::Bigint;
use crate::error::Error;
use crate::error::Result;
use crate::stream::read_exact;
use crate::stream::Stream;
use std::fmt;

/// Smallest checksum width in bytes.
const MIN_WIDTH: usize = 2;
/// Largest checksum width in bytes.
const MAX_WIDTH: usize = 20;
/// One more checksum byte per this many protected bytes (32 MiB).
const BYTES_PER_WIDTH: u64 = 1 << 25;

/// Checksum over a window of bytes, xor-folded cyclically.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Crc {
    window: Vec<u8>,
    pointer: usize,
}

impl Crc {
    /// Builds a checksum with an explicit width.
    pub fn with_width(width: usize) -> Self {
        Self {
            window: vec![0; width.clamp(1, MAX_WIDTH)],
            pointer: 0,
        }
    }

    /// Builds a checksum sized for the given protected data length: wider
    /// for larger bodies so collision odds stay flat.
    pub fn from_size(size: &Bigint) -> Self {
        let mut width = MIN_WIDTH;
        let mut threshold = Bigint::from(BYTES_PER_WIDTH);
        while width < MAX_WIDTH && *size > threshold {
            width += 1;
            threshold = threshold.mul(&Bigint::from(2u64));
        }
        Self::with_width(width)
    }

    /// Checksum width in bytes.
    pub fn width(&self) -> usize {
        self.window.len()
    }

    /// Resets the accumulated value.
    pub fn clear(&mut self) {
        self.window.fill(0);
        self.pointer = 0;
    }

    /// Folds data into the checksum.
    pub fn update(&mut self, data: &[u8]) {
        for b in data {
            self.window[self.pointer] ^= *b;
            self.pointer = (self.pointer + 1) % self.window.len();
        }
    }

    /// Writes the width then the window bytes.
    pub fn dump(&self, f: &mut dyn Stream) -> Result<()> {
        Bigint::from(self.window.len()).dump(f)?;
        f.write(&self.window)
    }

    /// Reads back a checksum written by `dump`.
    pub fn read(f: &mut dyn Stream) -> Result<Self> {
        let width = Bigint::read(f)?
            .to_usize()
            .filter(|w| *w >= 1 && *w <= MAX_WIDTH)
            .ok_or_else(|| Error::range("checksum width out of bounds"))?;
        let mut crc = Self::with_width(width);
        read_exact(f, &mut crc.window)?;
        Ok(crc)
    }

    /// Tells whether two checksums cover the same value, ignoring the
    /// rotation pointer.
    pub fn same_as(&self, other: &Self) -> bool {
        self.window == other.window
    }
}

impl fmt::Display for Crc {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.window {
            write!(fmt, "{b:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::memory::MemoryStream;

    #[test]
    fn width_scaling() {
        assert_eq!(Crc::from_size(&Bigint::from(100u64)).width(), 2);
        assert_eq!(Crc::from_size(&Bigint::from(1u64 << 20)).width(), 2);
        assert!(Crc::from_size(&Bigint::from(1u64 << 26)).width() > 2);
        assert_eq!(
            Crc::from_size(&Bigint::from_bytes(&[1; 30])).width(),
            MAX_WIDTH
        );
    }

    #[test]
    fn detects_change() {
        let mut a = Crc::with_width(4);
        let mut b = Crc::with_width(4);
        a.update(b"some data to protect");
        b.update(b"some data to protecu");
        assert!(!a.same_as(&b));
        let mut c = Crc::with_width(4);
        c.update(b"some data ");
        c.update(b"to protect");
        assert!(a.same_as(&c));
    }

    #[test]
    fn dump_read() {
        let mut a = Crc::with_width(3);
        a.update(b"payload");
        let mut m = MemoryStream::new();
        a.dump(&mut m).unwrap();
        m.skip(&Bigint::zero()).unwrap();
        let back = Crc::read(&mut m).unwrap();
        assert!(a.same_as(&back));
    }
}
