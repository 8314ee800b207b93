//! Fixed-size identity tag stamped on archives and layers.

use crate::error::Result;
use crate::stream::read_exact;
use crate::stream::Stream;
use rand_core::OsRng;
use rand_core::RngCore;
use std::fmt;

/// Number of bytes in a label.
pub const LABEL_SIZE: usize = 10;

/// Opaque 10-byte identity.
///
/// An archive carries two of these: the internal name, new for each
/// physical archive, and the data name, which follows the data across
/// re-slicing and catalogue isolation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct Label(pub [u8; LABEL_SIZE]);

impl Label {
    /// Returns a cleared (all zero) label.
    pub fn cleared() -> Self {
        Self::default()
    }

    /// Generates a fresh random label.
    pub fn generate() -> Self {
        let mut l = Self::default();
        OsRng.fill_bytes(&mut l.0);
        l
    }

    /// Resets the label to the cleared state.
    pub fn clear(&mut self) {
        self.0 = [0; LABEL_SIZE];
    }

    /// Tells whether the label is cleared.
    pub fn is_cleared(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Flips the first byte, forcing the label to differ from its
    /// previous value.
    pub fn invert_first_byte(&mut self) {
        self.0[0] = !self.0[0];
    }

    /// Writes the raw bytes.
    pub fn dump(&self, f: &mut dyn Stream) -> Result<()> {
        f.write(&self.0)
    }

    /// Reads the raw bytes.
    pub fn read(f: &mut dyn Stream) -> Result<Self> {
        let mut l = Self::default();
        read_exact(f, &mut l.0)?;
        Ok(l)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(fmt, "{b:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bigint::Bigint;
    use crate::stream::memory::MemoryStream;

    #[test]
    fn generate_and_invert() {
        let mut a = Label::generate();
        let b = a;
        assert!(!a.is_cleared());
        a.invert_first_byte();
        assert_ne!(a, b);
        a.clear();
        assert!(a.is_cleared());
    }

    #[test]
    fn dump_read() {
        let l = Label::generate();
        let mut m = MemoryStream::new();
        l.dump(&mut m).unwrap();
        m.skip(&Bigint::zero()).unwrap();
        assert_eq!(Label::read(&mut m).unwrap(), l);
    }
}
