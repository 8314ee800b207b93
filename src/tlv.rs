//! Type-length-value records used in slice headers.

use crate::bigint::Bigint;
use crate::error::Error;
use crate::error::Result;
use crate::stream::read_exact;
use crate::stream::Stream;
use byteorder::BigEndian;
use byteorder::ByteOrder;

/// One tagged value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Tlv {
    pub tag: u16,
    pub value: Vec<u8>,
}

impl Tlv {
    pub fn new(tag: u16, value: Vec<u8>) -> Self {
        Self { tag, value }
    }

    /// Writes tag (big-endian), length and value.
    pub fn dump(&self, f: &mut dyn Stream) -> Result<()> {
        let mut tag = [0u8; 2];
        BigEndian::write_u16(&mut tag, self.tag);
        f.write(&tag)?;
        Bigint::from(self.value.len()).dump(f)?;
        f.write(&self.value)
    }

    /// Reads back a record written by `dump`.
    pub fn read(f: &mut dyn Stream) -> Result<Self> {
        let mut tag = [0u8; 2];
        read_exact(f, &mut tag)?;
        let len = Bigint::read(f)?
            .to_usize()
            .ok_or_else(|| Error::range("tagged value length out of bounds"))?;
        let mut value = vec![0u8; len];
        read_exact(f, &mut value)?;
        Ok(Self {
            tag: BigEndian::read_u16(&tag),
            value,
        })
    }
}

/// Counted list of records.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TlvList {
    items: Vec<Tlv>,
}

impl TlvList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: Tlv) {
        self.items.push(item);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tlv> {
        self.items.iter()
    }

    /// Returns the first record carrying the given tag.
    pub fn find(&self, tag: u16) -> Option<&Tlv> {
        self.items.iter().find(|t| t.tag == tag)
    }

    /// Writes the count then every record.
    pub fn dump(&self, f: &mut dyn Stream) -> Result<()> {
        Bigint::from(self.items.len()).dump(f)?;
        for item in &self.items {
            item.dump(f)?;
        }
        Ok(())
    }

    /// Reads back a list written by `dump`.
    pub fn read(f: &mut dyn Stream) -> Result<Self> {
        let count = Bigint::read(f)?
            .to_usize()
            .ok_or_else(|| Error::range("tagged list count out of bounds"))?;
        let mut list = Self::new();
        for _ in 0..count {
            list.push(Tlv::read(f)?);
        }
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::memory::MemoryStream;

    #[test]
    fn list_roundtrip() {
        let mut list = TlvList::new();
        list.push(Tlv::new(1, vec![1, 2, 3]));
        list.push(Tlv::new(65535, vec![]));
        let mut m = MemoryStream::new();
        list.dump(&mut m).unwrap();
        m.skip(&Bigint::zero()).unwrap();
        let back = TlvList::read(&mut m).unwrap();
        assert_eq!(back, list);
        assert_eq!(back.find(65535).unwrap().value, vec![]);
        assert!(back.find(7).is_none());
    }
}
