//! Header written at the start of every slice file.

use crate::bigint::Bigint;
use crate::error::Error;
use crate::error::Result;
use crate::label::Label;
use crate::label::LABEL_SIZE;
use crate::stream::memory::MemoryStream;
use crate::stream::read_exact;
use crate::stream::read_u8;
use crate::stream::Stream;
use crate::tlv::Tlv;
use crate::tlv::TlvList;
use crate::user::Ui;
use byteorder::BigEndian;
use byteorder::ByteOrder;

/// Magic number opening every slice.
pub const SLICE_MAGIC: u32 = 123;

/// This slice is the last one.
pub const FLAG_TERMINAL: u8 = b'T';
/// More slices follow.
pub const FLAG_NON_TERMINAL: u8 = b'N';
/// The real flag is the last byte of the slice file.
pub const FLAG_LOCATED_AT_END: u8 = b'L';

/// Oldest format: no extension, sizes deduced from file sizes.
pub const EXTENSION_NONE: u8 = b'N';
/// Old format: one integer giving the size of the non-first slices.
pub const EXTENSION_SIZE: u8 = b'S';
/// Current format: a TLV list.
pub const EXTENSION_TLV: u8 = b'T';

const TLV_SIZE: u16 = 1;
const TLV_FIRST_SIZE: u16 = 2;
const TLV_DATA_NAME: u16 = 3;
const TLV_RESERVED: u16 = 65535;

/// Parsed slice header.
#[derive(Clone, Debug)]
pub struct SliceHeader {
    pub internal_name: Label,
    pub flag: u8,
    pub extension: u8,
    /// Size of the non-first slices, when carried by the header.
    pub slice_size: Option<Bigint>,
    /// Size of the first slice, when carried by the header.
    pub first_size: Option<Bigint>,
    /// Data set identity, when carried by the header.
    pub data_name: Option<Label>,
}

impl SliceHeader {
    /// Builds a current-format header.
    pub fn new(
        internal_name: Label,
        data_name: Label,
        slice_size: Bigint,
        first_size: Option<Bigint>,
    ) -> Self {
        Self {
            internal_name,
            flag: FLAG_LOCATED_AT_END,
            extension: EXTENSION_TLV,
            slice_size: Some(slice_size),
            first_size,
            data_name: Some(data_name),
        }
    }

    fn build_tlv(&self) -> TlvList {
        let mut list = TlvList::new();
        if let Some(size) = &self.slice_size {
            let mut m = MemoryStream::new();
            let _ = size.dump(&mut m);
            list.push(Tlv::new(TLV_SIZE, m.into_contents()));
        }
        if let Some(first) = &self.first_size {
            let mut m = MemoryStream::new();
            let _ = first.dump(&mut m);
            list.push(Tlv::new(TLV_FIRST_SIZE, m.into_contents()));
        }
        if let Some(name) = &self.data_name {
            list.push(Tlv::new(TLV_DATA_NAME, name.0.to_vec()));
        }
        list
    }

    /// Writes the header: magic, internal name, flag, extension tag and
    /// the extension body.
    pub fn write(&self, f: &mut dyn Stream) -> Result<()> {
        let mut magic = [0u8; 4];
        BigEndian::write_u32(&mut magic, SLICE_MAGIC);
        f.write(&magic)?;
        self.internal_name.dump(f)?;
        f.write(&[self.flag, self.extension])?;
        match self.extension {
            EXTENSION_NONE => Ok(()),
            EXTENSION_SIZE => match &self.slice_size {
                Some(size) => size.dump(f),
                None => Err(Error::bug("size extension without a slice size")),
            },
            EXTENSION_TLV => self.build_tlv().dump(f),
            _ => Err(Error::bug("unknown header extension on write")),
        }
    }

    /// Number of bytes `write` produces.
    pub fn wire_size(&self) -> Result<Bigint> {
        let mut m = MemoryStream::new();
        self.write(&mut m)?;
        Ok(Bigint::from(m.size()))
    }

    /// Reads a header back. In lax mode a bad magic number is reported
    /// but does not interrupt the reading.
    pub fn read(f: &mut dyn Stream, ui: &Ui, lax: bool) -> Result<Self> {
        let mut magic = [0u8; 4];
        read_exact(f, &mut magic)?;
        if BigEndian::read_u32(&magic) != SLICE_MAGIC {
            if !lax {
                return Err(Error::range("not a slice file: bad magic number"));
            }
            ui.message("bad magic number in slice header, proceeding anyway as laxist mode is set");
        }
        let internal_name = Label::read(f)?;
        let flag = read_u8(f)?;
        let extension = read_u8(f)?;
        let mut header = Self {
            internal_name,
            flag,
            extension,
            slice_size: None,
            first_size: None,
            data_name: None,
        };
        match extension {
            EXTENSION_NONE => {}
            EXTENSION_SIZE => {
                header.slice_size = Some(Bigint::read(f)?);
            }
            EXTENSION_TLV => {
                let list = TlvList::read(f)?;
                header.fill_from_tlv(&list, ui)?;
            }
            _ => {
                if !lax {
                    return Err(Error::range("unknown extension in slice header"));
                }
                ui.message("unknown extension in slice header, ignoring it");
            }
        }
        Ok(header)
    }

    fn fill_from_tlv(&mut self, list: &TlvList, ui: &Ui) -> Result<()> {
        for item in list.iter() {
            match item.tag {
                TLV_SIZE => {
                    let mut m = MemoryStream::with_contents(item.value.clone());
                    self.slice_size = Some(Bigint::read(&mut m)?);
                }
                TLV_FIRST_SIZE => {
                    let mut m = MemoryStream::with_contents(item.value.clone());
                    self.first_size = Some(Bigint::read(&mut m)?);
                }
                TLV_DATA_NAME => {
                    if item.value.len() != LABEL_SIZE {
                        return Err(Error::range("data name of unexpected length in header"));
                    }
                    let mut l = Label::cleared();
                    l.0.copy_from_slice(&item.value);
                    self.data_name = Some(l);
                }
                TLV_RESERVED => {
                    return Err(Error::range(
                        "reserved extension met in header: archive made by a too recent format",
                    ))
                }
                _ => {
                    ui.pause_or_abort(
                        "unknown entry found in slice header, ignore it and continue?",
                    )?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::ScriptedInteraction;
    use std::sync::Arc;

    fn ui() -> Ui {
        Arc::new(ScriptedInteraction::new(true, ""))
    }

    #[test]
    fn tlv_roundtrip() {
        let h = SliceHeader::new(
            Label::generate(),
            Label::generate(),
            Bigint::from(4096u64),
            Some(Bigint::from(1024u64)),
        );
        let mut m = MemoryStream::new();
        h.write(&mut m).unwrap();
        assert_eq!(h.wire_size().unwrap().to_usize(), Some(m.size()));
        m.skip(&Bigint::zero()).unwrap();
        let back = SliceHeader::read(&mut m, &ui(), false).unwrap();
        assert_eq!(back.internal_name, h.internal_name);
        assert_eq!(back.flag, FLAG_LOCATED_AT_END);
        assert_eq!(back.slice_size, Some(Bigint::from(4096u64)));
        assert_eq!(back.first_size, Some(Bigint::from(1024u64)));
        assert_eq!(back.data_name, h.data_name);
    }

    #[test]
    fn legacy_size_extension() {
        let mut h = SliceHeader::new(
            Label::generate(),
            Label::generate(),
            Bigint::from(2048u64),
            None,
        );
        h.extension = EXTENSION_SIZE;
        h.flag = FLAG_NON_TERMINAL;
        let mut m = MemoryStream::new();
        h.write(&mut m).unwrap();
        m.skip(&Bigint::zero()).unwrap();
        let back = SliceHeader::read(&mut m, &ui(), false).unwrap();
        assert_eq!(back.slice_size, Some(Bigint::from(2048u64)));
        assert_eq!(back.first_size, None);
        assert_eq!(back.data_name, None);
    }

    #[test]
    fn bad_magic_rejected_unless_lax() {
        let mut m = MemoryStream::new();
        m.write(&[0u8; 64]).unwrap();
        m.skip(&Bigint::zero()).unwrap();
        assert!(SliceHeader::read(&mut m, &ui(), false).is_err());
        m.skip(&Bigint::zero()).unwrap();
        assert!(SliceHeader::read(&mut m, &ui(), true).is_ok());
    }
}
