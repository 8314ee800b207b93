//! Degenerate slicing: the whole archive in one file or one pipe.

use crate::bigint::Bigint;
use crate::error::Error;
use crate::error::Result;
use crate::label::Label;
use crate::slice::header::SliceHeader;
use crate::slice::header::FLAG_TERMINAL;
use crate::slice::layout::SliceLayout;
use crate::stream::check_not_terminated;
use crate::stream::Mode;
use crate::stream::SkipDirection;
use crate::stream::Stream;
use crate::user::Ui;

/// Single-slice layer over any lower stream.
///
/// The header is written once with the terminal flag, since no other
/// slice can follow; there is no trailing flag byte.
pub struct SingleSlice {
    below: Box<dyn Stream>,
    header_size: Bigint,
    internal_name: Label,
    data_name: Label,
    terminated: bool,
}

impl SingleSlice {
    /// Writes the header on `below` and returns the layer.
    pub fn create(
        mut below: Box<dyn Stream>,
        internal_name: Label,
        data_name: Label,
    ) -> Result<Self> {
        let mut header = SliceHeader::new(internal_name, data_name, Bigint::zero(), None);
        header.flag = FLAG_TERMINAL;
        header.write(below.as_mut())?;
        let header_size = header.wire_size()?;
        Ok(Self {
            below,
            header_size,
            internal_name,
            data_name,
            terminated: false,
        })
    }

    /// Reads the header from `below` and returns the layer positioned at
    /// the start of the payload.
    pub fn open(mut below: Box<dyn Stream>, ui: &Ui, lax: bool) -> Result<Self> {
        let start = below.position()?;
        let header = SliceHeader::read(below.as_mut(), ui, lax)?;
        let header_size = below.position()?.sub(&start)?;
        Ok(Self {
            below,
            header_size,
            internal_name: header.internal_name,
            data_name: header.data_name.unwrap_or_else(Label::cleared),
            terminated: false,
        })
    }

    pub fn internal_name(&self) -> Label {
        self.internal_name
    }

    pub fn data_name(&self) -> Label {
        self.data_name
    }

    /// Geometry equivalent: everything in one slice of unbounded size.
    pub fn pseudo_layout(&self) -> SliceLayout {
        SliceLayout {
            first_size: Bigint::zero(),
            other_size: Bigint::zero(),
            first_header_size: self.header_size.clone(),
            other_header_size: self.header_size.clone(),
        }
    }
}

impl Stream for SingleSlice {
    fn mode(&self) -> Mode {
        self.below.mode()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        check_not_terminated(self)?;
        self.below.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        check_not_terminated(self)?;
        self.below.write(buf)
    }

    fn skip(&mut self, pos: &Bigint) -> Result<bool> {
        check_not_terminated(self)?;
        self.below.skip(&(&self.header_size + pos))
    }

    fn skip_relative(&mut self, delta: i64) -> Result<bool> {
        check_not_terminated(self)?;
        let pos = self.position()?;
        if delta >= 0 {
            self.skip(&(&pos + &Bigint::from(delta as u64)))
        } else {
            match pos.checked_sub(&Bigint::from((-delta) as u64)) {
                Some(target) => self.skip(&target),
                None => {
                    self.skip(&Bigint::zero())?;
                    Ok(false)
                }
            }
        }
    }

    fn skip_to_eof(&mut self) -> Result<bool> {
        check_not_terminated(self)?;
        self.below.skip_to_eof()
    }

    fn position(&self) -> Result<Bigint> {
        check_not_terminated(self)?;
        let below = self.below.position()?;
        below
            .checked_sub(&self.header_size)
            .ok_or_else(|| Error::bug("lower stream positioned inside the slice header"))
    }

    fn skippable(&self, direction: SkipDirection, amount: &Bigint) -> bool {
        self.below.skippable(direction, amount)
    }

    fn read_ahead(&mut self, amount: &Bigint) -> Result<()> {
        self.below.read_ahead(amount)
    }

    fn sync_write(&mut self) -> Result<()> {
        check_not_terminated(self)?;
        self.below.sync_write()
    }

    fn flush_read(&mut self) -> Result<()> {
        check_not_terminated(self)?;
        self.below.flush_read()
    }

    fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;
        self.below.terminate()
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::memory::MemoryStream;
    use crate::user::ScriptedInteraction;
    use std::sync::Arc;

    #[test]
    fn single_file_roundtrip() {
        let name = Label::generate();
        let data = Label::generate();
        let mut w =
            SingleSlice::create(Box::new(MemoryStream::new()), name, data).unwrap();
        w.write(b"payload bytes").unwrap();
        assert_eq!(w.position().unwrap().to_u64(), Some(13));
        // recover the buffer without terminating, to rebuild a reader
        let mut m = MemoryStream::new();
        w.skip(&Bigint::zero()).unwrap();
        let mut buf = [0u8; 64];
        let n = w.read(&mut buf).unwrap();
        m.write(&buf[..n]).unwrap();
        assert_eq!(&buf[..n], b"payload bytes");

        let ui: Ui = Arc::new(ScriptedInteraction::new(true, ""));
        // rebuild the full slice bytes to open it again
        let mut full = MemoryStream::new();
        let mut header = SliceHeader::new(name, data, Bigint::zero(), None);
        header.flag = FLAG_TERMINAL;
        header.write(&mut full).unwrap();
        full.write(b"payload bytes").unwrap();
        full.skip(&Bigint::zero()).unwrap();
        let mut r = SingleSlice::open(Box::new(full), &ui, false).unwrap();
        assert_eq!(r.internal_name(), name);
        assert_eq!(r.data_name(), data);
        let mut buf = [0u8; 7];
        assert_eq!(r.read(&mut buf).unwrap(), 7);
        assert_eq!(&buf, b"payload");
    }
}
