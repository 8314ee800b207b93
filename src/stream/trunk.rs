//! Bounded window over a lower stream, exposed as a stream of its own
//! starting at position zero.

use crate::bigint::Bigint;
use crate::error::Error;
use crate::error::Result;
use crate::stream::check_not_terminated;
use crate::stream::Mode;
use crate::stream::SkipDirection;
use crate::stream::Stream;

/// Window `[offset, offset + size)` of the layer below.
pub struct TrunkStream {
    below: Box<dyn Stream>,
    offset: Bigint,
    size: Option<Bigint>,
    terminated: bool,
}

impl TrunkStream {
    /// Builds a window of `size` bytes starting at `offset`. A `None`
    /// size extends the window to the end of the lower stream.
    pub fn new(mut below: Box<dyn Stream>, offset: Bigint, size: Option<Bigint>) -> Result<Self> {
        if !below.skip(&offset)? {
            return Err(Error::range("window start is past the end of the stream"));
        }
        Ok(Self {
            below,
            offset,
            size,
            terminated: false,
        })
    }

    /// Consumes the layer, returning the one below.
    pub fn into_inner(self) -> Box<dyn Stream> {
        self.below
    }

    fn inner_position(&self) -> Result<Bigint> {
        self.below.position()?.sub(&self.offset)
    }

    /// Bytes remaining before the end of the window, when bounded.
    fn remaining(&self) -> Result<Option<Bigint>> {
        match &self.size {
            Some(size) => {
                let pos = self.inner_position()?;
                Ok(Some(size.checked_sub(&pos).unwrap_or_default()))
            }
            None => Ok(None),
        }
    }
}

impl Stream for TrunkStream {
    fn mode(&self) -> Mode {
        self.below.mode()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        check_not_terminated(self)?;
        let want = match self.remaining()? {
            Some(rem) => match rem.to_usize() {
                Some(r) => buf.len().min(r),
                None => buf.len(),
            },
            None => buf.len(),
        };
        if want == 0 {
            return Ok(0);
        }
        self.below.read(&mut buf[..want])
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        check_not_terminated(self)?;
        if let Some(rem) = self.remaining()? {
            if Bigint::from(buf.len()) > rem {
                return Err(Error::range("write overflows the window"));
            }
        }
        self.below.write(buf)
    }

    fn skip(&mut self, pos: &Bigint) -> Result<bool> {
        check_not_terminated(self)?;
        if let Some(size) = &self.size {
            if pos > size {
                self.below.skip(&(&self.offset + size))?;
                return Ok(false);
            }
        }
        self.below.skip(&(&self.offset + pos))
    }

    fn skip_relative(&mut self, delta: i64) -> Result<bool> {
        check_not_terminated(self)?;
        let pos = self.inner_position()?;
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
        match self.size.clone() {
            Some(size) => self.skip(&size),
            None => self.below.skip_to_eof(),
        }
    }

    fn position(&self) -> Result<Bigint> {
        check_not_terminated(self)?;
        self.inner_position()
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
        // the window does not own the data, it only narrows the view;
        // still propagate so the pile unwinds in order
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;
        self.below.terminate()
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }

    fn add_escape_mark(
        &mut self,
        kind: crate::escape::MarkKind,
        unjumpable: bool,
    ) -> Result<()> {
        self.below.add_escape_mark(kind, unjumpable)
    }

    fn next_escape_mark(&mut self) -> Result<Option<crate::escape::MarkKind>> {
        self.below.next_escape_mark()
    }

    fn skip_to_escape_mark(&mut self, kind: crate::escape::MarkKind) -> Result<bool> {
        self.below.skip_to_escape_mark(kind)
    }

    fn set_raw_mode(&mut self, raw: bool) -> Result<()> {
        self.below.set_raw_mode(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::memory::MemoryStream;

    #[test]
    fn window_bounds_reads() {
        let data: Vec<u8> = (0..50u8).collect();
        let below = MemoryStream::with_contents(data);
        let mut t = TrunkStream::new(
            Box::new(below),
            Bigint::from(10u64),
            Some(Bigint::from(5u64)),
        )
        .unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(t.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], &[10, 11, 12, 13, 14]);
        assert_eq!(t.read(&mut buf).unwrap(), 0);
        assert_eq!(t.position().unwrap().to_u64(), Some(5));
        assert!(t.skip(&Bigint::from(2u64)).unwrap());
        assert_eq!(t.read(&mut buf[..1]).unwrap(), 1);
        assert_eq!(buf[0], 12);
        assert!(!t.skip(&Bigint::from(9u64)).unwrap());
    }

    #[test]
    fn unbounded_window() {
        let data: Vec<u8> = (0..20u8).collect();
        let mut t =
            TrunkStream::new(Box::new(MemoryStream::with_contents(data)), Bigint::from(15u64), None)
                .unwrap();
        t.skip_to_eof().unwrap();
        assert_eq!(t.position().unwrap().to_u64(), Some(5));
    }
}
