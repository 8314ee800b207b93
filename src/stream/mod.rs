//! Byte-stream abstraction every archive layer implements.

pub mod cache;
pub mod file;
pub mod memory;
pub mod pipe;
pub mod thread;
pub mod trunk;

use crate::bigint::Bigint;
use crate::crc::Crc;
use crate::error::Error;
use crate::error::Result;
use crate::escape::MarkKind;

/// Access mode of a stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    Read,
    Write,
    ReadWrite,
}

impl Mode {
    /// Tells whether reading is allowed.
    pub fn can_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    /// Tells whether writing is allowed.
    pub fn can_write(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// Direction of a `skippable` query.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SkipDirection {
    Forward,
    Backward,
}

/// Positioned byte stream.
///
/// `read` may return a short count only at end of stream; `write` writes
/// all bytes or fails. After `terminate` any read or write is a misuse
/// error.
pub trait Stream {
    /// Access mode of the stream.
    fn mode(&self) -> Mode;

    /// Reads up to `buf.len()` bytes, returning the number read.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Writes the whole buffer.
    fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Moves to the given absolute position. Returns false when the
    /// position cannot be reached.
    fn skip(&mut self, pos: &Bigint) -> Result<bool>;

    /// Moves relatively to the current position.
    fn skip_relative(&mut self, delta: i64) -> Result<bool>;

    /// Moves to the end of the stream.
    fn skip_to_eof(&mut self) -> Result<bool>;

    /// Current absolute position.
    fn position(&self) -> Result<Bigint>;

    /// Cheap query telling whether a skip of the given magnitude can be
    /// done without large reads.
    fn skippable(&self, direction: SkipDirection, amount: &Bigint) -> bool;

    /// Advisory read-ahead hint. May be a no-op.
    fn read_ahead(&mut self, _amount: &Bigint) -> Result<()> {
        Ok(())
    }

    /// Flushes pending writes of this layer down to the next.
    fn sync_write(&mut self) -> Result<()>;

    /// Drops pending read-ahead buffers, propagating down.
    fn flush_read(&mut self) -> Result<()>;

    /// Finalizes the layer. Idempotent.
    fn terminate(&mut self) -> Result<()>;

    /// Tells whether `terminate` has been called.
    fn is_terminated(&self) -> bool;

    /// Inserts an out-of-band mark. Forwarded down the stack until an
    /// escape layer handles it.
    fn add_escape_mark(&mut self, _kind: MarkKind, _unjumpable: bool) -> Result<()> {
        Err(Error::misuse("no escape layer in this stack"))
    }

    /// Scans forward to the next mark of any kind. Forwarded down the
    /// stack until an escape layer handles it.
    fn next_escape_mark(&mut self) -> Result<Option<MarkKind>> {
        Err(Error::misuse("no escape layer in this stack"))
    }

    /// Scans forward for a mark of the given kind. Forwarded down the
    /// stack until an escape layer handles it.
    fn skip_to_escape_mark(&mut self, _kind: MarkKind) -> Result<bool> {
        Err(Error::misuse("no escape layer in this stack"))
    }

    /// Switches the transforming layers (compression, escape) between
    /// their normal behavior and a transparent passthrough, used for the
    /// structures around the payload area. Layers without a
    /// transformation ignore it.
    fn set_raw_mode(&mut self, _raw: bool) -> Result<()> {
        Ok(())
    }
}

/// Shared handle on a stream, letting a stack be built over a layer the
/// coordinator keeps direct access to. Terminating a handle detaches it
/// without closing the underlying stream; the owner of the last handle
/// closes it explicitly.
pub struct SharedStream {
    inner: std::rc::Rc<std::cell::RefCell<Box<dyn Stream>>>,
    detached: bool,
}

impl SharedStream {
    /// Wraps a stream, returning two handles on it.
    pub fn pair(inner: Box<dyn Stream>) -> (Self, Self) {
        let rc = std::rc::Rc::new(std::cell::RefCell::new(inner));
        (
            Self {
                inner: rc.clone(),
                detached: false,
            },
            Self {
                inner: rc,
                detached: false,
            },
        )
    }

    /// Recovers the underlying stream once every other handle is gone.
    pub fn try_unwrap(self) -> Result<Box<dyn Stream>> {
        std::rc::Rc::try_unwrap(self.inner)
            .map(|cell| cell.into_inner())
            .map_err(|_| Error::bug("stream handle still shared"))
    }

    /// Closes the underlying stream itself, not just this handle.
    pub fn terminate_inner(&mut self) -> Result<()> {
        self.detached = true;
        self.inner.borrow_mut().terminate()
    }
}

impl Stream for SharedStream {
    fn mode(&self) -> Mode {
        self.inner.borrow().mode()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        check_not_terminated(self)?;
        self.inner.borrow_mut().read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        check_not_terminated(self)?;
        self.inner.borrow_mut().write(buf)
    }

    fn skip(&mut self, pos: &Bigint) -> Result<bool> {
        check_not_terminated(self)?;
        self.inner.borrow_mut().skip(pos)
    }

    fn skip_relative(&mut self, delta: i64) -> Result<bool> {
        check_not_terminated(self)?;
        self.inner.borrow_mut().skip_relative(delta)
    }

    fn skip_to_eof(&mut self) -> Result<bool> {
        check_not_terminated(self)?;
        self.inner.borrow_mut().skip_to_eof()
    }

    fn position(&self) -> Result<Bigint> {
        self.inner.borrow().position()
    }

    fn skippable(&self, direction: SkipDirection, amount: &Bigint) -> bool {
        self.inner.borrow().skippable(direction, amount)
    }

    fn read_ahead(&mut self, amount: &Bigint) -> Result<()> {
        self.inner.borrow_mut().read_ahead(amount)
    }

    fn sync_write(&mut self) -> Result<()> {
        check_not_terminated(self)?;
        self.inner.borrow_mut().sync_write()
    }

    fn flush_read(&mut self) -> Result<()> {
        check_not_terminated(self)?;
        self.inner.borrow_mut().flush_read()
    }

    fn terminate(&mut self) -> Result<()> {
        // detach only: the owner of the underlying stream closes it
        if !self.detached {
            self.detached = true;
            if self.mode().can_write() {
                self.inner.borrow_mut().sync_write()?;
            }
        }
        Ok(())
    }

    fn is_terminated(&self) -> bool {
        self.detached
    }
}

/// Raises the canonical misuse error for operations on a terminated stream.
pub fn check_not_terminated(s: &dyn Stream) -> Result<()> {
    if s.is_terminated() {
        Err(Error::misuse("operation on a terminated stream"))
    } else {
        Ok(())
    }
}

/// Reads exactly `buf.len()` bytes or fails with a data error.
pub fn read_exact(f: &mut dyn Stream, buf: &mut [u8]) -> Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let n = f.read(&mut buf[done..])?;
        if n == 0 {
            return Err(Error::data("unexpected end of data"));
        }
        done += n;
    }
    Ok(())
}

/// Reads a single byte.
pub fn read_u8(f: &mut dyn Stream) -> Result<u8> {
    let mut b = [0u8; 1];
    read_exact(f, &mut b)?;
    Ok(b[0])
}

/// Writes a length-prefixed byte string.
pub fn write_lstring(f: &mut dyn Stream, s: &[u8]) -> Result<()> {
    Bigint::from(s.len()).dump(f)?;
    f.write(s)
}

/// Reads back a length-prefixed byte string.
pub fn read_lstring(f: &mut dyn Stream) -> Result<Vec<u8>> {
    let len = Bigint::read(f)?
        .to_usize()
        .ok_or_else(|| Error::range("string length out of bounds"))?;
    let mut buf = vec![0u8; len];
    read_exact(f, &mut buf)?;
    Ok(buf)
}

/// Copies `amount` bytes from `src` to `dst`, optionally feeding a CRC.
/// With `amount` at `None`, copies until end of `src`. Returns the number
/// of bytes moved.
pub fn copy_stream(
    src: &mut dyn Stream,
    dst: &mut dyn Stream,
    amount: Option<&Bigint>,
    mut crc: Option<&mut Crc>,
) -> Result<Bigint> {
    let mut buf = [0u8; 8192];
    let mut copied = Bigint::zero();
    let mut remain = amount.cloned();
    loop {
        let want = match &remain {
            Some(r) => {
                if r.is_zero() {
                    break;
                }
                match r.to_usize() {
                    Some(n) => n.min(buf.len()),
                    None => buf.len(),
                }
            }
            None => buf.len(),
        };
        let n = src.read(&mut buf[..want])?;
        if n == 0 {
            if remain.is_some() {
                return Err(Error::data("unexpected end of data while copying"));
            }
            break;
        }
        dst.write(&buf[..n])?;
        if let Some(c) = crc.as_deref_mut() {
            c.update(&buf[..n]);
        }
        copied += n as u64;
        if let Some(r) = remain.take() {
            remain = Some(r.sub(&Bigint::from(n))?);
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::memory::MemoryStream;

    #[test]
    fn lstring_roundtrip() {
        let mut m = MemoryStream::new();
        write_lstring(&mut m, b"hello").unwrap();
        write_lstring(&mut m, b"").unwrap();
        m.skip(&Bigint::zero()).unwrap();
        assert_eq!(read_lstring(&mut m).unwrap(), b"hello");
        assert_eq!(read_lstring(&mut m).unwrap(), b"");
    }

    #[test]
    fn bounded_copy() {
        let mut src = MemoryStream::with_contents(vec![7u8; 100]);
        let mut dst = MemoryStream::new();
        let n = copy_stream(&mut src, &mut dst, Some(&Bigint::from(40u64)), None).unwrap();
        assert_eq!(n.to_u64(), Some(40));
        assert_eq!(dst.contents().len(), 40);
        // asking for more than available is a data error
        let res = copy_stream(&mut src, &mut dst, Some(&Bigint::from(100u64)), None);
        assert!(res.is_err());
    }
}
