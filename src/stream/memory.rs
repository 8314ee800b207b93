//! Growable in-memory stream.

use crate::bigint::Bigint;
use crate::error::Error;
use crate::error::Result;
use crate::stream::check_not_terminated;
use crate::stream::Mode;
use crate::stream::SkipDirection;
use crate::stream::Stream;

/// Read-write stream over a byte vector.
#[derive(Clone, Debug, Default)]
pub struct MemoryStream {
    data: Vec<u8>,
    pos: usize,
    terminated: bool,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a stream positioned at the start of the given contents.
    pub fn with_contents(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            terminated: false,
        }
    }

    /// Borrows the underlying bytes.
    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the stream, returning the underlying bytes.
    pub fn into_contents(self) -> Vec<u8> {
        self.data
    }

    /// Drops the contents and rewinds.
    pub fn reset(&mut self) {
        self.data.clear();
        self.pos = 0;
    }

    /// Total number of bytes held.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl Stream for MemoryStream {
    fn mode(&self) -> Mode {
        Mode::ReadWrite
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        check_not_terminated(self)?;
        let n = buf.len().min(self.data.len() - self.pos.min(self.data.len()));
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        check_not_terminated(self)?;
        let end = self.pos + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[self.pos..end].copy_from_slice(buf);
        self.pos = end;
        Ok(())
    }

    fn skip(&mut self, pos: &Bigint) -> Result<bool> {
        check_not_terminated(self)?;
        match pos.to_usize() {
            Some(p) if p <= self.data.len() => {
                self.pos = p;
                Ok(true)
            }
            _ => {
                self.pos = self.data.len();
                Ok(false)
            }
        }
    }

    fn skip_relative(&mut self, delta: i64) -> Result<bool> {
        check_not_terminated(self)?;
        let target = self.pos as i64 + delta;
        if target < 0 {
            self.pos = 0;
            return Ok(false);
        }
        self.skip(&Bigint::from(target as u64))
    }

    fn skip_to_eof(&mut self) -> Result<bool> {
        check_not_terminated(self)?;
        self.pos = self.data.len();
        Ok(true)
    }

    fn position(&self) -> Result<Bigint> {
        if self.terminated {
            return Err(Error::misuse("position on a terminated stream"));
        }
        Ok(Bigint::from(self.pos))
    }

    fn skippable(&self, _direction: SkipDirection, _amount: &Bigint) -> bool {
        true
    }

    fn sync_write(&mut self) -> Result<()> {
        check_not_terminated(self)
    }

    fn flush_read(&mut self) -> Result<()> {
        check_not_terminated(self)
    }

    fn terminate(&mut self) -> Result<()> {
        self.terminated = true;
        Ok(())
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_seek() {
        let mut m = MemoryStream::new();
        m.write(b"abcdef").unwrap();
        assert_eq!(m.position().unwrap().to_u64(), Some(6));
        assert!(m.skip(&Bigint::from(2u64)).unwrap());
        let mut buf = [0u8; 3];
        assert_eq!(m.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"cde");
        assert!(m.skip_relative(-2).unwrap());
        assert_eq!(m.position().unwrap().to_u64(), Some(3));
        // overwrite in the middle
        m.write(b"XY").unwrap();
        assert_eq!(m.contents(), b"abcXYf");
        assert!(!m.skip(&Bigint::from(100u64)).unwrap());
        assert_eq!(m.position().unwrap().to_u64(), Some(6));
    }

    #[test]
    fn terminate_blocks_use() {
        let mut m = MemoryStream::new();
        m.terminate().unwrap();
        assert!(m.write(b"x").is_err());
        assert!(m.terminate().is_ok());
    }
}
