//! Buffering layer, absorbing small reads and writes before they reach
//! the layer below.

use crate::bigint::Bigint;
use crate::error::Result;
use crate::stream::check_not_terminated;
use crate::stream::Mode;
use crate::stream::SkipDirection;
use crate::stream::Stream;

/// Default buffer capacity.
pub const DEFAULT_CACHE_SIZE: usize = 102_400;

/// Buffered stream over a lower layer.
///
/// When clean, the buffer holds bytes read ahead starting at `start` and
/// the lower layer sits right after them. When dirty, the buffer holds
/// pending writes starting at `start` and the lower layer still sits at
/// `start`.
pub struct CacheStream {
    below: Box<dyn Stream>,
    capacity: usize,
    buffer: Vec<u8>,
    start: Bigint,
    cursor: usize,
    dirty: bool,
    terminated: bool,
}

impl CacheStream {
    pub fn new(below: Box<dyn Stream>, capacity: usize) -> Result<Self> {
        let start = below.position()?;
        Ok(Self {
            below,
            capacity: capacity.max(1),
            buffer: Vec::new(),
            start,
            cursor: 0,
            dirty: false,
            terminated: false,
        })
    }

    /// Consumes the layer, returning the one below.
    pub fn into_inner(mut self) -> Result<Box<dyn Stream>> {
        self.flush_pending()?;
        Ok(self.below)
    }

    fn logical_position(&self) -> Bigint {
        &self.start + &Bigint::from(self.cursor)
    }

    fn flush_pending(&mut self) -> Result<()> {
        if self.dirty {
            self.below.write(&self.buffer)?;
            self.start += self.buffer.len() as u64;
            self.buffer.clear();
            self.cursor = 0;
            self.dirty = false;
        }
        Ok(())
    }

    /// Drops a clean read buffer, repositioning the layer below on the
    /// logical position.
    fn drop_read_buffer(&mut self) -> Result<()> {
        if !self.dirty && !self.buffer.is_empty() {
            let logical = self.logical_position();
            self.below.skip(&logical)?;
            self.start = logical;
            self.buffer.clear();
            self.cursor = 0;
        }
        Ok(())
    }
}

impl Stream for CacheStream {
    fn mode(&self) -> Mode {
        self.below.mode()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        check_not_terminated(self)?;
        self.flush_pending()?;
        let mut done = 0;
        while done < buf.len() {
            if self.cursor < self.buffer.len() {
                let n = (buf.len() - done).min(self.buffer.len() - self.cursor);
                buf[done..done + n].copy_from_slice(&self.buffer[self.cursor..self.cursor + n]);
                self.cursor += n;
                done += n;
                continue;
            }
            // refill
            self.start += self.buffer.len() as u64;
            self.cursor = 0;
            self.buffer.resize(self.capacity, 0);
            let got = self.below.read(&mut self.buffer)?;
            self.buffer.truncate(got);
            if got == 0 {
                break;
            }
        }
        Ok(done)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        check_not_terminated(self)?;
        if !self.dirty {
            self.drop_read_buffer()?;
            self.dirty = true;
        }
        self.buffer.extend_from_slice(buf);
        self.cursor = self.buffer.len();
        if self.buffer.len() >= self.capacity {
            self.flush_pending()?;
            self.dirty = true;
        }
        Ok(())
    }

    fn skip(&mut self, pos: &Bigint) -> Result<bool> {
        check_not_terminated(self)?;
        // cheap path: the target is inside the clean buffer
        if !self.dirty && *pos >= self.start {
            if let Some(off) = pos.sub(&self.start).ok().and_then(|d| d.to_usize()) {
                if off <= self.buffer.len() {
                    self.cursor = off;
                    return Ok(true);
                }
            }
        }
        self.flush_pending()?;
        self.buffer.clear();
        self.cursor = 0;
        let ok = self.below.skip(pos)?;
        self.start = self.below.position()?;
        Ok(ok)
    }

    fn skip_relative(&mut self, delta: i64) -> Result<bool> {
        check_not_terminated(self)?;
        let logical = self.logical_position();
        if delta >= 0 {
            self.skip(&(&logical + &Bigint::from(delta as u64)))
        } else {
            match logical.checked_sub(&Bigint::from((-delta) as u64)) {
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
        self.flush_pending()?;
        self.buffer.clear();
        self.cursor = 0;
        let ok = self.below.skip_to_eof()?;
        self.start = self.below.position()?;
        Ok(ok)
    }

    fn position(&self) -> Result<Bigint> {
        check_not_terminated(self)?;
        Ok(self.logical_position())
    }

    fn skippable(&self, direction: SkipDirection, amount: &Bigint) -> bool {
        self.below.skippable(direction, amount)
    }

    fn read_ahead(&mut self, amount: &Bigint) -> Result<()> {
        self.below.read_ahead(amount)
    }

    fn sync_write(&mut self) -> Result<()> {
        check_not_terminated(self)?;
        self.flush_pending()?;
        self.below.sync_write()
    }

    fn flush_read(&mut self) -> Result<()> {
        check_not_terminated(self)?;
        self.drop_read_buffer()?;
        self.below.flush_read()
    }

    fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.flush_pending()?;
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
        self.flush_pending()?;
        self.below.add_escape_mark(kind, unjumpable)
    }

    fn next_escape_mark(&mut self) -> Result<Option<crate::escape::MarkKind>> {
        self.flush_pending()?;
        self.drop_read_buffer()?;
        self.below.next_escape_mark()
    }

    fn skip_to_escape_mark(&mut self, kind: crate::escape::MarkKind) -> Result<bool> {
        self.flush_pending()?;
        self.drop_read_buffer()?;
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
    fn small_writes_coalesce() {
        let below = MemoryStream::new();
        let mut c = CacheStream::new(Box::new(below), 16).unwrap();
        for i in 0..40u8 {
            c.write(&[i]).unwrap();
        }
        assert_eq!(c.position().unwrap().to_u64(), Some(40));
        c.sync_write().unwrap();
        c.skip(&Bigint::from(10u64)).unwrap();
        let mut b = [0u8; 4];
        assert_eq!(c.read(&mut b).unwrap(), 4);
        assert_eq!(b, [10, 11, 12, 13]);
        c.terminate().unwrap();
    }

    #[test]
    fn read_through_buffer() {
        let data: Vec<u8> = (0..100u8).collect();
        let mut c = CacheStream::new(Box::new(MemoryStream::with_contents(data)), 8).unwrap();
        let mut buf = [0u8; 30];
        assert_eq!(c.read(&mut buf).unwrap(), 30);
        assert_eq!(buf[29], 29);
        // in-buffer backward skip
        assert!(c.skip(&Bigint::from(25u64)).unwrap());
        let mut one = [0u8; 1];
        c.read(&mut one).unwrap();
        assert_eq!(one[0], 25);
        c.skip_to_eof().unwrap();
        assert_eq!(c.position().unwrap().to_u64(), Some(100));
        assert_eq!(c.read(&mut one).unwrap(), 0);
    }
}
