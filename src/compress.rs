//! Compression layer: clear data is cut into blocks, each compressed and
//! written as a length-prefixed record, so that closing the stream at a
//! file boundary leaves the layer below at a stable offset.

use crate::bigint::Bigint;
use crate::error::Error;
use crate::error::Result;
use crate::escape::MarkKind;
use crate::stream::check_not_terminated;
use crate::stream::read_exact;
use crate::stream::Mode;
use crate::stream::SkipDirection;
use crate::stream::Stream;
use miniz_oxide::deflate::compress_to_vec;
use miniz_oxide::inflate::decompress_to_vec;

/// Default clear-data block size.
pub const DEFAULT_BLOCK_SIZE: usize = 102_400;

/// Compression algorithms an archive may declare.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CompressionAlgo {
    #[default]
    None,
    Gzip,
    Bzip2,
    Lzo,
    Xz,
    Zstd,
    Lz4,
}

impl CompressionAlgo {
    /// One-byte code stored in the archive header.
    pub fn code(self) -> u8 {
        match self {
            Self::None => b'n',
            Self::Gzip => b'g',
            Self::Bzip2 => b'b',
            Self::Lzo => b'o',
            Self::Xz => b'x',
            Self::Zstd => b'z',
            Self::Lz4 => b'4',
        }
    }

    /// Decodes a header byte.
    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            b'n' => Self::None,
            b'g' => Self::Gzip,
            b'b' => Self::Bzip2,
            b'o' => Self::Lzo,
            b'x' => Self::Xz,
            b'z' => Self::Zstd,
            b'4' => Self::Lz4,
            _ => return Err(Error::range("unknown compression algorithm in header")),
        })
    }

    /// Tells whether this build can actually compress and decompress
    /// with the algorithm.
    pub fn is_available(self) -> bool {
        matches!(self, Self::None | Self::Gzip)
    }

    fn check_available(self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(Error::feature(format!(
                "compression algorithm {self:?} is not available in this build"
            )))
        }
    }
}

/// Compressing/decompressing layer.
///
/// With the `None` algorithm the layer is a pure passthrough and writes
/// no block framing at all.
pub struct CompressStream {
    below: Box<dyn Stream>,
    algo: CompressionAlgo,
    level: u8,
    block_size: usize,
    /// Clear bytes pending compression (write side).
    pending: Vec<u8>,
    /// Clear bytes of the current block (read side).
    buffer: Vec<u8>,
    cursor: usize,
    /// An end-of-stream record was met; holds until the next skip.
    at_end: bool,
    /// Passthrough mode for the structures around the payload area.
    raw: bool,
    terminated: bool,
}

impl std::fmt::Debug for CompressStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressStream").finish_non_exhaustive()
    }
}

impl CompressStream {
    pub fn new(
        below: Box<dyn Stream>,
        algo: CompressionAlgo,
        level: u8,
        block_size: Option<usize>,
    ) -> Result<Self> {
        algo.check_available()?;
        if !matches!(algo, CompressionAlgo::Zstd) && !(1..=9).contains(&level)
            && algo != CompressionAlgo::None
        {
            return Err(Error::range("compression level out of the 1-9 range"));
        }
        Ok(Self {
            below,
            algo,
            level,
            block_size: block_size.unwrap_or(DEFAULT_BLOCK_SIZE).max(1024),
            pending: Vec::new(),
            buffer: Vec::new(),
            cursor: 0,
            at_end: false,
            raw: false,
            terminated: false,
        })
    }

    pub fn algo(&self) -> CompressionAlgo {
        self.algo
    }

    /// Consumes the layer, returning the one below.
    pub fn into_inner(mut self) -> Result<Box<dyn Stream>> {
        self.end_stream()?;
        Ok(self.below)
    }

    fn emit_block(&mut self, clear: &[u8]) -> Result<()> {
        let compressed = compress_to_vec(clear, self.level.min(10));
        Bigint::from(compressed.len()).dump(self.below.as_mut())?;
        self.below.write(&compressed)
    }

    /// Flushes pending clear data and closes the current compressed
    /// stream with an empty record.
    fn end_stream(&mut self) -> Result<()> {
        if self.algo == CompressionAlgo::None || self.raw || !self.mode().can_write() {
            return Ok(());
        }
        if !self.pending.is_empty() {
            let block = std::mem::take(&mut self.pending);
            self.emit_block(&block)?;
        }
        Bigint::zero().dump(self.below.as_mut())
    }

    /// Loads the next block of clear data (read side). Returns false at
    /// the end of the compressed stream.
    fn refill(&mut self) -> Result<bool> {
        if self.at_end {
            return Ok(false);
        }
        let len = match Bigint::read_opt(self.below.as_mut())? {
            Some(l) => l,
            None => {
                self.at_end = true;
                return Ok(false);
            }
        };
        if len.is_zero() {
            self.at_end = true;
            return Ok(false);
        }
        let len = len
            .to_usize()
            .filter(|l| *l <= self.block_size + self.block_size / 2 + 1024)
            .ok_or_else(|| Error::data("compressed block length out of bounds"))?;
        let mut compressed = vec![0u8; len];
        read_exact(self.below.as_mut(), &mut compressed)?;
        self.buffer = decompress_to_vec(&compressed)
            .map_err(|_| Error::data("corrupted compressed block"))?;
        self.cursor = 0;
        Ok(true)
    }

    /// Forgets any buffered state so the next access starts a fresh
    /// compressed stream at the position of the layer below.
    fn reset(&mut self) {
        self.pending.clear();
        self.buffer.clear();
        self.cursor = 0;
        self.at_end = false;
    }
}

impl Stream for CompressStream {
    fn mode(&self) -> Mode {
        self.below.mode()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        check_not_terminated(self)?;
        if self.algo == CompressionAlgo::None || self.raw {
            return self.below.read(buf);
        }
        let mut done = 0;
        while done < buf.len() {
            if self.cursor < self.buffer.len() {
                let n = (buf.len() - done).min(self.buffer.len() - self.cursor);
                buf[done..done + n].copy_from_slice(&self.buffer[self.cursor..self.cursor + n]);
                self.cursor += n;
                done += n;
                continue;
            }
            if !self.refill()? {
                break;
            }
        }
        Ok(done)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        check_not_terminated(self)?;
        if self.algo == CompressionAlgo::None || self.raw {
            return self.below.write(buf);
        }
        self.pending.extend_from_slice(buf);
        while self.pending.len() >= self.block_size {
            let rest = self.pending.split_off(self.block_size);
            let block = std::mem::replace(&mut self.pending, rest);
            self.emit_block(&block)?;
        }
        Ok(())
    }

    fn skip(&mut self, pos: &Bigint) -> Result<bool> {
        check_not_terminated(self)?;
        if self.mode().can_write() && !self.pending.is_empty() {
            self.end_stream()?;
        }
        self.reset();
        self.below.skip(pos)
    }

    fn skip_relative(&mut self, delta: i64) -> Result<bool> {
        check_not_terminated(self)?;
        self.reset();
        self.below.skip_relative(delta)
    }

    fn skip_to_eof(&mut self) -> Result<bool> {
        check_not_terminated(self)?;
        if self.mode().can_write() {
            self.end_stream()?;
        }
        self.reset();
        self.below.skip_to_eof()
    }

    fn position(&self) -> Result<Bigint> {
        check_not_terminated(self)?;
        self.below.position()
    }

    fn skippable(&self, direction: SkipDirection, amount: &Bigint) -> bool {
        self.below.skippable(direction, amount)
    }

    fn read_ahead(&mut self, amount: &Bigint) -> Result<()> {
        self.below.read_ahead(amount)
    }

    fn sync_write(&mut self) -> Result<()> {
        check_not_terminated(self)?;
        if self.mode().can_write() {
            self.end_stream()?;
        }
        self.below.sync_write()
    }

    fn flush_read(&mut self) -> Result<()> {
        check_not_terminated(self)?;
        self.reset();
        self.below.flush_read()
    }

    fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        let res = if self.mode().can_write() {
            self.end_stream()
        } else {
            Ok(())
        };
        self.terminated = true;
        self.below.terminate()?;
        res
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }

    fn add_escape_mark(&mut self, kind: MarkKind, unjumpable: bool) -> Result<()> {
        if self.mode().can_write() && !self.pending.is_empty() {
            self.end_stream()?;
        }
        self.below.add_escape_mark(kind, unjumpable)
    }

    fn next_escape_mark(&mut self) -> Result<Option<MarkKind>> {
        self.reset();
        self.below.next_escape_mark()
    }

    fn skip_to_escape_mark(&mut self, kind: MarkKind) -> Result<bool> {
        self.reset();
        self.below.skip_to_escape_mark(kind)
    }

    fn set_raw_mode(&mut self, raw: bool) -> Result<()> {
        if raw && self.mode().can_write() && !self.pending.is_empty() {
            self.end_stream()?;
        }
        self.reset();
        self.raw = raw;
        self.below.set_raw_mode(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::memory::MemoryStream;

    #[test]
    fn algo_codes_roundtrip() {
        for algo in [
            CompressionAlgo::None,
            CompressionAlgo::Gzip,
            CompressionAlgo::Bzip2,
            CompressionAlgo::Lzo,
            CompressionAlgo::Xz,
            CompressionAlgo::Zstd,
            CompressionAlgo::Lz4,
        ] {
            assert_eq!(CompressionAlgo::from_code(algo.code()).unwrap(), algo);
        }
        assert!(CompressionAlgo::from_code(b'?').is_err());
        assert!(!CompressionAlgo::Zstd.is_available());
    }

    #[test]
    fn compress_decompress() {
        let below = MemoryStream::new();
        let mut c =
            CompressStream::new(Box::new(below), CompressionAlgo::Gzip, 6, Some(2048)).unwrap();
        let data: Vec<u8> = (0..10_000usize).map(|i| (i % 7) as u8).collect();
        c.write(&data).unwrap();
        c.sync_write().unwrap();
        let below = c.into_inner().unwrap();
        let compressed_len = below.position().unwrap().to_usize().unwrap();
        // repetitive data must actually shrink
        assert!(compressed_len < data.len() / 2);

        let mut below = below;
        below.skip(&Bigint::zero()).unwrap();
        let mut d =
            CompressStream::new(below, CompressionAlgo::Gzip, 6, Some(2048)).unwrap();
        let mut back = vec![0u8; data.len() + 100];
        let mut done = 0;
        loop {
            let n = d.read(&mut back[done..]).unwrap();
            if n == 0 {
                break;
            }
            done += n;
        }
        assert_eq!(done, data.len());
        assert_eq!(&back[..done], &data[..]);
    }

    #[test]
    fn sync_write_isolates_streams() {
        let below = MemoryStream::new();
        let mut c =
            CompressStream::new(Box::new(below), CompressionAlgo::Gzip, 6, None).unwrap();
        c.write(b"first body").unwrap();
        c.sync_write().unwrap();
        let second_start = c.position().unwrap();
        c.write(b"second body").unwrap();
        c.sync_write().unwrap();
        let mut below = c.into_inner().unwrap();

        // a reader starting at the recorded offset sees only the second
        // body
        below.skip(&second_start).unwrap();
        let mut d = CompressStream::new(below, CompressionAlgo::Gzip, 6, None).unwrap();
        let mut buf = [0u8; 64];
        let n = d.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"second body");
    }

    #[test]
    fn unavailable_algo_refused() {
        let below = MemoryStream::new();
        match CompressStream::new(Box::new(below), CompressionAlgo::Zstd, 3, None) {
            Err(Error::Feature(_)) => {}
            other => panic!("expected a feature error, got {other:?}"),
        }
    }
}
