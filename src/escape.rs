//! Escape-mark layer: rare out-of-band byte sequences delimit sections
//! of the stream, enabling sequential reading and archive repair.

use crate::bigint::Bigint;
use crate::error::Error;
use crate::error::Result;
use crate::stream::check_not_terminated;
use crate::stream::Mode;
use crate::stream::SkipDirection;
use crate::stream::Stream;

/// The escape sequence, a byte pattern unlikely in payloads.
pub const ESCAPE_SEQ: [u8; 5] = [0xad, 0xfd, 0x52, 0x04, 0x58];

/// Set on the type byte of marks a sequential scan may not jump over.
const UNJUMPABLE_BIT: u8 = 0x80;

/// Kind of a mark.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MarkKind {
    CatalogueStart,
    FileStart,
    EaStart,
    FsaStart,
    DeltaSigStart,
    Dirty,
    /// Escapes payload bytes that look like the sequence itself.
    NotAMark,
}

impl MarkKind {
    fn code(self) -> u8 {
        match self {
            Self::CatalogueStart => b'C',
            Self::FileStart => b'F',
            Self::EaStart => b'E',
            Self::FsaStart => b'A',
            Self::DeltaSigStart => b'D',
            Self::Dirty => b'X',
            Self::NotAMark => b'N',
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        Some(match code & !UNJUMPABLE_BIT {
            b'C' => Self::CatalogueStart,
            b'F' => Self::FileStart,
            b'E' => Self::EaStart,
            b'A' => Self::FsaStart,
            b'D' => Self::DeltaSigStart,
            b'X' => Self::Dirty,
            b'N' => Self::NotAMark,
            _ => return None,
        })
    }
}

/// Longest suffix of `data` that is a proper prefix of the escape
/// sequence.
fn seq_prefix_suffix(data: &[u8]) -> usize {
    for take in (1..ESCAPE_SEQ.len()).rev() {
        if data.len() >= take && data[data.len() - take..] == ESCAPE_SEQ[..take] {
            return take;
        }
    }
    0
}

/// The escape layer. On write, payload occurrences of the sequence are
/// doubled with a not-a-mark type; on read, marks stop the data flow
/// until explicitly jumped to.
pub struct EscapeStream {
    below: Box<dyn Stream>,
    /// Write side: payload suffix held back because it could open a
    /// sequence.
    carry: Vec<u8>,
    /// Read side: classified payload bytes not yet delivered.
    ready: Vec<u8>,
    ready_cursor: usize,
    /// Read side: raw bytes read from below, not yet classified.
    raw: Vec<u8>,
    /// Read side: the mark the reading stopped at.
    stopped_at: Option<(MarkKind, bool)>,
    below_eof: bool,
    /// Passthrough mode: no escaping, no scanning.
    transparent: bool,
    terminated: bool,
}

impl EscapeStream {
    pub fn new(below: Box<dyn Stream>) -> Self {
        Self {
            below,
            carry: Vec::new(),
            ready: Vec::new(),
            ready_cursor: 0,
            raw: Vec::new(),
            stopped_at: None,
            below_eof: false,
            transparent: false,
            terminated: false,
        }
    }

    /// Consumes the layer, returning the one below.
    pub fn into_inner(mut self) -> Result<Box<dyn Stream>> {
        self.flush_carry()?;
        Ok(self.below)
    }

    fn flush_carry(&mut self) -> Result<()> {
        if !self.carry.is_empty() {
            let carry = std::mem::take(&mut self.carry);
            self.below.write(&carry)?;
        }
        Ok(())
    }

    /// Writes a mark of the given kind.
    pub fn add_mark(&mut self, kind: MarkKind) -> Result<()> {
        self.write_mark(kind.code())
    }

    /// Writes a mark a sequential scan must stop at, whatever it is
    /// looking for.
    pub fn add_unjumpable_mark(&mut self, kind: MarkKind) -> Result<()> {
        self.write_mark(kind.code() | UNJUMPABLE_BIT)
    }

    fn write_mark(&mut self, code: u8) -> Result<()> {
        check_not_terminated(self)?;
        self.flush_carry()?;
        self.below.write(&ESCAPE_SEQ)?;
        self.below.write(&[code])
    }

    /// The mark the last read stopped at, if any.
    pub fn stopped_at(&self) -> Option<MarkKind> {
        self.stopped_at.map(|(k, _)| k)
    }

    /// Clears the stopped-at state so reading resumes past the mark.
    pub fn clear_mark_stop(&mut self) {
        self.stopped_at = None;
    }

    /// Scans forward to the next mark of any kind, discarding payload on
    /// the way. Returns `None` at end of stream.
    pub fn next_mark(&mut self) -> Result<Option<MarkKind>> {
        loop {
            self.ready.clear();
            self.ready_cursor = 0;
            if let Some((kind, _)) = self.stopped_at.take() {
                return Ok(Some(kind));
            }
            if !self.classify()?
                && self.stopped_at.is_none()
                && self.below_eof
                && self.raw.is_empty()
            {
                return Ok(None);
            }
        }
    }

    /// Scans forward for the next mark of the wanted kind. Returns true
    /// when found (positioned right after its type byte); false at end
    /// of stream or on an unjumpable mark of another kind.
    pub fn skip_to_next_mark(&mut self, wanted: MarkKind) -> Result<bool> {
        check_not_terminated(self)?;
        loop {
            // drop pending payload, keep scanning
            self.ready.clear();
            self.ready_cursor = 0;
            match self.stopped_at.take() {
                Some((kind, _)) if kind == wanted => return Ok(true),
                Some((_, true)) => return Ok(false),
                Some((_, false)) => continue,
                None => {
                    if !self.classify()? {
                        if self.stopped_at.is_none() && self.below_eof && self.raw.is_empty() {
                            return Ok(false);
                        }
                    }
                }
            }
        }
    }

    /// Classifies raw bytes into payload and marks. Returns false when
    /// no progress was possible without more data and none is coming.
    fn classify(&mut self) -> Result<bool> {
        if !self.below_eof && self.raw.len() < ESCAPE_SEQ.len() + 1 {
            let mut chunk = vec![0u8; 8192];
            let n = self.below.read(&mut chunk)?;
            if n == 0 {
                self.below_eof = true;
            } else {
                self.raw.extend_from_slice(&chunk[..n]);
            }
        }
        if self.raw.is_empty() {
            return Ok(false);
        }
        // find the first full or partial occurrence of the sequence
        let mut i = 0;
        while i < self.raw.len() {
            if self.raw[i] != ESCAPE_SEQ[0] {
                i += 1;
                continue;
            }
            let avail = self.raw.len() - i;
            let matched = ESCAPE_SEQ
                .iter()
                .zip(&self.raw[i..])
                .take_while(|(a, b)| a == b)
                .count();
            if matched == ESCAPE_SEQ.len() {
                if avail >= ESCAPE_SEQ.len() + 1 {
                    // complete candidate: payload before it is ready
                    self.ready.extend_from_slice(&self.raw[..i]);
                    let code = self.raw[i + ESCAPE_SEQ.len()];
                    self.raw.drain(..i + ESCAPE_SEQ.len() + 1);
                    match MarkKind::from_code(code) {
                        Some(MarkKind::NotAMark) => {
                            self.ready.extend_from_slice(&ESCAPE_SEQ);
                            return Ok(true);
                        }
                        Some(kind) => {
                            self.stopped_at = Some((kind, code & UNJUMPABLE_BIT != 0));
                            return Ok(true);
                        }
                        None => {
                            // sequence met with a foreign type byte:
                            // corrupted mark
                            return Err(Error::data("corrupted escape mark in stream"));
                        }
                    }
                }
            } else if matched == avail && !self.below_eof {
                // partial sequence at the buffer end: wait for more
                break;
            } else {
                i += matched.max(1);
                continue;
            }
            break;
        }
        // everything before i is plain payload
        self.ready.extend_from_slice(&self.raw[..i]);
        self.raw.drain(..i);
        if self.below_eof && !self.raw.is_empty() && self.ready.is_empty() {
            // trailing partial sequence at end of stream is payload
            self.ready.append(&mut self.raw);
        }
        Ok(!self.ready.is_empty())
    }
}

impl Stream for EscapeStream {
    fn mode(&self) -> Mode {
        self.below.mode()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        check_not_terminated(self)?;
        if self.transparent && self.ready_cursor >= self.ready.len() && self.raw.is_empty() {
            return self.below.read(buf);
        }
        let mut done = 0;
        while done < buf.len() {
            if self.ready_cursor < self.ready.len() {
                let n = (buf.len() - done).min(self.ready.len() - self.ready_cursor);
                buf[done..done + n]
                    .copy_from_slice(&self.ready[self.ready_cursor..self.ready_cursor + n]);
                self.ready_cursor += n;
                done += n;
                continue;
            }
            self.ready.clear();
            self.ready_cursor = 0;
            if self.stopped_at.is_some() {
                break;
            }
            if !self.classify()? && self.stopped_at.is_none() {
                if self.below_eof && self.raw.is_empty() && self.ready.is_empty() {
                    break;
                }
            }
        }
        Ok(done)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        check_not_terminated(self)?;
        if self.transparent {
            self.flush_carry()?;
            return self.below.write(buf);
        }
        let mut data = std::mem::take(&mut self.carry);
        data.extend_from_slice(buf);
        // double every payload occurrence of the sequence
        let mut start = 0;
        let mut i = 0;
        while i + ESCAPE_SEQ.len() <= data.len() {
            if data[i..i + ESCAPE_SEQ.len()] == ESCAPE_SEQ {
                self.below.write(&data[start..i + ESCAPE_SEQ.len()])?;
                self.below.write(&[MarkKind::NotAMark.code()])?;
                i += ESCAPE_SEQ.len();
                start = i;
            } else {
                i += 1;
            }
        }
        // hold back a trailing prefix of the sequence
        let tail = &data[start..];
        let keep = seq_prefix_suffix(tail);
        let flush_until = data.len() - keep;
        if flush_until > start {
            self.below.write(&data[start..flush_until])?;
        }
        self.carry = data[flush_until..].to_vec();
        Ok(())
    }

    fn skip(&mut self, pos: &Bigint) -> Result<bool> {
        check_not_terminated(self)?;
        if self.mode().can_write() {
            self.flush_carry()?;
        }
        self.ready.clear();
        self.ready_cursor = 0;
        self.raw.clear();
        self.stopped_at = None;
        self.below_eof = false;
        self.below.skip(pos)
    }

    fn skip_relative(&mut self, delta: i64) -> Result<bool> {
        check_not_terminated(self)?;
        if self.mode().can_write() {
            self.flush_carry()?;
        }
        self.ready.clear();
        self.ready_cursor = 0;
        self.raw.clear();
        self.stopped_at = None;
        self.below_eof = false;
        self.below.skip_relative(delta)
    }

    fn skip_to_eof(&mut self) -> Result<bool> {
        check_not_terminated(self)?;
        if self.mode().can_write() {
            self.flush_carry()?;
        }
        self.ready.clear();
        self.ready_cursor = 0;
        self.raw.clear();
        self.stopped_at = None;
        self.below_eof = false;
        self.below.skip_to_eof()
    }

    fn position(&self) -> Result<Bigint> {
        check_not_terminated(self)?;
        self.below.position()
    }

    fn skippable(&self, direction: SkipDirection, amount: &Bigint) -> bool {
        self.below.skippable(direction, amount)
    }

    fn sync_write(&mut self) -> Result<()> {
        check_not_terminated(self)?;
        self.flush_carry()?;
        self.below.sync_write()
    }

    fn flush_read(&mut self) -> Result<()> {
        check_not_terminated(self)?;
        self.ready.clear();
        self.ready_cursor = 0;
        self.raw.clear();
        self.below_eof = false;
        self.below.flush_read()
    }

    fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        let res = if self.mode().can_write() {
            self.flush_carry()
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
        if unjumpable {
            self.add_unjumpable_mark(kind)
        } else {
            self.add_mark(kind)
        }
    }

    fn next_escape_mark(&mut self) -> Result<Option<MarkKind>> {
        self.next_mark()
    }

    fn skip_to_escape_mark(&mut self, kind: MarkKind) -> Result<bool> {
        self.skip_to_next_mark(kind)
    }

    fn set_raw_mode(&mut self, raw: bool) -> Result<()> {
        if self.mode().can_write() {
            self.flush_carry()?;
        }
        self.transparent = raw;
        self.below.set_raw_mode(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::memory::MemoryStream;

    #[test]
    fn payload_with_lookalike_roundtrips() {
        let mut payload = b"before".to_vec();
        payload.extend_from_slice(&ESCAPE_SEQ);
        payload.extend_from_slice(b"after");

        let mut w = EscapeStream::new(Box::new(MemoryStream::new()));
        w.write(&payload).unwrap();
        w.sync_write().unwrap();
        let mut below = w.into_inner().unwrap();
        below.skip(&Bigint::zero()).unwrap();

        let mut r = EscapeStream::new(below);
        let mut buf = vec![0u8; payload.len() + 16];
        let mut done = 0;
        loop {
            let n = r.read(&mut buf[done..]).unwrap();
            if n == 0 {
                break;
            }
            done += n;
        }
        assert_eq!(&buf[..done], &payload[..]);
    }

    #[test]
    fn marks_delimit_sections() {
        let mut w = EscapeStream::new(Box::new(MemoryStream::new()));
        w.write(b"file one").unwrap();
        w.add_mark(MarkKind::FileStart).unwrap();
        w.write(b"file two").unwrap();
        w.add_mark(MarkKind::CatalogueStart).unwrap();
        w.write(b"the catalogue").unwrap();
        w.sync_write().unwrap();
        let mut below = w.into_inner().unwrap();
        below.skip(&Bigint::zero()).unwrap();

        let mut r = EscapeStream::new(below);
        let mut buf = [0u8; 64];
        let n = r.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"file one");
        // reading stops at the mark until it is acknowledged
        assert_eq!(r.read(&mut buf).unwrap(), 0);
        assert_eq!(r.stopped_at(), Some(MarkKind::FileStart));
        r.clear_mark_stop();
        let n = r.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"file two");
        assert_eq!(r.read(&mut buf).unwrap(), 0);
        assert_eq!(r.stopped_at(), Some(MarkKind::CatalogueStart));
        r.clear_mark_stop();
        let n = r.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"the catalogue");
    }

    #[test]
    fn jump_to_catalogue() {
        let mut w = EscapeStream::new(Box::new(MemoryStream::new()));
        w.add_mark(MarkKind::FileStart).unwrap();
        w.write(b"body bytes").unwrap();
        w.add_mark(MarkKind::CatalogueStart).unwrap();
        w.write(b"catalogue").unwrap();
        w.sync_write().unwrap();
        let mut below = w.into_inner().unwrap();
        below.skip(&Bigint::zero()).unwrap();

        let mut r = EscapeStream::new(below);
        assert!(r.skip_to_next_mark(MarkKind::CatalogueStart).unwrap());
        let mut buf = [0u8; 32];
        let n = r.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"catalogue");
        // nothing further
        assert!(!r.skip_to_next_mark(MarkKind::CatalogueStart).unwrap());
    }

    #[test]
    fn unjumpable_stops_the_scan() {
        let mut w = EscapeStream::new(Box::new(MemoryStream::new()));
        w.write(b"data").unwrap();
        w.add_unjumpable_mark(MarkKind::Dirty).unwrap();
        w.write(b"more").unwrap();
        w.add_mark(MarkKind::CatalogueStart).unwrap();
        w.sync_write().unwrap();
        let mut below = w.into_inner().unwrap();
        below.skip(&Bigint::zero()).unwrap();

        let mut r = EscapeStream::new(below);
        assert!(!r.skip_to_next_mark(MarkKind::CatalogueStart).unwrap());
    }

    #[test]
    fn split_sequence_across_writes() {
        let mut w = EscapeStream::new(Box::new(MemoryStream::new()));
        w.write(&ESCAPE_SEQ[..3]).unwrap();
        w.write(&ESCAPE_SEQ[3..]).unwrap();
        w.write(b"tail").unwrap();
        w.sync_write().unwrap();
        let mut below = w.into_inner().unwrap();
        below.skip(&Bigint::zero()).unwrap();

        let mut r = EscapeStream::new(below);
        let mut buf = [0u8; 32];
        let mut done = 0;
        loop {
            let n = r.read(&mut buf[done..]).unwrap();
            if n == 0 {
                break;
            }
            done += n;
        }
        let mut expect = ESCAPE_SEQ.to_vec();
        expect.extend_from_slice(b"tail");
        assert_eq!(&buf[..done], &expect[..]);
    }
}
