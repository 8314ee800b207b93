//! Unidirectional pipe endpoints, the transport of the remote-slice
//! protocol.

use crate::bigint::Bigint;
use crate::error::Error;
use crate::error::Result;
use crate::stream::check_not_terminated;
use crate::stream::Mode;
use crate::stream::SkipDirection;
use crate::stream::Stream;
use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::os::fd::FromRawFd;

/// One end of a pipe. Not seekable; the position only counts the bytes
/// that went through.
pub struct PipeStream {
    file: File,
    mode: Mode,
    count: u64,
    terminated: bool,
}

impl PipeStream {
    /// Creates a connected (read, write) pair.
    pub fn pair() -> Result<(Self, Self)> {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let read = unsafe { File::from_raw_fd(fds[0]) };
        let write = unsafe { File::from_raw_fd(fds[1]) };
        Ok((
            Self {
                file: read,
                mode: Mode::Read,
                count: 0,
                terminated: false,
            },
            Self {
                file: write,
                mode: Mode::Write,
                count: 0,
                terminated: false,
            },
        ))
    }

    /// Wraps an already open descriptor.
    ///
    /// # Safety
    /// The descriptor must be open, owned by the caller and match `mode`.
    pub unsafe fn from_raw_fd(fd: i32, mode: Mode) -> Self {
        Self {
            file: File::from_raw_fd(fd),
            mode,
            count: 0,
            terminated: false,
        }
    }
}

impl Stream for PipeStream {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        check_not_terminated(self)?;
        if !self.mode.can_read() {
            return Err(Error::misuse("read on the write end of a pipe"));
        }
        let n = self.file.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        check_not_terminated(self)?;
        if !self.mode.can_write() {
            return Err(Error::misuse("write on the read end of a pipe"));
        }
        self.file.write_all(buf)?;
        self.count += buf.len() as u64;
        Ok(())
    }

    fn skip(&mut self, pos: &Bigint) -> Result<bool> {
        check_not_terminated(self)?;
        // only a forward no-op skip is possible on a pipe
        Ok(*pos == Bigint::from(self.count))
    }

    fn skip_relative(&mut self, delta: i64) -> Result<bool> {
        check_not_terminated(self)?;
        if delta == 0 {
            return Ok(true);
        }
        if delta > 0 && self.mode.can_read() {
            let mut remain = delta as u64;
            let mut buf = [0u8; 4096];
            while remain > 0 {
                let want = (remain as usize).min(buf.len());
                let n = self.read(&mut buf[..want])?;
                if n == 0 {
                    return Ok(false);
                }
                remain -= n as u64;
            }
            return Ok(true);
        }
        Ok(false)
    }

    fn skip_to_eof(&mut self) -> Result<bool> {
        check_not_terminated(self)?;
        Ok(false)
    }

    fn position(&self) -> Result<Bigint> {
        check_not_terminated(self)?;
        Ok(Bigint::from(self.count))
    }

    fn skippable(&self, direction: SkipDirection, amount: &Bigint) -> bool {
        direction == SkipDirection::Forward && (amount.is_zero() || self.mode.can_read())
    }

    fn sync_write(&mut self) -> Result<()> {
        check_not_terminated(self)?;
        if self.mode.can_write() {
            self.file.flush()?;
        }
        Ok(())
    }

    fn flush_read(&mut self) -> Result<()> {
        check_not_terminated(self)
    }

    fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        if self.mode.can_write() {
            let _ = self.file.flush();
        }
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
    fn pair_transfers_bytes() {
        let (mut r, mut w) = PipeStream::pair().unwrap();
        w.write(b"abc").unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(r.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"abc");
        assert_eq!(r.position().unwrap().to_u64(), Some(3));
        assert!(!r.skippable(SkipDirection::Backward, &Bigint::from(1u64)));
        w.write(b"xy").unwrap();
        assert!(r.skip_relative(2).unwrap());
    }
}
