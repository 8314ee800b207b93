//! Bottom layer: positioned I/O on a plain file.

use crate::bigint::Bigint;
use crate::error::Error;
use crate::error::Result;
use crate::stream::check_not_terminated;
use crate::stream::Mode;
use crate::stream::SkipDirection;
use crate::stream::Stream;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::path::PathBuf;

/// File-backed stream owning its descriptor.
pub struct FileStream {
    file: File,
    path: PathBuf,
    mode: Mode,
    pos: u64,
    wrote: bool,
    terminated: bool,
}

impl FileStream {
    /// Opens an existing file for reading.
    pub fn open_read(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            mode: Mode::Read,
            pos: 0,
            wrote: false,
            terminated: false,
        })
    }

    /// Creates a file for writing, truncating any previous contents.
    /// With `fail_if_exists`, refuses to touch an existing file.
    pub fn create_write(path: &Path, fail_if_exists: bool) -> Result<Self> {
        let mut opts = OpenOptions::new();
        opts.write(true).read(true);
        if fail_if_exists {
            opts.create_new(true);
        } else {
            opts.create(true).truncate(true);
        }
        let file = opts.open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            mode: Mode::ReadWrite,
            pos: 0,
            wrote: false,
            terminated: false,
        })
    }

    /// Path the stream was opened on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the underlying file.
    pub fn fs_size(&self) -> Result<Bigint> {
        Ok(Bigint::from(self.file.metadata()?.len()))
    }

    /// Forces the file permission bits.
    pub fn set_permission(&self, mode: u32) -> Result<()> {
        let ret = unsafe { libc::fchmod(self.file.as_raw_fd(), mode as libc::mode_t) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Forces the file owner and group. Values below zero are left as-is.
    pub fn set_ownership(&self, uid: i64, gid: i64) -> Result<()> {
        let uid = if uid < 0 { u32::MAX } else { uid as u32 };
        let gid = if gid < 0 { u32::MAX } else { gid as u32 };
        let ret = unsafe { libc::fchown(self.file.as_raw_fd(), uid, gid) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }
}

impl Stream for FileStream {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        check_not_terminated(self)?;
        if !self.mode.can_read() {
            return Err(Error::misuse("read on a write-only stream"));
        }
        let n = self.file.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        check_not_terminated(self)?;
        if !self.mode.can_write() {
            return Err(Error::misuse("write on a read-only stream"));
        }
        self.file.write_all(buf)?;
        self.pos += buf.len() as u64;
        self.wrote = true;
        Ok(())
    }

    fn skip(&mut self, pos: &Bigint) -> Result<bool> {
        check_not_terminated(self)?;
        let target = pos
            .to_u64()
            .ok_or_else(|| Error::range("file position out of bounds"))?;
        if self.mode == Mode::Read {
            let size = self.file.metadata()?.len();
            if target > size {
                self.pos = self.file.seek(SeekFrom::End(0))?;
                return Ok(false);
            }
        }
        self.pos = self.file.seek(SeekFrom::Start(target))?;
        Ok(true)
    }

    fn skip_relative(&mut self, delta: i64) -> Result<bool> {
        check_not_terminated(self)?;
        let target = self.pos as i64 + delta;
        if target < 0 {
            self.pos = self.file.seek(SeekFrom::Start(0))?;
            return Ok(false);
        }
        self.skip(&Bigint::from(target as u64))
    }

    fn skip_to_eof(&mut self) -> Result<bool> {
        check_not_terminated(self)?;
        self.pos = self.file.seek(SeekFrom::End(0))?;
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
            self.file.flush()?;
            let _ = self.file.sync_data();
        }
        if self.wrote {
            // tell the OS the written pages are not needed anymore
            unsafe {
                libc::posix_fadvise(self.file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED);
            }
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
    use std::fs;

    fn tmp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("darch-filestream-{}-{name}", std::process::id()));
        p
    }

    #[test]
    fn write_then_read() {
        let path = tmp_path("a");
        let _ = fs::remove_file(&path);
        let mut w = FileStream::create_write(&path, true).unwrap();
        w.write(b"0123456789").unwrap();
        assert_eq!(w.fs_size().unwrap().to_u64(), Some(10));
        w.terminate().unwrap();

        let mut r = FileStream::open_read(&path).unwrap();
        assert!(r.skip(&Bigint::from(4u64)).unwrap());
        let mut buf = [0u8; 4];
        assert_eq!(r.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"4567");
        assert!(!r.skip(&Bigint::from(100u64)).unwrap());
        assert!(r.write(b"x").is_err());
        r.terminate().unwrap();
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn create_new_refuses_existing() {
        let path = tmp_path("b");
        let _ = fs::remove_file(&path);
        let mut w = FileStream::create_write(&path, true).unwrap();
        w.terminate().unwrap();
        assert!(FileStream::create_write(&path, true).is_err());
        fs::remove_file(&path).unwrap();
    }
}
