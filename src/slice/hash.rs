//! Hashing tee: everything written to a slice is also fed to a message
//! digest, dumped next to the slice in a companion file.

use crate::bigint::Bigint;
use crate::error::Result;
use crate::stream::check_not_terminated;
use crate::stream::Mode;
use crate::stream::SkipDirection;
use crate::stream::Stream;
use sha2::Digest;
use sha2::Sha256;
use sha2::Sha512;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

/// Digest computed over each slice file.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum HashAlgo {
    #[default]
    None,
    Sha256,
    Sha512,
}

impl HashAlgo {
    /// Extension of the companion file.
    pub fn extension(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Sha256 => Some("sha256"),
            Self::Sha512 => Some("sha512"),
        }
    }
}

enum Hasher {
    Sha256(Box<Sha256>),
    Sha512(Box<Sha512>),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    fn hex_digest(self) -> String {
        let bytes = match self {
            Self::Sha256(h) => h.finalize().to_vec(),
            Self::Sha512(h) => h.finalize().to_vec(),
        };
        let mut out = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }
}

/// Write-through layer computing a digest of all bytes written below.
///
/// The layer refuses to seek: a digest only makes sense over a stream
/// written front to back.
pub struct HashStream {
    below: Box<dyn Stream + Send>,
    hasher: Option<Hasher>,
    /// Path of the hashed file, as named in the companion file.
    target: PathBuf,
    terminated: bool,
}

impl HashStream {
    pub fn new(below: Box<dyn Stream + Send>, algo: HashAlgo, target: &Path) -> Self {
        let hasher = match algo {
            HashAlgo::None => None,
            HashAlgo::Sha256 => Some(Hasher::Sha256(Box::default())),
            HashAlgo::Sha512 => Some(Hasher::Sha512(Box::default())),
        };
        Self {
            below,
            hasher,
            target: target.to_path_buf(),
            terminated: false,
        }
    }

    fn companion_path(&self, ext: &str) -> PathBuf {
        let mut name = self.target.as_os_str().to_os_string();
        name.push(".");
        name.push(ext);
        PathBuf::from(name)
    }
}

impl Stream for HashStream {
    fn mode(&self) -> Mode {
        Mode::Write
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        check_not_terminated(self)?;
        self.below.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        check_not_terminated(self)?;
        self.below.write(buf)?;
        if let Some(h) = &mut self.hasher {
            h.update(buf);
        }
        Ok(())
    }

    fn skip(&mut self, pos: &Bigint) -> Result<bool> {
        check_not_terminated(self)?;
        // only the no-op skip is compatible with hashing
        Ok(*pos == self.below.position()?)
    }

    fn skip_relative(&mut self, delta: i64) -> Result<bool> {
        check_not_terminated(self)?;
        Ok(delta == 0)
    }

    fn skip_to_eof(&mut self) -> Result<bool> {
        check_not_terminated(self)?;
        Ok(false)
    }

    fn position(&self) -> Result<Bigint> {
        self.below.position()
    }

    fn skippable(&self, _direction: SkipDirection, amount: &Bigint) -> bool {
        amount.is_zero()
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
        if let Some(h) = self.hasher.take() {
            let ext = match h {
                Hasher::Sha256(_) => "sha256",
                Hasher::Sha512(_) => "sha512",
            };
            let base = self
                .target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let line = format!("{}  {}\n", h.hex_digest(), base);
            fs::write(self.companion_path(ext), line)?;
        }
        self.below.terminate()
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::file::FileStream;

    #[test]
    fn companion_digest_written() {
        let mut path = std::env::temp_dir();
        path.push(format!("darch-hash-{}.bin", std::process::id()));
        let _ = fs::remove_file(&path);
        let below = FileStream::create_write(&path, true).unwrap();
        let mut h = HashStream::new(Box::new(below), HashAlgo::Sha256, &path);
        h.write(b"abc").unwrap();
        h.terminate().unwrap();

        let mut companion = path.clone();
        companion.set_extension("bin.sha256");
        let line = fs::read_to_string(&companion).unwrap();
        // well-known digest of "abc"
        assert!(line
            .starts_with("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"));
        assert!(line.trim_end().ends_with(".bin"));
        fs::remove_file(&path).unwrap();
        fs::remove_file(&companion).unwrap();
    }
}
