//! Archive version record, written at the start of the archive and
//! duplicated in its tail, and the terminator locating the tail from the
//! end.

use crate::bigint::Bigint;
use crate::compress::CompressionAlgo;
use crate::crc::Crc;
use crate::crypto::CipherAlgo;
use crate::crypto::KdfHash;
use crate::crypto::KdfParams;
use crate::error::Error;
use crate::error::Result;
use crate::slice::layout::SliceLayout;
use crate::stream::memory::MemoryStream;
use crate::stream::read_exact;
use crate::stream::read_lstring;
use crate::stream::read_u8;
use crate::stream::write_lstring;
use crate::stream::Stream;
use byteorder::BigEndian;
use byteorder::ByteOrder;

/// Format edition produced by this implementation.
pub const ARCHIVE_EDITION: u16 = 11;

const FLAG_ASYM: u8 = 0x01;
const FLAG_TAPE_MARKS: u8 = 0x02;
const FLAG_KDF: u8 = 0x04;
const FLAG_LAYOUT: u8 = 0x08;
const FLAG_SIGNED: u8 = 0x10;

/// Self-describing archive parameters.
#[derive(Clone, Debug)]
pub struct VersionRecord {
    pub edition: u16,
    pub compression: CompressionAlgo,
    /// Clear bytes per compressed block; zero means the default.
    pub compression_block: Bigint,
    pub cipher: CipherAlgo,
    /// Clear bytes per crypto block.
    pub crypto_block: Bigint,
    /// The symmetric key is also escrowed asymmetrically.
    pub asym: bool,
    /// Escape marks are present in the stream.
    pub tape_marks: bool,
    pub kdf: Option<KdfParams>,
    /// Fingerprints of the signatories, when the archive is signed.
    pub signatories: Vec<Vec<u8>>,
    /// Slicing of the archive of reference, kept in isolated catalogues.
    pub ref_layout: Option<SliceLayout>,
}

impl VersionRecord {
    pub fn new(compression: CompressionAlgo, cipher: CipherAlgo) -> Self {
        Self {
            edition: ARCHIVE_EDITION,
            compression,
            compression_block: Bigint::zero(),
            cipher,
            crypto_block: Bigint::zero(),
            asym: false,
            tape_marks: false,
            kdf: None,
            signatories: Vec::new(),
            ref_layout: None,
        }
    }

    fn dump_fields(&self, f: &mut dyn Stream) -> Result<()> {
        let mut edition = [0u8; 2];
        BigEndian::write_u16(&mut edition, self.edition);
        f.write(&edition)?;
        f.write(&[self.compression.code(), self.cipher.code()])?;
        let mut flags = 0u8;
        if self.asym {
            flags |= FLAG_ASYM;
        }
        if self.tape_marks {
            flags |= FLAG_TAPE_MARKS;
        }
        if self.kdf.is_some() {
            flags |= FLAG_KDF;
        }
        if self.ref_layout.is_some() {
            flags |= FLAG_LAYOUT;
        }
        if !self.signatories.is_empty() {
            flags |= FLAG_SIGNED;
        }
        f.write(&[flags])?;
        self.compression_block.dump(f)?;
        self.crypto_block.dump(f)?;
        if let Some(kdf) = &self.kdf {
            f.write(&[kdf.hash.code()])?;
            Bigint::from(kdf.iterations as u64).dump(f)?;
            write_lstring(f, &kdf.salt)?;
        }
        if !self.signatories.is_empty() {
            Bigint::from(self.signatories.len()).dump(f)?;
            for fingerprint in &self.signatories {
                write_lstring(f, fingerprint)?;
            }
        }
        if let Some(layout) = &self.ref_layout {
            layout.first_size.dump(f)?;
            layout.other_size.dump(f)?;
            layout.first_header_size.dump(f)?;
            layout.other_header_size.dump(f)?;
        }
        Ok(())
    }

    /// Writes the record followed by a checksum of its bytes.
    pub fn dump(&self, f: &mut dyn Stream) -> Result<()> {
        let mut body = MemoryStream::new();
        self.dump_fields(&mut body)?;
        let mut crc = Crc::from_size(&Bigint::from(body.size()));
        crc.update(body.contents());
        f.write(body.contents())?;
        crc.dump(f)
    }

    /// Reads a record back, verifying its checksum. Works on media that
    /// cannot seek: the bytes are folded into the checksum as they are
    /// parsed.
    pub fn read(raw: &mut dyn Stream) -> Result<Self> {
        let mut tee = Recorder {
            inner: raw,
            seen: Vec::new(),
        };
        let f: &mut dyn Stream = &mut tee;
        let mut edition = [0u8; 2];
        read_exact(f, &mut edition)?;
        let edition = BigEndian::read_u16(&edition);
        if edition == 0 || edition > ARCHIVE_EDITION {
            return Err(Error::range(format!(
                "archive format {edition} is not handled by this implementation"
            )));
        }
        let compression = CompressionAlgo::from_code(read_u8(f)?)?;
        let cipher = CipherAlgo::from_code(read_u8(f)?)?;
        let flags = read_u8(f)?;
        let compression_block = Bigint::read(f)?;
        let crypto_block = Bigint::read(f)?;
        let kdf = if flags & FLAG_KDF != 0 {
            let hash = KdfHash::from_code(read_u8(f)?)?;
            let iterations = Bigint::read(f)?
                .to_u64()
                .and_then(|i| u32::try_from(i).ok())
                .ok_or_else(|| Error::range("iteration count out of bounds"))?;
            let salt = read_lstring(f)?;
            Some(KdfParams {
                hash,
                iterations,
                salt,
            })
        } else {
            None
        };
        let mut signatories = Vec::new();
        if flags & FLAG_SIGNED != 0 {
            let count = Bigint::read(f)?
                .to_usize()
                .ok_or_else(|| Error::range("signatory count out of bounds"))?;
            for _ in 0..count {
                signatories.push(read_lstring(f)?);
            }
        }
        let ref_layout = if flags & FLAG_LAYOUT != 0 {
            let first_size = Bigint::read(f)?;
            let other_size = Bigint::read(f)?;
            let first_header_size = Bigint::read(f)?;
            let other_header_size = Bigint::read(f)?;
            Some(SliceLayout {
                first_size,
                other_size,
                first_header_size,
                other_header_size,
            })
        } else {
            None
        };
        // verify the checksum over the bytes just parsed
        let seen = std::mem::take(&mut tee.seen);
        let stored = Crc::read(tee.inner)?;
        let mut crc = Crc::with_width(stored.width());
        crc.update(&seen);
        if !crc.same_as(&stored) {
            return Err(Error::data("corrupted archive header"));
        }
        Ok(Self {
            edition,
            compression,
            compression_block,
            cipher,
            crypto_block,
            asym: flags & FLAG_ASYM != 0,
            tape_marks: flags & FLAG_TAPE_MARKS != 0,
            kdf,
            signatories,
            ref_layout,
        })
    }
}

/// Pass-through reader keeping a copy of everything read, so a record
/// can be checksummed without seeking back.
struct Recorder<'a> {
    inner: &'a mut dyn Stream,
    seen: Vec<u8>,
}

impl Stream for Recorder<'_> {
    fn mode(&self) -> crate::stream::Mode {
        crate::stream::Mode::Read
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.inner.read(buf)?;
        self.seen.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn write(&mut self, _buf: &[u8]) -> Result<()> {
        Err(Error::misuse("the recording reader is read-only"))
    }

    fn skip(&mut self, _pos: &Bigint) -> Result<bool> {
        Ok(false)
    }

    fn skip_relative(&mut self, _delta: i64) -> Result<bool> {
        Ok(false)
    }

    fn skip_to_eof(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn position(&self) -> Result<Bigint> {
        self.inner.position()
    }

    fn skippable(&self, _d: crate::stream::SkipDirection, _a: &Bigint) -> bool {
        false
    }

    fn sync_write(&mut self) -> Result<()> {
        Ok(())
    }

    fn flush_read(&mut self) -> Result<()> {
        Ok(())
    }

    fn terminate(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_terminated(&self) -> bool {
        false
    }
}

/// Marker closing a section, readable backward from its end.
pub struct Terminator;

const TERMINATOR_MAGIC: u16 = 0x7a54;

impl Terminator {
    /// Writes a terminator pointing at `position`.
    pub fn write(f: &mut dyn Stream, position: &Bigint) -> Result<()> {
        let mut body = MemoryStream::new();
        position.dump(&mut body)?;
        let total = body.size() + 4;
        f.write(body.contents())?;
        let mut tail = [0u8; 4];
        BigEndian::write_u16(&mut tail[..2], total as u16);
        BigEndian::write_u16(&mut tail[2..], TERMINATOR_MAGIC);
        f.write(&tail)
    }

    /// Reads the terminator that ends right before the current position.
    /// Returns the recorded position and the offset at which the
    /// terminator itself starts.
    pub fn read_before(f: &mut dyn Stream) -> Result<(Bigint, Bigint)> {
        let end = f.position()?;
        let four = Bigint::from(4u64);
        let tail_start = end
            .checked_sub(&four)
            .ok_or_else(|| Error::data("no room for a terminator here"))?;
        f.skip(&tail_start)?;
        let mut tail = [0u8; 4];
        read_exact(f, &mut tail)?;
        if BigEndian::read_u16(&tail[2..]) != TERMINATOR_MAGIC {
            return Err(Error::data("terminator magic number not found"));
        }
        let total = BigEndian::read_u16(&tail[..2]) as u64;
        let start = end
            .checked_sub(&Bigint::from(total))
            .ok_or_else(|| Error::data("terminator of inconsistent length"))?;
        f.skip(&start)?;
        let position = Bigint::read(f)?;
        f.skip(&end)?;
        Ok((position, start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_roundtrip() {
        let mut rec = VersionRecord::new(CompressionAlgo::Gzip, CipherAlgo::Aes256);
        rec.tape_marks = true;
        rec.kdf = Some(KdfParams::generate());
        rec.signatories = vec![vec![1, 2, 3], vec![4, 5]];
        rec.ref_layout = Some(SliceLayout {
            first_size: Bigint::from(100u64),
            other_size: Bigint::from(50u64),
            first_header_size: Bigint::from(30u64),
            other_header_size: Bigint::from(30u64),
        });
        let mut m = MemoryStream::new();
        rec.dump(&mut m).unwrap();
        m.skip(&Bigint::zero()).unwrap();
        let back = VersionRecord::read(&mut m).unwrap();
        assert_eq!(back.edition, ARCHIVE_EDITION);
        assert_eq!(back.compression, CompressionAlgo::Gzip);
        assert_eq!(back.cipher, CipherAlgo::Aes256);
        assert!(back.tape_marks);
        assert!(!back.asym);
        assert_eq!(back.signatories.len(), 2);
        assert_eq!(back.ref_layout.unwrap().other_size, Bigint::from(50u64));
        assert_eq!(
            back.kdf.unwrap().salt,
            rec.kdf.unwrap().salt
        );
    }

    #[test]
    fn corrupted_record_detected() {
        let rec = VersionRecord::new(CompressionAlgo::None, CipherAlgo::None);
        let mut m = MemoryStream::new();
        rec.dump(&mut m).unwrap();
        let mut bytes = m.into_contents();
        bytes[3] ^= 0xff;
        let mut m = MemoryStream::with_contents(bytes);
        assert!(VersionRecord::read(&mut m).is_err());
    }

    #[test]
    fn terminator_backward_read() {
        let mut m = MemoryStream::new();
        m.write(b"some section data").unwrap();
        let section = Bigint::from(5u64);
        Terminator::write(&mut m, &section).unwrap();
        let (pos, start) = Terminator::read_before(&mut m).unwrap();
        assert_eq!(pos, section);
        assert_eq!(start.to_u64(), Some(17));
    }
}
