//! Cipher layer: clear data is cut into fixed-size crypto blocks, each
//! ciphered independently so random access only costs one block.

use crate::bigint::Bigint;
use crate::error::Error;
use crate::error::Result;
use crate::stream::check_not_terminated;
use crate::stream::read_exact;
use crate::stream::Mode;
use crate::stream::SkipDirection;
use crate::stream::Stream;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::BlockDecrypt;
use aes::cipher::BlockEncrypt;
use aes::cipher::KeyInit;
use aes::Aes256;
use byteorder::BigEndian;
use byteorder::ByteOrder;
use rand_core::OsRng;
use rand_core::RngCore;
use sha2::Digest;
use sha2::Sha256;

/// Default clear bytes per crypto block.
pub const DEFAULT_CRYPTO_BLOCK: usize = 10_240;
/// Smallest accepted crypto block.
pub const MIN_CRYPTO_BLOCK: usize = 10;
/// Default random padding written around the ciphered area.
pub const DEFAULT_ELASTIC_SIZE: usize = 10_240;

const AES_BLOCK: usize = 16;

/// Cipher algorithms an archive may declare.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CipherAlgo {
    #[default]
    None,
    Scrambling,
    Blowfish,
    Aes256,
    Twofish256,
    Serpent256,
    Camellia256,
}

impl CipherAlgo {
    /// One-byte code stored in the archive header.
    pub fn code(self) -> u8 {
        match self {
            Self::None => b'n',
            Self::Scrambling => b's',
            Self::Blowfish => b'b',
            Self::Aes256 => b'a',
            Self::Twofish256 => b't',
            Self::Serpent256 => b'p',
            Self::Camellia256 => b'c',
        }
    }

    /// Decodes a header byte.
    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            b'n' => Self::None,
            b's' => Self::Scrambling,
            b'b' => Self::Blowfish,
            b'a' => Self::Aes256,
            b't' => Self::Twofish256,
            b'p' => Self::Serpent256,
            b'c' => Self::Camellia256,
            _ => return Err(Error::range("unknown cipher algorithm in header")),
        })
    }

    pub fn is_available(self) -> bool {
        matches!(self, Self::None | Self::Scrambling | Self::Aes256)
    }
}

/// Hash driving the passphrase key derivation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum KdfHash {
    Md5,
    Sha1,
    Sha256,
    Sha512,
    Whirlpool,
    #[default]
    Argon2,
}

impl KdfHash {
    pub fn code(self) -> u8 {
        match self {
            Self::Md5 => b'm',
            Self::Sha1 => b'1',
            Self::Sha256 => b'2',
            Self::Sha512 => b'5',
            Self::Whirlpool => b'w',
            Self::Argon2 => b'g',
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            b'm' => Self::Md5,
            b'1' => Self::Sha1,
            b'2' => Self::Sha256,
            b'5' => Self::Sha512,
            b'w' => Self::Whirlpool,
            b'g' => Self::Argon2,
            _ => return Err(Error::range("unknown key derivation hash in header")),
        })
    }
}

/// Everything needed to turn a passphrase into a cipher key.
#[derive(Clone, Debug)]
pub struct KdfParams {
    pub hash: KdfHash,
    pub iterations: u32,
    pub salt: Vec<u8>,
}

impl KdfParams {
    /// Fresh parameters with a random salt.
    pub fn generate() -> Self {
        let mut salt = vec![0u8; 16];
        OsRng.fill_bytes(&mut salt);
        Self {
            hash: KdfHash::Argon2,
            iterations: 3,
            salt,
        }
    }

    /// Derives a 256-bit key from the passphrase.
    pub fn derive(&self, passphrase: &str) -> Result<[u8; 32]> {
        match self.hash {
            KdfHash::Argon2 => {
                let params = argon2::Params::new(
                    argon2::Params::DEFAULT_M_COST,
                    self.iterations.max(1),
                    argon2::Params::DEFAULT_P_COST,
                    Some(32),
                )
                .map_err(|e| Error::range(format!("bad key derivation parameters: {e}")))?;
                let a2 = argon2::Argon2::new(
                    argon2::Algorithm::Argon2id,
                    argon2::Version::V0x13,
                    params,
                );
                let mut key = [0u8; 32];
                a2.hash_password_into(passphrase.as_bytes(), &self.salt, &mut key)
                    .map_err(|e| Error::range(format!("key derivation failed: {e}")))?;
                Ok(key)
            }
            other => Err(Error::feature(format!(
                "key derivation hash {other:?} is not available in this build"
            ))),
        }
    }
}

enum Crypter {
    Scramble { key: Vec<u8> },
    Aes { cipher: Box<Aes256>, iv_seed: [u8; 32] },
}

impl Crypter {
    fn new(algo: CipherAlgo, passphrase: &str, kdf: &KdfParams) -> Result<Self> {
        match algo {
            CipherAlgo::Scrambling => {
                if passphrase.is_empty() {
                    return Err(Error::range("an empty passphrase cannot scramble anything"));
                }
                Ok(Self::Scramble {
                    key: passphrase.as_bytes().to_vec(),
                })
            }
            CipherAlgo::Aes256 => {
                let key = kdf.derive(passphrase)?;
                let iv_seed = Sha256::digest(key).into();
                Ok(Self::Aes {
                    cipher: Box::new(Aes256::new(GenericArray::from_slice(&key))),
                    iv_seed,
                })
            }
            CipherAlgo::None => Err(Error::bug("cipher layer built without a cipher")),
            other => Err(Error::feature(format!(
                "cipher {other:?} is not available in this build"
            ))),
        }
    }

    /// Bytes a full clear block occupies once ciphered.
    fn ciphered_size(&self, clear: usize) -> usize {
        match self {
            Self::Scramble { .. } => clear,
            Self::Aes { .. } => (clear / AES_BLOCK + 1) * AES_BLOCK,
        }
    }

    fn iv(&self, seed: &[u8; 32], index: u64) -> [u8; AES_BLOCK] {
        let mut h = Sha256::new();
        h.update(seed);
        let mut idx = [0u8; 8];
        BigEndian::write_u64(&mut idx, index);
        h.update(idx);
        let digest = h.finalize();
        let mut iv = [0u8; AES_BLOCK];
        iv.copy_from_slice(&digest[..AES_BLOCK]);
        iv
    }

    fn encrypt(&self, index: u64, block_size: usize, clear: &[u8]) -> Vec<u8> {
        match self {
            Self::Scramble { key } => {
                let offset = index as usize * block_size;
                clear
                    .iter()
                    .enumerate()
                    .map(|(i, b)| b ^ key[(offset + i) % key.len()])
                    .collect()
            }
            Self::Aes { cipher, iv_seed } => {
                // padded chaining within the block, fresh chain per block
                let mut padded = clear.to_vec();
                let pad = AES_BLOCK - padded.len() % AES_BLOCK;
                padded.extend(std::iter::repeat(pad as u8).take(pad));
                let mut prev = self.iv(iv_seed, index);
                for chunk in padded.chunks_mut(AES_BLOCK) {
                    for (c, p) in chunk.iter_mut().zip(prev.iter()) {
                        *c ^= p;
                    }
                    let block = GenericArray::from_mut_slice(chunk);
                    cipher.encrypt_block(block);
                    prev.copy_from_slice(chunk);
                }
                padded
            }
        }
    }

    fn decrypt(&self, index: u64, block_size: usize, ciphered: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Scramble { key } => {
                let offset = index as usize * block_size;
                Ok(ciphered
                    .iter()
                    .enumerate()
                    .map(|(i, b)| b ^ key[(offset + i) % key.len()])
                    .collect())
            }
            Self::Aes { cipher, iv_seed } => {
                if ciphered.is_empty() || ciphered.len() % AES_BLOCK != 0 {
                    return Err(Error::data("ciphered block of invalid length"));
                }
                let mut clear = ciphered.to_vec();
                let mut prev = self.iv(iv_seed, index);
                for chunk in clear.chunks_mut(AES_BLOCK) {
                    let saved: [u8; AES_BLOCK] = match chunk.try_into() {
                        Ok(s) => s,
                        Err(_) => return Err(Error::bug("uneven cipher chunk")),
                    };
                    let block = GenericArray::from_mut_slice(chunk);
                    cipher.decrypt_block(block);
                    for (c, p) in chunk.iter_mut().zip(prev.iter()) {
                        *c ^= p;
                    }
                    prev = saved;
                }
                let pad = *clear.last().unwrap_or(&0) as usize;
                if pad == 0 || pad > AES_BLOCK || pad > clear.len() {
                    return Err(Error::data("bad padding in ciphered block"));
                }
                clear.truncate(clear.len() - pad);
                Ok(clear)
            }
        }
    }
}

/// The cipher layer proper.
pub struct CryptoStream {
    below: Box<dyn Stream>,
    crypter: Crypter,
    block_size: usize,
    /// Index of the block held in `buffer` (read) or being filled
    /// (write).
    block: u64,
    buffer: Vec<u8>,
    cursor: usize,
    /// Read side: the buffer really holds block `block`.
    loaded: bool,
    at_end: bool,
    terminated: bool,
}

impl std::fmt::Debug for CryptoStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoStream").finish_non_exhaustive()
    }
}

impl CryptoStream {
    pub fn new(
        below: Box<dyn Stream>,
        algo: CipherAlgo,
        passphrase: &str,
        kdf: &KdfParams,
        block_size: usize,
    ) -> Result<Self> {
        if block_size < MIN_CRYPTO_BLOCK {
            return Err(Error::range("crypto block size below the minimum"));
        }
        Ok(Self {
            below,
            crypter: Crypter::new(algo, passphrase, kdf)?,
            block_size,
            block: 0,
            buffer: Vec::new(),
            cursor: 0,
            loaded: false,
            at_end: false,
            terminated: false,
        })
    }

    /// Consumes the layer, returning the one below.
    pub fn into_inner(mut self) -> Result<Box<dyn Stream>> {
        self.flush_block()?;
        Ok(self.below)
    }

    /// Write side: ciphers and writes the pending block, full or not.
    fn flush_block(&mut self) -> Result<()> {
        if !self.mode().can_write() || self.buffer.is_empty() {
            return Ok(());
        }
        let clear = std::mem::take(&mut self.buffer);
        let ciphered = self.crypter.encrypt(self.block, self.block_size, &clear);
        self.below.write(&ciphered)?;
        self.block += 1;
        Ok(())
    }

    /// Read side: loads and deciphers the block holding clear offset
    /// `self.block * block_size`.
    fn load_block(&mut self) -> Result<bool> {
        if self.at_end {
            return Ok(false);
        }
        let ciphered_full = self.crypter.ciphered_size(self.block_size);
        let below_off = Bigint::from(self.block).mul(&Bigint::from(ciphered_full));
        if !self.below.skip(&below_off)? {
            self.at_end = true;
            return Ok(false);
        }
        let mut ciphered = vec![0u8; ciphered_full];
        let mut got = 0;
        while got < ciphered.len() {
            let n = self.below.read(&mut ciphered[got..])?;
            if n == 0 {
                break;
            }
            got += n;
        }
        if got == 0 {
            self.at_end = true;
            return Ok(false);
        }
        ciphered.truncate(got);
        self.buffer = self
            .crypter
            .decrypt(self.block, self.block_size, &ciphered)?;
        self.cursor = 0;
        self.loaded = true;
        if self.buffer.len() < self.block_size {
            // a short block is the last one
            self.at_end = true;
        }
        Ok(true)
    }
}

impl Stream for CryptoStream {
    fn mode(&self) -> Mode {
        self.below.mode()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        check_not_terminated(self)?;
        let mut done = 0;
        while done < buf.len() {
            if self.loaded && self.cursor < self.buffer.len() {
                let n = (buf.len() - done).min(self.buffer.len() - self.cursor);
                buf[done..done + n].copy_from_slice(&self.buffer[self.cursor..self.cursor + n]);
                self.cursor += n;
                done += n;
                continue;
            }
            if self.loaded {
                if self.at_end {
                    break;
                }
                self.block += 1;
                self.loaded = false;
            }
            if !self.load_block()? {
                break;
            }
        }
        Ok(done)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        check_not_terminated(self)?;
        let mut rest = buf;
        while !rest.is_empty() {
            let room = self.block_size - self.buffer.len();
            let n = rest.len().min(room);
            self.buffer.extend_from_slice(&rest[..n]);
            rest = &rest[n..];
            if self.buffer.len() == self.block_size {
                self.flush_block()?;
            }
        }
        Ok(())
    }

    fn skip(&mut self, pos: &Bigint) -> Result<bool> {
        check_not_terminated(self)?;
        if self.mode().can_write() {
            // ciphered data is written front to back only
            return Ok(*pos == self.position()?);
        }
        let block_size = Bigint::from(self.block_size);
        let (block, offset) = pos.div_rem(&block_size)?;
        let block = block
            .to_u64()
            .ok_or_else(|| Error::range("position out of bounds"))?;
        let offset = offset.to_usize().unwrap_or(0);
        self.block = block;
        self.loaded = false;
        self.at_end = false;
        if !self.load_block()? {
            return Ok(offset == 0);
        }
        if offset > self.buffer.len() {
            self.cursor = self.buffer.len();
            return Ok(false);
        }
        self.cursor = offset;
        Ok(true)
    }

    fn skip_relative(&mut self, delta: i64) -> Result<bool> {
        check_not_terminated(self)?;
        let pos = self.position()?;
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
        if self.mode().can_write() {
            return Ok(true);
        }
        // walk blocks forward until the short one
        loop {
            if self.at_end {
                self.cursor = self.buffer.len();
                return Ok(true);
            }
            if self.loaded {
                self.block += 1;
                self.loaded = false;
            }
            if !self.load_block()? {
                self.cursor = self.buffer.len();
                return Ok(true);
            }
        }
    }

    fn position(&self) -> Result<Bigint> {
        check_not_terminated(self)?;
        let base = Bigint::from(self.block).mul(&Bigint::from(self.block_size));
        if self.mode().can_write() {
            Ok(&base + &Bigint::from(self.buffer.len()))
        } else if self.loaded {
            Ok(&base + &Bigint::from(self.cursor))
        } else {
            Ok(base)
        }
    }

    fn skippable(&self, direction: SkipDirection, _amount: &Bigint) -> bool {
        if self.mode().can_write() {
            return false;
        }
        // one block of work at most
        let _ = direction;
        true
    }

    fn sync_write(&mut self) -> Result<()> {
        check_not_terminated(self)?;
        // a partial crypto block cannot be flushed and reopened, sync
        // only pushes what the layer below holds
        self.below.sync_write()
    }

    fn flush_read(&mut self) -> Result<()> {
        check_not_terminated(self)?;
        if !self.mode().can_write() {
            self.loaded = false;
            self.at_end = false;
            self.buffer.clear();
        }
        self.below.flush_read()
    }

    fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        let res = self.flush_block();
        self.terminated = true;
        self.below.terminate()?;
        res
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

/// Writes a buffer of `size` random bytes that can be recognized and
/// measured from either end. Sizes below the 10-byte envelope are
/// rounded up to it.
pub fn write_elastic(f: &mut dyn Stream, size: usize) -> Result<()> {
    if size == 0 {
        return Ok(());
    }
    let size = size.max(10);
    let mut len = [0u8; 4];
    BigEndian::write_u32(&mut len, size as u32);
    f.write(b">")?;
    f.write(&len)?;
    let mut filler = vec![0u8; size - 10];
    OsRng.fill_bytes(&mut filler);
    f.write(&filler)?;
    f.write(&len)?;
    f.write(b"<")
}

/// Measures an elastic buffer ending right before the current position
/// and returns its size, leaving the position where it was.
pub fn elastic_size_before(f: &mut dyn Stream) -> Result<usize> {
    let end = f.position()?;
    if end < Bigint::from(10u64) {
        return Err(Error::data("no room for an elastic buffer here"));
    }
    f.skip(&end.sub(&Bigint::from(5u64))?)?;
    let mut tail = [0u8; 5];
    read_exact(f, &mut tail)?;
    f.skip(&end)?;
    if tail[4] != b'<' {
        return Err(Error::data("elastic buffer closing marker not found"));
    }
    let size = BigEndian::read_u32(&tail[..4]) as usize;
    if size < 10 || Bigint::from(size) > end {
        return Err(Error::data("elastic buffer of inconsistent size"));
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::memory::MemoryStream;

    fn drain_all(s: &mut Box<dyn Stream>) -> Vec<u8> {
        s.skip(&Bigint::zero()).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = s.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    fn roundtrip(algo: CipherAlgo, pass: &str, data: &[u8]) -> Vec<u8> {
        let kdf = KdfParams::generate();
        let below = MemoryStream::new();
        let mut w = CryptoStream::new(Box::new(below), algo, pass, &kdf, 64).unwrap();
        w.write(data).unwrap();
        let mut below = w.into_inner().unwrap();
        let ciphered = drain_all(&mut below);
        assert_ne!(&ciphered[..data.len().min(ciphered.len())], data);

        let mut below = MemoryStream::with_contents(ciphered);
        below.skip(&Bigint::zero()).unwrap();
        let mut r = CryptoStream::new(Box::new(below), algo, pass, &kdf, 64).unwrap();
        let mut back = vec![0u8; data.len() + 64];
        let mut done = 0;
        loop {
            let n = r.read(&mut back[done..]).unwrap();
            if n == 0 {
                break;
            }
            done += n;
        }
        back.truncate(done);
        back
    }

    #[test]
    fn scramble_roundtrip() {
        let data: Vec<u8> = (0..500usize).map(|i| (i * 3 % 256) as u8).collect();
        assert_eq!(roundtrip(CipherAlgo::Scrambling, "secret", &data), data);
    }

    #[test]
    fn aes_roundtrip() {
        let data: Vec<u8> = (0..777usize).map(|i| (i * 7 % 256) as u8).collect();
        assert_eq!(roundtrip(CipherAlgo::Aes256, "another secret", &data), data);
    }

    #[test]
    fn aes_random_access() {
        let kdf = KdfParams::generate();
        let data: Vec<u8> = (0..1000usize).map(|i| (i % 256) as u8).collect();
        let mut w = CryptoStream::new(
            Box::new(MemoryStream::new()),
            CipherAlgo::Aes256,
            "pass",
            &kdf,
            128,
        )
        .unwrap();
        w.write(&data).unwrap();
        let ciphered = drain_all(&mut w.into_inner().unwrap());

        let mut below = MemoryStream::with_contents(ciphered);
        below.skip(&Bigint::zero()).unwrap();
        let mut r =
            CryptoStream::new(Box::new(below), CipherAlgo::Aes256, "pass", &kdf, 128).unwrap();
        assert!(r.skip(&Bigint::from(500u64)).unwrap());
        let mut buf = [0u8; 10];
        assert_eq!(r.read(&mut buf).unwrap(), 10);
        assert_eq!(&buf[..], &data[500..510]);
    }

    #[test]
    fn wrong_pass_fails_or_garbles() {
        let kdf = KdfParams::generate();
        let mut w = CryptoStream::new(
            Box::new(MemoryStream::new()),
            CipherAlgo::Aes256,
            "right",
            &kdf,
            64,
        )
        .unwrap();
        w.write(b"some clear text that spans a block or not").unwrap();
        let ciphered = drain_all(&mut w.into_inner().unwrap());

        let mut below = MemoryStream::with_contents(ciphered);
        below.skip(&Bigint::zero()).unwrap();
        let mut r =
            CryptoStream::new(Box::new(below), CipherAlgo::Aes256, "wrong", &kdf, 64).unwrap();
        let mut buf = [0u8; 64];
        match r.read(&mut buf) {
            Err(_) => {}
            Ok(n) => assert_ne!(&buf[..n], b"some clear text that spans a block or not"),
        }
    }

    #[test]
    fn unavailable_cipher_refused() {
        let kdf = KdfParams::generate();
        match CryptoStream::new(
            Box::new(MemoryStream::new()),
            CipherAlgo::Blowfish,
            "x",
            &kdf,
            64,
        ) {
            Err(Error::Feature(_)) => {}
            other => panic!("expected a feature error, got {other:?}"),
        }
    }

    #[test]
    fn elastic_measured_backward() {
        let mut m = MemoryStream::new();
        m.write(b"payload").unwrap();
        write_elastic(&mut m, 100).unwrap();
        let end = m.position().unwrap();
        assert_eq!(end.to_u64(), Some(107));
        assert_eq!(elastic_size_before(&mut m).unwrap(), 100);
        assert_eq!(m.position().unwrap(), end);
    }
}
