//! Binary delta signatures: per-block checksums of a file, patches
//! between two versions, and their storage inside an archive.

use crate::bigint::Bigint;
use crate::crc::Crc;
use crate::error::Error;
use crate::error::Result;
use crate::error::MSG_DELTA_SIG_CRC;
use crate::stream::memory::MemoryStream;
use crate::stream::read_exact;
use crate::stream::read_u8;
use crate::stream::Stream;
use byteorder::BigEndian;
use byteorder::ByteOrder;
use sha2::Digest;
use sha2::Sha256;
use std::collections::HashMap;
use std::rc::Rc;

/// Default signature block length.
pub const DEFAULT_SIG_BLOCK: u32 = 2048;

const OP_END: u8 = 0x00;
const OP_COPY: u8 = 0x01;
const OP_LITERAL: u8 = 0x02;

/// Weak rolling checksum of one block.
fn weak_sum(data: &[u8]) -> u32 {
    let mut a: u32 = 0;
    let mut b: u32 = 0;
    for (i, byte) in data.iter().enumerate() {
        a = a.wrapping_add(*byte as u32);
        b = b.wrapping_add((data.len() - i) as u32 * *byte as u32);
    }
    (a & 0xffff) | (b << 16)
}

/// Strong checksum of one block, truncated.
fn strong_sum(data: &[u8]) -> [u8; 8] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

/// Per-block signature of a stream of bytes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Signature {
    pub block_len: u32,
    /// (weak, strong) for every full block, in order.
    blocks: Vec<(u32, [u8; 8])>,
}

impl Signature {
    /// Computes the signature of everything `f` has to read. Only full
    /// blocks are indexed; a trailing short block never matches.
    pub fn compute(f: &mut dyn Stream, block_len: u32) -> Result<Self> {
        let block_len = block_len.max(64);
        let mut blocks = Vec::new();
        let mut buf = vec![0u8; block_len as usize];
        loop {
            let mut got = 0;
            while got < buf.len() {
                let n = f.read(&mut buf[got..])?;
                if n == 0 {
                    break;
                }
                got += n;
            }
            if got < buf.len() {
                break;
            }
            blocks.push((weak_sum(&buf), strong_sum(&buf)));
        }
        Ok(Self { block_len, blocks })
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Serializes the signature to its archive payload form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut m = MemoryStream::new();
        let mut head = [0u8; 4];
        BigEndian::write_u32(&mut head, self.block_len);
        let _ = m.write(&head);
        let _ = Bigint::from(self.blocks.len()).dump(&mut m);
        for (weak, strong) in &self.blocks {
            let mut w = [0u8; 4];
            BigEndian::write_u32(&mut w, *weak);
            let _ = m.write(&w);
            let _ = m.write(strong);
        }
        m.into_contents()
    }

    /// Parses a signature payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut m = MemoryStream::with_contents(bytes.to_vec());
        let mut head = [0u8; 4];
        read_exact(&mut m, &mut head)?;
        let block_len = BigEndian::read_u32(&head);
        let count = Bigint::read(&mut m)?
            .to_usize()
            .ok_or_else(|| Error::range("signature block count out of bounds"))?;
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            let mut w = [0u8; 4];
            read_exact(&mut m, &mut w)?;
            let mut s = [0u8; 8];
            read_exact(&mut m, &mut s)?;
            blocks.push((BigEndian::read_u32(&w), s));
        }
        Ok(Self { block_len, blocks })
    }

    fn index(&self) -> HashMap<u32, Vec<usize>> {
        let mut map: HashMap<u32, Vec<usize>> = HashMap::new();
        for (i, (weak, _)) in self.blocks.iter().enumerate() {
            map.entry(*weak).or_default().push(i);
        }
        map
    }
}

/// Produces a patch turning the file summarized by `base` into the data
/// read from `new_data`. The patch is written to `out`; returns the
/// checksum of the new data and the number of patch bytes written.
pub fn make_patch(
    base: &Signature,
    new_data: &mut dyn Stream,
    new_size: &Bigint,
    out: &mut dyn Stream,
) -> Result<(Crc, Bigint)> {
    let start = out.position()?;
    let index = base.index();
    let block_len = base.block_len as usize;
    let mut result_crc = Crc::from_size(new_size);
    let mut literal: Vec<u8> = Vec::new();
    let mut pending_copy: Option<(usize, usize)> = None;
    let mut buf = vec![0u8; block_len];

    let flush_literal = |literal: &mut Vec<u8>, out: &mut dyn Stream| -> Result<()> {
        if literal.is_empty() {
            return Ok(());
        }
        out.write(&[OP_LITERAL])?;
        Bigint::from(literal.len()).dump(out)?;
        out.write(literal)?;
        literal.clear();
        Ok(())
    };
    let flush_copy = |copy: &mut Option<(usize, usize)>, out: &mut dyn Stream| -> Result<()> {
        if let Some((first, count)) = copy.take() {
            out.write(&[OP_COPY])?;
            Bigint::from(first).dump(out)?;
            Bigint::from(count).dump(out)?;
        }
        Ok(())
    };

    loop {
        let mut got = 0;
        while got < buf.len() {
            let n = new_data.read(&mut buf[got..])?;
            if n == 0 {
                break;
            }
            got += n;
        }
        if got == 0 {
            break;
        }
        result_crc.update(&buf[..got]);
        let matched = if got == block_len {
            let weak = weak_sum(&buf);
            index.get(&weak).and_then(|candidates| {
                let strong = strong_sum(&buf);
                candidates
                    .iter()
                    .find(|i| base.blocks[**i].1 == strong)
                    .copied()
            })
        } else {
            None
        };
        match matched {
            Some(block) => {
                flush_literal(&mut literal, out)?;
                pending_copy = match pending_copy {
                    Some((first, count)) if first + count == block => Some((first, count + 1)),
                    Some(other) => {
                        flush_copy(&mut Some(other), out)?;
                        Some((block, 1))
                    }
                    None => Some((block, 1)),
                };
            }
            None => {
                flush_copy(&mut pending_copy, out)?;
                literal.extend_from_slice(&buf[..got]);
                // cap literal runs so records stay bounded
                if literal.len() >= 1 << 20 {
                    flush_literal(&mut literal, out)?;
                }
            }
        }
        if got < block_len {
            break;
        }
    }
    flush_copy(&mut pending_copy, out)?;
    flush_literal(&mut literal, out)?;
    out.write(&[OP_END])?;
    let end = out.position()?;
    Ok((result_crc, end.sub(&start)?))
}

/// Applies a patch produced by `make_patch`, reading the old data from
/// `base` and writing the new file to `out`. Returns the checksum of
/// the written data.
pub fn apply_patch(
    base: &mut dyn Stream,
    block_len: u32,
    patch: &mut dyn Stream,
    out: &mut dyn Stream,
) -> Result<Crc> {
    let mut total = Bigint::zero();
    let mut chunks: Vec<Vec<u8>> = Vec::new();
    loop {
        match read_u8(patch)? {
            OP_END => break,
            OP_COPY => {
                let first = Bigint::read(patch)?
                    .to_u64()
                    .ok_or_else(|| Error::range("copy offset out of bounds"))?;
                let count = Bigint::read(patch)?
                    .to_u64()
                    .ok_or_else(|| Error::range("copy count out of bounds"))?;
                let offset = Bigint::from(first).mul(&Bigint::from(block_len as u64));
                if !base.skip(&offset)? {
                    return Err(Error::data("patch refers past the end of the base file"));
                }
                let want = count * block_len as u64;
                let mut remain = want;
                let mut buf = vec![0u8; 8192];
                while remain > 0 {
                    let ask = (remain as usize).min(buf.len());
                    let n = base.read(&mut buf[..ask])?;
                    if n == 0 {
                        return Err(Error::data("base file shorter than the patch expects"));
                    }
                    chunks.push(buf[..n].to_vec());
                    total += n as u64;
                    remain -= n as u64;
                }
            }
            OP_LITERAL => {
                let len = Bigint::read(patch)?
                    .to_usize()
                    .ok_or_else(|| Error::range("literal length out of bounds"))?;
                let mut bytes = vec![0u8; len];
                read_exact(patch, &mut bytes)?;
                total += len as u64;
                chunks.push(bytes);
            }
            _ => return Err(Error::data("unknown opcode in binary patch")),
        }
    }
    let mut crc = Crc::from_size(&total);
    for chunk in &chunks {
        crc.update(chunk);
        out.write(chunk)?;
    }
    Ok(crc)
}

/// Delta signature record attached to a file entry.
///
/// In direct mode the catalogue holds the checksums, sizes and the
/// offset of the payload in the archive body; in sequential mode the
/// payload is inlined.
#[derive(Clone, Debug)]
pub struct SigRecord {
    /// Checksum of the file the patch applies to.
    pub base_crc: Crc,
    /// Payload size; zero means checksums only.
    pub sig_size: Bigint,
    /// Payload offset in the archive, direct mode with a payload only.
    pub sig_offset: Option<Bigint>,
    pub sig_block_len: u32,
    /// Checksum of the file once the patch is applied.
    pub result_crc: Crc,
    payload: Option<Rc<Vec<u8>>>,
}

impl SigRecord {
    /// Record carrying a full signature payload.
    pub fn with_signature(base_crc: Crc, sig: &Signature, result_crc: Crc) -> Self {
        let bytes = sig.to_bytes();
        Self {
            base_crc,
            sig_size: Bigint::from(bytes.len()),
            sig_offset: None,
            sig_block_len: sig.block_len,
            result_crc,
            payload: Some(Rc::new(bytes)),
        }
    }

    /// Record carrying checksums only.
    pub fn crc_only(base_crc: Crc, result_crc: Crc) -> Self {
        Self {
            base_crc,
            sig_size: Bigint::zero(),
            sig_offset: None,
            sig_block_len: 0,
            result_crc,
            payload: None,
        }
    }

    /// Record attached to a stored binary patch: no payload, but the
    /// base block length the patch refers to.
    pub fn for_patch(base_crc: Crc, block_len: u32, result_crc: Crc) -> Self {
        Self {
            base_crc,
            sig_size: Bigint::zero(),
            sig_offset: None,
            sig_block_len: block_len,
            result_crc,
            payload: None,
        }
    }

    /// Block length, falling back to the default for records read from
    /// old archives that did not carry one.
    pub fn sig_block_len_or_default(&self) -> u32 {
        if self.sig_block_len == 0 {
            DEFAULT_SIG_BLOCK
        } else {
            self.sig_block_len
        }
    }

    /// Forgets the payload and its location, keeping the checksums.
    /// Used when the record moves to an archive that does not carry the
    /// payload bytes.
    pub fn strip_payload_reference(&mut self) {
        self.sig_size = Bigint::zero();
        self.sig_offset = None;
        self.payload = None;
    }

    /// Shared payload bytes, when materialized.
    pub fn payload(&self) -> Option<Rc<Vec<u8>>> {
        self.payload.clone()
    }

    /// Parses the payload into a usable signature.
    pub fn signature(&self) -> Result<Signature> {
        match &self.payload {
            Some(bytes) => Signature::from_bytes(bytes),
            None => Err(Error::misuse("signature payload not materialized")),
        }
    }

    /// Drops the payload; it can be fetched again in direct mode.
    pub fn drop_payload(&mut self) {
        if self.sig_offset.is_some() {
            self.payload = None;
        }
    }

    /// Writes the payload part into the archive body and records its
    /// offset. Layout: block length, payload bytes, payload checksum.
    pub fn dump_body(&mut self, f: &mut dyn Stream) -> Result<()> {
        if self.sig_size.is_zero() {
            return Ok(());
        }
        let payload = self
            .payload
            .clone()
            .ok_or_else(|| Error::misuse("signature payload not materialized"))?;
        self.sig_offset = Some(f.position()?);
        let mut head = [0u8; 4];
        BigEndian::write_u32(&mut head, self.sig_block_len);
        f.write(&head)?;
        f.write(&payload)?;
        let mut crc = Crc::from_size(&self.sig_size);
        crc.update(&payload);
        crc.dump(f)
    }

    /// Reads the payload part back from the archive body at the
    /// recorded offset.
    pub fn fetch_body(&mut self, f: &mut dyn Stream) -> Result<()> {
        if self.sig_size.is_zero() || self.payload.is_some() {
            return Ok(());
        }
        let offset = self
            .sig_offset
            .clone()
            .ok_or_else(|| Error::misuse("no payload offset to fetch from"))?;
        if !f.skip(&offset)? {
            return Err(Error::data("signature payload offset past end of archive"));
        }
        self.read_body_here(f)
    }

    fn read_body_here(&mut self, f: &mut dyn Stream) -> Result<()> {
        let mut head = [0u8; 4];
        read_exact(f, &mut head)?;
        self.sig_block_len = BigEndian::read_u32(&head);
        let len = self
            .sig_size
            .to_usize()
            .ok_or_else(|| Error::range("signature size out of bounds"))?;
        let mut payload = vec![0u8; len];
        read_exact(f, &mut payload)?;
        let stored = Crc::read(f)?;
        let mut crc = Crc::with_width(stored.width());
        crc.update(&payload);
        if !crc.same_as(&stored) {
            return Err(Error::data(MSG_DELTA_SIG_CRC));
        }
        self.payload = Some(Rc::new(payload));
        Ok(())
    }

    /// Writes the catalogue part (direct mode).
    pub fn dump_direct(&self, f: &mut dyn Stream) -> Result<()> {
        self.base_crc.dump(f)?;
        self.sig_size.dump(f)?;
        if !self.sig_size.is_zero() {
            match &self.sig_offset {
                Some(offset) => offset.dump(f)?,
                None => return Err(Error::misuse("signature body was never written")),
            }
        }
        self.result_crc.dump(f)
    }

    /// Reads the catalogue part (direct mode).
    pub fn read_direct(f: &mut dyn Stream) -> Result<Self> {
        let base_crc = Crc::read(f)?;
        let sig_size = Bigint::read(f)?;
        let sig_offset = if sig_size.is_zero() {
            None
        } else {
            Some(Bigint::read(f)?)
        };
        let result_crc = Crc::read(f)?;
        Ok(Self {
            base_crc,
            sig_size,
            sig_offset,
            sig_block_len: 0,
            result_crc,
            payload: None,
        })
    }

    /// Writes the whole record in line (sequential mode).
    pub fn dump_sequential(&self, f: &mut dyn Stream) -> Result<()> {
        self.base_crc.dump(f)?;
        self.sig_size.dump(f)?;
        if !self.sig_size.is_zero() {
            let payload = self
                .payload
                .clone()
                .ok_or_else(|| Error::misuse("signature payload not materialized"))?;
            let mut head = [0u8; 4];
            BigEndian::write_u32(&mut head, self.sig_block_len);
            f.write(&head)?;
            f.write(&payload)?;
            let mut crc = Crc::from_size(&self.sig_size);
            crc.update(&payload);
            crc.dump(f)?;
        }
        self.result_crc.dump(f)
    }

    /// Reads a record written by `dump_sequential`.
    pub fn read_sequential(f: &mut dyn Stream) -> Result<Self> {
        let base_crc = Crc::read(f)?;
        let sig_size = Bigint::read(f)?;
        let mut record = Self {
            base_crc,
            sig_size: sig_size.clone(),
            sig_offset: None,
            sig_block_len: 0,
            result_crc: Crc::with_width(2),
            payload: None,
        };
        if !sig_size.is_zero() {
            record.read_body_here(f)?;
        }
        record.result_crc = Crc::read(f)?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crc_of(data: &[u8]) -> Crc {
        let mut c = Crc::from_size(&Bigint::from(data.len()));
        c.update(data);
        c
    }

    #[test]
    fn signature_roundtrip() {
        let data: Vec<u8> = (0..10_000usize).map(|i| (i % 251) as u8).collect();
        let mut m = MemoryStream::with_contents(data);
        let sig = Signature::compute(&mut m, 512).unwrap();
        assert_eq!(sig.block_count(), 19);
        let back = Signature::from_bytes(&sig.to_bytes()).unwrap();
        assert_eq!(back, sig);
    }

    #[test]
    fn patch_reproduces_modified_file() {
        let old: Vec<u8> = (0..20_000usize).map(|i| (i % 240) as u8).collect();
        let mut new = old.clone();
        // a small change in the middle and an appended tail
        new[10_000] ^= 0xff;
        new.extend_from_slice(b"appended tail bytes");

        let sig = Signature::compute(&mut MemoryStream::with_contents(old.clone()), 512).unwrap();
        let mut patch = MemoryStream::new();
        let (result_crc, patch_len) = make_patch(
            &sig,
            &mut MemoryStream::with_contents(new.clone()),
            &Bigint::from(new.len()),
            &mut patch,
        )
        .unwrap();
        // most of the file is unchanged, the patch must be much smaller
        assert!(patch_len.to_usize().unwrap() < old.len() / 4);

        patch.skip(&Bigint::zero()).unwrap();
        let mut rebuilt = MemoryStream::new();
        let crc = apply_patch(
            &mut MemoryStream::with_contents(old),
            sig.block_len,
            &mut patch,
            &mut rebuilt,
        )
        .unwrap();
        assert_eq!(rebuilt.contents(), &new[..]);
        assert!(crc.same_as(&result_crc));
    }

    #[test]
    fn record_direct_roundtrip_with_body() {
        let data: Vec<u8> = (0..5_000usize).map(|i| (i % 13) as u8).collect();
        let sig = Signature::compute(&mut MemoryStream::with_contents(data.clone()), 256).unwrap();
        let mut record = SigRecord::with_signature(crc_of(&data), &sig, crc_of(&data));

        // body lands in the archive, catalogue part elsewhere
        let mut body = MemoryStream::new();
        body.write(b"padding").unwrap();
        record.dump_body(&mut body).unwrap();
        let mut cat = MemoryStream::new();
        record.dump_direct(&mut cat).unwrap();

        cat.skip(&Bigint::zero()).unwrap();
        let mut back = SigRecord::read_direct(&mut cat).unwrap();
        assert_eq!(back.sig_size, record.sig_size);
        assert!(back.payload().is_none());
        back.fetch_body(&mut body).unwrap();
        assert_eq!(back.signature().unwrap(), sig);

        // corrupting the payload body trips the checksum
        let mut bytes = body.into_contents();
        bytes[20] ^= 0x55;
        let mut body = MemoryStream::with_contents(bytes);
        let mut again = SigRecord::read_direct(&mut {
            let mut m = MemoryStream::new();
            record.dump_direct(&mut m).unwrap();
            m.skip(&Bigint::zero()).unwrap();
            m
        })
        .unwrap();
        match again.fetch_body(&mut body) {
            Err(Error::Data(msg)) => assert_eq!(msg, MSG_DELTA_SIG_CRC),
            other => panic!("expected a data error, got {other:?}"),
        }
    }

    #[test]
    fn sequential_record_roundtrip() {
        let data = b"delta signature payload source".repeat(100);
        let sig = Signature::compute(&mut MemoryStream::with_contents(data.clone()), 128).unwrap();
        let record = SigRecord::with_signature(crc_of(&data), &sig, crc_of(&data));
        let mut m = MemoryStream::new();
        record.dump_sequential(&mut m).unwrap();
        m.skip(&Bigint::zero()).unwrap();
        let back = SigRecord::read_sequential(&mut m).unwrap();
        assert_eq!(back.signature().unwrap(), sig);
        assert!(back.result_crc.same_as(&record.result_crc));
    }
}
