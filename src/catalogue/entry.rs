//! Catalogue entries: one tagged variant per kind of filesystem object,
//! with their on-disk serialization.

use crate::bigint::Bigint;
use crate::compress::CompressionAlgo;
use crate::crc::Crc;
use crate::delta::SigRecord;
use crate::error::Error;
use crate::error::Result;
use crate::stream::read_lstring;
use crate::stream::read_u8;
use crate::stream::write_lstring;
use crate::stream::Stream;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::HashSet;
use std::rc::Rc;

/// Set on a signature byte when the entry is a placeholder.
const SIG_FAKE_BIT: u8 = 0x80;

/// How much of an entry's data the archive holds.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SavedStatus {
    /// Data is present in this archive.
    #[default]
    Saved,
    /// Only metadata, the data lives in the archive of reference.
    NotSaved,
    /// Placeholder from an isolated catalogue.
    Fake,
    /// The archive holds a binary patch against the reference.
    Delta,
    /// Only the inode metadata changed.
    InodeOnly,
    /// The entry was removed since the reference.
    Removed,
}

impl SavedStatus {
    fn code(self) -> u8 {
        match self {
            Self::Saved => b's',
            Self::NotSaved => b'n',
            Self::Fake => b'f',
            Self::Delta => b'd',
            Self::InodeOnly => b'i',
            Self::Removed => b'r',
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            b's' => Self::Saved,
            b'n' => Self::NotSaved,
            b'f' => Self::Fake,
            b'd' => Self::Delta,
            b'i' => Self::InodeOnly,
            b'r' => Self::Removed,
            _ => return Err(Error::range("unknown saved status in catalogue")),
        })
    }
}

/// How much of an entry's extended attributes the archive holds.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum EaStatus {
    #[default]
    None,
    /// Metadata only.
    Partial,
    /// Placeholder.
    Fake,
    /// Attribute data present.
    Full,
}

impl EaStatus {
    fn code(self) -> u8 {
        match self {
            Self::None => b'n',
            Self::Partial => b'p',
            Self::Fake => b'k',
            Self::Full => b'f',
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            b'n' => Self::None,
            b'p' => Self::Partial,
            b'k' => Self::Fake,
            b'f' => Self::Full,
            _ => return Err(Error::range("unknown attribute status in catalogue")),
        })
    }

    /// Demotion applied when an entry is recorded without its data.
    pub fn demoted(self) -> Self {
        match self {
            Self::Full => Self::Partial,
            other => other,
        }
    }
}

/// Named extended attributes, kept as an opaque block.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EaBlock {
    pub pairs: Vec<(String, Vec<u8>)>,
}

impl EaBlock {
    fn dump(&self, f: &mut dyn Stream) -> Result<()> {
        Bigint::from(self.pairs.len()).dump(f)?;
        for (name, value) in &self.pairs {
            write_lstring(f, name.as_bytes())?;
            write_lstring(f, value)?;
        }
        Ok(())
    }

    fn read(f: &mut dyn Stream) -> Result<Self> {
        let count = Bigint::read(f)?
            .to_usize()
            .ok_or_else(|| Error::range("attribute count out of bounds"))?;
        let mut pairs = Vec::with_capacity(count);
        for _ in 0..count {
            let name = String::from_utf8_lossy(&read_lstring(f)?).into_owned();
            let value = read_lstring(f)?;
            pairs.push((name, value));
        }
        Ok(Self { pairs })
    }
}

/// Metadata shared by every inode kind.
#[derive(Clone, Debug, Default)]
pub struct InodeMeta {
    pub status: SavedStatus,
    pub uid: Bigint,
    pub gid: Bigint,
    pub perm: u32,
    /// Seconds since the epoch.
    pub mtime: Bigint,
    pub ea: EaStatus,
    pub ea_block: Option<EaBlock>,
    pub fsa: EaStatus,
    pub fsa_flags: Option<Bigint>,
}

impl InodeMeta {
    fn dump(&self, f: &mut dyn Stream) -> Result<()> {
        self.uid.dump(f)?;
        self.gid.dump(f)?;
        Bigint::from(self.perm as u64).dump(f)?;
        self.mtime.dump(f)?;
        f.write(&[self.ea.code()])?;
        if self.ea == EaStatus::Full {
            match &self.ea_block {
                Some(block) => block.dump(f)?,
                None => EaBlock::default().dump(f)?,
            }
        }
        f.write(&[self.fsa.code()])?;
        if self.fsa == EaStatus::Full {
            self.fsa_flags.clone().unwrap_or_default().dump(f)?;
        }
        Ok(())
    }

    fn read(f: &mut dyn Stream, status: SavedStatus) -> Result<Self> {
        let uid = Bigint::read(f)?;
        let gid = Bigint::read(f)?;
        let perm = Bigint::read(f)?
            .to_u64()
            .and_then(|p| u32::try_from(p).ok())
            .ok_or_else(|| Error::range("permission bits out of bounds"))?;
        let mtime = Bigint::read(f)?;
        let ea = EaStatus::from_code(read_u8(f)?)?;
        let ea_block = if ea == EaStatus::Full {
            Some(EaBlock::read(f)?)
        } else {
            None
        };
        let fsa = EaStatus::from_code(read_u8(f)?)?;
        let fsa_flags = if fsa == EaStatus::Full {
            Some(Bigint::read(f)?)
        } else {
            None
        };
        Ok(Self {
            status,
            uid,
            gid,
            perm,
            mtime,
            ea,
            ea_block,
            fsa,
            fsa_flags,
        })
    }

    /// Copy of the metadata as recorded when the data is not carried.
    pub fn demoted(&self) -> Self {
        let mut meta = self.clone();
        meta.status = SavedStatus::NotSaved;
        meta.ea = meta.ea.demoted();
        meta.ea_block = None;
        meta.fsa = meta.fsa.demoted();
        meta.fsa_flags = None;
        meta
    }
}

/// Where a file's bytes are and how they are stored.
#[derive(Clone, Debug, Default)]
pub struct FileData {
    /// Offset of the body in the archive, in the coordinates of the
    /// layer below the compression.
    pub offset: Bigint,
    /// Bytes occupied in the archive.
    pub stored_size: Bigint,
    /// Bytes of the original file.
    pub original_size: Bigint,
    pub compression: CompressionAlgo,
    pub dirty: bool,
    pub sparse: bool,
    pub crc: Option<Crc>,
    pub delta_sig: Option<SigRecord>,
}

/// Serialization flavor of the catalogue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DumpMode {
    /// Catalogue at the end of the archive, signature payloads in the
    /// body.
    Direct,
    /// Catalogue streamed along the data, payloads in line.
    Sequential,
}

/// A directory and the entries it owns.
#[derive(Clone, Debug, Default)]
pub struct DirEntry {
    pub name: String,
    pub meta: InodeMeta,
    pub children: Vec<Entry>,
    /// Propagated when anything below changed since the reference.
    pub recursive_changed: bool,
}

#[derive(Clone, Debug)]
pub struct FileEntry {
    pub name: String,
    pub meta: InodeMeta,
    pub data: FileData,
}

#[derive(Clone, Debug)]
pub struct SymlinkEntry {
    pub name: String,
    pub meta: InodeMeta,
    pub target: String,
}

#[derive(Clone, Debug)]
pub struct NodeEntry {
    pub name: String,
    pub meta: InodeMeta,
    pub major: Bigint,
    pub minor: Bigint,
}

#[derive(Clone, Debug)]
pub struct SpecialEntry {
    pub name: String,
    pub meta: InodeMeta,
}

#[derive(Clone, Debug)]
pub struct DeletedEntry {
    pub name: String,
    /// Signature letter of the kind of entry that was removed.
    pub removed_kind: u8,
    pub mtime: Bigint,
}

/// Shared owner of a hard-linked inode.
#[derive(Debug)]
pub struct InodeHolder {
    pub tag: u64,
    pub inner: Entry,
}

pub type HolderRef = Rc<RefCell<InodeHolder>>;

/// One name referring to a hard-linked inode.
#[derive(Clone, Debug)]
pub struct MirageEntry {
    pub name: String,
    pub holder: HolderRef,
}

/// A catalogue entry.
#[derive(Clone, Debug)]
pub enum Entry {
    /// Closes the current directory in the serialized stream.
    Eod,
    Dir(DirEntry),
    File(FileEntry),
    Symlink(SymlinkEntry),
    CharDev(NodeEntry),
    BlockDev(NodeEntry),
    Pipe(SpecialEntry),
    Socket(SpecialEntry),
    Deleted(DeletedEntry),
    HardLinkRef(MirageEntry),
    /// Filtered out; kept in memory, never serialized.
    Ignored(String),
    /// Filtered out directory; its presence keeps the tree shape.
    IgnoredDir(String),
}

impl Entry {
    /// Lowercase signature letter of the variant.
    pub fn signature_base(&self) -> u8 {
        match self {
            Self::Eod => b'z',
            Self::Dir(_) => b'd',
            Self::File(_) => b'f',
            Self::Symlink(_) => b'l',
            Self::CharDev(_) => b'c',
            Self::BlockDev(_) => b'b',
            Self::Pipe(_) => b'p',
            Self::Socket(_) => b's',
            Self::Deleted(_) => b'x',
            Self::HardLinkRef(_) => b'o',
            Self::Ignored(_) | Self::IgnoredDir(_) => b'i',
        }
    }

    /// Name of the entry; empty for the kinds that have none.
    pub fn name(&self) -> &str {
        match self {
            Self::Eod => "",
            Self::Dir(e) => &e.name,
            Self::File(e) => &e.name,
            Self::Symlink(e) => &e.name,
            Self::CharDev(e) | Self::BlockDev(e) => &e.name,
            Self::Pipe(e) | Self::Socket(e) => &e.name,
            Self::Deleted(e) => &e.name,
            Self::HardLinkRef(e) => &e.name,
            Self::Ignored(name) | Self::IgnoredDir(name) => name,
        }
    }

    /// Inode metadata, for the kinds that carry one.
    pub fn meta(&self) -> Option<&InodeMeta> {
        match self {
            Self::Dir(e) => Some(&e.meta),
            Self::File(e) => Some(&e.meta),
            Self::Symlink(e) => Some(&e.meta),
            Self::CharDev(e) | Self::BlockDev(e) => Some(&e.meta),
            Self::Pipe(e) | Self::Socket(e) => Some(&e.meta),
            _ => None,
        }
    }

    /// Saved status, resolving hard links through their holder.
    pub fn status(&self) -> SavedStatus {
        match self {
            Self::HardLinkRef(e) => e.holder.borrow().inner.status(),
            Self::Deleted(_) => SavedStatus::Removed,
            other => other.meta().map(|m| m.status).unwrap_or_default(),
        }
    }

    /// Tells whether the entry may be serialized.
    pub fn is_serializable(&self) -> bool {
        !matches!(self, Self::Ignored(_) | Self::IgnoredDir(_))
    }

    fn signature(&self) -> u8 {
        let base = self.signature_base();
        let status = match self {
            Self::Eod | Self::Deleted(_) => SavedStatus::Saved,
            Self::HardLinkRef(_) => SavedStatus::Saved,
            other => other.status(),
        };
        match status {
            SavedStatus::NotSaved => base.to_ascii_uppercase(),
            SavedStatus::Fake => base | SIG_FAKE_BIT,
            _ => base,
        }
    }

    /// Serializes this entry alone: directories write their own record
    /// only, children are the caller's concern.
    pub fn dump(
        &self,
        f: &mut dyn Stream,
        mode: DumpMode,
        dumped_tags: &mut HashSet<u64>,
    ) -> Result<()> {
        if !self.is_serializable() {
            return Err(Error::bug("attempt to serialize a filtered-out entry"));
        }
        f.write(&[self.signature()])?;
        match self {
            Entry::Eod => Ok(()),
            Entry::Dir(e) => {
                write_lstring(f, e.name.as_bytes())?;
                e.meta.dump(f)
            }
            Entry::File(e) => {
                write_lstring(f, e.name.as_bytes())?;
                e.meta.dump(f)?;
                dump_file_data(&e.meta, &e.data, f, mode)
            }
            Entry::Symlink(e) => {
                write_lstring(f, e.name.as_bytes())?;
                e.meta.dump(f)?;
                write_lstring(f, e.target.as_bytes())
            }
            Entry::CharDev(e) | Entry::BlockDev(e) => {
                write_lstring(f, e.name.as_bytes())?;
                e.meta.dump(f)?;
                e.major.dump(f)?;
                e.minor.dump(f)
            }
            Entry::Pipe(e) | Entry::Socket(e) => {
                write_lstring(f, e.name.as_bytes())?;
                e.meta.dump(f)
            }
            Entry::Deleted(e) => {
                write_lstring(f, e.name.as_bytes())?;
                f.write(&[e.removed_kind])?;
                e.mtime.dump(f)
            }
            Entry::HardLinkRef(e) => {
                write_lstring(f, e.name.as_bytes())?;
                let holder = e.holder.borrow();
                Bigint::from(holder.tag).dump(f)?;
                if dumped_tags.insert(holder.tag) {
                    f.write(&[1])?;
                    holder.inner.dump(f, mode, dumped_tags)
                } else {
                    f.write(&[0])
                }
            }
            Entry::Ignored(_) | Entry::IgnoredDir(_) => {
                Err(Error::bug("filtered-out entry reached serialization"))
            }
        }
    }

    /// Reads one entry. Hard link references resolve against `tags`,
    /// which accumulates the holders met so far.
    pub fn read(
        f: &mut dyn Stream,
        mode: DumpMode,
        tags: &mut HashMap<u64, HolderRef>,
    ) -> Result<Self> {
        let signature = read_u8(f)?;
        let base = (signature & !SIG_FAKE_BIT).to_ascii_lowercase();
        let status = if signature & SIG_FAKE_BIT != 0 {
            SavedStatus::Fake
        } else if signature.is_ascii_uppercase() {
            SavedStatus::NotSaved
        } else {
            SavedStatus::Saved
        };
        match base {
            b'z' => Ok(Self::Eod),
            b'd' => {
                let name = read_name(f)?;
                let meta = InodeMeta::read(f, status)?;
                Ok(Self::Dir(DirEntry {
                    name,
                    meta,
                    children: Vec::new(),
                    recursive_changed: false,
                }))
            }
            // 'e' is the old hard link definition, compatible with a
            // plain file record
            b'f' | b'e' => {
                let name = read_name(f)?;
                let meta = InodeMeta::read(f, status)?;
                let (meta, data) = read_file_data(meta, f, mode)?;
                Ok(Self::File(FileEntry { name, meta, data }))
            }
            b'l' => {
                let name = read_name(f)?;
                let meta = InodeMeta::read(f, status)?;
                let target = String::from_utf8_lossy(&read_lstring(f)?).into_owned();
                Ok(Self::Symlink(SymlinkEntry { name, meta, target }))
            }
            b'c' | b'b' => {
                let name = read_name(f)?;
                let meta = InodeMeta::read(f, status)?;
                let major = Bigint::read(f)?;
                let minor = Bigint::read(f)?;
                let node = NodeEntry {
                    name,
                    meta,
                    major,
                    minor,
                };
                Ok(if base == b'c' {
                    Self::CharDev(node)
                } else {
                    Self::BlockDev(node)
                })
            }
            b'p' | b's' => {
                let name = read_name(f)?;
                let meta = InodeMeta::read(f, status)?;
                let special = SpecialEntry { name, meta };
                Ok(if base == b'p' {
                    Self::Pipe(special)
                } else {
                    Self::Socket(special)
                })
            }
            b'x' => {
                let name = read_name(f)?;
                let removed_kind = read_u8(f)?;
                let mtime = Bigint::read(f)?;
                Ok(Self::Deleted(DeletedEntry {
                    name,
                    removed_kind,
                    mtime,
                }))
            }
            b'o' => {
                let name = read_name(f)?;
                let tag = Bigint::read(f)?
                    .to_u64()
                    .ok_or_else(|| Error::range("hard link tag out of bounds"))?;
                let follows = read_u8(f)?;
                if follows == 1 {
                    let inner = Self::read(f, mode, tags)?;
                    let holder = Rc::new(RefCell::new(InodeHolder { tag, inner }));
                    tags.insert(tag, holder.clone());
                    Ok(Self::HardLinkRef(MirageEntry { name, holder }))
                } else {
                    let holder = tags.get(&tag).cloned().ok_or_else(|| {
                        Error::data("hard link reference to an unknown inode tag")
                    })?;
                    Ok(Self::HardLinkRef(MirageEntry { name, holder }))
                }
            }
            other => Err(Error::range(format!(
                "unknown entry signature {:#04x} in catalogue",
                other
            ))),
        }
    }

    /// Total size shown by listings.
    pub fn listed_size(&self) -> Bigint {
        match self {
            Self::File(e) => e.data.original_size.clone(),
            Self::HardLinkRef(e) => e.holder.borrow().inner.listed_size(),
            _ => Bigint::zero(),
        }
    }
}

fn read_name(f: &mut dyn Stream) -> Result<String> {
    Ok(String::from_utf8_lossy(&read_lstring(f)?).into_owned())
}

fn dump_file_data(
    meta: &InodeMeta,
    data: &FileData,
    f: &mut dyn Stream,
    mode: DumpMode,
) -> Result<()> {
    f.write(&[meta.status.code()])?;
    data.offset.dump(f)?;
    data.stored_size.dump(f)?;
    data.original_size.dump(f)?;
    f.write(&[
        data.compression.code(),
        u8::from(data.dirty),
        u8::from(data.sparse),
    ])?;
    match &data.crc {
        Some(crc) => {
            f.write(&[1])?;
            crc.dump(f)?;
        }
        None => f.write(&[0])?,
    }
    match &data.delta_sig {
        Some(sig) => {
            f.write(&[1])?;
            match mode {
                DumpMode::Direct => sig.dump_direct(f),
                DumpMode::Sequential => sig.dump_sequential(f),
            }
        }
        None => f.write(&[0]),
    }
}

fn read_file_data(
    mut meta: InodeMeta,
    f: &mut dyn Stream,
    mode: DumpMode,
) -> Result<(InodeMeta, FileData)> {
    meta.status = SavedStatus::from_code(read_u8(f)?)?;
    let offset = Bigint::read(f)?;
    let stored_size = Bigint::read(f)?;
    let original_size = Bigint::read(f)?;
    let compression = CompressionAlgo::from_code(read_u8(f)?)?;
    let dirty = read_u8(f)? != 0;
    let sparse = read_u8(f)? != 0;
    let crc = if read_u8(f)? == 1 {
        Some(Crc::read(f)?)
    } else {
        None
    };
    let delta_sig = if read_u8(f)? == 1 {
        Some(match mode {
            DumpMode::Direct => SigRecord::read_direct(f)?,
            DumpMode::Sequential => SigRecord::read_sequential(f)?,
        })
    } else {
        None
    };
    Ok((
        meta,
        FileData {
            offset,
            stored_size,
            original_size,
            compression,
            dirty,
            sparse,
            crc,
            delta_sig,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::memory::MemoryStream;

    fn meta() -> InodeMeta {
        InodeMeta {
            status: SavedStatus::Saved,
            uid: Bigint::from(1000u64),
            gid: Bigint::from(100u64),
            perm: 0o644,
            mtime: Bigint::from(1_700_000_000u64),
            ..Default::default()
        }
    }

    fn roundtrip(entry: &Entry) -> Entry {
        let mut m = MemoryStream::new();
        let mut dumped = HashSet::new();
        entry.dump(&mut m, DumpMode::Direct, &mut dumped).unwrap();
        m.skip(&Bigint::zero()).unwrap();
        let mut tags = HashMap::new();
        Entry::read(&mut m, DumpMode::Direct, &mut tags).unwrap()
    }

    #[test]
    fn file_roundtrip() {
        let mut crc = Crc::with_width(2);
        crc.update(b"contents");
        let entry = Entry::File(FileEntry {
            name: "notes.txt".to_string(),
            meta: meta(),
            data: FileData {
                offset: Bigint::from(4242u64),
                stored_size: Bigint::from(100u64),
                original_size: Bigint::from(250u64),
                compression: CompressionAlgo::Gzip,
                dirty: false,
                sparse: true,
                crc: Some(crc.clone()),
                delta_sig: None,
            },
        });
        match roundtrip(&entry) {
            Entry::File(e) => {
                assert_eq!(e.name, "notes.txt");
                assert_eq!(e.meta.status, SavedStatus::Saved);
                assert_eq!(e.data.offset, Bigint::from(4242u64));
                assert_eq!(e.data.original_size, Bigint::from(250u64));
                assert!(e.data.sparse);
                assert!(e.data.crc.unwrap().same_as(&crc));
            }
            other => panic!("wrong variant back: {other:?}"),
        }
    }

    #[test]
    fn not_saved_flows_through_signature_case() {
        let mut m = meta();
        m.status = SavedStatus::NotSaved;
        let entry = Entry::Symlink(SymlinkEntry {
            name: "link".to_string(),
            meta: m,
            target: "../elsewhere".to_string(),
        });
        match roundtrip(&entry) {
            Entry::Symlink(e) => {
                assert_eq!(e.meta.status, SavedStatus::NotSaved);
                assert_eq!(e.target, "../elsewhere");
            }
            other => panic!("wrong variant back: {other:?}"),
        }
    }

    #[test]
    fn hard_link_dedup() {
        let inner = Entry::File(FileEntry {
            name: String::new(),
            meta: meta(),
            data: FileData {
                original_size: Bigint::from(5u64),
                ..Default::default()
            },
        });
        let holder = Rc::new(RefCell::new(InodeHolder { tag: 7, inner }));
        let first = Entry::HardLinkRef(MirageEntry {
            name: "a".to_string(),
            holder: holder.clone(),
        });
        let second = Entry::HardLinkRef(MirageEntry {
            name: "b".to_string(),
            holder,
        });

        let mut m = MemoryStream::new();
        let mut dumped = HashSet::new();
        first.dump(&mut m, DumpMode::Direct, &mut dumped).unwrap();
        second.dump(&mut m, DumpMode::Direct, &mut dumped).unwrap();

        m.skip(&Bigint::zero()).unwrap();
        let mut tags = HashMap::new();
        let a = Entry::read(&mut m, DumpMode::Direct, &mut tags).unwrap();
        let b = Entry::read(&mut m, DumpMode::Direct, &mut tags).unwrap();
        match (&a, &b) {
            (Entry::HardLinkRef(a), Entry::HardLinkRef(b)) => {
                assert!(Rc::ptr_eq(&a.holder, &b.holder));
                assert_eq!(a.holder.borrow().tag, 7);
                assert_eq!(b.holder.borrow().inner.listed_size(), Bigint::from(5u64));
            }
            other => panic!("wrong variants back: {other:?}"),
        }
    }

    #[test]
    fn dangling_hard_link_tag_rejected() {
        let mut m = MemoryStream::new();
        m.write(&[b'o']).unwrap();
        write_lstring(&mut m, b"nm").unwrap();
        Bigint::from(99u64).dump(&mut m).unwrap();
        m.write(&[0]).unwrap();
        m.skip(&Bigint::zero()).unwrap();
        let mut tags = HashMap::new();
        assert!(Entry::read(&mut m, DumpMode::Direct, &mut tags).is_err());
    }

    #[test]
    fn legacy_hardlink_definition_reads_as_file() {
        let entry = Entry::File(FileEntry {
            name: "old".to_string(),
            meta: meta(),
            data: FileData::default(),
        });
        let mut m = MemoryStream::new();
        let mut dumped = HashSet::new();
        entry.dump(&mut m, DumpMode::Direct, &mut dumped).unwrap();
        let mut bytes = m.into_contents();
        bytes[0] = b'e';
        let mut m = MemoryStream::with_contents(bytes);
        let mut tags = HashMap::new();
        match Entry::read(&mut m, DumpMode::Direct, &mut tags).unwrap() {
            Entry::File(e) => assert_eq!(e.name, "old"),
            other => panic!("wrong variant back: {other:?}"),
        }
    }
}
