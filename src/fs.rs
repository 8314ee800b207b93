//! Filesystem collaborators: the reader feeding a backup and the sinks
//! used by restore and diff.

use crate::bigint::Bigint;
use crate::catalogue::entry::DirEntry;
use crate::catalogue::entry::Entry;
use crate::catalogue::entry::FileData;
use crate::catalogue::entry::FileEntry;
use crate::catalogue::entry::InodeMeta;
use crate::catalogue::entry::NodeEntry;
use crate::catalogue::entry::SavedStatus;
use crate::catalogue::entry::SpecialEntry;
use crate::catalogue::entry::SymlinkEntry;
use crate::error::Error;
use crate::error::Result;
use crate::stream::Stream;
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::path::PathBuf;

/// Item produced by the backup reader: the entry plus what the engine
/// needs to stream its data.
pub struct FsItem {
    pub entry: Entry,
    /// Absolute path of the object on disk.
    pub path: PathBuf,
    /// Identity of the underlying inode when it is hard-linked.
    pub link_id: Option<(u64, u64)>,
}

/// Feeder walking a filesystem tree in depth-first order, one entry per
/// call, with an end-of-directory item closing every directory.
pub trait FilesystemBackup {
    fn reset_read(&mut self, root: &Path) -> Result<()>;
    /// Next entry, or `None` once the walk is over.
    fn read(&mut self) -> Result<Option<FsItem>>;
    /// Abandons the directory being walked.
    fn skip_read_to_parent_dir(&mut self);
}

/// Sink restoring entries to a directory.
pub trait FilesystemRestore {
    /// What is on disk at this relative path, when anything.
    fn peek(&self, rel: &Path) -> Option<DiskPresence>;
    /// Creates or replaces the object, streaming `body` for files.
    fn write(&mut self, rel: &Path, entry: &Entry, body: Option<&mut dyn Stream>) -> Result<()>;
    /// Records where a hard-linked inode landed so later references
    /// become links to it.
    fn link(&mut self, rel: &Path, tag: u64) -> Result<bool>;
    /// Current content of a restored file, needed to apply binary
    /// patches over it.
    fn read_back(&self, rel: &Path) -> Result<Vec<u8>>;
}

/// Sink comparing entries with what a directory holds.
pub trait FilesystemDiff {
    fn compare(&mut self, rel: &Path, entry: &Entry, fields: &ComparisonFields)
        -> Result<Option<String>>;
}

/// What exists on disk at a path.
#[derive(Clone, Debug)]
pub struct DiskPresence {
    pub kind: u8,
    pub mtime: Bigint,
}

/// Which fields a diff takes into account.
#[derive(Clone, Copy, Debug)]
pub struct ComparisonFields {
    pub inode_type: bool,
    pub perm: bool,
    pub owner: bool,
    pub mtime: bool,
    pub content: bool,
}

impl ComparisonFields {
    /// Everything.
    pub fn all() -> Self {
        Self {
            inode_type: true,
            perm: true,
            owner: true,
            mtime: true,
            content: true,
        }
    }

    /// Everything but ownership.
    pub fn ignore_owner() -> Self {
        Self {
            owner: false,
            ..Self::all()
        }
    }

    /// Type and content timestamps only.
    pub fn mtime() -> Self {
        Self {
            inode_type: true,
            perm: false,
            owner: false,
            mtime: true,
            content: false,
        }
    }

    /// Bare type check.
    pub fn inode_type() -> Self {
        Self {
            inode_type: true,
            perm: false,
            owner: false,
            mtime: false,
            content: false,
        }
    }
}

fn meta_from_fs(md: &fs::Metadata) -> InodeMeta {
    InodeMeta {
        status: SavedStatus::Saved,
        uid: Bigint::from(md.uid() as u64),
        gid: Bigint::from(md.gid() as u64),
        perm: md.mode() & 0o7777,
        mtime: Bigint::from(md.mtime().max(0) as u64),
        ..Default::default()
    }
}

/// Entry matching what sits at `path`, without reading file contents.
pub fn entry_from_path(path: &Path, name: &str) -> Result<Entry> {
    let md = fs::symlink_metadata(path)?;
    let meta = meta_from_fs(&md);
    let ft = md.file_type();
    Ok(if ft.is_dir() {
        Entry::Dir(DirEntry {
            name: name.to_string(),
            meta,
            children: Vec::new(),
            recursive_changed: false,
        })
    } else if ft.is_symlink() {
        let target = fs::read_link(path)?;
        Entry::Symlink(SymlinkEntry {
            name: name.to_string(),
            meta,
            target: target.to_string_lossy().into_owned(),
        })
    } else if ft.is_char_device() || ft.is_block_device() {
        let rdev = md.rdev();
        let node = NodeEntry {
            name: name.to_string(),
            meta,
            major: Bigint::from((rdev >> 8) & 0xfff),
            minor: Bigint::from((rdev & 0xff) | ((rdev >> 12) & !0xffu64)),
        };
        if ft.is_char_device() {
            Entry::CharDev(node)
        } else {
            Entry::BlockDev(node)
        }
    } else if ft.is_fifo() {
        Entry::Pipe(SpecialEntry {
            name: name.to_string(),
            meta,
        })
    } else if ft.is_socket() {
        Entry::Socket(SpecialEntry {
            name: name.to_string(),
            meta,
        })
    } else {
        Entry::File(FileEntry {
            name: name.to_string(),
            meta,
            data: FileData {
                original_size: Bigint::from(md.len()),
                ..Default::default()
            },
        })
    })
}

/// Depth-first local filesystem reader, children sorted by name.
#[derive(Default)]
pub struct LocalBackup {
    root: PathBuf,
    /// Stack of (directory path, remaining children).
    stack: Vec<(PathBuf, Vec<PathBuf>)>,
    started: bool,
    done: bool,
}

impl LocalBackup {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted_children(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut children: Vec<PathBuf> = fs::read_dir(dir)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|e| e.path())
            .collect();
        children.sort();
        Ok(children)
    }
}

impl FilesystemBackup for LocalBackup {
    fn reset_read(&mut self, root: &Path) -> Result<()> {
        if !root.is_dir() {
            return Err(Error::misuse(format!(
                "{} is not a readable directory",
                root.display()
            )));
        }
        self.root = root.to_path_buf();
        self.stack = vec![(root.to_path_buf(), Self::sorted_children(root)?)];
        self.started = true;
        self.done = false;
        Ok(())
    }

    fn read(&mut self) -> Result<Option<FsItem>> {
        if !self.started {
            return Err(Error::misuse("reader used before reset_read"));
        }
        loop {
            if self.done {
                return Ok(None);
            }
            let Some((_, children)) = self.stack.last_mut() else {
                self.done = true;
                return Ok(None);
            };
            let Some(path) = children.first().cloned() else {
                // directory exhausted
                self.stack.pop();
                if self.stack.is_empty() {
                    self.done = true;
                    return Ok(None);
                }
                return Ok(Some(FsItem {
                    entry: Entry::Eod,
                    path: PathBuf::new(),
                    link_id: None,
                }));
            };
            children.remove(0);
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let md = match fs::symlink_metadata(&path) {
                Ok(md) => md,
                // vanished between listing and stat: ignore it
                Err(_) => continue,
            };
            let entry = entry_from_path(&path, &name)?;
            if let Entry::Dir(_) = &entry {
                self.stack.push((path.clone(), Self::sorted_children(&path)?));
            }
            let link_id = if !md.file_type().is_dir() && md.nlink() > 1 {
                Some((md.dev(), md.ino()))
            } else {
                None
            };
            return Ok(Some(FsItem {
                entry,
                path,
                link_id,
            }));
        }
    }

    fn skip_read_to_parent_dir(&mut self) {
        if self.stack.len() > 1 {
            self.stack.pop();
        } else if let Some((_, children)) = self.stack.last_mut() {
            children.clear();
        }
    }
}

/// Local restore sink.
pub struct LocalRestore {
    root: PathBuf,
    /// Where each hard-link tag was first restored.
    links: std::collections::HashMap<u64, PathBuf>,
}

impl LocalRestore {
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            links: std::collections::HashMap::new(),
        })
    }

    fn apply_meta(&self, path: &Path, meta: &InodeMeta, symlink: bool) {
        // metadata restoration is best effort: a plain user cannot chown
        let c_path = match CString::new(path.as_os_str().as_bytes()) {
            Ok(p) => p,
            Err(_) => return,
        };
        if !symlink {
            unsafe {
                libc::chmod(c_path.as_ptr(), meta.perm as libc::mode_t);
            }
            if let (Some(uid), Some(gid)) = (meta.uid.to_u64(), meta.gid.to_u64()) {
                unsafe {
                    libc::chown(c_path.as_ptr(), uid as libc::uid_t, gid as libc::gid_t);
                }
            }
        }
        if let Some(mtime) = meta.mtime.to_u64() {
            let times = [
                libc::timespec {
                    tv_sec: mtime as libc::time_t,
                    tv_nsec: 0,
                },
                libc::timespec {
                    tv_sec: mtime as libc::time_t,
                    tv_nsec: 0,
                },
            ];
            let flags = if symlink { libc::AT_SYMLINK_NOFOLLOW } else { 0 };
            unsafe {
                libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), flags);
            }
        }
    }
}

impl FilesystemRestore for LocalRestore {
    fn peek(&self, rel: &Path) -> Option<DiskPresence> {
        let path = self.root.join(rel);
        let md = fs::symlink_metadata(&path).ok()?;
        let kind = if md.is_dir() {
            b'd'
        } else if md.file_type().is_symlink() {
            b'l'
        } else {
            b'f'
        };
        Some(DiskPresence {
            kind,
            mtime: Bigint::from(md.mtime().max(0) as u64),
        })
    }

    fn write(&mut self, rel: &Path, entry: &Entry, body: Option<&mut dyn Stream>) -> Result<()> {
        let path = self.root.join(rel);
        match entry {
            Entry::Dir(d) => {
                fs::create_dir_all(&path)?;
                self.apply_meta(&path, &d.meta, false);
            }
            Entry::File(f) => {
                let mut out = fs::File::create(&path)?;
                if let Some(body) = body {
                    let mut buf = [0u8; 8192];
                    loop {
                        let n = body.read(&mut buf)?;
                        if n == 0 {
                            break;
                        }
                        std::io::Write::write_all(&mut out, &buf[..n])?;
                    }
                }
                drop(out);
                self.apply_meta(&path, &f.meta, false);
            }
            Entry::Symlink(s) => {
                let _ = fs::remove_file(&path);
                std::os::unix::fs::symlink(&s.target, &path)?;
                self.apply_meta(&path, &s.meta, true);
            }
            Entry::CharDev(n) | Entry::BlockDev(n) => {
                let c_path = CString::new(path.as_os_str().as_bytes())
                    .map_err(|_| Error::range("path with interior nul"))?;
                let kind = if matches!(entry, Entry::CharDev(_)) {
                    libc::S_IFCHR
                } else {
                    libc::S_IFBLK
                };
                let major = n.major.to_u64().unwrap_or(0);
                let minor = n.minor.to_u64().unwrap_or(0);
                let dev = (major << 8) | (minor & 0xff);
                let ret = unsafe {
                    libc::mknod(
                        c_path.as_ptr(),
                        kind | n.meta.perm as libc::mode_t,
                        dev as libc::dev_t,
                    )
                };
                if ret < 0 {
                    return Err(std::io::Error::last_os_error().into());
                }
                self.apply_meta(&path, &n.meta, false);
            }
            Entry::Pipe(p) => {
                let c_path = CString::new(path.as_os_str().as_bytes())
                    .map_err(|_| Error::range("path with interior nul"))?;
                let ret = unsafe { libc::mkfifo(c_path.as_ptr(), p.meta.perm as libc::mode_t) };
                if ret < 0 {
                    return Err(std::io::Error::last_os_error().into());
                }
                self.apply_meta(&path, &p.meta, false);
            }
            Entry::Socket(_) => {
                // sockets cannot be restored as data, their slot is noted
                return Err(Error::feature("a socket cannot be recreated at restore time"));
            }
            Entry::Deleted(_) => {
                if path.is_dir() {
                    fs::remove_dir_all(&path)?;
                } else {
                    fs::remove_file(&path)?;
                }
            }
            Entry::HardLinkRef(m) => {
                let holder = m.holder.borrow();
                match self.links.get(&holder.tag) {
                    Some(first) => {
                        let _ = fs::remove_file(&path);
                        fs::hard_link(self.root.join(first), &path)?;
                    }
                    None => {
                        self.write(rel, &holder.inner, body)?;
                        self.links.insert(holder.tag, rel.to_path_buf());
                    }
                }
            }
            Entry::Eod | Entry::Ignored(_) | Entry::IgnoredDir(_) => {}
        }
        Ok(())
    }

    fn link(&mut self, rel: &Path, tag: u64) -> Result<bool> {
        match self.links.get(&tag) {
            Some(first) => {
                let path = self.root.join(rel);
                let _ = fs::remove_file(&path);
                fs::hard_link(self.root.join(first), &path)?;
                Ok(true)
            }
            None => {
                self.links.insert(tag, rel.to_path_buf());
                Ok(false)
            }
        }
    }

    fn read_back(&self, rel: &Path) -> Result<Vec<u8>> {
        Ok(fs::read(self.root.join(rel))?)
    }
}

/// Local diff sink.
pub struct LocalDiff {
    root: PathBuf,
}

impl LocalDiff {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

impl FilesystemDiff for LocalDiff {
    fn compare(
        &mut self,
        rel: &Path,
        entry: &Entry,
        fields: &ComparisonFields,
    ) -> Result<Option<String>> {
        let path = self.root.join(rel);
        let md = match fs::symlink_metadata(&path) {
            Ok(md) => md,
            Err(_) => return Ok(Some(format!("{}: absent from filesystem", rel.display()))),
        };
        let disk = entry_from_path(&path, entry.name())?;
        if fields.inode_type && disk.signature_base() != entry.signature_base() {
            return Ok(Some(format!("{}: different inode type", rel.display())));
        }
        let (Some(a), Some(b)) = (entry.meta(), disk.meta()) else {
            return Ok(None);
        };
        if fields.perm && a.perm != b.perm {
            return Ok(Some(format!("{}: different permissions", rel.display())));
        }
        if fields.owner && (a.uid != b.uid || a.gid != b.gid) {
            return Ok(Some(format!("{}: different ownership", rel.display())));
        }
        if fields.mtime && a.mtime != b.mtime {
            return Ok(Some(format!("{}: different modification time", rel.display())));
        }
        if fields.content {
            if let (Entry::File(archived), Entry::File(_)) = (entry, &disk) {
                if archived.data.original_size != Bigint::from(md.len()) {
                    return Ok(Some(format!("{}: different size", rel.display())));
                }
                if let Some(recorded) = &archived.data.crc {
                    let mut crc = crate::crc::Crc::with_width(recorded.width());
                    let bytes = fs::read(&path)?;
                    crc.update(&bytes);
                    if !crc.same_as(recorded) {
                        return Ok(Some(format!("{}: different content", rel.display())));
                    }
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("darch-fs-{}-{tag}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn walk_order_and_eods() {
        let dir = scratch("walk");
        fs::write(dir.join("a"), b"A").unwrap();
        fs::create_dir(dir.join("sub")).unwrap();
        fs::write(dir.join("sub/b"), b"").unwrap();

        let mut reader = LocalBackup::new();
        reader.reset_read(&dir).unwrap();
        let mut kinds = Vec::new();
        while let Some(item) = reader.read().unwrap() {
            kinds.push(match &item.entry {
                Entry::Eod => "<eod>".to_string(),
                other => other.name().to_string(),
            });
        }
        assert_eq!(kinds, vec!["a", "sub", "b", "<eod>"]);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn restore_and_diff_roundtrip() {
        let src = scratch("src");
        fs::write(src.join("f"), b"hello").unwrap();
        let entry = entry_from_path(&src.join("f"), "f").unwrap();

        let dst = scratch("dst");
        let mut restore = LocalRestore::new(&dst).unwrap();
        let mut body = crate::stream::memory::MemoryStream::with_contents(b"hello".to_vec());
        restore
            .write(Path::new("f"), &entry, Some(&mut body))
            .unwrap();
        assert_eq!(fs::read(dst.join("f")).unwrap(), b"hello");

        let mut diff = LocalDiff::new(&dst);
        let fields = ComparisonFields::ignore_owner();
        assert!(diff
            .compare(Path::new("f"), &entry, &fields)
            .unwrap()
            .is_none());

        fs::write(dst.join("f"), b"other").unwrap();
        assert!(diff
            .compare(Path::new("f"), &entry, &ComparisonFields::all())
            .unwrap()
            .is_some());

        fs::remove_dir_all(&src).unwrap();
        fs::remove_dir_all(&dst).unwrap();
    }

    #[test]
    fn symlink_restored_with_target() {
        let dst = scratch("lnk");
        let mut restore = LocalRestore::new(&dst).unwrap();
        let entry = Entry::Symlink(SymlinkEntry {
            name: "c".to_string(),
            meta: InodeMeta::default(),
            target: "../a".to_string(),
        });
        restore.write(Path::new("c"), &entry, None).unwrap();
        assert_eq!(
            fs::read_link(dst.join("c")).unwrap().to_string_lossy(),
            "../a"
        );
        fs::remove_dir_all(&dst).unwrap();
    }
}
