//! The catalogue: in-memory tree of archive entries, its serialization,
//! cursors, statistics and listing outputs.

pub mod entry;
pub mod streamed;

use crate::bigint::Bigint;
use crate::error::Error;
use crate::error::Result;
use crate::label::Label;
use crate::stream::read_lstring;
use crate::stream::write_lstring;
use crate::stream::Stream;
use entry::DirEntry;
use entry::DumpMode;
use entry::Entry;
use entry::SavedStatus;
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::PathBuf;

/// Position of an entry in the tree: child indices from the root.
pub type EntryPath = Vec<usize>;

/// One step of a sequential read.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CatStep {
    Entry(EntryPath),
    /// Closes the directory the previous entries belonged to.
    Eod,
}

/// Counters maintained over the whole tree.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CatStats {
    pub dirs: u64,
    pub files: u64,
    pub symlinks: u64,
    pub devices: u64,
    pub pipes: u64,
    pub sockets: u64,
    pub hard_links: u64,
    pub deleted: u64,
    pub ignored: u64,
    pub saved: u64,
    pub total: u64,
}

/// Flavor of the listing output.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ListStyle {
    Plain,
    Tree,
    Xml,
}

/// Per-entry information handed to a listing callback.
#[derive(Clone, Debug)]
pub struct ListEntry {
    pub path: String,
    pub kind: char,
    pub status: SavedStatus,
    pub size: Bigint,
    pub mtime: Bigint,
    pub perm: u32,
    pub crc: Option<String>,
    /// Slices holding the entry's data, when a locator was given.
    pub slices: Option<String>,
}

/// The archive catalogue.
pub struct Catalogue {
    pub data_name: Label,
    /// Root path of the filesystem the archive was taken from.
    pub in_place: Option<PathBuf>,
    root: Vec<Entry>,
    /// Directories currently open for `add`.
    add_stack: Vec<usize>,
    next_tag: u64,
    early_release: bool,
    cursor: Vec<CatStep>,
}

impl Catalogue {
    pub fn new(data_name: Label) -> Self {
        Self {
            data_name,
            in_place: None,
            root: Vec::new(),
            add_stack: Vec::new(),
            next_tag: 1,
            early_release: false,
            cursor: Vec::new(),
        }
    }

    /// Builds a catalogue around an already assembled tree.
    pub fn from_entries(data_name: Label, root: Vec<Entry>) -> Self {
        let mut cat = Self::new(data_name);
        cat.root = root;
        cat
    }

    /// Top-level entries.
    pub fn entries(&self) -> &[Entry] {
        &self.root
    }

    /// Mutable access to the top-level entries.
    pub fn entries_mut(&mut self) -> &mut [Entry] {
        &mut self.root
    }

    /// Deep copy of the tree and identity, without the cursor state.
    /// Hard-linked inodes stay shared with the original.
    pub fn snapshot(&self) -> Self {
        Self {
            data_name: self.data_name,
            in_place: self.in_place.clone(),
            root: self.root.clone(),
            add_stack: Vec::new(),
            next_tag: self.next_tag,
            early_release: false,
            cursor: Vec::new(),
        }
    }

    /// Next unused hard-link tag, advancing the counter.
    pub fn take_tag(&mut self) -> u64 {
        let tag = self.next_tag;
        self.next_tag += 1;
        tag
    }

    /// Flags the catalogue for early memory release: entries may be
    /// dropped once processed, which forbids merging and child lookups.
    pub fn set_early_release(&mut self) {
        self.early_release = true;
    }

    pub fn early_release(&self) -> bool {
        self.early_release
    }

    // ---- construction ----

    /// Appends an entry under the directory currently open. A directory
    /// opens itself; an end-of-directory closes the innermost one.
    pub fn add(&mut self, entry: Entry) -> Result<()> {
        if matches!(entry, Entry::Eod) {
            if self.add_stack.pop().is_none() {
                return Err(Error::misuse("end of directory with no directory open"));
            }
            return Ok(());
        }
        let is_dir = matches!(entry, Entry::Dir(_));
        let children = self.open_children();
        children.push(entry);
        let idx = children.len() - 1;
        if is_dir {
            self.add_stack.push(idx);
        }
        Ok(())
    }

    fn open_children(&mut self) -> &mut Vec<Entry> {
        let mut children = &mut self.root;
        for idx in &self.add_stack {
            match &mut children[*idx] {
                Entry::Dir(d) => children = &mut d.children,
                _ => unreachable!("add stack points at a non-directory"),
            }
        }
        children
    }

    /// Closes any directory left open by `add`.
    pub fn close_all_dirs(&mut self) {
        self.add_stack.clear();
    }

    // ---- access ----

    /// Entry at the given tree position.
    pub fn entry_at(&self, path: &[usize]) -> Option<&Entry> {
        let mut children = &self.root;
        let mut found = None;
        for (i, idx) in path.iter().enumerate() {
            found = children.get(*idx);
            if i + 1 < path.len() {
                match found {
                    Some(Entry::Dir(d)) => children = &d.children,
                    _ => return None,
                }
            }
        }
        found
    }

    pub fn entry_at_mut(&mut self, path: &[usize]) -> Option<&mut Entry> {
        let mut children = &mut self.root;
        let mut path = path;
        loop {
            let (idx, rest) = path.split_first()?;
            if rest.is_empty() {
                return children.get_mut(*idx);
            }
            match children.get_mut(*idx) {
                Some(Entry::Dir(d)) => {
                    children = &mut d.children;
                    path = rest;
                }
                _ => return None,
            }
        }
    }

    /// Replaces a processed entry with a placeholder, freeing its
    /// memory. Only legal on a catalogue flagged for early release.
    pub fn release_entry(&mut self, path: &[usize]) -> Result<()> {
        if !self.early_release {
            return Err(Error::misuse(
                "memory release requested on a catalogue not flagged for it",
            ));
        }
        if let Some(slot) = self.entry_at_mut(path) {
            if !matches!(slot, Entry::Dir(_)) {
                let name = slot.name().to_string();
                *slot = Entry::Ignored(name);
            }
        }
        Ok(())
    }

    /// Pointed lookup of one child by name under a directory path.
    /// Path components are separated by `/`; an empty path means the
    /// root.
    pub fn lookup(&self, path: &str) -> Option<&Entry> {
        let mut children: &[Entry] = &self.root;
        let mut found = None;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            found = children.iter().find(|e| e.name() == part);
            match found {
                Some(Entry::Dir(d)) => children = &d.children,
                Some(_) => children = EMPTY,
                None => return None,
            }
        }
        found
    }

    /// Children of the directory at the given path.
    pub fn get_children_of(&self, path: &str) -> Result<&[Entry]> {
        if self.early_release {
            return Err(Error::misuse(
                "child lookup on a catalogue flagged for early memory release",
            ));
        }
        if path.split('/').all(|p| p.is_empty()) {
            return Ok(&self.root);
        }
        match self.lookup(path) {
            Some(Entry::Dir(d)) => Ok(&d.children),
            Some(_) => Err(Error::misuse("child lookup on a non-directory")),
            None => Err(Error::misuse("child lookup on an unknown path")),
        }
    }

    // ---- sequential cursor ----

    fn flatten(children: &[Entry], base: &EntryPath, out: &mut Vec<CatStep>) {
        for (i, child) in children.iter().enumerate() {
            let mut path = base.clone();
            path.push(i);
            match child {
                Entry::Dir(d) => {
                    out.push(CatStep::Entry(path.clone()));
                    Self::flatten(&d.children, &path, out);
                    out.push(CatStep::Eod);
                }
                _ => out.push(CatStep::Entry(path)),
            }
        }
    }

    /// Rewinds the sequential cursor over the whole tree.
    pub fn reset_read(&mut self) {
        let mut steps = Vec::new();
        Self::flatten(&self.root, &Vec::new(), &mut steps);
        steps.reverse();
        self.cursor = steps;
    }

    /// Restricts the cursor to one subtree, keeping the directory chain
    /// leading to it and the end-of-directory steps back to the root.
    pub fn reset_read_subtree(&mut self, path: &str) -> Result<()> {
        let mut steps = Vec::new();
        let mut children = &self.root;
        let mut base: EntryPath = Vec::new();
        let mut dirs_opened = 0;
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        for (depth, part) in parts.iter().enumerate() {
            let idx = children
                .iter()
                .position(|e| e.name() == *part)
                .ok_or_else(|| Error::misuse(format!("no entry {path} in the catalogue")))?;
            base.push(idx);
            steps.push(CatStep::Entry(base.clone()));
            match &children[idx] {
                Entry::Dir(d) => {
                    dirs_opened += 1;
                    if depth + 1 == parts.len() {
                        Self::flatten(&d.children, &base, &mut steps);
                    }
                    children = &d.children;
                }
                _ if depth + 1 < parts.len() => {
                    return Err(Error::misuse(format!("{part} is not a directory")))
                }
                _ => {}
            }
        }
        for _ in 0..dirs_opened {
            steps.push(CatStep::Eod);
        }
        steps.reverse();
        self.cursor = steps;
        Ok(())
    }

    /// Next step of the sequential read.
    pub fn read_next(&mut self) -> Option<CatStep> {
        self.cursor.pop()
    }

    /// Drops the remaining steps of the innermost open directory,
    /// including its closing step.
    pub fn skip_read_to_parent_dir(&mut self) {
        let mut depth = 0usize;
        while let Some(step) = self.cursor.pop() {
            match step {
                CatStep::Entry(ref p) => {
                    if let Some(Entry::Dir(_)) = self.entry_at(p) {
                        depth += 1;
                    }
                }
                CatStep::Eod => {
                    if depth == 0 {
                        break;
                    }
                    depth -= 1;
                }
            }
        }
    }

    // ---- statistics ----

    fn count(children: &[Entry], stats: &mut CatStats) {
        for child in children {
            stats.total += 1;
            match child {
                Entry::Dir(d) => {
                    stats.dirs += 1;
                    if d.meta.status == SavedStatus::Saved {
                        stats.saved += 1;
                    }
                    Self::count(&d.children, stats);
                }
                Entry::File(f) => {
                    stats.files += 1;
                    if matches!(f.meta.status, SavedStatus::Saved | SavedStatus::Delta) {
                        stats.saved += 1;
                    }
                }
                Entry::Symlink(s) => {
                    stats.symlinks += 1;
                    if s.meta.status == SavedStatus::Saved {
                        stats.saved += 1;
                    }
                }
                Entry::CharDev(_) | Entry::BlockDev(_) => stats.devices += 1,
                Entry::Pipe(_) => stats.pipes += 1,
                Entry::Socket(_) => stats.sockets += 1,
                Entry::Deleted(_) => stats.deleted += 1,
                Entry::HardLinkRef(_) => stats.hard_links += 1,
                Entry::Ignored(_) | Entry::IgnoredDir(_) => stats.ignored += 1,
                Entry::Eod => {}
            }
        }
    }

    /// Counts entries per kind over the whole tree.
    pub fn stats(&self) -> CatStats {
        let mut stats = CatStats::default();
        Self::count(&self.root, &mut stats);
        stats
    }

    // ---- placement operations ----

    /// For every entry present in `reference` and absent here, appends a
    /// deletion marker. Returns how many markers were added. Calling it
    /// again once the markers are in place adds nothing.
    pub fn update_destroyed_with(&mut self, reference: &Catalogue) -> Result<u64> {
        fn recurse(own: &mut Vec<Entry>, reference: &[Entry]) -> u64 {
            let mut added = 0;
            for ref_entry in reference {
                if matches!(ref_entry, Entry::Eod | Entry::Deleted(_)) {
                    continue;
                }
                let name = ref_entry.name().to_string();
                match own.iter_mut().find(|e| e.name() == name) {
                    Some(Entry::Dir(own_dir)) => {
                        if let Entry::Dir(ref_dir) = ref_entry {
                            added += recurse(&mut own_dir.children, &ref_dir.children);
                        }
                    }
                    Some(_) => {}
                    None => {
                        own.push(Entry::Deleted(entry::DeletedEntry {
                            name,
                            removed_kind: ref_entry.signature_base(),
                            mtime: ref_entry
                                .meta()
                                .map(|m| m.mtime.clone())
                                .unwrap_or_default(),
                        }));
                        added += 1;
                    }
                }
            }
            added
        }
        if self.early_release {
            return Err(Error::misuse(
                "placement operation on a catalogue flagged for early memory release",
            ));
        }
        Ok(recurse(&mut self.root, &reference.root))
    }

    /// For every entry present in `reference` and absent here, clones it
    /// with its data demoted to not-saved. Used when a backup stops
    /// early so the catalogue still describes the unvisited files.
    pub fn update_absent_with(&mut self, reference: &Catalogue) -> Result<u64> {
        fn demote(entry: &Entry) -> Option<Entry> {
            match entry {
                Entry::Dir(d) => Some(Entry::Dir(DirEntry {
                    name: d.name.clone(),
                    meta: d.meta.demoted(),
                    children: d.children.iter().filter_map(demote).collect(),
                    recursive_changed: false,
                })),
                Entry::File(f) => {
                    let mut data = f.data.clone();
                    data.offset = Bigint::zero();
                    data.stored_size = Bigint::zero();
                    data.delta_sig = None;
                    Some(Entry::File(entry::FileEntry {
                        name: f.name.clone(),
                        meta: f.meta.demoted(),
                        data,
                    }))
                }
                Entry::Symlink(s) => Some(Entry::Symlink(entry::SymlinkEntry {
                    name: s.name.clone(),
                    meta: s.meta.demoted(),
                    target: s.target.clone(),
                })),
                Entry::CharDev(n) => Some(Entry::CharDev(demote_node(n))),
                Entry::BlockDev(n) => Some(Entry::BlockDev(demote_node(n))),
                Entry::Pipe(p) => Some(Entry::Pipe(entry::SpecialEntry {
                    name: p.name.clone(),
                    meta: p.meta.demoted(),
                })),
                Entry::Socket(p) => Some(Entry::Socket(entry::SpecialEntry {
                    name: p.name.clone(),
                    meta: p.meta.demoted(),
                })),
                // hard links degrade to their underlying inode
                Entry::HardLinkRef(m) => demote(&m.holder.borrow().inner).map(|mut e| {
                    set_name(&mut e, &m.name);
                    e
                }),
                Entry::Deleted(_)
                | Entry::Eod
                | Entry::Ignored(_)
                | Entry::IgnoredDir(_) => None,
            }
        }
        fn demote_node(n: &entry::NodeEntry) -> entry::NodeEntry {
            entry::NodeEntry {
                name: n.name.clone(),
                meta: n.meta.demoted(),
                major: n.major.clone(),
                minor: n.minor.clone(),
            }
        }
        fn set_name(e: &mut Entry, name: &str) {
            match e {
                Entry::File(f) => f.name = name.to_string(),
                Entry::Symlink(s) => s.name = name.to_string(),
                Entry::CharDev(n) | Entry::BlockDev(n) => n.name = name.to_string(),
                Entry::Pipe(p) | Entry::Socket(p) => p.name = name.to_string(),
                _ => {}
            }
        }
        fn recurse(own: &mut Vec<Entry>, reference: &[Entry]) -> u64 {
            let mut added = 0;
            for ref_entry in reference {
                if matches!(ref_entry, Entry::Eod | Entry::Deleted(_)) {
                    continue;
                }
                let name = ref_entry.name().to_string();
                match own.iter_mut().find(|e| e.name() == name) {
                    Some(Entry::Dir(own_dir)) => {
                        if let Entry::Dir(ref_dir) = ref_entry {
                            added += recurse(&mut own_dir.children, &ref_dir.children);
                        }
                    }
                    Some(_) => {}
                    None => {
                        if let Some(clone) = demote(ref_entry) {
                            let mut count = 1;
                            if let Entry::Dir(d) = &clone {
                                count += count_tree(&d.children);
                            }
                            own.push(clone);
                            added += count;
                        }
                    }
                }
            }
            added
        }
        fn count_tree(children: &[Entry]) -> u64 {
            children
                .iter()
                .map(|c| match c {
                    Entry::Dir(d) => 1 + count_tree(&d.children),
                    _ => 1,
                })
                .sum()
        }
        if self.early_release {
            return Err(Error::misuse(
                "placement operation on a catalogue flagged for early memory release",
            ));
        }
        Ok(recurse(&mut self.root, &reference.root))
    }

    /// Copies delta signature records from matching entries of
    /// `reference` into entries here that lack one.
    pub fn transfer_delta_signatures(&mut self, reference: &Catalogue) -> u64 {
        fn recurse(own: &mut Vec<Entry>, reference: &[Entry]) -> u64 {
            let mut moved = 0;
            for entry in own.iter_mut() {
                let name = entry.name().to_string();
                let matching = reference.iter().find(|e| e.name() == name);
                match (entry, matching) {
                    (Entry::Dir(own_dir), Some(Entry::Dir(ref_dir))) => {
                        moved += recurse(&mut own_dir.children, &ref_dir.children);
                    }
                    (Entry::File(own_file), Some(Entry::File(ref_file))) => {
                        if own_file.data.delta_sig.is_none() {
                            if let Some(sig) = &ref_file.data.delta_sig {
                                own_file.data.delta_sig = Some(sig.clone());
                                moved += 1;
                            }
                        }
                    }
                    _ => {}
                }
            }
            moved
        }
        recurse(&mut self.root, &reference.root)
    }

    // ---- serialization ----

    /// Serializes the catalogue: data name, root path, then the entry
    /// stream closed by a final end-of-directory.
    pub fn dump(&self, f: &mut dyn Stream, mode: DumpMode) -> Result<()> {
        fn recurse(
            children: &[Entry],
            f: &mut dyn Stream,
            mode: DumpMode,
            dumped: &mut HashSet<u64>,
        ) -> Result<()> {
            for child in children {
                if !child.is_serializable() {
                    continue;
                }
                child.dump(f, mode, dumped)?;
                if let Entry::Dir(d) = child {
                    recurse(&d.children, f, mode, dumped)?;
                    Entry::Eod.dump(f, mode, dumped)?;
                }
            }
            Ok(())
        }
        self.data_name.dump(f)?;
        let in_place = self
            .in_place
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        write_lstring(f, in_place.as_bytes())?;
        let mut dumped = HashSet::new();
        recurse(&self.root, f, mode, &mut dumped)?;
        Entry::Eod.dump(f, mode, &mut dumped)
    }

    /// Reads back a catalogue written by `dump`.
    pub fn read(f: &mut dyn Stream, mode: DumpMode) -> Result<Self> {
        let data_name = Label::read(f)?;
        let in_place = read_lstring(f)?;
        let mut cat = Self::new(data_name);
        if !in_place.is_empty() {
            cat.in_place = Some(PathBuf::from(
                String::from_utf8_lossy(&in_place).into_owned(),
            ));
        }
        let mut tags: HashMap<u64, entry::HolderRef> = HashMap::new();
        let mut depth = 0usize;
        let mut max_tag = 0u64;
        loop {
            let entry = Entry::read(f, mode, &mut tags)?;
            match &entry {
                Entry::Eod => {
                    if depth == 0 {
                        break;
                    }
                    depth -= 1;
                }
                Entry::Dir(_) => depth += 1,
                Entry::HardLinkRef(m) => {
                    max_tag = max_tag.max(m.holder.borrow().tag);
                }
                _ => {}
            }
            cat.add(entry)?;
        }
        cat.next_tag = max_tag + 1;
        Ok(cat)
    }

    // ---- listings ----

    /// Walks the tree producing one `ListEntry` per entry.
    pub fn list(
        &self,
        style: ListStyle,
        locator: Option<&dyn Fn(&Bigint, &Bigint) -> String>,
        out: &mut dyn FnMut(&str),
    ) {
        if style == ListStyle::Xml {
            out("<?xml version=\"1.0\" ?>");
            out("<Catalog>");
        }
        self.list_level(&self.root, "", 0, style, locator, out);
        if style == ListStyle::Xml {
            out("</Catalog>");
        }
    }

    fn list_level(
        &self,
        children: &[Entry],
        prefix: &str,
        depth: usize,
        style: ListStyle,
        locator: Option<&dyn Fn(&Bigint, &Bigint) -> String>,
        out: &mut dyn FnMut(&str),
    ) {
        for child in children {
            if !child.is_serializable() {
                continue;
            }
            let info = self.describe(child, prefix, locator);
            match style {
                ListStyle::Plain => out(&format!(
                    "{} {:o} {:>10} {:>12} {}{}",
                    status_char(info.status),
                    info.perm,
                    info.size,
                    info.mtime,
                    info.path,
                    info.slices
                        .as_ref()
                        .map(|s| format!("\t[{s}]"))
                        .unwrap_or_default(),
                )),
                ListStyle::Tree => out(&format!(
                    "{}{} {}{}",
                    "   ".repeat(depth),
                    info.kind,
                    child.name(),
                    info.slices
                        .as_ref()
                        .map(|s| format!("\t[{s}]"))
                        .unwrap_or_default(),
                )),
                ListStyle::Xml => out(&xml_line(child, &info, depth + 1)),
            }
            if let Entry::Dir(d) = child {
                let sub = if prefix.is_empty() {
                    d.name.clone()
                } else {
                    format!("{prefix}/{}", d.name)
                };
                self.list_level(&d.children, &sub, depth + 1, style, locator, out);
                if style == ListStyle::Xml {
                    out(&format!("{}</Directory>", "  ".repeat(depth + 1)));
                }
            }
        }
    }

    fn describe(
        &self,
        entry: &Entry,
        prefix: &str,
        locator: Option<&dyn Fn(&Bigint, &Bigint) -> String>,
    ) -> ListEntry {
        let path = if prefix.is_empty() {
            entry.name().to_string()
        } else {
            format!("{prefix}/{}", entry.name())
        };
        let (perm, mtime) = entry
            .meta()
            .map(|m| (m.perm, m.mtime.clone()))
            .unwrap_or((0, Bigint::zero()));
        let slices = match (entry, locator) {
            (Entry::File(f), Some(locate)) if !f.data.stored_size.is_zero() => {
                Some(locate(&f.data.offset, &f.data.stored_size))
            }
            _ => None,
        };
        let crc = match entry {
            Entry::File(f) => f.data.crc.as_ref().map(|c| c.to_string()),
            _ => None,
        };
        ListEntry {
            path,
            kind: entry.signature_base() as char,
            status: entry.status(),
            size: entry.listed_size(),
            mtime,
            perm,
            crc,
            slices,
        }
    }
}

const EMPTY: &[Entry] = &[];

fn status_char(status: SavedStatus) -> char {
    match status {
        SavedStatus::Saved => '*',
        SavedStatus::NotSaved => ' ',
        SavedStatus::Fake => '~',
        SavedStatus::Delta => '+',
        SavedStatus::InodeOnly => 'm',
        SavedStatus::Removed => '-',
    }
}

fn xml_line(entry: &Entry, info: &ListEntry, depth: usize) -> String {
    let indent = "  ".repeat(depth);
    let name = entry.name();
    match entry {
        Entry::Dir(_) => format!("{indent}<Directory name=\"{name}\">"),
        Entry::File(_) => format!(
            "{indent}<File name=\"{name}\" size=\"{}\" stored=\"{}\" />",
            info.size,
            status_char(info.status),
        ),
        Entry::Symlink(s) => {
            format!("{indent}<Symlink name=\"{name}\" target=\"{}\" />", s.target)
        }
        Entry::Deleted(_) => format!("{indent}<Removed name=\"{name}\" />"),
        _ => format!("{indent}<Node name=\"{name}\" kind=\"{}\" />", info.kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::entry::EaStatus;
    use crate::catalogue::entry::FileData;
    use crate::catalogue::entry::FileEntry;
    use crate::catalogue::entry::InodeMeta;
    use crate::catalogue::entry::SymlinkEntry;
    use crate::stream::memory::MemoryStream;

    fn meta() -> InodeMeta {
        InodeMeta {
            perm: 0o755,
            mtime: Bigint::from(1_700_000_000u64),
            ..Default::default()
        }
    }

    fn dir(name: &str) -> Entry {
        Entry::Dir(DirEntry {
            name: name.to_string(),
            meta: meta(),
            children: Vec::new(),
            recursive_changed: false,
        })
    }

    fn file(name: &str, size: u64) -> Entry {
        Entry::File(FileEntry {
            name: name.to_string(),
            meta: meta(),
            data: FileData {
                original_size: Bigint::from(size),
                stored_size: Bigint::from(size),
                ..Default::default()
            },
        })
    }

    /// root/a, root/sub/{b,c}
    fn sample() -> Catalogue {
        let mut cat = Catalogue::new(Label::generate());
        cat.add(file("a", 100)).unwrap();
        cat.add(dir("sub")).unwrap();
        cat.add(file("b", 0)).unwrap();
        cat.add(Entry::Symlink(SymlinkEntry {
            name: "c".to_string(),
            meta: meta(),
            target: "../a".to_string(),
        }))
        .unwrap();
        cat.add(Entry::Eod).unwrap();
        cat
    }

    #[test]
    fn add_and_lookup() {
        let cat = sample();
        assert!(matches!(cat.lookup("a"), Some(Entry::File(_))));
        assert!(matches!(cat.lookup("sub/c"), Some(Entry::Symlink(_))));
        assert!(cat.lookup("sub/zz").is_none());
        assert_eq!(cat.get_children_of("sub").unwrap().len(), 2);
        assert!(cat.get_children_of("a").is_err());
    }

    #[test]
    fn cursor_walks_preorder_with_eods() {
        let mut cat = sample();
        cat.reset_read();
        let mut names = Vec::new();
        while let Some(step) = cat.read_next() {
            match step {
                CatStep::Entry(p) => {
                    names.push(cat.entry_at(&p).unwrap().name().to_string())
                }
                CatStep::Eod => names.push("<eod>".to_string()),
            }
        }
        assert_eq!(names, vec!["a", "sub", "b", "c", "<eod>"]);
    }

    #[test]
    fn subtree_cursor_closes_back_to_root() {
        let mut cat = sample();
        cat.reset_read_subtree("sub/b").unwrap();
        let mut steps = Vec::new();
        while let Some(step) = cat.read_next() {
            steps.push(match step {
                CatStep::Entry(p) => cat.entry_at(&p).unwrap().name().to_string(),
                CatStep::Eod => "<eod>".to_string(),
            });
        }
        assert_eq!(steps, vec!["sub", "b", "<eod>"]);
    }

    #[test]
    fn skip_to_parent() {
        let mut cat = sample();
        cat.reset_read();
        // read "a", then enter "sub"
        cat.read_next();
        cat.read_next();
        cat.skip_read_to_parent_dir();
        assert!(cat.read_next().is_none());
    }

    #[test]
    fn dump_read_identical_listing(){
        let cat = sample();
        let mut m = MemoryStream::new();
        cat.dump(&mut m, DumpMode::Direct).unwrap();
        m.skip(&Bigint::zero()).unwrap();
        let back = Catalogue::read(&mut m, DumpMode::Direct).unwrap();
        assert_eq!(back.data_name, cat.data_name);
        assert_eq!(back.stats(), cat.stats());
        let mut a = Vec::new();
        cat.list(ListStyle::Plain, None, &mut |l| a.push(l.to_string()));
        let mut b = Vec::new();
        back.list(ListStyle::Plain, None, &mut |l| b.push(l.to_string()));
        assert_eq!(a, b);
    }

    #[test]
    fn destroyed_markers_idempotent() {
        let reference = sample();
        let mut cat = Catalogue::new(Label::generate());
        cat.add(file("a", 100)).unwrap();
        // "sub" is absent here
        let added = cat.update_destroyed_with(&reference).unwrap();
        assert_eq!(added, 1);
        let again = cat.update_destroyed_with(&reference).unwrap();
        assert_eq!(again, 0);
        assert!(matches!(cat.lookup("sub"), Some(Entry::Deleted(_))));
    }

    #[test]
    fn absent_entries_cloned_not_saved() {
        let reference = sample();
        let mut cat = Catalogue::new(Label::generate());
        cat.add(file("a", 100)).unwrap();
        let added = cat.update_absent_with(&reference).unwrap();
        // "sub" plus its two children
        assert_eq!(added, 3);
        match cat.lookup("sub/b") {
            Some(Entry::File(f)) => {
                assert_eq!(f.meta.status, SavedStatus::NotSaved);
                assert!(f.data.stored_size.is_zero());
            }
            other => panic!("wrong entry: {other:?}"),
        }
        // demotion drops full attribute data
        let mut with_ea = sample();
        if let Some(Entry::File(f)) = with_ea.entry_at_mut(&[0]) {
            f.meta.ea = EaStatus::Full;
        }
        let mut empty = Catalogue::new(Label::generate());
        empty.update_absent_with(&with_ea).unwrap();
        match empty.lookup("a") {
            Some(Entry::File(f)) => assert_eq!(f.meta.ea, EaStatus::Partial),
            other => panic!("wrong entry: {other:?}"),
        }
    }

    #[test]
    fn delta_signatures_transfer_to_matching_entries() {
        use crate::crc::Crc;
        use crate::delta::SigRecord;

        let mut reference = sample();
        if let Some(Entry::File(f)) = reference.entry_at_mut(&[0]) {
            let crc = Crc::with_width(2);
            f.data.delta_sig = Some(SigRecord::crc_only(crc.clone(), crc));
        }
        let mut cat = sample();
        let moved = cat.transfer_delta_signatures(&reference);
        assert_eq!(moved, 1);
        match cat.lookup("a") {
            Some(Entry::File(f)) => assert!(f.data.delta_sig.is_some()),
            other => panic!("wrong entry: {other:?}"),
        }
        // a second pass finds nothing left to move
        assert_eq!(cat.transfer_delta_signatures(&reference), 0);
    }

    #[test]
    fn early_release_forbids_children() {
        let mut cat = sample();
        cat.set_early_release();
        assert!(cat.get_children_of("sub").is_err());
        cat.release_entry(&[0]).unwrap();
        assert!(matches!(cat.entry_at(&[0]), Some(Entry::Ignored(_))));
    }
}
