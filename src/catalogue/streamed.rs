//! Escape-driven catalogue: rebuilding the entry tree by scanning the
//! marks of a sequentially written archive.

use crate::catalogue::entry::DumpMode;
use crate::catalogue::entry::Entry;
use crate::catalogue::entry::HolderRef;
use crate::catalogue::Catalogue;
use crate::error::Result;
use crate::escape::MarkKind;
use crate::label::Label;
use crate::stream::Stream;
use std::collections::HashMap;

/// Result of draining a sequential stream.
pub struct DrainOutcome {
    pub catalogue: Catalogue,
    /// The scan reached the final catalogue mark; the authoritative
    /// catalogue follows in the stream.
    pub reached_tail: bool,
    /// Inline entries read before the scan stopped.
    pub entries_seen: u64,
}

/// Walks the escape marks of `f` from its current position, reading
/// every inline entry and rebuilding the tree. Stops at the catalogue
/// mark or at the end of the stream, whichever comes first; a truncated
/// archive yields the partial tree.
pub fn drain(f: &mut dyn Stream, data_name: Label) -> Result<DrainOutcome> {
    let mut catalogue = Catalogue::new(data_name);
    let mut tags: HashMap<u64, HolderRef> = HashMap::new();
    let mut depth = 0usize;
    let mut seen = 0u64;
    let reached_tail = loop {
        // a scan error past the sane part of the stream ends the walk
        // with whatever was gathered
        let mark = match f.next_escape_mark() {
            Ok(m) => m,
            Err(_) => break false,
        };
        match mark {
            Some(MarkKind::CatalogueStart) => break true,
            Some(MarkKind::FileStart) => {
                let entry = match Entry::read(f, DumpMode::Sequential, &mut tags) {
                    Ok(e) => e,
                    // a torn entry ends the scan, what was read stays
                    Err(_) => break false,
                };
                match &entry {
                    Entry::Eod => {
                        if depth == 0 {
                            continue;
                        }
                        depth -= 1;
                    }
                    Entry::Dir(_) => depth += 1,
                    _ => {}
                }
                seen += 1;
                catalogue.add(entry)?;
            }
            // payload delimiters without inline entries
            Some(_) => continue,
            None => break false,
        }
    };
    catalogue.close_all_dirs();
    Ok(DrainOutcome {
        catalogue,
        reached_tail,
        entries_seen: seen,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bigint::Bigint;
    use crate::catalogue::entry::DirEntry;
    use crate::escape::EscapeStream;
    use crate::catalogue::entry::FileData;
    use crate::catalogue::entry::FileEntry;
    use crate::catalogue::entry::InodeMeta;
    use crate::stream::memory::MemoryStream;
    use crate::stream::Stream;
    use std::collections::HashSet;

    fn file(name: &str, size: u64) -> Entry {
        Entry::File(FileEntry {
            name: name.to_string(),
            meta: InodeMeta::default(),
            data: FileData {
                original_size: Bigint::from(size),
                ..Default::default()
            },
        })
    }

    fn write_inline(esc: &mut EscapeStream, entry: &Entry) {
        esc.add_mark(MarkKind::FileStart).unwrap();
        let mut dumped = HashSet::new();
        entry.dump(esc, DumpMode::Sequential, &mut dumped).unwrap();
    }

    #[test]
    fn rebuilds_tree_from_marks() {
        let mut esc = EscapeStream::new(Box::new(MemoryStream::new()));
        write_inline(&mut esc, &file("a", 10));
        esc.write(b"body of a").unwrap();
        write_inline(
            &mut esc,
            &Entry::Dir(DirEntry {
                name: "sub".to_string(),
                meta: InodeMeta::default(),
                children: Vec::new(),
                recursive_changed: false,
            }),
        );
        write_inline(&mut esc, &file("b", 0));
        write_inline(&mut esc, &Entry::Eod);
        esc.add_mark(MarkKind::CatalogueStart).unwrap();
        esc.write(b"catalogue dump would follow").unwrap();
        esc.sync_write().unwrap();
        let mut below = esc.into_inner().unwrap();
        below.skip(&Bigint::zero()).unwrap();

        let mut esc = EscapeStream::new(below);
        let outcome = drain(&mut esc, Label::generate()).unwrap();
        assert!(outcome.reached_tail);
        assert_eq!(outcome.entries_seen, 4);
        assert!(outcome.catalogue.lookup("a").is_some());
        assert!(outcome.catalogue.lookup("sub/b").is_some());
    }

    #[test]
    fn truncated_stream_yields_partial_tree() {
        let mut esc = EscapeStream::new(Box::new(MemoryStream::new()));
        write_inline(&mut esc, &file("kept", 1));
        esc.write(b"payload").unwrap();
        esc.sync_write().unwrap();
        let mut below = esc.into_inner().unwrap();
        // chop the stream mid-payload
        let mut bytes = Vec::new();
        below.skip(&Bigint::zero()).unwrap();
        let mut buf = [0u8; 1024];
        let n = below.read(&mut buf).unwrap();
        bytes.extend_from_slice(&buf[..n]);
        bytes.truncate(bytes.len().saturating_sub(3));

        let mut esc = EscapeStream::new(Box::new(MemoryStream::with_contents(bytes)));
        let outcome = drain(&mut esc, Label::generate()).unwrap();
        assert!(!outcome.reached_tail);
        assert!(outcome.catalogue.lookup("kept").is_some());
    }
}
