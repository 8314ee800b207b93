//! The coordinator: opens, creates and transforms archives, driving the
//! layer stack, the catalogue and the filesystem collaborators.

pub mod header;

use crate::bigint::Bigint;
use crate::catalogue::entry::DumpMode;
use crate::catalogue::entry::EaStatus;
use crate::catalogue::entry::Entry;
use crate::catalogue::entry::FileEntry;
use crate::catalogue::entry::HolderRef;
use crate::catalogue::entry::InodeHolder;
use crate::catalogue::entry::MirageEntry;
use crate::catalogue::entry::SavedStatus;
use crate::catalogue::streamed;
use crate::catalogue::CatStep;
use crate::catalogue::Catalogue;
use crate::catalogue::ListStyle;
use crate::compress::CompressStream;
use crate::compress::CompressionAlgo;
use crate::crc::Crc;
use crate::crypto::elastic_size_before;
use crate::crypto::write_elastic;
use crate::crypto::CipherAlgo;
use crate::crypto::CryptoStream;
use crate::crypto::KdfParams;
use crate::crypto::DEFAULT_CRYPTO_BLOCK;
use crate::crypto::DEFAULT_ELASTIC_SIZE;
use crate::delta;
use crate::delta::SigRecord;
use crate::delta::Signature;
use crate::delta::DEFAULT_SIG_BLOCK;
use crate::error::Error;
use crate::error::Result;
use crate::error::MSG_ISOLATED_CONTENTS;
use crate::error::MSG_NOT_EXPLOITABLE;
use crate::error::MSG_REF_NOT_EXPLOITABLE;
use crate::escape::EscapeStream;
use crate::escape::MarkKind;
use crate::fs::ComparisonFields;
use crate::fs::FilesystemBackup;
use crate::fs::FilesystemDiff;
use crate::fs::FilesystemRestore;
use crate::hook::HookCall;
use crate::hook::HookContext;
use crate::hook::SliceHook;
use crate::label::Label;
use crate::pile::LayerRole;
use crate::pile::Pile;
use crate::slice::hash::HashAlgo;
use crate::slice::layout::SliceLayout;
use crate::slice::single::SingleSlice;
use crate::slice::SliceFileSet;
use crate::slice::SliceReadOptions;
use crate::slice::SliceReader;
use crate::slice::SliceWriteOptions;
use crate::slice::SliceWriter;
use crate::statistics::Statistics;
use crate::stream::cache::CacheStream;
use crate::stream::cache::DEFAULT_CACHE_SIZE;
use crate::stream::copy_stream;
use crate::stream::file::FileStream;
use crate::stream::memory::MemoryStream;
use crate::stream::read_exact;
use crate::stream::thread::ThreadStream;
use crate::stream::trunk::TrunkStream;
use crate::stream::Mode;
use crate::stream::SharedStream;
use crate::stream::SkipDirection;
use crate::stream::Stream;
use crate::user::Ui;
use header::Terminator;
use header::VersionRecord;
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Cooperative cancellation token checked at entry boundaries.
#[derive(Default)]
pub struct Cancellation {
    state: AtomicU8,
}

impl Cancellation {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Finish the entry in progress, append the abortion tail and close
    /// cleanly.
    pub fn request_delayed(&self) {
        let _ = self
            .state
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Unwind immediately, leaving whatever was written as-is.
    pub fn request_immediate(&self) {
        self.state.store(2, Ordering::SeqCst);
    }

    fn immediate(&self) -> bool {
        self.state.load(Ordering::SeqCst) == 2
    }

    fn delayed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == 1
    }
}

/// Per-side overwrite decision.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OverwritePolicy {
    /// What is already there wins.
    Preserve,
    /// The archive entry wins.
    #[default]
    Overwrite,
    /// The more recent of the two wins.
    PreserveNewer,
}

impl OverwritePolicy {
    /// Tells whether the incoming entry replaces what exists.
    fn replaces(self, existing_mtime: Option<&Bigint>, incoming_mtime: &Bigint) -> bool {
        match (self, existing_mtime) {
            (_, None) => true,
            (Self::Overwrite, _) => true,
            (Self::Preserve, Some(_)) => false,
            (Self::PreserveNewer, Some(existing)) => existing < incoming_mtime,
        }
    }
}

/// Separate overwrite decisions for data and attributes.
#[derive(Clone, Copy, Debug, Default)]
pub struct CritAction {
    pub data: OverwritePolicy,
    pub ea: OverwritePolicy,
}

/// Where an archive's slices live.
#[derive(Clone, Debug)]
pub struct ArchiveLocation {
    pub dir: PathBuf,
    pub base: String,
    pub extension: String,
    pub min_digits: usize,
}

impl ArchiveLocation {
    pub fn new(dir: &Path, base: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            base: base.to_string(),
            extension: "dar".to_string(),
            min_digits: 1,
        }
    }

    fn fileset(&self) -> SliceFileSet {
        SliceFileSet::new(&self.dir, &self.base, &self.extension, self.min_digits)
    }
}

/// Knobs of archive creation.
pub struct CreateOptions {
    pub compression: CompressionAlgo,
    pub compression_level: u8,
    pub compression_block: Option<usize>,
    pub cipher: CipherAlgo,
    pub passphrase: String,
    pub crypto_block: usize,
    pub elastic_size: usize,
    /// Zero means a single slice of unbounded size.
    pub slice_size: Bigint,
    pub first_slice_size: Option<Bigint>,
    pub slice_permission: Option<u32>,
    pub slice_ownership: Option<(i64, i64)>,
    pub allow_over: bool,
    pub warn_over: bool,
    pub hash: HashAlgo,
    pub pause_every: usize,
    pub hook: Option<Arc<dyn SliceHook + Send + Sync>>,
    /// Escape marks for sequential reading and repair.
    pub sequential_marks: bool,
    /// Offload the slice I/O to a worker thread.
    pub threaded: bool,
    /// Record a delta signature for every saved file.
    pub delta_signatures: bool,
    pub delta_sig_block: u32,
    /// Remember the backed-up root path for in-place restoration.
    pub record_in_place: bool,
    pub cancellation: Option<Arc<Cancellation>>,
    /// Called with the path of each entry once handled.
    pub progress: Option<Box<dyn Fn(&str)>>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            compression: CompressionAlgo::None,
            compression_level: 6,
            compression_block: None,
            cipher: CipherAlgo::None,
            passphrase: String::new(),
            crypto_block: DEFAULT_CRYPTO_BLOCK,
            elastic_size: DEFAULT_ELASTIC_SIZE,
            slice_size: Bigint::zero(),
            first_slice_size: None,
            slice_permission: None,
            slice_ownership: None,
            allow_over: true,
            warn_over: false,
            hash: HashAlgo::None,
            pause_every: 0,
            hook: None,
            sequential_marks: false,
            threaded: false,
            delta_signatures: false,
            delta_sig_block: DEFAULT_SIG_BLOCK,
            record_in_place: false,
            cancellation: None,
            progress: None,
        }
    }
}

/// Knobs of archive opening.
#[derive(Clone, Default)]
pub struct OpenOptions {
    /// Fault-tolerant reading: warn and keep going where possible.
    pub lax: bool,
    /// Read the archive front to back using its escape marks instead of
    /// the catalogue at the end.
    pub sequential: bool,
    pub passphrase: Option<String>,
    /// Offload the slice I/O to a worker thread.
    pub threaded: bool,
}

/// Knobs of extraction.
#[derive(Default)]
pub struct ExtractOptions {
    /// Restrict the operation to this subtree.
    pub subtree: Option<String>,
    /// Keep only entries whose path matches.
    pub name_filter: Option<Box<dyn Fn(&str) -> bool>>,
    pub overwrite: CritAction,
}

/// Knobs of catalogue isolation.
#[derive(Clone, Copy, Debug, Default)]
pub struct IsolateOptions {
    /// Re-embed the delta signature payloads in the isolated archive.
    pub transfer_delta_sigs: bool,
}

/// Knobs of a merge.
#[derive(Clone, Copy, Debug, Default)]
pub struct MergeOptions {
    pub policy: OverwritePolicy,
    /// Copy file bodies without recompressing them. Requires both
    /// archives and the target to share the compression setup.
    pub keep_compressed: bool,
    /// Recompute delta signatures while merging.
    pub recompute_delta_sigs: bool,
}

/// Hook wrapper that can drop the final completion script, used when the
/// user aborts so no last-slice command fires.
struct GuardedHook {
    inner: Arc<dyn SliceHook + Send + Sync>,
    final_enabled: Arc<AtomicBool>,
}

impl SliceHook for GuardedHook {
    fn execute(&self, call: &HookCall) -> Result<()> {
        if call.context == HookContext::LastSlice && !self.final_enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.execute(call)
    }
}

/// Read-only view over one file body inside the stack.
struct BoundedBody<'a> {
    inner: &'a mut dyn Stream,
    remain: Bigint,
    crc: Crc,
}

impl<'a> BoundedBody<'a> {
    fn new(inner: &'a mut dyn Stream, size: &Bigint) -> Self {
        Self {
            inner,
            remain: size.clone(),
            crc: Crc::from_size(size),
        }
    }
}

impl Stream for BoundedBody<'_> {
    fn mode(&self) -> Mode {
        Mode::Read
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.remain.is_zero() {
            return Ok(0);
        }
        let want = match self.remain.to_usize() {
            Some(r) => buf.len().min(r),
            None => buf.len(),
        };
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            return Err(Error::data("archive body shorter than recorded"));
        }
        self.remain = self.remain.sub(&Bigint::from(n))?;
        self.crc.update(&buf[..n]);
        Ok(n)
    }

    fn write(&mut self, _buf: &[u8]) -> Result<()> {
        Err(Error::misuse("body view is read-only"))
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

    fn skippable(&self, _d: SkipDirection, _a: &Bigint) -> bool {
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

/// Write-side state while an archive is being produced.
struct WriteTarget {
    pile: Pile,
    bottom: SharedStream,
    record: VersionRecord,
    sequential: bool,
    elastic: usize,
    final_hook: Option<Arc<AtomicBool>>,
    inline_tags: HashSet<u64>,
}

impl WriteTarget {
    /// Builds the full write stack and writes the leading structures.
    fn build(
        ui: &Ui,
        location: &ArchiveLocation,
        opts: &CreateOptions,
        internal_name: Label,
        slice_data_name: Label,
        ref_layout: Option<SliceLayout>,
    ) -> Result<Self> {
        let mut record = VersionRecord::new(opts.compression, opts.cipher);
        record.compression_block = Bigint::from(opts.compression_block.unwrap_or(0));
        record.tape_marks = opts.sequential_marks;
        record.ref_layout = ref_layout;
        let kdf = if opts.cipher != CipherAlgo::None {
            record.crypto_block = Bigint::from(opts.crypto_block);
            let kdf = KdfParams::generate();
            record.kdf = Some(kdf.clone());
            Some(kdf)
        } else {
            None
        };

        let final_hook = opts.hook.as_ref().map(|inner| {
            let flag = Arc::new(AtomicBool::new(true));
            (
                Arc::new(GuardedHook {
                    inner: inner.clone(),
                    final_enabled: flag.clone(),
                }) as Arc<dyn SliceHook + Send + Sync>,
                flag,
            )
        });
        let slice_opts = SliceWriteOptions {
            slice_size: if opts.slice_size.is_zero() {
                Bigint::from(u64::MAX)
            } else {
                opts.slice_size.clone()
            },
            first_slice_size: opts.first_slice_size.clone(),
            allow_over: opts.allow_over,
            warn_over: opts.warn_over,
            permission: opts.slice_permission,
            ownership: opts.slice_ownership,
            hash: opts.hash,
            pause_every: opts.pause_every,
            hook: final_hook.as_ref().map(|(h, _)| h.clone()),
        };
        let writer = SliceWriter::create(
            ui.clone(),
            location.fileset(),
            slice_opts,
            internal_name,
            slice_data_name,
        )?;
        let bottom: Box<dyn Stream> = if opts.threaded {
            // slice I/O moves to its own worker
            Box::new(ThreadStream::new(Box::new(writer)))
        } else {
            Box::new(writer)
        };
        let (for_pile, mut mine) = SharedStream::pair(bottom);
        record.dump(&mut mine)?;
        // the payload area gets its own coordinates, matching what a
        // reader will see through its bounded window
        let region_start = mine.position()?;
        let trunk = TrunkStream::new(Box::new(for_pile), region_start, None)?;

        let mut pile = Pile::new(Box::new(trunk), LayerRole::Level1);
        pile.push(LayerRole::Cache, |below| {
            Ok(Box::new(CacheStream::new(below, DEFAULT_CACHE_SIZE)?))
        })?;
        if opts.cipher != CipherAlgo::None {
            let cipher = opts.cipher;
            let pass = opts.passphrase.clone();
            let kdf = kdf.ok_or_else(|| Error::bug("cipher without derivation parameters"))?;
            let block = opts.crypto_block;
            pile.push(LayerRole::Uncyphered, move |below| {
                Ok(Box::new(CryptoStream::new(below, cipher, &pass, &kdf, block)?))
            })?;
        }
        if opts.sequential_marks {
            pile.push(LayerRole::Clear, |below| Ok(Box::new(EscapeStream::new(below))))?;
        }
        let algo = opts.compression;
        let level = opts.compression_level;
        let block = opts.compression_block;
        pile.push(LayerRole::Uncompressed, move |below| {
            Ok(Box::new(CompressStream::new(below, algo, level, block)?))
        })?;

        Ok(Self {
            pile,
            bottom: mine,
            record,
            sequential: opts.sequential_marks,
            elastic: opts.elastic_size,
            final_hook: final_hook.map(|(_, f)| f),
            inline_tags: HashSet::new(),
        })
    }

    fn dump_mode(&self) -> DumpMode {
        if self.sequential {
            DumpMode::Sequential
        } else {
            DumpMode::Direct
        }
    }

    /// Streams one file body through the stack, returning
    /// (offset, stored size, checksum of the clear bytes).
    fn write_body(
        &mut self,
        source: &mut dyn Stream,
        size_hint: &Bigint,
    ) -> Result<(Bigint, Bigint, Crc)> {
        let offset = self.pile.position()?;
        let mut crc = Crc::from_size(size_hint);
        copy_stream(source, &mut self.pile, None, Some(&mut crc))?;
        self.pile.sync_write()?;
        let stored = self.pile.position()?.sub(&offset)?;
        Ok((offset, stored, crc))
    }

    /// In sequential mode, writes the inline copy of an entry behind a
    /// mark.
    fn write_inline(&mut self, entry: &Entry) -> Result<()> {
        if !self.sequential {
            return Ok(());
        }
        self.pile.add_escape_mark(MarkKind::FileStart, false)?;
        entry.dump(&mut self.pile, DumpMode::Sequential, &mut self.inline_tags)?;
        self.pile.sync_write()
    }

    /// Disables the last-slice completion script.
    fn drop_final_hook(&self) {
        if let Some(flag) = &self.final_hook {
            flag.store(false, Ordering::SeqCst);
        }
    }

    /// Writes the whole archive tail and closes every layer.
    fn finish(mut self, catalogue: &Catalogue) -> Result<()> {
        self.pile.sync_write()?;
        if self.sequential {
            self.pile.add_escape_mark(MarkKind::CatalogueStart, false)?;
        }
        let cat_offset = self.pile.position()?;
        let mut body = MemoryStream::new();
        catalogue.dump(&mut body, self.dump_mode())?;
        let mut crc = Crc::from_size(&Bigint::from(body.size()));
        crc.update(body.contents());
        Bigint::from(body.size()).dump(&mut self.pile)?;
        self.pile.write(body.contents())?;
        crc.dump(&mut self.pile)?;
        self.pile.sync_write()?;
        self.pile.set_raw_mode(true)?;
        Terminator::write(&mut self.pile, &cat_offset)?;
        let ciphered = self.record.cipher != CipherAlgo::None;
        if ciphered {
            write_elastic(&mut self.pile, self.elastic)?;
        }
        self.pile.terminate()?;
        // clear-side tail, below the cipher
        if ciphered {
            write_elastic(&mut self.bottom, self.elastic)?;
        }
        let copy_pos = self.bottom.position()?;
        self.record.dump(&mut self.bottom)?;
        Terminator::write(&mut self.bottom, &copy_pos)?;
        self.bottom.terminate_inner()
    }

    /// Tears everything down without writing a tail. The slices written
    /// so far are left as they are.
    fn abandon(mut self) {
        self.drop_final_hook();
        let _ = self.pile.terminate();
        let _ = self.bottom.terminate_inner();
    }
}

/// An archive opened for reading, or the handle over the operations
/// producing new archives.
pub struct Archive {
    ui: Ui,
    pile: Pile,
    pub header: VersionRecord,
    pub catalogue: Catalogue,

    slice_data_name: Label,
    layout: Option<SliceLayout>,
    region_start: Bigint,
    sequential: bool,
    lax: bool,
    closed: bool,
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive").finish_non_exhaustive()
    }
}

impl Archive {
    // ---- opening ----

    /// Opens an archive from its slice files.
    pub fn open(ui: Ui, location: &ArchiveLocation, opts: OpenOptions) -> Result<Self> {
        let reader = SliceReader::open(
            ui.clone(),
            location.fileset(),
            SliceReadOptions {
                lax: opts.lax,
                by_the_end: !opts.sequential,
                hook: None,
            },
        )?;
        let layout = reader.layout().clone();
        let slice_data_name = reader.data_name();
        let bottom: Box<dyn Stream> = if opts.threaded {
            Box::new(ThreadStream::new(Box::new(reader)))
        } else {
            Box::new(reader)
        };
        Self::open_common(ui, bottom, slice_data_name, Some(layout), opts)
    }

    /// Opens an archive served by an arbitrary lower stream, a pipe or a
    /// remote helper channel, laid out as a single slice.
    pub fn open_stream(ui: Ui, bottom: Box<dyn Stream>, opts: OpenOptions) -> Result<Self> {
        let single = SingleSlice::open(bottom, &ui, opts.lax)?;
        let data_name = single.data_name();
        Self::open_common(ui, Box::new(single), data_name, None, opts)
    }

    fn open_common(
        ui: Ui,
        mut bottom: Box<dyn Stream>,
        slice_data_name: Label,
        layout: Option<SliceLayout>,
        opts: OpenOptions,
    ) -> Result<Self> {
        bottom.skip(&Bigint::zero())?;
        let header = VersionRecord::read(bottom.as_mut())?;
        let region_start = bottom.position()?;
        let passphrase = if header.cipher != CipherAlgo::None {
            match &opts.passphrase {
                Some(p) => p.clone(),
                None => ui.get_secret("Archive passphrase: ")?,
            }
        } else {
            String::new()
        };

        // bound the payload area from the tail whenever the medium can
        // seek; a pipe cannot, its marks will delimit everything
        let seekable = bottom.skippable(SkipDirection::Backward, &Bigint::from(1u64));
        let mut region_size = None;
        let mut tail_found = false;
        if seekable {
            match Self::locate_tail(bottom.as_mut(), &header, &region_start) {
                Ok(end) => {
                    region_size = Some(end.sub(&region_start)?);
                    tail_found = true;
                }
                Err(_) if opts.sequential => {}
                Err(e) if opts.lax => {
                    ui.message(&format!(
                        "archive tail is unreadable ({e}), walking the archive for a catalogue"
                    ));
                }
                Err(e) => return Err(e),
            }
        } else if !opts.sequential {
            return Err(Error::misuse(
                "this medium cannot seek, only a sequential read can work on it",
            ));
        }

        let mut pile = Pile::new(
            Box::new(TrunkStream::new(bottom, region_start.clone(), region_size)?),
            LayerRole::Level1,
        );
        pile.push(LayerRole::Cache, |below| {
            Ok(Box::new(CacheStream::new(below, DEFAULT_CACHE_SIZE)?))
        })?;
        if header.cipher != CipherAlgo::None {
            let cipher = header.cipher;
            let kdf = header
                .kdf
                .clone()
                .ok_or_else(|| Error::range("ciphered archive without derivation parameters"))?;
            let block = header
                .crypto_block
                .to_usize()
                .filter(|b| *b >= crate::crypto::MIN_CRYPTO_BLOCK)
                .unwrap_or(DEFAULT_CRYPTO_BLOCK);
            let pass = passphrase.clone();
            pile.push(LayerRole::Uncyphered, move |below| {
                Ok(Box::new(CryptoStream::new(below, cipher, &pass, &kdf, block)?))
            })?;
        }
        if header.tape_marks {
            pile.push(LayerRole::Clear, |below| Ok(Box::new(EscapeStream::new(below))))?;
        }
        let algo = header.compression;
        let block = header.compression_block.to_usize().filter(|b| *b > 0);
        pile.push(LayerRole::Uncompressed, move |below| {
            Ok(Box::new(CompressStream::new(below, algo, 6, block)?))
        })?;

        let mut archive = Self {
            ui,
            pile,
            header,
            catalogue: Catalogue::new(slice_data_name),
            slice_data_name,
            layout,
            region_start,
            sequential: opts.sequential || !tail_found,
            lax: opts.lax,
            closed: false,
        };
        archive.load_catalogue(tail_found && !opts.sequential)?;
        Ok(archive)
    }

    /// Finds the end of the payload region from the archive tail.
    /// Leaves the lower stream wherever.
    fn locate_tail(
        bottom: &mut dyn Stream,
        header: &VersionRecord,
        region_start: &Bigint,
    ) -> Result<Bigint> {
        bottom.skip_to_eof()?;
        let (copy_pos, _) = Terminator::read_before(bottom)?;
        if copy_pos < *region_start {
            return Err(Error::data("archive tail points before the payload area"));
        }
        bottom.skip(&copy_pos)?;
        let _copy = VersionRecord::read(bottom)?;
        if header.cipher != CipherAlgo::None {
            bottom.skip(&copy_pos)?;
            let elastic = elastic_size_before(bottom)?;
            copy_pos.sub(&Bigint::from(elastic))
        } else {
            Ok(copy_pos)
        }
    }

    fn load_catalogue(&mut self, direct: bool) -> Result<()> {
        if direct {
            match self.load_catalogue_direct() {
                Ok(()) => return Ok(()),
                Err(e) if self.lax => {
                    self.ui.message(&format!(
                        "catalogue at the end of the archive is unreadable ({e})"
                    ));
                    if !self.header.tape_marks {
                        return Err(e);
                    }
                    self.ui
                        .message("walking the escape marks to rebuild the catalogue");
                    self.sequential = true;
                }
                Err(e) => return Err(e),
            }
        }
        self.load_catalogue_sequential()
    }

    fn load_catalogue_direct(&mut self) -> Result<()> {
        self.pile.set_raw_mode(true)?;
        self.pile.skip_to_eof()?;
        let mut end = self.pile.position()?;
        if self.header.cipher != CipherAlgo::None {
            let elastic = elastic_size_before(&mut self.pile)?;
            end = end.sub(&Bigint::from(elastic))?;
            self.pile.skip(&end)?;
        }
        let (cat_offset, _) = Terminator::read_before(&mut self.pile)?;
        self.pile.skip(&cat_offset)?;
        self.pile.set_raw_mode(false)?;
        self.catalogue = Self::read_catalogue_here(&mut self.pile, DumpMode::Direct)?;
        Ok(())
    }

    fn load_catalogue_sequential(&mut self) -> Result<()> {
        if !self.header.tape_marks {
            return Err(Error::misuse(
                "sequential reading requested on an archive without escape marks",
            ));
        }
        self.pile.set_raw_mode(false)?;
        self.pile.skip(&Bigint::zero())?;
        let outcome = streamed::drain(&mut self.pile, self.slice_data_name)?;
        if outcome.reached_tail {
            match Self::read_catalogue_here(&mut self.pile, DumpMode::Sequential) {
                Ok(cat) => {
                    self.catalogue = cat;
                    return Ok(());
                }
                Err(e) if self.lax => self.ui.message(&format!(
                    "final catalogue is unreadable ({e}), using the {} entries rebuilt from the marks",
                    outcome.entries_seen
                )),
                Err(e) => return Err(e),
            }
        } else if !self.lax {
            return Err(Error::data("no catalogue found in the archive"));
        } else {
            self.ui.message(&format!(
                "archive is truncated, {} entries could be rebuilt from the marks",
                outcome.entries_seen
            ));
        }
        self.catalogue = outcome.catalogue;
        Ok(())
    }

    /// Reads a length-prefixed, checksummed catalogue at the current
    /// position of `f`.
    fn read_catalogue_here(f: &mut dyn Stream, mode: DumpMode) -> Result<Catalogue> {
        let len = Bigint::read(f)?
            .to_usize()
            .ok_or_else(|| Error::range("catalogue size out of bounds"))?;
        let mut bytes = vec![0u8; len];
        read_exact(f, &mut bytes)?;
        let stored = Crc::read(f)?;
        let mut crc = Crc::with_width(stored.width());
        crc.update(&bytes);
        if !crc.same_as(&stored) {
            return Err(Error::data("corrupted catalogue"));
        }
        let mut m = MemoryStream::with_contents(bytes);
        Catalogue::read(&mut m, mode)
    }

    // ---- queries ----

    /// Tells whether the archive only carries the catalogue of another
    /// archive.
    pub fn is_isolated(&self) -> bool {
        self.catalogue.data_name != self.slice_data_name
    }

    pub fn data_name(&self) -> Label {
        self.catalogue.data_name
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::misuse(MSG_NOT_EXPLOITABLE))
        } else {
            Ok(())
        }
    }

    fn check_has_data(&self) -> Result<()> {
        if self.is_isolated() {
            Err(Error::misuse(MSG_REF_NOT_EXPLOITABLE))
        } else {
            Ok(())
        }
    }

    /// Closes the stack. Further operations raise a misuse error.
    pub fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.pile.terminate()?;
        }
        Ok(())
    }

    /// Human-readable archive overview.
    pub fn summary(&self) -> Vec<String> {
        let stats = self.catalogue.stats();
        let mut lines = vec![
            format!("archive format        : {}", self.header.edition),
            format!("compression algorithm : {:?}", self.header.compression),
            format!("cipher                : {:?}", self.header.cipher),
            format!("sequential marks      : {}", self.header.tape_marks),
            format!("catalogue from marks  : {}", self.sequential),
            format!("data name             : {}", self.catalogue.data_name),
            format!("directories           : {}", stats.dirs),
            format!("plain files           : {}", stats.files),
            format!("symbolic links        : {}", stats.symlinks),
            format!("hard link references  : {}", stats.hard_links),
            format!("deleted markers       : {}", stats.deleted),
            format!("saved entries         : {}", stats.saved),
        ];
        if self.is_isolated() {
            lines.push(MSG_ISOLATED_CONTENTS.to_string());
        }
        lines
    }

    /// Produces the archive listing through `out`.
    pub fn list(&mut self, style: ListStyle, with_slicing: bool, out: &mut dyn FnMut(&str)) -> Result<()> {
        self.check_open()?;
        let layout = self
            .layout
            .clone()
            .or_else(|| self.header.ref_layout.clone());
        let region_start = self.region_start.clone();
        let ciphered = self.header.cipher != CipherAlgo::None;
        let crypto_block = self
            .header
            .crypto_block
            .to_u64()
            .filter(|b| *b > 0)
            .unwrap_or(DEFAULT_CRYPTO_BLOCK as u64);
        let cipher = self.header.cipher;
        let locate = layout.filter(|_| with_slicing).map(|layout| {
            move |offset: &Bigint, size: &Bigint| -> String {
                let to_slice_coord = |clear: &Bigint| -> Bigint {
                    if !ciphered {
                        return &region_start + clear;
                    }
                    // clear offsets map to whole crypto blocks below
                    let block_size = Bigint::from(crypto_block);
                    let ciphered_block = match cipher {
                        CipherAlgo::Aes256 => (crypto_block / 16 + 1) * 16,
                        _ => crypto_block,
                    };
                    match clear.div_rem(&block_size) {
                        Ok((block, _)) => {
                            &region_start + &block.mul(&Bigint::from(ciphered_block))
                        }
                        Err(_) => region_start.clone(),
                    }
                };
                let first = to_slice_coord(offset);
                let last_byte = match (offset + size).checked_sub(&Bigint::from(1u64)) {
                    Some(l) if *size > Bigint::zero() => l,
                    _ => offset.clone(),
                };
                let last = to_slice_coord(&last_byte);
                let mut range = crate::range::Range::new();
                if let (Ok(a), Ok(b)) = (layout.slice_of(&first), layout.slice_of(&last)) {
                    range.add_interval(Bigint::from(a), Bigint::from(b));
                }
                range.to_string()
            }
        });
        match &locate {
            Some(l) => self
                .catalogue
                .list(style, Some(l as &dyn Fn(&Bigint, &Bigint) -> String), out),
            None => self.catalogue.list(style, None, out),
        }
        Ok(())
    }

    // ---- create ----

    /// Backs up a filesystem tree into a new archive, full or
    /// differential depending on the presence of a reference.
    pub fn create(
        ui: Ui,
        reader: &mut dyn FilesystemBackup,
        fs_root: &Path,
        location: &ArchiveLocation,
        mut reference: Option<&mut Archive>,
        opts: CreateOptions,
    ) -> Result<Statistics> {
        let internal_name = Label::generate();
        // at creation the data follows the fresh physical archive
        let data_name = internal_name;
        let mut target =
            WriteTarget::build(&ui, location, &opts, internal_name, data_name, None)?;
        let mut catalogue = Catalogue::new(data_name);
        if opts.record_in_place {
            catalogue.in_place = Some(fs_root.to_path_buf());
        }
        let ref_cat = reference.as_ref().map(|a| a.catalogue.snapshot());

        let mut stats = Statistics::new();
        reader.reset_read(fs_root)?;
        let mut path_stack: Vec<String> = Vec::new();
        let mut link_map: HashMap<(u64, u64), HolderRef> = HashMap::new();
        let mut delayed = false;

        let walk = (|| -> Result<()> {
            while let Some(item) = reader.read()? {
                if let Some(cancel) = &opts.cancellation {
                    if cancel.immediate() {
                        return Err(Error::Cancelled {
                            immediate: true,
                            flag: false,
                            attribute: None,
                        });
                    }
                    if cancel.delayed() {
                        delayed = true;
                        break;
                    }
                }
                match item.entry {
                    Entry::Eod => {
                        path_stack.pop();
                        target.write_inline(&Entry::Eod)?;
                        catalogue.add(Entry::Eod)?;
                    }
                    Entry::Dir(mut dir) => {
                        let rel = rel_path(&path_stack, &dir.name);
                        path_stack.push(dir.name.clone());
                        if let Some(p) = &opts.progress {
                            p(&rel);
                        }
                        if let Some(rc) = &ref_cat {
                            if let Some(Entry::Dir(rd)) = rc.lookup(&rel) {
                                if rd.meta.mtime == dir.meta.mtime {
                                    dir.meta = dir.meta.demoted();
                                }
                            }
                        }
                        stats.treated += 1;
                        let entry = Entry::Dir(dir);
                        target.write_inline(&entry)?;
                        catalogue.add(entry)?;
                    }
                    entry => {
                        let rel = rel_path(&path_stack, entry.name());
                        if let Some(p) = &opts.progress {
                            p(&rel);
                        }
                        // hard link resolution
                        if let Some(id) = item.link_id {
                            if let Some(holder) = link_map.get(&id) {
                                let mirage = Entry::HardLinkRef(MirageEntry {
                                    name: entry.name().to_string(),
                                    holder: holder.clone(),
                                });
                                stats.hard_links += 1;
                                target.write_inline(&mirage)?;
                                catalogue.add(mirage)?;
                                continue;
                            }
                        }
                        let ref_entry = ref_cat.as_ref().and_then(|rc| rc.lookup(&rel));
                        let processed = match Self::process_leaf(
                            &mut target,
                            entry,
                            ref_entry,
                            &item.path,
                            reference.as_deref_mut(),
                            &opts,
                            &mut stats,
                        ) {
                            Ok(e) => e,
                            Err(e) if e.is_per_entry() => {
                                stats.errored += 1;
                                ui.message(&format!("{rel}: {e}"));
                                continue;
                            }
                            Err(e) => return Err(e),
                        };
                        // wrap hard-linked inodes in a shared holder
                        let final_entry = if let Some(id) = item.link_id {
                            let holder = std::rc::Rc::new(std::cell::RefCell::new(InodeHolder {
                                tag: catalogue.take_tag(),
                                inner: processed,
                            }));
                            link_map.insert(id, holder.clone());
                            Entry::HardLinkRef(MirageEntry {
                                name: item
                                    .path
                                    .file_name()
                                    .map(|n| n.to_string_lossy().into_owned())
                                    .unwrap_or_default(),
                                holder,
                            })
                        } else {
                            processed
                        };
                        target.write_inline(&final_entry)?;
                        catalogue.add(final_entry)?;
                    }
                }
            }
            Ok(())
        })();
        if let Err(e) = walk {
            target.abandon();
            return Err(e);
        }

        if delayed && ref_cat.is_none() {
            // no reference to describe the unvisited files from: walk the
            // rest of the tree recording bare entries, with their dates
            // cleared so a later backup against this archive saves them
            while let Some(item) = reader.read()? {
                match item.entry {
                    Entry::Eod => {
                        target.write_inline(&Entry::Eod)?;
                        catalogue.add(Entry::Eod)?;
                    }
                    mut entry => {
                        demote_in_place(&mut entry);
                        if let Some(meta) = entry_meta_mut(&mut entry) {
                            meta.mtime = Bigint::zero();
                        }
                        target.write_inline(&entry)?;
                        catalogue.add(entry)?;
                    }
                }
            }
        }
        catalogue.close_all_dirs();
        if let Some(rc) = &ref_cat {
            if delayed {
                // describe the unvisited part of the tree as not saved
                catalogue.update_absent_with(rc)?;
            } else {
                stats.deleted += catalogue.update_destroyed_with(rc)?;
            }
        }
        if delayed {
            target.drop_final_hook();
        }
        target.finish(&catalogue)?;
        Ok(stats)
    }

    /// Handles one non-directory entry of a backup: decides its saved
    /// status against the reference and streams its body.
    fn process_leaf(
        target: &mut WriteTarget,
        mut entry: Entry,
        ref_entry: Option<&Entry>,
        source_path: &Path,
        mut reference: Option<&mut Archive>,
        opts: &CreateOptions,
        stats: &mut Statistics,
    ) -> Result<Entry> {
        let resolved_ref = ref_entry.map(resolve_hard_link);
        if is_unchanged(&entry, resolved_ref.as_ref()) {
            stats.skipped += 1;
            demote_in_place(&mut entry);
            return Ok(entry);
        }
        let Entry::File(file) = &mut entry else {
            stats.treated += 1;
            return Ok(entry);
        };

        // try a binary delta against the reference
        if let (Some(Entry::File(rf)), Some(ref_arch)) = (&resolved_ref, reference.as_deref_mut())
        {
            if let (Some(sig_rec), Some(base_crc)) = (&rf.data.delta_sig, &rf.data.crc) {
                if !sig_rec.sig_size.is_zero() {
                    let mut rec = sig_rec.clone();
                    if ref_arch.fetch_sig_payload(&mut rec).is_ok() {
                        if let Ok(base_sig) = rec.signature() {
                            Self::write_delta_body(
                                target, file, &base_sig, base_crc, source_path, opts, stats,
                            )?;
                            return Ok(entry);
                        }
                    }
                }
            }
        }

        // full body
        let original = file.data.original_size.clone();
        let mut crc_final = None;
        if !original.is_zero() {
            let mut source = FileStream::open_read(source_path)?;
            let (offset, stored, crc) = target.write_body(&mut source, &original)?;
            source.terminate()?;
            file.data.offset = offset;
            file.data.stored_size = stored;
            crc_final = Some(crc);
            // the file changed while being read: flag it and mark the
            // stream so a sequential reader knows the body is unreliable
            if let Ok(md) = std::fs::symlink_metadata(source_path) {
                use std::os::unix::fs::MetadataExt;
                if Bigint::from(md.mtime().max(0) as u64) != file.meta.mtime {
                    file.data.dirty = true;
                    if target.sequential {
                        target.pile.add_escape_mark(MarkKind::Dirty, false)?;
                    }
                }
            }
        }
        file.data.compression = opts.compression;
        file.data.crc = crc_final.clone();
        file.meta.status = SavedStatus::Saved;
        stats.treated += 1;
        stats.add_bytes(&original);

        if opts.delta_signatures {
            let mut source = FileStream::open_read(source_path)?;
            let sig = Signature::compute(&mut source, opts.delta_sig_block)?;
            source.terminate()?;
            let crc = crc_final.unwrap_or_else(|| Crc::from_size(&original));
            let mut rec = SigRecord::with_signature(crc.clone(), &sig, crc);
            if !target.sequential {
                rec.dump_body(&mut target.pile)?;
                target.pile.sync_write()?;
            }
            file.data.delta_sig = Some(rec);
        }
        Ok(entry)
    }

    /// Streams a binary patch instead of the full file body.
    fn write_delta_body(
        target: &mut WriteTarget,
        file: &mut FileEntry,
        base_sig: &Signature,
        base_crc: &Crc,
        source_path: &Path,
        opts: &CreateOptions,
        stats: &mut Statistics,
    ) -> Result<()> {
        let original = file.data.original_size.clone();
        let offset = target.pile.position()?;
        let mut source = FileStream::open_read(source_path)?;
        let (result_crc, _patch_len) =
            delta::make_patch(base_sig, &mut source, &original, &mut target.pile)?;
        source.terminate()?;
        target.pile.sync_write()?;
        let stored = target.pile.position()?.sub(&offset)?;

        file.data.offset = offset;
        file.data.stored_size = stored;
        file.data.compression = opts.compression;
        file.data.crc = Some(result_crc.clone());
        file.meta.status = SavedStatus::Delta;
        let mut rec = SigRecord::for_patch(base_crc.clone(), base_sig.block_len, result_crc.clone());
        if opts.delta_signatures {
            let mut source = FileStream::open_read(source_path)?;
            let sig = Signature::compute(&mut source, opts.delta_sig_block)?;
            source.terminate()?;
            rec = SigRecord::with_signature(base_crc.clone(), &sig, result_crc);
            if !target.sequential {
                rec.dump_body(&mut target.pile)?;
                target.pile.sync_write()?;
            }
        }
        file.data.delta_sig = Some(rec);
        stats.treated += 1;
        stats.add_bytes(&original);
        Ok(())
    }

    /// Reads the signature payload of a record out of this archive.
    fn fetch_sig_payload(&mut self, rec: &mut SigRecord) -> Result<()> {
        self.check_open()?;
        self.pile.set_raw_mode(false)?;
        rec.fetch_body(&mut self.pile)
    }

    // ---- read operations ----

    /// Restores the selected entries through the given sink.
    pub fn extract(
        &mut self,
        sink: &mut dyn FilesystemRestore,
        opts: &ExtractOptions,
    ) -> Result<Statistics> {
        self.check_open()?;
        self.check_has_data()?;
        // directory metadata is applied again when leaving the
        // directory, children alter it while they land
        let mut open_dirs: Vec<(String, Entry)> = Vec::new();
        self.walk_selected(opts, &mut |archive, rel, entry| match entry {
            Entry::Dir(d) => {
                open_dirs.push((
                    rel.to_string(),
                    Entry::Dir(crate::catalogue::entry::DirEntry {
                        name: d.name.clone(),
                        meta: d.meta.clone(),
                        children: Vec::new(),
                        recursive_changed: false,
                    }),
                ));
                archive.restore_one(sink, rel, entry, &opts.overwrite)
            }
            Entry::Eod => {
                if let Some((dir_rel, dir_entry)) = open_dirs.pop() {
                    sink.write(Path::new(&dir_rel), &dir_entry, None)?;
                }
                Ok(WalkOutcome::Skipped)
            }
            other => archive.restore_one(sink, rel, other, &opts.overwrite),
        })
    }

    /// Reads every selected body and verifies its checksum, writing
    /// nothing.
    pub fn test(&mut self) -> Result<Statistics> {
        self.check_open()?;
        self.check_has_data()?;
        let opts = ExtractOptions::default();
        self.walk_selected(&opts, &mut |archive, _rel, entry| {
            let resolved = resolve_hard_link(entry);
            if let Entry::File(f) = &resolved {
                if f.data.stored_size.is_zero() {
                    return Ok(WalkOutcome::Treated);
                }
                match f.meta.status {
                    SavedStatus::Saved => {
                        let mut sink = MemoryStream::new();
                        let crc = archive.stream_body_to(
                            &f.data.offset,
                            &f.data.original_size,
                            &mut sink,
                        )?;
                        if let Some(recorded) = &f.data.crc {
                            if !crc.same_as(recorded) {
                                return Err(Error::data(format!(
                                    "{}: checksum mismatch",
                                    f.name
                                )));
                            }
                        }
                    }
                    SavedStatus::Delta => {
                        // a patch can only be checked for readability
                        let mut sink = MemoryStream::new();
                        archive.stream_stored_to(
                            &f.data.offset,
                            &f.data.stored_size,
                            &mut sink,
                        )?;
                    }
                    _ => {}
                }
            }
            Ok(WalkOutcome::Treated)
        })
    }

    /// Compares the selected entries with a filesystem.
    pub fn diff(
        &mut self,
        sink: &mut dyn FilesystemDiff,
        fields: &ComparisonFields,
    ) -> Result<Statistics> {
        self.check_open()?;
        let opts = ExtractOptions::default();
        let ui = self.ui.clone();
        self.walk_selected(&opts, &mut |_archive, rel, entry| {
            if matches!(entry, Entry::Eod) {
                return Ok(WalkOutcome::Skipped);
            }
            match sink.compare(Path::new(rel), entry, fields)? {
                Some(difference) => {
                    ui.message(&difference);
                    Ok(WalkOutcome::Errored)
                }
                None => Ok(WalkOutcome::Treated),
            }
        })
    }

    /// Walks the selected entries, calling `visit` for each
    /// non-directory and keeping the statistics.
    fn walk_selected(
        &mut self,
        opts: &ExtractOptions,
        visit: &mut dyn FnMut(&mut Self, &str, &Entry) -> Result<WalkOutcome>,
    ) -> Result<Statistics> {
        let mut stats = Statistics::new();
        match &opts.subtree {
            Some(path) => self.catalogue.reset_read_subtree(path)?,
            None => self.catalogue.reset_read(),
        }
        let mut path_stack: Vec<String> = Vec::new();
        loop {
            let Some(step) = self.catalogue.read_next() else {
                break;
            };
            match step {
                CatStep::Eod => {
                    // visited with the path of the directory being
                    // closed; its outcome is not counted
                    let rel = path_stack.join("/");
                    match visit(self, &rel, &Entry::Eod) {
                        Ok(_) => {}
                        Err(e) if e.is_per_entry() => {
                            stats.errored += 1;
                            self.ui.message(&format!("{rel}: {e}"));
                        }
                        Err(e) => return Err(e),
                    }
                    path_stack.pop();
                }
                CatStep::Entry(p) => {
                    let entry = match self.catalogue.entry_at(&p) {
                        Some(e) => e.clone(),
                        None => continue,
                    };
                    let rel = rel_path(&path_stack, entry.name());
                    if let Some(filter) = &opts.name_filter {
                        if !filter(&rel) {
                            stats.ignored += 1;
                            if matches!(entry, Entry::Dir(_)) {
                                self.catalogue.skip_read_to_parent_dir();
                            }
                            continue;
                        }
                    }
                    if let Entry::Dir(_) = &entry {
                        path_stack.push(entry.name().to_string());
                    }
                    match visit(self, &rel, &entry) {
                        Ok(WalkOutcome::Treated) => stats.treated += 1,
                        Ok(WalkOutcome::Skipped) => stats.skipped += 1,
                        Ok(WalkOutcome::Overwritten) => {
                            stats.treated += 1;
                            stats.overwritten += 1;
                        }
                        Ok(WalkOutcome::TooOld) => stats.tooold += 1,
                        Ok(WalkOutcome::Deleted) => stats.deleted += 1,
                        Ok(WalkOutcome::HardLink) => stats.hard_links += 1,
                        Ok(WalkOutcome::Errored) => stats.errored += 1,
                        Err(e) if e.is_per_entry() => {
                            stats.errored += 1;
                            self.ui.message(&format!("{rel}: {e}"));
                        }
                        Err(e) => return Err(e),
                    }
                    if let Entry::File(f) = resolve_hard_link(&entry) {
                        if f.meta.ea == EaStatus::Full {
                            stats.ea_treated += 1;
                        }
                    }
                    if self.catalogue.early_release() {
                        let _ = self.catalogue.release_entry(&p);
                    }
                }
            }
        }
        Ok(stats)
    }

    /// Restores one entry through the sink.
    fn restore_one(
        &mut self,
        sink: &mut dyn FilesystemRestore,
        rel: &str,
        entry: &Entry,
        overwrite: &CritAction,
    ) -> Result<WalkOutcome> {
        let rel_path = Path::new(rel);
        let resolved = resolve_hard_link(entry);
        let existing = sink.peek(rel_path);
        if let Entry::Deleted(_) = &resolved {
            if existing.is_some() {
                sink.write(rel_path, entry, None)?;
                return Ok(WalkOutcome::Deleted);
            }
            return Ok(WalkOutcome::Skipped);
        }
        let mtime = resolved
            .meta()
            .map(|m| m.mtime.clone())
            .unwrap_or_default();
        let was_there = existing.is_some();
        if !overwrite
            .data
            .replaces(existing.as_ref().map(|e| &e.mtime), &mtime)
        {
            return Ok(WalkOutcome::TooOld);
        }
        // hard link to an already restored inode
        if let Entry::HardLinkRef(m) = entry {
            let tag = m.holder.borrow().tag;
            if sink.link(rel_path, tag)? {
                return Ok(WalkOutcome::HardLink);
            }
        }
        match &resolved {
            Entry::File(f) => match f.meta.status {
                SavedStatus::Saved => {
                    let mut body = MemoryStream::new();
                    let crc = self.stream_body_to(&f.data.offset, &f.data.original_size, &mut body)?;
                    if let Some(recorded) = &f.data.crc {
                        if !crc.same_as(recorded) {
                            return Err(Error::data(format!("{rel}: checksum mismatch")));
                        }
                    }
                    body.skip(&Bigint::zero())?;
                    sink.write(rel_path, &resolved, Some(&mut body))?;
                }
                SavedStatus::Delta => {
                    self.restore_delta(sink, rel_path, f)?;
                }
                _ => return Ok(WalkOutcome::Skipped),
            },
            Entry::Eod => return Ok(WalkOutcome::Skipped),
            other => {
                sink.write(rel_path, other, None)?;
            }
        }
        Ok(if was_there {
            WalkOutcome::Overwritten
        } else {
            WalkOutcome::Treated
        })
    }

    /// Applies a stored binary patch over the on-disk state of a file.
    fn restore_delta(
        &mut self,
        sink: &mut dyn FilesystemRestore,
        rel: &Path,
        f: &FileEntry,
    ) -> Result<()> {
        let rec = f
            .data
            .delta_sig
            .as_ref()
            .ok_or_else(|| Error::data("patch without its signature record"))?;
        // the patch applies to the file as restored from the reference
        if sink.peek(rel).is_none() {
            return Err(Error::data(format!(
                "{}: no base file to apply the patch to",
                rel.display()
            )));
        }
        let base_bytes = sink.read_back(rel)?;
        let mut base_crc = Crc::with_width(rec.base_crc.width());
        base_crc.update(&base_bytes);
        if !base_crc.same_as(&rec.base_crc) {
            return Err(Error::data(format!(
                "{}: on-disk file does not match the patch base",
                rel.display()
            )));
        }
        self.pile.set_raw_mode(false)?;
        if !self.pile.skip(&f.data.offset)? {
            return Err(Error::data("patch offset past the end of the archive"));
        }
        let mut base = MemoryStream::with_contents(base_bytes);
        let mut rebuilt = MemoryStream::new();
        // the patch op-stream delimits itself
        let crc = delta::apply_patch(
            &mut base,
            rec.sig_block_len_or_default(),
            &mut self.pile,
            &mut rebuilt,
        )?;
        if !crc.same_as(&rec.result_crc) {
            return Err(Error::data(format!(
                "{}: patched file does not match its recorded checksum",
                rel.display()
            )));
        }
        rebuilt.skip(&Bigint::zero())?;
        sink.write(rel, &Entry::File(f.clone()), Some(&mut rebuilt))?;
        Ok(())
    }

    /// Copies one clear body to `out`, returning its checksum.
    fn stream_body_to(
        &mut self,
        offset: &Bigint,
        original: &Bigint,
        out: &mut dyn Stream,
    ) -> Result<Crc> {
        self.pile.set_raw_mode(false)?;
        if !self.pile.skip(offset)? {
            return Err(Error::data("body offset past the end of the archive"));
        }
        let mut body = BoundedBody::new(&mut self.pile, original);
        copy_stream(&mut body, out, Some(original), None)?;
        Ok(body.crc)
    }

    /// Copies one stored (still compressed) body to `out`.
    fn stream_stored_to(
        &mut self,
        offset: &Bigint,
        stored: &Bigint,
        out: &mut dyn Stream,
    ) -> Result<()> {
        self.pile.set_raw_mode(true)?;
        if !self.pile.skip(offset)? {
            self.pile.set_raw_mode(false)?;
            return Err(Error::data("body offset past the end of the archive"));
        }
        let res = copy_stream(&mut self.pile, out, Some(stored), None);
        self.pile.set_raw_mode(false)?;
        res.map(|_| ())
    }

    // ---- isolate ----

    /// Writes a new archive holding only this archive's catalogue.
    pub fn isolate(
        &mut self,
        location: &ArchiveLocation,
        create: CreateOptions,
        opts: IsolateOptions,
    ) -> Result<()> {
        self.check_open()?;
        let internal_name = Label::generate();
        // the isolated slices carry their own identity while the
        // catalogue keeps following the data
        let mut target = WriteTarget::build(
            &self.ui,
            location,
            &create,
            internal_name,
            internal_name,
            self.layout.clone(),
        )?;
        let mut catalogue = self.catalogue.snapshot();
        mark_catalogue_fake(catalogue_root_mut(&mut catalogue));
        if opts.transfer_delta_sigs {
            self.reembed_signatures(&mut target, catalogue_root_mut(&mut catalogue))?;
        } else {
            strip_signature_payloads(catalogue_root_mut(&mut catalogue));
        }
        target.finish(&catalogue)
    }

    /// Copies every signature payload into the target archive, updating
    /// the recorded offsets.
    fn reembed_signatures(
        &mut self,
        target: &mut WriteTarget,
        entries: &mut [Entry],
    ) -> Result<()> {
        for entry in entries {
            match entry {
                Entry::Dir(d) => self.reembed_signatures(target, &mut d.children)?,
                Entry::File(f) => {
                    if let Some(rec) = &mut f.data.delta_sig {
                        if !rec.sig_size.is_zero() {
                            self.pile.set_raw_mode(false)?;
                            rec.fetch_body(&mut self.pile)?;
                            rec.dump_body(&mut target.pile)?;
                            target.pile.sync_write()?;
                            rec.drop_payload();
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ---- merge ----

    /// Combines one or two archives into a new one, the policy deciding
    /// which side wins on conflicts.
    pub fn merge(
        ui: Ui,
        location: &ArchiveLocation,
        create: CreateOptions,
        first: &mut Archive,
        mut second: Option<&mut Archive>,
        opts: MergeOptions,
    ) -> Result<Statistics> {
        first.check_open()?;
        first.check_has_data()?;
        if let Some(s) = second.as_deref() {
            s.check_open()?;
            s.check_has_data()?;
        }
        if opts.keep_compressed && opts.recompute_delta_sigs {
            return Err(Error::feature(
                "delta signature recomputation and keep-compressed are mutually exclusive",
            ));
        }
        if opts.keep_compressed {
            let algo_ok = first.header.compression == create.compression
                && second
                    .as_deref()
                    .map(|s| s.header.compression == create.compression)
                    .unwrap_or(true)
                && first.header.compression_block
                    == Bigint::from(create.compression_block.unwrap_or(0))
                && second
                    .as_deref()
                    .map(|s| s.header.compression_block == first.header.compression_block)
                    .unwrap_or(true)
                && first.header.tape_marks == create.sequential_marks
                && second
                    .as_deref()
                    .map(|s| s.header.tape_marks == create.sequential_marks)
                    .unwrap_or(true);
            if !algo_ok {
                return Err(Error::feature(
                    "keep-compressed merge needs identical compression and mark setup",
                ));
            }
        }

        let internal_name = Label::generate();
        let mut target =
            WriteTarget::build(&ui, location, &create, internal_name, internal_name, None)?;
        let mut stats = Statistics::new();
        let mut links: HashMap<(bool, u64), HolderRef> = HashMap::new();
        let mut next_tag = 0u64;

        let a_root = first.catalogue.snapshot();
        let b_root = second.as_ref().map(|s| s.catalogue.snapshot());
        let merged = merge_level(
            a_root.entries(),
            b_root.as_ref().map(|c| c.entries()).unwrap_or(&[]),
            &opts,
            &mut |entry, from_first| -> Result<Entry> {
                let source: &mut Archive = if from_first {
                    &mut *first
                } else {
                    match second.as_deref_mut() {
                        Some(s) => s,
                        None => &mut *first,
                    }
                };
                copy_entry_body(
                    source,
                    &mut target,
                    entry,
                    opts.keep_compressed,
                    from_first,
                    &mut stats,
                    &mut links,
                    &mut next_tag,
                )
            },
        )?;
        let mut catalogue = Catalogue::from_entries(internal_name, merged);
        catalogue.close_all_dirs();
        target.finish(&catalogue)?;
        Ok(stats)
    }

    // ---- repair ----

    /// Rebuilds a well-formed archive out of one whose tail is damaged,
    /// walking the escape marks and reusing the stored bodies.
    pub fn repair(
        ui: Ui,
        source_location: &ArchiveLocation,
        target_location: &ArchiveLocation,
        mut create: CreateOptions,
    ) -> Result<Statistics> {
        let mut source = Archive::open(
            ui.clone(),
            source_location,
            OpenOptions {
                lax: true,
                sequential: true,
                passphrase: Some(create.passphrase.clone()),
                ..Default::default()
            },
        )?;
        // stored bodies are reused as-is, so the compression setup and
        // the mark layout must carry over
        create.compression = source.header.compression;
        create.compression_block = source.header.compression_block.to_usize().filter(|b| *b > 0);
        create.sequential_marks = source.header.tape_marks;
        let internal_name = Label::generate();
        let mut target = WriteTarget::build(
            &ui,
            target_location,
            &create,
            internal_name,
            source.catalogue.data_name,
            None,
        )?;
        let mut stats = Statistics::new();
        let mut links: HashMap<(bool, u64), HolderRef> = HashMap::new();
        let mut next_tag = 0u64;
        let snapshot = source.catalogue.snapshot();
        let rebuilt = copy_level(snapshot.entries(), &mut |entry| {
            copy_entry_body(
                &mut source,
                &mut target,
                entry,
                true,
                true,
                &mut stats,
                &mut links,
                &mut next_tag,
            )
        })?;
        let mut catalogue = Catalogue::from_entries(snapshot.data_name, rebuilt);
        catalogue.in_place = snapshot.in_place.clone();
        target.finish(&catalogue)?;
        Ok(stats)
    }

    // ---- re-slicing ----

    /// Copies an archive into a new slicing without touching its
    /// contents: the logical byte stream and the data name are kept.
    pub fn xform(
        ui: Ui,
        source_location: &ArchiveLocation,
        target_location: &ArchiveLocation,
        slice_size: Bigint,
        first_slice_size: Option<Bigint>,
    ) -> Result<()> {
        let mut reader = SliceReader::open(
            ui.clone(),
            source_location.fileset(),
            SliceReadOptions::default(),
        )?;
        let data_name = reader.data_name();
        let opts = SliceWriteOptions {
            slice_size: if slice_size.is_zero() {
                Bigint::from(u64::MAX)
            } else {
                slice_size
            },
            first_slice_size,
            ..Default::default()
        };
        let mut writer = SliceWriter::create(
            ui,
            target_location.fileset(),
            opts,
            Label::generate(),
            data_name,
        )?;
        copy_stream(&mut reader, &mut writer, None, None)?;
        reader.terminate()?;
        writer.terminate()
    }

    /// Copies an archive's logical byte stream into a single-slice
    /// stream, typically a pipe.
    pub fn xform_to_stream(
        ui: Ui,
        source_location: &ArchiveLocation,
        out: Box<dyn Stream>,
    ) -> Result<()> {
        let mut reader = SliceReader::open(
            ui,
            source_location.fileset(),
            SliceReadOptions::default(),
        )?;
        let mut single = SingleSlice::create(out, Label::generate(), reader.data_name())?;
        copy_stream(&mut reader, &mut single, None, None)?;
        reader.terminate()?;
        single.terminate()
    }
}

/// Result of visiting one entry.
enum WalkOutcome {
    Treated,
    Skipped,
    Overwritten,
    TooOld,
    Deleted,
    HardLink,
    Errored,
}

fn rel_path(stack: &[String], name: &str) -> String {
    if stack.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", stack.join("/"), name)
    }
}

/// Follows a hard link reference to the inode it shares.
fn resolve_hard_link(entry: &Entry) -> Entry {
    match entry {
        Entry::HardLinkRef(m) => {
            let holder = m.holder.borrow();
            let mut inner = holder.inner.clone();
            set_entry_name(&mut inner, &m.name);
            inner
        }
        other => other.clone(),
    }
}

fn entry_meta_mut(entry: &mut Entry) -> Option<&mut crate::catalogue::entry::InodeMeta> {
    match entry {
        Entry::File(f) => Some(&mut f.meta),
        Entry::Symlink(s) => Some(&mut s.meta),
        Entry::CharDev(n) | Entry::BlockDev(n) => Some(&mut n.meta),
        Entry::Pipe(p) | Entry::Socket(p) => Some(&mut p.meta),
        Entry::Dir(d) => Some(&mut d.meta),
        _ => None,
    }
}

fn set_entry_name(entry: &mut Entry, name: &str) {
    match entry {
        Entry::File(f) => f.name = name.to_string(),
        Entry::Symlink(s) => s.name = name.to_string(),
        Entry::CharDev(n) | Entry::BlockDev(n) => n.name = name.to_string(),
        Entry::Pipe(p) | Entry::Socket(p) => p.name = name.to_string(),
        Entry::Dir(d) => d.name = name.to_string(),
        _ => {}
    }
}

/// Tells whether the fresh entry matches its reference closely enough
/// to be recorded without its data.
fn is_unchanged(entry: &Entry, reference: Option<&Entry>) -> bool {
    let Some(reference) = reference else {
        return false;
    };
    if entry.signature_base() != reference.signature_base() {
        return false;
    }
    match (entry, reference) {
        (Entry::File(a), Entry::File(b)) => {
            a.meta.mtime == b.meta.mtime && a.data.original_size == b.data.original_size
        }
        (Entry::Symlink(a), Entry::Symlink(b)) => {
            a.meta.mtime == b.meta.mtime && a.target == b.target
        }
        (a, b) => match (a.meta(), b.meta()) {
            (Some(ma), Some(mb)) => ma.mtime == mb.mtime,
            _ => false,
        },
    }
}

/// Demotes an entry in place to its metadata-only form.
fn demote_in_place(entry: &mut Entry) {
    match entry {
        Entry::File(f) => {
            f.meta = f.meta.demoted();
            f.data.offset = Bigint::zero();
            f.data.stored_size = Bigint::zero();
            f.data.crc = None;
            f.data.delta_sig = None;
        }
        Entry::Symlink(s) => s.meta = s.meta.demoted(),
        Entry::CharDev(n) | Entry::BlockDev(n) => n.meta = n.meta.demoted(),
        Entry::Pipe(p) | Entry::Socket(p) => p.meta = p.meta.demoted(),
        Entry::Dir(d) => d.meta = d.meta.demoted(),
        _ => {}
    }
}

fn catalogue_root_mut(cat: &mut Catalogue) -> &mut [Entry] {
    cat.entries_mut()
}

/// Turns every saved entry of an isolated catalogue into a placeholder.
fn mark_catalogue_fake(entries: &mut [Entry]) {
    for entry in entries {
        match entry {
            Entry::Dir(d) => {
                mark_catalogue_fake(&mut d.children);
            }
            Entry::File(f) => {
                if matches!(f.meta.status, SavedStatus::Saved | SavedStatus::Delta) {
                    f.meta.status = SavedStatus::Fake;
                }
                if f.meta.ea == EaStatus::Full {
                    f.meta.ea = EaStatus::Fake;
                    f.meta.ea_block = None;
                }
            }
            _ => {}
        }
    }
}

/// Drops signature payload references that will not resolve in the new
/// archive, keeping the checksums.
fn strip_signature_payloads(entries: &mut [Entry]) {
    for entry in entries {
        match entry {
            Entry::Dir(d) => strip_signature_payloads(&mut d.children),
            Entry::File(f) => {
                if let Some(rec) = &mut f.data.delta_sig {
                    rec.strip_payload_reference();
                }
            }
            _ => {}
        }
    }
}

/// Copies an entry's body from its source archive into the target,
/// returning the entry with refreshed location fields. Hard-linked
/// inodes keep their sharing through the `links` map.
#[allow(clippy::too_many_arguments)]
fn copy_entry_body(
    source: &mut Archive,
    target: &mut WriteTarget,
    entry: &Entry,
    keep_compressed: bool,
    from_first: bool,
    stats: &mut Statistics,
    links: &mut HashMap<(bool, u64), HolderRef>,
    next_tag: &mut u64,
) -> Result<Entry> {
    if let Entry::HardLinkRef(m) = entry {
        let old_tag = m.holder.borrow().tag;
        let key = (from_first, old_tag);
        if let Some(holder) = links.get(&key) {
            stats.hard_links += 1;
            return Ok(Entry::HardLinkRef(MirageEntry {
                name: m.name.clone(),
                holder: holder.clone(),
            }));
        }
        let inner = m.holder.borrow().inner.clone();
        let copied = copy_entry_body(
            source,
            target,
            &inner,
            keep_compressed,
            from_first,
            stats,
            links,
            next_tag,
        )?;
        *next_tag += 1;
        let holder = std::rc::Rc::new(std::cell::RefCell::new(InodeHolder {
            tag: *next_tag,
            inner: copied,
        }));
        links.insert(key, holder.clone());
        return Ok(Entry::HardLinkRef(MirageEntry {
            name: m.name.clone(),
            holder,
        }));
    }
    let mut entry = entry.clone();
    let Entry::File(f) = &mut entry else {
        stats.treated += 1;
        return Ok(entry);
    };
    if !matches!(f.meta.status, SavedStatus::Saved | SavedStatus::Delta)
        || f.data.stored_size.is_zero()
    {
        stats.treated += 1;
        if let Some(rec) = &mut f.data.delta_sig {
            rec.strip_payload_reference();
        }
        return Ok(entry);
    }
    if keep_compressed {
        target.pile.sync_write()?;
        target.pile.set_raw_mode(true)?;
        let offset = target.pile.position()?;
        let res = source.stream_stored_to(
            &f.data.offset.clone(),
            &f.data.stored_size.clone(),
            &mut target.pile,
        );
        target.pile.set_raw_mode(false)?;
        res?;
        f.data.offset = offset;
    } else {
        let mut clear = MemoryStream::new();
        source.stream_body_to(&f.data.offset.clone(), &f.data.original_size.clone(), &mut clear)?;
        clear.skip(&Bigint::zero())?;
        let (offset, stored, crc) = target.write_body(&mut clear, &f.data.original_size.clone())?;
        f.data.offset = offset;
        f.data.stored_size = stored;
        f.data.crc = Some(crc);
        f.data.compression = target.record.compression;
    }
    if let Some(rec) = &mut f.data.delta_sig {
        if !rec.sig_size.is_zero() {
            if source.fetch_sig_payload(rec).is_ok() {
                rec.dump_body(&mut target.pile)?;
                target.pile.sync_write()?;
                rec.drop_payload();
            } else {
                rec.strip_payload_reference();
            }
        }
    }
    stats.treated += 1;
    stats.add_bytes(&f.data.original_size);
    Ok(entry)
}

/// Recursively merges two levels of the tree, the callback copying the
/// chosen entry's body and returning its refreshed form.
fn merge_level(
    a: &[Entry],
    b: &[Entry],
    opts: &MergeOptions,
    copy: &mut dyn FnMut(&Entry, bool) -> Result<Entry>,
) -> Result<Vec<Entry>> {
    let mut names: Vec<&str> = a
        .iter()
        .chain(b.iter())
        .filter(|e| e.is_serializable() && !matches!(e, Entry::Eod))
        .map(|e| e.name())
        .collect();
    names.sort_unstable();
    names.dedup();

    let mut out = Vec::new();
    for name in names {
        let in_a = a.iter().find(|e| e.name() == name);
        let in_b = b.iter().find(|e| e.name() == name);
        match (in_a, in_b) {
            (Some(Entry::Dir(da)), Some(Entry::Dir(db))) => {
                let children = merge_level(&da.children, &db.children, opts, copy)?;
                let mut dir = da.clone();
                dir.children = children;
                out.push(Entry::Dir(dir));
            }
            (Some(ea), Some(eb)) => {
                let pick_first = match opts.policy {
                    OverwritePolicy::Preserve => true,
                    OverwritePolicy::Overwrite => false,
                    OverwritePolicy::PreserveNewer => {
                        let ma = resolve_hard_link(ea).meta().map(|m| m.mtime.clone());
                        let mb = resolve_hard_link(eb).meta().map(|m| m.mtime.clone());
                        ma >= mb
                    }
                };
                let (winner, from_first) = if pick_first { (ea, true) } else { (eb, false) };
                out.push(descend_copy(winner, from_first, opts, copy)?);
            }
            (Some(ea), None) => out.push(descend_copy(ea, true, opts, copy)?),
            (None, Some(eb)) => out.push(descend_copy(eb, false, opts, copy)?),
            (None, None) => {}
        }
    }
    Ok(out)
}

/// Copies one winning entry, recursing into directories.
fn descend_copy(
    entry: &Entry,
    from_first: bool,
    opts: &MergeOptions,
    copy: &mut dyn FnMut(&Entry, bool) -> Result<Entry>,
) -> Result<Entry> {
    match entry {
        Entry::Dir(d) => {
            let mut out = d.clone();
            out.children = Vec::new();
            for child in &d.children {
                if !child.is_serializable() || matches!(child, Entry::Eod) {
                    continue;
                }
                out.children.push(descend_copy(child, from_first, opts, copy)?);
            }
            Ok(Entry::Dir(out))
        }
        other => copy(other, from_first),
    }
}

/// Walks one side only, copying every body. Used by repair.
fn copy_level(
    entries: &[Entry],
    copy: &mut dyn FnMut(&Entry) -> Result<Entry>,
) -> Result<Vec<Entry>> {
    let mut out = Vec::new();
    for entry in entries {
        if !entry.is_serializable() || matches!(entry, Entry::Eod) {
            continue;
        }
        match entry {
            Entry::Dir(d) => {
                let mut dir = d.clone();
                dir.children = copy_level(&d.children, copy)?;
                out.push(Entry::Dir(dir));
            }
            other => out.push(copy(other)?),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalBackup;
    use crate::fs::LocalDiff;
    use crate::fs::LocalRestore;
    use crate::user::ScriptedInteraction;
    use std::ffi::CString;
    use std::fs;
    use std::os::unix::ffi::OsStrExt;
    use std::sync::atomic::AtomicU32;

    fn ui(accept: bool) -> Ui {
        Arc::new(ScriptedInteraction::new(accept, ""))
    }

    fn scratch(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("darch-arch-{}-{tag}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn set_mtime(path: &Path, secs: i64) {
        let c_path = CString::new(path.as_os_str().as_bytes()).unwrap();
        let times = [
            libc::timespec {
                tv_sec: secs as libc::time_t,
                tv_nsec: 0,
            },
            libc::timespec {
                tv_sec: secs as libc::time_t,
                tv_nsec: 0,
            },
        ];
        unsafe {
            libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0);
        }
    }

    fn listing(archive: &mut Archive) -> Vec<String> {
        let mut lines = Vec::new();
        archive
            .list(ListStyle::Plain, false, &mut |l| lines.push(l.to_string()))
            .unwrap();
        lines
    }

    fn create_simple(
        root: &Path,
        location: &ArchiveLocation,
        opts: CreateOptions,
    ) -> Statistics {
        let mut reader = LocalBackup::new();
        Archive::create(ui(true), &mut reader, root, location, None, opts).unwrap()
    }

    /// Creation, listing and restoration of a small tree with escape
    /// marks, everything landing in one slice.
    #[test]
    fn create_list_restore() {
        let root = scratch("a-src");
        fs::write(root.join("a"), vec![b'A'; 100]).unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub/b"), b"").unwrap();
        std::os::unix::fs::symlink("../a", root.join("sub/c")).unwrap();

        let store = scratch("a-store");
        let location = ArchiveLocation::new(&store, "arc");
        create_simple(
            &root,
            &location,
            CreateOptions {
                slice_size: Bigint::from(4096u64),
                sequential_marks: true,
                ..Default::default()
            },
        );
        let slice = store.join("arc.1.dar");
        assert!(slice.exists());
        assert!(fs::metadata(&slice).unwrap().len() <= 4096);
        assert!(!store.join("arc.2.dar").exists());

        let mut archive = Archive::open(ui(true), &location, OpenOptions::default()).unwrap();
        assert!(!archive.is_isolated());
        let lines = listing(&mut archive);
        assert_eq!(lines.len(), 4);
        assert!(lines.iter().any(|l| l.ends_with("sub/c")));

        let out = scratch("a-out");
        let mut sink = LocalRestore::new(&out).unwrap();
        let stats = archive
            .extract(&mut sink, &ExtractOptions::default())
            .unwrap();
        assert_eq!(stats.errored, 0);
        assert_eq!(fs::read(out.join("a")).unwrap(), vec![b'A'; 100]);
        assert_eq!(fs::read(out.join("sub/b")).unwrap(), b"");
        assert_eq!(
            fs::read_link(out.join("sub/c")).unwrap().to_string_lossy(),
            "../a"
        );

        // a fresh diff against the restored tree is clean
        let mut diff = LocalDiff::new(&out);
        let stats = archive
            .diff(&mut diff, &ComparisonFields::ignore_owner())
            .unwrap();
        assert_eq!(stats.errored, 0);

        for d in [root, store, out] {
            fs::remove_dir_all(d).unwrap();
        }
    }

    /// Differential backup against an isolated catalogue only carries
    /// the modified file.
    #[test]
    fn differential_with_isolated_catalogue() {
        let root = scratch("b-src");
        fs::write(root.join("f1"), b"first file").unwrap();
        fs::write(root.join("f2"), b"second file").unwrap();
        fs::write(root.join("f3"), b"third file").unwrap();
        for name in ["f1", "f2", "f3"] {
            set_mtime(&root.join(name), 1_600_000_000);
        }

        let store = scratch("b-store");
        let full_loc = ArchiveLocation::new(&store, "full");
        create_simple(&root, &full_loc, CreateOptions::default());

        let iso_loc = ArchiveLocation::new(&store, "iso");
        {
            let mut full = Archive::open(ui(true), &full_loc, OpenOptions::default()).unwrap();
            full.isolate(&iso_loc, CreateOptions::default(), IsolateOptions::default())
                .unwrap();
        }

        // the isolated catalogue is not usable for data extraction
        let mut iso = Archive::open(ui(true), &iso_loc, OpenOptions::default()).unwrap();
        assert!(iso.is_isolated());
        assert!(iso
            .summary()
            .iter()
            .any(|l| l.contains("can only be used as reference")));
        let out = scratch("b-none");
        let mut sink = LocalRestore::new(&out).unwrap();
        match iso.extract(&mut sink, &ExtractOptions::default()) {
            Err(Error::Misuse(msg)) => assert_eq!(msg, MSG_REF_NOT_EXPLOITABLE),
            other => panic!("expected a misuse error, got {other:?}"),
        }

        // modify one file, then back up against the isolated catalogue
        fs::write(root.join("f2"), b"second file, changed now").unwrap();
        set_mtime(&root.join("f2"), 1_600_000_999);
        let diff_loc = ArchiveLocation::new(&store, "diff");
        let mut reader = LocalBackup::new();
        let stats = Archive::create(
            ui(true),
            &mut reader,
            &root,
            &diff_loc,
            Some(&mut iso),
            CreateOptions::default(),
        )
        .unwrap();
        assert_eq!(stats.treated, 1);
        assert_eq!(stats.skipped, 2);

        let mut diff = Archive::open(ui(true), &diff_loc, OpenOptions::default()).unwrap();
        let lines = listing(&mut diff);
        // only f2 is saved, the two others carry metadata only
        assert_eq!(
            lines.iter().filter(|l| l.starts_with('*')).count(),
            1
        );
        assert!(lines
            .iter()
            .any(|l| l.starts_with('*') && l.ends_with("f2")));

        // restoring the differential over the full restore yields the
        // new tree
        let restored = scratch("b-out");
        let mut sink = LocalRestore::new(&restored).unwrap();
        let mut full = Archive::open(ui(true), &full_loc, OpenOptions::default()).unwrap();
        full.extract(&mut sink, &ExtractOptions::default()).unwrap();
        diff.extract(&mut sink, &ExtractOptions::default()).unwrap();
        assert_eq!(
            fs::read(restored.join("f2")).unwrap(),
            b"second file, changed now"
        );
        assert_eq!(fs::read(restored.join("f1")).unwrap(), b"first file");

        for d in [root, store, out, restored] {
            fs::remove_dir_all(d).unwrap();
        }
    }

    /// A delayed cancellation mid-backup still produces a complete,
    /// readable archive whose unvisited files can be saved by a resumed
    /// run.
    #[test]
    fn delayed_cancellation_and_resume() {
        let root = scratch("c-src");
        for i in 0..10 {
            fs::write(root.join(format!("f{i}")), format!("contents {i}")).unwrap();
        }

        let store = scratch("c-store");
        let location = ArchiveLocation::new(&store, "part");
        let cancel = Cancellation::new();
        let seen = Arc::new(AtomicU32::new(0));
        let trigger = cancel.clone();
        let counter = seen.clone();
        let mut reader = LocalBackup::new();
        let stats = Archive::create(
            ui(true),
            &mut reader,
            &root,
            &location,
            None,
            CreateOptions {
                cancellation: Some(cancel),
                progress: Some(Box::new(move |_| {
                    if counter.fetch_add(1, Ordering::SeqCst) + 1 == 4 {
                        trigger.request_delayed();
                    }
                })),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(stats.treated, 4);
        assert!(seen.load(Ordering::SeqCst) >= 4);

        let mut partial = Archive::open(ui(true), &location, OpenOptions::default()).unwrap();
        let lines = listing(&mut partial);
        assert_eq!(lines.len(), 10);
        assert_eq!(lines.iter().filter(|l| l.starts_with('*')).count(), 4);

        // resuming against the partial archive saves the rest
        let resume_loc = ArchiveLocation::new(&store, "rest");
        let mut reader = LocalBackup::new();
        let stats = Archive::create(
            ui(true),
            &mut reader,
            &root,
            &resume_loc,
            Some(&mut partial),
            CreateOptions::default(),
        )
        .unwrap();
        assert_eq!(stats.treated, 6);
        assert_eq!(stats.skipped, 4);

        for d in [root, store] {
            fs::remove_dir_all(d).unwrap();
        }
    }

    /// A missing slice the user refuses to provide aborts the operation.
    #[test]
    fn missing_slice_refused() {
        let root = scratch("d-src");
        fs::write(root.join("big"), vec![0x5a; 1500]).unwrap();

        let store = scratch("d-store");
        let location = ArchiveLocation::new(&store, "cut");
        create_simple(
            &root,
            &location,
            CreateOptions {
                slice_size: Bigint::from(300u64),
                ..Default::default()
            },
        );
        assert!(store.join("cut.3.dar").exists());
        fs::remove_file(store.join("cut.2.dar")).unwrap();

        match Archive::open(ui(false), &location, OpenOptions::default()) {
            Err(Error::UserAbort(_)) => {}
            other => panic!("expected a user abort, got {other:?}"),
        }

        for d in [root, store] {
            fs::remove_dir_all(d).unwrap();
        }
    }

    /// With a corrupted tail and lax mode, the entries are rebuilt from
    /// the escape marks and the intact bodies stay restorable.
    #[test]
    fn lax_recovery_of_corrupted_tail() {
        let root = scratch("e-src");
        fs::write(root.join("a"), b"a body that must survive").unwrap();
        fs::write(root.join("b"), b"another body").unwrap();

        let store = scratch("e-store");
        let location = ArchiveLocation::new(&store, "hurt");
        create_simple(
            &root,
            &location,
            CreateOptions {
                sequential_marks: true,
                ..Default::default()
            },
        );
        // wreck the end of the slice
        let path = store.join("hurt.1.dar");
        let mut bytes = fs::read(&path).unwrap();
        let len = bytes.len();
        for b in &mut bytes[len - 100..] {
            *b = 0xee;
        }
        fs::write(&path, bytes).unwrap();

        assert!(Archive::open(ui(true), &location, OpenOptions::default()).is_err());
        let mut archive = Archive::open(
            ui(true),
            &location,
            OpenOptions {
                lax: true,
                ..Default::default()
            },
        )
        .unwrap();
        let lines = listing(&mut archive);
        assert!(lines.iter().any(|l| l.ends_with('a')));

        let out = scratch("e-out");
        let mut sink = LocalRestore::new(&out).unwrap();
        let opts = ExtractOptions {
            name_filter: Some(Box::new(|p| p == "a")),
            ..Default::default()
        };
        archive.extract(&mut sink, &opts).unwrap();
        assert_eq!(fs::read(out.join("a")).unwrap(), b"a body that must survive");

        for d in [root, store, out] {
            fs::remove_dir_all(d).unwrap();
        }
    }

    /// Merging with the preserve-newer policy keeps the most recent
    /// version, whatever the argument order.
    #[test]
    fn merge_preserve_newer_is_symmetric() {
        let store = scratch("f-store");
        let mut locations = Vec::new();
        for (tag, stamp, body) in [("x", 10i64, "old body"), ("y", 20i64, "new body")] {
            let root = scratch(&format!("f-{tag}"));
            fs::write(root.join("f"), body).unwrap();
            set_mtime(&root.join("f"), stamp);
            let location = ArchiveLocation::new(&store, tag);
            create_simple(&root, &location, CreateOptions::default());
            fs::remove_dir_all(&root).unwrap();
            locations.push(location);
        }

        for (first, second, tag) in [(1, 0, "m1"), (0, 1, "m2")] {
            let mut a = Archive::open(ui(true), &locations[first], OpenOptions::default()).unwrap();
            let mut b = Archive::open(ui(true), &locations[second], OpenOptions::default()).unwrap();
            let merged_loc = ArchiveLocation::new(&store, tag);
            Archive::merge(
                ui(true),
                &merged_loc,
                CreateOptions::default(),
                &mut a,
                Some(&mut b),
                MergeOptions {
                    policy: OverwritePolicy::PreserveNewer,
                    ..Default::default()
                },
            )
            .unwrap();

            let mut merged =
                Archive::open(ui(true), &merged_loc, OpenOptions::default()).unwrap();
            match merged.catalogue.lookup("f") {
                Some(Entry::File(f)) => {
                    assert_eq!(f.meta.mtime, Bigint::from(20u64), "order {tag}")
                }
                other => panic!("missing merged entry: {other:?}"),
            }
            let out = scratch(&format!("f-out-{tag}"));
            let mut sink = LocalRestore::new(&out).unwrap();
            merged.extract(&mut sink, &ExtractOptions::default()).unwrap();
            assert_eq!(fs::read(out.join("f")).unwrap(), b"new body");
            fs::remove_dir_all(&out).unwrap();
        }
        fs::remove_dir_all(&store).unwrap();
    }

    /// Merging an archive with itself under the preserve policy keeps
    /// the listing identical.
    #[test]
    fn self_merge_preserves_listing() {
        let root = scratch("g-src");
        fs::write(root.join("one"), b"1").unwrap();
        fs::create_dir(root.join("d")).unwrap();
        fs::write(root.join("d/two"), b"22").unwrap();

        let store = scratch("g-store");
        let location = ArchiveLocation::new(&store, "orig");
        create_simple(&root, &location, CreateOptions::default());

        let mut a = Archive::open(ui(true), &location, OpenOptions::default()).unwrap();
        let mut b = Archive::open(ui(true), &location, OpenOptions::default()).unwrap();
        let merged_loc = ArchiveLocation::new(&store, "same");
        Archive::merge(
            ui(true),
            &merged_loc,
            CreateOptions::default(),
            &mut a,
            Some(&mut b),
            MergeOptions {
                policy: OverwritePolicy::Preserve,
                ..Default::default()
            },
        )
        .unwrap();

        let mut merged = Archive::open(ui(true), &merged_loc, OpenOptions::default()).unwrap();
        assert_eq!(listing(&mut a), listing(&mut merged));

        for d in [root, store] {
            fs::remove_dir_all(d).unwrap();
        }
    }

    /// Re-slicing keeps the data name and the readable contents.
    #[test]
    fn xform_preserves_identity() {
        let root = scratch("h-src");
        let payload: Vec<u8> = (0..900usize).map(|i| (i * 37 % 251) as u8).collect();
        fs::write(root.join("payload"), &payload).unwrap();

        let store = scratch("h-store");
        let location = ArchiveLocation::new(&store, "one");
        create_simple(
            &root,
            &location,
            CreateOptions {
                compression: CompressionAlgo::Gzip,
                ..Default::default()
            },
        );

        let resliced = ArchiveLocation::new(&store, "many");
        Archive::xform(
            ui(true),
            &location,
            &resliced,
            Bigint::from(256u64),
            None,
        )
        .unwrap();
        assert!(store.join("many.2.dar").exists());

        let mut a = Archive::open(ui(true), &location, OpenOptions::default()).unwrap();
        let mut b = Archive::open(ui(true), &resliced, OpenOptions::default()).unwrap();
        assert_eq!(a.data_name(), b.data_name());
        assert_eq!(listing(&mut a), listing(&mut b));

        let out = scratch("h-out");
        let mut sink = LocalRestore::new(&out).unwrap();
        b.extract(&mut sink, &ExtractOptions::default()).unwrap();
        assert_eq!(fs::read(out.join("payload")).unwrap(), payload);

        for d in [root, store, out] {
            fs::remove_dir_all(d).unwrap();
        }
    }

    /// Ciphered, compressed archives round-trip and reject a wrong
    /// passphrase.
    #[test]
    fn ciphered_roundtrip() {
        let root = scratch("i-src");
        fs::write(root.join("secret"), vec![3u8; 5000]).unwrap();

        let store = scratch("i-store");
        let location = ArchiveLocation::new(&store, "vault");
        create_simple(
            &root,
            &location,
            CreateOptions {
                compression: CompressionAlgo::Gzip,
                cipher: CipherAlgo::Aes256,
                passphrase: "open sesame".to_string(),
                crypto_block: 1024,
                elastic_size: 64,
                ..Default::default()
            },
        );

        let mut archive = Archive::open(
            ui(true),
            &location,
            OpenOptions {
                passphrase: Some("open sesame".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        let stats = archive.test().unwrap();
        assert_eq!(stats.errored, 0);

        let out = scratch("i-out");
        let mut sink = LocalRestore::new(&out).unwrap();
        archive.extract(&mut sink, &ExtractOptions::default()).unwrap();
        assert_eq!(fs::read(out.join("secret")).unwrap(), vec![3u8; 5000]);

        assert!(Archive::open(
            ui(true),
            &location,
            OpenOptions {
                passphrase: Some("wrong".to_string()),
                ..Default::default()
            },
        )
        .is_err());

        for d in [root, store, out] {
            fs::remove_dir_all(d).unwrap();
        }
    }

    /// Delta signatures recorded on a full backup turn the next backup
    /// of a locally modified file into a binary patch, which restores.
    #[test]
    fn delta_backup_and_patch_restore() {
        let root = scratch("j-src");
        let mut body: Vec<u8> = (0..40_000usize).map(|i| (i % 251) as u8).collect();
        fs::write(root.join("big"), &body).unwrap();
        set_mtime(&root.join("big"), 1_650_000_000);

        let store = scratch("j-store");
        let full_loc = ArchiveLocation::new(&store, "full");
        create_simple(
            &root,
            &full_loc,
            CreateOptions {
                delta_signatures: true,
                ..Default::default()
            },
        );

        // restore the full state, then change a few bytes
        let out = scratch("j-out");
        let mut full = Archive::open(ui(true), &full_loc, OpenOptions::default()).unwrap();
        let mut sink = LocalRestore::new(&out).unwrap();
        full.extract(&mut sink, &ExtractOptions::default()).unwrap();

        body[100] ^= 0xff;
        body.extend_from_slice(b"tail growth");
        fs::write(root.join("big"), &body).unwrap();
        set_mtime(&root.join("big"), 1_650_000_777);

        let diff_loc = ArchiveLocation::new(&store, "diff");
        let mut reader = LocalBackup::new();
        Archive::create(
            ui(true),
            &mut reader,
            &root,
            &diff_loc,
            Some(&mut full),
            CreateOptions::default(),
        )
        .unwrap();

        let mut diff = Archive::open(ui(true), &diff_loc, OpenOptions::default()).unwrap();
        match diff.catalogue.lookup("big") {
            Some(Entry::File(f)) => {
                assert_eq!(f.meta.status, SavedStatus::Delta);
                // the patch is much smaller than the file
                assert!(f.data.stored_size < Bigint::from(body.len() / 2));
            }
            other => panic!("missing delta entry: {other:?}"),
        }

        let mut sink = LocalRestore::new(&out).unwrap();
        diff.extract(&mut sink, &ExtractOptions::default()).unwrap();
        assert_eq!(fs::read(out.join("big")).unwrap(), body);

        for d in [root, store, out] {
            fs::remove_dir_all(d).unwrap();
        }
    }

    /// Repair rebuilds a usable archive from a sequentially readable,
    /// tail-damaged one.
    #[test]
    fn repair_damaged_archive() {
        let root = scratch("k-src");
        fs::write(root.join("keep"), b"data worth repairing").unwrap();

        let store = scratch("k-store");
        let location = ArchiveLocation::new(&store, "sick");
        create_simple(
            &root,
            &location,
            CreateOptions {
                sequential_marks: true,
                ..Default::default()
            },
        );
        let path = store.join("sick.1.dar");
        let mut bytes = fs::read(&path).unwrap();
        let len = bytes.len();
        for b in &mut bytes[len - 60..] {
            *b = 0x11;
        }
        fs::write(&path, bytes).unwrap();

        let fixed_loc = ArchiveLocation::new(&store, "fixed");
        Archive::repair(
            ui(true),
            &location,
            &fixed_loc,
            CreateOptions {
                sequential_marks: true,
                ..Default::default()
            },
        )
        .unwrap();

        let mut fixed = Archive::open(ui(true), &fixed_loc, OpenOptions::default()).unwrap();
        let out = scratch("k-out");
        let mut sink = LocalRestore::new(&out).unwrap();
        fixed.extract(&mut sink, &ExtractOptions::default()).unwrap();
        assert_eq!(fs::read(out.join("keep")).unwrap(), b"data worth repairing");

        for d in [root, store, out] {
            fs::remove_dir_all(d).unwrap();
        }
    }

    /// The worker-offloaded slice layer behaves like the plain one.
    #[test]
    fn threaded_roundtrip() {
        let root = scratch("m-src");
        fs::write(root.join("data"), vec![0x42; 2000]).unwrap();

        let store = scratch("m-store");
        let location = ArchiveLocation::new(&store, "thr");
        create_simple(
            &root,
            &location,
            CreateOptions {
                threaded: true,
                compression: CompressionAlgo::Gzip,
                slice_size: Bigint::from(700u64),
                ..Default::default()
            },
        );

        let mut archive = Archive::open(
            ui(true),
            &location,
            OpenOptions {
                threaded: true,
                ..Default::default()
            },
        )
        .unwrap();
        let out = scratch("m-out");
        let mut sink = LocalRestore::new(&out).unwrap();
        archive.extract(&mut sink, &ExtractOptions::default()).unwrap();
        archive.close().unwrap();
        assert_eq!(fs::read(out.join("data")).unwrap(), vec![0x42; 2000]);

        for d in [root, store, out] {
            fs::remove_dir_all(d).unwrap();
        }
    }

    /// Hard-linked files share one inode in the archive and after
    /// restoration.
    #[test]
    fn hard_links_roundtrip() {
        let root = scratch("l-src");
        fs::write(root.join("first"), b"linked data").unwrap();
        fs::hard_link(root.join("first"), root.join("second")).unwrap();

        let store = scratch("l-store");
        let location = ArchiveLocation::new(&store, "links");
        let stats = create_simple(&root, &location, CreateOptions::default());
        assert_eq!(stats.hard_links, 1);

        let mut archive = Archive::open(ui(true), &location, OpenOptions::default()).unwrap();
        let out = scratch("l-out");
        let mut sink = LocalRestore::new(&out).unwrap();
        archive.extract(&mut sink, &ExtractOptions::default()).unwrap();
        assert_eq!(fs::read(out.join("first")).unwrap(), b"linked data");
        assert_eq!(fs::read(out.join("second")).unwrap(), b"linked data");
        let a = fs::metadata(out.join("first")).unwrap();
        let b = fs::metadata(out.join("second")).unwrap();
        assert_eq!(
            std::os::unix::fs::MetadataExt::ino(&a),
            std::os::unix::fs::MetadataExt::ino(&b)
        );

        for d in [root, store, out] {
            fs::remove_dir_all(d).unwrap();
        }
    }
}

