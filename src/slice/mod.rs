//! Slicing layer: presents a continuous logical byte stream over a set
//! of numbered slice files.

pub mod hash;
pub mod header;
pub mod layout;
pub mod single;

use crate::bigint::Bigint;
use crate::error::Error;
use crate::error::IoKind;
use crate::error::Result;
use crate::hook::HookCall;
use crate::hook::HookContext;
use crate::hook::SliceHook;
use crate::label::Label;
use crate::slice::hash::HashAlgo;
use crate::slice::hash::HashStream;
use crate::slice::header::SliceHeader;
use crate::slice::header::EXTENSION_SIZE;
use crate::slice::header::EXTENSION_TLV;
use crate::slice::header::FLAG_LOCATED_AT_END;
use crate::slice::header::FLAG_NON_TERMINAL;
use crate::slice::header::FLAG_TERMINAL;
use crate::slice::layout::SliceLayout;
use crate::stream::check_not_terminated;
use crate::stream::file::FileStream;
use crate::stream::read_u8;
use crate::stream::Mode;
use crate::stream::SkipDirection;
use crate::stream::Stream;
use crate::user::Ui;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

/// Naming scheme of the slice files: `base.N.ext` with a configurable
/// minimum number of digits.
#[derive(Clone, Debug)]
pub struct SliceFileSet {
    pub dir: PathBuf,
    pub base: String,
    pub extension: String,
    pub min_digits: usize,
}

impl SliceFileSet {
    pub fn new(dir: &Path, base: &str, extension: &str, min_digits: usize) -> Self {
        Self {
            dir: dir.to_path_buf(),
            base: base.to_string(),
            extension: extension.to_string(),
            min_digits: min_digits.max(1),
        }
    }

    /// Zero-padded decimal slice number.
    pub fn padded(&self, num: usize) -> String {
        format!("{:0width$}", num, width = self.min_digits)
    }

    /// Path of the given slice.
    pub fn path_of(&self, num: usize) -> PathBuf {
        self.dir
            .join(format!("{}.{}.{}", self.base, self.padded(num), self.extension))
    }

    fn hook_call(&self, context: HookContext, num: usize) -> HookCall {
        HookCall {
            context,
            parent: self.dir.clone(),
            basename: self.base.clone(),
            number: num,
            padded_number: self.padded(num),
            extension: self.extension.clone(),
            url: String::new(),
        }
    }
}

/// Knobs of the writing side.
#[derive(Clone)]
pub struct SliceWriteOptions {
    /// Size of every slice file but possibly the first.
    pub slice_size: Bigint,
    /// Size of the first slice file, when different.
    pub first_slice_size: Option<Bigint>,
    /// Allow overwriting existing slice files.
    pub allow_over: bool,
    /// Ask before overwriting.
    pub warn_over: bool,
    /// Force these permission bits on new slices.
    pub permission: Option<u32>,
    /// Force this owner and group on new slices.
    pub ownership: Option<(i64, i64)>,
    /// Companion digest files to produce.
    pub hash: HashAlgo,
    /// Ask the user to get ready again every that many slices. Zero
    /// never pauses.
    pub pause_every: usize,
    /// Command run when a slice is completed.
    pub hook: Option<Arc<dyn SliceHook + Send + Sync>>,
}

impl Default for SliceWriteOptions {
    fn default() -> Self {
        Self {
            slice_size: Bigint::zero(),
            first_slice_size: None,
            allow_over: true,
            warn_over: false,
            permission: None,
            ownership: None,
            hash: HashAlgo::None,
            pause_every: 0,
            hook: None,
        }
    }
}

/// Writing side of the slicing layer.
pub struct SliceWriter {
    ui: Ui,
    files: SliceFileSet,
    opts: SliceWriteOptions,
    internal_name: Label,
    data_name: Label,
    layout: SliceLayout,
    current: Option<Box<dyn Stream + Send>>,
    slice_num: usize,
    /// Payload bytes already written in the current slice.
    written: Bigint,
    /// Cleared when the user aborts, so no completion script runs on the
    /// final slice.
    final_hook_enabled: bool,
    terminated: bool,
}

impl SliceWriter {
    /// Creates the first slice and writes its header.
    pub fn create(
        ui: Ui,
        files: SliceFileSet,
        opts: SliceWriteOptions,
        internal_name: Label,
        data_name: Label,
    ) -> Result<Self> {
        let header = SliceHeader::new(
            internal_name,
            data_name,
            opts.slice_size.clone(),
            opts.first_slice_size.clone(),
        );
        let header_size = header.wire_size()?;
        let first = opts
            .first_slice_size
            .clone()
            .filter(|s| !s.is_zero())
            .unwrap_or_else(|| opts.slice_size.clone());
        let layout = SliceLayout::new(
            first,
            opts.slice_size.clone(),
            header_size.clone(),
            header_size,
        )?;
        let mut writer = Self {
            ui,
            files,
            opts,
            internal_name,
            data_name,
            layout,
            current: None,
            slice_num: 0,
            written: Bigint::zero(),
            final_hook_enabled: true,
            terminated: false,
        };
        writer.open_slice(1)?;
        Ok(writer)
    }

    /// Geometry of the written slices.
    pub fn layout(&self) -> &SliceLayout {
        &self.layout
    }

    pub fn internal_name(&self) -> Label {
        self.internal_name
    }

    pub fn data_name(&self) -> Label {
        self.data_name
    }

    /// Prevents the completion script from running on the last slice.
    pub fn disable_final_hook(&mut self) {
        self.final_hook_enabled = false;
    }

    fn capacity_of(&self, num: usize) -> Result<Bigint> {
        if num == 1 {
            self.layout.first_capacity()
        } else {
            self.layout.other_capacity()
        }
    }

    fn open_slice(&mut self, num: usize) -> Result<()> {
        let path = self.files.path_of(num);
        if path.exists() {
            if !self.opts.allow_over {
                return Err(Error::System {
                    kind: IoKind::Exist,
                    message: format!("{} already exists", path.display()),
                });
            }
            if self.opts.warn_over && !self.belongs_to_us(&path) {
                self.ui.pause_or_abort(&format!(
                    "{} is about to be overwritten, continue?",
                    path.display()
                ))?;
            }
        }
        let file = FileStream::create_write(&path, false)?;
        if let Some(mode) = self.opts.permission {
            file.set_permission(mode)?;
        }
        if let Some((uid, gid)) = self.opts.ownership {
            file.set_ownership(uid, gid)?;
        }
        let mut stream: Box<dyn Stream + Send> = if self.opts.hash != HashAlgo::None {
            Box::new(HashStream::new(Box::new(file), self.opts.hash, &path))
        } else {
            Box::new(file)
        };
        let mut header = SliceHeader::new(
            self.internal_name,
            self.data_name,
            self.opts.slice_size.clone(),
            self.opts.first_slice_size.clone(),
        );
        header.flag = FLAG_LOCATED_AT_END;
        header.write(stream.as_mut())?;
        self.current = Some(stream);
        self.slice_num = num;
        self.written = Bigint::zero();
        Ok(())
    }

    /// Tells whether an existing file is a slice carrying our own
    /// internal name, in which case overwriting needs no confirmation.
    fn belongs_to_us(&self, path: &Path) -> bool {
        let Ok(mut file) = FileStream::open_read(path) else {
            return false;
        };
        match SliceHeader::read(&mut file, &self.ui, true) {
            Ok(h) => h.internal_name == self.internal_name,
            Err(_) => false,
        }
    }

    fn close_slice(&mut self, flag: u8) -> Result<()> {
        let mut stream = self
            .current
            .take()
            .ok_or_else(|| Error::bug("closing a slice while none is open"))?;
        stream.write(&[flag])?;
        stream.terminate()?;
        let context = if flag == FLAG_TERMINAL {
            HookContext::LastSlice
        } else {
            HookContext::Operation
        };
        let run_hook = context != HookContext::LastSlice || self.final_hook_enabled;
        if run_hook {
            if let Some(hook) = &self.opts.hook {
                hook.execute(&self.files.hook_call(context, self.slice_num))?;
            }
        }
        Ok(())
    }

    fn next_slice(&mut self) -> Result<()> {
        self.close_slice(FLAG_NON_TERMINAL)?;
        if self.opts.pause_every > 0 && self.slice_num % self.opts.pause_every == 0 {
            self.ui.pause_or_abort(&format!(
                "slice {} is done, ready to continue?",
                self.slice_num
            ))?;
        }
        self.open_slice(self.slice_num + 1)
    }
}

impl Stream for SliceWriter {
    fn mode(&self) -> Mode {
        Mode::Write
    }

    fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::misuse("read on the writing side of the slicing layer"))
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        check_not_terminated(self)?;
        let mut rest = buf;
        while !rest.is_empty() {
            let cap = self.capacity_of(self.slice_num)?;
            let room = cap.sub(&self.written)?;
            if room.is_zero() {
                self.next_slice()?;
                continue;
            }
            let chunk = match room.to_usize() {
                Some(r) => rest.len().min(r),
                None => rest.len(),
            };
            match &mut self.current {
                Some(s) => s.write(&rest[..chunk])?,
                None => return Err(Error::bug("no slice open while writing")),
            }
            self.written += chunk as u64;
            rest = &rest[chunk..];
        }
        Ok(())
    }

    fn skip(&mut self, pos: &Bigint) -> Result<bool> {
        check_not_terminated(self)?;
        // slices are written front to back only
        Ok(*pos == self.position()?)
    }

    fn skip_relative(&mut self, delta: i64) -> Result<bool> {
        check_not_terminated(self)?;
        Ok(delta == 0)
    }

    fn skip_to_eof(&mut self) -> Result<bool> {
        check_not_terminated(self)?;
        Ok(true)
    }

    fn position(&self) -> Result<Bigint> {
        check_not_terminated(self)?;
        let header = if self.slice_num == 1 {
            &self.layout.first_header_size
        } else {
            &self.layout.other_header_size
        };
        self.layout
            .relocate(self.slice_num, &(header + &self.written))
    }

    fn skippable(&self, _direction: SkipDirection, amount: &Bigint) -> bool {
        amount.is_zero()
    }

    fn sync_write(&mut self) -> Result<()> {
        check_not_terminated(self)?;
        match &mut self.current {
            Some(s) => s.sync_write(),
            None => Ok(()),
        }
    }

    fn flush_read(&mut self) -> Result<()> {
        check_not_terminated(self)
    }

    fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;
        if self.current.is_some() {
            self.close_slice(FLAG_TERMINAL)?;
        }
        Ok(())
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

/// Knobs of the reading side.
#[derive(Clone, Default)]
pub struct SliceReadOptions {
    /// Keep going over malformed headers and mismatched names.
    pub lax: bool,
    /// Open the highest-numbered slice first and position at the end,
    /// without touching the first slice.
    pub by_the_end: bool,
    /// Command run when another slice is about to be needed.
    pub hook: Option<Arc<dyn SliceHook + Send + Sync>>,
}

struct OpenSlice {
    file: FileStream,
    /// Payload bytes held by this slice file.
    payload: Bigint,
    flag: u8,
    /// Zeroes already synthesized past a truncated payload (lax mode).
    zero_fill: Bigint,
}

/// Reading side of the slicing layer.
pub struct SliceReader {
    ui: Ui,
    files: SliceFileSet,
    opts: SliceReadOptions,
    internal_name: Label,
    data_name: Label,
    layout: SliceLayout,
    current: Option<OpenSlice>,
    slice_num: usize,
    last_slice: Option<usize>,
    terminated: bool,
}

impl SliceReader {
    /// Opens the slice set for reading.
    pub fn open(ui: Ui, files: SliceFileSet, opts: SliceReadOptions) -> Result<Self> {
        let start_num = if opts.by_the_end {
            Self::find_highest(&files)?
        } else {
            1
        };
        let mut reader = Self {
            ui,
            files,
            opts,
            internal_name: Label::cleared(),
            data_name: Label::cleared(),
            layout: SliceLayout {
                first_size: Bigint::zero(),
                other_size: Bigint::zero(),
                first_header_size: Bigint::zero(),
                other_header_size: Bigint::zero(),
            },
            current: None,
            slice_num: 0,
            last_slice: None,
            terminated: false,
        };
        reader.first_open(start_num)?;
        if reader.opts.by_the_end {
            reader.skip_to_eof()?;
        }
        Ok(reader)
    }

    /// Highest slice number present on disk.
    fn find_highest(files: &SliceFileSet) -> Result<usize> {
        let mut num = 1;
        if !files.path_of(1).exists() {
            return Ok(1);
        }
        while files.path_of(num + 1).exists() {
            num += 1;
        }
        Ok(num)
    }

    /// Geometry of the read slices.
    pub fn layout(&self) -> &SliceLayout {
        &self.layout
    }

    pub fn internal_name(&self) -> Label {
        self.internal_name
    }

    /// Data set identity carried by the headers. Cleared on formats too
    /// old to carry one.
    pub fn data_name(&self) -> Label {
        self.data_name
    }

    /// Opens the starting slice, learns the geometry from its header and
    /// the file sizes.
    fn first_open(&mut self, num: usize) -> Result<()> {
        let (mut file, header) = self.open_and_check(num, true)?;
        let header_size = file.position()?;
        let fs_size = file.fs_size()?;
        let (first_size, other_size) = match header.extension {
            EXTENSION_TLV => {
                let other = match &header.slice_size {
                    Some(s) if !s.is_zero() => s.clone(),
                    _ => self.hunt_for_size(num)?,
                };
                let first = header
                    .first_size
                    .clone()
                    .filter(|s| !s.is_zero())
                    .unwrap_or_else(|| other.clone());
                (first, other)
            }
            EXTENSION_SIZE => {
                let other = header
                    .slice_size
                    .clone()
                    .ok_or_else(|| Error::range("size extension without a size"))?;
                // the first slice size is whatever the filesystem says
                let first = if num == 1 { fs_size.clone() } else { other.clone() };
                (first, other)
            }
            _ => {
                // oldest format: a single uniform size, the one of the
                // file holding the header
                (fs_size.clone(), fs_size.clone())
            }
        };
        self.layout = SliceLayout::new(
            first_size,
            other_size,
            header_size.clone(),
            header_size.clone(),
        )?;
        if let Some(name) = header.data_name {
            self.data_name = name;
        }
        self.internal_name = header.internal_name;
        self.install_slice(num, file, header.flag)?;
        Ok(())
    }

    /// In lax mode, looks into further slices for a usable size field.
    fn hunt_for_size(&mut self, from: usize) -> Result<Bigint> {
        if !self.opts.lax {
            return Err(Error::range("slice size zero or absent in header"));
        }
        let mut num = from + 1;
        while self.files.path_of(num).exists() {
            self.ui.message(&format!(
                "slice size not found in slice {from}, looking into slice {num}"
            ));
            let (_file, header) = self.open_and_check(num, true)?;
            if let Some(size) = header.slice_size.filter(|s| !s.is_zero()) {
                return Ok(size);
            }
            num += 1;
        }
        Err(Error::range(
            "no slice of the archive carries a usable slice size",
        ))
    }

    /// Opens a slice file, prompting the user while it is missing, and
    /// validates its header.
    fn open_and_check(&self, num: usize, first: bool) -> Result<(FileStream, SliceHeader)> {
        let path = self.files.path_of(num);
        loop {
            if let Some(hook) = &self.opts.hook {
                // give the hook a chance to fetch the slice
                if !path.exists() {
                    let _ = hook.execute(&self.files.hook_call(HookContext::Operation, num));
                }
            }
            match FileStream::open_read(&path) {
                Ok(mut file) => {
                    let header = SliceHeader::read(&mut file, &self.ui, self.opts.lax)?;
                    if !first && header.internal_name != self.internal_name {
                        if !self.opts.lax {
                            return Err(Error::data(format!(
                                "{} belongs to another archive",
                                path.display()
                            )));
                        }
                        self.ui.message(&format!(
                            "{} does not carry the expected internal name, proceeding anyway",
                            path.display()
                        ));
                    }
                    return Ok((file, header));
                }
                Err(Error::System {
                    kind: IoKind::Absent,
                    ..
                }) => {
                    self.ui.pause_or_abort(&format!(
                        "{} is required for further operation, please provide it. Retry?",
                        path.display()
                    ))?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Resolves the flag of a freshly opened slice and installs it as
    /// the current one, positioned at the start of its payload.
    fn install_slice(&mut self, num: usize, mut file: FileStream, mut flag: u8) -> Result<()> {
        let fs_size = file.fs_size()?;
        if flag == FLAG_LOCATED_AT_END {
            let back = file.position()?;
            file.skip_to_eof()?;
            file.skip_relative(-1)?;
            flag = read_u8(&mut file)?;
            file.skip(&back)?;
        }
        if flag != FLAG_TERMINAL && flag != FLAG_NON_TERMINAL {
            if !self.opts.lax {
                return Err(Error::data("corrupted flag byte in slice"));
            }
            flag = if self.ui.pause(&format!(
                "corrupted flag in slice {num}, is it the last slice of the archive?"
            )) {
                FLAG_TERMINAL
            } else {
                FLAG_NON_TERMINAL
            };
        }
        if flag == FLAG_TERMINAL {
            self.last_slice = Some(num);
        }
        let header = if num == 1 {
            &self.layout.first_header_size
        } else {
            &self.layout.other_header_size
        };
        let overhead = header + &Bigint::from(1u64);
        let payload = fs_size.checked_sub(&overhead).unwrap_or_default();
        file.skip(header)?;
        self.current = Some(OpenSlice {
            file,
            payload,
            flag,
            zero_fill: Bigint::zero(),
        });
        self.slice_num = num;
        Ok(())
    }

    fn advance_slice(&mut self) -> Result<bool> {
        let flag = match &self.current {
            Some(s) => s.flag,
            None => return Err(Error::bug("no slice open while reading")),
        };
        if flag == FLAG_TERMINAL {
            return Ok(false);
        }
        let num = self.slice_num + 1;
        let (file, header) = self.open_and_check(num, false)?;
        if let Some(mut old) = self.current.take() {
            old.file.terminate()?;
        }
        self.install_slice(num, file, header.flag)?;
        Ok(true)
    }

    /// Expected payload capacity of the current slice.
    fn capacity(&self) -> Result<Bigint> {
        if self.slice_num == 1 {
            self.layout.first_capacity()
        } else {
            self.layout.other_capacity()
        }
    }

    /// Payload bytes consumed so far in the current slice.
    fn consumed(&self) -> Result<Bigint> {
        let slice = self
            .current
            .as_ref()
            .ok_or_else(|| Error::bug("no slice open"))?;
        let header = if self.slice_num == 1 {
            &self.layout.first_header_size
        } else {
            &self.layout.other_header_size
        };
        Ok(&slice.file.position()?.sub(header)? + &slice.zero_fill)
    }
}

impl Stream for SliceReader {
    fn mode(&self) -> Mode {
        Mode::Read
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        check_not_terminated(self)?;
        let mut done = 0;
        while done < buf.len() {
            let consumed = self.consumed()?;
            let is_last = self.current.as_ref().is_some_and(|s| s.flag == FLAG_TERMINAL);
            let payload_end = match &self.current {
                Some(s) => s.payload.clone(),
                None => return Err(Error::bug("no slice open while reading")),
            };
            let cap = self.capacity()?;
            // how far this slice's data extends: the file payload for the
            // last slice, the full capacity otherwise
            let data_end = if is_last { payload_end.clone() } else { cap };
            let left = data_end.checked_sub(&consumed).unwrap_or_default();
            if left.is_zero() {
                if !self.advance_slice()? {
                    break;
                }
                continue;
            }
            let want = match left.to_usize() {
                Some(l) => (buf.len() - done).min(l),
                None => buf.len() - done,
            };
            // bytes really present in the file
            let in_file = payload_end.checked_sub(&consumed).unwrap_or_default();
            if in_file.is_zero() {
                // truncated slice: the remainder is synthesized as zeroes
                // in lax mode
                if !self.opts.lax {
                    return Err(Error::data(format!(
                        "slice {} is truncated",
                        self.slice_num
                    )));
                }
                self.ui.message(&format!(
                    "slice {} is truncated, filling the gap with zeroed bytes",
                    self.slice_num
                ));
                buf[done..done + want].fill(0);
                if let Some(s) = &mut self.current {
                    s.zero_fill += want as u64;
                }
                done += want;
                continue;
            }
            let readable = match in_file.to_usize() {
                Some(l) => want.min(l),
                None => want,
            };
            let n = match &mut self.current {
                Some(s) => s.file.read(&mut buf[done..done + readable])?,
                None => 0,
            };
            if n == 0 {
                return Err(Error::data(format!(
                    "slice {} shorter than its recorded payload",
                    self.slice_num
                )));
            }
            done += n;
        }
        Ok(done)
    }

    fn write(&mut self, _buf: &[u8]) -> Result<()> {
        Err(Error::misuse("write on the reading side of the slicing layer"))
    }

    fn skip(&mut self, pos: &Bigint) -> Result<bool> {
        check_not_terminated(self)?;
        let (num, in_file) = self.layout.locate(pos)?;
        if let Some(last) = self.last_slice {
            if num > last {
                self.skip_to_eof()?;
                return Ok(false);
            }
        }
        if num != self.slice_num || self.current.is_none() {
            let (file, header) = self.open_and_check(num, false)?;
            if let Some(mut old) = self.current.take() {
                old.file.terminate()?;
            }
            self.install_slice(num, file, header.flag)?;
        }
        match &mut self.current {
            Some(s) => {
                s.zero_fill = Bigint::zero();
                s.file.skip(&in_file)
            }
            None => Err(Error::bug("no slice open after skip")),
        }
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
        let last = match self.last_slice {
            Some(n) => n,
            None => {
                // walk the flags forward: only the terminal slice knows
                // it is the last one
                while self.advance_slice()? {}
                self.slice_num
            }
        };
        if last != self.slice_num || self.current.is_none() {
            let (file, header) = self.open_and_check(last, false)?;
            if let Some(mut old) = self.current.take() {
                old.file.terminate()?;
            }
            self.install_slice(last, file, header.flag)?;
        }
        let payload = match &self.current {
            Some(s) => s.payload.clone(),
            None => Bigint::zero(),
        };
        let header = if last == 1 {
            &self.layout.first_header_size
        } else {
            &self.layout.other_header_size
        };
        let target = header + &payload;
        match &mut self.current {
            Some(s) => {
                s.zero_fill = Bigint::zero();
                s.file.skip(&target)
            }
            None => Err(Error::bug("no slice open after skip")),
        }
    }

    fn position(&self) -> Result<Bigint> {
        check_not_terminated(self)?;
        let slice = self
            .current
            .as_ref()
            .ok_or_else(|| Error::bug("no slice open"))?;
        let in_file = &slice.file.position()? + &slice.zero_fill;
        self.layout.relocate(self.slice_num, &in_file)
    }

    fn skippable(&self, _direction: SkipDirection, _amount: &Bigint) -> bool {
        true
    }

    fn sync_write(&mut self) -> Result<()> {
        check_not_terminated(self)
    }

    fn flush_read(&mut self) -> Result<()> {
        check_not_terminated(self)
    }

    fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;
        if let Some(mut slice) = self.current.take() {
            slice.file.terminate()?;
        }
        Ok(())
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::ScriptedInteraction;
    use std::fs;

    fn ui(accept: bool) -> Ui {
        Arc::new(ScriptedInteraction::new(accept, ""))
    }

    fn fileset(tag: &str) -> SliceFileSet {
        let dir = std::env::temp_dir().join(format!("darch-slice-{}-{tag}", std::process::id()));
        let _ = fs::create_dir_all(&dir);
        SliceFileSet::new(&dir, "arc", "dar", 1)
    }

    fn cleanup(files: &SliceFileSet) {
        let _ = fs::remove_dir_all(&files.dir);
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn multi_slice_roundtrip() {
        let files = fileset("round");
        let opts = SliceWriteOptions {
            slice_size: Bigint::from(128u64),
            ..Default::default()
        };
        let data = payload(500);
        let mut w = SliceWriter::create(
            ui(true),
            files.clone(),
            opts,
            Label::generate(),
            Label::generate(),
        )
        .unwrap();
        w.write(&data).unwrap();
        w.terminate().unwrap();

        // several slices must exist, all 128 bytes but the last
        assert!(files.path_of(2).exists());
        let mut n = 1;
        while files.path_of(n + 1).exists() {
            assert_eq!(fs::metadata(files.path_of(n)).unwrap().len(), 128);
            n += 1;
        }

        let mut r = SliceReader::open(ui(true), files.clone(), SliceReadOptions::default()).unwrap();
        let mut back = vec![0u8; data.len() + 10];
        let mut done = 0;
        loop {
            let n = r.read(&mut back[done..]).unwrap();
            if n == 0 {
                break;
            }
            done += n;
        }
        assert_eq!(done, data.len());
        assert_eq!(&back[..done], &data[..]);

        // random access through the layout
        assert!(r.skip(&Bigint::from(300u64)).unwrap());
        let mut one = [0u8; 1];
        assert_eq!(r.read(&mut one).unwrap(), 1);
        assert_eq!(one[0], data[300]);
        r.terminate().unwrap();
        cleanup(&files);
    }

    #[test]
    fn missing_slice_aborts_when_refused() {
        let files = fileset("missing");
        let opts = SliceWriteOptions {
            slice_size: Bigint::from(100u64),
            ..Default::default()
        };
        let data = payload(300);
        let mut w = SliceWriter::create(
            ui(true),
            files.clone(),
            opts,
            Label::generate(),
            Label::generate(),
        )
        .unwrap();
        w.write(&data).unwrap();
        w.terminate().unwrap();

        fs::remove_file(files.path_of(2)).unwrap();

        let mut r = SliceReader::open(ui(false), files.clone(), SliceReadOptions::default()).unwrap();
        let mut sink = vec![0u8; 400];
        let res = loop {
            match r.read(&mut sink) {
                Ok(0) => break Ok(()),
                Ok(_) => continue,
                Err(e) => break Err(e),
            }
        };
        match res {
            Err(Error::UserAbort(_)) => {}
            other => panic!("expected a user abort, got {other:?}"),
        }
        cleanup(&files);
    }

    #[test]
    fn terminal_flag_walk() {
        let files = fileset("flags");
        let opts = SliceWriteOptions {
            slice_size: Bigint::from(100u64),
            first_slice_size: Some(Bigint::from(80u64)),
            ..Default::default()
        };
        let data = payload(150);
        let mut w = SliceWriter::create(
            ui(true),
            files.clone(),
            opts,
            Label::generate(),
            Label::generate(),
        )
        .unwrap();
        w.write(&data).unwrap();
        w.terminate().unwrap();

        // every slice but the last ends with the non-terminal flag
        let mut n = 1;
        let mut terminal_seen = 0;
        loop {
            let path = files.path_of(n);
            if !path.exists() {
                break;
            }
            let bytes = fs::read(&path).unwrap();
            match *bytes.last().unwrap() {
                FLAG_TERMINAL => terminal_seen += 1,
                FLAG_NON_TERMINAL => assert!(files.path_of(n + 1).exists()),
                other => panic!("unexpected trailing flag {other}"),
            }
            n += 1;
        }
        assert_eq!(terminal_seen, 1);

        // opening by the end positions at the logical end of the data
        let mut r = SliceReader::open(
            ui(true),
            files.clone(),
            SliceReadOptions {
                by_the_end: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(r.position().unwrap().to_u64(), Some(data.len() as u64));
        r.terminate().unwrap();
        cleanup(&files);
    }
}
