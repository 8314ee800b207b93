//! Per-operation counters reported to the caller.

use crate::bigint::Bigint;
use std::fmt;

/// Counters accumulated over one backup, restore, diff, test or merge.
#[derive(Clone, Debug, Default)]
pub struct Statistics {
    /// Entries fully processed.
    pub treated: u64,
    /// Hard link occurrences resolved to an already processed inode.
    pub hard_links: u64,
    /// Entries skipped because unchanged since the reference.
    pub skipped: u64,
    /// Entries excluded by the filters.
    pub ignored: u64,
    /// Entries detected as moved or renamed.
    pub tooold: u64,
    /// Entries restored over more recent ones.
    pub overwritten: u64,
    /// Entries that raised a per-entry error.
    pub errored: u64,
    /// Deletion markers processed.
    pub deleted: u64,
    /// Extended attribute sets processed.
    pub ea_treated: u64,
    /// Filesystem-specific attribute sets processed.
    pub fsa_treated: u64,
    /// Bytes of payload moved.
    pub byte_amount: Bigint,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of the entry-level counters.
    pub fn total(&self) -> u64 {
        self.treated
            + self.hard_links
            + self.skipped
            + self.ignored
            + self.tooold
            + self.errored
            + self.deleted
    }

    pub fn add_bytes(&mut self, amount: &Bigint) {
        self.byte_amount += amount;
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(fmt, " treated     : {}", self.treated)?;
        writeln!(fmt, " hard links  : {}", self.hard_links)?;
        writeln!(fmt, " skipped     : {}", self.skipped)?;
        writeln!(fmt, " ignored     : {}", self.ignored)?;
        writeln!(fmt, " overwritten : {}", self.overwritten)?;
        writeln!(fmt, " too old     : {}", self.tooold)?;
        writeln!(fmt, " errored     : {}", self.errored)?;
        writeln!(fmt, " deleted     : {}", self.deleted)?;
        writeln!(fmt, " ea treated  : {}", self.ea_treated)?;
        writeln!(fmt, " fsa treated : {}", self.fsa_treated)?;
        write!(fmt, " byte amount : {}", self.byte_amount)
    }
}
