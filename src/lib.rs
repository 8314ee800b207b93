//! Disk-archive backup and restoration engine.
//!
//! `darch` produces and reads a self-describing, optionally multi-sliced,
//! optionally ciphered and compressed archive format. The archive is a
//! stack of stream layers (slicing, cipher, escape marks, compression)
//! below a catalogue of filesystem entries; on top of that, the
//! [`archive::Archive`] coordinator drives backup, restore, test, diff,
//! merge, isolate, repair and re-slicing operations.

pub mod archive;
pub mod bigint;
pub mod catalogue;
pub mod compress;
pub mod crc;
pub mod crypto;
pub mod delta;
pub mod error;
pub mod escape;
pub mod fs;
pub mod hook;
pub mod label;
pub mod pile;
pub mod range;
pub mod remote;
pub mod slice;
pub mod statistics;
pub mod stream;
pub mod tlv;
pub mod user;

pub use archive::Archive;
pub use archive::ArchiveLocation;
pub use archive::CreateOptions;
pub use archive::ExtractOptions;
pub use archive::OpenOptions;
pub use bigint::Bigint;
pub use error::Error;
pub use error::Result;
pub use label::Label;
pub use statistics::Statistics;
pub use user::UserInteraction;
