//! A streaming reader for the 7z archive format and the LZ77/LZ4 block
//! compression core behind it, written in pure Rust.
//!
//! ## Reading archives
//!
//! [`ArchiveReader`] parses the archive metadata in two passes (a sanity and
//! memory-estimate scan over the raw header, then the allocating parse) and
//! offers sequential, random and bulk access to the entries. Solid blocks
//! are handled transparently: random access into a solid block streams and
//! discards the preceding entries instead of materialising them.
//!
//! ```no_run
//! use sevenz_stream::{ArchiveReader, ReaderOptions};
//!
//! let mut reader = ArchiveReader::open("example.7z", ReaderOptions::default()).unwrap();
//! while let Some(entry) = reader.next_entry() {
//!     println!("{} ({} bytes)", entry.name(), entry.size());
//! }
//! ```
//!
//! ## Supported codecs
//!
//! | Codec        | Decompression |
//! |--------------|---------------|
//! | COPY         | ✓             |
//! | LZMA         | ✓             |
//! | LZMA2        | ✓             |
//! | BZIP2        | ✓             |
//! | DEFLATE      | ✓             |
//! | LZ4 (*)      | ✓             |
//! | ZSTD (*)     | ✓             |
//! | BROTLI (*)   | ✓             |
//!
//! (*) Require an optional cargo feature.
//!
//! AES-256/SHA-256 encrypted streams are recognised in the coder pipeline
//! but not decrypted; opening them without a password fails with
//! [`Error::PasswordRequired`].
//!
//! ## Compression core
//!
//! The [`lz77`] module holds the sliding-window hash-chain matcher, the
//! [`lz4`] module the LZ4 block encoder built on it, including the
//! end-of-block rewrite the LZ4 block format demands.
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

pub(crate) mod archive;
pub(crate) mod bitset;
pub(crate) mod block;
pub(crate) mod decoder;
mod encryption;
mod error;
pub mod lz4;
pub mod lz77;
mod options;
mod reader;
mod sanity;
mod time;

pub use archive::{Archive, ArchiveEntry, CoderMethod, StreamMap};
pub use block::{Block, Coder, OrderedCoderIter};
pub use encryption::Password;
pub use error::Error;
pub use options::{DEFAULT_RECOVERY_SEARCH_LIMIT, ReaderOptions};
pub use reader::{
    ArchiveReader, BlockDecoder, BoundedReader, EntryReader, SeekableBoundedReader,
};
pub use time::{NtTime, NtTimeError};
