//! Binary block records for SDC documents.
//!
//! A document is a text tree followed by zero or more binary blocks. This
//! crate owns the on-disk side of those blocks:
//!
//! - **Record framing**: magic, big-endian header, payload, zero padding
//! - **Compression**: zlib (`flate2`) and zstd, with per-block parameters
//! - **Checksums**: MD5 of the decoded payload, validated on request
//! - **Block index**: an optional trailer of block offsets for random access
//! - **ReadBlock / read_blocks**: lazy, eager or memory-mapped decoding
//! - **WriteBlock / write_blocks**: encoding with padding and index
//!
//! Which in-memory object owns which block is not tracked here; see the
//! manager crate.

pub mod compression;
pub mod data;
pub mod error;
pub mod header;
pub mod index;
pub mod io;
pub mod reader;
pub mod writer;

pub use compression::{Compression, CompressionKwargs};
pub use data::{BlockData, DataSource, Payload};
pub use error::{BlockError, BlockResult};
pub use header::{checksum, BlockHeader, BLOCK_MAGIC, FLAG_STREAMED};
pub use index::{encode_index, find_index, parse_index, write_block_index, INDEX_HEADER};
pub use io::{seek_to_first_block, Backing, BlockFile, MappedView};
pub use reader::{read_blocks, ReadBlock, ReadOptions};
pub use writer::{write_blocks, Padding, WriteBlock, WriteOptions, WrittenBlock};
