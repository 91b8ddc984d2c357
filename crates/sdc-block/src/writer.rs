use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::compression::{Compression, CompressionKwargs};
use crate::data::Payload;
use crate::error::{BlockError, BlockResult};
use crate::header::{checksum, BlockHeader, BLOCK_MAGIC};
use crate::index::write_block_index;
use crate::io::BlockFile;

const DEFAULT_PADDING_RATIO: f64 = 1.1;

/// Spare room left after each block so a later in-place update can grow the
/// payload without moving it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
    #[default]
    None,
    /// Ratio 1.1.
    Default,
    Ratio(f64),
}

impl Padding {
    /// Allocation for a block whose stored bytes take `used` bytes.
    pub fn allocation(&self, used: u64, io_block_size: usize) -> u64 {
        let ratio = match self {
            Self::None => return used,
            Self::Default => DEFAULT_PADDING_RATIO,
            Self::Ratio(ratio) => *ratio,
        };
        let io_block = io_block_size.max(1) as u64;
        let wanted = (used as f64 * ratio.max(1.0)).ceil() as u64;
        let rounded = wanted.div_ceil(io_block).max(1) * io_block;
        rounded.max(used)
    }
}

/// A pending block: a payload plus how to compress it.
#[derive(Clone, Debug)]
pub struct WriteBlock {
    pub payload: Payload,
    pub compression: Compression,
    pub compression_kwargs: CompressionKwargs,
    /// Set for blocks stored in their own external file.
    pub uri: Option<String>,
}

impl WriteBlock {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            compression: Compression::None,
            compression_kwargs: CompressionKwargs::new(),
            uri: None,
        }
    }

    pub fn with_compression(mut self, compression: Compression, kwargs: CompressionKwargs) -> Self {
        self.compression = compression;
        self.compression_kwargs = kwargs;
        self
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }
}

/// Where a block landed and the header it was written with.
#[derive(Clone, Debug, PartialEq)]
pub struct WrittenBlock {
    pub offset: u64,
    pub header: BlockHeader,
    pub data_offset: u64,
}

impl WrittenBlock {
    /// The same block moved by `delta` bytes.
    pub fn shifted(&self, delta: i64) -> Self {
        let shift = |v: u64| v.saturating_add_signed(delta);
        Self {
            offset: shift(self.offset),
            header: self.header.clone(),
            data_offset: shift(self.data_offset),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WriteOptions {
    pub padding: Padding,
    pub io_block_size: usize,
    pub include_index: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            padding: Padding::None,
            io_block_size: 4096,
            include_index: true,
        }
    }
}

struct Encoded {
    bytes: Vec<u8>,
    header: BlockHeader,
    header_len: u64,
}

fn encode_block(
    block: &WriteBlock,
    streamed: bool,
    padding: Padding,
    io_block_size: usize,
) -> BlockResult<Encoded> {
    let data = block.payload.bytes()?;
    let (header, stored) = if streamed {
        if !block.compression.is_none() {
            return Err(BlockError::InvalidKwargs(
                "streamed blocks cannot be compressed".into(),
            ));
        }
        (BlockHeader::streamed(), data.to_vec())
    } else {
        let stored = block.compression.compress(&data, &block.compression_kwargs)?;
        let used = stored.len() as u64;
        let header = BlockHeader {
            flags: 0,
            compression: block.compression,
            compression_kwargs: if block.compression.is_none() {
                CompressionKwargs::new()
            } else {
                block.compression_kwargs.clone()
            },
            allocated_size: padding.allocation(used, io_block_size),
            used_size: used,
            data_size: data.len() as u64,
            checksum: checksum(&data),
        };
        (header, stored)
    };

    let encoded_header = header.encode()?;
    let header_len = (BLOCK_MAGIC.len() + encoded_header.len()) as u64;
    let pad = header.allocated_size.saturating_sub(header.used_size) as usize;
    let mut bytes = Vec::with_capacity(header_len as usize + stored.len() + pad);
    bytes.extend_from_slice(&BLOCK_MAGIC);
    bytes.extend_from_slice(&encoded_header);
    bytes.extend_from_slice(&stored);
    bytes.resize(bytes.len() + pad, 0);
    Ok(Encoded {
        bytes,
        header,
        header_len,
    })
}

/// Write `blocks` (then `streamed`, if given) starting at the current
/// position of `file`.
///
/// A block index follows the blocks when requested, unless a streamed block
/// was written or there are no blocks. On return the file is positioned just
/// after everything written. The returned list includes the streamed block.
pub fn write_blocks(
    file: &BlockFile,
    blocks: &[WriteBlock],
    streamed: Option<&WriteBlock>,
    opts: &WriteOptions,
) -> BlockResult<Vec<WrittenBlock>> {
    let mut pos = file.tell()?;
    let mut written = Vec::with_capacity(blocks.len() + usize::from(streamed.is_some()));

    let tagged = blocks
        .iter()
        .map(|b| (b, false))
        .chain(streamed.map(|b| (b, true)));
    for (block, is_streamed) in tagged {
        let encoded = encode_block(block, is_streamed, opts.padding, opts.io_block_size)?;
        file.write_at(pos, &encoded.bytes)?;
        debug!(
            offset = pos,
            used = encoded.header.used_size,
            allocated = encoded.header.allocated_size,
            compression = %encoded.header.compression,
            streamed = is_streamed,
            "wrote block"
        );
        written.push(WrittenBlock {
            offset: pos,
            data_offset: pos + encoded.header_len,
            header: encoded.header,
        });
        pos += encoded.bytes.len() as u64;
    }

    if opts.include_index && streamed.is_none() && !written.is_empty() {
        let offsets: Vec<u64> = written.iter().map(|w| w.offset).collect();
        pos = write_block_index(file, pos, &offsets)?;
    }
    file.seek(pos)?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::INDEX_HEADER;
    use crate::reader::{read_blocks, ReadOptions};

    #[test]
    fn padding_allocation() {
        assert_eq!(Padding::None.allocation(100, 4096), 100);
        assert_eq!(Padding::Default.allocation(100, 4096), 4096);
        assert_eq!(Padding::Default.allocation(4096, 4096), 8192);
        assert_eq!(Padding::Ratio(2.0).allocation(10, 8), 24);
        assert_eq!(Padding::Ratio(0.5).allocation(10, 8), 16);
        assert_eq!(Padding::Default.allocation(0, 512), 512);
    }

    #[test]
    fn written_blocks_read_back() {
        let file = BlockFile::in_memory(b"tree:\n".to_vec());
        file.seek(6).unwrap();
        let blocks = vec![
            WriteBlock::new(Payload::from(b"plain".to_vec())),
            WriteBlock::new(Payload::from(vec![7u8; 1000]))
                .with_compression(Compression::Zstd, CompressionKwargs::new()),
        ];
        let written = write_blocks(&file, &blocks, None, &WriteOptions::default()).unwrap();
        assert_eq!(written[0].offset, 6);
        assert!(written[1].header.used_size < 1000);

        file.seek(6).unwrap();
        let read = read_blocks(&file, &ReadOptions::default(), false).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[1].offset(), written[1].offset);
        assert_eq!(&read[0].data().unwrap()[..], b"plain");
        assert_eq!(&read[1].data().unwrap()[..], &[7u8; 1000][..]);
    }

    #[test]
    fn padding_is_zero_filled() {
        let file = BlockFile::in_memory(Vec::new());
        let opts = WriteOptions {
            padding: Padding::Ratio(2.0),
            io_block_size: 16,
            include_index: false,
        };
        let blocks = [WriteBlock::new(Payload::from(vec![1u8; 10]))];
        let written = write_blocks(&file, &blocks, None, &opts).unwrap();
        let header = &written[0].header;
        assert_eq!(header.allocated_size, 32);
        let end = written[0].data_offset + header.allocated_size;
        assert_eq!(file.len().unwrap(), end);
        let tail = file.read_up_to(written[0].data_offset + 10, 22).unwrap();
        assert!(tail.iter().all(|&b| b == 0));
    }

    #[test]
    fn no_index_with_streamed_block() {
        let file = BlockFile::in_memory(Vec::new());
        let blocks = [WriteBlock::new(Payload::from(b"a".to_vec()))];
        let streamed = WriteBlock::new(Payload::from(b"stream".to_vec()));
        let written =
            write_blocks(&file, &blocks, Some(&streamed), &WriteOptions::default()).unwrap();
        assert_eq!(written.len(), 2);
        assert!(written[1].header.is_streamed());
        let contents = file.contents().unwrap();
        assert!(!contents
            .windows(INDEX_HEADER.len())
            .any(|w| w == INDEX_HEADER));
        assert!(contents.ends_with(b"stream"));
    }

    #[test]
    fn index_written_after_blocks() {
        let file = BlockFile::in_memory(Vec::new());
        let blocks = [WriteBlock::new(Payload::from(b"a".to_vec()))];
        write_blocks(&file, &blocks, None, &WriteOptions::default()).unwrap();
        let contents = file.contents().unwrap();
        assert!(contents.ends_with(b"- 0\n...\n"));
        assert_eq!(file.tell().unwrap(), contents.len() as u64);
    }

    #[test]
    fn compressed_stream_rejected() {
        let file = BlockFile::in_memory(Vec::new());
        let streamed = WriteBlock::new(Payload::from(b"s".to_vec()))
            .with_compression(Compression::Zlib, CompressionKwargs::new());
        assert!(write_blocks(&file, &[], Some(&streamed), &WriteOptions::default()).is_err());
    }

    #[test]
    fn shifted_offsets() {
        let w = WrittenBlock {
            offset: 100,
            header: BlockHeader::default(),
            data_offset: 154,
        };
        let moved = w.shifted(-40);
        assert_eq!((moved.offset, moved.data_offset), (60, 114));
    }
}
