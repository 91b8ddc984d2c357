use std::fmt;
use std::sync::OnceLock;

use tracing::debug;

use crate::data::BlockData;
use crate::error::{BlockError, BlockResult};
use crate::header::{checksum, BlockHeader, BLOCK_MAGIC};
use crate::index::{find_index, INDEX_HEADER};
use crate::io::BlockFile;

/// Decoding policy for blocks read from a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadOptions {
    /// Map uncompressed payloads from the file instead of copying them.
    pub memmap: bool,
    /// Defer payload decoding (and, with an index, header parsing) until
    /// first access.
    pub lazy_load: bool,
    /// Recompute the MD5 of decoded payloads and fail on mismatch.
    pub validate_checksums: bool,
    /// Chunk size for scanning the file.
    pub chunk_size: usize,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            memmap: true,
            lazy_load: true,
            validate_checksums: false,
            chunk_size: 4096,
        }
    }
}

#[derive(Clone, Debug)]
struct Layout {
    header: BlockHeader,
    data_offset: u64,
}

/// A block decoded from a file.
///
/// The header is parsed when the block is discovered by a sequential scan,
/// or on first use when the block was located through the block index. The
/// payload is decoded once and cached.
pub struct ReadBlock {
    offset: u64,
    file: BlockFile,
    memmap: bool,
    lazy_load: bool,
    validate_checksum: bool,
    layout: OnceLock<Layout>,
    cached: OnceLock<BlockData>,
}

impl ReadBlock {
    /// A block at `offset` whose header has not been read yet.
    pub fn open(file: BlockFile, offset: u64, opts: &ReadOptions) -> Self {
        Self {
            offset,
            file,
            memmap: opts.memmap,
            lazy_load: opts.lazy_load,
            validate_checksum: opts.validate_checksums,
            layout: OnceLock::new(),
            cached: OnceLock::new(),
        }
    }

    /// A block whose header is already known.
    pub fn with_header(
        file: BlockFile,
        offset: u64,
        header: BlockHeader,
        data_offset: u64,
        opts: &ReadOptions,
    ) -> Self {
        let block = Self::open(file, offset, opts);
        let _ = block.layout.set(Layout {
            header,
            data_offset,
        });
        block
    }

    /// Offset of the block magic.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn file(&self) -> &BlockFile {
        &self.file
    }

    fn layout(&self) -> BlockResult<&Layout> {
        if let Some(layout) = self.layout.get() {
            return Ok(layout);
        }
        let layout = read_layout(&self.file, self.offset)?;
        Ok(self.layout.get_or_init(|| layout))
    }

    pub fn header(&self) -> BlockResult<&BlockHeader> {
        Ok(&self.layout()?.header)
    }

    /// Offset of the first payload byte.
    pub fn data_offset(&self) -> BlockResult<u64> {
        Ok(self.layout()?.data_offset)
    }

    /// First byte after the block's allocation. A streamed block extends to
    /// end-of-file.
    pub fn end_offset(&self) -> BlockResult<u64> {
        let layout = self.layout()?;
        if layout.header.is_streamed() {
            return Ok(self.file.len()?);
        }
        allocation_end(layout, self.offset)
    }

    pub fn is_memmap(&self) -> bool {
        self.memmap
    }

    pub fn is_loaded(&self) -> bool {
        self.cached.get().is_some()
    }

    /// Whether the payload still depends on the bytes in the file: it is
    /// mapped, or lazily deferred and not yet loaded.
    pub fn reads_from_file(&self) -> bool {
        self.memmap || (self.lazy_load && !self.is_loaded())
    }

    /// The cached payload, if it has been loaded.
    pub fn cached_data(&self) -> Option<&BlockData> {
        self.cached.get()
    }

    /// Decode (once) and return the payload.
    pub fn data(&self) -> BlockResult<BlockData> {
        if let Some(data) = self.cached.get() {
            return Ok(data.clone());
        }
        let data = self.load()?;
        Ok(self.cached.get_or_init(|| data).clone())
    }

    fn load(&self) -> BlockResult<BlockData> {
        let Layout {
            header,
            data_offset,
        } = self.layout()?;
        let data_offset = *data_offset;

        let (used, data_size) = if header.is_streamed() {
            let len = self.file.len()?.saturating_sub(data_offset);
            (len, len)
        } else {
            (header.used_size, header.data_size)
        };
        if header.compression.is_none() && used != data_size {
            return Err(BlockError::SizeMismatch {
                offset: self.offset,
                expected: data_size,
                actual: used,
            });
        }
        let file_len = self.file.len()?;
        if data_offset.checked_add(used).map_or(true, |end| end > file_len) {
            return Err(BlockError::CorruptHeader {
                offset: self.offset,
                reason: format!(
                    "{used} payload bytes at {data_offset} overrun end of file at {file_len}"
                ),
            });
        }

        let data = if header.compression.is_none() {
            let mapped = if self.memmap {
                self.file.map(data_offset, used as usize)?
            } else {
                None
            };
            match mapped {
                Some(view) => view,
                None => {
                    let mut buf = vec![0u8; used as usize];
                    self.file.read_at(data_offset, &mut buf)?;
                    BlockData::from_vec(buf)
                }
            }
        } else {
            let mut raw = vec![0u8; used as usize];
            self.file.read_at(data_offset, &mut raw)?;
            BlockData::from_vec(header.compression.decompress(&raw, data_size)?)
        };

        if self.validate_checksum && header.has_checksum() {
            let computed = checksum(&data);
            if computed != header.checksum {
                return Err(BlockError::ChecksumMismatch {
                    offset: self.offset,
                    expected: hex::encode(header.checksum),
                    computed: hex::encode(computed),
                });
            }
        }
        debug!(
            offset = self.offset,
            len = data.len(),
            mapped = data.is_mapped(),
            "loaded block"
        );
        Ok(data)
    }
}

impl fmt::Debug for ReadBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadBlock")
            .field("offset", &self.offset)
            .field("header", &self.layout.get().map(|l| &l.header))
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

fn read_layout(file: &BlockFile, offset: u64) -> BlockResult<Layout> {
    let mut prefix = [0u8; 6];
    file.read_at(offset, &mut prefix)?;
    if prefix[..4] != BLOCK_MAGIC {
        return Err(BlockError::InvalidMagic {
            offset,
            actual: hex::encode(&prefix[..4]),
        });
    }
    let size = BlockHeader::announced_size([prefix[4], prefix[5]]);
    let mut body = vec![0u8; size as usize];
    file.read_at(offset + 6, &mut body)
        .map_err(|e| BlockError::CorruptHeader {
            offset,
            reason: format!("truncated header: {e}"),
        })?;
    let header = BlockHeader::decode(&body, offset)?;
    let layout = Layout {
        header,
        data_offset: offset + 6 + u64::from(size),
    };
    if !layout.header.is_streamed() {
        let file_len = file.len()?;
        if allocation_end(&layout, offset)? > file_len {
            return Err(BlockError::CorruptHeader {
                offset,
                reason: format!(
                    "allocated size {} overruns end of file at {file_len}",
                    layout.header.allocated_size
                ),
            });
        }
    }
    Ok(layout)
}

fn allocation_end(layout: &Layout, offset: u64) -> BlockResult<u64> {
    layout
        .data_offset
        .checked_add(layout.header.allocated_size)
        .ok_or_else(|| BlockError::CorruptHeader {
            offset,
            reason: format!("allocated size {} overflows", layout.header.allocated_size),
        })
}

enum Marker {
    Block,
    Index,
    End,
}

fn marker_at(file: &BlockFile, pos: u64) -> BlockResult<Marker> {
    let head = file.read_up_to(pos, INDEX_HEADER.len())?;
    if head.is_empty() {
        return Ok(Marker::End);
    }
    if head.starts_with(&BLOCK_MAGIC) {
        return Ok(Marker::Block);
    }
    if head == INDEX_HEADER {
        return Ok(Marker::Index);
    }
    Err(BlockError::InvalidMagic {
        offset: pos,
        actual: hex::encode(&head[..head.len().min(4)]),
    })
}

/// Read every block from the current position of `file`.
///
/// With `after_magic` the caller has already consumed the first block's
/// magic. Reading stops at end-of-file, at the block index, or after a
/// streamed block. When loading lazily and the file carries a valid index,
/// only the first header is parsed; the other blocks are located through
/// the index and decoded on demand.
pub fn read_blocks(
    file: &BlockFile,
    opts: &ReadOptions,
    after_magic: bool,
) -> BlockResult<Vec<ReadBlock>> {
    let mut pos = file.tell()?;
    if after_magic {
        pos = pos.checked_sub(BLOCK_MAGIC.len() as u64).ok_or_else(|| {
            BlockError::InvalidMagic {
                offset: 0,
                actual: "".into(),
            }
        })?;
    }

    let mut blocks: Vec<ReadBlock> = Vec::new();
    loop {
        match marker_at(file, pos)? {
            Marker::Block => {}
            Marker::Index | Marker::End => break,
        }
        let layout = read_layout(file, pos)?;
        let streamed = layout.header.is_streamed();
        let next = allocation_end(&layout, pos)?;
        debug!(
            offset = pos,
            allocated = layout.header.allocated_size,
            streamed,
            "read block header"
        );
        let block = ReadBlock::with_header(
            file.clone(),
            pos,
            layout.header,
            layout.data_offset,
            opts,
        );
        if !opts.lazy_load {
            block.data()?;
        }
        blocks.push(block);
        if streamed {
            pos = file.len()?;
            break;
        }

        if blocks.len() == 1 && opts.lazy_load {
            if let Some(offsets) = find_index(file, blocks[0].offset(), opts.chunk_size)? {
                blocks.extend(
                    offsets[1..]
                        .iter()
                        .map(|&offset| ReadBlock::open(file.clone(), offset, opts)),
                );
                debug!(blocks = blocks.len(), "blocks located through index");
                return Ok(blocks);
            }
        }
        pos = next;
    }
    file.seek(pos)?;
    Ok(blocks)
}
