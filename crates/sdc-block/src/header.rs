use md5::{Digest, Md5};

use crate::compression::{Compression, CompressionKwargs};
use crate::error::{BlockError, BlockResult};

/// Magic bytes that open every block record.
pub const BLOCK_MAGIC: [u8; 4] = [0xd3, b'B', b'L', b'K'];

/// Header flag: the block is streamed and extends to end-of-file.
pub const FLAG_STREAMED: u32 = 1;

/// Bytes from `flags` through `checksum`.
pub const FIXED_HEADER_SIZE: u16 = 48;

/// Fixed fields plus the kwargs length prefix.
const KWARGS_HEADER_SIZE: u16 = FIXED_HEADER_SIZE + 2;

/// Decoded block header.
///
/// On-disk layout (big-endian), following the four magic bytes:
/// ```text
/// [2 bytes: header_size]  bytes that follow, up to the payload
/// [4 bytes: flags]
/// [4 bytes: compression code]
/// [8 bytes: allocated_size]
/// [8 bytes: used_size]
/// [8 bytes: data_size]
/// [16 bytes: MD5 checksum of decoded payload, zero if not recorded]
/// [2 bytes: kwargs length] [N bytes: kwargs as JSON]
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BlockHeader {
    pub flags: u32,
    pub compression: Compression,
    pub compression_kwargs: CompressionKwargs,
    pub allocated_size: u64,
    pub used_size: u64,
    pub data_size: u64,
    pub checksum: [u8; 16],
}

impl BlockHeader {
    /// Header for a streamed block: no sizes, no compression.
    pub fn streamed() -> Self {
        Self {
            flags: FLAG_STREAMED,
            ..Default::default()
        }
    }

    pub fn is_streamed(&self) -> bool {
        self.flags & FLAG_STREAMED != 0
    }

    /// Whether a checksum was recorded.
    pub fn has_checksum(&self) -> bool {
        self.checksum != [0; 16]
    }

    /// Bytes from the `header_size` field through the end of the header.
    pub fn encoded_len(&self) -> BlockResult<u64> {
        Ok(2 + u64::from(KWARGS_HEADER_SIZE) + self.kwargs_bytes()?.len() as u64)
    }

    /// Encode from `header_size` onward (without magic).
    pub fn encode(&self) -> BlockResult<Vec<u8>> {
        if self.used_size > self.allocated_size {
            return Err(BlockError::CorruptHeader {
                offset: 0,
                reason: format!(
                    "used size {} exceeds allocated size {}",
                    self.used_size, self.allocated_size
                ),
            });
        }
        let kwargs = self.kwargs_bytes()?;
        let kwargs_len = u16::try_from(kwargs.len())
            .map_err(|_| BlockError::InvalidKwargs("compression kwargs too large".into()))?;
        let header_size = KWARGS_HEADER_SIZE
            .checked_add(kwargs_len)
            .ok_or_else(|| BlockError::InvalidKwargs("compression kwargs too large".into()))?;

        let mut buf = Vec::with_capacity(2 + header_size as usize);
        buf.extend_from_slice(&header_size.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.compression.code());
        buf.extend_from_slice(&self.allocated_size.to_be_bytes());
        buf.extend_from_slice(&self.used_size.to_be_bytes());
        buf.extend_from_slice(&self.data_size.to_be_bytes());
        buf.extend_from_slice(&self.checksum);
        buf.extend_from_slice(&kwargs_len.to_be_bytes());
        buf.extend_from_slice(&kwargs);
        Ok(buf)
    }

    /// Size of the header body announced by the first two bytes.
    pub fn announced_size(prefix: [u8; 2]) -> u16 {
        u16::from_be_bytes(prefix)
    }

    /// Decode a header body (the `header_size` bytes after the size field).
    /// `offset` is only used for error reporting.
    pub fn decode(body: &[u8], offset: u64) -> BlockResult<Self> {
        let corrupt = |reason: String| BlockError::CorruptHeader { offset, reason };
        if body.len() < FIXED_HEADER_SIZE as usize {
            return Err(corrupt(format!(
                "header size {} smaller than {FIXED_HEADER_SIZE}",
                body.len()
            )));
        }

        let u32_at = |pos: usize| u32::from_be_bytes(array(&body[pos..pos + 4]));
        let u64_at = |pos: usize| u64::from_be_bytes(array(&body[pos..pos + 8]));

        let flags = u32_at(0);
        let compression = Compression::from_code(array(&body[4..8]))?;
        let allocated_size = u64_at(8);
        let used_size = u64_at(16);
        let data_size = u64_at(24);
        let checksum: [u8; 16] = array(&body[32..48]);

        let mut compression_kwargs = CompressionKwargs::new();
        if body.len() >= KWARGS_HEADER_SIZE as usize {
            let kwargs_len = u16::from_be_bytes(array(&body[48..50])) as usize;
            let end = KWARGS_HEADER_SIZE as usize + kwargs_len;
            if end > body.len() {
                return Err(corrupt(format!(
                    "kwargs length {kwargs_len} exceeds header size {}",
                    body.len()
                )));
            }
            if kwargs_len > 0 {
                compression_kwargs = serde_json::from_slice(&body[50..end])
                    .map_err(|e| corrupt(format!("invalid kwargs: {e}")))?;
            }
        }

        let header = Self {
            flags,
            compression,
            compression_kwargs,
            allocated_size,
            used_size,
            data_size,
            checksum,
        };
        if header.used_size > header.allocated_size {
            return Err(corrupt(format!(
                "used size {used_size} exceeds allocated size {allocated_size}"
            )));
        }
        if header.is_streamed() && !header.compression.is_none() {
            return Err(corrupt("streamed blocks cannot be compressed".into()));
        }
        Ok(header)
    }

    fn kwargs_bytes(&self) -> BlockResult<Vec<u8>> {
        if self.compression_kwargs.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::to_vec(&self.compression_kwargs)
            .map_err(|e| BlockError::InvalidKwargs(e.to_string()))
    }
}

/// MD5 digest of a decoded payload.
pub fn checksum(data: &[u8]) -> [u8; 16] {
    let digest = Md5::digest(data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest);
    out
}

fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}
