use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BlockError, BlockResult};

/// Codec-specific compression parameters, e.g. `{"level": 9}`.
pub type CompressionKwargs = BTreeMap<String, serde_json::Value>;

const ZLIB_DEFAULT_LEVEL: i64 = 6;
const ZSTD_DEFAULT_LEVEL: i64 = 3;

/// Output buffers are reserved up front only up to this multiple of the
/// compressed size.
const MAX_PREALLOC_RATIO: u64 = 4;

/// Block compression codec.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Zlib,
    Zstd,
}

impl Compression {
    /// The four-byte code stored in block headers.
    pub fn code(&self) -> [u8; 4] {
        match self {
            Self::None => [0; 4],
            Self::Zlib => *b"zlib",
            Self::Zstd => *b"zstd",
        }
    }

    /// Parse a header code.
    pub fn from_code(code: [u8; 4]) -> BlockResult<Self> {
        match &code {
            [0, 0, 0, 0] => Ok(Self::None),
            b"zlib" => Ok(Self::Zlib),
            b"zstd" => Ok(Self::Zstd),
            other => Err(BlockError::UnknownCompression(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Zlib => "zlib",
            Self::Zstd => "zstd",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Compress `data`. For [`Compression::None`] the bytes are copied as is.
    pub fn compress(&self, data: &[u8], kwargs: &CompressionKwargs) -> BlockResult<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Zlib => {
                let level = level(kwargs, ZLIB_DEFAULT_LEVEL, 0..=9)?;
                let mut encoder = flate2::write::ZlibEncoder::new(
                    Vec::with_capacity(data.len() / 2),
                    flate2::Compression::new(level as u32),
                );
                encoder
                    .write_all(data)
                    .map_err(|e| BlockError::CompressionFailed(e.to_string()))?;
                encoder
                    .finish()
                    .map_err(|e| BlockError::CompressionFailed(e.to_string()))
            }
            Self::Zstd => {
                let level = level(kwargs, ZSTD_DEFAULT_LEVEL, 1..=22)?;
                zstd::encode_all(data, level as i32)
                    .map_err(|e| BlockError::CompressionFailed(e.to_string()))
            }
        }
    }

    /// Decompress `data`, which must expand to exactly `data_size` bytes.
    ///
    /// Decoding stops one byte past `data_size`, so a stream that expands
    /// further is rejected without being inflated in full.
    pub fn decompress(&self, data: &[u8], data_size: u64) -> BlockResult<Vec<u8>> {
        let failed = |e: std::io::Error| BlockError::DecompressionFailed(e.to_string());
        let limit = data_size.saturating_add(1);
        let capacity = data_size.min((data.len() as u64).saturating_mul(MAX_PREALLOC_RATIO));
        let mut out = Vec::with_capacity(capacity as usize);
        match self {
            Self::None => out.extend_from_slice(data),
            Self::Zlib => {
                flate2::read::ZlibDecoder::new(data)
                    .take(limit)
                    .read_to_end(&mut out)
                    .map_err(failed)?;
            }
            Self::Zstd => {
                zstd::stream::read::Decoder::new(data)
                    .map_err(failed)?
                    .take(limit)
                    .read_to_end(&mut out)
                    .map_err(failed)?;
            }
        }
        if out.len() as u64 != data_size {
            return Err(BlockError::DecompressionFailed(format!(
                "expected {data_size} bytes, got {}{}",
                out.len(),
                if out.len() as u64 == limit { " or more" } else { "" }
            )));
        }
        Ok(out)
    }
}

fn level(
    kwargs: &CompressionKwargs,
    default: i64,
    range: std::ops::RangeInclusive<i64>,
) -> BlockResult<i64> {
    let Some(value) = kwargs.get("level") else {
        return Ok(default);
    };
    let level = value
        .as_i64()
        .ok_or_else(|| BlockError::InvalidKwargs(format!("level must be an integer, got {value}")))?;
    if !range.contains(&level) {
        return Err(BlockError::InvalidKwargs(format!(
            "level {level} outside {}..={}",
            range.start(),
            range.end()
        )));
    }
    Ok(level)
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Compression {
    type Err = BlockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "zlib" => Ok(Self::Zlib),
            "zstd" => Ok(Self::Zstd),
            other => Err(BlockError::UnknownCompression(other.to_string())),
        }
    }
}
