use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("invalid block magic at offset {offset}: got {actual}")]
    InvalidMagic { offset: u64, actual: String },

    #[error("corrupt block header at offset {offset}: {reason}")]
    CorruptHeader { offset: u64, reason: String },

    #[error("unknown compression: {0}")]
    UnknownCompression(String),

    #[error("invalid compression parameters: {0}")]
    InvalidKwargs(String),

    #[error("checksum mismatch for block at offset {offset}: expected {expected}, computed {computed}")]
    ChecksumMismatch {
        offset: u64,
        expected: String,
        computed: String,
    },

    #[error("size mismatch for block at offset {offset}: expected {expected}, got {actual}")]
    SizeMismatch { offset: u64, expected: u64, actual: u64 },

    #[error("compression failed: {0}")]
    CompressionFailed(String),

    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("block index corrupted: {0}")]
    IndexCorrupted(String),

    #[error("payload source failed: {0}")]
    Source(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BlockResult<T> = Result<T, BlockError>;
