use sdc_block::BlockError;
use sdc_identity::IdentityError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("{operation} called outside of a write transaction")]
    NoWriteTransaction { operation: &'static str },

    #[error("cannot add a second streamed block")]
    SecondStreamedBlock,

    #[error("cannot write external blocks: the document URI is unknown")]
    UnknownBaseUri,

    #[error("block {index} does not exist ({len} blocks)")]
    MissingBlock { index: usize, len: usize },

    #[error("attempt to read block data from a block sequence that no longer exists")]
    MissingBlockSequence,

    #[error("bytes {offset}..+{len} of the file are mapped by a payload still in use")]
    MappedViewInUse { offset: u64, len: u64 },

    #[error("external block not found: {0}")]
    ExternalBlockMissing(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ManagerResult<T> = Result<T, ManagerError>;
