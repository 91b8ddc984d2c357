use thiserror::Error;

/// Errors produced by identity stores.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("key #{0} is not bound to a live object")]
    UnboundKey(u64),

    #[error("index {index} out of range for sequence of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
}

pub type IdentityResult<T> = Result<T, IdentityError>;
