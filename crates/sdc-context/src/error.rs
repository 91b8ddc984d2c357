use sdc_manager::ManagerError;
use thiserror::Error;

use crate::context::ContextState;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("unsupported document version: {0}")]
    UnsupportedVersion(String),

    #[error(
        "converters accessing more than one block must provide a key for each block \
         (already accessed block {current}, requested {requested})"
    )]
    ImplicitBlockConflict { current: usize, requested: usize },

    #[error("converter generated key #{0} that was never used")]
    UnusedKey(u64),

    #[error("context is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: ContextState,
        actual: ContextState,
    },

    #[error("no converter for tag {0}")]
    UnknownTag(String),

    #[error("tag {0} is already registered")]
    DuplicateTag(String),

    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error(transparent)]
    Manager(#[from] ManagerError),
}

pub type ContextResult<T> = Result<T, ContextError>;
