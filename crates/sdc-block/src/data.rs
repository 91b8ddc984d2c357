use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use memmap2::Mmap;
use sdc_identity::{Identity, Referent};

use crate::error::BlockResult;

enum Repr {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

/// Decoded block payload, either owned or mapped from the backing file.
///
/// Clones share the same bytes and the same identity, so a payload obtained
/// from a read block can later be recognised as "the data of that block".
#[derive(Clone)]
pub struct BlockData {
    inner: Arc<Repr>,
}

impl BlockData {
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Repr::Owned(bytes)),
        }
    }

    pub(crate) fn mapped(map: Mmap) -> Self {
        Self {
            inner: Arc::new(Repr::Mapped(map)),
        }
    }

    pub fn empty() -> Self {
        Self::from_vec(Vec::new())
    }

    /// Whether the bytes are a live view of the backing file.
    pub fn is_mapped(&self) -> bool {
        matches!(*self.inner, Repr::Mapped(_))
    }

    pub fn as_slice(&self) -> &[u8] {
        match &*self.inner {
            Repr::Owned(bytes) => bytes,
            Repr::Mapped(map) => map,
        }
    }

    /// Whether `self` and `other` are the same payload (not merely equal bytes).
    pub fn same_as(&self, other: &BlockData) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of live handles on these bytes, this one included.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub(crate) fn downgrade(&self) -> WeakBlockData {
        WeakBlockData(Arc::downgrade(&self.inner))
    }
}

/// Non-owning reference to a [`BlockData`].
pub(crate) struct WeakBlockData(Weak<Repr>);

impl WeakBlockData {
    pub(crate) fn upgrade(&self) -> Option<BlockData> {
        self.0.upgrade().map(|inner| BlockData { inner })
    }

    pub(crate) fn is_live(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl Deref for BlockData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for BlockData {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for BlockData {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_vec(bytes)
    }
}

impl From<&[u8]> for BlockData {
    fn from(bytes: &[u8]) -> Self {
        Self::from_vec(bytes.to_vec())
    }
}

impl Identity for BlockData {
    fn identity(&self) -> usize {
        self.inner.identity()
    }

    fn referent(&self) -> Referent {
        self.inner.referent()
    }
}

impl fmt::Debug for BlockData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockData")
            .field("len", &self.len())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

/// Re-callable producer of payload bytes, evaluated at write time.
pub type DataSource = Arc<dyn Fn() -> BlockResult<BlockData> + Send + Sync>;

/// What a write block stores: bytes already in memory, or a source that
/// yields them when the block is encoded.
///
/// Identity (for deduplication and options lookup) is that of the shared
/// bytes or of the source closure, never of the byte values.
#[derive(Clone)]
pub enum Payload {
    Data(BlockData),
    Source(DataSource),
}

impl Payload {
    pub fn from_fn<F>(source: F) -> Self
    where
        F: Fn() -> BlockResult<BlockData> + Send + Sync + 'static,
    {
        Self::Source(Arc::new(source))
    }

    /// Produce the payload bytes.
    pub fn bytes(&self) -> BlockResult<BlockData> {
        match self {
            Self::Data(data) => Ok(data.clone()),
            Self::Source(source) => source(),
        }
    }

    pub fn is_source(&self) -> bool {
        matches!(self, Self::Source(_))
    }

    /// Whether both payloads are the same object.
    pub fn same_as(&self, other: &Payload) -> bool {
        self.identity() == other.identity()
    }
}

impl Identity for Payload {
    fn identity(&self) -> usize {
        match self {
            Self::Data(data) => data.identity(),
            Self::Source(source) => source.identity(),
        }
    }

    fn referent(&self) -> Referent {
        match self {
            Self::Data(data) => data.referent(),
            Self::Source(source) => source.referent(),
        }
    }
}

impl From<BlockData> for Payload {
    fn from(data: BlockData) -> Self {
        Self::Data(data)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Data(BlockData::from_vec(bytes))
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data(data) => f.debug_tuple("Payload::Data").field(data).finish(),
            Self::Source(_) => f.write_str("Payload::Source(..)"),
        }
    }
}
