use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use sdc_block::{BlockData, BlockError, BlockHeader, Compression, Payload, ReadBlock};
use sdc_identity::{Identity, KeyCounter, LinearStore, ObjectRef};

use crate::error::{ManagerError, ManagerResult};

/// The blocks read from the current file, in file order, plus which objects
/// own which of them.
///
/// Shared by reference between the manager, the options store, and every
/// [`DataCallback`]. Relocation builds a new sequence and redirects the
/// callbacks to it instead of mutating this one.
pub struct ReadBlocks {
    inner: RwLock<LinearStore<ReadBlock>>,
}

impl ReadBlocks {
    pub fn new(counter: KeyCounter) -> Self {
        Self::from_blocks(counter, Vec::new())
    }

    pub fn from_blocks(counter: KeyCounter, blocks: Vec<ReadBlock>) -> Self {
        Self {
            inner: RwLock::new(LinearStore::from_items(counter, blocks)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, LinearStore<ReadBlock>> {
        self.inner.read().expect("read blocks lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, LinearStore<ReadBlock>> {
        self.inner.write().expect("read blocks lock poisoned")
    }

    /// Replace the block sequence, keeping ownership mappings.
    pub fn set_blocks(&self, blocks: Vec<ReadBlock>) {
        self.write().replace_sequence(blocks);
    }

    pub fn append_block(&self, block: ReadBlock) -> usize {
        self.write().push(block)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Run `f` against block `index`.
    pub fn with_block<R>(&self, index: usize, f: impl FnOnce(&ReadBlock) -> R) -> ManagerResult<R> {
        let guard = self.read();
        let block = guard.get(index).ok_or(ManagerError::MissingBlock {
            index,
            len: guard.len(),
        })?;
        Ok(f(block))
    }

    /// Decoded payload of block `index`.
    pub fn data(&self, index: usize) -> ManagerResult<BlockData> {
        Ok(self.with_block(index, ReadBlock::data)??)
    }

    pub fn header(&self, index: usize) -> ManagerResult<BlockHeader> {
        Ok(self.with_block(index, |b| b.header().cloned())??)
    }

    pub fn assign_index<'a>(&self, owner: impl Into<ObjectRef<'a>>, index: usize) -> ManagerResult<()> {
        Ok(self.write().assign_index(owner, index)?)
    }

    pub fn lookup_index<'a>(&self, owner: impl Into<ObjectRef<'a>>) -> Option<usize> {
        self.read().lookup_index(owner)
    }

    /// Header of the first block, in file order, whose loaded payload is
    /// `payload`.
    pub fn header_holding(&self, payload: &dyn Identity) -> ManagerResult<Option<BlockHeader>> {
        let guard = self.read();
        let wanted = payload.identity();
        for block in guard.iter() {
            if block.cached_data().map(|d| d.identity()) == Some(wanted) {
                return Ok(Some(block.header()?.clone()));
            }
        }
        Ok(None)
    }

    /// Whether a block of this sequence has `data` as its loaded payload.
    pub fn caches(&self, data: &BlockData) -> bool {
        self.read()
            .iter()
            .any(|block| block.cached_data().is_some_and(|d| d.same_as(data)))
    }

    /// Codecs of every compressed block.
    pub fn compressions(&self) -> ManagerResult<Vec<Compression>> {
        let guard = self.read();
        let mut out = Vec::new();
        for block in guard.iter() {
            let compression = block.header()?.compression;
            if !compression.is_none() {
                out.push(compression);
            }
        }
        Ok(out)
    }

    /// End of the last block whose payload still depends on the file, if
    /// any. New blocks must not be written before this point.
    pub fn last_file_sourced_end(&self) -> ManagerResult<Option<u64>> {
        let guard = self.read();
        match guard.iter().rev().find(|b| b.reads_from_file()) {
            Some(block) => Ok(Some(block.end_offset()?)),
            None => Ok(None),
        }
    }
}

impl fmt::Debug for ReadBlocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadBlocks").field("len", &self.len()).finish()
    }
}

struct Target {
    index: usize,
    blocks: Weak<ReadBlocks>,
}

/// Deferred access to the payload of a read block.
///
/// A callback does not keep its block sequence alive. It can be pointed at a
/// different `(index, sequence)` pair, which is how relocated blocks stay
/// reachable through callbacks handed out before the move.
pub struct DataCallback {
    target: RwLock<Target>,
}

impl DataCallback {
    pub fn new(index: usize, blocks: &Arc<ReadBlocks>) -> Arc<Self> {
        Arc::new(Self {
            target: RwLock::new(Target {
                index,
                blocks: Arc::downgrade(blocks),
            }),
        })
    }

    fn resolve(&self) -> ManagerResult<(usize, Arc<ReadBlocks>)> {
        let target = self.target.read().expect("data callback lock poisoned");
        let blocks = target
            .blocks
            .upgrade()
            .ok_or(ManagerError::MissingBlockSequence)?;
        Ok((target.index, blocks))
    }

    /// Load the payload.
    pub fn call(&self) -> ManagerResult<BlockData> {
        let (index, blocks) = self.resolve()?;
        blocks.data(index)
    }

    pub fn index(&self) -> usize {
        self.target.read().expect("data callback lock poisoned").index
    }

    pub fn header(&self) -> ManagerResult<BlockHeader> {
        let (index, blocks) = self.resolve()?;
        blocks.header(index)
    }

    /// Whether the block's payload has been decoded already.
    pub fn is_loaded(&self) -> ManagerResult<bool> {
        let (index, blocks) = self.resolve()?;
        blocks.with_block(index, ReadBlock::is_loaded)
    }

    pub(crate) fn reassign(&self, index: usize, blocks: &Arc<ReadBlocks>) {
        let mut target = self.target.write().expect("data callback lock poisoned");
        target.index = index;
        target.blocks = Arc::downgrade(blocks);
    }

    /// A write payload that loads through this callback when encoded.
    pub fn as_payload(self: &Arc<Self>) -> Payload {
        let callback = Arc::clone(self);
        Payload::from_fn(move || {
            callback
                .call()
                .map_err(|e| BlockError::Source(e.to_string()))
        })
    }
}

impl fmt::Debug for DataCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataCallback")
            .field("index", &self.index())
            .finish()
    }
}
