use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use sdc_block::{
    read_blocks, write_block_index, write_blocks, BlockData, BlockFile, Compression,
    CompressionKwargs, MappedView, Padding, Payload, ReadBlock, ReadOptions, WriteBlock,
    WrittenBlock,
};
use sdc_identity::{Identity, Key, KeyCounter, LinearStore, ObjectRef, Store};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::callback::{DataCallback, ReadBlocks};
use crate::config::{BlockConfig, CompressionPolicy, ManagerConfig};
use crate::error::{ManagerError, ManagerResult};
use crate::external::{
    resolve_uri, uri_for_index, uri_to_path, write_external_file, ExternalBlockCache, ExternalData,
};
use crate::options::{Options, OptionsStore, StorageType};

/// Where a claimed payload will be written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockSlot {
    /// Internal block at this index.
    Index(usize),
    /// External block at this URI, relative to the document.
    External(String),
    /// The streamed block.
    Streamed,
}

impl BlockSlot {
    /// The value a converter records in the tree to refer to the block:
    /// the index, the external URI, or `-1` for the streamed block.
    pub fn source(&self) -> serde_json::Value {
        match self {
            Self::Index(index) => serde_json::Value::from(*index),
            Self::External(uri) => serde_json::Value::from(uri.as_str()),
            Self::Streamed => serde_json::Value::from(-1),
        }
    }

    pub fn index(&self) -> Option<usize> {
        match self {
            Self::Index(index) => Some(*index),
            _ => None,
        }
    }
}

/// Outcome of [`Manager::update`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// Where the blocks were first written, before being moved.
    pub staged_at: u64,
    /// Where the block region now starts.
    pub block_start: u64,
    /// End of the blocks and index; the file was cut here when possible.
    pub end: u64,
    pub blocks_written: usize,
    pub bytes_moved: u64,
    pub truncated: bool,
}

/// Owner of every block of one open document.
///
/// Holds the blocks read from the file, the per-payload options, the data
/// callbacks handed to deserialized objects, and while a write transaction
/// is open the pending write blocks.
pub struct Manager {
    config: BlockConfig,
    uri: Option<String>,
    keys: KeyCounter,
    blocks: Arc<ReadBlocks>,
    options: OptionsStore,
    data_callbacks: Store<Arc<DataCallback>>,
    write_blocks: LinearStore<WriteBlock>,
    external_write_blocks: Vec<WriteBlock>,
    streamed_write_block: Option<WriteBlock>,
    streamed_keys: Vec<Key>,
    write_file: Option<BlockFile>,
    saved_options: Option<OptionsStore>,
    external_cache: ExternalBlockCache,
}

impl Manager {
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_counter(config, KeyCounter::new())
    }

    /// A manager drawing keys from a session-owned counter.
    pub fn with_counter(config: ManagerConfig, keys: KeyCounter) -> Self {
        let blocks = Arc::new(ReadBlocks::new(keys.clone()));
        Self {
            config: config.blocks,
            uri: config.uri,
            options: OptionsStore::new(keys.clone(), blocks.clone()),
            data_callbacks: Store::new(keys.clone()),
            write_blocks: LinearStore::new(keys.clone()),
            external_write_blocks: Vec::new(),
            streamed_write_block: None,
            streamed_keys: Vec::new(),
            write_file: None,
            saved_options: None,
            external_cache: ExternalBlockCache::new(),
            blocks,
            keys,
        }
    }

    pub fn config(&self) -> &BlockConfig {
        &self.config
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn set_uri(&mut self, uri: impl Into<String>) {
        self.uri = Some(uri.into());
    }

    pub fn key_counter(&self) -> &KeyCounter {
        &self.keys
    }

    /// A fresh, unbound key.
    pub fn new_key(&self) -> Key {
        Key::new(&self.keys)
    }

    pub fn blocks(&self) -> &Arc<ReadBlocks> {
        &self.blocks
    }

    pub fn options(&self) -> &OptionsStore {
        &self.options
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    /// Read every block from the current position of `file`.
    pub fn read(&mut self, file: &BlockFile, after_magic: bool) -> ManagerResult<usize> {
        let blocks = read_blocks(file, &self.config.read_options(), after_magic)?;
        let count = blocks.len();
        self.blocks.set_blocks(blocks);
        if self.uri.is_none() {
            self.uri = file.uri().map(str::to_string);
        }
        debug!(blocks = count, "read blocks");
        Ok(count)
    }

    /// A callback yielding the payload of block `index`.
    pub fn data_callback(&self, index: usize) -> ManagerResult<Arc<DataCallback>> {
        let len = self.blocks.len();
        if index >= len {
            return Err(ManagerError::MissingBlock { index, len });
        }
        Ok(DataCallback::new(index, &self.blocks))
    }

    /// Hand `callback` to an object (or key) so relocation can redirect it.
    pub fn register_data_callback<'a>(
        &mut self,
        owner: impl Into<ObjectRef<'a>>,
        callback: Arc<DataCallback>,
    ) -> ManagerResult<()> {
        Ok(self.data_callbacks.assign(owner, callback)?)
    }

    pub fn data_callback_for<'a>(&self, owner: impl Into<ObjectRef<'a>>) -> Option<Arc<DataCallback>> {
        self.data_callbacks.lookup(owner).cloned()
    }

    /// Payload of an external block reference. References back to this
    /// document yield internal block 0.
    pub fn load_external(&mut self, uri: &str) -> ManagerResult<BlockData> {
        let opts = self.config.read_options();
        match self.external_cache.load(self.uri.as_deref(), uri, &opts)? {
            ExternalData::Internal => self.blocks.data(0),
            ExternalData::Data(data) => Ok(data),
        }
    }

    // ------------------------------------------------------------------
    // Per-payload options
    // ------------------------------------------------------------------

    pub fn get_storage_type(&mut self, payload: &dyn Identity) -> ManagerResult<StorageType> {
        Ok(self.options.get_options(payload)?.storage_type)
    }

    pub fn set_storage_type(&mut self, payload: &dyn Identity, storage: StorageType) -> ManagerResult<()> {
        let mut options = self.options.get_options(payload)?;
        options.storage_type = storage;
        self.options.set_options(payload, options)
    }

    pub fn get_compression(&mut self, payload: &dyn Identity) -> ManagerResult<Compression> {
        Ok(self.options.get_options(payload)?.compression)
    }

    pub fn get_compression_kwargs(&mut self, payload: &dyn Identity) -> ManagerResult<CompressionKwargs> {
        Ok(self.options.get_options(payload)?.compression_kwargs)
    }

    pub fn set_compression(
        &mut self,
        payload: &dyn Identity,
        compression: Compression,
        kwargs: CompressionKwargs,
    ) -> ManagerResult<()> {
        let mut options = self.options.get_options(payload)?;
        options.compression = compression;
        options.compression_kwargs = kwargs;
        self.options.set_options(payload, options)
    }

    /// Options for `payload` with the configured overrides applied.
    pub fn resolved_options(&mut self, payload: &dyn Identity) -> ManagerResult<Options> {
        let mut options = self.options.get_options(payload)?;
        if let Some(storage) = self.config.storage_override {
            options.storage_type = storage;
        }
        if let CompressionPolicy::Codec(codec) = self.config.compression {
            if options.compression != codec {
                options.compression = codec;
                options.compression_kwargs = CompressionKwargs::new();
            }
        }
        Ok(options)
    }

    /// Distinct codecs the next write will use.
    pub fn output_compressions(&self) -> ManagerResult<BTreeSet<Compression>> {
        self.options.output_compressions(self.config.compression)
    }

    // ------------------------------------------------------------------
    // Write blocks
    // ------------------------------------------------------------------

    fn base_uri(&self) -> Option<&str> {
        self.write_file
            .as_ref()
            .and_then(BlockFile::uri)
            .or(self.uri.as_deref())
    }

    /// Claim a block for `payload` on behalf of `owner`.
    ///
    /// Internal payloads already claimed are deduplicated: the existing
    /// index is returned and `owner` shares the block. External payloads
    /// likewise reuse their URI. Streamed payloads go to the streamed slot.
    pub fn make_write_block<'a>(
        &mut self,
        payload: &Payload,
        options: &Options,
        owner: impl Into<ObjectRef<'a>>,
    ) -> ManagerResult<BlockSlot> {
        let owner = owner.into();
        match options.storage_type {
            StorageType::Streamed => {
                self.set_streamed_write_block(payload, owner)?;
                Ok(BlockSlot::Streamed)
            }
            StorageType::External => {
                if let Some(uri) = self
                    .external_write_blocks
                    .iter()
                    .find(|b| b.payload.same_as(payload))
                    .and_then(|b| b.uri.clone())
                {
                    return Ok(BlockSlot::External(uri));
                }
                let base = self.base_uri().ok_or(ManagerError::UnknownBaseUri)?;
                let uri = uri_for_index(base, self.external_write_blocks.len());
                let block = WriteBlock::new(payload.clone())
                    .with_compression(options.compression, options.compression_kwargs.clone())
                    .with_uri(uri.clone());
                self.external_write_blocks.push(block);
                Ok(BlockSlot::External(uri))
            }
            StorageType::Internal => {
                if let Some(index) = self
                    .write_blocks
                    .iter()
                    .position(|b| b.payload.same_as(payload))
                {
                    self.write_blocks.assign_index(owner, index)?;
                    return Ok(BlockSlot::Index(index));
                }
                let block = WriteBlock::new(payload.clone())
                    .with_compression(options.compression, options.compression_kwargs.clone());
                let index = self.write_blocks.push(block);
                self.write_blocks.assign_index(owner, index)?;
                Ok(BlockSlot::Index(index))
            }
        }
    }

    /// Bind the streamed slot to `payload`. Binding the same payload again
    /// only records another owner.
    pub fn set_streamed_write_block<'a>(
        &mut self,
        payload: &Payload,
        owner: impl Into<ObjectRef<'a>>,
    ) -> ManagerResult<()> {
        match &self.streamed_write_block {
            Some(existing) if !existing.payload.same_as(payload) => {
                return Err(ManagerError::SecondStreamedBlock);
            }
            Some(_) => {}
            None => self.streamed_write_block = Some(WriteBlock::new(payload.clone())),
        }
        let key = match owner.into() {
            ObjectRef::Object(obj) => Key::bound(&self.keys, obj),
            ObjectRef::Key(key) => key.clone(),
        };
        if !self.streamed_keys.iter().any(|k| k == &key) {
            self.streamed_keys.push(key);
        }
        Ok(())
    }

    pub fn write_blocks(&self) -> &[WriteBlock] {
        self.write_blocks.items()
    }

    pub fn external_write_blocks(&self) -> &[WriteBlock] {
        &self.external_write_blocks
    }

    pub fn streamed_write_block(&self) -> Option<&WriteBlock> {
        self.streamed_write_block.as_ref()
    }

    fn has_pending_blocks(&self) -> bool {
        !self.write_blocks.is_empty() || self.streamed_write_block.is_some()
    }

    // ------------------------------------------------------------------
    // Write transactions
    // ------------------------------------------------------------------

    /// Start writing to `file`. Pending write state is discarded when the
    /// returned guard is dropped; with `copy_options` the per-payload
    /// options are restored as well.
    pub fn open_write_transaction(&mut self, file: BlockFile, copy_options: bool) -> WriteTransaction<'_> {
        self.clear_write();
        self.write_file = Some(file);
        if copy_options {
            self.saved_options = Some(self.options.clone());
        }
        WriteTransaction { manager: self }
    }

    fn close_write_transaction(&mut self) {
        self.clear_write();
        if let Some(mut saved) = self.saved_options.take() {
            saved.set_read_blocks(self.blocks.clone());
            self.options = saved;
        }
    }

    /// Drop all pending write state.
    pub fn clear_write(&mut self) {
        self.clear_pending();
        self.write_file = None;
    }

    fn clear_pending(&mut self) {
        self.write_blocks = LinearStore::new(self.keys.clone());
        self.external_write_blocks.clear();
        self.streamed_write_block = None;
        self.streamed_keys.clear();
    }

    pub fn in_write_transaction(&self) -> bool {
        self.write_file.is_some()
    }

    fn require_write_file(&self, operation: &'static str) -> ManagerResult<BlockFile> {
        self.write_file
            .clone()
            .ok_or(ManagerError::NoWriteTransaction { operation })
    }

    fn write_external_blocks(&self) -> ManagerResult<()> {
        if self.external_write_blocks.is_empty() {
            return Ok(());
        }
        let base = self.base_uri().ok_or(ManagerError::UnknownBaseUri)?;
        for block in &self.external_write_blocks {
            let relative = block.uri.as_deref().unwrap_or_default();
            let resolved = resolve_uri(Some(base), relative);
            let path = uri_to_path(&resolved).ok_or(ManagerError::UnknownBaseUri)?;
            write_external_file(&path, block, self.config.io_block_size)?;
        }
        Ok(())
    }

    /// Write the pending blocks at the current position of the write file,
    /// optionally followed by a block index, then write external blocks.
    pub fn write(&mut self, padding: Padding, include_index: bool) -> ManagerResult<Vec<WrittenBlock>> {
        let file = self.require_write_file("write")?;
        let mut written = Vec::new();
        if self.has_pending_blocks() {
            written = write_blocks(
                &file,
                self.write_blocks.items(),
                self.streamed_write_block.as_ref(),
                &self.config.write_options(padding, include_index),
            )?;
            file.flush()?;
        }
        self.write_external_blocks()?;
        info!(blocks = written.len(), external = self.external_write_blocks.len(), "wrote blocks");
        Ok(written)
    }

    /// Handles on `data` held by this manager itself: the read block cache
    /// and the pending write blocks.
    fn own_handles(&self, data: &BlockData) -> usize {
        let pending = self
            .write_blocks
            .iter()
            .chain(&self.external_write_blocks)
            .chain(self.streamed_write_block.as_ref())
            .filter(|block| matches!(&block.payload, Payload::Data(d) if d.same_as(data)))
            .count();
        usize::from(self.blocks.caches(data)) + pending
    }

    /// End of the furthest mapped view of `file`, or an error if any view is
    /// held outside this manager.
    fn check_mapped_views(&self, file: &BlockFile) -> ManagerResult<Option<u64>> {
        let views = file.mapped_views();
        if let Some(view) = views.iter().find(|v| v.holders() > self.own_handles(&v.data)) {
            return Err(ManagerError::MappedViewInUse {
                offset: view.offset,
                len: view.len,
            });
        }
        Ok(views.iter().map(MappedView::end).max())
    }

    /// The callback to redirect for a write block owned by `key`: the one
    /// registered under `key`, else the only one registered for its object.
    fn callback_for_owner(&self, key: &Key, index: usize) -> Option<&Arc<DataCallback>> {
        if let Some(callback) = self.data_callbacks.lookup(key) {
            return Some(callback);
        }
        match self.data_callbacks.count_referent_of(key) {
            0 => None,
            1 => self.data_callbacks.lookup_referent_of(key),
            callbacks => {
                debug!(?key, index, callbacks, "ambiguous referent callbacks, exact key only");
                None
            }
        }
    }

    /// Rewrite the block region of the write file in place so that it starts
    /// at `new_tree_size`.
    ///
    /// Blocks are first written past every byte still needed by a read
    /// block, then moved down to `new_tree_size`. Afterwards the read block
    /// sequence describes the new layout, objects that owned a write block
    /// own the matching read block, and their data callbacks point at it.
    ///
    /// Fails with [`ManagerError::MappedViewInUse`], before anything is
    /// written, while a memory-mapped payload of the file is held outside the
    /// manager. On success the pending write blocks are consumed and the
    /// previous read block sequence is emptied.
    pub fn update(
        &mut self,
        new_tree_size: u64,
        padding: Padding,
        include_index: bool,
    ) -> ManagerResult<UpdateReport> {
        let file = self.require_write_file("update")?;
        let mapped_end = if self.has_pending_blocks() {
            self.check_mapped_views(&file)?
        } else {
            None
        };
        let staged_at = [self.blocks.last_file_sourced_end()?, mapped_end]
            .into_iter()
            .flatten()
            .fold(new_tree_size, u64::max);

        self.write_external_blocks()?;

        if !self.has_pending_blocks() {
            return Ok(UpdateReport {
                staged_at,
                block_start: new_tree_size,
                end: new_tree_size,
                ..Default::default()
            });
        }

        file.seek(staged_at)?;
        let opts = self.config.write_options(padding, false);
        let written = write_blocks(
            &file,
            self.write_blocks.items(),
            self.streamed_write_block.as_ref(),
            &opts,
        )?;
        let staged_end = file.tell()?;
        let len = staged_end - staged_at;

        let streamed = self.streamed_write_block.is_some();
        let owners: Vec<Vec<Key>> = (0..written.len())
            .map(|index| {
                if index == self.write_blocks.len() {
                    self.streamed_keys.clone()
                } else {
                    self.write_blocks.owners_of(index)
                }
            })
            .collect();
        // Mapped bytes below are about to move; drop this manager's handles.
        self.clear_pending();
        self.blocks.set_blocks(Vec::new());

        move_down(&file, staged_at, new_tree_size, len, self.config.io_block_size)?;

        let delta = new_tree_size as i64 - staged_at as i64;
        let written: Vec<WrittenBlock> = written.iter().map(|w| w.shifted(delta)).collect();

        let mut end = new_tree_size + len;
        if include_index && !streamed {
            let offsets: Vec<u64> = written.iter().map(|w| w.offset).collect();
            end = write_block_index(&file, end, &offsets)?;
        }
        let truncated = file.truncate(end)?;
        file.flush()?;
        file.seek(end)?;

        let read_opts = ReadOptions {
            lazy_load: true,
            validate_checksums: false,
            ..self.config.read_options()
        };
        let new_blocks = Arc::new(ReadBlocks::new(self.keys.clone()));
        for (index, (block, keys)) in written.iter().zip(owners).enumerate() {
            new_blocks.append_block(ReadBlock::with_header(
                file.clone(),
                block.offset,
                block.header.clone(),
                block.data_offset,
                &read_opts,
            ));

            for key in keys {
                if !key.is_valid() {
                    debug!(?key, index, "owner dropped before relocation");
                    continue;
                }
                new_blocks.assign_index(&key, index)?;
                if let Some(callback) = self.callback_for_owner(&key, index) {
                    callback.reassign(index, &new_blocks);
                }
            }
        }

        self.blocks = new_blocks;
        self.options.set_read_blocks(self.blocks.clone());
        if let Some(saved) = &mut self.saved_options {
            saved.set_read_blocks(self.blocks.clone());
        }

        let report = UpdateReport {
            staged_at,
            block_start: new_tree_size,
            end,
            blocks_written: written.len(),
            bytes_moved: if delta == 0 { 0 } else { len },
            truncated,
        };
        info!(
            staged_at,
            block_start = new_tree_size,
            blocks = report.blocks_written,
            "updated blocks in place"
        );
        Ok(report)
    }
}

/// Copy `len` bytes from `src` down to `dst` in chunks. `dst <= src`.
fn move_down(file: &BlockFile, src: u64, dst: u64, len: u64, chunk: usize) -> ManagerResult<()> {
    if src == dst || len == 0 {
        return Ok(());
    }
    debug_assert!(dst < src);
    let chunk = chunk.max(1) as u64;
    let mut done = 0u64;
    while done < len {
        let n = chunk.min(len - done);
        let bytes = file.read_up_to(src + done, n as usize)?;
        if bytes.is_empty() {
            break;
        }
        file.write_at(dst + done, &bytes)?;
        done += bytes.len() as u64;
    }
    debug!(src, dst, len = done, "moved block bytes");
    Ok(())
}

/// Scope of one write or update. Dropping it discards pending write state.
pub struct WriteTransaction<'m> {
    manager: &'m mut Manager,
}

impl Deref for WriteTransaction<'_> {
    type Target = Manager;

    fn deref(&self) -> &Manager {
        self.manager
    }
}

impl DerefMut for WriteTransaction<'_> {
    fn deref_mut(&mut self) -> &mut Manager {
        self.manager
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        self.manager.close_write_transaction();
    }
}
