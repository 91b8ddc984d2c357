//! Per-document and per-object contexts handed to converters.
//!
//! A [`SerializationContext`] lives for one read or write of a document. For
//! each object converted it opens either a [`Deserialization`] (read mode) or
//! a [`Serialization`] (write mode) step, which is the only way a converter
//! touches blocks.

use std::collections::BTreeSet;
use std::sync::Arc;

use sdc_block::{BlockData, Payload};
use sdc_identity::{AnyObject, Identity, Key, ObjectRef};
use sdc_manager::{BlockSlot, DataCallback, Manager};
use tracing::{debug, trace};

use crate::error::{ContextError, ContextResult};

/// Document versions this implementation reads and writes.
pub const SUPPORTED_VERSIONS: &[&str] = &["1.0.0", "1.1.0"];

pub const DEFAULT_VERSION: &str = "1.1.0";

/// Lifecycle of one conversion step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextState {
    /// Not yet bound to an object.
    Idle,
    /// Converting one object; block access is allowed.
    Bound,
    /// Blocks assigned; the step accepts no further access until reset.
    Finalized,
}

fn require(actual: ContextState, expected: ContextState) -> ContextResult<()> {
    if actual != expected {
        return Err(ContextError::InvalidState { expected, actual });
    }
    Ok(())
}

/// State shared by every conversion step of one document.
#[derive(Clone, Debug)]
pub struct SerializationContext {
    version: String,
    url: Option<String>,
    tags_used: BTreeSet<String>,
}

impl SerializationContext {
    pub fn new(version: impl Into<String>, url: Option<String>) -> ContextResult<Self> {
        let version = version.into();
        if !SUPPORTED_VERSIONS.contains(&version.as_str()) {
            return Err(ContextError::UnsupportedVersion(version));
        }
        Ok(Self {
            version,
            url,
            tags_used: BTreeSet::new(),
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// URI of the document, when it has one.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn mark_tag_used(&mut self, tag: &str) {
        if !self.tags_used.contains(tag) {
            self.tags_used.insert(tag.to_string());
        }
    }

    /// Tags converted so far, for the document's history.
    pub fn tags_used(&self) -> &BTreeSet<String> {
        &self.tags_used
    }

    /// Open a read-mode step over `manager`.
    pub fn deserialization<'c>(&'c mut self, manager: &'c mut Manager) -> Deserialization<'c> {
        Deserialization {
            ctx: self,
            manager,
            state: ContextState::Idle,
            implicit: None,
            keyed: Vec::new(),
        }
    }

    /// Open a write-mode step over `manager`.
    pub fn serialization<'c>(&'c mut self, manager: &'c mut Manager) -> Serialization<'c> {
        Serialization {
            ctx: self,
            manager,
            state: ContextState::Idle,
            obj: None,
        }
    }
}

impl Default for SerializationContext {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION.to_string(),
            url: None,
            tags_used: BTreeSet::new(),
        }
    }
}

// ----------------------------------------------------------------------
// Read mode
// ----------------------------------------------------------------------

/// Block access while one object is rebuilt from the tree.
///
/// A converter reading a single block may ask for it without a key. One that
/// reads several must generate a key per block and pass it along; the keys
/// are bound to the finished object on [`finalize`](Self::finalize).
pub struct Deserialization<'c> {
    ctx: &'c mut SerializationContext,
    manager: &'c mut Manager,
    state: ContextState,
    implicit: Option<Arc<DataCallback>>,
    keyed: Vec<(Key, Option<Arc<DataCallback>>)>,
}

impl Deserialization<'_> {
    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn context(&self) -> &SerializationContext {
        self.ctx
    }

    pub fn begin(&mut self) -> ContextResult<()> {
        require(self.state, ContextState::Idle)?;
        self.state = ContextState::Bound;
        Ok(())
    }

    /// Deferred payload of block `index`.
    ///
    /// Without a key, repeated requests for the same block return the same
    /// callback and requesting a second block fails. With a key, the first
    /// request under that key decides the callback.
    pub fn block_payload(&mut self, index: usize, key: Option<&Key>) -> ContextResult<Arc<DataCallback>> {
        require(self.state, ContextState::Bound)?;
        let Some(key) = key else {
            if let Some(cb) = &self.implicit {
                if cb.index() != index {
                    return Err(ContextError::ImplicitBlockConflict {
                        current: cb.index(),
                        requested: index,
                    });
                }
                return Ok(Arc::clone(cb));
            }
            let cb = self.manager.data_callback(index)?;
            self.implicit = Some(Arc::clone(&cb));
            return Ok(cb);
        };

        let slot = match self.keyed.iter().position(|(k, _)| k.same_handle(key)) {
            Some(pos) => pos,
            None => {
                self.keyed.push((key.clone(), None));
                self.keyed.len() - 1
            }
        };
        if let Some(cb) = &self.keyed[slot].1 {
            return Ok(Arc::clone(cb));
        }
        let cb = self.manager.data_callback(index)?;
        self.keyed[slot].1 = Some(Arc::clone(&cb));
        Ok(cb)
    }

    /// A fresh key, bound to the object once it exists.
    pub fn new_block_key(&mut self) -> ContextResult<Key> {
        require(self.state, ContextState::Bound)?;
        let key = self.manager.new_key();
        self.keyed.push((key.clone(), None));
        Ok(key)
    }

    /// Payload of an external block reference.
    pub fn external_payload(&mut self, uri: &str) -> ContextResult<BlockData> {
        require(self.state, ContextState::Bound)?;
        Ok(self.manager.load_external(uri)?)
    }

    pub(crate) fn mark_tag_used(&mut self, tag: &str) {
        self.ctx.mark_tag_used(tag);
    }

    /// Hand the callbacks requested during this step to `obj`.
    ///
    /// Fails without registering anything if a generated key was never
    /// used to request a block.
    pub fn finalize(&mut self, obj: &dyn Identity) -> ContextResult<()> {
        require(self.state, ContextState::Bound)?;
        if let Some((key, _)) = self.keyed.iter().find(|(_, cb)| cb.is_none()) {
            return Err(ContextError::UnusedKey(key.counter()));
        }
        if let Some(cb) = self.implicit.take() {
            self.manager
                .register_data_callback(ObjectRef::object(obj), cb)?;
        }
        for (key, cb) in self.keyed.drain(..) {
            let Some(cb) = cb else { continue };
            key.assign(obj);
            self.manager.register_data_callback(&key, cb)?;
        }
        self.state = ContextState::Finalized;
        trace!("read step finalized");
        Ok(())
    }

    /// Forget this step's requests and return to idle.
    pub fn reset(&mut self) {
        self.implicit = None;
        self.keyed.clear();
        self.state = ContextState::Idle;
    }
}

// ----------------------------------------------------------------------
// Write mode
// ----------------------------------------------------------------------

/// Block access while one object is written to the tree.
pub struct Serialization<'c> {
    ctx: &'c mut SerializationContext,
    manager: &'c mut Manager,
    state: ContextState,
    obj: Option<AnyObject>,
}

impl Serialization<'_> {
    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn context(&self) -> &SerializationContext {
        self.ctx
    }

    /// Bind the step to the object being written.
    pub fn begin(&mut self, obj: AnyObject) -> ContextResult<()> {
        require(self.state, ContextState::Idle)?;
        self.obj = Some(obj);
        self.state = ContextState::Bound;
        Ok(())
    }

    fn object(&self) -> ContextResult<&AnyObject> {
        self.obj.as_ref().ok_or(ContextError::InvalidState {
            expected: ContextState::Bound,
            actual: self.state,
        })
    }

    /// Claim a block for `payload` and return the source to record in the
    /// tree.
    ///
    /// The block is owned by `key` when given, by the bound object
    /// otherwise. Claiming a payload already claimed returns its slot.
    pub fn claim_block(&mut self, payload: &Payload, key: Option<&Key>) -> ContextResult<BlockSlot> {
        require(self.state, ContextState::Bound)?;
        let options = self.manager.resolved_options(payload)?;
        let slot = match key {
            Some(key) => self.manager.make_write_block(payload, &options, key)?,
            None => {
                let obj = Arc::clone(self.object()?);
                self.manager.make_write_block(payload, &options, &obj)?
            }
        };
        debug!(storage = %options.storage_type, slot = ?slot, "claimed block");
        Ok(slot)
    }

    /// A key bound to the object being written.
    pub fn new_block_key(&mut self) -> ContextResult<Key> {
        require(self.state, ContextState::Bound)?;
        let obj = self.object()?;
        Ok(Key::bound(self.manager.key_counter(), obj))
    }

    pub(crate) fn mark_tag_used(&mut self, tag: &str) {
        self.ctx.mark_tag_used(tag);
    }

    pub fn finalize(&mut self) -> ContextResult<()> {
        require(self.state, ContextState::Bound)?;
        self.state = ContextState::Finalized;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.obj = None;
        self.state = ContextState::Idle;
    }
}
