use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use sdc_identity::AnyObject;
use sdc_manager::Manager;
use serde_json::Value;
use tracing::debug;

use crate::context::{Deserialization, Serialization, SerializationContext};
use crate::error::{ContextError, ContextResult};

/// Converts objects of some type to and from tree nodes.
///
/// Block access goes exclusively through the step context passed in.
pub trait Converter: Send + Sync {
    /// Tags this converter handles.
    fn tags(&self) -> &[&'static str];

    fn to_tree(&self, obj: &AnyObject, tag: &str, ctx: &mut Serialization<'_>) -> ContextResult<Value>;

    fn from_tree(&self, node: &Value, tag: &str, ctx: &mut Deserialization<'_>) -> ContextResult<AnyObject>;
}

/// Converters by tag.
#[derive(Default, Clone)]
pub struct ConverterRegistry {
    by_tag: BTreeMap<String, Arc<dyn Converter>>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `converter` for all its tags. Nothing is registered if any
    /// tag is taken.
    pub fn register(&mut self, converter: Arc<dyn Converter>) -> ContextResult<()> {
        if let Some(tag) = converter.tags().iter().find(|t| self.by_tag.contains_key(**t)) {
            return Err(ContextError::DuplicateTag((*tag).to_string()));
        }
        for tag in converter.tags() {
            self.by_tag.insert((*tag).to_string(), Arc::clone(&converter));
        }
        Ok(())
    }

    pub fn get(&self, tag: &str) -> ContextResult<&Arc<dyn Converter>> {
        self.by_tag
            .get(tag)
            .ok_or_else(|| ContextError::UnknownTag(tag.to_string()))
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.by_tag.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }

    /// Convert `obj` to a tree node in one write step.
    pub fn serialize_object(
        &self,
        ctx: &mut SerializationContext,
        manager: &mut Manager,
        tag: &str,
        obj: &AnyObject,
    ) -> ContextResult<Value> {
        let converter = Arc::clone(self.get(tag)?);
        let mut step = ctx.serialization(manager);
        step.begin(Arc::clone(obj))?;
        let node = converter.to_tree(obj, tag, &mut step)?;
        step.finalize()?;
        step.mark_tag_used(tag);
        debug!(tag, "serialized object");
        Ok(node)
    }

    /// Rebuild an object from `node` in one read step. The blocks the
    /// converter accessed are assigned to the new object.
    pub fn deserialize_node(
        &self,
        ctx: &mut SerializationContext,
        manager: &mut Manager,
        tag: &str,
        node: &Value,
    ) -> ContextResult<AnyObject> {
        let converter = Arc::clone(self.get(tag)?);
        let mut step = ctx.deserialization(manager);
        step.begin()?;
        let obj = converter.from_tree(node, tag, &mut step)?;
        step.finalize(&obj)?;
        step.mark_tag_used(tag);
        debug!(tag, "deserialized node");
        Ok(obj)
    }
}

impl fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConverterRegistry")
            .field("tags", &self.by_tag.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdc_block::{seek_to_first_block, BlockData, BlockFile, Padding, Payload};
    use sdc_manager::{BlockSlot, DataCallback, ManagerConfig};
    use serde_json::json;

    const DATA_TAG: &str = "tag:example/block_data-1.0.0";
    const CALLBACK_TAG: &str = "tag:example/block_callback-1.0.0";
    const PAIR_TAG: &str = "tag:example/block_pair-1.0.0";

    struct DataHolder {
        payload: Payload,
    }

    struct CallbackHolder {
        callback: Arc<DataCallback>,
        payload: Payload,
    }

    impl CallbackHolder {
        fn new(callback: Arc<DataCallback>) -> Self {
            let payload = callback.as_payload();
            Self { callback, payload }
        }
    }

    struct PairHolder {
        first: Payload,
        second: Payload,
    }

    fn downcast<T: 'static>(obj: &AnyObject) -> ContextResult<&T> {
        (**obj)
            .downcast_ref::<T>()
            .ok_or_else(|| ContextError::Conversion("unexpected object type".into()))
    }

    fn index_of(node: &Value, field: &str) -> ContextResult<usize> {
        node[field]
            .as_u64()
            .map(|i| i as usize)
            .ok_or_else(|| ContextError::Conversion(format!("missing {field}")))
    }

    struct DataConverter;

    impl Converter for DataConverter {
        fn tags(&self) -> &[&'static str] {
            &[DATA_TAG]
        }

        fn to_tree(&self, obj: &AnyObject, _tag: &str, ctx: &mut Serialization<'_>) -> ContextResult<Value> {
            let holder = downcast::<DataHolder>(obj)?;
            let slot = ctx.claim_block(&holder.payload, None)?;
            Ok(json!({ "source": slot.source() }))
        }

        fn from_tree(&self, node: &Value, _tag: &str, ctx: &mut Deserialization<'_>) -> ContextResult<AnyObject> {
            let cb = ctx.block_payload(index_of(node, "source")?, None)?;
            let data = cb.call()?;
            Ok(Arc::new(DataHolder {
                payload: Payload::from(data),
            }))
        }
    }

    struct CallbackConverter;

    impl Converter for CallbackConverter {
        fn tags(&self) -> &[&'static str] {
            &[CALLBACK_TAG]
        }

        fn to_tree(&self, obj: &AnyObject, _tag: &str, ctx: &mut Serialization<'_>) -> ContextResult<Value> {
            let holder = downcast::<CallbackHolder>(obj)?;
            let slot = ctx.claim_block(&holder.payload, None)?;
            Ok(json!({ "source": slot.source() }))
        }

        fn from_tree(&self, node: &Value, _tag: &str, ctx: &mut Deserialization<'_>) -> ContextResult<AnyObject> {
            let cb = ctx.block_payload(index_of(node, "source")?, None)?;
            Ok(Arc::new(CallbackHolder::new(cb)))
        }
    }

    struct PairConverter;

    impl Converter for PairConverter {
        fn tags(&self) -> &[&'static str] {
            &[PAIR_TAG]
        }

        fn to_tree(&self, obj: &AnyObject, _tag: &str, ctx: &mut Serialization<'_>) -> ContextResult<Value> {
            let holder = downcast::<PairHolder>(obj)?;
            let k1 = ctx.new_block_key()?;
            let k2 = ctx.new_block_key()?;
            let first = ctx.claim_block(&holder.first, Some(&k1))?;
            let second = ctx.claim_block(&holder.second, Some(&k2))?;
            Ok(json!({ "first": first.source(), "second": second.source() }))
        }

        fn from_tree(&self, node: &Value, _tag: &str, ctx: &mut Deserialization<'_>) -> ContextResult<AnyObject> {
            let k1 = ctx.new_block_key()?;
            let k2 = ctx.new_block_key()?;
            let first = ctx.block_payload(index_of(node, "first")?, Some(&k1))?;
            let second = ctx.block_payload(index_of(node, "second")?, Some(&k2))?;
            Ok(Arc::new(PairHolder {
                first: Payload::from(first.call()?),
                second: Payload::from(second.call()?),
            }))
        }
    }

    fn registry() -> ConverterRegistry {
        let mut registry = ConverterRegistry::new();
        registry.register(Arc::new(DataConverter)).unwrap();
        registry.register(Arc::new(CallbackConverter)).unwrap();
        registry.register(Arc::new(PairConverter)).unwrap();
        registry
    }

    fn tree_text(node: &Value) -> Vec<u8> {
        let mut text = b"#SDC 1.1.0\n".to_vec();
        text.extend_from_slice(node.to_string().as_bytes());
        text.push(b'\n');
        text
    }

    /// Write `obj` under `tag` to a fresh in-memory document.
    fn write_document(registry: &ConverterRegistry, tag: &str, obj: &AnyObject) -> BlockFile {
        let file = BlockFile::in_memory(Vec::new());
        let mut manager = Manager::new(ManagerConfig::default());
        let mut ctx = SerializationContext::default();
        let mut tx = manager.open_write_transaction(file.clone(), false);
        let node = registry.serialize_object(&mut ctx, &mut tx, tag, obj).unwrap();
        file.write_at(0, &tree_text(&node)).unwrap();
        tx.write(Padding::None, true).unwrap();
        file
    }

    /// Parse the tree of `file` and read its blocks into `manager`.
    fn read_document(file: &BlockFile, manager: &mut Manager) -> (Value, u64) {
        file.seek(0).unwrap();
        let start = seek_to_first_block(file, 4096).unwrap().unwrap();
        let mut text = vec![0u8; start as usize];
        file.read_at(0, &mut text).unwrap();
        let body = std::str::from_utf8(&text).unwrap().lines().nth(1).unwrap();
        let node: Value = serde_json::from_str(body).unwrap();
        file.seek(start).unwrap();
        manager.read(file, false).unwrap();
        (node, start)
    }

    #[test]
    fn duplicate_tags_rejected() {
        let mut registry = registry();
        assert_eq!(registry.len(), 3);
        assert!(matches!(
            registry.register(Arc::new(DataConverter)),
            Err(ContextError::DuplicateTag(tag)) if tag == DATA_TAG
        ));
        assert!(matches!(
            registry.get("tag:example/nothing-1.0.0"),
            Err(ContextError::UnknownTag(_))
        ));
    }

    #[test]
    fn block_data_roundtrip() {
        let registry = registry();
        let obj: AnyObject = Arc::new(DataHolder {
            payload: Payload::from(b"converted bytes".to_vec()),
        });
        let file = write_document(&registry, DATA_TAG, &obj);

        let mut manager = Manager::new(ManagerConfig::default());
        let (node, _) = read_document(&file, &mut manager);
        assert_eq!(node, json!({ "source": 0 }));
        let mut ctx = SerializationContext::default();
        let read = registry
            .deserialize_node(&mut ctx, &mut manager, DATA_TAG, &node)
            .unwrap();
        let holder = downcast::<DataHolder>(&read).unwrap();
        assert_eq!(&holder.payload.bytes().unwrap()[..], b"converted bytes");
        assert!(ctx.tags_used().contains(DATA_TAG));
        assert_eq!(manager.data_callback_for(&read).unwrap().index(), 0);
    }

    #[test]
    fn keyed_blocks_roundtrip() {
        let registry = registry();
        let obj: AnyObject = Arc::new(PairHolder {
            first: Payload::from(vec![1u8; 10]),
            second: Payload::from(vec![7u8; 10]),
        });
        let file = write_document(&registry, PAIR_TAG, &obj);

        let mut manager = Manager::new(ManagerConfig::default());
        let (node, _) = read_document(&file, &mut manager);
        assert_eq!(node, json!({ "first": 0, "second": 1 }));
        let mut ctx = SerializationContext::default();
        let read = registry
            .deserialize_node(&mut ctx, &mut manager, PAIR_TAG, &node)
            .unwrap();
        let holder = downcast::<PairHolder>(&read).unwrap();
        assert_eq!(&holder.first.bytes().unwrap()[..], &[1u8; 10][..]);
        assert_eq!(&holder.second.bytes().unwrap()[..], &[7u8; 10][..]);
    }

    #[test]
    fn same_payload_twice_shares_block() {
        let registry = registry();
        let shared = Payload::from(vec![3u8; 16]);
        let obj: AnyObject = Arc::new(PairHolder {
            first: shared.clone(),
            second: shared,
        });
        let file = BlockFile::in_memory(Vec::new());
        let mut manager = Manager::new(ManagerConfig::default());
        let mut ctx = SerializationContext::default();
        let mut tx = manager.open_write_transaction(file, false);
        let node = registry
            .serialize_object(&mut ctx, &mut tx, PAIR_TAG, &obj)
            .unwrap();
        assert_eq!(node, json!({ "first": 0, "second": 0 }));
        assert_eq!(tx.write_blocks().len(), 1);
    }

    #[test]
    fn callback_block_kept_across_update() {
        let registry = registry();
        let obj: AnyObject = Arc::new(DataHolder {
            payload: Payload::from(b"lazily read".to_vec()),
        });
        let file = write_document(&registry, DATA_TAG, &obj);

        let mut manager = Manager::new(ManagerConfig::default());
        let (node, tree_size) = read_document(&file, &mut manager);
        let mut ctx = SerializationContext::default();
        let read = registry
            .deserialize_node(&mut ctx, &mut manager, CALLBACK_TAG, &node)
            .unwrap();
        assert!(!downcast::<CallbackHolder>(&read).unwrap().callback.is_loaded().unwrap());

        {
            let mut tx = manager.open_write_transaction(file.clone(), false);
            let again = registry
                .serialize_object(&mut ctx, &mut tx, CALLBACK_TAG, &read)
                .unwrap();
            assert_eq!(again, node);
            let report = tx.update(tree_size, Padding::None, true).unwrap();
            assert_eq!(report.blocks_written, 1);
        }
        assert_eq!(manager.blocks().len(), 1);
        let holder = downcast::<CallbackHolder>(&read).unwrap();
        assert_eq!(&holder.callback.call().unwrap()[..], b"lazily read");

        // A fresh read of the rewritten file sees the same single block.
        let mut fresh = Manager::new(ManagerConfig::default());
        let (node, _) = read_document(&file, &mut fresh);
        assert_eq!(node, json!({ "source": 0 }));
        assert_eq!(fresh.blocks().len(), 1);
        assert_eq!(&fresh.blocks().data(0).unwrap()[..], b"lazily read");
    }

    #[test]
    fn dropping_one_object_keeps_the_other() {
        let registry = registry();
        let file = BlockFile::in_memory(Vec::new());
        let mut manager = Manager::new(ManagerConfig::default());
        let mut ctx = SerializationContext::default();
        let a: AnyObject = Arc::new(DataHolder {
            payload: Payload::from(b"a".to_vec()),
        });
        let b: AnyObject = Arc::new(DataHolder {
            payload: Payload::from(b"b".to_vec()),
        });
        let nodes = {
            let mut tx = manager.open_write_transaction(file.clone(), false);
            let na = registry.serialize_object(&mut ctx, &mut tx, DATA_TAG, &a).unwrap();
            let nb = registry.serialize_object(&mut ctx, &mut tx, DATA_TAG, &b).unwrap();
            let tree = json!([na, nb]);
            file.write_at(0, &tree_text(&tree)).unwrap();
            tx.write(Padding::None, true).unwrap();
            tree
        };
        assert_eq!(nodes, json!([{ "source": 0 }, { "source": 1 }]));

        let mut reader = Manager::new(ManagerConfig::default());
        let (tree, _) = read_document(&file, &mut reader);
        let mut ctx = SerializationContext::default();
        let first = registry
            .deserialize_node(&mut ctx, &mut reader, CALLBACK_TAG, &tree[0])
            .unwrap();
        let second = registry
            .deserialize_node(&mut ctx, &mut reader, CALLBACK_TAG, &tree[1])
            .unwrap();
        drop(first);
        assert_eq!(reader.data_callback_for(&second).unwrap().index(), 1);
        let holder = downcast::<CallbackHolder>(&second).unwrap();
        assert_eq!(&holder.callback.call().unwrap()[..], b"b");
    }

    #[test]
    fn external_reference_through_step() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.sdc");
        let uri = format!("file://{}", path.display());
        let payload = Payload::from(vec![4u8; 64]);
        let file = BlockFile::create(&path).unwrap().with_uri(uri.clone());

        let mut manager = Manager::new(ManagerConfig::default().with_uri(uri.clone()));
        manager
            .set_storage_type(&payload, sdc_manager::StorageType::External)
            .unwrap();
        let obj: AnyObject = Arc::new(DataHolder {
            payload: payload.clone(),
        });
        let slot = {
            let mut ctx = SerializationContext::default();
            let mut tx = manager.open_write_transaction(file, false);
            let mut step = ctx.serialization(&mut tx);
            step.begin(Arc::clone(&obj)).unwrap();
            let slot = step.claim_block(&payload, None).unwrap();
            step.finalize().unwrap();
            drop(step);
            tx.write(Padding::None, true).unwrap();
            slot
        };
        let BlockSlot::External(name) = slot else {
            panic!("expected an external slot");
        };

        let mut reader = Manager::new(ManagerConfig::default().with_uri(uri));
        let mut ctx = SerializationContext::default();
        let mut step = ctx.deserialization(&mut reader);
        step.begin().unwrap();
        let data: BlockData = step.external_payload(&name).unwrap();
        assert_eq!(&data[..], &[4u8; 64][..]);
    }
}
