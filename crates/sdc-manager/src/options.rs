use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use sdc_block::{BlockHeader, Compression, CompressionKwargs};
use sdc_identity::{Identity, KeyCounter, ObjectRef, Store};
use serde::{Deserialize, Serialize};

use crate::callback::ReadBlocks;
use crate::config::CompressionPolicy;
use crate::error::{ManagerError, ManagerResult};

/// Where a payload is stored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// A block in the document file.
    #[default]
    Internal,
    /// A single-block sibling file, referenced by URI.
    External,
    /// The final block of the document, extending to end-of-file.
    Streamed,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Internal => "internal",
            Self::External => "external",
            Self::Streamed => "streamed",
        })
    }
}

impl FromStr for StorageType {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "internal" => Ok(Self::Internal),
            "external" => Ok(Self::External),
            "streamed" => Ok(Self::Streamed),
            other => Err(ManagerError::Config(format!("unknown storage type: {other}"))),
        }
    }
}

/// Per-payload block policy.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Options {
    pub storage_type: StorageType,
    pub compression: Compression,
    #[serde(default)]
    pub compression_kwargs: CompressionKwargs,
}

impl Options {
    pub fn new(storage_type: StorageType, compression: Compression) -> Self {
        Self {
            storage_type,
            compression,
            compression_kwargs: CompressionKwargs::new(),
        }
    }

    /// Options matching a block read from a file.
    pub fn from_header(header: &BlockHeader) -> Self {
        let storage_type = if header.is_streamed() {
            StorageType::Streamed
        } else {
            StorageType::Internal
        };
        Self {
            storage_type,
            compression: header.compression,
            compression_kwargs: header.compression_kwargs.clone(),
        }
    }
}

/// Options by payload identity, seeded lazily from the blocks read.
#[derive(Clone)]
pub struct OptionsStore {
    store: Store<Options>,
    read_blocks: Arc<ReadBlocks>,
}

impl OptionsStore {
    pub fn new(counter: KeyCounter, read_blocks: Arc<ReadBlocks>) -> Self {
        Self {
            store: Store::new(counter),
            read_blocks,
        }
    }

    /// Options for `payload`.
    ///
    /// A payload seen for the first time takes its options from the first
    /// read block (in file order) holding it, or the defaults otherwise. The
    /// result is recorded so later calls agree.
    pub fn get_options(&mut self, payload: &dyn Identity) -> ManagerResult<Options> {
        if let Some(options) = self.store.lookup(ObjectRef::object(payload)) {
            return Ok(options.clone());
        }
        let options = match self.read_blocks.header_holding(payload)? {
            Some(header) => Options::from_header(&header),
            None => Options::default(),
        };
        self.set_options(payload, options.clone())?;
        Ok(options)
    }

    /// Recorded options, without discovery.
    pub fn lookup(&self, payload: &dyn Identity) -> Option<&Options> {
        self.store.lookup(ObjectRef::object(payload))
    }

    /// Record options for `payload`. Fails if this would make a second live
    /// payload streamed.
    pub fn set_options(&mut self, payload: &dyn Identity, options: Options) -> ManagerResult<()> {
        if options.storage_type == StorageType::Streamed {
            let conflict = self.store.iter().any(|(key, existing)| {
                existing.storage_type == StorageType::Streamed && !key.matches(payload)
            });
            if conflict {
                return Err(ManagerError::SecondStreamedBlock);
            }
        }
        self.store.assign(ObjectRef::object(payload), options)?;
        Ok(())
    }

    /// Distinct codecs the next write will use.
    pub fn output_compressions(&self, policy: CompressionPolicy) -> ManagerResult<BTreeSet<Compression>> {
        let mut out = BTreeSet::new();
        match policy {
            CompressionPolicy::Input => out.extend(self.read_blocks.compressions()?),
            CompressionPolicy::Codec(codec) => {
                if !codec.is_none() {
                    out.insert(codec);
                }
            }
        }
        out.extend(
            self.store
                .iter()
                .map(|(_, options)| options.compression)
                .filter(|c| !c.is_none()),
        );
        Ok(out)
    }

    pub fn read_blocks(&self) -> &Arc<ReadBlocks> {
        &self.read_blocks
    }

    pub(crate) fn set_read_blocks(&mut self, read_blocks: Arc<ReadBlocks>) {
        self.read_blocks = read_blocks;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdc_block::{read_blocks, write_blocks, BlockFile, Payload, ReadOptions, WriteBlock, WriteOptions};

    fn empty_store() -> OptionsStore {
        let counter = KeyCounter::new();
        OptionsStore::new(counter.clone(), Arc::new(ReadBlocks::new(counter)))
    }

    #[test]
    fn defaults_for_unknown_payload() {
        let mut store = empty_store();
        let payload = Payload::from(vec![1, 2, 3]);
        assert_eq!(store.get_options(&payload).unwrap(), Options::default());
        assert!(store.lookup(&payload).is_some());
    }

    #[test]
    fn second_streamed_payload_rejected() {
        let mut store = empty_store();
        let a = Payload::from(vec![1]);
        let b = Payload::from(vec![2]);
        let streamed = Options::new(StorageType::Streamed, Compression::None);
        store.set_options(&a, streamed.clone()).unwrap();
        // Same payload again is fine.
        store.set_options(&a, streamed.clone()).unwrap();
        assert!(matches!(
            store.set_options(&b, streamed.clone()),
            Err(ManagerError::SecondStreamedBlock)
        ));

        // Once the first payload is gone the slot is free.
        drop(a);
        store.set_options(&b, streamed).unwrap();
    }

    #[test]
    fn discovered_from_read_block() {
        let counter = KeyCounter::new();
        let file = BlockFile::in_memory(Vec::new());
        let blocks = [
            WriteBlock::new(Payload::from(vec![0u8; 64])),
            WriteBlock::new(Payload::from(vec![1u8; 64]))
                .with_compression(Compression::Zlib, CompressionKwargs::new()),
        ];
        write_blocks(&file, &blocks, None, &WriteOptions::default()).unwrap();
        file.seek(0).unwrap();
        let read = read_blocks(&file, &ReadOptions::default(), false).unwrap();
        let read_blocks = Arc::new(ReadBlocks::from_blocks(counter.clone(), read));
        let mut store = OptionsStore::new(counter, read_blocks.clone());

        let data = read_blocks.data(1).unwrap();
        let options = store.get_options(&data).unwrap();
        assert_eq!(options.compression, Compression::Zlib);
        assert_eq!(options.storage_type, StorageType::Internal);

        let compressions = store.output_compressions(CompressionPolicy::Input).unwrap();
        assert_eq!(compressions.into_iter().collect::<Vec<_>>(), vec![Compression::Zlib]);
        let forced = store
            .output_compressions(CompressionPolicy::Codec(Compression::Zstd))
            .unwrap();
        assert!(forced.contains(&Compression::Zstd));
        assert!(forced.contains(&Compression::Zlib));
    }

    #[test]
    fn storage_type_labels() {
        assert_eq!("Streamed".parse::<StorageType>().unwrap(), StorageType::Streamed);
        assert_eq!(StorageType::External.to_string(), "external");
        assert!("inline".parse::<StorageType>().is_err());
    }
}
