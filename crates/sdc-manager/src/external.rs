//! Blocks stored in sibling files.
//!
//! An external block file is a complete document of its own: a one-line
//! text prelude followed by a single block and no index.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sdc_block::{
    read_blocks, seek_to_first_block, write_blocks, BlockData, BlockFile, ReadOptions, WriteBlock,
    WriteOptions,
};
use tracing::debug;

use crate::error::{ManagerError, ManagerResult};

const FILE_SCHEME: &str = "file://";
const EXTERNAL_PRELUDE: &[u8] = b"#SDC external block\n";
const DEFAULT_EXTENSION: &str = "sdc";

fn strip_fragment(uri: &str) -> &str {
    uri.split_once('#').map_or(uri, |(base, _)| base)
}

fn has_scheme(uri: &str) -> bool {
    uri.contains("://")
}

/// Relative URI of external block `index` of the document at `base_uri`:
/// the document's file stem, the index as four digits, and its extension.
pub fn uri_for_index(base_uri: &str, index: usize) -> String {
    let path = strip_fragment(base_uri.strip_prefix(FILE_SCHEME).unwrap_or(base_uri));
    let path = Path::new(path);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
    format!("{stem}{index:04}.{ext}")
}

/// Resolve `uri` against the document at `base_uri`.
///
/// Absolute URIs and paths are returned as is. An empty URI, or a bare
/// fragment, refers to the base document itself.
pub fn resolve_uri(base_uri: Option<&str>, uri: &str) -> String {
    let target = strip_fragment(uri);
    if has_scheme(target) {
        return target.to_string();
    }
    let Some(base) = base_uri.map(strip_fragment) else {
        return target.to_string();
    };
    if target.is_empty() {
        return base.to_string();
    }
    if target.starts_with('/') {
        return match base.strip_prefix(FILE_SCHEME) {
            Some(_) => format!("{FILE_SCHEME}{target}"),
            None => target.to_string(),
        };
    }
    match base.rfind('/') {
        Some(slash) => format!("{}{target}", &base[..=slash]),
        None => target.to_string(),
    }
}

/// Filesystem path for a `file://` URI or a plain path.
pub fn uri_to_path(uri: &str) -> Option<PathBuf> {
    let path = strip_fragment(uri);
    let path = match path.strip_prefix(FILE_SCHEME) {
        Some(rest) => rest,
        None if has_scheme(path) => return None,
        None => path,
    };
    (!path.is_empty()).then(|| PathBuf::from(path))
}

/// What an external reference resolved to.
#[derive(Clone, Debug)]
pub enum ExternalData {
    /// The reference points back at the document itself: use its block 0.
    Internal,
    Data(BlockData),
}

/// Loaded external payloads, so that referencing the same external file
/// twice yields the same payload.
#[derive(Default)]
pub struct ExternalBlockCache {
    cache: HashMap<String, BlockData>,
}

impl ExternalBlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(
        &mut self,
        base_uri: Option<&str>,
        uri: &str,
        opts: &ReadOptions,
    ) -> ManagerResult<ExternalData> {
        let key = strip_fragment(uri).to_string();
        if let Some(data) = self.cache.get(&key) {
            return Ok(ExternalData::Data(data.clone()));
        }
        let resolved = resolve_uri(base_uri, uri);
        if resolved.is_empty() || Some(resolved.as_str()) == base_uri.map(strip_fragment) {
            return Ok(ExternalData::Internal);
        }
        let path =
            uri_to_path(&resolved).ok_or_else(|| ManagerError::ExternalBlockMissing(resolved.clone()))?;
        let data = read_external_file(&path, opts)?;
        debug!(uri = %resolved, len = data.len(), "loaded external block");
        self.cache.insert(key, data.clone());
        Ok(ExternalData::Data(data))
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Write `block` as a standalone single-block document at `path`.
pub fn write_external_file(path: &Path, block: &WriteBlock, io_block_size: usize) -> ManagerResult<()> {
    let file = BlockFile::create(path)?;
    file.write_at(0, EXTERNAL_PRELUDE)?;
    let opts = WriteOptions {
        io_block_size,
        include_index: false,
        ..Default::default()
    };
    write_blocks(&file, std::slice::from_ref(block), None, &opts)?;
    file.flush()?;
    debug!(path = %path.display(), "wrote external block");
    Ok(())
}

/// Read the single block of an external file, fully loaded.
pub fn read_external_file(path: &Path, opts: &ReadOptions) -> ManagerResult<BlockData> {
    if !path.exists() {
        return Err(ManagerError::ExternalBlockMissing(path.display().to_string()));
    }
    let file = BlockFile::open(path)?;
    let opts = ReadOptions {
        memmap: false,
        lazy_load: false,
        ..*opts
    };
    if seek_to_first_block(&file, opts.chunk_size)?.is_none() {
        return Err(ManagerError::ExternalBlockMissing(path.display().to_string()));
    }
    let blocks = read_blocks(&file, &opts, false)?;
    let first = blocks
        .first()
        .ok_or_else(|| ManagerError::ExternalBlockMissing(path.display().to_string()))?;
    Ok(first.data()?)
}
