use std::fmt;
use std::path::Path;
use std::str::FromStr;

use sdc_block::{Compression, Padding, ReadOptions, WriteOptions};
use serde::{Deserialize, Serialize};

use crate::error::{ManagerError, ManagerResult};
use crate::options::StorageType;

/// Which codec blocks are written with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CompressionPolicy {
    /// Keep whatever each payload's options say; payloads read from a file
    /// keep the codec they were read with.
    #[default]
    Input,
    /// Write every internal block with this codec.
    Codec(Compression),
}

impl fmt::Display for CompressionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Codec(c) => write!(f, "{c}"),
        }
    }
}

impl FromStr for CompressionPolicy {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("input") {
            return Ok(Self::Input);
        }
        s.parse::<Compression>()
            .map(Self::Codec)
            .map_err(|e| ManagerError::Config(e.to_string()))
    }
}

impl TryFrom<String> for CompressionPolicy {
    type Error = ManagerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CompressionPolicy> for String {
    fn from(policy: CompressionPolicy) -> Self {
        policy.to_string()
    }
}

/// Block handling settings for one document session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockConfig {
    pub lazy_load: bool,
    pub memmap: bool,
    pub validate_checksums: bool,
    /// Chunk size for relocation copies and padding granularity.
    pub io_block_size: usize,
    pub compression: CompressionPolicy,
    /// Force a storage kind for every payload claimed during serialization.
    pub storage_override: Option<StorageType>,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            lazy_load: true,
            memmap: true,
            validate_checksums: false,
            io_block_size: 4096,
            compression: CompressionPolicy::Input,
            storage_override: None,
        }
    }
}

impl BlockConfig {
    pub fn from_toml_str(s: &str) -> ManagerResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| ManagerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> ManagerResult<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> ManagerResult<()> {
        if self.io_block_size == 0 {
            return Err(ManagerError::Config("io_block_size must be positive".into()));
        }
        Ok(())
    }

    pub fn read_options(&self) -> ReadOptions {
        ReadOptions {
            memmap: self.memmap,
            lazy_load: self.lazy_load,
            validate_checksums: self.validate_checksums,
            chunk_size: self.io_block_size,
        }
    }

    pub fn write_options(&self, padding: Padding, include_index: bool) -> WriteOptions {
        WriteOptions {
            padding,
            io_block_size: self.io_block_size,
            include_index,
        }
    }
}

/// Configuration of a [`Manager`](crate::Manager).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    #[serde(flatten)]
    pub blocks: BlockConfig,
    /// URI of the document; needed to place external blocks.
    pub uri: Option<String>,
}

impl ManagerConfig {
    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }
}

impl From<BlockConfig> for ManagerConfig {
    fn from(blocks: BlockConfig) -> Self {
        Self { blocks, uri: None }
    }
}
