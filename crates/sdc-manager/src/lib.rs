//! Block manager for SDC documents.
//!
//! One [`Manager`] owns every block of an open document:
//!
//! - the blocks read from the file ([`ReadBlocks`]) and the objects owning them
//! - per-payload [`Options`]: storage kind, codec, codec parameters
//! - [`DataCallback`]s handed to deserialized objects
//! - while a [`WriteTransaction`] is open, the pending internal, external
//!   and streamed write blocks
//!
//! Writing appends the pending blocks after the text tree. Updating rewrites
//! the block region of an existing file in place, relocating the blocks and
//! redirecting every callback and owner to the new layout.

pub mod callback;
pub mod config;
pub mod error;
pub mod external;
pub mod manager;
pub mod options;

pub use callback::{DataCallback, ReadBlocks};
pub use config::{BlockConfig, CompressionPolicy, ManagerConfig};
pub use error::{ManagerError, ManagerResult};
pub use external::{resolve_uri, uri_for_index, ExternalBlockCache, ExternalData};
pub use manager::{BlockSlot, Manager, UpdateReport, WriteTransaction};
pub use options::{Options, OptionsStore, StorageType};
