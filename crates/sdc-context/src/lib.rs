//! Serialization contexts for SDC converters.
//!
//! Converters turn objects into tree nodes and back. Whenever one needs a
//! block it asks the step context it was handed: a [`Serialization`] claims
//! blocks for payloads being written, a [`Deserialization`] hands out
//! deferred [`DataCallback`](sdc_manager::DataCallback)s for blocks being
//! read. Once the converter returns, the step assigns what was accessed to
//! the object so the manager can track it across updates.

pub mod context;
pub mod converter;
pub mod error;

pub use context::{
    ContextState, Deserialization, Serialization, SerializationContext, DEFAULT_VERSION,
    SUPPORTED_VERSIONS,
};
pub use converter::{Converter, ConverterRegistry};
pub use error::{ContextError, ContextResult};
