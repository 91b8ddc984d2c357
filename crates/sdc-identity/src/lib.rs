//! Weak identity tracking for the SDC block layer.
//!
//! Blocks are associated with in-memory objects by *identity*, not by value:
//! two equal arrays are still two payloads, and a payload that is dropped must
//! stop matching anything. This crate provides the primitives for that:
//!
//! - [`Identity`] -- anything that can report a stable address and hand out a
//!   weak [`Referent`] (implemented for every `Arc<T>`)
//! - [`Key`] -- a counter-labelled handle onto a weakly held referent
//! - [`KeyCounter`] -- the session-owned counter keys are allocated from
//! - [`Store`] -- identity-keyed association map tolerant of dead referents
//! - [`LinearStore`] -- an ordered sequence that is also addressable by identity
//!
//! # Design Rules
//!
//! 1. Nothing in this crate extends the lifetime of a referent.
//! 2. A key whose referent is gone (or was never assigned) equals nothing,
//!    not even a copy of itself.
//! 3. Dead entries are skipped during lookup and iteration and purged lazily
//!    on assignment; there is no background sweeping.

pub mod error;
pub mod key;
pub mod store;

pub use error::{IdentityError, IdentityResult};
pub use key::{AnyObject, Identity, Key, KeyCounter, Referent};
pub use store::{LinearStore, ObjectRef, Store};
