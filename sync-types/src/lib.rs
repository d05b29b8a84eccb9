//! # sync-types
//!
//! Content model and persisted payload format for storesync.
//!
//! This crate provides the foundational types used across all storesync crates:
//! - [`Content`], [`Changes`] - Plain store content and transaction change-sets
//! - [`MergeableContent`], [`MergeableChanges`] - The same, carrying merge stamps
//! - [`Persisted`] - What a medium holds: full content or a change-set
//! - [`Codec`], [`JsonCodec`] - Reversible text encoding with an undefined sentinel
//! - [`CodecError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod codec;
mod content;
mod error;

pub use codec::{Codec, JsonCodec, CHANGES_TAG, UNDEFINED};
pub use content::{
    Changes, Content, MergeableCells, MergeableChanges, MergeableContent,
    MergeableRows, MergeableTables, MergeableValues, Persisted, Row, RowChanges, Stamped,
    StoreChanges, StoreContent, Table, TableChanges, Tables, TablesChanges, Values,
    ValuesChanges,
};
pub use error::CodecError;
