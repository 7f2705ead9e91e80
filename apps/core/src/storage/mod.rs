//! Storage module - the cached directory index.
//!
//! The index is the only thing external readers touch; it is kept live by the
//! watchers and pruned by the reconciler.

pub mod index;

pub use index::{
    records_to_json, DirectoryRecord, IndexStore, UpdateOutcome, UpsertOutcome, DATE_FORMAT,
};
