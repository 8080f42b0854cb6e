//! Document storage for extracted items.
//!
//! [`DocumentStore`](crate::traits::DocumentStore) is the seam; the engine
//! ships [`MemoryDocumentStore`] as the in-process reference store.

pub mod document;
pub mod engines;

pub use document::{canonical_item_id, fields, Document, InsertOutcome, NaturalKey};
pub use engines::MemoryDocumentStore;
