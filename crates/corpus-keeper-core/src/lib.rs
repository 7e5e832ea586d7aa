//! # Corpus Keeper Core
//!
//! Shared, I/O-free logic for Corpus Keeper: the metadata value model,
//! content hashing, schema normalization, chunking with its validation
//! layer, duplicate detection, mutation planning, validation reports,
//! and the document store abstraction.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or other
//! native-only dependencies. Everything here is a pure function of its
//! inputs except the [`store`] trait, which is the single seam to the
//! external document store.

pub mod chunk;
pub mod dedup;
pub mod error;
pub mod hash;
pub mod models;
pub mod normalize;
pub mod plan;
pub mod schema;
pub mod store;
pub mod validate;

pub use error::{ConfigError, SchemaViolation, StoreError};
pub use hash::ContentHash;
pub use models::{Chunk, Document, Metadata, MetadataValue};
