//! Durable, file-backed object store mapping 64-bit ids to opaque byte blobs: a
//! checksummed, hole-reusing blob file, a persistent B+Tree index, a ternary
//! search tree free-space map, a write-back node cache, and mark/sweep garbage
//! collection, all behind the [`Store`] façade.

pub mod blob;
pub mod btree;
pub mod cache;
pub mod config;
pub mod equi;
pub mod error;
pub mod freespace;
pub mod lockfile;
pub mod markset;
pub mod progress;
pub mod store;

pub use blob::CheckReport;
pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use store::Store;
