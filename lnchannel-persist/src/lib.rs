#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Durable storage for payment channel state, built on a
//! key-version-value store.

extern crate alloc;

/// Key-version-value stores and the [`kvv::KVVPersister`] adapter
pub mod kvv;

pub use kvv::file::FileKVVStore;
pub use kvv::memory::MemoryKVVStore;
pub use kvv::{KVVPersister, KVVStore, KVV};
