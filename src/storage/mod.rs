//! Storage backends for the exchange.
//!
//! [`Store`] is the abstract contract; [`InMemoryStore`] is the embedded
//! backend and, with the `persistent` feature, [`persistent::PersistentStore`]
//! adds a write-ahead log underneath it.

mod memory;
mod traits;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::{InMemoryStore, DEFAULT_LOCK_TIMEOUT};
pub use traits::{ItemScan, Mutation, StorageError, Store, Transaction};
