//! Persistent address cache.

pub mod store;

pub use store::{AddressCache, CacheLookup, CacheSummary, PutOutcome};
