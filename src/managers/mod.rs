//! Bundled [`CacheStore`](crate::CacheStore) backends.

#[cfg(feature = "store-moka")]
pub mod moka;
