#![forbid(unsafe_code, future_incompatible)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    nonstandard_style,
    unused_qualifications,
    unused_import_braces,
    unused_extern_crates,
    trivial_casts,
    trivial_numeric_casts
)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! An HTTP/1.1 response cache executor for client middleware.
//!
//! The executor sits between an HTTP client and the origin server and
//! applies the caching rules of RFC 7234 together with the
//! conditional-request machinery of RFC 7232: it transparently satisfies
//! requests from a pluggable store when semantics permit, revalidates
//! stale entries (synchronously, or in the background for
//! `stale-while-revalidate`), negotiates among stored `Vary` variants,
//! falls back to stale entries on origin errors when `stale-if-error`
//! applies, and opportunistically stores cacheable responses on the way
//! back.
//!
//! The actual transport is abstracted behind the [`Chain`] trait and the
//! storage behind the [`CacheStore`] trait. An in-memory store backed by
//! [`moka`](https://github.com/moka-rs/moka) ships behind the default
//! `store-moka` feature.
//!
//! ## Basic usage
//!
//! ```rust
//! # #[cfg(feature = "store-moka")]
//! # fn main() {
//! use std::sync::Arc;
//! use http_cache_exec::{CacheConfig, CachingExecutor, MokaStore};
//!
//! let store = Arc::new(MokaStore::new(10_000));
//! let cache = CachingExecutor::new(store, CacheConfig::default());
//! # let _ = cache;
//! # }
//! # #[cfg(not(feature = "store-moka"))]
//! # fn main() {}
//! ```
//!
//! Requests are driven through [`CachingExecutor::execute`] with a
//! downstream [`Chain`] that performs the actual exchange. The executor
//! records the disposition of every exchange — hit, miss, validated,
//! synthesized, failed — in the [`ExchangeScope`] attribute bag and in its
//! per-instance [`CacheStats`] counters.
//!
//! ## Background revalidation
//!
//! ```rust
//! # #[cfg(feature = "store-moka")]
//! # fn demo(handle: tokio::runtime::Handle) {
//! use std::sync::Arc;
//! use http_cache_exec::{
//!     AsyncRevalidator, CacheConfig, CachingExecutor, MokaStore,
//! };
//!
//! let store = Arc::new(MokaStore::new(10_000));
//! let cache = CachingExecutor::new(store, CacheConfig::default())
//!     .with_revalidator(AsyncRevalidator::new(handle));
//! # let _ = cache;
//! # }
//! ```
//!
//! Without a revalidator, entries inside their `stale-while-revalidate`
//! window are revalidated synchronously instead.

mod body;
mod clock;
mod conditional;
mod directives;
mod entry;
mod error;
mod exec;
mod freshness;
mod generate;
mod managers;
mod policy;
mod revalidator;
mod store;
mod suitability;

use std::time::Duration;

pub use body::{BoxBody, CacheBody, RequestBody};
pub use clock::{Clock, SystemClock};
pub use conditional::{
    build_conditional_request, build_conditional_request_from_variants,
    build_unconditional_request,
};
pub use directives::{
    MaxStale, NoCache, RequestCacheControl, ResponseCacheControl,
};
pub use entry::{CacheEntry, EntryPayload, HttpHeaders, HttpVersion};
pub use error::{BoxError, HttpCacheError, Result};
pub use exec::{
    CacheResponseStatus, CacheStats, Chain, CachingExecutor, ContextBag,
    ExchangeScope,
};
pub use freshness::ValidityPolicy;
pub use generate::ResponseGenerator;
pub use policy::{RequestCachePolicy, ResponseCachePolicy};
pub use revalidator::{
    AsyncRevalidator, ExponentialBackoffStrategy,
    ImmediateSchedulingStrategy, SchedulingStrategy,
};
pub use store::{
    cache_key, request_variant_key, variant_cache_key, CacheHit,
    CacheLookup, CacheStore,
};
pub use suitability::{Suitability, SuitabilityChecker};

#[cfg(feature = "store-moka")]
#[cfg_attr(docsrs, doc(cfg(feature = "store-moka")))]
pub use managers::moka::MokaStore;

/// Configuration of the cache executor.
///
/// Only knobs that affect decisions live here; transport and storage
/// tuning belong to the [`Chain`] and [`CacheStore`] implementations.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Evaluate responses from the perspective of a shared cache:
    /// `s-maxage` and `proxy-revalidate` are honored, `private` responses
    /// and authenticated exchanges are not cached.
    pub shared: bool,
    /// Upper bound in bytes on a cached body. Larger responses pass
    /// through unstored.
    pub max_object_size: u64,
    /// Compute a heuristic freshness lifetime for responses without
    /// explicit expiration.
    pub heuristic_caching_enabled: bool,
    /// Fraction of `Date - Last-Modified` used as the heuristic lifetime.
    pub heuristic_coefficient: f32,
    /// Upper bound on the heuristic freshness lifetime.
    pub heuristic_default_lifetime: Duration,
    /// Never store HTTP/1.0 responses to requests with a query string.
    pub never_cache_http10_responses_with_query: bool,
    /// Never store HTTP/1.1 responses to requests with a query string.
    pub never_cache_http11_responses_with_query: bool,
    /// Re-read the current entry immediately before a write-back and skip
    /// the write when the stored entry carries a later `Date`.
    pub freshness_check_enabled: bool,
    /// Allow serving stale entries when the origin fails or returns a
    /// 5xx, within the `stale-if-error` window.
    pub stale_if_error_enabled: bool,
    /// `stale-if-error` window used when neither request nor response
    /// named one.
    pub stale_if_error_default: Duration,
    /// Honor the `stale-while-revalidate` response directive.
    pub stale_while_revalidate_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shared: true,
            max_object_size: 8 * 1024 * 1024,
            heuristic_caching_enabled: false,
            heuristic_coefficient: 0.1,
            heuristic_default_lifetime: Duration::from_secs(24 * 3600),
            never_cache_http10_responses_with_query: true,
            never_cache_http11_responses_with_query: false,
            freshness_check_enabled: false,
            stale_if_error_enabled: false,
            stale_if_error_default: Duration::from_secs(60),
            stale_while_revalidate_enabled: true,
        }
    }
}

#[cfg(all(test, feature = "store-moka"))]
mod test;
