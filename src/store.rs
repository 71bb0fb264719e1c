//! The cache store facade.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use http::{request, response, HeaderMap};

use crate::entry::CacheEntry;
use crate::error::Result;

/// An entry found in the store, together with the key it lives under.
#[derive(Debug, Clone)]
pub struct CacheHit {
    /// Store key of the entry.
    pub key: String,
    /// The stored record.
    pub entry: Arc<CacheEntry>,
}

/// Result of a store lookup.
///
/// `root` is the fingerprint-indexed entry, which may be a variant root;
/// `hit` is the entry actually answering this request — equal to `root`
/// when the response does not vary, the selected variant when it does, and
/// `None` when no variant matches.
#[derive(Debug, Clone, Default)]
pub struct CacheLookup {
    /// The fingerprint-indexed entry.
    pub root: Option<CacheHit>,
    /// The entry matching this request, when one exists.
    pub hit: Option<CacheHit>,
}

impl CacheLookup {
    /// A lookup that found nothing.
    #[must_use]
    pub fn miss() -> Self {
        Self::default()
    }
}

/// The fingerprint key of a request: effective method plus effective URI.
#[must_use]
pub fn cache_key(parts: &request::Parts) -> String {
    format!("{}:{}", parts.method, parts.uri)
}

/// The store key of a variant leaf under a root.
#[must_use]
pub fn variant_cache_key(root_key: &str, variant_key: &str) -> String {
    format!("{root_key}#{variant_key}")
}

/// Computes the variant key selecting this request among stored variants:
/// a hash over the request's values of the `Vary`-named fields.
///
/// Returns `None` when the field list contains `*`, which never matches.
#[must_use]
pub fn request_variant_key(
    vary: &[String],
    headers: &HeaderMap,
) -> Option<String> {
    if vary.iter().any(|name| name == "*") {
        return None;
    }
    let mut names: Vec<&str> =
        vary.iter().map(String::as_str).collect();
    names.sort_unstable();
    names.dedup();
    let mut hasher = blake3::Hasher::new();
    for name in names {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        for value in headers.get_all(name) {
            if let Ok(value) = value.to_str() {
                hasher.update(value.trim().as_bytes());
            }
            hasher.update(b",");
        }
        hasher.update(b";");
    }
    Some(hex::encode(hasher.finalize().as_bytes()))
}

/// Pluggable storage backend for cached responses.
///
/// Implementations index entries by the request fingerprint, maintain the
/// two-level root/variant model, and are internally thread-safe: the
/// executor calls them concurrently from foreground and background
/// revalidation paths. Writes follow last-writer-wins; any stronger
/// ordering is the executor's job.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Looks up the entries for a request.
    async fn match_entry(
        &self,
        request: &request::Parts,
    ) -> Result<CacheLookup>;

    /// Stores a response, creating or extending the variant index when the
    /// response varies. Returns the stored leaf.
    async fn store(
        &self,
        request: &request::Parts,
        response: &response::Parts,
        body: Option<Bytes>,
        request_instant: SystemTime,
        response_instant: SystemTime,
    ) -> Result<CacheHit>;

    /// Replaces an entry with its 304-merged successor (rfc7234 4.3.4).
    async fn update(
        &self,
        stale: &CacheHit,
        request: &request::Parts,
        response: &response::Parts,
        request_instant: SystemTime,
        response_instant: SystemTime,
    ) -> Result<CacheHit>;

    /// Refreshes the variant selected by content negotiation and points
    /// the current request's variant key at it.
    async fn store_from_negotiated(
        &self,
        selected: &CacheHit,
        request: &request::Parts,
        response: &response::Parts,
        request_instant: SystemTime,
        response_instant: SystemTime,
    ) -> Result<CacheHit>;

    /// Evicts entries invalidated by this exchange (rfc7234 4.4). Which
    /// statuses invalidate is the store's decision; the executor calls
    /// this for every backend response.
    async fn evict_invalidated(
        &self,
        request: &request::Parts,
        response: &response::Parts,
    ) -> Result<()>;

    /// All variant leaves indexed by a root entry.
    async fn variants(&self, root: &CacheHit) -> Result<Vec<CacheHit>>;
}
