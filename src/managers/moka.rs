//! In-memory [`CacheStore`] backed by
//! [`moka`](https://github.com/moka-rs/moka).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use http::{request, response, Method, Uri};
use moka::future::Cache;

use crate::entry::{CacheEntry, EntryPayload};
use crate::error::{HttpCacheError, Result};
use crate::store::{
    cache_key, request_variant_key, variant_cache_key, CacheHit,
    CacheLookup, CacheStore,
};

/// Implements [`CacheStore`] with `moka::future::Cache` as the backend.
///
/// Capacity eviction is delegated to moka; the executor never observes
/// entry destruction directly.
#[derive(Clone)]
pub struct MokaStore {
    cache: Cache<String, Arc<CacheEntry>>,
}

impl std::fmt::Debug for MokaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MokaStore").finish_non_exhaustive()
    }
}

impl MokaStore {
    /// Creates a store bounded to `max_capacity` entries.
    #[must_use]
    pub fn new(max_capacity: u64) -> Self {
        Self { cache: Cache::new(max_capacity) }
    }

    /// Clears out the entire cache.
    pub async fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }

    async fn insert(&self, key: String, entry: Arc<CacheEntry>) {
        self.cache.insert(key, entry).await;
        self.cache.run_pending_tasks().await;
    }

    async fn invalidate_target(&self, uri: &Uri) {
        for method in [Method::GET, Method::HEAD] {
            self.cache.invalidate(&format!("{method}:{uri}")).await;
        }
        self.cache.run_pending_tasks().await;
    }
}

#[async_trait]
impl CacheStore for MokaStore {
    async fn match_entry(
        &self,
        request: &request::Parts,
    ) -> Result<CacheLookup> {
        let key = cache_key(request);
        let entry = match self.cache.get(&key).await {
            Some(entry) => entry,
            None => return Ok(CacheLookup::miss()),
        };
        let root = CacheHit { key, entry };
        let hit = match root.entry.variants() {
            None => Some(root.clone()),
            Some(variant_map) => {
                let leaf_key = request_variant_key(
                    &root.entry.vary(),
                    &request.headers,
                )
                .and_then(|vk| variant_map.get(&vk).cloned());
                match leaf_key {
                    Some(leaf_key) => {
                        self.cache.get(&leaf_key).await.map(|entry| {
                            CacheHit { key: leaf_key, entry }
                        })
                    }
                    None => None,
                }
            }
        };
        Ok(CacheLookup { root: Some(root), hit })
    }

    async fn store(
        &self,
        request: &request::Parts,
        response: &response::Parts,
        body: Option<Bytes>,
        request_instant: SystemTime,
        response_instant: SystemTime,
    ) -> Result<CacheHit> {
        let key = cache_key(request);
        let entry = CacheEntry::from_response(
            request.method.as_str(),
            response,
            body.map(|b| b.to_vec()),
            request_instant,
            response_instant,
        )?;
        let vary = entry.vary();
        if vary.is_empty() {
            let entry = Arc::new(entry);
            self.insert(key.clone(), entry.clone()).await;
            return Ok(CacheHit { key, entry });
        }

        let variant_key = request_variant_key(&vary, &request.headers)
            .ok_or_else(|| {
                HttpCacheError::store("Vary: * response is not storable")
            })?;
        let leaf_key = variant_cache_key(&key, &variant_key);
        let mut leaf = entry;
        leaf.variant_key = Some(variant_key.clone());
        let leaf = Arc::new(leaf);
        self.insert(leaf_key.clone(), leaf.clone()).await;

        // Refresh the root index. An older non-variant entry under the
        // fingerprint key is replaced by the new root.
        let mut variant_map = match self
            .cache
            .get(&key)
            .await
            .as_deref()
            .and_then(CacheEntry::variants)
        {
            Some(existing) => existing.clone(),
            None => HashMap::new(),
        };
        variant_map.insert(variant_key, leaf_key.clone());
        let mut root = (*leaf).clone();
        root.payload = EntryPayload::Variants(variant_map);
        root.variant_key = None;
        self.insert(key, Arc::new(root)).await;

        Ok(CacheHit { key: leaf_key, entry: leaf })
    }

    async fn update(
        &self,
        stale: &CacheHit,
        _request: &request::Parts,
        response: &response::Parts,
        request_instant: SystemTime,
        response_instant: SystemTime,
    ) -> Result<CacheHit> {
        let merged = Arc::new(stale.entry.with_not_modified(
            response,
            request_instant,
            response_instant,
        ));
        self.insert(stale.key.clone(), merged.clone()).await;
        Ok(CacheHit { key: stale.key.clone(), entry: merged })
    }

    async fn store_from_negotiated(
        &self,
        selected: &CacheHit,
        request: &request::Parts,
        response: &response::Parts,
        request_instant: SystemTime,
        response_instant: SystemTime,
    ) -> Result<CacheHit> {
        let merged = selected.entry.with_not_modified(
            response,
            request_instant,
            response_instant,
        );
        let refreshed = Arc::new(merged.clone());
        self.insert(selected.key.clone(), refreshed.clone()).await;

        // Alias the current request's variant key to the chosen response,
        // so the next lookup resolves it directly.
        let root_key = cache_key(request);
        let variant_key =
            request_variant_key(&merged.vary(), &request.headers);
        let (hit_key, hit_entry) = match variant_key {
            Some(variant_key) => {
                let alias_key = variant_cache_key(&root_key, &variant_key);
                let mut alias = merged;
                alias.variant_key = Some(variant_key.clone());
                let alias = Arc::new(alias);
                if alias_key != selected.key {
                    self.insert(alias_key.clone(), alias.clone()).await;
                }
                if let Some(root) = self.cache.get(&root_key).await {
                    if let Some(existing) = root.variants() {
                        let mut variant_map = existing.clone();
                        variant_map
                            .insert(variant_key, alias_key.clone());
                        let mut updated = (*root).clone();
                        updated.payload =
                            EntryPayload::Variants(variant_map);
                        self.insert(root_key, Arc::new(updated)).await;
                    }
                }
                (alias_key, alias)
            }
            None => (selected.key.clone(), refreshed),
        };
        Ok(CacheHit { key: hit_key, entry: hit_entry })
    }

    async fn evict_invalidated(
        &self,
        request: &request::Parts,
        response: &response::Parts,
    ) -> Result<()> {
        let method = &request.method;
        let safe = *method == Method::GET
            || *method == Method::HEAD
            || *method == Method::OPTIONS
            || *method == Method::TRACE;
        if safe {
            return Ok(());
        }
        self.invalidate_target(&request.uri).await;
        // Location targets only invalidate on non-error responses, and
        // only within the request's own authority (rfc7234 4.4).
        if response.status.as_u16() < 400 {
            for header in ["location", "content-location"] {
                let target = response
                    .headers
                    .get(header)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| resolve_target(&request.uri, v));
                if let Some(uri) = target {
                    self.invalidate_target(&uri).await;
                }
            }
        }
        Ok(())
    }

    async fn variants(&self, root: &CacheHit) -> Result<Vec<CacheHit>> {
        let mut out = Vec::new();
        if let Some(variant_map) = root.entry.variants() {
            for leaf_key in variant_map.values() {
                if let Some(entry) = self.cache.get(leaf_key).await {
                    out.push(CacheHit { key: leaf_key.clone(), entry });
                }
            }
        }
        Ok(out)
    }
}

fn resolve_target(base: &Uri, target: &str) -> Option<Uri> {
    let uri: Uri = target.trim().parse().ok()?;
    if uri.authority().is_some() {
        // cross-origin targets are never invalidated
        return (uri.authority() == base.authority()).then_some(uri);
    }
    let mut parts = http::uri::Parts::default();
    parts.scheme = base.scheme().cloned();
    parts.authority = base.authority().cloned();
    parts.path_and_query = uri.path_and_query().cloned();
    Uri::from_parts(parts).ok()
}
