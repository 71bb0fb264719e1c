//! The cache decision engine.
//!
//! [`CachingExecutor::execute`] sits between a client and the downstream
//! chain: it answers from the store when semantics permit, revalidates
//! stale entries synchronously or in the background, negotiates among
//! stored variants, and stores cacheable origin responses on the way back.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use http::header::{
    CONTENT_LENGTH, ETAG, IF_MODIFIED_SINCE, LAST_MODIFIED, MAX_FORWARDS,
};
use http::{request, response, Method, Request, Response, StatusCode};
use log::{debug, warn};

use crate::body::{
    drain_discard, drain_limited, CacheBody, Drained, RequestBody,
};
use crate::clock::{Clock, SystemClock};
use crate::conditional::{
    build_conditional_request, build_conditional_request_from_variants,
    build_unconditional_request, is_conditional,
};
use crate::directives::{RequestCacheControl, ResponseCacheControl};
use crate::entry::CacheEntry;
use crate::error::{HttpCacheError, Result};
use crate::generate::ResponseGenerator;
use crate::policy::{RequestCachePolicy, ResponseCachePolicy};
use crate::revalidator::AsyncRevalidator;
use crate::store::{CacheHit, CacheLookup, CacheStore};
use crate::suitability::{Suitability, SuitabilityChecker};
use crate::CacheConfig;

/// How the cache disposed of a request, published into the exchange
/// context after execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheResponseStatus {
    /// Nothing suitable was stored; the origin answered.
    CacheMiss,
    /// A stored response answered without contacting the origin.
    CacheHit,
    /// A stored response answered after a successful revalidation.
    Validated,
    /// The cache itself synthesized the response (504s, stale fallbacks,
    /// stale-while-revalidate serves, intercepts).
    CacheModuleResponse,
    /// A failure occurred while handling the exchange.
    Failure,
}

impl fmt::Display for CacheResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::CacheMiss => write!(f, "cache_miss"),
            Self::CacheHit => write!(f, "cache_hit"),
            Self::Validated => write!(f, "validated"),
            Self::CacheModuleResponse => write!(f, "cache_module_response"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

/// Typed per-exchange side channel the executor publishes into.
#[derive(Debug, Clone, Default)]
pub struct ContextBag {
    cache_status: Option<CacheResponseStatus>,
    request: Option<request::Parts>,
    response: Option<response::Parts>,
}

impl ContextBag {
    /// The cache disposition of the exchange, once decided.
    #[must_use]
    pub fn cache_status(&self) -> Option<CacheResponseStatus> {
        self.cache_status
    }

    /// The request as the executor received it.
    #[must_use]
    pub fn request(&self) -> Option<&request::Parts> {
        self.request.as_ref()
    }

    /// The response the client received.
    #[must_use]
    pub fn response(&self) -> Option<&response::Parts> {
        self.response.as_ref()
    }

    pub(crate) fn set_cache_status(&mut self, status: CacheResponseStatus) {
        self.cache_status = Some(status);
    }

    fn set_request(&mut self, parts: request::Parts) {
        self.request = Some(parts);
    }

    fn set_response(&mut self, parts: response::Parts) {
        self.response = Some(parts);
    }
}

static EXCHANGE_IDS: AtomicU64 = AtomicU64::new(1);

/// Per-exchange context handed through the chain.
#[derive(Debug, Default)]
pub struct ExchangeScope {
    /// Correlator for this request/response round-trip.
    pub exchange_id: u64,
    /// Route this exchange was dispatched on, when known.
    pub route: Option<String>,
    /// Typed attribute side channel.
    pub attributes: ContextBag,
}

impl ExchangeScope {
    /// Creates a scope with a fresh exchange id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            exchange_id: EXCHANGE_IDS.fetch_add(1, Ordering::Relaxed),
            route: None,
            attributes: ContextBag::default(),
        }
    }

    /// Creates a scope bound to a route.
    #[must_use]
    pub fn with_route(route: impl Into<String>) -> Self {
        Self { route: Some(route.into()), ..Self::new() }
    }

    /// Forks the scope for background work: same route, fresh exchange id,
    /// empty attribute bag.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self {
            exchange_id: EXCHANGE_IDS.fetch_add(1, Ordering::Relaxed),
            route: self.route.clone(),
            attributes: ContextBag::default(),
        }
    }
}

/// The downstream transport chain the executor forwards to.
#[async_trait]
pub trait Chain: Send + Sync {
    /// Performs the exchange against the origin.
    ///
    /// The caller owns the returned body and is responsible for consuming
    /// or dropping it.
    async fn proceed(
        &self,
        request: Request<RequestBody>,
        scope: &mut ExchangeScope,
    ) -> Result<Response<CacheBody>>;
}

/// Cache activity counters, bound to one executor instance.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    updates: AtomicU64,
}

impl CacheStats {
    /// Requests answered from the store without contacting the origin.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Requests that went to the origin.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Entries refreshed by revalidation or negotiation.
    #[must_use]
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }
}

/// The response cache executor.
///
/// Holds no mutable state besides the statistics counters; a single
/// instance may serve any number of concurrent exchanges.
#[derive(Debug)]
pub struct CachingExecutor<S> {
    config: CacheConfig,
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    revalidator: Option<AsyncRevalidator>,
    stats: CacheStats,
    request_policy: RequestCachePolicy,
    response_policy: ResponseCachePolicy,
    suitability: SuitabilityChecker,
    generator: ResponseGenerator,
}

impl<S: CacheStore> CachingExecutor<S> {
    /// Creates an executor over the given store using the system clock.
    #[must_use]
    pub fn new(store: Arc<S>, config: CacheConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Creates an executor with a custom clock.
    #[must_use]
    pub fn with_clock(
        store: Arc<S>,
        config: CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            clock,
            revalidator: None,
            stats: CacheStats::default(),
            request_policy: RequestCachePolicy::new(&config),
            response_policy: ResponseCachePolicy::new(&config),
            suitability: SuitabilityChecker::new(&config),
            generator: ResponseGenerator::new(&config),
            config,
        }
    }

    /// Enables background revalidation of stale-while-revalidate entries.
    #[must_use]
    pub fn with_revalidator(mut self, revalidator: AsyncRevalidator) -> Self {
        self.revalidator = Some(revalidator);
        self
    }

    /// The executor's activity counters.
    #[must_use]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Executes a request through the cache and the downstream chain.
    ///
    /// Publishes the request, the final response, and the
    /// [`CacheResponseStatus`] into `scope.attributes`.
    pub async fn execute(
        &self,
        request: Request<RequestBody>,
        scope: &mut ExchangeScope,
        chain: &Arc<dyn Chain>,
    ) -> Result<Response<CacheBody>> {
        let (parts, body) = request.into_parts();
        scope.attributes.set_request(parts.clone());
        match self.execute_inner(parts, body, scope, chain).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                scope.attributes.set_response(parts.clone());
                Ok(Response::from_parts(parts, body))
            }
            Err(err) => {
                scope
                    .attributes
                    .set_cache_status(CacheResponseStatus::Failure);
                Err(err)
            }
        }
    }

    async fn execute_inner(
        &self,
        parts: request::Parts,
        body: RequestBody,
        scope: &mut ExchangeScope,
        chain: &Arc<dyn Chain>,
    ) -> Result<Response<CacheBody>> {
        if parts.method == Method::OPTIONS
            && parts.uri.path() == "*"
            && parts
                .headers
                .get(MAX_FORWARDS)
                .and_then(|v| v.to_str().ok())
                == Some("0")
        {
            scope.attributes.set_cache_status(
                CacheResponseStatus::CacheModuleResponse,
            );
            return Ok(Response::builder()
                .status(StatusCode::NOT_IMPLEMENTED)
                .body(CacheBody::empty())?);
        }

        let request_cc = RequestCacheControl::parse(&parts.headers);
        if !self.request_policy.is_servable(&parts, &request_cc) {
            return self
                .call_backend(
                    parts,
                    body,
                    &request_cc,
                    scope,
                    chain,
                    false,
                    CacheResponseStatus::CacheMiss,
                )
                .await;
        }

        let lookup = match self.store.match_entry(&parts).await {
            Ok(lookup) => lookup,
            Err(err) => {
                warn!("cache lookup failed, treating as miss: {err}");
                CacheLookup::miss()
            }
        };
        match lookup.hit {
            Some(hit) => {
                self.handle_cache_hit(
                    parts,
                    body,
                    &request_cc,
                    hit,
                    scope,
                    chain,
                )
                .await
            }
            None => {
                self.handle_cache_miss(
                    parts,
                    body,
                    &request_cc,
                    lookup.root,
                    scope,
                    chain,
                )
                .await
            }
        }
    }

    async fn handle_cache_miss(
        &self,
        parts: request::Parts,
        body: RequestBody,
        request_cc: &RequestCacheControl,
        root: Option<CacheHit>,
        scope: &mut ExchangeScope,
        chain: &Arc<dyn Chain>,
    ) -> Result<Response<CacheBody>> {
        if request_cc.only_if_cached {
            scope.attributes.set_cache_status(
                CacheResponseStatus::CacheModuleResponse,
            );
            return gateway_timeout();
        }
        if let Some(root) = root {
            if root.entry.is_variant_root() && body.is_empty() {
                return self
                    .negotiate(parts, body, request_cc, root, scope, chain)
                    .await;
            }
        }
        self.call_backend(
            parts,
            body,
            request_cc,
            scope,
            chain,
            true,
            CacheResponseStatus::CacheMiss,
        )
        .await
    }

    async fn handle_cache_hit(
        &self,
        parts: request::Parts,
        body: RequestBody,
        request_cc: &RequestCacheControl,
        hit: CacheHit,
        scope: &mut ExchangeScope,
        chain: &Arc<dyn Chain>,
    ) -> Result<Response<CacheBody>> {
        let now = self.clock.now();
        let entry_cc = ResponseCacheControl::parse_values(
            hit.entry.headers.get_all("cache-control"),
        );
        let suitability = self.suitability.classify(
            &parts,
            request_cc,
            &hit.entry,
            &entry_cc,
            now,
        );

        // A body-less entry (a stored bare 304) can only answer a request
        // whose validators it satisfies; anything else needs the full
        // representation from the origin.
        if hit.entry.body().is_none()
            && !(is_conditional(&parts)
                && self.suitability.all_conditionals_match(
                    &parts, &hit.entry, now,
                ))
        {
            if request_cc.only_if_cached {
                scope.attributes.set_cache_status(
                    CacheResponseStatus::CacheModuleResponse,
                );
                return gateway_timeout();
            }
            return self
                .call_backend(
                    parts,
                    body,
                    request_cc,
                    scope,
                    chain,
                    true,
                    CacheResponseStatus::CacheMiss,
                )
                .await;
        }

        if matches!(
            suitability,
            Suitability::Fresh | Suitability::FreshEnough
        ) {
            return match self.serve_entry(&parts, &hit.entry, now) {
                Ok(response) => {
                    self.stats.record_hit();
                    scope
                        .attributes
                        .set_cache_status(CacheResponseStatus::CacheHit);
                    Ok(response)
                }
                Err(err) if request_cc.only_if_cached => {
                    warn!("cached entry unusable: {err}");
                    scope.attributes.set_cache_status(
                        CacheResponseStatus::CacheModuleResponse,
                    );
                    gateway_timeout()
                }
                Err(err) => {
                    warn!("cached entry unusable, going to origin: {err}");
                    self.call_backend(
                        parts,
                        body,
                        request_cc,
                        scope,
                        chain,
                        true,
                        CacheResponseStatus::Failure,
                    )
                    .await
                }
            };
        }

        // Nothing below answers without contacting the origin.
        if request_cc.only_if_cached {
            scope.attributes.set_cache_status(
                CacheResponseStatus::CacheModuleResponse,
            );
            return gateway_timeout();
        }
        if suitability == Suitability::Mismatch || !body.is_repeatable() {
            return self
                .call_backend(
                    parts,
                    body,
                    request_cc,
                    scope,
                    chain,
                    true,
                    CacheResponseStatus::CacheMiss,
                )
                .await;
        }

        match suitability {
            Suitability::RevalidationRequired => {
                self.revalidate_sync(
                    parts, body, request_cc, &entry_cc, hit, scope, chain,
                    false,
                )
                .await
            }
            Suitability::StaleWhileRevalidated
                if self.revalidator.is_some() =>
            {
                match self.serve_entry(&parts, &hit.entry, now) {
                    Ok(response) => {
                        self.spawn_background_revalidation(
                            &parts, &hit, scope, chain,
                        );
                        scope.attributes.set_cache_status(
                            CacheResponseStatus::CacheModuleResponse,
                        );
                        Ok(response)
                    }
                    Err(err) => {
                        warn!(
                            "cached entry unusable, going to origin: {err}"
                        );
                        self.call_backend(
                            parts,
                            body,
                            request_cc,
                            scope,
                            chain,
                            true,
                            CacheResponseStatus::Failure,
                        )
                        .await
                    }
                }
            }
            Suitability::StaleWhileRevalidated | Suitability::Stale => {
                self.revalidate_sync(
                    parts, body, request_cc, &entry_cc, hit, scope, chain,
                    true,
                )
                .await
            }
            _ => {
                self.call_backend(
                    parts,
                    body,
                    request_cc,
                    scope,
                    chain,
                    true,
                    CacheResponseStatus::CacheMiss,
                )
                .await
            }
        }
    }

    /// Variant negotiation (rfc7232 conditional machinery over the stored
    /// variant set).
    async fn negotiate(
        &self,
        parts: request::Parts,
        body: RequestBody,
        request_cc: &RequestCacheControl,
        root: CacheHit,
        scope: &mut ExchangeScope,
        chain: &Arc<dyn Chain>,
    ) -> Result<Response<CacheBody>> {
        let variants = match self.store.variants(&root).await {
            Ok(variants) => variants,
            Err(err) => {
                warn!("variant collection failed: {err}");
                Vec::new()
            }
        };
        let mut by_etag: HashMap<String, CacheHit> = HashMap::new();
        for variant in variants {
            if let Some(etag) = variant.entry.etag() {
                by_etag.insert(etag.to_string(), variant);
            }
        }
        if by_etag.is_empty() {
            return self
                .call_backend(
                    parts,
                    body,
                    request_cc,
                    scope,
                    chain,
                    true,
                    CacheResponseStatus::CacheMiss,
                )
                .await;
        }
        let mut etags: Vec<String> = by_etag.keys().cloned().collect();
        etags.sort_unstable();

        let negotiation =
            build_conditional_request_from_variants(&parts, &etags)?;
        let t0 = self.clock.now();
        let response = chain
            .proceed(
                Request::from_parts(negotiation, RequestBody::Empty),
                scope,
            )
            .await?;
        let t1 = self.clock.now();

        if response.status() != StatusCode::NOT_MODIFIED {
            // none of the stored variants answered; this was a miss
            self.stats.record_miss();
            scope
                .attributes
                .set_cache_status(CacheResponseStatus::CacheMiss);
            return self
                .handle_backend_response(
                    &parts, request_cc, response, t0, t1, scope, true,
                    false,
                )
                .await;
        }

        let (response_parts, response_body) = response.into_parts();
        drain_discard(response_body).await;
        let selected = response_parts
            .headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .and_then(|etag| by_etag.get(etag));
        let selected = match selected {
            Some(selected) => selected,
            None => {
                warn!(
                    "variant negotiation returned 304 without a known etag"
                );
                return self
                    .call_backend_unconditional(
                        parts, body, request_cc, scope, chain,
                    )
                    .await;
            }
        };
        if selected.entry.is_newer_than(&response_parts.headers) {
            // the 304 came from a replica older than the stored variant
            return self
                .call_backend_unconditional(
                    parts, body, request_cc, scope, chain,
                )
                .await;
        }

        let entry = match self
            .store
            .store_from_negotiated(
                selected,
                &parts,
                &response_parts,
                t0,
                t1,
            )
            .await
        {
            Ok(stored) => stored.entry,
            Err(err) => {
                warn!("negotiated store failed: {err}");
                Arc::new(selected.entry.with_not_modified(
                    &response_parts,
                    t0,
                    t1,
                ))
            }
        };
        self.stats.record_update();
        scope
            .attributes
            .set_cache_status(CacheResponseStatus::Validated);
        self.serve_entry(&parts, &entry, t1)
    }

    /// Synchronous revalidation, optionally wrapped with the
    /// `stale-if-error` fallback.
    #[allow(clippy::too_many_arguments)]
    async fn revalidate_sync(
        &self,
        parts: request::Parts,
        body: RequestBody,
        request_cc: &RequestCacheControl,
        entry_cc: &ResponseCacheControl,
        hit: CacheHit,
        scope: &mut ExchangeScope,
        chain: &Arc<dyn Chain>,
        with_fallback: bool,
    ) -> Result<Response<CacheBody>> {
        let result = self
            .do_revalidate(&parts, &body, request_cc, &hit, scope, chain)
            .await;
        let now = self.clock.now();
        match result {
            Ok(response) => {
                if with_fallback
                    && matches!(
                        response.status().as_u16(),
                        500 | 502 | 503 | 504
                    )
                    && self.suitability.is_suitable_if_error(
                        request_cc, entry_cc, &hit.entry, now,
                    )
                {
                    drain_discard(response.into_body()).await;
                    scope.attributes.set_cache_status(
                        CacheResponseStatus::CacheModuleResponse,
                    );
                    return self.serve_entry(&parts, &hit.entry, now);
                }
                Ok(response)
            }
            Err(err) if err.is_io() => {
                if with_fallback
                    && self.suitability.is_suitable_if_error(
                        request_cc, entry_cc, &hit.entry, now,
                    )
                {
                    warn!("revalidation failed, serving stale: {err}");
                    scope.attributes.set_cache_status(
                        CacheResponseStatus::CacheModuleResponse,
                    );
                    return self.serve_entry(&parts, &hit.entry, now);
                }
                debug!("revalidation failed: {err}");
                scope.attributes.set_cache_status(
                    CacheResponseStatus::CacheModuleResponse,
                );
                gateway_timeout()
            }
            Err(err) => Err(err),
        }
    }

    async fn do_revalidate(
        &self,
        parts: &request::Parts,
        body: &RequestBody,
        request_cc: &RequestCacheControl,
        hit: &CacheHit,
        scope: &mut ExchangeScope,
        chain: &Arc<dyn Chain>,
    ) -> Result<Response<CacheBody>> {
        let entry_cc = ResponseCacheControl::parse_values(
            hit.entry.headers.get_all("cache-control"),
        );
        let conditional =
            build_conditional_request(&entry_cc, parts, &hit.entry)?;
        let sent_if_modified_since =
            conditional.headers.get(IF_MODIFIED_SINCE).cloned();
        let conditional_body = body.try_clone().ok_or_else(|| {
            HttpCacheError::protocol("request body is not repeatable")
        })?;

        let t0 = self.clock.now();
        let response = chain
            .proceed(
                Request::from_parts(conditional, conditional_body),
                scope,
            )
            .await?;
        let t1 = self.clock.now();

        if hit.entry.is_newer_than(response.headers()) {
            // answered by a replica that is older than our entry; force an
            // end-to-end reload of the original request
            drain_discard(response.into_body()).await;
            let unconditional = build_unconditional_request(parts);
            let unconditional_body = body.try_clone().ok_or_else(|| {
                HttpCacheError::protocol("request body is not repeatable")
            })?;
            let t0 = self.clock.now();
            let response = chain
                .proceed(
                    Request::from_parts(unconditional, unconditional_body),
                    scope,
                )
                .await?;
            let t1 = self.clock.now();
            scope
                .attributes
                .set_cache_status(CacheResponseStatus::CacheMiss);
            return self
                .handle_backend_response(
                    parts, request_cc, response, t0, t1, scope, true, true,
                )
                .await;
        }

        if response.status() == StatusCode::NOT_MODIFIED {
            let (response_parts, response_body) = response.into_parts();
            drain_discard(response_body).await;
            let (store_parts, synthetic_last_modified) =
                carry_validator_from_request(
                    response_parts,
                    &hit.entry,
                    sent_if_modified_since,
                );
            let entry = match self
                .store
                .update(hit, parts, &store_parts, t0, t1)
                .await
            {
                Ok(updated) => updated.entry,
                Err(err) => {
                    warn!("cache update failed after revalidation: {err}");
                    Arc::new(hit.entry.with_not_modified(
                        &store_parts,
                        t0,
                        t1,
                    ))
                }
            };
            self.stats.record_update();
            scope
                .attributes
                .set_cache_status(CacheResponseStatus::Validated);
            let mut response = self.serve_entry(parts, &entry, t1)?;
            if synthetic_last_modified {
                response.headers_mut().remove(LAST_MODIFIED);
            }
            return Ok(response);
        }

        scope
            .attributes
            .set_cache_status(CacheResponseStatus::CacheMiss);
        self.handle_backend_response(
            parts, request_cc, response, t0, t1, scope, true, true,
        )
        .await
    }

    async fn call_backend(
        &self,
        parts: request::Parts,
        body: RequestBody,
        request_cc: &RequestCacheControl,
        scope: &mut ExchangeScope,
        chain: &Arc<dyn Chain>,
        cacheable: bool,
        status: CacheResponseStatus,
    ) -> Result<Response<CacheBody>> {
        if cacheable {
            self.stats.record_miss();
        }
        scope.attributes.set_cache_status(status);
        let t0 = self.clock.now();
        let response = chain
            .proceed(Request::from_parts(parts.clone(), body), scope)
            .await?;
        let t1 = self.clock.now();
        self.handle_backend_response(
            &parts, request_cc, response, t0, t1, scope, cacheable, false,
        )
        .await
    }

    async fn call_backend_unconditional(
        &self,
        parts: request::Parts,
        body: RequestBody,
        request_cc: &RequestCacheControl,
        scope: &mut ExchangeScope,
        chain: &Arc<dyn Chain>,
    ) -> Result<Response<CacheBody>> {
        let unconditional = build_unconditional_request(&parts);
        self.call_backend(
            unconditional,
            body,
            request_cc,
            scope,
            chain,
            true,
            CacheResponseStatus::CacheMiss,
        )
        .await
    }

    /// Post-processing of every backend response: invalidation, the
    /// storability gate, the bounded drain, and the 304 special cases.
    #[allow(clippy::too_many_arguments)]
    async fn handle_backend_response(
        &self,
        original: &request::Parts,
        request_cc: &RequestCacheControl,
        response: Response<CacheBody>,
        request_instant: SystemTime,
        response_instant: SystemTime,
        scope: &mut ExchangeScope,
        cacheable: bool,
        revalidation: bool,
    ) -> Result<Response<CacheBody>> {
        let (response_parts, response_body) = response.into_parts();

        if let Err(err) = self
            .store
            .evict_invalidated(original, &response_parts)
            .await
        {
            warn!("cache invalidation failed: {err}");
        }

        if !cacheable {
            return Ok(Response::from_parts(response_parts, response_body));
        }

        if response_parts.status == StatusCode::NOT_MODIFIED {
            drain_discard(response_body).await;
            return self
                .handle_unsolicited_not_modified(
                    original,
                    response_parts,
                    request_instant,
                    response_instant,
                    scope,
                )
                .await;
        }

        let content_length = response_parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if content_length
            .map_or(false, |len| len > self.config.max_object_size)
        {
            return Ok(Response::from_parts(response_parts, response_body));
        }

        let response_cc =
            ResponseCacheControl::parse(&response_parts.headers);
        if !self.response_policy.is_storable(
            original,
            request_cc,
            &response_parts,
            &response_cc,
        ) {
            return Ok(Response::from_parts(response_parts, response_body));
        }

        match drain_limited(response_body, self.config.max_object_size)
            .await?
        {
            Drained::Overflow(body) => {
                // too large after all; hand the client the full bytes
                Ok(Response::from_parts(response_parts, body))
            }
            Drained::Complete(bytes) => {
                if self.config.freshness_check_enabled {
                    if let Ok(current) =
                        self.store.match_entry(original).await
                    {
                        if let Some(current) = current.hit {
                            if current
                                .entry
                                .is_newer_than(&response_parts.headers)
                            {
                                debug!(
                                    "skipping write, stored entry is fresher"
                                );
                                return Ok(Response::from_parts(
                                    response_parts,
                                    CacheBody::buffered(bytes),
                                ));
                            }
                        }
                    }
                }
                match self
                    .store
                    .store(
                        original,
                        &response_parts,
                        Some(bytes.clone()),
                        request_instant,
                        response_instant,
                    )
                    .await
                {
                    Ok(stored) => {
                        if revalidation {
                            self.stats.record_update();
                        }
                        self.serve_entry(
                            original,
                            &stored.entry,
                            response_instant,
                        )
                    }
                    Err(err) => {
                        warn!("cache write-back failed: {err}");
                        Ok(Response::from_parts(
                            response_parts,
                            CacheBody::buffered(bytes),
                        ))
                    }
                }
            }
        }
    }

    /// A 304 observed outside the revalidation protocol: the client's own
    /// conditionals produced it. Update the matching entry when one
    /// exists; otherwise store a body-less entry derived from the 304 and
    /// synthesize the client's 304 from it.
    async fn handle_unsolicited_not_modified(
        &self,
        original: &request::Parts,
        response_parts: response::Parts,
        request_instant: SystemTime,
        response_instant: SystemTime,
        scope: &mut ExchangeScope,
    ) -> Result<Response<CacheBody>> {
        let lookup = match self.store.match_entry(original).await {
            Ok(lookup) => lookup,
            Err(err) => {
                warn!("cache lookup failed: {err}");
                CacheLookup::miss()
            }
        };
        match lookup.hit {
            Some(hit) => {
                let (store_parts, synthetic_last_modified) =
                    carry_validator_from_request(
                        response_parts,
                        &hit.entry,
                        original.headers.get(IF_MODIFIED_SINCE).cloned(),
                    );
                let entry = match self
                    .store
                    .update(
                        &hit,
                        original,
                        &store_parts,
                        request_instant,
                        response_instant,
                    )
                    .await
                {
                    Ok(updated) => updated.entry,
                    Err(err) => {
                        warn!("cache update failed: {err}");
                        Arc::new(hit.entry.with_not_modified(
                            &store_parts,
                            request_instant,
                            response_instant,
                        ))
                    }
                };
                self.stats.record_update();
                scope
                    .attributes
                    .set_cache_status(CacheResponseStatus::Validated);
                let mut response =
                    self.serve_entry(original, &entry, response_instant)?;
                if synthetic_last_modified {
                    response.headers_mut().remove(LAST_MODIFIED);
                }
                Ok(response)
            }
            None => {
                let mut store_parts = response_parts;
                let mut synthetic_last_modified = false;
                if !store_parts.headers.contains_key(ETAG)
                    && !store_parts.headers.contains_key(LAST_MODIFIED)
                {
                    if let Some(since) =
                        original.headers.get(IF_MODIFIED_SINCE)
                    {
                        store_parts
                            .headers
                            .insert(LAST_MODIFIED, since.clone());
                        synthetic_last_modified = true;
                    }
                }
                let stored = self
                    .store
                    .store(
                        original,
                        &store_parts,
                        None,
                        request_instant,
                        response_instant,
                    )
                    .await;
                scope.attributes.set_cache_status(
                    CacheResponseStatus::CacheModuleResponse,
                );
                match stored {
                    Ok(stored) => {
                        let mut response = self
                            .generator
                            .generate_not_modified(
                                &stored.entry,
                                response_instant,
                            )?;
                        if synthetic_last_modified {
                            response.headers_mut().remove(LAST_MODIFIED);
                        }
                        Ok(response)
                    }
                    Err(err) => {
                        warn!("cache write-back failed: {err}");
                        if synthetic_last_modified {
                            store_parts.headers.remove(LAST_MODIFIED);
                        }
                        Ok(Response::from_parts(
                            store_parts,
                            CacheBody::empty(),
                        ))
                    }
                }
            }
        }
    }

    fn serve_entry(
        &self,
        request: &request::Parts,
        entry: &CacheEntry,
        now: SystemTime,
    ) -> Result<Response<CacheBody>> {
        let response_cc = ResponseCacheControl::parse_values(
            entry.headers.get_all("cache-control"),
        );
        if is_conditional(request)
            && self.suitability.all_conditionals_match(request, entry, now)
        {
            self.generator.generate_not_modified(entry, now)
        } else {
            self.generator.generate(request, entry, &response_cc, now)
        }
    }

    fn spawn_background_revalidation(
        &self,
        parts: &request::Parts,
        hit: &CacheHit,
        scope: &ExchangeScope,
        chain: &Arc<dyn Chain>,
    ) {
        let revalidator = match &self.revalidator {
            Some(revalidator) => revalidator,
            None => return,
        };
        let store = self.store.clone();
        let chain = chain.clone();
        let clock = self.clock.clone();
        let response_policy = self.response_policy;
        let max_object_size = self.config.max_object_size;
        let parts = parts.clone();
        let hit = hit.clone();
        let route = scope.route.clone();
        let entry_key = hit.key.clone();
        revalidator.revalidate(&entry_key, move || {
            Box::pin(background_revalidate(
                store.clone(),
                chain.clone(),
                clock.clone(),
                response_policy,
                max_object_size,
                parts.clone(),
                hit.clone(),
                route.clone(),
            ))
        });
    }
}

/// One background revalidation attempt, run on a forked scope so the
/// foreground exchange context stays untouched.
#[allow(clippy::too_many_arguments)]
async fn background_revalidate<S: CacheStore>(
    store: Arc<S>,
    chain: Arc<dyn Chain>,
    clock: Arc<dyn Clock>,
    response_policy: ResponseCachePolicy,
    max_object_size: u64,
    parts: request::Parts,
    hit: CacheHit,
    route: Option<String>,
) -> Result<()> {
    let mut scope = match route {
        Some(route) => ExchangeScope::with_route(route),
        None => ExchangeScope::new(),
    };
    let entry_cc = ResponseCacheControl::parse_values(
        hit.entry.headers.get_all("cache-control"),
    );
    let conditional =
        build_conditional_request(&entry_cc, &parts, &hit.entry)?;
    let t0 = clock.now();
    let response = chain
        .proceed(
            Request::from_parts(conditional, RequestBody::Empty),
            &mut scope,
        )
        .await?;
    let t1 = clock.now();
    let (response_parts, response_body) = response.into_parts();

    if response_parts.status == StatusCode::NOT_MODIFIED {
        drain_discard(response_body).await;
        store.update(&hit, &parts, &response_parts, t0, t1).await?;
        return Ok(());
    }

    let request_cc = RequestCacheControl::parse(&parts.headers);
    let response_cc = ResponseCacheControl::parse(&response_parts.headers);
    if !response_policy.is_storable(
        &parts,
        &request_cc,
        &response_parts,
        &response_cc,
    ) {
        drain_discard(response_body).await;
        return Ok(());
    }
    match drain_limited(response_body, max_object_size).await? {
        Drained::Complete(bytes) => {
            store
                .store(&parts, &response_parts, Some(bytes), t0, t1)
                .await?;
        }
        Drained::Overflow(rest) => {
            drain_discard(rest).await;
        }
    }
    Ok(())
}

/// The merge input for a 304 that carries no validators of its own: the
/// `If-Modified-Since` that was sent becomes the stored `Last-Modified`,
/// so future conditional requests can be formed. The caller strips the
/// synthetic header from anything returned to the client.
fn carry_validator_from_request(
    mut response_parts: response::Parts,
    entry: &CacheEntry,
    sent_if_modified_since: Option<http::HeaderValue>,
) -> (response::Parts, bool) {
    if response_parts.headers.contains_key(ETAG)
        || response_parts.headers.contains_key(LAST_MODIFIED)
        || entry.etag().is_some()
        || entry.last_modified().is_some()
    {
        return (response_parts, false);
    }
    match sent_if_modified_since {
        Some(since) => {
            response_parts.headers.insert(LAST_MODIFIED, since);
            (response_parts, true)
        }
        None => (response_parts, false),
    }
}

fn gateway_timeout() -> Result<Response<CacheBody>> {
    Ok(Response::builder()
        .status(StatusCode::GATEWAY_TIMEOUT)
        .body(CacheBody::empty())?)
}
