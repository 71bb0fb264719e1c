//! Classification of a cache hit against the current request.

use std::time::{Duration, SystemTime};

use http::{request, Method};

use crate::directives::{NoCache, RequestCacheControl, ResponseCacheControl};
use crate::entry::CacheEntry;
use crate::freshness::ValidityPolicy;
use crate::store::request_variant_key;

/// How a stored entry relates to the request being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suitability {
    /// Fresh, and any `min-fresh` tolerance is satisfied.
    Fresh,
    /// Stale, but inside the request's `max-stale` tolerance.
    FreshEnough,
    /// Stale with no applicable tolerance; revalidate before reuse, but a
    /// stale fallback may absorb origin errors.
    Stale,
    /// Stale inside the response's `stale-while-revalidate` window.
    StaleWhileRevalidated,
    /// Reuse is forbidden without a successful revalidation; no stale
    /// fallback applies.
    RevalidationRequired,
    /// The entry does not answer this request (method or variant
    /// selection differs).
    Mismatch,
}

/// Applies the reuse rules of rfc7234 4 to a stored entry.
#[derive(Debug, Clone, Copy)]
pub struct SuitabilityChecker {
    pub(crate) shared: bool,
    pub(crate) validity: ValidityPolicy,
    pub(crate) stale_while_revalidate_enabled: bool,
    pub(crate) stale_if_error_enabled: bool,
    pub(crate) stale_if_error_default: Duration,
}

impl SuitabilityChecker {
    /// Derives the checker from the executor configuration.
    #[must_use]
    pub fn new(config: &crate::CacheConfig) -> Self {
        Self {
            shared: config.shared,
            validity: ValidityPolicy::new(config),
            stale_while_revalidate_enabled: config
                .stale_while_revalidate_enabled,
            stale_if_error_enabled: config.stale_if_error_enabled,
            stale_if_error_default: config.stale_if_error_default,
        }
    }

    /// Classifies the entry for the given request at `now`.
    #[must_use]
    pub fn classify(
        &self,
        request: &request::Parts,
        request_cc: &RequestCacheControl,
        entry: &CacheEntry,
        response_cc: &ResponseCacheControl,
        now: SystemTime,
    ) -> Suitability {
        if entry.request_method != request.method.as_str()
            && !(entry.request_method == Method::GET.as_str()
                && request.method == Method::HEAD)
        {
            return Suitability::Mismatch;
        }
        let vary = entry.vary();
        if !vary.is_empty() || entry.variant_key.is_some() {
            match request_variant_key(&vary, &request.headers) {
                Some(key) if Some(key.as_str()) == entry.variant_key.as_deref() => {}
                _ => return Suitability::Mismatch,
            }
        }

        if request_cc.no_cache || self.entry_demands_revalidation(entry, response_cc) {
            return Suitability::RevalidationRequired;
        }

        let age = self.validity.current_age(entry, now);
        let lifetime = self.validity.freshness_lifetime(entry, response_cc);
        let within_lifetime = age <= lifetime
            && request_cc.max_age.map_or(true, |max_age| age <= max_age);
        if within_lifetime {
            if let Some(min_fresh) = request_cc.min_fresh {
                if age + min_fresh > lifetime {
                    // The request's tolerance, not the entry, disqualifies
                    // direct reuse.
                    return Suitability::Stale;
                }
            }
            return Suitability::Fresh;
        }

        let staleness = age.saturating_sub(lifetime);
        if self.must_revalidate_when_stale(response_cc) {
            return Suitability::RevalidationRequired;
        }
        if let Some(max_stale) = request_cc.max_stale {
            if max_stale.allows(staleness) {
                return Suitability::FreshEnough;
            }
        }
        if self.shared && self.stale_while_revalidate_enabled {
            if let Some(window) = response_cc.stale_while_revalidate {
                if staleness <= window {
                    return Suitability::StaleWhileRevalidated;
                }
            }
        }
        Suitability::Stale
    }

    /// Whether a stale entry may be served in place of an origin error,
    /// per the `stale-if-error` windows of request and response.
    #[must_use]
    pub fn is_suitable_if_error(
        &self,
        request_cc: &RequestCacheControl,
        response_cc: &ResponseCacheControl,
        entry: &CacheEntry,
        now: SystemTime,
    ) -> bool {
        if !self.stale_if_error_enabled {
            return false;
        }
        if self.must_revalidate_when_stale(response_cc) {
            return false;
        }
        let staleness = self
            .validity
            .staleness(entry, response_cc, now)
            .unwrap_or(Duration::ZERO);
        let window = request_cc
            .stale_if_error
            .or(response_cc.stale_if_error)
            .unwrap_or(self.stale_if_error_default);
        staleness <= window
    }

    /// Whether every conditional the request carries is satisfied by the
    /// entry (rfc7232 6): `If-None-Match` takes precedence over
    /// `If-Modified-Since`.
    #[must_use]
    pub fn all_conditionals_match(
        &self,
        request: &request::Parts,
        entry: &CacheEntry,
        _now: SystemTime,
    ) -> bool {
        let if_none_match: Vec<&str> = request
            .headers
            .get_all(http::header::IF_NONE_MATCH)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect();
        if !if_none_match.is_empty() {
            if if_none_match.contains(&"*") {
                return true;
            }
            let entry_tag = match entry.etag() {
                Some(tag) => weak_stripped(tag),
                None => return false,
            };
            return if_none_match
                .iter()
                .any(|candidate| weak_stripped(candidate) == entry_tag);
        }
        if let Some(since) = request
            .headers
            .get(http::header::IF_MODIFIED_SINCE)
            .and_then(|v| v.to_str().ok())
        {
            let since = match httpdate::parse_http_date(since) {
                Ok(date) => date,
                Err(_) => return false,
            };
            return match entry.last_modified() {
                Some(modified) => modified <= since,
                None => false,
            };
        }
        true
    }

    fn entry_demands_revalidation(
        &self,
        entry: &CacheEntry,
        response_cc: &ResponseCacheControl,
    ) -> bool {
        match &response_cc.no_cache {
            Some(NoCache::Unqualified) => true,
            Some(NoCache::Fields(fields)) => {
                fields.iter().any(|field| entry.headers.contains_key(field))
            }
            None => false,
        }
    }

    fn must_revalidate_when_stale(
        &self,
        response_cc: &ResponseCacheControl,
    ) -> bool {
        response_cc.must_revalidate
            || (self.shared
                && (response_cc.proxy_revalidate
                    || response_cc.s_maxage.is_some()))
    }
}

fn weak_stripped(tag: &str) -> &str {
    tag.trim().trim_start_matches("W/")
}
