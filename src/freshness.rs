//! Freshness lifetime and age computation (rfc7234 4.2).

use std::time::{Duration, SystemTime};

use crate::directives::ResponseCacheControl;
use crate::entry::CacheEntry;

// Statuses eligible for heuristic freshness.
const HEURISTICALLY_CACHEABLE: &[u16] = &[200, 203, 300, 301, 410];

/// Computes freshness lifetime, current age, and staleness of entries.
#[derive(Debug, Clone, Copy)]
pub struct ValidityPolicy {
    pub(crate) shared: bool,
    pub(crate) heuristic_enabled: bool,
    pub(crate) heuristic_coefficient: f32,
    pub(crate) heuristic_max: Duration,
}

impl ValidityPolicy {
    /// Derives the policy from the executor configuration.
    #[must_use]
    pub fn new(config: &crate::CacheConfig) -> Self {
        Self {
            shared: config.shared,
            heuristic_enabled: config.heuristic_caching_enabled,
            heuristic_coefficient: config.heuristic_coefficient,
            heuristic_max: config.heuristic_default_lifetime,
        }
    }

    /// Freshness lifetime of a stored response: `s-maxage` (shared caches),
    /// then `max-age`, then `Expires - Date`, then the heuristic when
    /// enabled and the status allows it.
    #[must_use]
    pub fn freshness_lifetime(
        &self,
        entry: &CacheEntry,
        cc: &ResponseCacheControl,
    ) -> Duration {
        if self.shared {
            if let Some(s_maxage) = cc.s_maxage {
                return s_maxage;
            }
        }
        if let Some(max_age) = cc.max_age {
            return max_age;
        }
        if let Some(expires) = entry
            .headers
            .get("expires")
            .map(|v| httpdate::parse_http_date(v))
        {
            // An unparseable Expires means "already expired" (rfc7234 5.3)
            return match expires {
                Ok(expires) => expires
                    .duration_since(entry.date())
                    .unwrap_or(Duration::ZERO),
                Err(_) => Duration::ZERO,
            };
        }
        self.heuristic_lifetime(entry)
    }

    fn heuristic_lifetime(&self, entry: &CacheEntry) -> Duration {
        if !self.heuristic_enabled
            || !HEURISTICALLY_CACHEABLE.contains(&entry.status)
        {
            return Duration::ZERO;
        }
        let last_modified = match entry.last_modified() {
            Some(lm) => lm,
            None => return Duration::ZERO,
        };
        let since_modified = match entry.date().duration_since(last_modified)
        {
            Ok(diff) => diff,
            Err(_) => return Duration::ZERO,
        };
        let secs = since_modified.as_secs() as f64
            * f64::from(self.heuristic_coefficient);
        Duration::from_secs(secs as u64).min(self.heuristic_max)
    }

    /// Current age per rfc7234 4.2.3, from the stored request/response
    /// instants, the stored `Age` header, and the resident time.
    #[must_use]
    pub fn current_age(
        &self,
        entry: &CacheEntry,
        now: SystemTime,
    ) -> Duration {
        let apparent_age = entry
            .response_instant
            .duration_since(entry.date())
            .unwrap_or(Duration::ZERO);
        let response_delay = entry
            .response_instant
            .duration_since(entry.request_instant)
            .unwrap_or(Duration::ZERO);
        let corrected_age_value =
            Duration::from_secs(entry.age_header()) + response_delay;
        let corrected_initial_age = apparent_age.max(corrected_age_value);
        let resident_time = now
            .duration_since(entry.response_instant)
            .unwrap_or(Duration::ZERO);
        corrected_initial_age + resident_time
    }

    /// How far past its freshness lifetime the entry currently is.
    /// `None` while the entry is still fresh.
    #[must_use]
    pub fn staleness(
        &self,
        entry: &CacheEntry,
        cc: &ResponseCacheControl,
        now: SystemTime,
    ) -> Option<Duration> {
        let age = self.current_age(entry, now);
        let lifetime = self.freshness_lifetime(entry, cc);
        age.checked_sub(lifetime).filter(|d| !d.is_zero())
    }

    /// Whether the entry's age exceeds its freshness lifetime.
    #[must_use]
    pub fn is_stale(
        &self,
        entry: &CacheEntry,
        cc: &ResponseCacheControl,
        now: SystemTime,
    ) -> bool {
        self.staleness(entry, cc, now).is_some()
    }
}
