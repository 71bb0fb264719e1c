//! Builders for revalidation and negotiation requests.

use http::header::{
    CACHE_CONTROL, IF_MATCH, IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_RANGE,
    IF_UNMODIFIED_SINCE, PRAGMA,
};
use http::{request, HeaderValue};

use crate::directives::ResponseCacheControl;
use crate::entry::CacheEntry;
use crate::error::Result;

/// Derives a conditional request from the stored entry's validators:
/// `ETag` becomes `If-None-Match`, `Last-Modified` (or the entry `Date` as
/// a fallback) becomes `If-Modified-Since`.
///
/// Validators named by the response's `no-cache` field list are not used.
pub fn build_conditional_request(
    response_cc: &ResponseCacheControl,
    original: &request::Parts,
    entry: &CacheEntry,
) -> Result<request::Parts> {
    let mut parts = original.clone();
    // range conditionals are never combined with cache revalidation
    parts.headers.remove(IF_RANGE);
    let banned = response_cc.no_cache_fields().unwrap_or(&[]);
    let ban = |field: &str| banned.iter().any(|f| f == field);

    if let Some(etag) = entry.etag() {
        if !ban("etag") {
            parts
                .headers
                .insert(IF_NONE_MATCH, HeaderValue::from_str(etag)?);
        }
    }
    if !ban("last-modified") {
        let since = entry
            .headers
            .get("last-modified")
            .or_else(|| entry.headers.get("date"));
        if let Some(since) = since {
            parts
                .headers
                .insert(IF_MODIFIED_SINCE, HeaderValue::from_str(since)?);
        }
    }
    Ok(parts)
}

/// Builds the negotiation request for a variant root: `If-None-Match`
/// carrying every collected variant `ETag`.
pub fn build_conditional_request_from_variants(
    original: &request::Parts,
    etags: &[String],
) -> Result<request::Parts> {
    let mut parts = original.clone();
    parts.headers.remove(IF_RANGE);
    parts.headers.remove(IF_MODIFIED_SINCE);
    parts
        .headers
        .insert(IF_NONE_MATCH, HeaderValue::from_str(&etags.join(", "))?);
    Ok(parts)
}

/// Rewrites the original request as an unconditional end-to-end reload:
/// all conditional headers removed, `no-cache` on both `Cache-Control`
/// and `Pragma`.
pub fn build_unconditional_request(
    original: &request::Parts,
) -> request::Parts {
    let mut parts = original.clone();
    for header in [
        IF_NONE_MATCH,
        IF_MODIFIED_SINCE,
        IF_MATCH,
        IF_UNMODIFIED_SINCE,
        IF_RANGE,
    ] {
        parts.headers.remove(header);
    }
    parts
        .headers
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    parts.headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    parts
}

/// Whether the client itself sent a conditional request.
pub(crate) fn is_conditional(parts: &request::Parts) -> bool {
    parts.headers.contains_key(IF_NONE_MATCH)
        || parts.headers.contains_key(IF_MODIFIED_SINCE)
}
