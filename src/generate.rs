//! Synthesis of client-visible responses from stored entries.

use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::header::{AGE, DATE, WARNING};
use http::{request, HeaderValue, Method, Response, StatusCode};

use crate::body::CacheBody;
use crate::directives::ResponseCacheControl;
use crate::entry::CacheEntry;
use crate::error::Result;
use crate::freshness::ValidityPolicy;

// Headers a 304 generated from a stored entry carries (rfc7232 4.1).
const NOT_MODIFIED_HEADERS: &[&str] = &[
    "cache-control",
    "content-location",
    "date",
    "etag",
    "expires",
    "last-modified",
    "vary",
];

/// Builds responses out of stored entries, updating `Age` and `Date` so
/// downstream caches do not double-count residence time.
#[derive(Debug, Clone, Copy)]
pub struct ResponseGenerator {
    pub(crate) validity: ValidityPolicy,
}

impl ResponseGenerator {
    /// Derives the generator from the executor configuration.
    #[must_use]
    pub fn new(config: &crate::CacheConfig) -> Self {
        Self { validity: ValidityPolicy::new(config) }
    }

    /// Generates the full response for a stored entry.
    ///
    /// HEAD requests receive the stored headers with an empty body.
    pub fn generate(
        &self,
        request: &request::Parts,
        entry: &CacheEntry,
        response_cc: &ResponseCacheControl,
        now: SystemTime,
    ) -> Result<Response<CacheBody>> {
        let age = self.validity.current_age(entry, now);
        let body = if request.method == Method::HEAD {
            CacheBody::empty()
        } else {
            match entry.body() {
                Some(bytes) => {
                    CacheBody::buffered(Bytes::copy_from_slice(bytes))
                }
                None => CacheBody::empty(),
            }
        };
        let mut response = Response::builder()
            .status(entry.status)
            .version(entry.version.into())
            .body(body)?;
        *response.headers_mut() = entry.headers.to_header_map()?;
        let headers = response.headers_mut();
        headers
            .insert(AGE, HeaderValue::from_str(&age.as_secs().to_string())?);
        if !headers.contains_key(DATE) {
            headers.insert(
                DATE,
                HeaderValue::from_str(&httpdate::fmt_http_date(
                    entry.date(),
                ))?,
            );
        }
        let day = Duration::from_secs(24 * 3600);
        if age > day
            && !response_cc.has_explicit_freshness()
            && !entry.headers.contains_key("expires")
            && self.validity.freshness_lifetime(entry, response_cc) > day
        {
            // rfc7234 5.5.4
            headers.append(
                WARNING,
                HeaderValue::from_static("113 - \"Heuristic expiration\""),
            );
        }
        Ok(response)
    }

    /// Generates a `304 Not Modified` for a conditional request satisfied
    /// by the stored entry.
    pub fn generate_not_modified(
        &self,
        entry: &CacheEntry,
        now: SystemTime,
    ) -> Result<Response<CacheBody>> {
        let age = self.validity.current_age(entry, now);
        let mut response = Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .body(CacheBody::empty())?;
        let headers = response.headers_mut();
        for name in NOT_MODIFIED_HEADERS {
            for value in entry.headers.get_all(name) {
                headers.append(
                    http::header::HeaderName::from_bytes(name.as_bytes())?,
                    HeaderValue::from_str(value)?,
                );
            }
        }
        headers
            .insert(AGE, HeaderValue::from_str(&age.as_secs().to_string())?);
        if !headers.contains_key(DATE) {
            headers.insert(
                DATE,
                HeaderValue::from_str(&httpdate::fmt_http_date(
                    entry.date(),
                ))?,
            );
        }
        Ok(response)
    }
}
