//! Stored cache entry records.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use http::{response, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::error::Result;

// Headers never copied from a response into a stored entry or a generated
// response (rfc7230 6.1).
pub(crate) const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

// Since a 304 update reuses the old body, properties of the body are kept
// from the stored entry rather than the 304 (rfc7234 4.3.4).
const EXCLUDED_FROM_REVALIDATION_UPDATE: &[&str] = &[
    "content-length",
    "content-encoding",
    "transfer-encoding",
    "content-range",
];

/// Represents an HTTP version
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[non_exhaustive]
pub enum HttpVersion {
    /// HTTP Version 0.9
    #[serde(rename = "HTTP/0.9")]
    Http09,
    /// HTTP Version 1.0
    #[serde(rename = "HTTP/1.0")]
    Http10,
    /// HTTP Version 1.1
    #[serde(rename = "HTTP/1.1")]
    Http11,
    /// HTTP Version 2.0
    #[serde(rename = "HTTP/2.0")]
    H2,
    /// HTTP Version 3.0
    #[serde(rename = "HTTP/3.0")]
    H3,
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            HttpVersion::Http09 => write!(f, "HTTP/0.9"),
            HttpVersion::Http10 => write!(f, "HTTP/1.0"),
            HttpVersion::Http11 => write!(f, "HTTP/1.1"),
            HttpVersion::H2 => write!(f, "HTTP/2.0"),
            HttpVersion::H3 => write!(f, "HTTP/3.0"),
        }
    }
}

impl TryFrom<http::Version> for HttpVersion {
    type Error = crate::error::HttpCacheError;

    fn try_from(value: http::Version) -> Result<Self> {
        Ok(match value {
            http::Version::HTTP_09 => Self::Http09,
            http::Version::HTTP_10 => Self::Http10,
            http::Version::HTTP_11 => Self::Http11,
            http::Version::HTTP_2 => Self::H2,
            http::Version::HTTP_3 => Self::H3,
            _ => return Err(crate::error::HttpCacheError::BadVersion),
        })
    }
}

impl From<HttpVersion> for http::Version {
    fn from(value: HttpVersion) -> Self {
        match value {
            HttpVersion::Http09 => Self::HTTP_09,
            HttpVersion::Http10 => Self::HTTP_10,
            HttpVersion::Http11 => Self::HTTP_11,
            HttpVersion::H2 => Self::HTTP_2,
            HttpVersion::H3 => Self::HTTP_3,
        }
    }
}

/// Case-insensitive multimap of stored header fields.
///
/// Keys are normalized to lowercase per RFC 7230. The representation is
/// serde-friendly so storage backends may persist entries directly.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HttpHeaders(HashMap<String, Vec<String>>);

impl HttpHeaders {
    /// Creates an empty header map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header, replacing any existing values for that key.
    pub fn insert(&mut self, key: &str, value: String) {
        self.0.insert(key.to_ascii_lowercase(), vec![value]);
    }

    /// Appends a header value, preserving existing values for the key.
    pub fn append(&mut self, key: &str, value: String) {
        self.0.entry(key.to_ascii_lowercase()).or_default().push(value);
    }

    /// Retrieves the first value for a header key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(&key.to_ascii_lowercase())
            .and_then(|vals| vals.first())
            .map(String::as_str)
    }

    /// Retrieves every value for a header key.
    pub fn get_all(&self, key: &str) -> impl Iterator<Item = &str> {
        self.0
            .get(&key.to_ascii_lowercase())
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Removes a header key and its values.
    pub fn remove(&mut self, key: &str) {
        self.0.remove(&key.to_ascii_lowercase());
    }

    /// Checks if a header key exists.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(&key.to_ascii_lowercase())
    }

    /// Iterates over all key/value pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().flat_map(|(k, vals)| {
            vals.iter().map(move |v| (k.as_str(), v.as_str()))
        })
    }

    /// Converts into an [`http::HeaderMap`], skipping values that are not
    /// legal header text.
    pub fn to_header_map(&self) -> Result<HeaderMap> {
        let mut map = HeaderMap::new();
        for (name, value) in self.iter() {
            map.append(
                http::header::HeaderName::from_str(name)?,
                HeaderValue::from_str(value)?,
            );
        }
        Ok(map)
    }
}

impl From<&HeaderMap> for HttpHeaders {
    fn from(headers: &HeaderMap) -> Self {
        let mut out = Self::new();
        for (name, value) in headers {
            if let Ok(value) = value.to_str() {
                out.append(name.as_str(), value.to_string());
            }
        }
        out
    }
}

/// Payload of a stored entry: either a leaf response or a variant index.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub enum EntryPayload {
    /// A leaf response body. `None` when the stored response carried no
    /// payload (e.g. an entry derived from a bare 304).
    Resource(Option<Vec<u8>>),
    /// A variant root: maps variant keys to the store keys of the leaves.
    Variants(HashMap<String, String>),
}

/// An immutable stored response record.
///
/// Entries are only ever replaced wholesale through the store facade;
/// nothing mutates an entry in place after it has been stored.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheEntry {
    /// When the request producing this response left the cache.
    pub request_instant: SystemTime,
    /// When the response was received from the origin.
    pub response_instant: SystemTime,
    /// Method of the request the entry was stored under.
    pub request_method: String,
    /// HTTP response status code
    pub status: u16,
    /// HTTP response version
    pub version: HttpVersion,
    /// HTTP response headers
    pub headers: HttpHeaders,
    /// Leaf body or variant index.
    pub payload: EntryPayload,
    /// The variant key this leaf was selected by, when the response varies.
    pub variant_key: Option<String>,
}

impl CacheEntry {
    /// Builds an entry from response parts.
    ///
    /// `request_instant` is clamped to `response_instant` so the stored
    /// interval is never negative.
    pub fn from_response(
        request_method: &str,
        response: &response::Parts,
        body: Option<Vec<u8>>,
        request_instant: SystemTime,
        response_instant: SystemTime,
    ) -> Result<Self> {
        Ok(Self {
            request_instant: request_instant.min(response_instant),
            response_instant,
            request_method: request_method.to_string(),
            status: response.status.as_u16(),
            version: response.version.try_into()?,
            headers: strip_hop_by_hop(&response.headers),
            payload: EntryPayload::Resource(body),
            variant_key: None,
        })
    }

    /// The stored body bytes, when this is a leaf with a payload.
    #[must_use]
    pub fn body(&self) -> Option<&[u8]> {
        match &self.payload {
            EntryPayload::Resource(body) => body.as_deref(),
            EntryPayload::Variants(_) => None,
        }
    }

    /// Whether this entry indexes variants instead of carrying a body.
    #[must_use]
    pub fn is_variant_root(&self) -> bool {
        matches!(self.payload, EntryPayload::Variants(_))
    }

    /// The variant map of a root entry.
    #[must_use]
    pub fn variants(&self) -> Option<&HashMap<String, String>> {
        match &self.payload {
            EntryPayload::Variants(map) => Some(map),
            EntryPayload::Resource(_) => None,
        }
    }

    /// The `ETag` validator, if the response carried one.
    #[must_use]
    pub fn etag(&self) -> Option<&str> {
        self.headers.get("etag").map(str::trim)
    }

    /// The `Last-Modified` validator, if the response carried one.
    #[must_use]
    pub fn last_modified(&self) -> Option<SystemTime> {
        self.headers
            .get("last-modified")
            .and_then(|v| httpdate::parse_http_date(v).ok())
    }

    /// The origin `Date`, falling back to the response instant.
    #[must_use]
    pub fn date(&self) -> SystemTime {
        self.headers
            .get("date")
            .and_then(|v| httpdate::parse_http_date(v).ok())
            .unwrap_or(self.response_instant)
    }

    /// The `Age` header value carried by the stored response.
    #[must_use]
    pub fn age_header(&self) -> u64 {
        self.headers.get("age").and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    /// The `Vary` header field names, lowercased.
    #[must_use]
    pub fn vary(&self) -> Vec<String> {
        self.headers
            .get_all("vary")
            .flat_map(|v| v.split(','))
            .map(|name| name.trim().to_ascii_lowercase())
            .filter(|name| !name.is_empty())
            .collect()
    }

    /// Whether the stored response `Date` is strictly later than the given
    /// response headers' `Date`, meaning the backend reply came from a
    /// less-up-to-date replica. Missing dates compare as "not newer".
    #[must_use]
    pub fn is_newer_than(&self, response_headers: &HeaderMap) -> bool {
        let entry_date = match self
            .headers
            .get("date")
            .and_then(|v| httpdate::parse_http_date(v).ok())
        {
            Some(date) => date,
            None => return false,
        };
        let response_date = match response_headers
            .get(http::header::DATE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v).ok())
        {
            Some(date) => date,
            None => return false,
        };
        entry_date > response_date
    }

    /// Merges a 304 response into this entry (rfc7234 4.3.4): the body is
    /// preserved, response headers win for the fields they carry, and 1xx
    /// warnings are dropped from the stored set.
    #[must_use]
    pub fn with_not_modified(
        &self,
        response: &response::Parts,
        request_instant: SystemTime,
        response_instant: SystemTime,
    ) -> Self {
        let mut headers = HttpHeaders::new();
        for (name, values) in &self.headers.0 {
            if name == "warning" {
                let kept: Vec<String> = values
                    .iter()
                    .filter(|warning| !warning.trim_start().starts_with('1'))
                    .cloned()
                    .collect();
                if !kept.is_empty() {
                    headers.0.insert(name.clone(), kept);
                }
                continue;
            }
            headers.0.insert(name.clone(), values.clone());
        }
        for name in response.headers.keys() {
            let lower = name.as_str().to_ascii_lowercase();
            if HOP_BY_HOP_HEADERS.contains(&lower.as_str())
                || EXCLUDED_FROM_REVALIDATION_UPDATE
                    .contains(&lower.as_str())
            {
                continue;
            }
            let values: Vec<String> = response
                .headers
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .map(str::to_string)
                .collect();
            if !values.is_empty() {
                headers.0.insert(lower, values);
            }
        }
        Self {
            request_instant: request_instant.min(response_instant),
            response_instant,
            request_method: self.request_method.clone(),
            status: self.status,
            version: self.version,
            headers,
            payload: self.payload.clone(),
            variant_key: self.variant_key.clone(),
        }
    }
}

pub(crate) fn strip_hop_by_hop(headers: &HeaderMap) -> HttpHeaders {
    let mut out = HttpHeaders::new();
    let dropped: Vec<String> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .collect();
    for (name, value) in headers {
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&lower.as_str())
            || dropped.contains(&lower)
        {
            continue;
        }
        if let Ok(value) = value.to_str() {
            out.append(&lower, value.to_string());
        }
    }
    out
}
