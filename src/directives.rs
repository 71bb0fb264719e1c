//! Typed `Cache-Control` directive records.
//!
//! Request and response directives are parsed once per exchange into plain
//! records so the policy modules never re-scan header text.

use std::time::Duration;

use http::header::{CACHE_CONTROL, PRAGMA};
use http::HeaderMap;

/// The request `max-stale` directive, which may appear without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxStale {
    /// `max-stale` without a value: any amount of staleness is acceptable.
    Any,
    /// `max-stale=N`: staleness up to the given window is acceptable.
    Limit(Duration),
}

impl MaxStale {
    /// Whether the given staleness falls inside this tolerance.
    #[must_use]
    pub fn allows(&self, staleness: Duration) -> bool {
        match self {
            MaxStale::Any => true,
            MaxStale::Limit(limit) => staleness <= *limit,
        }
    }
}

/// The response `no-cache` directive, unqualified or with a field list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoCache {
    /// `no-cache`: the stored response must be revalidated before reuse.
    Unqualified,
    /// `no-cache="field, ..."`: only the named fields require revalidation.
    Fields(Vec<String>),
}

/// Parsed request cache-control record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RequestCacheControl {
    /// `no-cache` (or a bare `Pragma: no-cache` without `Cache-Control`)
    pub no_cache: bool,
    /// `no-store`
    pub no_store: bool,
    /// `only-if-cached`
    pub only_if_cached: bool,
    /// `no-transform`
    pub no_transform: bool,
    /// `max-age=N`
    pub max_age: Option<Duration>,
    /// `max-stale` / `max-stale=N`
    pub max_stale: Option<MaxStale>,
    /// `min-fresh=N`
    pub min_fresh: Option<Duration>,
    /// `stale-if-error=N`
    pub stale_if_error: Option<Duration>,
}

impl RequestCacheControl {
    /// Parses the record from the request headers.
    #[must_use]
    pub fn parse(headers: &HeaderMap) -> Self {
        let mut cc = Self::default();
        let mut saw_cache_control = false;
        for (name, value) in directives(headers) {
            saw_cache_control = true;
            match name.as_str() {
                "no-cache" => cc.no_cache = true,
                "no-store" => cc.no_store = true,
                "only-if-cached" => cc.only_if_cached = true,
                "no-transform" => cc.no_transform = true,
                "max-age" => cc.max_age = parse_seconds(value.as_deref()),
                "max-stale" => {
                    cc.max_stale = Some(match parse_seconds(value.as_deref()) {
                        Some(limit) => MaxStale::Limit(limit),
                        None => MaxStale::Any,
                    });
                }
                "min-fresh" => cc.min_fresh = parse_seconds(value.as_deref()),
                "stale-if-error" => {
                    cc.stale_if_error = parse_seconds(value.as_deref());
                }
                _ => {}
            }
        }
        // A request without Cache-Control but with the no-cache pragma is
        // treated as Cache-Control: no-cache (rfc7234 5.4)
        if !saw_cache_control && pragma_no_cache(headers) {
            cc.no_cache = true;
        }
        cc
    }
}

/// Parsed response cache-control record.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResponseCacheControl {
    /// `no-store`
    pub no_store: bool,
    /// `no-cache`, unqualified or with a field list
    pub no_cache: Option<NoCache>,
    /// `private`
    pub private: bool,
    /// `public`
    pub public: bool,
    /// `must-revalidate`
    pub must_revalidate: bool,
    /// `proxy-revalidate`
    pub proxy_revalidate: bool,
    /// `immutable`
    pub immutable: bool,
    /// `s-maxage=N`
    pub s_maxage: Option<Duration>,
    /// `max-age=N`
    pub max_age: Option<Duration>,
    /// `stale-while-revalidate=N`
    pub stale_while_revalidate: Option<Duration>,
    /// `stale-if-error=N`
    pub stale_if_error: Option<Duration>,
}

impl ResponseCacheControl {
    /// Parses the record from the response headers.
    #[must_use]
    pub fn parse(headers: &HeaderMap) -> Self {
        Self::parse_values(
            headers
                .get_all(CACHE_CONTROL)
                .iter()
                .filter_map(|v| v.to_str().ok()),
        )
    }

    /// Parses the record from raw `Cache-Control` header values, e.g. the
    /// ones carried by a stored entry.
    ///
    /// When the same valued directive appears more than once with differing
    /// values its freshness information is invalid; such responses degrade
    /// to `must-revalidate` (rfc7234 4.2.1).
    #[must_use]
    pub fn parse_values<'a>(
        values: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let mut cc = Self::default();
        let mut valid = true;
        let mut seen: Vec<(String, Option<String>)> = Vec::new();
        for (name, value) in values.into_iter().flat_map(split_directives) {
            if let Some((_, prior)) =
                seen.iter().find(|(seen_name, _)| *seen_name == name)
            {
                if *prior != value {
                    valid = false;
                }
                continue;
            }
            seen.push((name.clone(), value.clone()));
            match name.as_str() {
                "no-store" => cc.no_store = true,
                "no-cache" => {
                    cc.no_cache = Some(match value {
                        Some(fields) if !fields.is_empty() => NoCache::Fields(
                            fields
                                .split(',')
                                .map(|f| f.trim().to_ascii_lowercase())
                                .filter(|f| !f.is_empty())
                                .collect(),
                        ),
                        _ => NoCache::Unqualified,
                    });
                }
                "private" => cc.private = true,
                "public" => cc.public = true,
                "must-revalidate" => cc.must_revalidate = true,
                "proxy-revalidate" => cc.proxy_revalidate = true,
                "immutable" => cc.immutable = true,
                "s-maxage" => cc.s_maxage = parse_seconds(value.as_deref()),
                "max-age" => cc.max_age = parse_seconds(value.as_deref()),
                "stale-while-revalidate" => {
                    cc.stale_while_revalidate =
                        parse_seconds(value.as_deref());
                }
                "stale-if-error" => {
                    cc.stale_if_error = parse_seconds(value.as_deref());
                }
                _ => {}
            }
        }
        if !valid {
            cc.must_revalidate = true;
        }
        cc
    }

    /// Whether the unqualified `no-cache` form is present.
    #[must_use]
    pub fn no_cache_unqualified(&self) -> bool {
        matches!(self.no_cache, Some(NoCache::Unqualified))
    }

    /// The `no-cache` field list, when the qualified form is present.
    #[must_use]
    pub fn no_cache_fields(&self) -> Option<&[String]> {
        match &self.no_cache {
            Some(NoCache::Fields(fields)) => Some(fields),
            _ => None,
        }
    }

    /// Whether the response carries an explicit freshness lifetime.
    #[must_use]
    pub fn has_explicit_freshness(&self) -> bool {
        self.s_maxage.is_some() || self.max_age.is_some()
    }
}

fn directives(
    headers: &HeaderMap,
) -> impl Iterator<Item = (String, Option<String>)> + '_ {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(split_directives)
}

// Splits one Cache-Control value on commas outside double quotes, so
// no-cache="set-cookie, age" stays a single directive.
fn split_directives(value: &str) -> Vec<(String, Option<String>)> {
    let mut out = Vec::new();
    let mut depth_quoted = false;
    let mut start = 0;
    let bytes = value.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'"' => depth_quoted = !depth_quoted,
            b',' if !depth_quoted => {
                push_directive(&mut out, &value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    push_directive(&mut out, &value[start..]);
    out
}

fn push_directive(out: &mut Vec<(String, Option<String>)>, part: &str) {
    let part = part.trim();
    if part.is_empty() {
        return;
    }
    let mut kv = part.splitn(2, '=');
    let name = kv.next().unwrap_or_default().trim().to_ascii_lowercase();
    if name.is_empty() {
        return;
    }
    let value =
        kv.next().map(|v| v.trim().trim_matches('"').trim().to_string());
    out.push((name, value));
}

fn parse_seconds(value: Option<&str>) -> Option<Duration> {
    value.and_then(|v| v.parse::<u64>().ok()).map(Duration::from_secs)
}

fn pragma_no_cache(headers: &HeaderMap) -> bool {
    headers
        .get_all(PRAGMA)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("no-cache"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(CACHE_CONTROL, HeaderValue::from_str(value).unwrap());
        map
    }

    #[test]
    fn request_directives() {
        let cc = RequestCacheControl::parse(&headers(
            "no-cache, max-age=30, min-fresh=5, max-stale",
        ));
        assert!(cc.no_cache);
        assert_eq!(cc.max_age, Some(Duration::from_secs(30)));
        assert_eq!(cc.min_fresh, Some(Duration::from_secs(5)));
        assert_eq!(cc.max_stale, Some(MaxStale::Any));
        assert!(!cc.no_store);
    }

    #[test]
    fn pragma_counts_without_cache_control() {
        let mut map = HeaderMap::new();
        map.insert(PRAGMA, HeaderValue::from_static("no-cache"));
        assert!(RequestCacheControl::parse(&map).no_cache);

        map.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=1"));
        assert!(!RequestCacheControl::parse(&map).no_cache);
    }

    #[test]
    fn qualified_no_cache_field_list() {
        let cc = ResponseCacheControl::parse(&headers(
            "no-cache=\"Set-Cookie, Age\", max-age=60",
        ));
        assert_eq!(
            cc.no_cache_fields(),
            Some(&["set-cookie".to_string(), "age".to_string()][..])
        );
        assert!(!cc.no_cache_unqualified());
        assert_eq!(cc.max_age, Some(Duration::from_secs(60)));
    }

    #[test]
    fn conflicting_duplicates_degrade_to_must_revalidate() {
        let cc =
            ResponseCacheControl::parse(&headers("max-age=60, max-age=120"));
        assert!(cc.must_revalidate);
        assert_eq!(cc.max_age, Some(Duration::from_secs(60)));
    }

    #[test]
    fn repeated_identical_directives_stay_valid() {
        let cc =
            ResponseCacheControl::parse(&headers("max-age=60, max-age=60"));
        assert!(!cc.must_revalidate);
    }

    #[test]
    fn extension_windows() {
        let cc = ResponseCacheControl::parse(&headers(
            "max-age=60, stale-while-revalidate=30, stale-if-error=120",
        ));
        assert_eq!(
            cc.stale_while_revalidate,
            Some(Duration::from_secs(30))
        );
        assert_eq!(cc.stale_if_error, Some(Duration::from_secs(120)));
    }
}
