//! Eligibility and storability policies.

use http::header::AUTHORIZATION;
use http::{request, response, Method, Version};

use crate::directives::{RequestCacheControl, ResponseCacheControl};

// rfc7231 6.1
const CACHEABLE_BY_DEFAULT: &[u16] =
    &[200, 203, 204, 206, 300, 301, 308, 404, 405, 410, 414, 501];

// This implementation does not understand partial responses (206)
const UNDERSTOOD_STATUSES: &[u16] = &[
    200, 203, 204, 300, 301, 302, 303, 307, 308, 404, 405, 410, 414, 501,
];

/// Decides whether a request may be answered from the cache at all.
#[derive(Debug, Clone, Copy)]
pub struct RequestCachePolicy {
    pub(crate) shared: bool,
}

impl RequestCachePolicy {
    /// Derives the policy from the executor configuration.
    #[must_use]
    pub fn new(config: &crate::CacheConfig) -> Self {
        Self { shared: config.shared }
    }

    /// `true` when a cache lookup may satisfy this request. Requests that
    /// fail this gate go to the origin unconditionally.
    #[must_use]
    pub fn is_servable(
        &self,
        request: &request::Parts,
        cc: &RequestCacheControl,
    ) -> bool {
        if request.method != Method::GET && request.method != Method::HEAD {
            return false;
        }
        if cc.no_store {
            return false;
        }
        // A shared cache must not answer authenticated requests from
        // storage; the response-side exceptions apply at store time only.
        if self.shared && request.headers.contains_key(AUTHORIZATION) {
            return false;
        }
        true
    }
}

/// Decides whether an origin response may be stored.
#[derive(Debug, Clone, Copy)]
pub struct ResponseCachePolicy {
    pub(crate) shared: bool,
    pub(crate) never_cache_http10_responses_with_query: bool,
    pub(crate) never_cache_http11_responses_with_query: bool,
}

impl ResponseCachePolicy {
    /// Derives the policy from the executor configuration.
    #[must_use]
    pub fn new(config: &crate::CacheConfig) -> Self {
        Self {
            shared: config.shared,
            never_cache_http10_responses_with_query: config
                .never_cache_http10_responses_with_query,
            never_cache_http11_responses_with_query: config
                .never_cache_http11_responses_with_query,
        }
    }

    /// `true` when the response may enter the store (rfc7234 3).
    #[must_use]
    pub fn is_storable(
        &self,
        request: &request::Parts,
        request_cc: &RequestCacheControl,
        response: &response::Parts,
        response_cc: &ResponseCacheControl,
    ) -> bool {
        let explicit = self.has_explicit_expiration(response, response_cc);
        let method_allows = request.method == Method::GET
            || request.method == Method::HEAD
            || (request.method == Method::POST && explicit);
        if !method_allows {
            return false;
        }
        if request_cc.no_store || response_cc.no_store {
            return false;
        }
        if self.shared && response_cc.private {
            return false;
        }
        if self.shared
            && request.headers.contains_key(AUTHORIZATION)
            && !self.allows_storing_authenticated(response_cc)
        {
            return false;
        }
        if !UNDERSTOOD_STATUSES.contains(&response.status.as_u16()) {
            return false;
        }
        if vary_star(response) {
            return false;
        }
        if request.uri.query().is_some() {
            let never = match response.version {
                Version::HTTP_10 => {
                    self.never_cache_http10_responses_with_query
                }
                Version::HTTP_11 => {
                    self.never_cache_http11_responses_with_query
                }
                _ => false,
            };
            if never {
                return false;
            }
        }
        explicit
            || response_cc.public
            || CACHEABLE_BY_DEFAULT.contains(&response.status.as_u16())
    }

    fn has_explicit_expiration(
        &self,
        response: &response::Parts,
        cc: &ResponseCacheControl,
    ) -> bool {
        (self.shared && cc.s_maxage.is_some())
            || cc.max_age.is_some()
            || response.headers.contains_key(http::header::EXPIRES)
    }

    fn allows_storing_authenticated(
        &self,
        cc: &ResponseCacheControl,
    ) -> bool {
        cc.must_revalidate || cc.public || cc.s_maxage.is_some()
    }
}

fn vary_star(response: &response::Parts) -> bool {
    response
        .headers
        .get_all(http::header::VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|name| name.trim() == "*")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Request, Response};

    fn request(builder: request::Builder) -> request::Parts {
        builder.body(()).unwrap().into_parts().0
    }

    fn response(builder: response::Builder) -> response::Parts {
        builder.body(()).unwrap().into_parts().0
    }

    fn req_cc(parts: &request::Parts) -> RequestCacheControl {
        RequestCacheControl::parse(&parts.headers)
    }

    fn resp_cc(parts: &response::Parts) -> ResponseCacheControl {
        ResponseCacheControl::parse(&parts.headers)
    }

    fn shared_request_policy() -> RequestCachePolicy {
        RequestCachePolicy { shared: true }
    }

    fn shared_response_policy() -> ResponseCachePolicy {
        ResponseCachePolicy {
            shared: true,
            never_cache_http10_responses_with_query: true,
            never_cache_http11_responses_with_query: false,
        }
    }

    #[test]
    fn only_get_and_head_are_servable() {
        let policy = shared_request_policy();
        let get = request(Request::get("https://example.com/a"));
        let post = request(Request::post("https://example.com/a"));
        assert!(policy.is_servable(&get, &req_cc(&get)));
        assert!(!policy.is_servable(&post, &req_cc(&post)));
    }

    #[test]
    fn no_store_and_authorization_block_serving() {
        let policy = shared_request_policy();
        let no_store = request(
            Request::get("https://example.com/a")
                .header("cache-control", "no-store"),
        );
        assert!(!policy.is_servable(&no_store, &req_cc(&no_store)));

        let authed = request(
            Request::get("https://example.com/a")
                .header("authorization", "Bearer t"),
        );
        assert!(!policy.is_servable(&authed, &req_cc(&authed)));
        let private =
            RequestCachePolicy { shared: false };
        assert!(private.is_servable(&authed, &req_cc(&authed)));
    }

    #[test]
    fn plain_success_is_storable() {
        let policy = shared_response_policy();
        let req = request(Request::get("https://example.com/a"));
        let resp =
            response(Response::builder().status(200).header(
                "cache-control",
                "max-age=60",
            ));
        assert!(policy.is_storable(
            &req,
            &req_cc(&req),
            &resp,
            &resp_cc(&resp)
        ));
    }

    #[test]
    fn private_responses_not_stored_by_shared_caches() {
        let policy = shared_response_policy();
        let req = request(Request::get("https://example.com/a"));
        let resp = response(Response::builder().status(200).header(
            "cache-control",
            "private, max-age=60",
        ));
        assert!(!policy.is_storable(
            &req,
            &req_cc(&req),
            &resp,
            &resp_cc(&resp)
        ));
        let user_agent = ResponseCachePolicy {
            shared: false,
            ..shared_response_policy()
        };
        assert!(user_agent.is_storable(
            &req,
            &req_cc(&req),
            &resp,
            &resp_cc(&resp)
        ));
    }

    #[test]
    fn authenticated_requests_need_explicit_shareability() {
        let policy = shared_response_policy();
        let req = request(
            Request::get("https://example.com/a")
                .header("authorization", "Bearer t"),
        );
        let plain = response(Response::builder().status(200).header(
            "cache-control",
            "max-age=60",
        ));
        assert!(!policy.is_storable(
            &req,
            &req_cc(&req),
            &plain,
            &resp_cc(&plain)
        ));
        let public = response(Response::builder().status(200).header(
            "cache-control",
            "public, max-age=60",
        ));
        assert!(policy.is_storable(
            &req,
            &req_cc(&req),
            &public,
            &resp_cc(&public)
        ));
    }

    #[test]
    fn vary_star_is_never_stored() {
        let policy = shared_response_policy();
        let req = request(Request::get("https://example.com/a"));
        let resp = response(
            Response::builder()
                .status(200)
                .header("cache-control", "max-age=60")
                .header("vary", "*"),
        );
        assert!(!policy.is_storable(
            &req,
            &req_cc(&req),
            &resp,
            &resp_cc(&resp)
        ));
    }

    #[test]
    fn http10_query_responses_follow_the_flag() {
        let policy = shared_response_policy();
        let req = request(Request::get("https://example.com/a?q=1"));
        let resp = response(
            Response::builder()
                .status(200)
                .version(Version::HTTP_10)
                .header("cache-control", "max-age=60"),
        );
        assert!(!policy.is_storable(
            &req,
            &req_cc(&req),
            &resp,
            &resp_cc(&resp)
        ));
        let lax = ResponseCachePolicy {
            never_cache_http10_responses_with_query: false,
            ..shared_response_policy()
        };
        assert!(lax.is_storable(
            &req,
            &req_cc(&req),
            &resp,
            &resp_cc(&resp)
        ));
    }

    #[test]
    fn uncacheable_status_without_expiry_not_stored() {
        let policy = shared_response_policy();
        let req = request(Request::get("https://example.com/a"));
        let resp = response(Response::builder().status(302));
        assert!(!policy.is_storable(
            &req,
            &req_cc(&req),
            &resp,
            &resp_cc(&resp)
        ));
        let with_expiry = response(Response::builder().status(302).header(
            "cache-control",
            "max-age=60",
        ));
        assert!(policy.is_storable(
            &req,
            &req_cc(&req),
            &with_expiry,
            &resp_cc(&with_expiry)
        ));
    }
}
