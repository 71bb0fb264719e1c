use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use http::{request, Request, Response};
use http_body_util::BodyExt;
use tokio::runtime::Handle;

use crate::{
    AsyncRevalidator, CacheBody, CacheConfig, CacheResponseStatus,
    CacheStore, CachingExecutor, Chain, Clock, ExchangeScope,
    HttpCacheError, MokaStore, RequestBody, Result,
};

const HELLO: &[u8] = b"hello";

#[derive(Debug, Clone)]
struct ManualClock(Arc<Mutex<SystemTime>>);

impl ManualClock {
    fn new(start: SystemTime) -> Self {
        Self(Arc::new(Mutex::new(start)))
    }

    fn advance(&self, by: Duration) {
        *self.0.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.0.lock().unwrap()
    }
}

#[derive(Debug)]
enum Scripted {
    Respond { status: u16, headers: Vec<(&'static str, String)>, body: Vec<u8> },
    IoError,
}

/// Scripted stand-in for the downstream transport chain.
#[derive(Debug, Default)]
struct MockChain {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<request::Parts>>,
}

impl MockChain {
    fn respond(
        &self,
        status: u16,
        headers: &[(&'static str, &str)],
        body: &[u8],
    ) {
        self.script.lock().unwrap().push_back(Scripted::Respond {
            status,
            headers: headers
                .iter()
                .map(|(name, value)| (*name, value.to_string()))
                .collect(),
            body: body.to_vec(),
        });
    }

    fn fail_with_io(&self) {
        self.script.lock().unwrap().push_back(Scripted::IoError);
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn request(&self, index: usize) -> request::Parts {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl Chain for MockChain {
    async fn proceed(
        &self,
        request: Request<RequestBody>,
        _scope: &mut ExchangeScope,
    ) -> Result<Response<CacheBody>> {
        let (parts, _body) = request.into_parts();
        self.requests.lock().unwrap().push(parts);
        match self.script.lock().unwrap().pop_front() {
            None => {
                Err(HttpCacheError::protocol("unexpected origin call"))
            }
            Some(Scripted::IoError) => {
                Err(HttpCacheError::io("connection reset"))
            }
            Some(Scripted::Respond { status, headers, body }) => {
                let mut builder = Response::builder().status(status);
                for (name, value) in headers {
                    builder = builder.header(name, value);
                }
                Ok(builder.body(CacheBody::buffered(Bytes::from(body)))?)
            }
        }
    }
}

struct Harness {
    executor: CachingExecutor<MokaStore>,
    store: Arc<MokaStore>,
    mock: Arc<MockChain>,
    chain: Arc<dyn Chain>,
    clock: ManualClock,
}

fn epoch() -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

fn harness(config: CacheConfig) -> Harness {
    let clock = ManualClock::new(epoch());
    let store = Arc::new(MokaStore::new(1_000));
    let executor = CachingExecutor::with_clock(
        store.clone(),
        config,
        Arc::new(clock.clone()),
    );
    let mock = Arc::new(MockChain::default());
    let chain: Arc<dyn Chain> = mock.clone();
    Harness { executor, store, mock, chain, clock }
}

fn get_parts(uri: &str, headers: &[(&str, &str)]) -> request::Parts {
    let mut builder = Request::get(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(()).unwrap().into_parts().0
}

impl Harness {
    /// Stores an entry as if fetched `age` ago.
    async fn preload(
        &self,
        uri: &str,
        request_headers: &[(&str, &str)],
        response_headers: &[(&str, &str)],
        body: &[u8],
        age: Duration,
    ) {
        let request = get_parts(uri, request_headers);
        let mut builder = Response::builder().status(200);
        for (name, value) in response_headers {
            builder = builder.header(*name, *value);
        }
        let response = builder.body(()).unwrap().into_parts().0;
        let stored_at = self.clock.now();
        self.store
            .store(
                &request,
                &response,
                Some(Bytes::copy_from_slice(body)),
                stored_at,
                stored_at,
            )
            .await
            .unwrap();
        self.clock.advance(age);
    }

    async fn run(
        &self,
        request: Request<RequestBody>,
    ) -> Result<(http::response::Parts, Bytes, ExchangeScope)> {
        let mut scope = ExchangeScope::new();
        let response =
            self.executor.execute(request, &mut scope, &self.chain).await?;
        let (parts, body) = response.into_parts();
        let bytes = body
            .collect()
            .await
            .map_err(HttpCacheError::io)?
            .to_bytes();
        Ok((parts, bytes, scope))
    }

    async fn get(
        &self,
        uri: &str,
        headers: &[(&str, &str)],
    ) -> (http::response::Parts, Bytes, ExchangeScope) {
        let mut builder = Request::get(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        self.run(builder.body(RequestBody::Empty).unwrap()).await.unwrap()
    }

    async fn stored_body(&self, uri: &str) -> Option<Vec<u8>> {
        let lookup =
            self.store.match_entry(&get_parts(uri, &[])).await.unwrap();
        lookup.hit.map(|hit| hit.entry.body().unwrap_or(&[]).to_vec())
    }
}

fn status_of(scope: &ExchangeScope) -> CacheResponseStatus {
    scope.attributes.cache_status().expect("status not set")
}

#[tokio::test]
async fn first_fetch_is_cached() {
    let h = harness(CacheConfig {
        max_object_size: 1_000_000,
        ..CacheConfig::default()
    });
    h.mock.respond(200, &[("cache-control", "max-age=60")], HELLO);

    let (parts, body, scope) = h.get("https://example.com/a", &[]).await;
    assert_eq!(parts.status, 200);
    assert_eq!(&body[..], HELLO);
    assert_eq!(status_of(&scope), CacheResponseStatus::CacheMiss);
    assert_eq!(h.mock.calls(), 1);
    assert_eq!(
        h.stored_body("https://example.com/a").await,
        Some(HELLO.to_vec())
    );
    assert_eq!(h.executor.stats().misses(), 1);
    assert_eq!(h.executor.stats().hits(), 0);
}

#[tokio::test]
async fn fresh_entry_served_without_origin() {
    let h = harness(CacheConfig::default());
    h.preload(
        "https://example.com/a",
        &[],
        &[("cache-control", "max-age=60")],
        HELLO,
        Duration::from_secs(5),
    )
    .await;

    let (parts, body, scope) = h.get("https://example.com/a", &[]).await;
    assert_eq!(parts.status, 200);
    assert_eq!(&body[..], HELLO);
    assert_eq!(status_of(&scope), CacheResponseStatus::CacheHit);
    assert_eq!(h.mock.calls(), 0);
    assert_eq!(h.executor.stats().hits(), 1);
}

#[tokio::test]
async fn stale_entry_revalidated_with_304() {
    let h = harness(CacheConfig::default());
    h.preload(
        "https://example.com/a",
        &[],
        &[("cache-control", "max-age=60"), ("etag", "\"v1\"")],
        HELLO,
        Duration::from_secs(120),
    )
    .await;
    h.mock.respond(304, &[("etag", "\"v1\"")], b"");

    let (parts, body, scope) = h.get("https://example.com/a", &[]).await;
    assert_eq!(parts.status, 200);
    assert_eq!(&body[..], HELLO);
    assert_eq!(status_of(&scope), CacheResponseStatus::Validated);
    assert_eq!(h.mock.calls(), 1);
    assert_eq!(
        h.mock.request(0).headers.get("if-none-match").unwrap(),
        "\"v1\""
    );
    assert_eq!(h.executor.stats().updates(), 1);
}

#[tokio::test]
async fn stale_revalidation_with_200_replaces_entry() {
    let h = harness(CacheConfig::default());
    h.preload(
        "https://example.com/a",
        &[],
        &[("cache-control", "max-age=60"), ("etag", "\"v1\"")],
        HELLO,
        Duration::from_secs(120),
    )
    .await;
    h.mock.respond(
        200,
        &[("cache-control", "max-age=60"), ("etag", "\"v2\"")],
        b"world",
    );

    let (parts, body, _scope) = h.get("https://example.com/a", &[]).await;
    assert_eq!(parts.status, 200);
    assert_eq!(&body[..], b"world");
    assert_eq!(
        h.stored_body("https://example.com/a").await,
        Some(b"world".to_vec())
    );
    assert_eq!(h.executor.stats().updates(), 1);
}

#[tokio::test]
async fn only_if_cached_miss_is_504_without_origin() {
    let h = harness(CacheConfig::default());
    let (parts, _body, scope) = h
        .get(
            "https://example.com/missing",
            &[("cache-control", "only-if-cached")],
        )
        .await;
    assert_eq!(parts.status, 504);
    assert_eq!(status_of(&scope), CacheResponseStatus::CacheModuleResponse);
    assert_eq!(h.mock.calls(), 0);
}

#[tokio::test]
async fn only_if_cached_with_unservable_stale_entry_is_504() {
    let h = harness(CacheConfig::default());
    h.preload(
        "https://example.com/a",
        &[],
        &[("cache-control", "max-age=60, must-revalidate")],
        HELLO,
        Duration::from_secs(120),
    )
    .await;

    let (parts, _body, scope) = h
        .get(
            "https://example.com/a",
            &[("cache-control", "only-if-cached")],
        )
        .await;
    assert_eq!(parts.status, 504);
    assert_eq!(status_of(&scope), CacheResponseStatus::CacheModuleResponse);
    assert_eq!(h.mock.calls(), 0);
}

#[tokio::test]
async fn uncacheable_request_goes_straight_to_origin() {
    let h = harness(CacheConfig::default());
    h.mock.respond(200, &[("cache-control", "max-age=60")], b"created");

    let request = Request::post("https://example.com/a")
        .body(RequestBody::Full(Bytes::from_static(b"payload")))
        .unwrap();
    let (parts, body, _scope) = h.run(request).await.unwrap();
    assert_eq!(parts.status, 200);
    assert_eq!(&body[..], b"created");
    assert_eq!(h.mock.calls(), 1);
    // no read was served and nothing was written
    assert_eq!(h.stored_body("https://example.com/a").await, None);
    assert_eq!(h.executor.stats().misses(), 0);
}

#[tokio::test]
async fn unsafe_method_invalidates_stored_entry() {
    let h = harness(CacheConfig::default());
    h.preload(
        "https://example.com/a",
        &[],
        &[("cache-control", "max-age=60")],
        HELLO,
        Duration::from_secs(1),
    )
    .await;
    h.mock.respond(204, &[], b"");

    let request = Request::delete("https://example.com/a")
        .body(RequestBody::Empty)
        .unwrap();
    let (parts, _body, _scope) = h.run(request).await.unwrap();
    assert_eq!(parts.status, 204);
    assert_eq!(h.stored_body("https://example.com/a").await, None);
}

#[tokio::test]
async fn oversized_content_length_passes_through_unstored() {
    let h = harness(CacheConfig {
        max_object_size: 8,
        ..CacheConfig::default()
    });
    let payload = b"0123456789abcdef";
    h.mock.respond(
        200,
        &[
            ("cache-control", "max-age=60"),
            ("content-length", "16"),
        ],
        payload,
    );

    let (parts, body, _scope) = h.get("https://example.com/big", &[]).await;
    assert_eq!(parts.status, 200);
    assert_eq!(&body[..], payload);
    assert_eq!(h.stored_body("https://example.com/big").await, None);
}

#[tokio::test]
async fn oversized_body_without_length_passes_through_unstored() {
    let h = harness(CacheConfig {
        max_object_size: 8,
        ..CacheConfig::default()
    });
    let payload = b"0123456789abcdef";
    h.mock.respond(200, &[("cache-control", "max-age=60")], payload);

    let (_parts, body, _scope) =
        h.get("https://example.com/big", &[]).await;
    // the client still sees the full bytes
    assert_eq!(&body[..], payload);
    assert_eq!(h.stored_body("https://example.com/big").await, None);
}

#[tokio::test]
async fn stale_if_error_absorbs_5xx() {
    let h = harness(CacheConfig {
        stale_if_error_enabled: true,
        ..CacheConfig::default()
    });
    h.preload(
        "https://example.com/a",
        &[],
        &[("cache-control", "max-age=60"), ("etag", "\"v1\"")],
        HELLO,
        Duration::from_secs(90),
    )
    .await;
    h.mock.respond(503, &[], b"unavailable");

    let (parts, body, scope) = h.get("https://example.com/a", &[]).await;
    assert_eq!(parts.status, 200);
    assert_eq!(&body[..], HELLO);
    assert_eq!(status_of(&scope), CacheResponseStatus::CacheModuleResponse);
    assert_eq!(h.mock.calls(), 1);
}

#[tokio::test]
async fn stale_if_error_does_not_absorb_4xx() {
    let h = harness(CacheConfig {
        stale_if_error_enabled: true,
        ..CacheConfig::default()
    });
    h.preload(
        "https://example.com/a",
        &[],
        &[("cache-control", "max-age=60"), ("etag", "\"v1\"")],
        HELLO,
        Duration::from_secs(90),
    )
    .await;
    h.mock.respond(404, &[], b"gone");

    let (parts, body, _scope) = h.get("https://example.com/a", &[]).await;
    assert_eq!(parts.status, 404);
    assert_eq!(&body[..], b"gone");
}

#[tokio::test]
async fn stale_if_error_absorbs_transport_failures() {
    let h = harness(CacheConfig {
        stale_if_error_enabled: true,
        ..CacheConfig::default()
    });
    h.preload(
        "https://example.com/a",
        &[],
        &[("cache-control", "max-age=60")],
        HELLO,
        Duration::from_secs(90),
    )
    .await;
    h.mock.fail_with_io();

    let (parts, body, scope) = h.get("https://example.com/a", &[]).await;
    assert_eq!(parts.status, 200);
    assert_eq!(&body[..], HELLO);
    assert_eq!(status_of(&scope), CacheResponseStatus::CacheModuleResponse);
}

#[tokio::test]
async fn expired_stale_if_error_window_yields_504() {
    let h = harness(CacheConfig {
        stale_if_error_enabled: true,
        stale_if_error_default: Duration::from_secs(10),
        ..CacheConfig::default()
    });
    h.preload(
        "https://example.com/a",
        &[],
        &[("cache-control", "max-age=60")],
        HELLO,
        Duration::from_secs(300),
    )
    .await;
    h.mock.fail_with_io();

    let (parts, _body, scope) = h.get("https://example.com/a", &[]).await;
    assert_eq!(parts.status, 504);
    assert_eq!(status_of(&scope), CacheResponseStatus::CacheModuleResponse);
}

#[tokio::test]
async fn required_revalidation_has_no_stale_fallback() {
    let h = harness(CacheConfig {
        stale_if_error_enabled: true,
        ..CacheConfig::default()
    });
    h.preload(
        "https://example.com/a",
        &[],
        &[("cache-control", "max-age=60, must-revalidate")],
        HELLO,
        Duration::from_secs(90),
    )
    .await;
    h.mock.fail_with_io();

    let (parts, _body, scope) = h.get("https://example.com/a", &[]).await;
    assert_eq!(parts.status, 504);
    assert_eq!(status_of(&scope), CacheResponseStatus::CacheModuleResponse);
    assert_eq!(h.mock.calls(), 1);
}

#[tokio::test]
async fn replica_responses_older_than_the_entry_are_discarded() {
    let h = harness(CacheConfig {
        freshness_check_enabled: true,
        ..CacheConfig::default()
    });
    let entry_date = httpdate::fmt_http_date(epoch());
    let replica_date =
        httpdate::fmt_http_date(epoch() - Duration::from_secs(3600));
    h.preload(
        "https://example.com/a",
        &[],
        &[
            ("cache-control", "max-age=60"),
            ("etag", "\"v1\""),
            ("date", &entry_date),
        ],
        HELLO,
        Duration::from_secs(120),
    )
    .await;
    // both the conditional answer and the reload come from a replica
    // whose Date predates the stored entry
    for _ in 0..2 {
        h.mock.respond(
            200,
            &[("cache-control", "max-age=60"), ("date", &replica_date)],
            b"old world",
        );
    }

    let (parts, body, _scope) = h.get("https://example.com/a", &[]).await;
    assert_eq!(parts.status, 200);
    assert_eq!(&body[..], b"old world");
    assert_eq!(h.mock.calls(), 2);
    let reload = h.mock.request(1);
    assert!(reload.headers.get("if-none-match").is_none());
    assert_eq!(reload.headers.get("cache-control").unwrap(), "no-cache");
    // the fresher stored entry was not overwritten
    assert_eq!(
        h.stored_body("https://example.com/a").await,
        Some(HELLO.to_vec())
    );
}

#[tokio::test]
async fn stale_while_revalidate_serves_and_schedules_once() {
    let h = harness(CacheConfig::default());
    let executor = CachingExecutor::with_clock(
        h.store.clone(),
        CacheConfig::default(),
        Arc::new(h.clock.clone()),
    )
    .with_revalidator(AsyncRevalidator::new(Handle::current()));
    h.preload(
        "https://example.com/a",
        &[],
        &[
            ("cache-control", "max-age=60, stale-while-revalidate=30"),
            ("etag", "\"v1\""),
        ],
        HELLO,
        Duration::from_secs(65),
    )
    .await;
    h.mock.respond(304, &[("etag", "\"v1\"")], b"");

    let request = Request::get("https://example.com/a")
        .body(RequestBody::Empty)
        .unwrap();
    let mut scope = ExchangeScope::new();
    let response =
        executor.execute(request, &mut scope, &h.chain).await.unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], HELLO);
    assert_eq!(status_of(&scope), CacheResponseStatus::CacheModuleResponse);
    // the stale body was returned before the revalidation ran
    assert!(h.mock.calls() <= 1);

    // a second request does not schedule a second task; the single
    // scripted 304 is the only origin exchange that ever happens
    let request = Request::get("https://example.com/a")
        .body(RequestBody::Empty)
        .unwrap();
    let mut scope = ExchangeScope::new();
    let response =
        executor.execute(request, &mut scope, &h.chain).await.unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], HELLO);

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while h.mock.calls() < 1 && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.mock.calls(), 1);
    let conditional = h.mock.request(0);
    assert_eq!(
        conditional.headers.get("if-none-match").unwrap(),
        "\"v1\""
    );
}

#[tokio::test]
async fn variant_negotiation_selects_matching_etag() {
    let h = harness(CacheConfig::default());
    h.preload(
        "https://example.com/a",
        &[("accept-encoding", "gzip")],
        &[
            ("cache-control", "max-age=60"),
            ("vary", "Accept-Encoding"),
            ("etag", "\"gz\""),
        ],
        b"gzip body",
        Duration::ZERO,
    )
    .await;
    h.preload(
        "https://example.com/a",
        &[],
        &[
            ("cache-control", "max-age=60"),
            ("vary", "Accept-Encoding"),
            ("etag", "\"id\""),
        ],
        b"identity body",
        Duration::ZERO,
    )
    .await;
    h.mock.respond(304, &[("etag", "\"gz\"")], b"");

    let (parts, body, scope) = h
        .get("https://example.com/a", &[("accept-encoding", "br")])
        .await;
    assert_eq!(parts.status, 200);
    assert_eq!(&body[..], b"gzip body");
    assert_eq!(status_of(&scope), CacheResponseStatus::Validated);
    assert_eq!(h.executor.stats().updates(), 1);
    assert_eq!(h.mock.calls(), 1);
    let negotiation = h.mock.request(0);
    assert_eq!(
        negotiation.headers.get("if-none-match").unwrap(),
        "\"gz\", \"id\""
    );

    // the selected variant now answers this accept-encoding directly
    let (_parts, body, scope) = h
        .get("https://example.com/a", &[("accept-encoding", "br")])
        .await;
    assert_eq!(&body[..], b"gzip body");
    assert_eq!(status_of(&scope), CacheResponseStatus::CacheHit);
}

#[tokio::test]
async fn variant_negotiation_unknown_etag_reloads_unconditionally() {
    let h = harness(CacheConfig::default());
    h.preload(
        "https://example.com/a",
        &[("accept-encoding", "gzip")],
        &[
            ("cache-control", "max-age=60"),
            ("vary", "Accept-Encoding"),
            ("etag", "\"gz\""),
        ],
        b"gzip body",
        Duration::ZERO,
    )
    .await;
    h.mock.respond(304, &[("etag", "\"mystery\"")], b"");
    h.mock.respond(
        200,
        &[("cache-control", "max-age=60"), ("etag", "\"new\"")],
        b"fresh body",
    );

    let (parts, body, _scope) = h
        .get("https://example.com/a", &[("accept-encoding", "br")])
        .await;
    assert_eq!(parts.status, 200);
    assert_eq!(&body[..], b"fresh body");
    assert_eq!(h.mock.calls(), 2);
    let reload = h.mock.request(1);
    assert!(reload.headers.get("if-none-match").is_none());
    assert_eq!(reload.headers.get("cache-control").unwrap(), "no-cache");
    assert_eq!(h.executor.stats().misses(), 1);
}

#[tokio::test]
async fn variant_negotiation_answered_with_200_counts_a_miss() {
    let h = harness(CacheConfig::default());
    h.preload(
        "https://example.com/a",
        &[("accept-encoding", "gzip")],
        &[
            ("cache-control", "max-age=60"),
            ("vary", "Accept-Encoding"),
            ("etag", "\"gz\""),
        ],
        b"gzip body",
        Duration::ZERO,
    )
    .await;
    h.mock.respond(
        200,
        &[
            ("cache-control", "max-age=60"),
            ("vary", "Accept-Encoding"),
            ("etag", "\"br\""),
        ],
        b"br body",
    );

    let (parts, body, scope) = h
        .get("https://example.com/a", &[("accept-encoding", "br")])
        .await;
    assert_eq!(parts.status, 200);
    assert_eq!(&body[..], b"br body");
    assert_eq!(status_of(&scope), CacheResponseStatus::CacheMiss);
    assert_eq!(h.mock.calls(), 1);
    assert_eq!(h.executor.stats().misses(), 1);
    assert_eq!(h.executor.stats().updates(), 0);
}

#[tokio::test]
async fn client_conditional_304_on_miss_stores_and_synthesizes() {
    let h = harness(CacheConfig::default());
    let since = "Tue, 01 Jul 2025 12:00:00 GMT";
    h.mock.respond(304, &[], b"");

    let (parts, body, scope) = h
        .get("https://example.com/a", &[("if-modified-since", since)])
        .await;
    assert_eq!(parts.status, 304);
    assert!(body.is_empty());
    assert_eq!(status_of(&scope), CacheResponseStatus::CacheModuleResponse);
    // the synthetic validator stays in the store, not in the response
    assert!(parts.headers.get("last-modified").is_none());
    let lookup =
        h.store.match_entry(&get_parts("https://example.com/a", &[])).await.unwrap();
    let entry = lookup.hit.unwrap().entry;
    assert_eq!(entry.status, 304);
    assert_eq!(
        entry.last_modified(),
        Some(httpdate::parse_http_date(since).unwrap())
    );
}

#[tokio::test]
async fn stored_304_entry_requires_a_conditional_request() {
    let h = harness(CacheConfig::default());
    let since = "Tue, 01 Jul 2025 12:00:00 GMT";
    h.mock.respond(304, &[], b"");
    h.get("https://example.com/a", &[("if-modified-since", since)]).await;

    // a plain request cannot be answered from the body-less 304 entry
    h.mock.respond(200, &[("cache-control", "max-age=60")], HELLO);
    let (parts, body, _scope) = h.get("https://example.com/a", &[]).await;
    assert_eq!(parts.status, 200);
    assert_eq!(&body[..], HELLO);
    assert_eq!(h.mock.calls(), 2);
    assert_eq!(
        h.stored_body("https://example.com/a").await,
        Some(HELLO.to_vec())
    );
}

#[tokio::test]
async fn stored_304_entry_with_failing_conditionals_goes_to_origin() {
    let h = harness(CacheConfig::default());
    let since = "Tue, 01 Jul 2025 12:00:00 GMT";
    h.mock.respond(304, &[], b"");
    h.get("https://example.com/a", &[("if-modified-since", since)]).await;

    // validators that the body-less entry does not satisfy must get the
    // full representation, not a synthesized 304
    let earlier = "Tue, 01 Jul 2025 10:00:00 GMT";
    h.mock.respond(200, &[("cache-control", "max-age=60")], HELLO);
    let (parts, body, _scope) = h
        .get("https://example.com/a", &[("if-modified-since", earlier)])
        .await;
    assert_eq!(parts.status, 200);
    assert_eq!(&body[..], HELLO);
    assert_eq!(h.mock.calls(), 2);
}

#[tokio::test]
async fn head_request_served_from_get_entry_without_body() {
    let h = harness(CacheConfig::default());
    h.preload(
        "https://example.com/a",
        &[],
        &[("cache-control", "max-age=60")],
        HELLO,
        Duration::from_secs(5),
    )
    .await;
    // HEAD keys differently, so this goes to the origin
    h.mock.respond(200, &[("cache-control", "max-age=60")], b"");

    let request = Request::head("https://example.com/a")
        .body(RequestBody::Empty)
        .unwrap();
    let (parts, body, _scope) = h.run(request).await.unwrap();
    assert_eq!(parts.status, 200);
    assert!(body.is_empty());
}

#[tokio::test]
async fn conditional_client_request_on_fresh_entry_gets_304() {
    let h = harness(CacheConfig::default());
    h.preload(
        "https://example.com/a",
        &[],
        &[("cache-control", "max-age=60"), ("etag", "\"v1\"")],
        HELLO,
        Duration::from_secs(5),
    )
    .await;

    let (parts, body, scope) = h
        .get("https://example.com/a", &[("if-none-match", "\"v1\"")])
        .await;
    assert_eq!(parts.status, 304);
    assert!(body.is_empty());
    assert_eq!(status_of(&scope), CacheResponseStatus::CacheHit);
    assert_eq!(h.mock.calls(), 0);
}

#[tokio::test]
async fn options_asterisk_with_max_forwards_zero_is_intercepted() {
    let h = harness(CacheConfig::default());
    let request = Request::options("*")
        .header("max-forwards", "0")
        .body(RequestBody::Empty)
        .unwrap();
    let (parts, _body, scope) = h.run(request).await.unwrap();
    assert_eq!(parts.status, 501);
    assert_eq!(status_of(&scope), CacheResponseStatus::CacheModuleResponse);
    assert_eq!(h.mock.calls(), 0);
}

#[tokio::test]
async fn chain_failure_without_entry_propagates_as_failure() {
    let h = harness(CacheConfig::default());
    h.mock.fail_with_io();

    let request = Request::get("https://example.com/a")
        .body(RequestBody::Empty)
        .unwrap();
    let mut scope = ExchangeScope::new();
    let result = h.executor.execute(request, &mut scope, &h.chain).await;
    assert!(result.is_err());
    assert_eq!(
        scope.attributes.cache_status(),
        Some(CacheResponseStatus::Failure)
    );
}

#[tokio::test]
async fn scope_records_request_and_response() {
    let h = harness(CacheConfig::default());
    h.mock.respond(200, &[("cache-control", "max-age=60")], HELLO);

    let (_parts, _body, scope) = h.get("https://example.com/a", &[]).await;
    assert_eq!(
        scope.attributes.request().unwrap().uri.to_string(),
        "https://example.com/a"
    );
    assert_eq!(scope.attributes.response().unwrap().status, 200);
}
