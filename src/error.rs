use thiserror::Error;

/// Generic boxed error type used at the chain and body seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A `Result` typedef to use with the [`HttpCacheError`] type
pub type Result<T> = std::result::Result<T, HttpCacheError>;

/// Errors surfaced by the cache executor.
///
/// The executor reacts differently to the failure origin: transport I/O
/// failures during revalidation become 504s (or stale responses when
/// `stale-if-error` applies), store failures during a cache read fall
/// through to the origin, and downstream protocol errors propagate as-is.
#[derive(Error, Debug)]
pub enum HttpCacheError {
    /// The downstream chain rejected the exchange at the protocol level
    #[error("downstream protocol error: {0}")]
    Protocol(#[source] BoxError),
    /// Transport-level I/O failure while talking to the origin
    #[error("transport failure: {0}")]
    Io(#[source] BoxError),
    /// The cache store failed to read or write an entry
    #[error("cache store failure: {0}")]
    Store(#[source] BoxError),
    /// Error from http
    #[error(transparent)]
    Http(#[from] http::Error),
    /// There was an error converting a header to a string
    #[error(transparent)]
    HeaderToStr(#[from] http::header::ToStrError),
    /// There was an error parsing an HTTP header value
    #[error(transparent)]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
    /// There was an error parsing an HTTP header name
    #[error(transparent)]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),
    /// There was an error parsing the HTTP status code
    #[error(transparent)]
    InvalidStatusCode(#[from] http::status::InvalidStatusCode),
    /// There was an error parsing the HTTP version
    #[error("Unknown HTTP version")]
    BadVersion,
}

impl HttpCacheError {
    /// Wraps a transport-level failure.
    pub fn io<E: Into<BoxError>>(err: E) -> Self {
        Self::Io(err.into())
    }

    /// Wraps a store failure.
    pub fn store<E: Into<BoxError>>(err: E) -> Self {
        Self::Store(err.into())
    }

    /// Wraps a downstream protocol failure.
    pub fn protocol<E: Into<BoxError>>(err: E) -> Self {
        Self::Protocol(err.into())
    }

    /// `true` for transport-level failures, the class `stale-if-error`
    /// may absorb.
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// `true` for store read/write failures.
    #[must_use]
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}
