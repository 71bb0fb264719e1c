//! Request and response body types.
//!
//! Responses flowing through the executor are either buffered (served from
//! a stored entry), streamed through from the origin, or composite: the
//! prefix a bounded drain already consumed followed by the unread remainder
//! of the origin stream. Dropping any variant releases the underlying
//! stream, which is what keeps the close-on-every-exit-path invariant.

// Note: pin_project_lite does not support doc comments on enum variants,
// so we allow missing_docs for the generated variants and fields. The
// module-level and enum-level documentation provides full coverage.
#![allow(missing_docs)]

use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use http_body::{Body, Frame};
use http_body_util::BodyExt;
use pin_project_lite::pin_project;

use crate::error::{BoxError, HttpCacheError, Result};

/// Boxed body type used at the chain seam.
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

pin_project! {
    /// Response body handled by the executor.
    ///
    /// # Variants
    ///
    /// - **Buffered**: bytes served from a stored entry
    /// - **Streaming**: pass-through of an origin stream
    /// - **Composite**: bytes consumed by an overflowing bounded drain,
    ///   followed by the unread remainder of the origin stream
    #[project = CacheBodyProj]
    pub enum CacheBody {
        Buffered {
            data: Option<Bytes>,
        },
        Streaming {
            #[pin]
            inner: BoxBody,
        },
        Composite {
            prefix: Option<Bytes>,
            #[pin]
            rest: BoxBody,
        },
    }
}

impl CacheBody {
    /// Creates a buffered body from bytes.
    #[must_use]
    pub fn buffered(data: Bytes) -> Self {
        Self::Buffered { data: Some(data) }
    }

    /// Creates an empty buffered body.
    #[must_use]
    pub fn empty() -> Self {
        Self::Buffered { data: None }
    }

    /// Wraps an origin stream without additional buffering.
    #[must_use]
    pub fn streaming(body: BoxBody) -> Self {
        Self::Streaming { inner: body }
    }
}

impl Body for CacheBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>>
    {
        match self.as_mut().project() {
            CacheBodyProj::Buffered { data } => match data.take() {
                Some(bytes) if !bytes.is_empty() => {
                    Poll::Ready(Some(Ok(Frame::data(bytes))))
                }
                _ => Poll::Ready(None),
            },
            CacheBodyProj::Streaming { inner } => inner.poll_frame(cx),
            CacheBodyProj::Composite { prefix, rest } => {
                if let Some(bytes) = prefix.take() {
                    if !bytes.is_empty() {
                        return Poll::Ready(Some(Ok(Frame::data(bytes))));
                    }
                }
                rest.poll_frame(cx)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            Self::Buffered { data } => data.is_none(),
            Self::Streaming { inner } => inner.is_end_stream(),
            Self::Composite { prefix, rest } => {
                prefix.is_none() && rest.is_end_stream()
            }
        }
    }

    fn size_hint(&self) -> http_body::SizeHint {
        match self {
            Self::Buffered { data } => http_body::SizeHint::with_exact(
                data.as_ref().map_or(0, |b| b.len() as u64),
            ),
            Self::Streaming { inner } => inner.size_hint(),
            Self::Composite { prefix, rest } => {
                let mut hint = rest.size_hint();
                let prefix_len =
                    prefix.as_ref().map_or(0, |b| b.len() as u64);
                hint.set_lower(hint.lower() + prefix_len);
                if let Some(upper) = hint.upper() {
                    hint.set_upper(upper + prefix_len);
                }
                hint
            }
        }
    }
}

impl From<Bytes> for CacheBody {
    fn from(bytes: Bytes) -> Self {
        Self::buffered(bytes)
    }
}

impl fmt::Debug for CacheBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffered { data } => f
                .debug_struct("CacheBody::Buffered")
                .field("len", &data.as_ref().map(Bytes::len))
                .finish(),
            Self::Streaming { .. } => {
                f.debug_struct("CacheBody::Streaming").finish_non_exhaustive()
            }
            Self::Composite { prefix, .. } => f
                .debug_struct("CacheBody::Composite")
                .field("prefix_len", &prefix.as_ref().map(Bytes::len))
                .finish_non_exhaustive(),
        }
    }
}

/// Request body handed to the downstream chain.
#[derive(Debug)]
pub enum RequestBody {
    /// No body (the usual case for GET/HEAD).
    Empty,
    /// A fully buffered, replayable body.
    Full(Bytes),
    /// A one-shot stream. Cannot be replayed for revalidation.
    Streaming(BoxBody),
}

impl RequestBody {
    /// Whether the executor may send this body more than once.
    #[must_use]
    pub fn is_repeatable(&self) -> bool {
        !matches!(self, Self::Streaming(_))
    }

    /// Whether a body is present at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Clones the body when it is replayable.
    #[must_use]
    pub fn try_clone(&self) -> Option<Self> {
        match self {
            Self::Empty => Some(Self::Empty),
            Self::Full(bytes) => Some(Self::Full(bytes.clone())),
            Self::Streaming(_) => None,
        }
    }
}

impl Default for RequestBody {
    fn default() -> Self {
        Self::Empty
    }
}

/// Outcome of a bounded drain.
pub(crate) enum Drained {
    /// The whole body fit inside the bound.
    Complete(Bytes),
    /// The bound was exceeded mid-read; the returned body replays the
    /// consumed prefix and continues with the unread remainder.
    Overflow(CacheBody),
}

/// Reads a body into memory up to `limit` bytes.
///
/// Body stream failures map to transport errors; the caller decides
/// whether a stale entry may absorb them.
pub(crate) async fn drain_limited(
    body: CacheBody,
    limit: u64,
) -> Result<Drained> {
    let (prefix, rest) = match body {
        CacheBody::Buffered { data } => {
            let bytes = data.unwrap_or_default();
            return if bytes.len() as u64 <= limit {
                Ok(Drained::Complete(bytes))
            } else {
                Ok(Drained::Overflow(CacheBody::buffered(bytes)))
            };
        }
        CacheBody::Streaming { inner } => (Bytes::new(), inner),
        CacheBody::Composite { prefix, rest } => {
            (prefix.unwrap_or_default(), rest)
        }
    };

    let mut collected = BytesMut::from(&prefix[..]);
    let mut rest = rest;
    if collected.len() as u64 > limit {
        return Ok(Drained::Overflow(CacheBody::Composite {
            prefix: Some(collected.freeze()),
            rest,
        }));
    }
    while let Some(frame) = rest.frame().await {
        let frame = frame.map_err(HttpCacheError::io)?;
        if let Ok(data) = frame.into_data() {
            collected.extend_from_slice(&data);
            if collected.len() as u64 > limit {
                return Ok(Drained::Overflow(CacheBody::Composite {
                    prefix: Some(collected.freeze()),
                    rest,
                }));
            }
        }
    }
    Ok(Drained::Complete(collected.freeze()))
}

/// Consumes and discards whatever remains of a body, ignoring stream
/// errors. Used when a stale entry replaces an origin error response.
pub(crate) async fn drain_discard(body: CacheBody) {
    let mut body = body;
    while let Some(frame) = body.frame().await {
        if frame.is_err() {
            break;
        }
    }
}
