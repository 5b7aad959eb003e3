//! Request and response bodies.
//!
//! Handlers answer with a [`Body`]: nothing, one buffer (XML replies,
//! error bodies) or a stream of chunks (file contents, PROPFIND output
//! that is produced while the tree is walked).

use std::error::Error as StdError;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use futures_util::stream::{BoxStream, Stream};
use http::header::HeaderMap;
use http_body::{Body as HttpBody, SizeHint};
use pin_project::pin_project;

/// Response body. Implements both `Stream` and `http_body::Body`.
pub struct Body {
    kind: Kind,
}

enum Kind {
    Empty,
    Full(Bytes),
    Chunks(BoxStream<'static, io::Result<Bytes>>),
}

impl Body {
    /// An empty body.
    pub fn empty() -> Body {
        Body { kind: Kind::Empty }
    }

    /// A body that is produced chunk by chunk.
    pub fn stream(stream: impl Stream<Item = io::Result<Bytes>> + Send + 'static) -> Body {
        Body {
            kind: Kind::Chunks(Box::pin(stream)),
        }
    }

    /// Length of the body, if known without polling it.
    pub fn len(&self) -> Option<u64> {
        match &self.kind {
            Kind::Empty => Some(0),
            Kind::Full(b) => Some(b.len() as u64),
            Kind::Chunks(_) => None,
        }
    }

    /// True if the body is known to be empty.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

impl Stream for Body {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        if let Kind::Chunks(stream) = &mut self.kind {
            return stream.as_mut().poll_next(cx);
        }
        match std::mem::replace(&mut self.kind, Kind::Empty) {
            Kind::Full(b) if !b.is_empty() => Poll::Ready(Some(Ok(b))),
            _ => Poll::Ready(None),
        }
    }
}

impl HttpBody for Body {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_data(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Result<Bytes, io::Error>>> {
        self.poll_next(cx)
    }

    fn poll_trailers(
        self: Pin<&mut Self>,
        _cx: &mut Context,
    ) -> Poll<Result<Option<HeaderMap>, io::Error>> {
        Poll::Ready(Ok(None))
    }

    fn is_end_stream(&self) -> bool {
        matches!(self.kind, Kind::Empty)
    }

    fn size_hint(&self) -> SizeHint {
        match self.len() {
            Some(n) => SizeHint::with_exact(n),
            None => SizeHint::default(),
        }
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Body {
        Body { kind: Kind::Full(b) }
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Body {
        Body::from(Bytes::from(v))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Body {
        Body::from(Bytes::from(s))
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Body {
        Body::from(Bytes::copy_from_slice(s.as_bytes()))
    }
}

/// Adapts a `Stream` of request chunks to `http_body::Body`, so that
/// `DavHandler::handle_stream` can share the request path of `handle`.
#[pin_project]
pub(crate) struct StreamBody<S> {
    #[pin]
    chunks: S,
}

impl<S> StreamBody<S> {
    pub(crate) fn new(chunks: S) -> StreamBody<S> {
        StreamBody { chunks }
    }
}

impl<S, D, E> HttpBody for StreamBody<S>
where
    S: Stream<Item = Result<D, E>>,
    D: Buf + Send,
    E: StdError + Send + Sync + 'static,
{
    type Data = D;
    type Error = E;

    fn poll_data(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<D, E>>> {
        self.project().chunks.poll_next(cx)
    }

    fn poll_trailers(self: Pin<&mut Self>, _cx: &mut Context) -> Poll<Result<Option<HeaderMap>, E>> {
        Poll::Ready(Ok(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, StreamExt};

    #[tokio::test]
    async fn test_full_body() {
        let mut b = Body::from("hello");
        assert_eq!(b.len(), Some(5));
        assert_eq!(HttpBody::size_hint(&b).exact(), Some(5));
        assert_eq!(b.next().await.unwrap().unwrap(), Bytes::from_static(b"hello"));
        assert!(b.next().await.is_none());
        assert!(b.is_empty());
    }

    #[tokio::test]
    async fn test_empty_and_stream() {
        let mut b = Body::empty();
        assert!(HttpBody::is_end_stream(&b));
        assert!(b.next().await.is_none());

        let chunks = vec![Ok(Bytes::from_static(b"a")), Ok(Bytes::from_static(b"b"))];
        let b = Body::stream(stream::iter(chunks));
        assert_eq!(b.len(), None);
        let all: Vec<_> = b.map(|c| c.unwrap()).collect().await;
        assert_eq!(all.concat(), b"ab");
    }
}
