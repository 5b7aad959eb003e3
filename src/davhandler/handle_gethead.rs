use std::io;
use std::ops::Bound;

use bytes::Bytes;
use headers::HeaderMapExt;
use http::{status::StatusCode, Request, Response};

use crate::body::Body;
use crate::conditional;
use crate::errors::DavResult;
use crate::fs::*;

pub(crate) const READ_BUF_SIZE: usize = 16384;

impl crate::DavHandler {
    pub(crate) async fn handle_get(&self, req: &Request<()>) -> DavResult<Response<Body>> {
        let head = req.method() == http::Method::HEAD;
        let mut path = self.path(req)?;

        // check if it's a directory.
        let meta = self.fs.metadata(&path).await?;
        if meta.is_dir() {
            // listings are served as PROPFIND by the host.
            debug!("GET on collection {path}");
            let mut res = Response::new(Body::empty());
            *res.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
            res.headers_mut().typed_insert(headers::ContentLength(0));
            res.headers_mut().insert(
                "allow",
                http::HeaderValue::from_static("OPTIONS,PROPFIND,PROPPATCH,COPY,MOVE,DELETE,LOCK,UNLOCK"),
            );
            return Ok(res);
        }

        let mut res = Response::new(Body::empty());
        let meta = self.fixpath(&mut res, &mut path, meta);
        let len = meta.len();

        // HTTP preconditions. The If: header is irrelevant for reads.
        if let Some(s) = conditional::http_if_match(req, Some(&meta)) {
            *res.status_mut() = s;
            if s == StatusCode::NOT_MODIFIED {
                set_entity_headers(&mut res, &meta);
            }
            res.headers_mut().typed_insert(headers::ContentLength(0));
            return Ok(res);
        }

        set_entity_headers(&mut res, &meta);
        res.headers_mut().typed_insert(headers::AcceptRanges::bytes());
        res.headers_mut().insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static(path.get_mime_type_str()),
        );

        // see if we need to serve a range.
        let mut start = 0;
        let mut count = len;
        if let Some(range) = req.headers().typed_get::<headers::Range>() {
            if conditional::ifrange_match(req, &meta) {
                let ranges = range.iter().collect::<Vec<_>>();
                // several ranges are served as the full entity.
                if ranges.len() == 1 {
                    match resolve_range(ranges[0], len) {
                        Some((s, e)) => {
                            start = s;
                            count = e - s + 1;
                            if let Ok(cr) = headers::ContentRange::bytes(s..=e, len) {
                                res.headers_mut().typed_insert(cr);
                            }
                            *res.status_mut() = StatusCode::PARTIAL_CONTENT;
                        }
                        None => {
                            debug!("GET {path}: range not satisfiable (len {len})");
                            *res.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
                            res.headers_mut()
                                .typed_insert(headers::ContentRange::unsatisfied_bytes(len));
                            res.headers_mut().typed_insert(headers::ContentLength(0));
                            return Ok(res);
                        }
                    }
                }
            }
        }
        res.headers_mut().typed_insert(headers::ContentLength(count));

        if head || count == 0 {
            return Ok(res);
        }

        let mut file = self.fs.open(&path, OpenOptions::read()).await?;
        if start > 0 {
            file.seek(io::SeekFrom::Start(start)).await?;
        }

        let read_buf_size = self.read_buf_size;
        *res.body_mut() = Body::stream(async_stream::try_stream! {
            let mut left = count;
            while left > 0 {
                let n = std::cmp::min(left, read_buf_size as u64) as usize;
                let buf: Bytes = file.read_bytes(n).await.map_err(io::Error::from)?;
                if buf.is_empty() {
                    // file shrunk underneath us.
                    Err::<(), _>(io::Error::new(io::ErrorKind::UnexpectedEof, "short read"))?;
                }
                left -= buf.len() as u64;
                yield buf;
            }
        });

        Ok(res)
    }
}

fn set_entity_headers(res: &mut Response<Body>, meta: &Box<dyn DavMetaData>) {
    if let Some(etag) = conditional::etag(meta) {
        res.headers_mut().typed_insert(etag);
    }
    if let Ok(modified) = meta.modified() {
        res.headers_mut().typed_insert(headers::LastModified::from(modified));
    }
}

// Turn a byte range into inclusive (start, end) offsets, or None if it
// cannot be satisfied for an entity of length `len`.
fn resolve_range(range: (Bound<u64>, Bound<u64>), len: u64) -> Option<(u64, u64)> {
    if len == 0 {
        return None;
    }
    let (start, end) = match range {
        // suffix range: the last N bytes.
        (Bound::Unbounded, Bound::Included(n)) => {
            if n == 0 {
                return None;
            }
            (len.saturating_sub(n), len - 1)
        }
        (Bound::Included(s), Bound::Unbounded) => (s, len - 1),
        (Bound::Included(s), Bound::Included(e)) => (s, std::cmp::min(e, len - 1)),
        _ => return None,
    };
    if start >= len || start > end {
        return None;
    }
    Some((start, end))
}
