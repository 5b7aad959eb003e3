use std::error::Error as StdError;
use std::io;

use bytes::{Buf, Bytes};
use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};
use http_body::Body as HttpBody;

use crate::body::Body;
use crate::conditional::{self, if_match_get_tokens};
use crate::errors::{DavError, DavResult};
use crate::fs::*;

impl crate::DavHandler {
    pub(crate) async fn handle_put<ReqBody, ReqData, ReqError>(
        &self,
        req: &Request<()>,
        body: ReqBody,
    ) -> DavResult<Response<Body>>
    where
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
    {
        let path = self.path(req)?;
        if path.is_collection() {
            return Err(StatusCode::METHOD_NOT_ALLOWED.into());
        }
        let meta = self.fs.metadata(&path).await.ok();
        if meta.as_ref().is_some_and(|m| m.is_dir()) {
            return Err(StatusCode::METHOD_NOT_ALLOWED.into());
        }

        // the parent must be an existing collection.
        if !self.has_parent(&path).await {
            debug!("PUT {path}: parent is missing or not a collection");
            return Err(StatusCode::CONFLICT.into());
        }

        // If: and If-* headers, then the locks.
        let tokens = match if_match_get_tokens(req, meta.as_ref(), &self.fs, self.ls.as_ref(), &path).await {
            Ok(t) => t,
            Err(s) => return Err(s.into()),
        };
        let locked = if meta.is_some() {
            self.check_locks(&path, false, &tokens)
        } else {
            self.check_member_locks(&path, false, &tokens)
        };
        if let Err(res) = locked {
            return Ok(res);
        }

        // Content-Range: on a PUT is a partial update.
        let range = match req.headers().typed_try_get::<headers::ContentRange>() {
            Ok(Some(cr)) => match cr.bytes_range() {
                Some(r) => Some(r),
                None => return Err(StatusCode::BAD_REQUEST.into()),
            },
            Ok(None) => None,
            Err(_) => return Err(StatusCode::BAD_REQUEST.into()),
        };

        let mut oo = OpenOptions::write();
        oo.create = true;
        oo.truncate = range.is_none();

        let mut file = match range {
            // the whole range is read before the file is touched, so a
            // body of the wrong length changes nothing.
            Some((start, end)) => {
                let want = end - start + 1;
                let data = match self.read_request(body, want as usize).await {
                    Ok(data) => data,
                    Err(e) if e.statuscode() == StatusCode::PAYLOAD_TOO_LARGE => {
                        debug!("PUT {path}: more than the {want} bytes of Content-Range");
                        return Err(StatusCode::BAD_REQUEST.into());
                    }
                    Err(e) => return Err(e),
                };
                if data.len() as u64 != want {
                    debug!("PUT {path}: Content-Range says {want} bytes, got {}", data.len());
                    return Err(StatusCode::BAD_REQUEST.into());
                }
                let mut file = self.fs.open(&path, oo).await?;
                file.seek(io::SeekFrom::Start(start)).await?;
                file.write_bytes(Bytes::from(data)).await?;
                file
            }
            None => {
                let mut file = self.fs.open(&path, oo).await?;
                pin_utils::pin_mut!(body);
                while let Some(data) = body.data().await {
                    let mut buf = data.map_err(|e| {
                        debug!("PUT {path}: reading body: {e}");
                        DavError::IoError(io::Error::new(io::ErrorKind::UnexpectedEof, "UnexpectedEof"))
                    })?;
                    let n = buf.remaining();
                    if n > 0 {
                        file.write_bytes(buf.copy_to_bytes(n)).await?;
                    }
                }
                file
            }
        };
        file.flush().await?;

        let mut res = Response::new(Body::empty());
        *res.status_mut() = if meta.is_some() {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::CREATED
        };
        res.headers_mut().typed_insert(headers::ContentLength(0));
        if let Ok(m) = file.metadata().await {
            if let Some(etag) = conditional::etag(&m) {
                res.headers_mut().typed_insert(etag);
            }
        }
        Ok(res)
    }
}
