use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::conditional::if_match_get_tokens;
use crate::errors::DavResult;
use crate::fs::FsError;

impl crate::DavHandler {
    pub(crate) async fn handle_mkcol(&self, req: &Request<()>) -> DavResult<Response<Body>> {
        let mut path = self.path(req)?;
        let meta = self.fs.metadata(&path).await.ok();

        let tokens = match if_match_get_tokens(req, meta.as_ref(), &self.fs, self.ls.as_ref(), &path).await {
            Ok(t) => t,
            Err(s) => return Err(s.into()),
        };

        // MKCOL on an existing resource.
        if meta.is_some() {
            return Err(StatusCode::METHOD_NOT_ALLOWED.into());
        }
        if !self.has_parent(&path).await {
            return Err(StatusCode::CONFLICT.into());
        }

        // creating a member of a locked collection needs the token.
        if let Err(res) = self.check_member_locks(&path, false, &tokens) {
            return Ok(res);
        }

        match self.fs.create_dir(&path).await {
            // RFC 4918 9.3.1 MKCOL Status Codes.
            Err(FsError::Exists) => return Err(StatusCode::METHOD_NOT_ALLOWED.into()),
            Err(FsError::NotFound) => return Err(StatusCode::CONFLICT.into()),
            Err(e) => return Err(e.into()),
            Ok(()) => {}
        }

        let mut res = Response::new(Body::empty());
        if !path.is_collection() {
            path.add_slash();
            res.headers_mut()
                .typed_insert(crate::davheaders::ContentLocation(path.as_url_string_with_prefix()));
        }
        *res.status_mut() = StatusCode::CREATED;
        res.headers_mut().typed_insert(headers::ContentLength(0));
        Ok(res)
    }
}
