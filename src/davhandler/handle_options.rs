use headers::HeaderMapExt;
use http::{HeaderValue, Request, Response};

use crate::body::Body;
use crate::errors::DavResult;
use crate::util::{DavMethod, METHODS};

impl crate::DavHandler {
    pub(crate) async fn handle_options(&self, req: &Request<()>) -> DavResult<Response<Body>> {
        let mut res = Response::new(Body::empty());

        // compliance class 2 only when there is a locksystem.
        let dav = if self.ls.is_some() { "1,2" } else { "1" };
        let h = res.headers_mut();
        h.insert("DAV", HeaderValue::from_static(dav));
        h.insert("MS-Author-Via", HeaderValue::from_static("DAV"));
        h.typed_insert(headers::ContentLength(0));

        let path = self.path(req)?;
        let is_star = path.is_star();
        let meta = if is_star {
            None
        } else {
            self.fs.metadata(&path).await.ok()
        };

        // which methods make sense on this resource.
        let applicable = match meta {
            _ if is_star => DavMethod::all(),
            None => DavMethod::OPTIONS | DavMethod::PUT | DavMethod::MKCOL | DavMethod::LOCK,
            Some(ref m) if m.is_dir() => {
                let mut s = DavMethod::all() - DavMethod::PUT - DavMethod::MKCOL;
                if path.is_root() {
                    s -= DavMethod::MOVE | DavMethod::DELETE;
                }
                s
            }
            Some(_) => DavMethod::all() - DavMethod::MKCOL,
        };

        let v = METHODS
            .iter()
            .filter(|(_, m)| applicable.contains(*m) && self.allow.contains(*m))
            .filter(|(_, m)| self.ls.is_some() || !m.intersects(DavMethod::LOCK | DavMethod::UNLOCK))
            .map(|(name, _)| *name)
            .collect::<Vec<_>>();

        if let Ok(a) = HeaderValue::from_str(&v.join(",")) {
            res.headers_mut().insert("allow", a);
        }

        Ok(res)
    }
}
