use std::sync::Arc;

use headers::HeaderMapExt;
use http::{Method, Request, StatusCode};

use crate::davheaders::{self, IfItem};
use crate::davpath::DavPath;
use crate::fs::{DavFileSystem, DavMetaData};
use crate::ls::DavLockSystem;

type Meta = Box<dyn DavMetaData>;

/// The entity tag of a resource, as used in the ETag: header.
pub(crate) fn etag(meta: &Meta) -> Option<headers::ETag> {
    meta.etag().and_then(|t| format!("\"{t}\"").parse().ok())
}

// strip W/ and the quotes.
fn opaque_tag(s: &str) -> &str {
    let s = s.strip_prefix("W/").unwrap_or(s);
    s.trim_matches('"')
}

/// Evaluate If-Match, If-Unmodified-Since, If-None-Match and
/// If-Modified-Since (RFC 7232, section 6). Returns the status to
/// reply with if a precondition fails.
pub(crate) fn http_if_match(req: &Request<()>, meta: Option<&Meta>) -> Option<StatusCode> {
    let h = req.headers();
    let is_get = req.method() == Method::GET || req.method() == Method::HEAD;
    let tag = meta.and_then(etag);
    let modified = meta.and_then(|m| m.modified().ok());

    // a resource without an etag still matches "*".
    let any_tag = || "\"-\"".parse::<headers::ETag>().ok();

    if let Some(im) = h.typed_get::<headers::IfMatch>() {
        let pass = match meta {
            None => false,
            Some(_) => tag.clone().or_else(any_tag).is_some_and(|t| im.precondition_passes(&t)),
        };
        if !pass {
            trace!("precondition fail: If-Match");
            return Some(StatusCode::PRECONDITION_FAILED);
        }
    } else if let Some(ius) = h.typed_get::<headers::IfUnmodifiedSince>() {
        if let Some(m) = modified {
            if !ius.precondition_passes(m) {
                trace!("precondition fail: If-Unmodified-Since");
                return Some(StatusCode::PRECONDITION_FAILED);
            }
        }
    }

    if let Some(inm) = h.typed_get::<headers::IfNoneMatch>() {
        if let Some(t) = meta.and(tag.or_else(any_tag)) {
            if !inm.precondition_passes(&t) {
                trace!("precondition fail: If-None-Match");
                return Some(if is_get {
                    StatusCode::NOT_MODIFIED
                } else {
                    StatusCode::PRECONDITION_FAILED
                });
            }
        }
    } else if is_get {
        if let (Some(ims), Some(m)) = (h.typed_get::<headers::IfModifiedSince>(), modified) {
            if !ims.is_modified(m) {
                trace!("precondition fail: If-Modified-Since");
                return Some(StatusCode::NOT_MODIFIED);
            }
        }
    }
    None
}

/// Is the If-Range: header (if any) still valid for this resource.
pub(crate) fn ifrange_match(req: &Request<()>, meta: &Meta) -> bool {
    match req.headers().typed_get::<headers::IfRange>() {
        None => true,
        Some(r) => {
            let tag = etag(meta);
            let lm = meta.modified().ok().map(headers::LastModified::from);
            !r.is_modified(tag.as_ref(), lm.as_ref())
        }
    }
}

// Evaluate one state token against the lock table. `DAV:no-lock` and
// anything that is not a current lock covering the resource is false.
fn token_matches(ls: Option<&Arc<dyn DavLockSystem>>, path: &DavPath, token: &str) -> bool {
    match ls {
        Some(ls) => ls.discover(path).iter().any(|l| l.token == token),
        None => false,
    }
}

/// Evaluate the If: header (RFC 4918, 10.4).
///
/// Returns the submitted lock tokens if the header is absent or
/// evaluates to true, `Err(412)` if it evaluates to false, `Err(400)`
/// if it cannot be parsed.
pub(crate) async fn if_header_tokens(
    req: &Request<()>,
    meta: Option<&Meta>,
    fs: &Arc<dyn DavFileSystem>,
    ls: Option<&Arc<dyn DavLockSystem>>,
    path: &DavPath,
) -> Result<Vec<String>, StatusCode> {
    let hdr = match req.headers().typed_try_get::<davheaders::If>() {
        Ok(Some(h)) => h,
        Ok(None) => return Ok(Vec::new()),
        Err(_) => return Err(StatusCode::BAD_REQUEST),
    };
    let prefix = String::from_utf8_lossy(path.prefix()).into_owned();

    let mut any_match = false;
    for list in &hdr.0 {
        // resolve the resource this list is about.
        let (rpath, tagged_meta) = match list.resource_tag {
            None => (path.clone(), None),
            Some(ref tag) => match DavPath::from_str_and_prefix(tag, &prefix) {
                Ok(p) => {
                    let m = fs.metadata(&p).await.ok();
                    (p, Some(m))
                }
                // not a resource of ours, the list cannot match.
                Err(_) => continue,
            },
        };
        let rmeta = match tagged_meta {
            Some(ref m) => m.as_ref(),
            None => meta,
        };
        let rtag = rmeta.and_then(|m| m.etag());

        let list_match = list.conditions.iter().all(|c| {
            let m = match c.item {
                IfItem::StateToken(ref t) => token_matches(ls, &rpath, t),
                IfItem::ETag(ref e) => rtag.as_deref() == Some(opaque_tag(e)),
            };
            m != c.not
        });
        if list_match {
            any_match = true;
            break;
        }
    }

    if any_match {
        Ok(hdr.tokens())
    } else {
        debug!("If: header for {path} evaluates to false");
        Err(StatusCode::PRECONDITION_FAILED)
    }
}

/// Evaluate the HTTP preconditions first, then the If: header.
pub(crate) async fn if_match_get_tokens(
    req: &Request<()>,
    meta: Option<&Meta>,
    fs: &Arc<dyn DavFileSystem>,
    ls: Option<&Arc<dyn DavLockSystem>>,
    path: &DavPath,
) -> Result<Vec<String>, StatusCode> {
    if let Some(code) = http_if_match(req, meta) {
        return Err(code);
    }
    if_header_tokens(req, meta, fs, ls, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::memfs::MemFs;
    use crate::fs::OpenOptions;
    use crate::ls::memls::MemLs;
    use std::time::Duration;

    fn req(method: Method, hdrs: &[(&str, &str)]) -> Request<()> {
        let mut b = Request::builder().method(method).uri("/f.txt");
        for (k, v) in hdrs {
            b = b.header(*k, *v);
        }
        b.body(()).unwrap()
    }

    async fn setup() -> (Arc<dyn DavFileSystem>, DavPath, Meta) {
        let fs: Arc<dyn DavFileSystem> = MemFs::new();
        let path = DavPath::new("/f.txt").unwrap();
        let mut oo = OpenOptions::write();
        oo.create = true;
        let mut f = fs.open(&path, oo).await.unwrap();
        f.write_bytes(bytes::Bytes::from_static(b"data")).await.unwrap();
        f.flush().await.unwrap();
        let meta = fs.metadata(&path).await.unwrap();
        (fs, path, meta)
    }

    #[tokio::test]
    async fn test_if_match() {
        let (_fs, _path, meta) = setup().await;
        let tag = format!("\"{}\"", meta.etag().unwrap());

        let r = req(Method::PUT, &[("if-match", tag.as_str())]);
        assert_eq!(http_if_match(&r, Some(&meta)), None);
        let r = req(Method::PUT, &[("if-match", "\"other\"")]);
        assert_eq!(http_if_match(&r, Some(&meta)), Some(StatusCode::PRECONDITION_FAILED));
        let r = req(Method::PUT, &[("if-match", "*")]);
        assert_eq!(http_if_match(&r, None), Some(StatusCode::PRECONDITION_FAILED));

        let r = req(Method::GET, &[("if-none-match", tag.as_str())]);
        assert_eq!(http_if_match(&r, Some(&meta)), Some(StatusCode::NOT_MODIFIED));
        let r = req(Method::PUT, &[("if-none-match", "*")]);
        assert_eq!(http_if_match(&r, Some(&meta)), Some(StatusCode::PRECONDITION_FAILED));
        assert_eq!(http_if_match(&r, None), None);
    }

    #[tokio::test]
    async fn test_if_header() {
        let (fs, path, meta) = setup().await;
        let mls = MemLs::new();
        let ls: Arc<dyn DavLockSystem> = mls.clone();
        let lock = ls
            .lock(&path, None, None, Some(Duration::from_secs(60)), false, false)
            .unwrap();
        let ls = Some(&ls);

        let good = format!("(<{}>)", lock.token);
        let r = req(Method::PUT, &[("if", good.as_str())]);
        let tokens = if_header_tokens(&r, Some(&meta), &fs, ls, &path).await.unwrap();
        assert_eq!(tokens, vec![lock.token.clone()]);

        let r = req(Method::PUT, &[("if", "(<opaquelocktoken:bad>)")]);
        let res = if_header_tokens(&r, Some(&meta), &fs, ls, &path).await;
        assert_eq!(res, Err(StatusCode::PRECONDITION_FAILED));

        // second list matches: bad token OR no-lock negated.
        let r = req(Method::PUT, &[("if", "(<opaquelocktoken:bad>) (Not <DAV:no-lock>)")]);
        assert!(if_header_tokens(&r, Some(&meta), &fs, ls, &path).await.is_ok());

        let etag = format!("([\"{}\"])", meta.etag().unwrap());
        let r = req(Method::PUT, &[("if", etag.as_str())]);
        assert!(if_header_tokens(&r, Some(&meta), &fs, ls, &path).await.is_ok());
        let r = req(Method::PUT, &[("if", "([\"nope\"])")]);
        assert!(if_header_tokens(&r, Some(&meta), &fs, ls, &path).await.is_err());

        // tagged list on the same resource.
        let tagged = format!("<http://localhost/f.txt> (<{}>)", lock.token);
        let r = req(Method::PUT, &[("if", tagged.as_str())]);
        assert!(if_header_tokens(&r, Some(&meta), &fs, ls, &path).await.is_ok());

        let r = req(Method::PUT, &[("if", "garbage")]);
        let res = if_header_tokens(&r, Some(&meta), &fs, ls, &path).await;
        assert_eq!(res, Err(StatusCode::BAD_REQUEST));
    }
}
