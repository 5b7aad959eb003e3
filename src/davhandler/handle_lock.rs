use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};
use xmltree::Element;

use crate::body::Body;
use crate::conditional::if_match_get_tokens;
use crate::davhandler::{xml_response, MAX_LOCK_TIMEOUT};
use crate::davheaders::{self, DavTimeout, Depth};
use crate::davpath::DavPath;
use crate::errors::{DavError, DavResult};
use crate::fs::{FsError, OpenOptions};
use crate::ls::{DavLock, DavLockSystem};
use crate::util::{dav_xml_error, MemBuffer};
use crate::xmltree_ext::{self, ElementExt};

impl crate::DavHandler {
    pub(crate) async fn handle_lock(&self, req: &Request<()>, xmldata: &[u8]) -> DavResult<Response<Body>> {
        // must have a locksystem or bail
        let locksystem = match self.ls {
            Some(ref ls) => ls,
            None => return Err(StatusCode::METHOD_NOT_ALLOWED.into()),
        };

        let mut path = self.path(req)?;
        let meta = self.fs.metadata(&path).await.ok();
        if meta.as_ref().is_some_and(|m| m.is_dir()) {
            path.add_slash();
        }

        // lock refresh has an empty body.
        let deep = match req.headers().typed_try_get::<Depth>() {
            Ok(None) | Ok(Some(Depth::Infinity)) => true,
            Ok(Some(Depth::Zero)) => false,
            _ => return Err(StatusCode::BAD_REQUEST.into()),
        };
        let timeout = match req.headers().typed_try_get::<davheaders::Timeout>() {
            Ok(t) => lock_timeout(t),
            Err(_) => return Err(StatusCode::BAD_REQUEST.into()),
        };

        let tokens = match if_match_get_tokens(req, meta.as_ref(), &self.fs, self.ls.as_ref(), &path).await {
            Ok(t) => t,
            Err(s) => return Err(s.into()),
        };

        let principal = self.principal.as_deref().map(|s| s.as_str());

        if xmldata.is_empty() {
            // refresh: one of the submitted tokens must be a lock on this resource.
            if tokens.is_empty() {
                return Err(StatusCode::BAD_REQUEST.into());
            }
            let lock = match tokens.iter().find_map(|t| locksystem.refresh(&path, t, Some(timeout)).ok()) {
                Some(lock) => lock,
                None => {
                    debug!("LOCK refresh on {path}: no matching lock");
                    return Ok(xml_response(
                        StatusCode::PRECONDITION_FAILED,
                        dav_xml_error("<D:lock-token-matches-request-uri/>"),
                    ));
                }
            };
            let body = lock_body(&lock)?;
            return Ok(xml_response(StatusCode::OK, body));
        }

        // parse the lockinfo.
        let tree = Element::parse2(Cursor::new(xmldata))?;
        if !tree.is_dav("lockinfo") {
            return Err(DavError::XmlParseError);
        }
        let mut shared: Option<bool> = None;
        let mut owner: Option<Element> = None;
        let mut locktype = false;

        for elem in tree.child_elems_into_iter() {
            if elem.is_dav("lockscope") {
                for e in elem.child_elems_iter() {
                    match e.name.as_str() {
                        "exclusive" => shared = Some(false),
                        "shared" => shared = Some(true),
                        _ => return Err(DavError::XmlParseError),
                    }
                }
            } else if elem.is_dav("locktype") {
                // only write locks exist.
                if !elem.child_elems_iter().all(|e| e.is_dav("write")) {
                    return Err(DavError::XmlParseError);
                }
                locktype = true;
            } else if elem.is_dav("owner") {
                let mut o = elem;
                o.prefix = Some("D".to_string());
                o.namespaces = None;
                owner = Some(o);
            }
        }
        let shared = match (shared, locktype) {
            (Some(s), true) => s,
            _ => return Err(DavError::XmlParseError),
        };

        // a lock on an unmapped URL creates an empty resource.
        let create = meta.is_none();
        if create && !self.has_parent(&path).await {
            return Err(StatusCode::CONFLICT.into());
        }
        if create && path.is_collection() {
            return Err(StatusCode::CONFLICT.into());
        }
        // the new member changes its parent collection.
        if create {
            if let Err(res) = self.check_member_locks(&path, false, &tokens) {
                return Ok(res);
            }
        }

        let lock = match locksystem.lock(&path, principal, owner.as_ref(), Some(timeout), shared, deep) {
            Ok(lock) => lock,
            Err(conflict) => {
                debug!("LOCK {path}: conflicts with {}", conflict.token);
                let href = conflict.path.as_url_string_with_prefix();
                let body = format!(
                    "<D:no-conflicting-lock><D:href>{}</D:href></D:no-conflicting-lock>",
                    xml::escape::escape_str_pcdata(&href)
                );
                return Ok(xml_response(StatusCode::LOCKED, dav_xml_error(&body)));
            }
        };

        if create {
            let mut oo = OpenOptions::write();
            oo.create = true;
            let res = match self.fs.open(&path, oo).await {
                Ok(mut file) => file.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = res {
                // do not leave a lock on something that does not exist.
                let _ = locksystem.unlock(&path, &lock.token);
                return Err(match e {
                    FsError::NotFound => StatusCode::CONFLICT.into(),
                    e => e.into(),
                });
            }
        }

        let mut res = xml_response(
            if create { StatusCode::CREATED } else { StatusCode::OK },
            lock_body(&lock)?,
        );
        res.headers_mut()
            .typed_insert(davheaders::LockToken(lock.token.clone()));
        Ok(res)
    }

    pub(crate) async fn handle_unlock(&self, req: &Request<()>) -> DavResult<Response<Body>> {
        // must have a locksystem or bail
        let locksystem = match self.ls {
            Some(ref ls) => ls,
            None => return Err(StatusCode::METHOD_NOT_ALLOWED.into()),
        };

        // Must have Lock-Token header
        let token = match req.headers().typed_try_get::<davheaders::LockToken>() {
            Ok(Some(t)) => t.0,
            _ => return Err(StatusCode::BAD_REQUEST.into()),
        };

        let mut path = self.path(req)?;
        if let Ok(meta) = self.fs.metadata(&path).await {
            if meta.is_dir() {
                path.add_slash();
            }
        }

        match locksystem.unlock(&path, &token) {
            Ok(()) => {
                let mut res = Response::new(Body::empty());
                *res.status_mut() = StatusCode::NO_CONTENT;
                res.headers_mut().typed_insert(headers::ContentLength(0));
                Ok(res)
            }
            Err(()) => {
                debug!("UNLOCK {path}: {token} does not cover it");
                Ok(xml_response(
                    StatusCode::CONFLICT,
                    dav_xml_error("<D:lock-token-matches-request-uri/>"),
                ))
            }
        }
    }
}

// The granted timeout: the first one the client prefers, capped.
fn lock_timeout(t: Option<davheaders::Timeout>) -> Duration {
    let secs = match t.as_ref().and_then(|t| t.0.first()) {
        Some(DavTimeout::Seconds(n)) => (*n as u64).min(MAX_LOCK_TIMEOUT),
        Some(DavTimeout::Infinite) | None => MAX_LOCK_TIMEOUT,
    };
    Duration::from_secs(secs)
}

// <D:prop><D:lockdiscovery> with just this lock, the LOCK response body.
fn lock_body(lock: &DavLock) -> DavResult<Body> {
    let mut prop = Element::new2("D:prop").ns("D", "DAV:");
    let mut ld = Element::new2("D:lockdiscovery");
    ld.push_element(build_lock_prop(lock));
    prop.push_element(ld);

    let mut emitter = xmltree_ext::emitter(MemBuffer::new())?;
    prop.write_ev(&mut emitter)?;
    Ok(Body::from(emitter.inner_mut().take()))
}

/// The DAV:lockdiscovery property: every lock that covers `path`.
pub(crate) fn list_lockdiscovery(ls: Option<&Arc<dyn DavLockSystem>>, path: &DavPath) -> Element {
    let mut elem = Element::new2("D:lockdiscovery");

    // must have a locksystem or bail
    let locksystem = match ls {
        Some(ls) => ls,
        None => return elem,
    };

    for lock in &locksystem.discover(path) {
        elem.push_element(build_lock_prop(lock));
    }
    elem
}

/// The DAV:supportedlock property.
pub(crate) fn list_supportedlock(ls: Option<&Arc<dyn DavLockSystem>>) -> Element {
    let mut elem = Element::new2("D:supportedlock");

    // must have a locksystem or bail
    if ls.is_none() {
        return elem;
    }

    for scope in ["D:exclusive", "D:shared"] {
        let mut entry = Element::new2("D:lockentry");
        let mut lscope = Element::new2("D:lockscope");
        lscope.push_element(Element::new2(scope));
        entry.push_element(lscope);
        let mut ltype = Element::new2("D:locktype");
        ltype.push_element(Element::new2("D:write"));
        entry.push_element(ltype);
        elem.push_element(entry);
    }
    elem
}

// one <D:activelock>.
fn build_lock_prop(lock: &DavLock) -> Element {
    let mut actlock = Element::new2("D:activelock");

    let mut elem = Element::new2("D:lockscope");
    elem.push_element(match lock.shared {
        false => Element::new2("D:exclusive"),
        true => Element::new2("D:shared"),
    });
    actlock.push_element(elem);

    let mut elem = Element::new2("D:locktype");
    elem.push_element(Element::new2("D:write"));
    actlock.push_element(elem);

    actlock.push_element(Element::new2("D:depth").text(match lock.deep {
        false => "0",
        true => "infinity",
    }));

    actlock.push_element(Element::new2("D:timeout").text(match lock.timeout {
        None => "Infinite".to_string(),
        Some(d) => format!("Second-{}", d.as_secs()),
    }));

    let mut locktokenelem = Element::new2("D:locktoken");
    locktokenelem.push_element(Element::new2("D:href").text(lock.token.clone()));
    actlock.push_element(locktokenelem);

    let mut lockroot = Element::new2("D:lockroot");
    lockroot.push_element(Element::new2("D:href").text(lock.path.as_url_string_with_prefix()));
    actlock.push_element(lockroot);

    if let Some(ref o) = lock.owner {
        actlock.push_element(*o.clone());
    }

    actlock
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout() {
        use DavTimeout::*;
        let t = |v: Vec<DavTimeout>| lock_timeout(Some(davheaders::Timeout(v))).as_secs();
        assert_eq!(t(vec![Seconds(60)]), 60);
        assert_eq!(t(vec![Seconds(100000)]), MAX_LOCK_TIMEOUT);
        assert_eq!(t(vec![Infinite, Seconds(10)]), MAX_LOCK_TIMEOUT);
        assert_eq!(lock_timeout(None).as_secs(), MAX_LOCK_TIMEOUT);
    }

    #[test]
    fn test_supportedlock() {
        let ls: Arc<dyn DavLockSystem> = crate::ls::memls::MemLs::new();
        let e = list_supportedlock(Some(&ls));
        assert_eq!(e.child_elems_iter().count(), 2);
        assert_eq!(list_supportedlock(None).child_elems_iter().count(), 0);
    }
}
