use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};
use std::io::{self, Cursor};
use std::sync::Arc;

use bytes::Bytes;
use headers::HeaderMapExt;
use http::{HeaderValue, Request, Response, StatusCode};
use xml::writer::{EventWriter, XmlEvent as XmlWEvent};
use xml::EmitterConfig;
use xmltree::Element;

use crate::body::Body;
use crate::conditional::if_match_get_tokens;
use crate::davhandler::handle_lock::{list_lockdiscovery, list_supportedlock};
use crate::davheaders::Depth;
use crate::davpath::DavPath;
use crate::errors::{DavError, DavResult};
use crate::fs::DavMetaData;
use crate::ls::DavLockSystem;
use crate::multierror::MultiError;
use crate::ps::{DavProp, DavPropStore};
use crate::util::{systemtime_to_httpdate, systemtime_to_rfc3339, MemBuffer};
use crate::xmltree_ext::{self, ElementExt};

const NS_DAV_URI: &str = "DAV:";

// live properties, in the order they are reported.
const LIVE_PROPS: &[&str] = &[
    "creationdate",
    "displayname",
    "getcontentlength",
    "getcontenttype",
    "getetag",
    "getlastmodified",
    "lockdiscovery",
    "resourcetype",
    "supportedlock",
];

// live properties that PROPPATCH may not touch.
const PROTECTED_PROPS: &[&str] = &[
    "creationdate",
    "getcontentlength",
    "getcontenttype",
    "getetag",
    "getlastmodified",
    "lockdiscovery",
    "resourcetype",
    "supportedlock",
];

lazy_static! {
    static ref ALLPROP: Vec<Element> = LIVE_PROPS.iter().map(|n| dav_elem(n)).collect();
}

fn dav_elem(name: &str) -> Element {
    let mut e = Element::new2(format!("D:{name}").as_str());
    e.namespace = Some(NS_DAV_URI.to_string());
    e
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PropfindKind {
    AllProp,
    PropName,
    Prop,
}

struct PropWriter {
    emitter: EventWriter<MemBuffer>,
    kind: PropfindKind,
    props: Vec<Element>,
    ls: Option<Arc<dyn DavLockSystem>>,
    ps: Option<Arc<dyn DavPropStore>>,
}

impl crate::DavHandler {
    pub(crate) async fn handle_propfind(&self, req: &Request<()>, xmldata: &[u8]) -> DavResult<Response<Body>> {
        let mut res = Response::new(Body::empty());

        let depth = match req.headers().typed_try_get::<Depth>() {
            Ok(Some(d)) => d,
            Ok(None) => Depth::Infinity,
            Err(_) => return Err(StatusCode::BAD_REQUEST.into()),
        };

        // path and meta
        let mut path = self.path(req)?;
        let meta = self.fs.metadata(&path).await?;
        let meta = self.fixpath(&mut res, &mut path, meta);

        let (kind, props) = parse_propfind(xmldata)?;
        debug!("propfind: {kind:?} on {path}, depth {depth:?}");

        let mut pw = PropWriter::new(kind, props, self.ls.clone(), self.ps.clone())?;

        let h = res.headers_mut();
        h.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/xml; charset=utf-8"),
        );
        h.insert(
            http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store, no-cache, must-revalidate"),
        );
        *res.status_mut() = StatusCode::MULTI_STATUS;

        // None: do not descend. Some(None): as deep as max_depth allows.
        let walk = match depth {
            Depth::Zero => None,
            Depth::One => Some(Some(1)),
            Depth::Infinity => Some(None),
        };
        let this = self.clone();

        *res.body_mut() = Body::stream(async_stream::try_stream! {
            pw.write_props(&path, meta.as_ref()).map_err(io::Error::from)?;
            yield pw.take();

            if let (true, Some(limit)) = (meta.is_dir(), walk) {
                let mut errors = MultiError::new(&path);
                let nodes = this.walk_tree(&path, limit, &mut errors).await;

                // collections we did not descend into get their own status.
                let mut status = BTreeMap::new();
                for (p, s) in errors.iter() {
                    if *s == StatusCode::INSUFFICIENT_STORAGE {
                        status.insert(p.as_bytes_noslash().to_vec(), *s);
                    } else {
                        debug!("propfind: skipping {p}: {s}");
                    }
                }

                for node in nodes {
                    if node.meta.is_symlink() {
                        continue;
                    }
                    match status.get(node.path.as_bytes_noslash()) {
                        Some(s) => pw.write_status(&node.path, *s).map_err(io::Error::from)?,
                        None => pw.write_props(&node.path, node.meta.as_ref()).map_err(io::Error::from)?,
                    }
                    yield pw.take();
                }
            }

            yield pw.close().map_err(io::Error::from)?;
        });

        Ok(res)
    }

    pub(crate) async fn handle_proppatch(&self, req: &Request<()>, xmldata: &[u8]) -> DavResult<Response<Body>> {
        let mut res = Response::new(Body::empty());

        // file must exist.
        let mut path = self.path(req)?;
        let meta = self.fs.metadata(&path).await?;
        let meta = self.fixpath(&mut res, &mut path, meta);

        // check the If and If-* headers, then the locks.
        let tokens = match if_match_get_tokens(req, Some(&meta), &self.fs, self.ls.as_ref(), &path).await {
            Ok(t) => t,
            Err(s) => return Err(s.into()),
        };
        if let Err(res) = self.check_locks(&path, false, &tokens) {
            return Ok(res);
        }

        trace!("proppatch input:\n{}", String::from_utf8_lossy(xmldata));

        let tree = Element::parse2(Cursor::new(xmldata))?;
        if !tree.is_dav("propertyupdate") {
            return Err(DavError::XmlParseError);
        }

        // the instructions, in document order; a later instruction for
        // the same property replaces an earlier one.
        let mut ops: Vec<(bool, Element)> = Vec::new();
        for elem in tree.child_elems_into_iter() {
            let is_set = if elem.is_dav("set") {
                true
            } else if elem.is_dav("remove") {
                false
            } else {
                continue;
            };
            for prop in elem
                .child_elems_into_iter()
                .filter(|e| e.is_dav("prop"))
                .flat_map(|e| e.child_elems_into_iter())
            {
                ops.retain(|(_, e)| !(e.name == prop.name && e.namespace == prop.namespace));
                ops.push((is_set, prop));
            }
        }
        if ops.is_empty() {
            return Err(DavError::XmlParseError);
        }

        let mut failed = Vec::new();
        let mut set = Vec::new();
        let mut rem = Vec::new();
        for (is_set, prop) in ops {
            if is_protected(&prop) || self.ps.is_none() {
                failed.push((StatusCode::FORBIDDEN, element_to_davprop(&prop)));
            } else if is_set {
                set.push(element_to_davprop_full(&prop)?);
            } else {
                rem.push(element_to_davprop(&prop));
            }
        }

        // all or nothing.
        let ret = match self.ps {
            Some(ref ps) if failed.is_empty() => ps.patch_props(&path, set, rem),
            _ => {
                debug!("proppatch on {path}: {} instruction(s) refused", failed.len());
                failed.extend(
                    set.into_iter()
                        .chain(rem)
                        .map(|p| (StatusCode::FAILED_DEPENDENCY, p)),
                );
                failed
            }
        };

        // group by statuscode.
        let mut hm: BTreeMap<StatusCode, Vec<Element>> = BTreeMap::new();
        for (code, prop) in ret {
            hm.entry(code).or_default().push(davprop_to_element(DavProp { xml: None, ..prop }));
        }

        // And reply.
        let mut pw = PropWriter::new(PropfindKind::Prop, Vec::new(), None, None)?;
        pw.write_propresponse(&path, hm)?;
        let body = pw.close()?;

        *res.body_mut() = Body::from(body);
        *res.status_mut() = StatusCode::MULTI_STATUS;
        res.headers_mut().insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/xml; charset=utf-8"),
        );
        Ok(res)
    }
}

// Decode a PROPFIND body. An empty body is allprop.
fn parse_propfind(xmldata: &[u8]) -> DavResult<(PropfindKind, Vec<Element>)> {
    if xmldata.is_empty() {
        return Ok((PropfindKind::AllProp, ALLPROP.clone()));
    }
    let tree = Element::parse2(Cursor::new(xmldata))?;
    if !tree.is_dav("propfind") {
        return Err(DavError::XmlParseError);
    }

    let mut kind = None;
    let mut props = Vec::new();
    let mut include = Vec::new();
    for elem in tree.child_elems_into_iter() {
        if elem.is_dav("propname") {
            kind = Some(PropfindKind::PropName);
        } else if elem.is_dav("allprop") {
            kind = Some(PropfindKind::AllProp);
        } else if elem.is_dav("prop") {
            kind = Some(PropfindKind::Prop);
            props = elem.child_elems_into_iter().collect();
        } else if elem.is_dav("include") {
            include = elem.child_elems_into_iter().collect();
        }
    }

    match kind {
        None => Err(DavError::XmlParseError),
        Some(PropfindKind::Prop) => Ok((PropfindKind::Prop, props)),
        Some(PropfindKind::PropName) => Ok((PropfindKind::PropName, ALLPROP.clone())),
        Some(PropfindKind::AllProp) => {
            let mut props = ALLPROP.clone();
            for e in include {
                if !props.iter().any(|p| p.name == e.name && p.namespace == e.namespace) {
                    props.push(e);
                }
            }
            Ok((PropfindKind::AllProp, props))
        }
    }
}

fn is_protected(prop: &Element) -> bool {
    prop.namespace.as_deref() == Some(NS_DAV_URI) && PROTECTED_PROPS.contains(&prop.name.as_str())
}

fn is_live(prop: &DavProp) -> bool {
    prop.namespace.as_deref() == Some(NS_DAV_URI) && LIVE_PROPS.contains(&prop.name.as_str())
}

impl PropWriter {
    fn new(
        kind: PropfindKind,
        props: Vec<Element>,
        ls: Option<Arc<dyn DavLockSystem>>,
        ps: Option<Arc<dyn DavPropStore>>,
    ) -> DavResult<PropWriter> {
        let mut emitter = xmltree_ext::emitter(MemBuffer::new())?;
        emitter.write(XmlWEvent::start_element("D:multistatus").ns("D", NS_DAV_URI))?;
        Ok(PropWriter {
            emitter,
            kind,
            props,
            ls,
            ps,
        })
    }

    // a DAV: property with a text value.
    fn text_elem(&self, prop: &Element, text: impl Into<String>) -> Element {
        let e = Element::new2(format!("D:{}", prop.name).as_str());
        if self.kind == PropfindKind::PropName {
            e
        } else {
            e.text(text)
        }
    }

    // a dead property (or displayname) from the store.
    fn dead_prop(&self, path: &DavPath, prop: &Element) -> Option<Element> {
        let xml = self.ps.as_ref()?.get_prop(path, &element_to_davprop(prop))?;
        Element::parse2(Cursor::new(xml)).ok()
    }

    fn build_prop(&self, prop: &Element, path: &DavPath, meta: &dyn DavMetaData) -> (StatusCode, Element) {
        let value = if prop.namespace.as_deref() == Some(NS_DAV_URI) {
            match prop.name.as_str() {
                "creationdate" => meta
                    .created()
                    .or_else(|_| meta.modified())
                    .ok()
                    .map(|t| self.text_elem(prop, systemtime_to_rfc3339(t))),
                "displayname" => self.dead_prop(path, prop).or_else(|| {
                    let name = String::from_utf8_lossy(path.file_name()).into_owned();
                    (!name.is_empty()).then(|| self.text_elem(prop, name))
                }),
                "getcontentlength" if !meta.is_dir() => Some(self.text_elem(prop, meta.len().to_string())),
                "getcontenttype" => Some(self.text_elem(
                    prop,
                    if meta.is_dir() {
                        "httpd/unix-directory"
                    } else {
                        path.get_mime_type_str()
                    },
                )),
                "getetag" => meta.etag().map(|t| self.text_elem(prop, format!("\"{t}\""))),
                "getlastmodified" => meta
                    .modified()
                    .ok()
                    .map(|t| self.text_elem(prop, systemtime_to_httpdate(t))),
                "resourcetype" => {
                    let mut elem = Element::new2("D:resourcetype");
                    if meta.is_dir() && self.kind != PropfindKind::PropName {
                        elem.push_element(Element::new2("D:collection"));
                    }
                    Some(elem)
                }
                "lockdiscovery" => Some(match self.kind {
                    PropfindKind::PropName => Element::new2("D:lockdiscovery"),
                    _ => list_lockdiscovery(self.ls.as_ref(), path),
                }),
                "supportedlock" => Some(match self.kind {
                    PropfindKind::PropName => Element::new2("D:supportedlock"),
                    _ => list_supportedlock(self.ls.as_ref()),
                }),
                _ => self.dead_prop(path, prop),
            }
        } else {
            self.dead_prop(path, prop)
        };

        match value {
            Some(elem) => (StatusCode::OK, elem),
            None => {
                let elem = if prop.namespace.as_deref() == Some(NS_DAV_URI) {
                    Element::new2(format!("D:{}", prop.name).as_str())
                } else {
                    davprop_to_element(element_to_davprop(prop))
                };
                (StatusCode::NOT_FOUND, elem)
            }
        }
    }

    fn write_props(&mut self, path: &DavPath, meta: &dyn DavMetaData) -> DavResult<()> {
        let mut props: BTreeMap<StatusCode, Vec<Element>> = BTreeMap::new();

        // with allprop and propname only what exists is listed.
        for p in &self.props {
            let (status, elem) = self.build_prop(p, path, meta);
            if status == StatusCode::OK || self.kind == PropfindKind::Prop {
                props.entry(status).or_default().push(elem);
            }
        }

        if self.kind != PropfindKind::Prop {
            if let Some(ref ps) = self.ps {
                let content = self.kind == PropfindKind::AllProp;
                let listed = self
                    .props
                    .iter()
                    .map(|p| (p.namespace.clone().unwrap_or_default(), p.name.clone()))
                    .collect::<HashSet<_>>();
                for dp in ps.get_props(path, content) {
                    if is_live(&dp) || listed.contains(&dp.key()) {
                        continue;
                    }
                    props.entry(StatusCode::OK).or_default().push(davprop_to_element(dp));
                }
            }
        }

        self.write_propresponse(path, props)
    }

    fn write_propresponse(&mut self, path: &DavPath, props: BTreeMap<StatusCode, Vec<Element>>) -> DavResult<()> {
        self.emitter.write(XmlWEvent::start_element("D:response"))?;
        Element::new2("D:href")
            .text(path.as_url_string_with_prefix())
            .write_ev(&mut self.emitter)?;

        for (status, elems) in &props {
            self.emitter.write(XmlWEvent::start_element("D:propstat"))?;
            self.emitter.write(XmlWEvent::start_element("D:prop"))?;
            for e in elems {
                e.write_ev(&mut self.emitter)?;
            }
            self.emitter.write(XmlWEvent::end_element())?;
            Element::new2("D:status")
                .text(format!("HTTP/1.1 {status}"))
                .write_ev(&mut self.emitter)?;
            if *status == StatusCode::FORBIDDEN {
                let mut err = Element::new2("D:error");
                err.push_element(Element::new2("D:cannot-modify-protected-property"));
                err.write_ev(&mut self.emitter)?;
            }
            self.emitter.write(XmlWEvent::end_element())?;
        }

        self.emitter.write(XmlWEvent::end_element())?; // response
        Ok(())
    }

    // a <D:response> with just a status.
    fn write_status(&mut self, path: &DavPath, status: StatusCode) -> DavResult<()> {
        self.emitter.write(XmlWEvent::start_element("D:response"))?;
        Element::new2("D:href")
            .text(path.as_url_string_with_prefix())
            .write_ev(&mut self.emitter)?;
        Element::new2("D:status")
            .text(format!("HTTP/1.1 {status}"))
            .write_ev(&mut self.emitter)?;
        self.emitter.write(XmlWEvent::end_element())?;
        Ok(())
    }

    fn take(&mut self) -> Bytes {
        self.emitter.inner_mut().take()
    }

    fn close(&mut self) -> DavResult<Bytes> {
        self.emitter.write(XmlWEvent::end_element())?;
        Ok(self.take())
    }
}

// a property element, value included, as stored in the property store.
fn element_to_davprop_full(elem: &Element) -> DavResult<DavProp> {
    let mut emitter = EventWriter::new_with_config(
        Vec::new(),
        EmitterConfig {
            normalize_empty_elements: false,
            perform_indent: false,
            indent_string: Cow::Borrowed(""),
            write_document_declaration: false,
            ..Default::default()
        },
    );
    elem.write_ev(&mut emitter)?;
    Ok(DavProp {
        xml: Some(emitter.into_inner()),
        ..element_to_davprop(elem)
    })
}

fn element_to_davprop(elem: &Element) -> DavProp {
    DavProp {
        name: elem.name.clone(),
        prefix: elem.prefix.clone(),
        namespace: elem.namespace.clone(),
        xml: None,
    }
}

fn davprop_to_element(prop: DavProp) -> Element {
    if let Some(xml) = prop.xml {
        if let Ok(e) = Element::parse2(Cursor::new(xml)) {
            return e;
        }
    }
    let mut elem = Element::new(&prop.name);
    if let Some(ns) = prop.namespace {
        // "D" is declared on the multistatus; anything else declares its own.
        let pfx = match prop.prefix {
            _ if ns == NS_DAV_URI => "D".to_string(),
            Some(p) if p != "D" => p,
            _ => "ns0".to_string(),
        };
        if ns != NS_DAV_URI {
            elem = elem.ns(pfx.clone(), ns.clone());
        }
        elem.prefix = Some(pfx);
        elem.namespace = Some(ns);
    }
    elem
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_propfind() {
        let (kind, props) = parse_propfind(b"").unwrap();
        assert_eq!(kind, PropfindKind::AllProp);
        assert_eq!(props.len(), LIVE_PROPS.len());

        let x = br#"<?xml version="1.0"?>
            <D:propfind xmlns:D="DAV:" xmlns:Z="urn:z">
              <D:prop><D:getetag/><Z:color/></D:prop>
            </D:propfind>"#;
        let (kind, props) = parse_propfind(x).unwrap();
        assert_eq!(kind, PropfindKind::Prop);
        assert_eq!(props.len(), 2);
        assert_eq!(props[1].namespace.as_deref(), Some("urn:z"));

        let x = br#"<D:propfind xmlns:D="DAV:"><D:propname/></D:propfind>"#;
        assert_eq!(parse_propfind(x).unwrap().0, PropfindKind::PropName);

        assert!(parse_propfind(br#"<D:lockinfo xmlns:D="DAV:"/>"#).is_err());
        assert!(parse_propfind(b"<D:propfind").is_err());
    }

    #[test]
    fn test_davprop_element() {
        let x = br#"<Z:color xmlns:Z="urn:z">red</Z:color>"#;
        let e = Element::parse2(Cursor::new(&x[..])).unwrap();
        let dp = element_to_davprop_full(&e).unwrap();
        assert_eq!(dp.name, "color");
        assert_eq!(dp.namespace.as_deref(), Some("urn:z"));
        let back = davprop_to_element(dp);
        assert_eq!(back.name, "color");
        assert_eq!(back.get_text().as_deref(), Some("red"));

        assert!(is_protected(&dav_elem("getetag")));
        assert!(!is_protected(&dav_elem("displayname")));
    }
}
