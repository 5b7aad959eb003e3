use headers::HeaderMapExt;
use http::{Response, StatusCode};
use xml::writer::XmlEvent as XmlWEvent;
use xmltree::Element;

use crate::body::Body;
use crate::davpath::DavPath;
use crate::errors::DavResult;
use crate::util::MemBuffer;
use crate::xmltree_ext::{self, ElementExt};

/// Per-resource failures of a recursive operation (DELETE, COPY, MOVE).
///
/// Only failures are recorded. Parents that could not be processed
/// because a member failed are not reported.
pub(crate) struct MultiError {
    base: DavPath,
    errors: Vec<(DavPath, StatusCode)>,
}

impl MultiError {
    pub fn new(base: &DavPath) -> MultiError {
        MultiError {
            base: base.clone(),
            errors: Vec::new(),
        }
    }

    pub fn add_status(&mut self, path: &DavPath, status: StatusCode) {
        debug!("multierror: {path}: {status}");
        self.errors.push((path.clone(), status));
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(DavPath, StatusCode)> {
        self.errors.iter()
    }

    /// Reply with `ok` if nothing failed, with the status of the request
    /// resource if that was the only failure, and with 207 otherwise.
    pub fn into_response(self, ok: StatusCode) -> DavResult<Response<Body>> {
        if self.errors.is_empty() {
            return Ok(empty_response(ok));
        }
        if self.errors.len() == 1 && self.errors[0].0.as_bytes_noslash() == self.base.as_bytes_noslash() {
            return Ok(empty_response(self.errors[0].1));
        }

        let mut emitter = xmltree_ext::emitter(MemBuffer::new())?;
        emitter.write(XmlWEvent::start_element("D:multistatus").ns("D", "DAV:"))?;
        for (path, status) in &self.errors {
            emitter.write(XmlWEvent::start_element("D:response"))?;
            Element::new2("D:href")
                .text(path.as_url_string_with_prefix())
                .write_ev(&mut emitter)?;
            Element::new2("D:status")
                .text(format!("HTTP/1.1 {status}"))
                .write_ev(&mut emitter)?;
            emitter.write(XmlWEvent::end_element())?;
        }
        emitter.write(XmlWEvent::end_element())?;

        let body = emitter.inner_mut().take();
        let mut res = Response::new(Body::from(body));
        *res.status_mut() = StatusCode::MULTI_STATUS;
        res.headers_mut().insert(
            "content-type",
            http::HeaderValue::from_static("application/xml; charset=utf-8"),
        );
        Ok(res)
    }
}

fn empty_response(status: StatusCode) -> Response<Body> {
    let mut res = Response::new(Body::empty());
    *res.status_mut() = status;
    res.headers_mut().typed_insert(headers::ContentLength(0));
    res
}
