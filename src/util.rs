use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::body::Body;
use crate::errors::{DavError, DavResult};

bitflags! {
    /// The methods the handler knows, usable as a set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DavMethod: u16 {
        const OPTIONS = 1;
        const HEAD = 1 << 1;
        const GET = 1 << 2;
        const PUT = 1 << 3;
        const MKCOL = 1 << 4;
        const PROPFIND = 1 << 5;
        const PROPPATCH = 1 << 6;
        const COPY = 1 << 7;
        const MOVE = 1 << 8;
        const DELETE = 1 << 9;
        const LOCK = 1 << 10;
        const UNLOCK = 1 << 11;

        /// Plain HTTP, read-only.
        const HTTP_RO = Self::OPTIONS.bits() | Self::HEAD.bits() | Self::GET.bits();
        /// Plain HTTP, with uploads.
        const HTTP_RW = Self::HTTP_RO.bits() | Self::PUT.bits();
        /// Read-only WebDAV.
        const WEBDAV_RO = Self::HTTP_RO.bits() | Self::PROPFIND.bits();
        /// Everything.
        const WEBDAV_RW = Self::WEBDAV_RO.bits() | Self::PUT.bits() | Self::MKCOL.bits()
            | Self::PROPPATCH.bits() | Self::COPY.bits() | Self::MOVE.bits()
            | Self::DELETE.bits() | Self::LOCK.bits() | Self::UNLOCK.bits();

        // methods that may carry a request body.
        const WEBDAV_BODY = Self::PUT.bits() | Self::PROPFIND.bits()
            | Self::PROPPATCH.bits() | Self::LOCK.bits();
    }
}

/// A set of allowed [`DavMethod`]s.
pub type DavMethodSet = DavMethod;

// Method names, in the order they are listed in the Allow: header.
pub(crate) const METHODS: &[(&str, DavMethod)] = &[
    ("OPTIONS", DavMethod::OPTIONS),
    ("HEAD", DavMethod::HEAD),
    ("GET", DavMethod::GET),
    ("PUT", DavMethod::PUT),
    ("MKCOL", DavMethod::MKCOL),
    ("PROPFIND", DavMethod::PROPFIND),
    ("PROPPATCH", DavMethod::PROPPATCH),
    ("COPY", DavMethod::COPY),
    ("MOVE", DavMethod::MOVE),
    ("DELETE", DavMethod::DELETE),
    ("LOCK", DavMethod::LOCK),
    ("UNLOCK", DavMethod::UNLOCK),
];

pub(crate) fn dav_method(m: &http::Method) -> DavResult<DavMethod> {
    METHODS
        .iter()
        .find(|(name, _)| *name == m.as_str())
        .map(|(_, dm)| *dm)
        .ok_or(DavError::UnknownDavMethod)
}

impl TryFrom<&http::Method> for DavMethod {
    type Error = DavError;

    fn try_from(m: &http::Method) -> DavResult<DavMethod> {
        dav_method(m)
    }
}

/// A `<D:error>` body wrapping one precondition element.
pub(crate) fn dav_xml_error(body: &str) -> Body {
    Body::from(format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<D:error xmlns:D=\"DAV:\">{body}</D:error>\n"
    ))
}

// Whole seconds since the epoch; times before it clamp to the epoch.
fn to_datetime(t: SystemTime) -> OffsetDateTime {
    t.duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| OffsetDateTime::from_unix_timestamp(d.as_secs() as i64).ok())
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

/// `Sun, 06 Nov 1994 08:49:37 GMT`, as used by getlastmodified.
pub(crate) fn systemtime_to_httpdate(t: SystemTime) -> String {
    httpdate(to_datetime(t))
}

fn httpdate(t: OffsetDateTime) -> String {
    const DAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    format!(
        "{}, {:02} {} {} {:02}:{:02}:{:02} GMT",
        DAYS[t.weekday().number_days_from_monday() as usize],
        t.day(),
        MONTHS[u8::from(t.month()) as usize - 1],
        t.year(),
        t.hour(),
        t.minute(),
        t.second()
    )
}

/// `1994-11-06T08:49:37Z`, as used by creationdate.
pub(crate) fn systemtime_to_rfc3339(t: SystemTime) -> String {
    to_datetime(t)
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

// Write target for the XML emitters; hands out what was written so far.
#[derive(Clone, Default)]
pub(crate) struct MemBuffer(BytesMut);

impl MemBuffer {
    pub fn new() -> MemBuffer {
        MemBuffer::default()
    }

    pub fn take(&mut self) -> Bytes {
        self.0.split().freeze()
    }
}

impl Write for MemBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
