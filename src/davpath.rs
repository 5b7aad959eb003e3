//! Utility module to handle the path part of an URL as a filesytem path.
//!
//! A `DavPath` is percent-decoded and normalized: `.` and `..` segments are
//! resolved, duplicate slashes removed. A path that would climb above the
//! root is refused with `DavError::ForbiddenPath`.
use std::fmt;
#[cfg(unix)]
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use percent_encoding::{percent_decode, percent_encode, AsciiSet, CONTROLS};

use crate::errors::DavError;
use crate::fs::FsError;

// Encode all non-unreserved characters, except '/'.
const PATH_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// URL path, with hidden prefix.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DavPath {
    fullpath: Vec<u8>,
    pfxlen: usize,
    star: bool,
}

impl fmt::Display for DavPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_url_string_with_prefix())
    }
}

impl fmt::Debug for DavPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_url_string_with_prefix())
    }
}

// decode and normalize. returns the path with a leading slash, and a
// trailing slash if the input had one.
fn normalize_path(rp: &[u8]) -> Result<Vec<u8>, DavError> {
    if rp.is_empty() || rp[0] != b'/' {
        return Err(DavError::InvalidPath);
    }
    let decoded: Vec<u8> = percent_decode(rp).collect();
    // NUL ends a C path; a backslash is a separator on some platforms.
    if decoded.iter().any(|&c| c == 0 || c == b'\\') {
        return Err(DavError::InvalidPath);
    }
    let is_dir = decoded.ends_with(b"/");

    let mut segments: Vec<&[u8]> = Vec::new();
    for seg in decoded.split(|&c| c == b'/') {
        match seg {
            b"" | b"." => {}
            b".." => {
                if segments.pop().is_none() {
                    return Err(DavError::ForbiddenPath);
                }
            }
            _ => segments.push(seg),
        }
    }

    let mut v = Vec::with_capacity(decoded.len() + 1);
    for seg in &segments {
        v.push(b'/');
        v.extend_from_slice(seg);
    }
    if v.is_empty() || is_dir {
        v.push(b'/');
    }
    Ok(v)
}

fn normalize_prefix(prefix: &str) -> Result<Vec<u8>, DavError> {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return Ok(Vec::new());
    }
    let prefix = if prefix.starts_with('/') {
        prefix.to_string()
    } else {
        format!("/{prefix}")
    };
    let mut p = normalize_path(prefix.as_bytes())?;
    if p.ends_with(b"/") {
        p.pop();
    }
    Ok(p)
}

impl DavPath {
    /// from URL encoded path, without a prefix.
    pub fn new(src: &str) -> Result<DavPath, DavError> {
        Self::from_str_and_prefix(src, "")
    }

    /// from URL encoded path and non-encoded prefix.
    ///
    /// A path that does not start with the prefix is reported as not found.
    pub fn from_str_and_prefix(src: &str, prefix: &str) -> Result<DavPath, DavError> {
        if src == "*" {
            return Ok(DavPath {
                fullpath: b"*".to_vec(),
                pfxlen: 0,
                star: true,
            });
        }
        let path = normalize_path(src.as_bytes())?;
        let pfx = normalize_prefix(prefix)?;
        if !path.starts_with(&pfx) {
            return Err(FsError::NotFound.into());
        }
        let mut fullpath = path;
        let pfxlen = pfx.len();
        match fullpath.get(pfxlen) {
            // "/prefix" itself.
            None => fullpath.push(b'/'),
            Some(b'/') => {}
            // "/prefixfoo" does not match "/prefix".
            Some(_) => return Err(FsError::NotFound.into()),
        }
        Ok(DavPath {
            fullpath,
            pfxlen,
            star: false,
        })
    }

    /// from request.uri
    pub fn from_uri_and_prefix(uri: &http::Uri, prefix: &str) -> Result<DavPath, DavError> {
        match uri.path() {
            "*" => Self::from_str_and_prefix("*", prefix),
            path if path.starts_with('/') => Self::from_str_and_prefix(path, prefix),
            _ => Err(DavError::InvalidPath),
        }
    }

    /// from request.uri, without a prefix.
    pub fn from_uri(uri: &http::Uri) -> Result<DavPath, DavError> {
        Self::from_uri_and_prefix(uri, "")
    }

    /// Is this the "*" path (OPTIONS * HTTP/1.1)
    pub fn is_star(&self) -> bool {
        self.star
    }

    /// Is this the root of the served tree.
    pub fn is_root(&self) -> bool {
        self.as_bytes() == b"/"
    }

    /// The prefix, without trailing slash.
    pub fn prefix(&self) -> &[u8] {
        &self.fullpath[..self.pfxlen]
    }

    /// The path, relative to the prefix, as raw (decoded) bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.fullpath[self.pfxlen..]
    }

    /// The path relative to the prefix, without a trailing slash.
    /// The root is returned as "/".
    pub fn as_bytes_noslash(&self) -> &[u8] {
        let b = self.as_bytes();
        if b.len() > 1 && b.ends_with(b"/") {
            &b[..b.len() - 1]
        } else {
            b
        }
    }

    /// The path relative to the prefix, URL encoded.
    pub fn as_url_string(&self) -> String {
        percent_encode(self.as_bytes(), PATH_ENCODE_SET).to_string()
    }

    /// The full path, prefix included, URL encoded.
    pub fn as_url_string_with_prefix(&self) -> String {
        percent_encode(&self.fullpath, PATH_ENCODE_SET).to_string()
    }

    /// The path relative to the prefix, as a relative OS path
    /// (no leading slash).
    pub fn as_rel_ospath(&self) -> PathBuf {
        let b = self.as_bytes_noslash();
        let b = b.strip_prefix(b"/").unwrap_or(b);
        #[cfg(unix)]
        {
            Path::new(std::ffi::OsStr::from_bytes(b)).to_path_buf()
        }
        #[cfg(not(unix))]
        {
            PathBuf::from(String::from_utf8_lossy(b).into_owned())
        }
    }

    /// Does the path end in a slash.
    pub fn is_collection(&self) -> bool {
        self.fullpath.ends_with(b"/")
    }

    /// Add a slash to the end of the path (if not already present).
    pub fn add_slash(&mut self) {
        if !self.is_collection() {
            self.fullpath.push(b'/');
        }
    }

    /// Remove a trailing slash, unless this is the root.
    pub fn remove_slash(&mut self) {
        if self.as_bytes().len() > 1 && self.is_collection() {
            self.fullpath.pop();
        }
    }

    /// Add a segment to the end of the path.
    pub fn push_segment(&mut self, b: &[u8]) {
        self.add_slash();
        self.fullpath.extend_from_slice(b);
    }

    /// The parent collection of this path (the root is its own parent).
    pub fn parent(&self) -> DavPath {
        let mut segs = self.as_bytes_noslash().to_vec();
        match segs.iter().rposition(|&c| c == b'/') {
            Some(0) | None => segs = b"/".to_vec(),
            Some(idx) => segs.truncate(idx + 1),
        }
        let mut fullpath = self.prefix().to_vec();
        fullpath.extend_from_slice(&segs);
        DavPath {
            fullpath,
            pfxlen: self.pfxlen,
            star: false,
        }
    }

    /// The last segment of the path (empty for the root).
    pub fn file_name(&self) -> &[u8] {
        let b = self.as_bytes_noslash();
        match b.iter().rposition(|&c| c == b'/') {
            Some(idx) => &b[idx + 1..],
            None => b,
        }
    }

    /// Number of segments below the root.
    pub fn depth(&self) -> usize {
        self.as_bytes_noslash()
            .split(|&c| c == b'/')
            .filter(|s| !s.is_empty())
            .count()
    }

    /// Is `self` equal to `other`, or is it one of its ancestors.
    ///
    /// Trailing slashes are ignored.
    pub fn is_ancestor_or_self(&self, other: &DavPath) -> bool {
        let a = self.as_bytes_noslash();
        let b = other.as_bytes_noslash();
        if a == b"/" || a == b {
            return true;
        }
        b.len() > a.len() && b.starts_with(a) && b[a.len()] == b'/'
    }

    /// Replace the `from` part at the start of this path with `to`.
    pub(crate) fn rebase(&self, from: &DavPath, to: &DavPath) -> DavPath {
        let flen = if from.is_root() {
            0
        } else {
            from.as_bytes_noslash().len()
        };
        let tail = &self.as_bytes_noslash()[flen..];
        let mut p = to.clone();
        p.remove_slash();
        if p.is_root() {
            p.fullpath.pop();
        }
        p.fullpath.extend_from_slice(tail);
        if p.as_bytes().is_empty() {
            p.fullpath.push(b'/');
        }
        if self.is_collection() {
            p.add_slash();
        }
        p
    }

    /// Guess the mime type from the extension.
    pub fn get_mime_type_str(&self) -> &'static str {
        let name = String::from_utf8_lossy(self.file_name());
        let d = name.rsplitn(2, '.').collect::<Vec<&str>>();
        if d.len() > 1 {
            if let Some(mime) = mime_guess::from_ext(&d[0].to_lowercase()).first_raw() {
                return mime;
            }
        }
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        let p = DavPath::new("/a/./b//c/../d").unwrap();
        assert_eq!(p.as_bytes(), b"/a/b/d");
        let p = DavPath::new("/a/b/").unwrap();
        assert!(p.is_collection());
        let p = DavPath::new("/").unwrap();
        assert!(p.is_root());
        let p = DavPath::new("/foo%20bar").unwrap();
        assert_eq!(p.as_bytes(), b"/foo bar");
        assert_eq!(p.as_url_string(), "/foo%20bar");
    }

    #[test]
    fn test_escape_root() {
        assert!(matches!(DavPath::new("/../etc/passwd"), Err(DavError::ForbiddenPath)));
        assert!(matches!(DavPath::new("/a/../../b"), Err(DavError::ForbiddenPath)));
        assert!(matches!(DavPath::new("/%2e%2e/x"), Err(DavError::ForbiddenPath)));
        assert!(matches!(DavPath::new("/a%00b"), Err(DavError::InvalidPath)));
        assert!(matches!(DavPath::new("/a/..%5c..%5cetc"), Err(DavError::InvalidPath)));
        assert!(matches!(DavPath::new("/a%5Cb"), Err(DavError::InvalidPath)));
    }

    #[test]
    fn test_prefix() {
        let p = DavPath::from_str_and_prefix("/dav/a/b.txt", "/dav/").unwrap();
        assert_eq!(p.as_bytes(), b"/a/b.txt");
        assert_eq!(p.as_url_string_with_prefix(), "/dav/a/b.txt");
        let p = DavPath::from_str_and_prefix("/dav", "/dav").unwrap();
        assert!(p.is_root());
        assert_eq!(p.as_url_string_with_prefix(), "/dav/");
        assert!(DavPath::from_str_and_prefix("/davx/a", "/dav").is_err());
        assert!(DavPath::from_str_and_prefix("/other", "/dav").is_err());
    }

    #[test]
    fn test_parent_and_name() {
        let p = DavPath::from_str_and_prefix("/dav/a/b/c.txt", "/dav").unwrap();
        assert_eq!(p.file_name(), b"c.txt");
        assert_eq!(p.parent().as_bytes(), b"/a/b/");
        assert_eq!(p.parent().parent().as_bytes(), b"/a/");
        assert_eq!(p.parent().parent().parent().as_bytes(), b"/");
        assert_eq!(p.depth(), 3);
        assert_eq!(p.get_mime_type_str(), "text/plain");
    }

    #[test]
    fn test_ancestor_and_rebase() {
        let a = DavPath::new("/a/").unwrap();
        let b = DavPath::new("/a/b/c").unwrap();
        let ab = DavPath::new("/ab").unwrap();
        assert!(a.is_ancestor_or_self(&b));
        assert!(!a.is_ancestor_or_self(&ab));
        assert!(DavPath::new("/").unwrap().is_ancestor_or_self(&ab));

        let to = DavPath::new("/x").unwrap();
        assert_eq!(b.rebase(&a, &to).as_bytes(), b"/x/b/c");
        assert_eq!(a.rebase(&a, &to).as_bytes(), b"/x/");
    }
}
