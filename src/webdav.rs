//! Host-facing WebDAV handler.
//!
//! [`WebDav`] serves a local directory below a URL prefix. Both are
//! configured with `{placeholder}`s that the host resolves per request
//! through a [`Replacer`], so one instance can serve a different root for
//! every virtual host. Every resolved root has its own lock table and
//! dead property store, shared by all requests for that root.
//!
//! On top of the plain protocol engine it adds a few conveniences for
//! browsers and simple clients:
//!
//! - `GET`/`HEAD` on a collection returns its `PROPFIND` listing
//!   (`Depth: 1` unless the client sent a Depth).
//! - `PUT`/`POST` create missing parent collections, once the request's
//!   preconditions and the locks on the new collections allow it.
//! - `HEAD` never returns a body.
//!
//! ```no_run
//! use std::collections::HashMap;
//! use dav_engine::webdav::{WebDav, WebDavConfig};
//!
//! # async fn serve(req: http::Request<hyper::Body>) -> http::Response<dav_engine::body::Body> {
//! let config: WebDavConfig = serde_json::from_str(r#"{ "root": "{site}", "prefix": "/dav" }"#).unwrap();
//! let webdav = WebDav::provision(config);
//!
//! let mut vars = HashMap::new();
//! vars.insert("site".to_string(), "/srv/www".to_string());
//! webdav.serve(req, &vars).await
//! # }
//! ```
use std::collections::HashMap;
use std::error::Error as StdError;
use std::hash::BuildHasher;
use std::sync::Arc;

use bytes::Buf;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::request::Parts;
use http::{Method, Request, Response, StatusCode};
use http_body::Body as HttpBody;
use parking_lot::Mutex;
use regex::{Captures, Regex};
use serde::Deserialize;

use crate::body::Body;
use crate::conditional::if_match_get_tokens;
use crate::davhandler::{error_response, DavHandler, FileSystem, Logger};
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::fs::{DavFileSystem, FsError, FsResult};
use crate::ls::memls::MemLs;
use crate::ls::DavLockSystem;
use crate::ps::memps::MemPs;
use crate::ps::DavPropStore;

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{([^{}]+)\}").unwrap();
}

/// Configuration of a [`WebDav`] handler.
///
/// Deserializes from e.g. `{ "root": "/srv/dav", "prefix": "/dav" }`;
/// missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WebDavConfig {
    /// Directory to serve. Defaults to `{http.vars.root}`.
    pub root: String,
    /// URL path prefix to strip off. Defaults to none.
    pub prefix: String,
    /// Create missing parent collections on PUT/POST. Defaults to true.
    pub create_parents: bool,
}

impl Default for WebDavConfig {
    fn default() -> Self {
        WebDavConfig {
            root: "{http.vars.root}".to_string(),
            prefix: String::new(),
            create_parents: true,
        }
    }
}

/// Resolves `{placeholder}`s in the configuration.
pub trait Replacer: Send + Sync {
    /// Value of `key` (the placeholder without braces), if known.
    fn get(&self, key: &str) -> Option<String>;

    /// Replace every placeholder in `input`. Unknown ones become `empty`.
    fn replace_all(&self, input: &str, empty: &str) -> String {
        PLACEHOLDER
            .replace_all(input, |caps: &Captures| {
                self.get(&caps[1]).unwrap_or_else(|| empty.to_string())
            })
            .into_owned()
    }
}

impl<S: BuildHasher + Send + Sync> Replacer for HashMap<String, String, S> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// Knows no placeholders at all.
impl Replacer for () {
    fn get(&self, _key: &str) -> Option<String> {
        None
    }
}

// Lock table and dead property store of one root.
#[derive(Clone)]
struct Stores {
    ls: Arc<dyn DavLockSystem>,
    ps: Arc<dyn DavPropStore>,
}

/// The host-facing handler. Cheap to clone; clones share their state.
#[derive(Clone)]
pub struct WebDav {
    config: Arc<WebDavConfig>,
    stores: Arc<Mutex<HashMap<String, Stores>>>,
    logger: Logger,
}

impl WebDav {
    /// Set up the handler. Lock tables and property stores are created
    /// per root on first use and live as long as the handler.
    pub fn provision(config: WebDavConfig) -> WebDav {
        debug!("webdav: root {:?} prefix {:?}", config.root, config.prefix);
        WebDav {
            config: Arc::new(config),
            stores: Arc::new(Mutex::new(HashMap::new())),
            logger: Arc::new(log_errors),
        }
    }

    /// Replace the default logger, which logs failed requests at error level.
    pub fn with_logger<F>(self, logger: F) -> Self
    where
        F: Fn(&Request<()>, Option<&DavError>) + Send + Sync + 'static,
    {
        WebDav {
            logger: Arc::new(logger),
            ..self
        }
    }

    pub fn config(&self) -> &WebDavConfig {
        &self.config
    }

    fn stores(&self, root: &str) -> Stores {
        let key = match root.trim_end_matches('/') {
            "" => "/",
            r => r,
        };
        self.stores
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!("webdav: new lock table and property store for {key:?}");
                Stores {
                    ls: MemLs::new(),
                    ps: MemPs::new(),
                }
            })
            .clone()
    }

    // A handler for the resolved root and prefix.
    fn handler(&self, root: String, prefix: &str) -> DavHandler {
        let stores = self.stores(&root);
        DavHandler::builder(FileSystem::local(root, true))
            .strip_prefix(prefix)
            .locksystem_instance(stores.ls)
            .propstore_instance(stores.ps)
            .logger_arc(self.logger.clone())
            .build()
    }

    /// Handle one request.
    pub async fn serve<ReqBody, ReqData, ReqError>(
        &self,
        req: Request<ReqBody>,
        repl: &dyn Replacer,
    ) -> Response<Body>
    where
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
    {
        let root = repl.replace_all(&self.config.root, ".");
        let prefix = repl.replace_all(&self.config.prefix, "");
        let dav = self.handler(root, &prefix);

        let (mut parts, body) = req.into_parts();
        let is_head = parts.method == Method::HEAD;

        // paths outside the prefix are left to the engine to reject.
        if let Ok(path) = DavPath::from_uri_and_prefix(&parts.uri, &prefix) {
            match parts.method {
                Method::GET | Method::HEAD => {
                    let is_dir = dav.fs.metadata(&path).await.is_ok_and(|m| m.is_dir());
                    if is_dir {
                        if let Ok(m) = Method::from_bytes(b"PROPFIND") {
                            trace!("webdav: {} {path}: listing collection", parts.method);
                            parts.method = m;
                            if !parts.headers.contains_key("depth") {
                                parts.headers.insert("depth", HeaderValue::from_static("1"));
                            }
                        }
                    }
                }
                Method::PUT | Method::POST if self.config.create_parents => {
                    if let Err(res) = create_parents(&dav, &parts, &path).await {
                        return res;
                    }
                }
                _ => {}
            }
        }

        let mut res = dav.handle(Request::from_parts(parts, body)).await;
        if is_head {
            *res.body_mut() = Body::empty();
        }
        res
    }
}

fn log_errors(req: &Request<()>, err: Option<&DavError>) {
    if let Some(err) = err {
        error!("internal handler error: {err} ({} {})", req.method(), req.uri());
    }
}

// The collections missing above `path`, deepest first.
async fn missing_parents(fs: &dyn DavFileSystem, path: &DavPath) -> FsResult<Vec<DavPath>> {
    let mut missing = Vec::new();
    let mut dir = path.parent();
    loop {
        match fs.metadata(&dir).await {
            Ok(m) if m.is_dir() => break,
            Ok(_) => return Err(FsError::Conflict),
            Err(FsError::NotFound) => {
                missing.push(dir.clone());
                if dir.is_root() {
                    break;
                }
                dir = dir.parent();
            }
            Err(e) => return Err(e),
        }
    }
    Ok(missing)
}

// Create every missing collection above `path`. Nothing is created
// unless the request's preconditions hold and the locks on each new
// collection (and so on the existing collection above them) allow it.
async fn create_parents(dav: &DavHandler, parts: &Parts, path: &DavPath) -> Result<(), Response<Body>> {
    let missing = missing_parents(&*dav.fs, path)
        .await
        .map_err(|e| parents_failed(path, e))?;
    if missing.is_empty() {
        return Ok(());
    }

    let mut head = Request::new(());
    *head.method_mut() = parts.method.clone();
    *head.uri_mut() = parts.uri.clone();
    *head.headers_mut() = parts.headers.clone();

    // the target does not exist while its parent is missing.
    let tokens = if_match_get_tokens(&head, None, &dav.fs, dav.ls.as_ref(), path)
        .await
        .map_err(|status| {
            debug!("webdav: {path}: preconditions failed, not creating parents");
            error_response(&DavError::from(status))
        })?;
    for dir in missing.iter().rev() {
        dav.check_member_locks(dir, false, &tokens)?;
    }

    for dir in missing.iter().rev() {
        debug!("webdav: creating {dir}");
        match dav.fs.create_dir(dir).await {
            Ok(()) | Err(FsError::Exists) => {}
            Err(e) => return Err(parents_failed(path, e)),
        }
    }
    Ok(())
}

fn parents_failed(path: &DavPath, e: FsError) -> Response<Body> {
    error!("webdav: error creating directories for {path}: {e}");
    let mut res = Response::new(Body::from("Error creating directories\n"));
    *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    res.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    async fn body_string(res: Response<Body>) -> String {
        let mut body = res.into_body();
        let mut data = Vec::new();
        while let Some(chunk) = body.next().await {
            data.extend_from_slice(&chunk.unwrap());
        }
        String::from_utf8(data).unwrap()
    }

    fn request(method: &str, uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn vars(root: &std::path::Path) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("http.vars.root".to_string(), root.to_string_lossy().into_owned());
        vars
    }

    #[test]
    fn test_replace_all() {
        let mut vars = HashMap::new();
        vars.insert("host".to_string(), "example.org".to_string());
        assert_eq!(vars.replace_all("/srv/{host}/dav", "."), "/srv/example.org/dav");
        assert_eq!(vars.replace_all("{unknown}", "."), ".");
        assert_eq!(vars.replace_all("/dav{unknown}", ""), "/dav");
        assert_eq!(().replace_all("/plain", ""), "/plain");
    }

    #[test]
    fn test_config() {
        let c: WebDavConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(c, WebDavConfig::default());
        assert_eq!(c.root, "{http.vars.root}");
        assert!(c.create_parents);

        let c: WebDavConfig =
            serde_json::from_str(r#"{ "root": "/srv", "prefix": "/dav", "create_parents": false }"#).unwrap();
        assert_eq!(c.root, "/srv");
        assert_eq!(c.prefix, "/dav");
        assert!(!c.create_parents);
    }

    #[tokio::test]
    async fn test_put_creates_parents() {
        let _ = env_logger::builder().is_test(true).try_init();
        let tmp = tempfile::tempdir().unwrap();
        let webdav = WebDav::provision(WebDavConfig::default());
        let vars = vars(tmp.path());

        let res = webdav.serve(request("PUT", "/a/b/c.txt", "hello"), &vars).await;
        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(std::fs::read_to_string(tmp.path().join("a/b/c.txt")).unwrap(), "hello");

        let res = webdav.serve(request("GET", "/a/b/c.txt", ""), &vars).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_string(res).await, "hello");
    }

    #[tokio::test]
    async fn test_put_without_create_parents() {
        let tmp = tempfile::tempdir().unwrap();
        let config = WebDavConfig {
            create_parents: false,
            ..WebDavConfig::default()
        };
        let webdav = WebDav::provision(config);
        let res = webdav.serve(request("PUT", "/a/b/c.txt", "x"), &vars(tmp.path())).await;
        assert_eq!(res.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_get_collection_lists() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("dir")).unwrap();
        std::fs::write(tmp.path().join("dir/one"), "1").unwrap();
        std::fs::write(tmp.path().join("dir/two"), "2").unwrap();

        let webdav = WebDav::provision(WebDavConfig::default());
        let res = webdav.serve(request("GET", "/dir/", ""), &vars(tmp.path())).await;
        assert_eq!(res.status(), StatusCode::MULTI_STATUS);
        let body = body_string(res).await;
        assert_eq!(body.matches("<D:response>").count(), 3);
        assert!(body.contains("/dir/one"));

        let res = webdav.serve(request("HEAD", "/dir/", ""), &vars(tmp.path())).await;
        assert_eq!(res.status(), StatusCode::MULTI_STATUS);
        assert_eq!(body_string(res).await, "");
    }

    #[tokio::test]
    async fn test_prefix_placeholder() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("file"), "data").unwrap();
        let config = WebDavConfig {
            prefix: "/dav{missing}".to_string(),
            ..WebDavConfig::default()
        };
        let webdav = WebDav::provision(config);
        let vars = vars(tmp.path());

        let res = webdav.serve(request("GET", "/dav/file", ""), &vars).await;
        assert_eq!(res.status(), StatusCode::OK);
        let res = webdav.serve(request("GET", "/file", ""), &vars).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_logger() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let tmp = tempfile::tempdir().unwrap();
        let failures = Arc::new(AtomicUsize::new(0));
        let f = failures.clone();
        let webdav = WebDav::provision(WebDavConfig::default()).with_logger(move |_req, err| {
            if err.is_some() {
                f.fetch_add(1, Ordering::SeqCst);
            }
        });
        let vars = vars(tmp.path());
        webdav.serve(request("GET", "/nope", ""), &vars).await;
        webdav.serve(request("OPTIONS", "/", ""), &vars).await;
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }
}
