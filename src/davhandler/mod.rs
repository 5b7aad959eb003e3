//! The request handler and the helpers its method handlers share.
use std::collections::VecDeque;
use std::error::Error as StdError;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::{self, buf::Buf};
use futures_util::stream::{Stream, StreamExt};
use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};
use http_body::Body as HttpBody;

use crate::body::{Body, StreamBody};
use crate::davheaders;
use crate::davpath::DavPath;
use crate::errors::{DavError, DavResult};
use crate::fs::*;
use crate::ls::memls::MemLs;
use crate::ls::*;
use crate::multierror::MultiError;
use crate::ps::memps::MemPs;
use crate::ps::*;
use crate::util::{dav_method, dav_xml_error, DavMethod, DavMethodSet};

pub mod handle_copymove;
pub mod handle_delete;
pub mod handle_gethead;
use handle_gethead::READ_BUF_SIZE;
pub mod handle_lock;
pub mod handle_mkcol;
pub mod handle_options;
pub mod handle_props;
pub mod handle_put;

/// Default limit on how many levels a recursive operation descends.
pub const MAX_DEPTH: usize = 64;

/// Largest granted lock timeout; "Infinite" is granted this too.
pub const MAX_LOCK_TIMEOUT: u64 = 3600;

// Largest request body we read into memory (PROPFIND, PROPPATCH, LOCK).
const MAX_XML_BODY: usize = 65536;

/// Callback invoked once for every completed request, with the
/// request (without body) and the error, if any.
pub type Logger = Arc<dyn Fn(&Request<()>, Option<&DavError>) + Send + Sync>;

/// Configuration of the handler.
#[derive(Clone)]
pub struct DavBuilder {
    /// Prefix to be stripped off when handling request.
    prefix: String,
    /// Filesystem backend.
    fs: FileSystem,
    /// Locksystem backend.
    ls: Option<LockSystem>,
    /// Dead property store.
    ps: Option<PropStore>,
    /// Set of allowed methods (Defaults to "all methods")
    allow: DavMethodSet,
    /// Principal is webdav speak for "user", used to give locks an owner (if a locksystem is
    /// active).
    principal: Option<String>,
    /// How deep PROPFIND/COPY/DELETE descend.
    max_depth: usize,
    /// read buffer size in bytes
    read_buf_size: usize,
    /// Called after every request.
    logger: Option<Logger>,
}

/// File system backend.
#[derive(Clone)]
pub enum FileSystem {
    #[cfg(any(docsrs, feature = "memfs"))]
    Mem,
    #[cfg(any(docsrs, feature = "localfs"))]
    Local {
        /// Path to the root directory.
        base: PathBuf,
        public: bool,
    },
    /// An existing filesystem, shared with other handlers.
    Instance(Arc<dyn DavFileSystem>),
}

impl FileSystem {
    /// Serve a local directory
    #[cfg(any(docsrs, feature = "localfs"))]
    pub fn local(path: impl Into<PathBuf>, public: bool) -> Self {
        FileSystem::Local {
            base: path.into(),
            public,
        }
    }

    fn build(self) -> Arc<dyn DavFileSystem> {
        match self {
            #[cfg(any(docsrs, feature = "memfs"))]
            FileSystem::Mem => crate::fs::memfs::MemFs::new(),
            #[cfg(any(docsrs, feature = "localfs"))]
            FileSystem::Local { base, public } => crate::fs::localfs::LocalFs::new(base, public),
            FileSystem::Instance(fs) => fs,
        }
    }
}

/// Lock system backend.
#[derive(Default, Clone)]
pub enum LockSystem {
    #[default]
    Mem,
    /// An existing locksystem, shared with other handlers.
    Instance(Arc<dyn DavLockSystem>),
}

impl LockSystem {
    fn build(self) -> Arc<dyn DavLockSystem> {
        match self {
            LockSystem::Mem => MemLs::new(),
            LockSystem::Instance(ls) => ls,
        }
    }
}

/// Dead property store backend.
#[derive(Default, Clone)]
pub enum PropStore {
    #[default]
    Mem,
    /// An existing property store, shared with other handlers.
    Instance(Arc<dyn DavPropStore>),
}

impl PropStore {
    fn build(self) -> Arc<dyn DavPropStore> {
        match self {
            PropStore::Mem => MemPs::new(),
            PropStore::Instance(ps) => ps,
        }
    }
}

impl DavBuilder {
    /// Start configuring a handler that serves `fs`.
    pub fn new(fs: FileSystem) -> DavBuilder {
        Self {
            prefix: String::new(),
            fs,
            ls: None,
            ps: None,
            allow: DavMethodSet::all(),
            principal: None,
            max_depth: MAX_DEPTH,
            read_buf_size: READ_BUF_SIZE,
            logger: None,
        }
    }

    pub fn build(self) -> DavHandler {
        self.into()
    }

    /// URL prefix under which the tree is mounted. Request paths outside
    /// of it are answered with 404.
    pub fn strip_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Enable locking (class 2). Without a lock system LOCK and UNLOCK
    /// are refused and OPTIONS advertises `DAV: 1` only.
    pub fn locksystem(mut self, ls: LockSystem) -> Self {
        self.ls = Some(ls);
        self
    }

    pub fn locksystem_instance(self, ls: Arc<dyn DavLockSystem>) -> Self {
        self.locksystem(LockSystem::Instance(ls))
    }

    /// Enable dead properties. Without a store PROPPATCH answers 403.
    pub fn propstore(mut self, ps: PropStore) -> Self {
        self.ps = Some(ps);
        self
    }

    pub fn propstore_instance(self, ps: Arc<dyn DavPropStore>) -> Self {
        self.propstore(PropStore::Instance(ps))
    }

    /// Restrict the methods served. Others get 405.
    pub fn methods(mut self, allow: DavMethodSet) -> Self {
        self.allow = allow;
        self
    }

    /// Default owner of the locks this handler creates.
    pub fn principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// How many levels below the request path a Depth: infinity
    /// operation may descend (default 64).
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Chunk size used when streaming file contents.
    pub fn read_buf_size(mut self, size: usize) -> Self {
        self.read_buf_size = size;
        self
    }

    /// Callback invoked after every request, with the error if there was one.
    pub fn logger<F>(self, logger: F) -> Self
    where
        F: Fn(&Request<()>, Option<&DavError>) + Send + Sync + 'static,
    {
        self.logger_arc(Arc::new(logger))
    }

    pub(crate) fn logger_arc(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }
}

/// A WebDAV request handler.
///
/// Built with [`DavHandler::builder`]. Cloning is cheap and clones share
/// the filesystem, locks and properties.
#[derive(Clone)]
pub struct DavHandler {
    pub(crate) prefix: Arc<String>,
    pub(crate) fs: Arc<dyn DavFileSystem>,
    pub(crate) ls: Option<Arc<dyn DavLockSystem>>,
    pub(crate) ps: Option<Arc<dyn DavPropStore>>,
    pub(crate) allow: DavMethodSet,
    pub(crate) principal: Option<Arc<String>>,
    pub(crate) max_depth: usize,
    pub(crate) read_buf_size: usize,
    pub(crate) logger: Option<Logger>,
}

impl From<DavBuilder> for DavHandler {
    fn from(cfg: DavBuilder) -> Self {
        Self {
            prefix: Arc::new(cfg.prefix),
            fs: cfg.fs.build(),
            ls: cfg.ls.map(|ls| ls.build()),
            ps: cfg.ps.map(|ps| ps.build()),
            allow: cfg.allow,
            principal: cfg.principal.map(Arc::new),
            max_depth: cfg.max_depth,
            read_buf_size: cfg.read_buf_size,
            logger: cfg.logger,
        }
    }
}

impl DavHandler {
    pub fn builder(fs: FileSystem) -> DavBuilder {
        DavBuilder::new(fs)
    }

    /// Serve one request.
    pub async fn handle<ReqBody, ReqData, ReqError>(&self, req: Request<ReqBody>) -> Response<Body>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
    {
        self.handle_inner(req).await
    }

    /// Like [`handle`](Self::handle), with an extra prefix appended to the
    /// configured one and a per-request principal (the authenticated user).
    pub async fn handle_with<ReqBody, ReqData, ReqError>(
        &self,
        req: Request<ReqBody>,
        prefix: Option<String>,
        principal: Option<String>,
    ) -> Response<Body>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
    {
        let mut this = self.clone();
        if let Some(prefix) = prefix {
            this.prefix = Arc::new(format!(
                "{}/{}",
                this.prefix.strip_suffix('/').unwrap_or(&this.prefix),
                prefix.strip_prefix('/').unwrap_or(&prefix)
            ));
        }
        if let Some(principal) = principal {
            this.principal = Some(Arc::new(principal));
        }
        this.handle_inner(req).await
    }

    /// Handle a request whose body is a `Stream` of chunks rather than
    /// a `http_body::Body`.
    pub async fn handle_stream<ReqBody, ReqData, ReqError>(&self, req: Request<ReqBody>) -> Response<Body>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: Stream<Item = Result<ReqData, ReqError>>,
    {
        let req = {
            let (parts, body) = req.into_parts();
            Request::from_parts(parts, StreamBody::new(body))
        };
        self.handle_inner(req).await
    }
}

impl DavHandler {
    // helper.
    pub(crate) async fn has_parent<'a>(&'a self, path: &'a DavPath) -> bool {
        let p = path.parent();
        self.fs.metadata(&p).await.map(|m| m.is_dir()).unwrap_or(false)
    }

    // helper.
    pub(crate) fn path(&self, req: &Request<()>) -> DavResult<DavPath> {
        DavPath::from_uri_and_prefix(req.uri(), &self.prefix)
    }

    // A collection requested without the trailing slash: add it, and
    // tell the client through Content-Location.
    pub(crate) fn fixpath(
        &self,
        res: &mut Response<Body>,
        path: &mut DavPath,
        meta: Box<dyn DavMetaData>,
    ) -> Box<dyn DavMetaData> {
        if meta.is_dir() && !path.is_collection() {
            path.add_slash();
            let newloc = path.as_url_string_with_prefix();
            res.headers_mut().typed_insert(davheaders::ContentLocation(newloc));
        }
        meta
    }

    // Check the locks on `path` (and below it, if `deep`) against the
    // submitted tokens. Returns the 423 response on conflict.
    pub(crate) fn check_locks(&self, path: &DavPath, deep: bool, tokens: &[String]) -> Result<(), Response<Body>> {
        let ls = match self.ls {
            Some(ref ls) => ls,
            None => return Ok(()),
        };
        let t = tokens.iter().map(|s| s.as_str()).collect::<Vec<&str>>();
        let principal = self.principal.as_deref().map(|s| s.as_str());
        match ls.check(path, principal, false, deep, t) {
            Ok(()) => Ok(()),
            Err(l) => {
                debug!("{path} is locked by {} on {}", l.token, l.path);
                Err(locked_response(&l))
            }
        }
    }

    // Like check_locks, for requests that add `path` to or remove it from
    // its parent collection: locks on the parent apply as well.
    pub(crate) fn check_member_locks(&self, path: &DavPath, deep: bool, tokens: &[String]) -> Result<(), Response<Body>> {
        if !path.is_root() {
            self.check_locks(&path.parent(), false, tokens)?;
        }
        self.check_locks(path, deep, tokens)
    }

    // Breadth-first listing of everything below `root` (down to `levels`
    // if given), children of a collection sorted by name. Collections
    // `max_depth` levels down are listed but not descended into; they are
    // added to `errors` with 507. Collections that cannot be read are
    // added with their status.
    pub(crate) async fn walk_tree(
        &self,
        root: &DavPath,
        levels: Option<usize>,
        errors: &mut MultiError,
    ) -> Vec<TreeNode> {
        let mut nodes = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back((root.clone(), 0usize));

        while let Some((dir, level)) = queue.pop_front() {
            if levels.is_some_and(|l| level >= l) {
                continue;
            }
            if level >= self.max_depth {
                debug!("walk_tree: {dir}: max depth {} reached", self.max_depth);
                errors.add_status(&dir, StatusCode::INSUFFICIENT_STORAGE);
                continue;
            }
            let mut entries = match self.fs.read_dir(&dir, ReadDirMeta::DataSymlink).await {
                Ok(entries) => entries,
                Err(e) => {
                    debug!("walk_tree: read_dir {dir}: {e}");
                    errors.add_status(&dir, DavError::from(e).statuscode());
                    continue;
                }
            };
            let mut children = Vec::new();
            while let Some(dirent) = entries.next().await {
                let name = dirent.name();
                match dirent.metadata().await {
                    Ok(meta) => children.push((name, meta)),
                    Err(e) => debug!("walk_tree: metadata of entry in {dir}: {e}"),
                }
            }
            children.sort_by(|a, b| a.0.cmp(&b.0));

            for (name, meta) in children {
                let mut path = dir.clone();
                path.push_segment(&name);
                let is_dir = meta.is_dir() && !meta.is_symlink();
                if is_dir {
                    path.add_slash();
                    queue.push_back((path.clone(), level + 1));
                }
                nodes.push(TreeNode { path, meta });
            }
        }
        nodes
    }

    // Collect a small request body (XML), refusing more than `max_size`.
    pub(crate) async fn read_request<ReqBody, ReqData, ReqError>(
        &self,
        body: ReqBody,
        max_size: usize,
    ) -> DavResult<Vec<u8>>
    where
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
    {
        let mut data = Vec::new();
        pin_utils::pin_mut!(body);
        while let Some(chunk) = body.data().await {
            let mut chunk = chunk.map_err(|e| {
                debug!("reading request body: {e}");
                DavError::IoError(io::Error::new(io::ErrorKind::UnexpectedEof, e.to_string()))
            })?;
            if data.len() + chunk.remaining() > max_size {
                return Err(StatusCode::PAYLOAD_TOO_LARGE.into());
            }
            while chunk.has_remaining() {
                let n = chunk.chunk().len();
                data.extend_from_slice(chunk.chunk());
                chunk.advance(n);
            }
        }
        Ok(data)
    }

    // Runs the request and converts a failure into its status response.
    async fn handle_inner<ReqBody, ReqData, ReqError>(&self, req: Request<ReqBody>) -> Response<Body>
    where
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
    {
        let (req, body) = {
            let (parts, body) = req.into_parts();
            (Request::from_parts(parts, ()), body)
        };

        let (resp, err) = match self.dispatch(&req, body).await {
            Ok(resp) => {
                debug!("{} {}: {}", req.method(), req.uri(), resp.status());
                (resp, None)
            }
            Err(err) => {
                debug!("{} {}: {err:?}", req.method(), req.uri());
                if err.is_internal() {
                    error!("{} {}: {}", req.method(), req.uri(), err);
                }
                (error_response(&err), Some(err))
            }
        };

        if let Some(ref logger) = self.logger {
            logger(&req, err.as_ref());
        }
        resp
    }

    async fn dispatch<ReqBody, ReqData, ReqError>(&self, req: &Request<()>, body: ReqBody) -> DavResult<Response<Body>>
    where
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
    {
        let method = dav_method(req.method())?;
        if !self.allow.contains(method) {
            debug!("{} is disabled", req.method());
            return Err(DavError::StatusClose(StatusCode::METHOD_NOT_ALLOWED));
        }

        // no locksystem, no locking.
        if (method == DavMethod::LOCK || method == DavMethod::UNLOCK) && self.ls.is_none() {
            return Err(DavError::StatusClose(StatusCode::METHOD_NOT_ALLOWED));
        }

        let path = self.path(req)?;
        if path.is_star() && method != DavMethod::OPTIONS {
            return Err(DavError::InvalidPath);
        }

        // PUT streams its body to the file; everything else gets at most
        // a small XML document.
        let (body_strm, body_data) = if method == DavMethod::PUT {
            (Some(body), Vec::new())
        } else {
            (None, self.read_request(body, MAX_XML_BODY).await?)
        };

        if !DavMethod::WEBDAV_BODY.contains(method) && !body_data.is_empty() {
            return Err(StatusCode::UNSUPPORTED_MEDIA_TYPE.into());
        }

        debug!("{method:?} {path}");

        match (method, body_strm) {
            (DavMethod::OPTIONS, _) => self.handle_options(req).await,
            (DavMethod::PROPFIND, _) => self.handle_propfind(req, &body_data).await,
            (DavMethod::PROPPATCH, _) => self.handle_proppatch(req, &body_data).await,
            (DavMethod::MKCOL, _) => self.handle_mkcol(req).await,
            (DavMethod::DELETE, _) => self.handle_delete(req).await,
            (DavMethod::LOCK, _) => self.handle_lock(req, &body_data).await,
            (DavMethod::UNLOCK, _) => self.handle_unlock(req).await,
            (DavMethod::HEAD, _) | (DavMethod::GET, _) => self.handle_get(req).await,
            (DavMethod::COPY, _) | (DavMethod::MOVE, _) => self.handle_copymove(req, method).await,
            (DavMethod::PUT, Some(body)) => self.handle_put(req, body).await,
            _ => Err(DavError::UnknownDavMethod),
        }
    }
}

/// One resource found by `walk_tree`.
pub(crate) struct TreeNode {
    pub path: DavPath,
    pub meta: Box<dyn DavMetaData>,
}

impl TreeNode {
    pub fn is_dir(&self) -> bool {
        self.meta.is_dir() && !self.meta.is_symlink()
    }
}

// Empty-bodied response for an error.
pub(crate) fn error_response(err: &DavError) -> Response<Body> {
    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = err.statuscode();
    resp.headers_mut().typed_insert(headers::ContentLength(0));
    if err.must_close() {
        resp.headers_mut()
            .insert(http::header::CONNECTION, http::HeaderValue::from_static("close"));
    }
    resp
}

// 423 Locked, with the root of the conflicting lock.
pub(crate) fn locked_response(lock: &DavLock) -> Response<Body> {
    let href = lock.path.as_url_string_with_prefix();
    let body = format!(
        "<D:lock-token-submitted><D:href>{}</D:href></D:lock-token-submitted>",
        xml::escape::escape_str_pcdata(&href)
    );
    xml_response(StatusCode::LOCKED, dav_xml_error(&body))
}

// A response with an XML body.
pub(crate) fn xml_response(status: StatusCode, body: Body) -> Response<Body> {
    let mut res = Response::new(body);
    *res.status_mut() = status;
    res.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/xml; charset=utf-8"),
    );
    res
}
