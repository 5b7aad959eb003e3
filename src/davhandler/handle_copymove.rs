use std::collections::HashSet;

use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::conditional::if_match_get_tokens;
use crate::davheaders::{self, Depth};
use crate::davpath::DavPath;
use crate::errors::{DavError, DavResult};
use crate::fs::FsError;
use crate::multierror::MultiError;
use crate::util::DavMethod;

impl crate::DavHandler {
    pub(crate) async fn handle_copymove(&self, req: &Request<()>, method: DavMethod) -> DavResult<Response<Body>> {
        let mut path = self.path(req)?;
        let meta = self.fs.symlink_metadata(&path).await?;
        let is_dir = meta.is_dir() && !meta.is_symlink();
        if is_dir {
            path.add_slash();
        }

        // parse headers.
        let depth = match req.headers().typed_try_get::<Depth>() {
            Ok(None) => Depth::Infinity,
            Ok(Some(Depth::One)) | Err(_) => return Err(StatusCode::BAD_REQUEST.into()),
            Ok(Some(Depth::Zero)) if method == DavMethod::MOVE => return Err(StatusCode::BAD_REQUEST.into()),
            Ok(Some(d)) => d,
        };
        let overwrite = match req.headers().typed_try_get::<davheaders::Overwrite>() {
            Ok(o) => o.map(|o| o.0).unwrap_or(true),
            Err(_) => return Err(StatusCode::BAD_REQUEST.into()),
        };
        let dest = match req.headers().typed_try_get::<davheaders::Destination>() {
            Ok(Some(d)) => d,
            _ => return Err(StatusCode::BAD_REQUEST.into()),
        };

        // the destination must be in our part of the URL space.
        let mut dest = match DavPath::from_str_and_prefix(&dest.0, &self.prefix) {
            Ok(d) => d,
            Err(DavError::FsError(FsError::NotFound)) => return Err(StatusCode::BAD_GATEWAY.into()),
            Err(e) => return Err(e),
        };
        if is_dir {
            dest.add_slash();
        } else if dest.is_collection() {
            return Err(StatusCode::CONFLICT.into());
        }

        // source and destination must not overlap.
        if path.is_ancestor_or_self(&dest) || (is_dir && dest.is_ancestor_or_self(&path)) {
            debug!("{method:?} {path} -> {dest}: overlapping paths");
            return Err(StatusCode::FORBIDDEN.into());
        }
        if dest.is_root() || (method == DavMethod::MOVE && path.is_root()) {
            return Err(StatusCode::FORBIDDEN.into());
        }
        if !self.has_parent(&dest).await {
            return Err(StatusCode::CONFLICT.into());
        }

        let dmeta = self.fs.symlink_metadata(&dest).await.ok();
        let exists = dmeta.is_some();
        if exists && !overwrite {
            return Err(StatusCode::PRECONDITION_FAILED.into());
        }

        // If: and If-* headers are evaluated against the source.
        let tokens = match if_match_get_tokens(req, Some(&meta), &self.fs, self.ls.as_ref(), &path).await {
            Ok(t) => t,
            Err(s) => return Err(s.into()),
        };

        // MOVE removes the source from its parent; both create (or
        // replace) the destination.
        if method == DavMethod::MOVE {
            if let Err(res) = self.check_member_locks(&path, true, &tokens) {
                return Ok(res);
            }
        }
        if let Err(res) = self.check_member_locks(&dest, true, &tokens) {
            return Ok(res);
        }

        let mut errors = MultiError::new(&dest);

        // clear the way.
        if let Some(dmeta) = dmeta {
            let ddir = dmeta.is_dir() && !dmeta.is_symlink();
            self.delete_items(&dest, ddir, &tokens, &mut errors).await;
            if !errors.is_empty() {
                return errors.into_response(StatusCode::NO_CONTENT);
            }
        }

        let ok = if exists {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::CREATED
        };

        if method == DavMethod::MOVE {
            match self.fs.rename(&path, &dest).await {
                Ok(()) => {
                    if let Some(ref ps) = self.ps {
                        ps.rename(&path, &dest);
                    }
                    // the moved resources are not locked at the destination.
                    if let Some(ref ls) = self.ls {
                        let _ = ls.delete(&path);
                    }
                    return errors.into_response(ok);
                }
                // fall back to copy + delete.
                Err(FsError::IsRemote) | Err(FsError::NotImplemented) => {
                    debug!("MOVE {path} -> {dest}: rename not possible, copying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let deep = depth == Depth::Infinity;
        self.copy_items(&path, &dest, is_dir, deep, &mut errors).await;

        if method == DavMethod::MOVE && errors.is_empty() {
            let mut src_errors = MultiError::new(&path);
            self.delete_items(&path, is_dir, &tokens, &mut src_errors).await;
            for (p, s) in src_errors.iter() {
                errors.add_status(p, *s);
            }
        }
        errors.into_response(ok)
    }

    // Copy `from` to `to`, for a collection also its members if `deep`.
    // Failures are recorded against the destination path; members of a
    // collection that could not be created are skipped.
    async fn copy_items(&self, from: &DavPath, to: &DavPath, is_dir: bool, deep: bool, errors: &mut MultiError) {
        if !is_dir {
            match self.fs.copy(from, to).await {
                Ok(()) => self.copy_props(from, to),
                Err(e) => errors.add_status(to, DavError::from(e).statuscode()),
            }
            return;
        }

        if let Err(e) = self.fs.create_dir(to).await {
            errors.add_status(to, DavError::from(e).statuscode());
            return;
        }
        self.copy_props(from, to);
        if !deep {
            return;
        }

        let mut walk_errors = MultiError::new(from);
        let nodes = self.walk_tree(from, None, &mut walk_errors).await;

        // source collections whose copy failed.
        let mut failed = HashSet::new();
        for (p, s) in walk_errors.iter() {
            errors.add_status(&p.rebase(from, to), *s);
            if *s != StatusCode::INSUFFICIENT_STORAGE {
                failed.insert(p.as_bytes_noslash().to_vec());
            }
        }

        for node in &nodes {
            if failed.contains(node.path.parent().as_bytes_noslash()) {
                if node.is_dir() {
                    failed.insert(node.path.as_bytes_noslash().to_vec());
                }
                continue;
            }
            let dpath = node.path.rebase(from, to);
            let res = if node.is_dir() {
                self.fs.create_dir(&dpath).await
            } else {
                self.fs.copy(&node.path, &dpath).await
            };
            match res {
                Ok(()) => self.copy_props(&node.path, &dpath),
                Err(e) => {
                    errors.add_status(&dpath, DavError::from(e).statuscode());
                    if node.is_dir() {
                        failed.insert(node.path.as_bytes_noslash().to_vec());
                    }
                }
            }
        }
    }

    // dead properties of one resource, not its members.
    fn copy_props(&self, from: &DavPath, to: &DavPath) {
        if let Some(ref ps) = self.ps {
            let props = ps.get_props(from, true);
            if !props.is_empty() {
                ps.patch_props(to, props, Vec::new());
            }
        }
    }
}
