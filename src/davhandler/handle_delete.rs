use std::collections::HashSet;

use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::conditional::if_match_get_tokens;
use crate::davheaders::Depth;
use crate::davpath::DavPath;
use crate::errors::{DavError, DavResult};
use crate::fs::FsError;
use crate::multierror::MultiError;

impl crate::DavHandler {
    pub(crate) async fn handle_delete(&self, req: &Request<()>) -> DavResult<Response<Body>> {
        let mut path = self.path(req)?;
        if path.is_root() {
            return Err(StatusCode::FORBIDDEN.into());
        }
        let meta = self.fs.symlink_metadata(&path).await?;
        let is_dir = meta.is_dir() && !meta.is_symlink();
        if is_dir && !path.is_collection() {
            path.add_slash();
        }

        // DELETE on a collection is always Depth: infinity.
        if is_dir {
            match req.headers().typed_try_get::<Depth>() {
                Ok(None) | Ok(Some(Depth::Infinity)) => {}
                _ => return Err(StatusCode::BAD_REQUEST.into()),
            }
        }

        let tokens = match if_match_get_tokens(req, Some(&meta), &self.fs, self.ls.as_ref(), &path).await {
            Ok(t) => t,
            Err(s) => return Err(s.into()),
        };

        // a lock on the resource itself or its parent fails the whole request.
        if let Err(res) = self.check_member_locks(&path, false, &tokens) {
            return Ok(res);
        }

        let mut errors = MultiError::new(&path);
        self.delete_items(&path, is_dir, &tokens, &mut errors).await;
        errors.into_response(StatusCode::NO_CONTENT)
    }

    // Remove `path` and, for a collection, everything below it. Members
    // that are locked or fail are recorded in `errors` and keep their
    // parent collections alive; those parents are not reported.
    pub(crate) async fn delete_items(
        &self,
        path: &DavPath,
        is_dir: bool,
        tokens: &[String],
        errors: &mut MultiError,
    ) {
        if !is_dir {
            match self.fs.remove_file(path).await {
                Ok(()) => self.forget(path),
                Err(e) => errors.add_status(path, DavError::from(e).statuscode()),
            }
            return;
        }

        let nodes = self.walk_tree(path, None, errors).await;

        // collections that could not be emptied.
        let mut blocked = HashSet::new();
        for (p, _) in errors.iter() {
            block_ancestors(&mut blocked, p, path);
        }

        // deepest first, so collections are empty when we get to them.
        for node in nodes.iter().rev() {
            if blocked.contains(node.path.as_bytes_noslash()) {
                continue;
            }
            if self.check_locks(&node.path, false, tokens).is_err() {
                errors.add_status(&node.path, StatusCode::LOCKED);
                block_ancestors(&mut blocked, &node.path, path);
                continue;
            }
            let res = if node.is_dir() {
                self.fs.remove_dir(&node.path).await
            } else {
                self.fs.remove_file(&node.path).await
            };
            match res {
                // NotFound: already gone.
                Ok(()) | Err(FsError::NotFound) => self.forget(&node.path),
                Err(e) => {
                    errors.add_status(&node.path, DavError::from(e).statuscode());
                    block_ancestors(&mut blocked, &node.path, path);
                }
            }
        }

        if !blocked.contains(path.as_bytes_noslash()) {
            match self.fs.remove_dir(path).await {
                Ok(()) => self.forget(path),
                Err(e) => errors.add_status(path, DavError::from(e).statuscode()),
            }
        }
    }

    // drop locks and dead properties of a removed resource.
    pub(crate) fn forget(&self, path: &DavPath) {
        if let Some(ref ls) = self.ls {
            let _ = ls.delete(path);
        }
        if let Some(ref ps) = self.ps {
            ps.remove(path);
        }
    }
}

// mark every collection from `path` up to `root` as not removable.
fn block_ancestors(blocked: &mut HashSet<Vec<u8>>, path: &DavPath, root: &DavPath) {
    let mut p = path.clone();
    while root.is_ancestor_or_self(&p) {
        if !blocked.insert(p.as_bytes_noslash().to_vec()) || p.is_root() {
            break;
        }
        p = p.parent();
    }
}
