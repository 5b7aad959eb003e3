//! Simple and ephemeral in-memory lock system.
//!
//! The lock table lives behind a single mutex; every call takes it
//! once, does its bookkeeping, and releases it before returning.
//! Expired locks are reaped lazily, on every access.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use uuid::Uuid;
use xmltree::Element;

use crate::davpath::DavPath;
use crate::ls::*;

/// Ephemeral in-memory LockSystem.
#[derive(Debug, Clone)]
pub struct MemLs(Arc<Mutex<MemLsInner>>);

#[derive(Debug, Default)]
struct MemLsInner {
    // token -> lock
    locks: HashMap<String, DavLock>,
}

impl MemLsInner {
    fn reap(&mut self) {
        let now = SystemTime::now();
        self.locks.retain(|token, lock| {
            let keep = !lock.is_expired(now);
            if !keep {
                debug!("lock {token} on {} expired", lock.path);
            }
            keep
        });
    }
}

// Do a lock rooted at `l_path` (with depth `l_deep`) and a lock rooted
// at `r_path` (with depth `r_deep`) share any resource.
fn overlaps(l_path: &DavPath, l_deep: bool, r_path: &DavPath, r_deep: bool) -> bool {
    let same = l_path.as_bytes_noslash() == r_path.as_bytes_noslash();
    same || (l_deep && l_path.is_ancestor_or_self(r_path)) || (r_deep && r_path.is_ancestor_or_self(l_path))
}

fn check_principal(lock: &DavLock, principal: Option<&str>, ignore_principal: bool) -> bool {
    ignore_principal || lock.principal.is_none() || lock.principal.as_deref() == principal
}

impl MemLs {
    /// Create a new "memls" locksystem.
    pub fn new() -> Arc<MemLs> {
        Arc::new(MemLs(Arc::new(Mutex::new(MemLsInner::default()))))
    }

    /// Number of live (non-expired) locks.
    pub fn len(&self) -> usize {
        let mut inner = self.0.lock();
        inner.reap();
        inner.locks.len()
    }

    /// No live locks at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DavLockSystem for MemLs {
    fn lock(
        &self,
        path: &DavPath,
        principal: Option<&str>,
        owner: Option<&Element>,
        timeout: Option<Duration>,
        shared: bool,
        deep: bool,
    ) -> Result<DavLock, DavLock> {
        let mut inner = self.0.lock();
        inner.reap();

        // any exclusive lock conflicts with anything; two shared locks never conflict.
        if let Some(conflict) = inner
            .locks
            .values()
            .find(|l| (!shared || !l.shared) && overlaps(&l.path, l.deep, path, deep))
        {
            debug!("lock on {path} conflicts with {} on {}", conflict.token, conflict.path);
            return Err(conflict.clone());
        }

        let token = format!("opaquelocktoken:{}", Uuid::new_v4().hyphenated());
        let lock = DavLock {
            token: token.clone(),
            path: Box::new(path.clone()),
            principal: principal.map(|s| s.to_string()),
            owner: owner.map(|o| Box::new(o.clone())),
            timeout_at: timeout.map(|d| SystemTime::now() + d),
            timeout,
            shared,
            deep,
        };
        inner.locks.insert(token, lock.clone());
        debug!("lock {} created on {path}", lock.token);
        Ok(lock)
    }

    fn unlock(&self, path: &DavPath, token: &str) -> Result<(), ()> {
        let mut inner = self.0.lock();
        inner.reap();
        match inner.locks.get(token) {
            Some(lock) if lock.covers(path) => {}
            _ => return Err(()),
        }
        inner.locks.remove(token);
        debug!("lock {token} released");
        Ok(())
    }

    fn refresh(&self, path: &DavPath, token: &str, timeout: Option<Duration>) -> Result<DavLock, ()> {
        let mut inner = self.0.lock();
        inner.reap();
        match inner.locks.get_mut(token) {
            Some(lock) if lock.covers(path) => {
                lock.timeout = timeout;
                lock.timeout_at = timeout.map(|d| SystemTime::now() + d);
                debug!("lock {token} refreshed");
                Ok(lock.clone())
            }
            _ => Err(()),
        }
    }

    fn check(
        &self,
        path: &DavPath,
        principal: Option<&str>,
        ignore_principal: bool,
        deep: bool,
        submitted_tokens: Vec<&str>,
    ) -> Result<(), DavLock> {
        let mut inner = self.0.lock();
        inner.reap();

        let held = |l: &DavLock| {
            submitted_tokens.iter().any(|t| *t == l.token) && check_principal(l, principal, ignore_principal)
        };

        // every lock that shares a resource with the operation, grouped
        // by the resource it is rooted at.
        let mut groups: HashMap<&[u8], Vec<&DavLock>> = HashMap::new();
        for l in inner.locks.values() {
            if overlaps(&l.path, l.deep, path, deep) {
                groups.entry(l.path.as_bytes_noslash()).or_default().push(l);
            }
        }

        // an exclusive lock must be held itself; of a set of shared
        // locks on the same resource, holding one is enough.
        for locks in groups.values() {
            if !locks.iter().any(|l| held(l)) {
                return Err((*locks[0]).clone());
            }
        }
        Ok(())
    }

    fn discover(&self, path: &DavPath) -> Vec<DavLock> {
        let mut inner = self.0.lock();
        inner.reap();
        let mut v: Vec<DavLock> = inner.locks.values().filter(|l| l.covers(path)).cloned().collect();
        v.sort_by(|a, b| a.path.depth().cmp(&b.path.depth()).then_with(|| a.token.cmp(&b.token)));
        v
    }

    fn delete(&self, path: &DavPath) -> Result<(), ()> {
        let mut inner = self.0.lock();
        inner.locks.retain(|_, l| !path.is_ancestor_or_self(&l.path));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> DavPath {
        DavPath::new(s).unwrap()
    }

    const T: Option<Duration> = Some(Duration::from_secs(60));

    #[test]
    fn test_lock_then_confirm() {
        let ls = MemLs::new();
        let lock = ls.lock(&p("/a.txt"), None, None, T, false, false).unwrap();
        assert!(lock.token.starts_with("opaquelocktoken:"));
        assert!(ls.check(&p("/a.txt"), None, false, false, vec![lock.token.as_str()]).is_ok());
        let err = ls.check(&p("/a.txt"), None, false, false, vec!["opaquelocktoken:wrong"]);
        assert_eq!(err.unwrap_err().token, lock.token);
        assert!(ls.check(&p("/a.txt"), None, false, false, vec![]).is_err());
        // unrelated path is not affected.
        assert!(ls.check(&p("/b.txt"), None, false, false, vec![]).is_ok());
    }

    #[test]
    fn test_shared_and_exclusive() {
        let ls = MemLs::new();
        let s1 = ls.lock(&p("/f"), None, None, T, true, false).unwrap();
        let s2 = ls.lock(&p("/f"), None, None, T, true, false).unwrap();
        assert_ne!(s1.token, s2.token);
        assert!(ls.lock(&p("/f"), None, None, T, false, false).is_err());
        // one of the shared tokens suffices.
        assert!(ls.check(&p("/f"), None, false, false, vec![s2.token.as_str()]).is_ok());

        ls.unlock(&p("/f"), &s1.token).unwrap();
        ls.unlock(&p("/f"), &s2.token).unwrap();
        assert!(ls.lock(&p("/f"), None, None, T, false, false).is_ok());
    }

    #[test]
    fn test_depth() {
        let ls = MemLs::new();
        let deep = ls.lock(&p("/d/"), None, None, T, false, true).unwrap();
        // descendants are covered by a depth-infinity lock.
        assert!(ls.lock(&p("/d/x/y"), None, None, T, true, false).is_err());
        assert!(ls.check(&p("/d/x/y"), None, false, false, vec![]).is_err());
        assert!(ls.check(&p("/d/x/y"), None, false, false, vec![deep.token.as_str()]).is_ok());
        assert!(ls.check(&p("/dx"), None, false, false, vec![]).is_ok());
        assert_eq!(ls.discover(&p("/d/x")).len(), 1);
        ls.unlock(&p("/d/x"), &deep.token).unwrap();

        // a depth-0 lock on a member blocks a depth-infinity lock on the parent.
        let member = ls.lock(&p("/e/m"), None, None, T, false, false).unwrap();
        assert!(ls.lock(&p("/e/"), None, None, T, false, true).is_err());
        assert!(ls.lock(&p("/e/"), None, None, T, false, false).is_ok());
        // a deep check on the parent sees the member lock.
        let err = ls.check(&p("/e/"), None, true, true, vec![]).unwrap_err();
        assert_eq!(err.token, member.token);
    }

    #[test]
    fn test_refresh_release_expiry() {
        let ls = MemLs::new();
        assert!(ls.refresh(&p("/x"), "opaquelocktoken:nope", T).is_err());
        assert!(ls.unlock(&p("/x"), "opaquelocktoken:nope").is_err());

        let lock = ls.lock(&p("/x"), None, None, Some(Duration::from_secs(0)), false, false).unwrap();
        // zero timeout: already stale, treated as absent.
        assert!(ls.check(&p("/x"), None, false, false, vec![]).is_ok());
        assert!(ls.refresh(&p("/x"), &lock.token, T).is_err());
        assert!(ls.is_empty());

        let lock = ls.lock(&p("/x"), None, None, T, false, false).unwrap();
        let r = ls.refresh(&p("/x"), &lock.token, Some(Duration::from_secs(600))).unwrap();
        assert_eq!(r.timeout, Some(Duration::from_secs(600)));
        // token must match the request uri.
        assert!(ls.unlock(&p("/y"), &lock.token).is_err());
        ls.unlock(&p("/x"), &lock.token).unwrap();
        assert!(ls.unlock(&p("/x"), &lock.token).is_err());
    }

    #[test]
    fn test_principal() {
        let ls = MemLs::new();
        let lock = ls.lock(&p("/p"), Some("alice"), None, T, false, false).unwrap();
        assert!(ls.check(&p("/p"), Some("bob"), false, false, vec![lock.token.as_str()]).is_err());
        assert!(ls.check(&p("/p"), Some("bob"), true, false, vec![lock.token.as_str()]).is_ok());
        assert!(ls.check(&p("/p"), Some("alice"), false, false, vec![lock.token.as_str()]).is_ok());
    }

    #[test]
    fn test_delete_subtree() {
        let ls = MemLs::new();
        ls.lock(&p("/t/a"), None, None, T, false, false).unwrap();
        ls.lock(&p("/t/b/c"), None, None, T, false, false).unwrap();
        ls.lock(&p("/u"), None, None, T, false, false).unwrap();
        ls.delete(&p("/t/")).unwrap();
        assert_eq!(ls.len(), 1);
    }

    #[test]
    fn test_concurrent_shared() {
        let ls = MemLs::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ls = ls.clone();
                std::thread::spawn(move || ls.lock(&p("/c"), None, None, T, true, false).is_ok())
            })
            .collect();
        assert!(handles.into_iter().all(|h| h.join().unwrap()));
        assert_eq!(ls.len(), 8);
        assert!(ls.lock(&p("/c"), None, None, T, false, false).is_err());
    }
}
