//! Contains the structs and traits that define a `locksystem` backend.
//!
//! Note that the methods DO NOT return futures, they are synchronous.
//! This is because currently only in-memory locksystems are supported,
//! and the overhead of using futures is not worth it. No I/O happens
//! while a locksystem holds its internal lock.
//!
use std::fmt::Debug;
use std::time::{Duration, SystemTime};

use xmltree::Element;

use crate::davpath::DavPath;

pub mod memls;

/// Type of the locks returned by DavLockSystem methods.
#[derive(Debug, Clone)]
pub struct DavLock {
    /// Token.
    pub token: String,
    /// Path/
    pub path: Box<DavPath>,
    /// Principal.
    pub principal: Option<String>,
    /// Owner.
    pub owner: Option<Box<Element>>,
    /// When the lock turns stale (absolute).
    pub timeout_at: Option<SystemTime>,
    /// When the lock turns stale (relative).
    pub timeout: Option<Duration>,
    /// Shared.
    pub shared: bool,
    /// Deep.
    pub deep: bool,
}

impl DavLock {
    /// Has this lock expired at time `now`.
    pub fn is_expired(&self, now: SystemTime) -> bool {
        matches!(self.timeout_at, Some(t) if t <= now)
    }

    /// Does this lock cover `path`: it is rooted there, or it is a
    /// depth-infinity lock on one of its ancestors.
    pub fn covers(&self, path: &DavPath) -> bool {
        if self.deep {
            self.path.is_ancestor_or_self(path)
        } else {
            self.path.as_bytes_noslash() == path.as_bytes_noslash()
        }
    }
}

/// The trait that defines a locksystem.
pub trait DavLockSystem: Debug + Sync + Send {
    /// Lock a node. Returns `Ok(new_lock)` if succeeded,
    /// or `Err(conflicting_lock)` if failed.
    fn lock(
        &self,
        path: &DavPath,
        principal: Option<&str>,
        owner: Option<&Element>,
        timeout: Option<Duration>,
        shared: bool,
        deep: bool,
    ) -> Result<DavLock, DavLock>;

    /// Unlock a node. Returns `Ok(())` if succeeded, `Err (())` if failed
    /// (because lock doesn't exist)
    fn unlock(&self, path: &DavPath, token: &str) -> Result<(), ()>;

    /// Refresh lock. Returns updated lock if succeeded.
    fn refresh(&self, path: &DavPath, token: &str, timeout: Option<Duration>) -> Result<DavLock, ()>;

    /// Check if node is locked and if so, if we own all the locks.
    /// If not, returns as Err one conflicting lock.
    fn check(
        &self,
        path: &DavPath,
        principal: Option<&str>,
        ignore_principal: bool,
        deep: bool,
        submitted_tokens: Vec<&str>,
    ) -> Result<(), DavLock>;

    /// Find and return all locks that cover a given path.
    fn discover(&self, path: &DavPath) -> Vec<DavLock>;

    /// Delete all locks at this path and below (after MOVE or DELETE)
    fn delete(&self, path: &DavPath) -> Result<(), ()>;
}
