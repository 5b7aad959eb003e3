//! Contains the structs and traits that define a dead property store.
//!
//! Like the locksystem, the methods are synchronous: the store is
//! in-memory and consulted under a short critical section.
use std::fmt::Debug;

use http::StatusCode;

use crate::davpath::DavPath;

pub mod memps;

/// A webdav dead property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DavProp {
    /// Name of the property.
    pub name: String,
    /// XML prefix.
    pub prefix: Option<String>,
    /// XML namespace.
    pub namespace: Option<String>,
    /// Value of the property as raw XML.
    pub xml: Option<Vec<u8>>,
}

impl DavProp {
    // (namespace, name) identifies a property; the prefix does not.
    pub(crate) fn key(&self) -> (String, String) {
        (self.namespace.clone().unwrap_or_default(), self.name.clone())
    }
}

/// The trait that defines a dead property store.
pub trait DavPropStore: Debug + Sync + Send {
    /// All dead properties of a resource. Without `with_content` only
    /// the names are returned.
    fn get_props(&self, path: &DavPath, with_content: bool) -> Vec<DavProp>;

    /// The value (raw XML) of one dead property.
    fn get_prop(&self, path: &DavPath, prop: &DavProp) -> Option<Vec<u8>>;

    /// Set and remove properties, all-or-nothing. Returns a status per
    /// property.
    fn patch_props(&self, path: &DavPath, set: Vec<DavProp>, remove: Vec<DavProp>) -> Vec<(StatusCode, DavProp)>;

    /// Drop the properties of `path` and everything below it.
    fn remove(&self, path: &DavPath);

    /// Move the properties of `from` and everything below it to `to`.
    fn rename(&self, from: &DavPath, to: &DavPath);
}
