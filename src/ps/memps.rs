//! Ephemeral in-memory dead property store.
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use http::StatusCode;
use parking_lot::Mutex;

use crate::davpath::DavPath;
use crate::ps::*;

type PropMap = BTreeMap<(String, String), DavProp>;

/// In-memory property store, keyed by resource path.
#[derive(Debug, Clone, Default)]
pub struct MemPs(Arc<Mutex<HashMap<Vec<u8>, PropMap>>>);

// is `key` the path `base` or below it.
fn under(base: &[u8], key: &[u8]) -> bool {
    base == b"/" || key == base || (key.starts_with(base) && key.get(base.len()) == Some(&b'/'))
}

fn key(path: &DavPath) -> Vec<u8> {
    path.as_bytes_noslash().to_vec()
}

impl MemPs {
    /// Create a new "memps" property store.
    pub fn new() -> Arc<MemPs> {
        Arc::new(MemPs::default())
    }

    // all (key, props) at and below `from`, with the key rebased onto `to`.
    fn subtree(map: &HashMap<Vec<u8>, PropMap>, from: &DavPath, to: &DavPath) -> Vec<(Vec<u8>, PropMap)> {
        let fkey = key(from);
        let tkey = key(to);
        let flen = if fkey == b"/" { 0 } else { fkey.len() };
        map.iter()
            .filter(|(k, _)| under(&fkey, k))
            .map(|(k, v)| {
                let mut nk = if tkey == b"/" { Vec::new() } else { tkey.clone() };
                nk.extend_from_slice(&k[flen..]);
                if nk.is_empty() {
                    nk.push(b'/');
                }
                (nk, v.clone())
            })
            .collect()
    }
}

impl DavPropStore for MemPs {
    fn get_props(&self, path: &DavPath, with_content: bool) -> Vec<DavProp> {
        let map = self.0.lock();
        match map.get(&key(path)) {
            Some(props) => props
                .values()
                .map(|p| {
                    let mut p = p.clone();
                    if !with_content {
                        p.xml = None;
                    }
                    p
                })
                .collect(),
            None => Vec::new(),
        }
    }

    fn get_prop(&self, path: &DavPath, prop: &DavProp) -> Option<Vec<u8>> {
        let map = self.0.lock();
        map.get(&key(path))?.get(&prop.key())?.xml.clone()
    }

    fn patch_props(&self, path: &DavPath, set: Vec<DavProp>, remove: Vec<DavProp>) -> Vec<(StatusCode, DavProp)> {
        let mut map = self.0.lock();
        let k = key(path);

        // build the new set, then swap it in.
        let mut props = map.get(&k).cloned().unwrap_or_default();
        let mut ret = Vec::with_capacity(set.len() + remove.len());
        for p in set {
            props.insert(p.key(), p.clone());
            ret.push((StatusCode::OK, DavProp { xml: None, ..p }));
        }
        // removing a property that does not exist is not an error.
        for p in remove {
            props.remove(&p.key());
            ret.push((StatusCode::OK, p));
        }

        if props.is_empty() {
            map.remove(&k);
        } else {
            map.insert(k, props);
        }
        ret
    }

    fn remove(&self, path: &DavPath) {
        let base = key(path);
        self.0.lock().retain(|k, _| !under(&base, k));
    }

    fn rename(&self, from: &DavPath, to: &DavPath) {
        let mut map = self.0.lock();
        let moved = MemPs::subtree(&map, from, to);
        let base = key(from);
        map.retain(|k, _| !under(&base, k));
        for (k, v) in moved {
            map.insert(k, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> DavPath {
        DavPath::new(s).unwrap()
    }

    fn prop(name: &str, val: &str) -> DavProp {
        DavProp {
            name: name.to_string(),
            prefix: Some("Z".to_string()),
            namespace: Some("urn:z".to_string()),
            xml: Some(format!("<Z:{name} xmlns:Z=\"urn:z\">{val}</Z:{name}>").into_bytes()),
        }
    }

    #[test]
    fn test_patch_and_get() {
        let ps = MemPs::new();
        let r = ps.patch_props(&p("/a"), vec![prop("color", "red"), prop("size", "2")], vec![]);
        assert!(r.iter().all(|(s, _)| *s == StatusCode::OK));
        assert_eq!(ps.get_props(&p("/a"), false).len(), 2);
        assert!(ps.get_props(&p("/a"), false).iter().all(|p| p.xml.is_none()));

        let v = ps.get_prop(&p("/a"), &prop("color", "")).unwrap();
        assert!(String::from_utf8(v).unwrap().contains("red"));

        // same (namespace, name) replaces, whatever the prefix.
        let mut c = prop("color", "blue");
        c.prefix = Some("Q".to_string());
        ps.patch_props(&p("/a/"), vec![c], vec![prop("size", ""), prop("nope", "")]);
        assert_eq!(ps.get_props(&p("/a"), true).len(), 1);
        let v = ps.get_prop(&p("/a"), &prop("color", "")).unwrap();
        assert!(String::from_utf8(v).unwrap().contains("blue"));
    }

    #[test]
    fn test_subtree_ops() {
        let ps = MemPs::new();
        ps.patch_props(&p("/d/"), vec![prop("x", "1")], vec![]);
        ps.patch_props(&p("/d/f"), vec![prop("x", "2")], vec![]);
        ps.patch_props(&p("/dd"), vec![prop("x", "3")], vec![]);

        ps.rename(&p("/d"), &p("/g"));
        assert!(ps.get_props(&p("/d/f"), false).is_empty());
        assert_eq!(ps.get_props(&p("/g/"), false).len(), 1);
        assert_eq!(ps.get_props(&p("/g/f"), false).len(), 1);
        ps.rename(&p("/g"), &p("/d"));

        ps.remove(&p("/d"));
        assert!(ps.get_props(&p("/d"), false).is_empty());
        assert!(ps.get_props(&p("/d/f"), false).is_empty());
        // a sibling with a common name prefix is untouched.
        assert_eq!(ps.get_props(&p("/dd"), false).len(), 1);
    }
}
