//! Simple in-memory filesystem.
//!
//! This implementation has state, so if you create a
//! new instance in a handler(), it will be empty every time.
//!
//! This means you have to create the instance once, and then
//! keep it around, shared by every handler.
//!
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use futures_util::{future, stream, FutureExt};
use parking_lot::Mutex;

use crate::davpath::DavPath;
use crate::fs::*;

type Tree = BTreeMap<Vec<u8>, MemNode>;

/// Ephemeral in-memory filesystem.
#[derive(Debug, Clone)]
pub struct MemFs {
    tree: Arc<Mutex<Tree>>,
    quota: Option<u64>,
}

#[derive(Debug, Clone)]
enum MemNode {
    Dir { crtime: SystemTime, mtime: SystemTime },
    File { crtime: SystemTime, mtime: SystemTime, data: Vec<u8> },
}

#[derive(Debug, Clone)]
struct MemFsMetaData {
    is_dir: bool,
    len: u64,
    crtime: SystemTime,
    mtime: SystemTime,
}

#[derive(Debug)]
struct MemFsFile {
    fs: MemFs,
    key: Vec<u8>,
    pos: usize,
    append: bool,
}

struct MemFsDirEntry {
    name: Vec<u8>,
    meta: MemFsMetaData,
}

// path as key: no trailing slash, root is "/".
fn key(path: &DavPath) -> Vec<u8> {
    path.as_bytes_noslash().to_vec()
}

fn parent_key(key: &[u8]) -> Vec<u8> {
    match key.iter().rposition(|&c| c == b'/') {
        Some(0) | None => b"/".to_vec(),
        Some(idx) => key[..idx].to_vec(),
    }
}

// all keys strictly below `key`.
fn descendants(tree: &Tree, key: &[u8]) -> Vec<Vec<u8>> {
    let mut pfx = key.to_vec();
    if pfx != b"/" {
        pfx.push(b'/');
    }
    tree.range(pfx.clone()..)
        .take_while(|(k, _)| k.starts_with(&pfx))
        .filter(|(k, _)| k.as_slice() != key)
        .map(|(k, _)| k.clone())
        .collect()
}

impl MemNode {
    fn new_dir() -> MemNode {
        let now = SystemTime::now();
        MemNode::Dir {
            crtime: now,
            mtime: now,
        }
    }

    fn new_file() -> MemNode {
        let now = SystemTime::now();
        MemNode::File {
            crtime: now,
            mtime: now,
            data: Vec::new(),
        }
    }

    fn is_dir(&self) -> bool {
        matches!(self, MemNode::Dir { .. })
    }

    fn meta(&self) -> MemFsMetaData {
        match self {
            MemNode::Dir { crtime, mtime } => MemFsMetaData {
                is_dir: true,
                len: 0,
                crtime: *crtime,
                mtime: *mtime,
            },
            MemNode::File { crtime, mtime, data } => MemFsMetaData {
                is_dir: false,
                len: data.len() as u64,
                crtime: *crtime,
                mtime: *mtime,
            },
        }
    }
}

impl MemFs {
    /// Create a new, empty, "memfs" filesystem.
    pub fn new() -> Arc<MemFs> {
        Arc::new(Self::build(None))
    }

    /// Like `new`, but refuse to store more than `bytes` bytes of
    /// file data (`FsError::InsufficientStorage`).
    pub fn with_quota(bytes: u64) -> Arc<MemFs> {
        Arc::new(Self::build(Some(bytes)))
    }

    fn build(quota: Option<u64>) -> MemFs {
        let mut tree = Tree::new();
        tree.insert(b"/".to_vec(), MemNode::new_dir());
        MemFs {
            tree: Arc::new(Mutex::new(tree)),
            quota,
        }
    }

    fn used(tree: &Tree) -> u64 {
        tree.values()
            .map(|n| match n {
                MemNode::File { data, .. } => data.len() as u64,
                MemNode::Dir { .. } => 0,
            })
            .sum()
    }

    // the parent of `key` must exist and be a directory.
    fn check_parent(tree: &Tree, key: &[u8]) -> FsResult<()> {
        match tree.get(&parent_key(key)) {
            Some(n) if n.is_dir() => Ok(()),
            Some(_) => Err(FsError::Conflict),
            None => Err(FsError::NotFound),
        }
    }

    fn touch_parent(tree: &mut Tree, key: &[u8]) {
        if let Some(MemNode::Dir { mtime, .. }) = tree.get_mut(&parent_key(key)) {
            *mtime = SystemTime::now();
        }
    }

    fn do_open(&self, path: &DavPath, options: OpenOptions) -> FsResult<Box<dyn DavFile>> {
        let k = key(path);
        let mut tree = self.tree.lock();
        match tree.get_mut(&k) {
            Some(MemNode::Dir { .. }) => return Err(FsError::Forbidden),
            Some(MemNode::File { data, mtime, .. }) => {
                if options.create_new {
                    return Err(FsError::Exists);
                }
                if options.truncate {
                    data.clear();
                    *mtime = SystemTime::now();
                }
            }
            None => {
                if !options.create && !options.create_new {
                    return Err(FsError::NotFound);
                }
                Self::check_parent(&tree, &k)?;
                tree.insert(k.clone(), MemNode::new_file());
                Self::touch_parent(&mut tree, &k);
            }
        }
        Ok(Box::new(MemFsFile {
            fs: self.clone(),
            key: k,
            pos: 0,
            append: options.append,
        }))
    }

    fn do_create_dir(&self, path: &DavPath) -> FsResult<()> {
        let k = key(path);
        let mut tree = self.tree.lock();
        if tree.contains_key(&k) {
            return Err(FsError::Exists);
        }
        Self::check_parent(&tree, &k)?;
        tree.insert(k.clone(), MemNode::new_dir());
        Self::touch_parent(&mut tree, &k);
        Ok(())
    }

    fn do_remove(&self, path: &DavPath, dir: bool) -> FsResult<()> {
        let k = key(path);
        let mut tree = self.tree.lock();
        match tree.get(&k) {
            None => return Err(FsError::NotFound),
            Some(n) if n.is_dir() != dir => return Err(FsError::Forbidden),
            Some(_) => {}
        }
        if k == b"/" {
            return Err(FsError::Forbidden);
        }
        if dir && !descendants(&tree, &k).is_empty() {
            return Err(FsError::Exists);
        }
        tree.remove(&k);
        Self::touch_parent(&mut tree, &k);
        Ok(())
    }

    fn do_rename(&self, from: &DavPath, to: &DavPath) -> FsResult<()> {
        let (kf, kt) = (key(from), key(to));
        let mut tree = self.tree.lock();
        let node = tree.get(&kf).cloned().ok_or(FsError::NotFound)?;
        if kf == b"/" || (kt.starts_with(&kf) && kt.get(kf.len()) == Some(&b'/')) {
            return Err(FsError::Forbidden);
        }
        Self::check_parent(&tree, &kt)?;
        match tree.get(&kt) {
            Some(n) if n.is_dir() => return Err(FsError::Exists),
            _ => {}
        }
        let children = descendants(&tree, &kf);
        tree.remove(&kf);
        tree.insert(kt.clone(), node);
        for child in children {
            if let Some(n) = tree.remove(&child) {
                let mut nk = kt.clone();
                nk.extend_from_slice(&child[kf.len()..]);
                tree.insert(nk, n);
            }
        }
        Self::touch_parent(&mut tree, &kf);
        Self::touch_parent(&mut tree, &kt);
        Ok(())
    }

    fn do_copy(&self, from: &DavPath, to: &DavPath) -> FsResult<()> {
        let (kf, kt) = (key(from), key(to));
        let mut tree = self.tree.lock();
        let data = match tree.get(&kf) {
            Some(MemNode::File { data, .. }) => data.clone(),
            Some(MemNode::Dir { .. }) => return Err(FsError::Forbidden),
            None => return Err(FsError::NotFound),
        };
        Self::check_parent(&tree, &kt)?;
        if let Some(n) = tree.get(&kt) {
            if n.is_dir() {
                return Err(FsError::Exists);
            }
        }
        if let Some(quota) = self.quota {
            if Self::used(&tree) + data.len() as u64 > quota {
                return Err(FsError::InsufficientStorage);
            }
        }
        let mut node = MemNode::new_file();
        if let MemNode::File { data: d, .. } = &mut node {
            *d = data;
        }
        tree.insert(kt.clone(), node);
        Self::touch_parent(&mut tree, &kt);
        Ok(())
    }
}

impl DavFileSystem for MemFs {
    fn metadata<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Box<dyn DavMetaData>> {
        let tree = self.tree.lock();
        // a file used as a directory is simply not found.
        let res = match tree.get(&key(path)) {
            Some(n) => Ok(Box::new(n.meta()) as Box<dyn DavMetaData>),
            None => Err(FsError::NotFound),
        };
        Box::pin(future::ready(res))
    }

    fn read_dir<'a>(
        &'a self,
        path: &'a DavPath,
        _meta: ReadDirMeta,
    ) -> FsFuture<'a, FsStream<Box<dyn DavDirEntry>>> {
        trace!("FS: read_dir {path:?}");
        let k = key(path);
        let tree = self.tree.lock();
        let res = match tree.get(&k) {
            Some(n) if n.is_dir() => {
                let entries = descendants(&tree, &k)
                    .into_iter()
                    .filter(|c| parent_key(c) == k)
                    .filter_map(|c| {
                        let meta = tree.get(&c)?.meta();
                        let name = c[c.iter().rposition(|&b| b == b'/')? + 1..].to_vec();
                        Some(Box::new(MemFsDirEntry { name, meta }) as Box<dyn DavDirEntry>)
                    })
                    .collect::<Vec<_>>();
                Ok(Box::pin(stream::iter(entries)) as FsStream<Box<dyn DavDirEntry>>)
            }
            Some(_) => Err(FsError::Forbidden),
            None => Err(FsError::NotFound),
        };
        Box::pin(future::ready(res))
    }

    fn open<'a>(
        &'a self,
        path: &'a DavPath,
        options: OpenOptions,
    ) -> FsFuture<'a, Box<dyn DavFile>> {
        trace!("FS: open {path:?}");
        Box::pin(future::ready(self.do_open(path, options)))
    }

    fn create_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        trace!("FS: create_dir {path:?}");
        Box::pin(future::ready(self.do_create_dir(path)))
    }

    fn remove_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        trace!("FS: remove_dir {path:?}");
        Box::pin(future::ready(self.do_remove(path, true)))
    }

    fn remove_file<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        trace!("FS: remove_file {path:?}");
        Box::pin(future::ready(self.do_remove(path, false)))
    }

    fn rename<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        trace!("FS: rename {from:?} {to:?}");
        Box::pin(future::ready(self.do_rename(from, to)))
    }

    fn copy<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        trace!("FS: copy {from:?} {to:?}");
        Box::pin(future::ready(self.do_copy(from, to)))
    }
}

impl MemFsFile {
    fn with_data<T>(&self, f: impl FnOnce(&mut Vec<u8>, &mut SystemTime) -> T) -> FsResult<T> {
        let mut tree = self.fs.tree.lock();
        match tree.get_mut(&self.key) {
            Some(MemNode::File { data, mtime, .. }) => Ok(f(data, mtime)),
            Some(MemNode::Dir { .. }) => Err(FsError::Forbidden),
            None => Err(FsError::NotFound),
        }
    }

    fn do_write(&mut self, buf: &[u8]) -> FsResult<()> {
        if let Some(quota) = self.fs.quota {
            let tree = self.fs.tree.lock();
            let cur = match tree.get(&self.key) {
                Some(MemNode::File { data, .. }) => data.len(),
                _ => 0,
            };
            let start = if self.append { cur } else { self.pos };
            let grow = (start + buf.len()).saturating_sub(cur) as u64;
            if MemFs::used(&tree) + grow > quota {
                return Err(FsError::InsufficientStorage);
            }
        }
        let append = self.append;
        let pos = self.pos;
        let newpos = self.with_data(|data, mtime| {
            let start = if append { data.len() } else { pos };
            let end = start + buf.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[start..end].copy_from_slice(buf);
            *mtime = SystemTime::now();
            end
        })?;
        self.pos = newpos;
        Ok(())
    }
}

impl DavFile for MemFsFile {
    fn metadata(&mut self) -> FsFuture<'_, Box<dyn DavMetaData>> {
        let tree = self.fs.tree.lock();
        let res = match tree.get(&self.key) {
            Some(n) => Ok(Box::new(n.meta()) as Box<dyn DavMetaData>),
            None => Err(FsError::NotFound),
        };
        Box::pin(future::ready(res))
    }

    fn write_bytes(&mut self, buf: Bytes) -> FsFuture<'_, ()> {
        let res = self.do_write(&buf);
        Box::pin(future::ready(res))
    }

    fn read_bytes(&mut self, count: usize) -> FsFuture<'_, Bytes> {
        let pos = self.pos;
        let res = self.with_data(|data, _| {
            let start = pos.min(data.len());
            let end = (start + count).min(data.len());
            Bytes::copy_from_slice(&data[start..end])
        });
        if let Ok(b) = &res {
            self.pos += b.len();
        }
        Box::pin(future::ready(res))
    }

    fn seek(&mut self, pos: SeekFrom) -> FsFuture<'_, u64> {
        let cur = self.pos as i64;
        let res = self.with_data(|data, _| data.len() as i64).and_then(|len| {
            let newpos = match pos {
                SeekFrom::Start(n) => n as i64,
                SeekFrom::End(n) => len + n,
                SeekFrom::Current(n) => cur + n,
            };
            if newpos < 0 {
                Err(FsError::GeneralFailure)
            } else {
                Ok(newpos as u64)
            }
        });
        if let Ok(p) = res {
            self.pos = p as usize;
        }
        Box::pin(future::ready(res))
    }

    fn flush(&mut self) -> FsFuture<'_, ()> {
        future::ok(()).boxed()
    }
}

impl DavMetaData for MemFsMetaData {
    fn len(&self) -> u64 {
        self.len
    }
    fn created(&self) -> FsResult<SystemTime> {
        Ok(self.crtime)
    }
    fn modified(&self) -> FsResult<SystemTime> {
        Ok(self.mtime)
    }
    fn is_dir(&self) -> bool {
        self.is_dir
    }
}

impl DavDirEntry for MemFsDirEntry {
    fn metadata(&self) -> FsFuture<'_, Box<dyn DavMetaData>> {
        Box::pin(future::ok(Box::new(self.meta.clone()) as Box<dyn DavMetaData>))
    }

    fn name(&self) -> Vec<u8> {
        self.name.clone()
    }
}
