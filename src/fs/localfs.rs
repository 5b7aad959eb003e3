//! A directory on the local disk, served through `tokio::fs`.
//!
//! `LocalFs` holds no state besides its root, so it is cheap to build one
//! per request (the `WebDav` adapter does exactly that).

use std::future::Future;
use std::io;
#[cfg(unix)]
use std::os::unix::{ffi::OsStrExt, fs::MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use futures_util::{future, stream};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::davpath::DavPath;
use crate::fs::*;

/// Filesystem backed by a local directory.
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
    public: bool,
}

#[derive(Debug)]
struct LocalFile {
    file: tokio::fs::File,
}

struct LocalEntry {
    name: std::ffi::OsString,
    meta: io::Result<std::fs::Metadata>,
}

// Runs an io future and maps its error to FsError.
fn io_fut<'a, T, F>(fut: F) -> FsFuture<'a, T>
where
    F: Future<Output = io::Result<T>> + Send + 'a,
{
    Box::pin(async move { fut.await.map_err(FsError::from) })
}

impl LocalFs {
    /// Serve the directory `root`.
    ///
    /// With `public` set new files get mode 0644 and new directories 0755,
    /// otherwise 0600 and 0700. The umask applies on top.
    pub fn new(root: impl Into<PathBuf>, public: bool) -> Arc<LocalFs> {
        Arc::new(LocalFs {
            root: root.into(),
            public,
        })
    }

    /// The directory being served.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &DavPath) -> PathBuf {
        self.root.join(path.as_rel_ospath())
    }

    // Resolve `path`, refusing it if a symlink takes it outside the root.
    // Without `follow` a symlink in the last component is not followed,
    // so such a link can still be inspected and removed.
    async fn confine(&self, path: &DavPath, follow: bool) -> FsResult<PathBuf> {
        let full = self.resolve(path);
        let root = tokio::fs::canonicalize(&self.root).await?;
        let start = match (follow, full.parent()) {
            (false, Some(parent)) if !path.is_root() => parent,
            _ => full.as_path(),
        };
        // the deepest existing ancestor says where the path really is.
        let mut cur = start;
        let real = loop {
            match tokio::fs::canonicalize(cur).await {
                Ok(real) => break real,
                Err(e) if e.kind() == io::ErrorKind::NotFound => match cur.parent() {
                    Some(parent) => cur = parent,
                    None => return Err(e.into()),
                },
                Err(e) => return Err(e.into()),
            }
        };
        if real.starts_with(&root) {
            Ok(full)
        } else {
            debug!("localfs: {path:?} leads outside the root to {real:?}");
            Err(FsError::Forbidden)
        }
    }

    #[cfg(unix)]
    fn mode(&self, dir: bool) -> u32 {
        match (self.public, dir) {
            (true, true) => 0o755,
            (true, false) => 0o644,
            (false, true) => 0o700,
            (false, false) => 0o600,
        }
    }
}

impl DavFileSystem for LocalFs {
    fn metadata<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Box<dyn DavMetaData>> {
        Box::pin(async move {
            let p = self.confine(path, true).await?;
            Ok(Box::new(tokio::fs::metadata(p).await?) as Box<dyn DavMetaData>)
        })
    }

    fn symlink_metadata<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Box<dyn DavMetaData>> {
        Box::pin(async move {
            let p = self.confine(path, false).await?;
            Ok(Box::new(tokio::fs::symlink_metadata(p).await?) as Box<dyn DavMetaData>)
        })
    }

    fn read_dir<'a>(
        &'a self,
        path: &'a DavPath,
        meta: ReadDirMeta,
    ) -> FsFuture<'a, FsStream<Box<dyn DavDirEntry>>> {
        trace!("localfs: read_dir {path:?}");
        Box::pin(async move {
            let dir = self.confine(path, true).await?;
            let rd = tokio::fs::read_dir(dir).await?;
            let entries = stream::unfold(rd, move |mut rd| async move {
                let entry = match rd.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => return None,
                    Err(e) => {
                        debug!("localfs: read_dir: {e}");
                        return None;
                    }
                };
                let meta = match meta {
                    ReadDirMeta::Data => tokio::fs::metadata(entry.path()).await,
                    ReadDirMeta::DataSymlink | ReadDirMeta::None => entry.metadata().await,
                };
                let item = LocalEntry {
                    name: entry.file_name(),
                    meta,
                };
                Some((Box::new(item) as Box<dyn DavDirEntry>, rd))
            });
            Ok(Box::pin(entries) as FsStream<Box<dyn DavDirEntry>>)
        })
    }

    fn open<'a>(&'a self, path: &'a DavPath, options: OpenOptions) -> FsFuture<'a, Box<dyn DavFile>> {
        trace!("localfs: open {path:?} {options:?}");
        let mut oo = tokio::fs::OpenOptions::new();
        oo.read(options.read)
            .write(options.write)
            .append(options.append)
            .truncate(options.truncate)
            .create(options.create)
            .create_new(options.create_new);
        #[cfg(unix)]
        oo.mode(self.mode(false));
        Box::pin(async move {
            let p = self.confine(path, true).await?;
            let file = oo.open(p).await?;
            Ok(Box::new(LocalFile { file }) as Box<dyn DavFile>)
        })
    }

    fn create_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        trace!("localfs: create_dir {path:?}");
        #[allow(unused_mut)]
        let mut builder = tokio::fs::DirBuilder::new();
        #[cfg(unix)]
        builder.mode(self.mode(true));
        Box::pin(async move {
            let p = self.confine(path, true).await?;
            Ok(builder.create(p).await?)
        })
    }

    fn remove_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        trace!("localfs: remove_dir {path:?}");
        Box::pin(async move {
            let p = self.confine(path, false).await?;
            Ok(tokio::fs::remove_dir(p).await?)
        })
    }

    fn remove_file<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        trace!("localfs: remove_file {path:?}");
        Box::pin(async move {
            let p = self.confine(path, false).await?;
            Ok(tokio::fs::remove_file(p).await?)
        })
    }

    fn rename<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        trace!("localfs: rename {from:?} -> {to:?}");
        Box::pin(async move {
            let src = self.confine(from, false).await?;
            let dst = self.confine(to, false).await?;
            match tokio::fs::rename(&src, &dst).await {
                // a collection may replace a plain file.
                #[cfg(unix)]
                Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) && src.is_dir() => {
                    tokio::fs::remove_file(&dst).await?;
                    Ok(tokio::fs::rename(&src, &dst).await?)
                }
                res => Ok(res?),
            }
        })
    }

    fn copy<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        trace!("localfs: copy {from:?} -> {to:?}");
        Box::pin(async move {
            let src = self.confine(from, true).await?;
            let dst = self.confine(to, true).await?;
            match tokio::fs::copy(&src, &dst).await {
                Ok(_) => Ok(()),
                Err(e) => {
                    debug!("localfs: copy {src:?} -> {dst:?}: {e}");
                    Err(e.into())
                }
            }
        })
    }
}

impl DavDirEntry for LocalEntry {
    #[cfg(unix)]
    fn name(&self) -> Vec<u8> {
        self.name.as_bytes().to_vec()
    }

    #[cfg(not(unix))]
    fn name(&self) -> Vec<u8> {
        self.name.to_string_lossy().into_owned().into_bytes()
    }

    fn metadata(&self) -> FsFuture<'_, Box<dyn DavMetaData>> {
        let res = match &self.meta {
            Ok(m) => Ok(Box::new(m.clone()) as Box<dyn DavMetaData>),
            Err(e) => Err(FsError::from(e)),
        };
        Box::pin(future::ready(res))
    }
}

impl DavFile for LocalFile {
    fn metadata(&mut self) -> FsFuture<'_, Box<dyn DavMetaData>> {
        io_fut(async move { Ok(Box::new(self.file.metadata().await?) as Box<dyn DavMetaData>) })
    }

    fn write_bytes(&mut self, buf: Bytes) -> FsFuture<'_, ()> {
        io_fut(async move { self.file.write_all(&buf).await })
    }

    fn read_bytes(&mut self, count: usize) -> FsFuture<'_, Bytes> {
        io_fut(async move {
            let mut buf = BytesMut::with_capacity(count);
            let mut limited = (&mut self.file).take(count as u64);
            while limited.read_buf(&mut buf).await? > 0 {}
            Ok(buf.freeze())
        })
    }

    fn seek(&mut self, pos: io::SeekFrom) -> FsFuture<'_, u64> {
        io_fut(self.file.seek(pos))
    }

    fn flush(&mut self) -> FsFuture<'_, ()> {
        io_fut(async move {
            self.file.flush().await?;
            self.file.sync_all().await
        })
    }
}

impl DavMetaData for std::fs::Metadata {
    fn len(&self) -> u64 {
        std::fs::Metadata::len(self)
    }

    fn modified(&self) -> FsResult<SystemTime> {
        Ok(std::fs::Metadata::modified(self)?)
    }

    fn created(&self) -> FsResult<SystemTime> {
        Ok(std::fs::Metadata::created(self)?)
    }

    fn is_dir(&self) -> bool {
        std::fs::Metadata::is_dir(self)
    }

    fn is_file(&self) -> bool {
        std::fs::Metadata::is_file(self)
    }

    fn is_symlink(&self) -> bool {
        self.file_type().is_symlink()
    }

    // inode-size-mtime, like apache.
    fn etag(&self) -> Option<String> {
        let mtime = std::fs::Metadata::modified(self).ok()?.duration_since(UNIX_EPOCH).ok()?;
        let usecs = mtime.as_secs() * 1_000_000 + u64::from(mtime.subsec_micros());
        #[cfg(unix)]
        let parts = [Some(self.ino()), self.is_file().then(|| self.len()), Some(usecs)];
        #[cfg(not(unix))]
        let parts = [None, self.is_file().then(|| self.len()), Some(usecs)];
        let tag: Vec<String> = parts.iter().flatten().map(|n| format!("{n:x}")).collect();
        Some(tag.join("-"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path(), false);
        let path = DavPath::new("/hello.txt").unwrap();

        let mut oo = OpenOptions::write();
        oo.create = true;
        oo.truncate = true;
        let mut f = fs.open(&path, oo).await.unwrap();
        f.write_bytes(Bytes::from_static(b"hello world")).await.unwrap();
        f.flush().await.unwrap();
        drop(f);

        let meta = fs.metadata(&path).await.unwrap();
        assert!(meta.is_file());
        assert_eq!(meta.len(), 11);
        assert!(meta.etag().is_some());

        let mut f = fs.open(&path, OpenOptions::read()).await.unwrap();
        f.seek(io::SeekFrom::Start(6)).await.unwrap();
        let data = f.read_bytes(100).await.unwrap();
        assert_eq!(&data[..], b"world");
    }

    #[tokio::test]
    async fn test_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path(), false);
        let sub = DavPath::new("/sub/").unwrap();
        fs.create_dir(&sub).await.unwrap();
        assert_eq!(fs.create_dir(&sub).await.unwrap_err(), FsError::Exists);
        std::fs::write(dir.path().join("sub/a.txt"), b"a").unwrap();

        let mut entries = fs.read_dir(&sub, ReadDirMeta::Data).await.unwrap();
        let mut names = Vec::new();
        while let Some(e) = entries.next().await {
            names.push(e.name());
        }
        assert_eq!(names, vec![b"a.txt".to_vec()]);

        let missing = DavPath::new("/nope/x.txt").unwrap();
        assert_eq!(fs.metadata(&missing).await.unwrap_err(), FsError::NotFound);
        let under_file = DavPath::new("/sub/a.txt/x").unwrap();
        assert_eq!(fs.metadata(&under_file).await.unwrap_err(), FsError::NotFound);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_outside_root() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), b"s").unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("out")).unwrap();
        std::fs::create_dir(dir.path().join("in")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("in"), dir.path().join("alias")).unwrap();
        let fs = LocalFs::new(dir.path(), false);

        let secret = DavPath::new("/out/secret").unwrap();
        assert_eq!(fs.metadata(&secret).await.unwrap_err(), FsError::Forbidden);
        assert_eq!(fs.open(&secret, OpenOptions::read()).await.unwrap_err(), FsError::Forbidden);
        let new = DavPath::new("/out/new/").unwrap();
        assert_eq!(fs.create_dir(&new).await.unwrap_err(), FsError::Forbidden);
        assert!(!outside.path().join("new").exists());

        // links inside the root are followed.
        assert!(fs.metadata(&DavPath::new("/alias/").unwrap()).await.unwrap().is_dir());

        // the link itself can be seen and removed.
        let out = DavPath::new("/out").unwrap();
        assert!(fs.symlink_metadata(&out).await.unwrap().is_symlink());
        fs.remove_file(&out).await.unwrap();
        assert!(outside.path().join("secret").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rename_dir_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path(), true);
        std::fs::create_dir(dir.path().join("d")).unwrap();
        std::fs::write(dir.path().join("d/x"), b"x").unwrap();
        std::fs::write(dir.path().join("f"), b"f").unwrap();

        let (d, f) = (DavPath::new("/d/").unwrap(), DavPath::new("/f").unwrap());
        fs.rename(&d, &f).await.unwrap();
        assert!(dir.path().join("f/x").is_file());
        assert!(!dir.path().join("d").exists());
    }
}
