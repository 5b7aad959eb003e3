//! ## WebDAV protocol engine
//!
//! [Webdav] (RFC4918) is HTTP (GET/HEAD/PUT/DELETE) plus a set of
//! extension methods to manage collections (PROPFIND, MKCOL), copy and
//! move resources (COPY, MOVE), keep properties on them (PROPPATCH) and
//! lock them (LOCK, UNLOCK).
//!
//! This crate maps those methods onto a [filesystem][DavFileSystem]. The
//! handler takes a `http::Request` and produces a `http::Response`, so it
//! plugs into any server that speaks the `http`/`http_body` types, such
//! as [hyper].
//!
//! ## Storage
//!
//! - a [filesystem][DavFileSystem] for storage. Included are [`LocalFs`],
//!   which serves a local directory, and [`MemFs`], an ephemeral
//!   in-memory tree.
//! - a [lock system][DavLockSystem], [`MemLs`], that keeps the lock
//!   table in memory.
//! - a [property store][DavPropStore], [`MemPs`], for the dead
//!   properties set with PROPPATCH.
//!
//! Lock systems and property stores can be shared between handlers, so
//! that locks survive a handler that is built per request.
//!
//! ## Standards
//!
//! The class 1 and 2 parts of [RFC4918], plus the relevant parts of the
//! HTTP RFCs: preconditions (If-Match, If-None-Match, If-Modified-Since,
//! If-Unmodified-Since), single byte ranges (Range) and `PUT` with a
//! `Content-Range` header for partial updates.
//!
//! ## Hosting
//!
//! The [`webdav`] module has a ready-made handler, [`WebDav`], with a
//! serde-deserializable configuration, placeholder expansion in the root
//! and prefix, directory listings for plain `GET`, and automatic creation
//! of parent collections on upload.
//!
//! ## Example
//!
//! ```
//! use dav_engine::{body::Body, DavHandler, FileSystem, LockSystem, PropStore};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let dav = DavHandler::builder(FileSystem::Mem)
//!     .locksystem(LockSystem::Mem)
//!     .propstore(PropStore::Mem)
//!     .build();
//!
//! let put = http::Request::put("/hello.txt").body(Body::from("hello")).unwrap();
//! assert_eq!(dav.handle(put).await.status(), 201);
//!
//! let get = http::Request::get("/hello.txt").body(Body::empty()).unwrap();
//! assert_eq!(dav.handle(get).await.status(), 200);
//! # }
//! ```
//!
//! `demos/server.rs` runs the handler behind a [hyper] server.
//!
//! [Webdav]: https://tools.ietf.org/html/rfc4918
//! [RFC4918]: https://tools.ietf.org/html/rfc4918
//! [hyper]: https://hyper.rs/
//! [`LocalFs`]: fs::localfs::LocalFs
//! [`MemFs`]: fs::memfs::MemFs
//! [`MemLs`]: ls::memls::MemLs
//! [`MemPs`]: ps::memps::MemPs
//! [DavFileSystem]: fs::DavFileSystem
//! [DavLockSystem]: ls::DavLockSystem
//! [DavPropStore]: ps::DavPropStore

#![cfg_attr(docsrs, feature(doc_cfg))]

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

mod conditional;
mod davhandler;
mod davheaders;
mod errors;
mod multierror;
mod util;
mod xmltree_ext;

pub mod body;
pub mod davpath;
pub mod fs;
pub mod ls;
pub mod ps;
#[cfg(any(docsrs, feature = "localfs"))]
#[cfg_attr(docsrs, doc(cfg(feature = "localfs")))]
pub mod webdav;

pub use crate::davhandler::{DavBuilder, DavHandler, FileSystem, LockSystem, Logger, PropStore};
pub use crate::errors::DavError;
pub use crate::util::{DavMethod, DavMethodSet};
#[cfg(any(docsrs, feature = "localfs"))]
pub use crate::webdav::{WebDav, WebDavConfig};
