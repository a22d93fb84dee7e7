//! Async client library for the 9P2000.L protocol.
//!
//! Mirrors the protocol engine in `rs9p` from the other end of the wire: negotiate
//! `Tversion`, attach to a tree, walk/open/read/write/clunk fids. See [`client::mount`]
//! for the usual entry point.
//!
//! ```no_run
//! # async fn example() -> rs9p::utils::Result<()> {
//! use rs9p_client::client;
//!
//! let (_fs, root) = client::mount("tcp!localhost!564", client::DEFAULT_MSIZE, "", "nobody", 0).await?;
//! let dirfid = root.walk("some/dir").await?;
//! for entry in dirfid.readdir_all(8192).await? {
//!     println!("{}", entry.name);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod fidpool;
pub mod tagpool;

pub use client::{Client, ClientFid, mount};
