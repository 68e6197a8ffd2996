//! # skiff-share
//!
//! The local share index: scans configured directories into an
//! in-memory tree keyed by content hash, answers hash / name / path /
//! directory-name queries, and renders the tree as compressed catalog
//! documents for peers.
//!
//! ## Architecture
//!
//! Mutations happen only in the scanner worker under the structural
//! writer lock; queries take the reader lock on caller threads. A
//! refresh rebuilds whole root subtrees off the lock and publishes
//! them with a map-entry swap, so readers always observe either the
//! old or the new tree, never a half-built one.

pub mod bloom;
pub mod filelist;
pub mod index;
pub mod profiles;
pub mod scanner;
pub mod search;
pub mod state;
pub mod temp;
pub mod tree;

use thiserror::Error;

pub use index::{is_sub_dir_name, ShareDirSpec, ShareIndex};
pub use profiles::{ProfileId, ShareProfile, PROFILE_DEFAULT, PROFILE_HIDDEN};
pub use scanner::{DirEntryInfo, DirectoryLister, FsLister, RefreshKind, RefreshResult};
pub use search::{ResultKind, SearchResultItem};

/// Errors surfaced by the share index.
#[derive(Debug, Error)]
pub enum ShareError {
    /// Virtual path, content hash or profile not found. Peers see
    /// this as `FILE_NOT_AVAILABLE`.
    #[error("file not available")]
    FileNotAvailable,

    /// Caller tried to share a reserved path or an empty name.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Legacy NMDC catalog requested.
    #[error("NMDC-style lists are no longer supported, please upgrade your client")]
    LegacyList,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("share cache parse error: {0}")]
    CacheParse(String),
}

pub type Result<T> = std::result::Result<T, ShareError>;
