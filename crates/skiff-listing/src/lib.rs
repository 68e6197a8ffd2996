//! # skiff-listing
//!
//! Remote directory listings: consumes a peer's catalog (full, or
//! partial and delivered incrementally while the user browses),
//! reconstructs the remote tree, annotates duplicates against the
//! local share and queue, matches auto-download rules, searches the
//! tree, and drives download submission.

pub mod adl;
pub mod download;
pub mod engine;
pub mod parser;
pub mod tree;

use thiserror::Error;

pub use adl::{AdlMatcher, AdlRule, AdlSourceKind};
pub use engine::{DirectoryListing, ListingEvent, ListingParams, SearchSpec};
pub use tree::{ListingDir, ListingFile, ListingTree, NodeId};

/// Errors surfaced by the listing engine.
#[derive(Debug, Error)]
pub enum ListingError {
    /// Shutdown or user cancel; commits nothing.
    #[error("aborted")]
    Aborted,

    #[error("listing parse error: {0}")]
    Parse(String),

    #[error("file not available")]
    NotFound,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Share(#[from] skiff_share::ShareError),
}

pub type Result<T> = std::result::Result<T, ListingError>;
