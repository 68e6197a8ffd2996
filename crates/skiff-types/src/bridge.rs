//! Seams to the subsystems that live outside the sharing core.
//!
//! The hash manager, download queue and client connections are
//! separate services; the core talks to them through these traits and
//! never owns their state. Tests substitute in-memory doubles.

use std::path::Path;

use crossbeam_channel::Receiver;
use thiserror::Error;

use crate::search::AdcQuery;
use crate::tth::{Cid, Tth};

/// A peer identity as the core needs it: client id plus display
/// context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUser {
    pub cid: Cid,
    pub nick: String,
    pub hub_hint: String,
}

/// Download priority forwarded to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    #[default]
    Default,
    Paused,
    Lowest,
    Low,
    Normal,
    High,
    Highest,
}

/// The hash manager: owns the TTH store and hashing schedule.
pub trait HashProvider: Send + Sync {
    /// Cached tree hash for a live file. `None` means the hash is
    /// missing or stale; the hash manager is expected to schedule
    /// hashing asynchronously and the caller skips the file.
    fn tth(&self, path: &Path, size: i64, mtime: u32) -> Option<Tth>;

    /// Lookup by path and size only, used when rebuilding the share
    /// from its cache document.
    fn tth_for_cached(&self, path: &Path, size: i64) -> Option<Tth>;

    /// Merkle tree leaf data for serving hash trees to peers.
    fn leaves(&self, tth: &Tth) -> Option<Vec<u8>>;
}

/// Handle to a bundle under construction in the queue manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BundleId(pub u64);

/// Parameters for a new bundle.
#[derive(Debug, Clone)]
pub struct BundleSpec {
    pub target: String,
    pub priority: Priority,
    /// Remote date of the bundled directory, seconds since the epoch.
    pub date: u32,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("target already queued: {0}")]
    Duplicate(String),
    #[error("queue rejected file: {0}")]
    Rejected(String),
}

/// Totals reported back from a queue match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchResult {
    pub matched_files: usize,
    pub new_files: usize,
    pub bundles: usize,
}

/// The queue/download manager.
pub trait QueueBridge: Send + Sync {
    /// Lowercased directory targets of active bundles under the given
    /// roots; the scanner must not share them.
    fn forbidden_paths(&self, roots: &[String]) -> Vec<String>;

    /// Is this content queued for download?
    fn is_queued(&self, tth: &Tth) -> bool;

    fn create_bundle(&self, spec: BundleSpec) -> BundleId;

    fn add_file(
        &self,
        bundle: BundleId,
        target: &str,
        size: i64,
        tth: &Tth,
        user: &RemoteUser,
    ) -> Result<(), QueueError>;

    fn submit_bundle(&self, bundle: BundleId);

    /// Delegate an incomplete remote directory to the
    /// directory-download manager (user will be asked for the target).
    fn add_directory_download(
        &self,
        dir: &str,
        user: &RemoteUser,
        target: &str,
        priority: Priority,
        retry_without_recursion: bool,
    );

    /// Ask the peer for a partial file list of the given directory.
    fn request_partial_list(&self, user: &RemoteUser, dir: &str);

    /// Match a flattened listing against the queue; `files` carries
    /// `(remote path, size, tth)` tuples.
    fn match_listing(&self, user: &RemoteUser, files: &[(String, i64, Tth)]) -> MatchResult;
}

/// One directory-path result from a direct search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectSearchResult {
    pub path: String,
}

/// Client-connection seam for searches dispatched to a peer. Results
/// arrive on the returned channel; the sender side closing marks the
/// end of the search.
pub trait PeerSearch: Send + Sync {
    fn direct_search(
        &self,
        user: &RemoteUser,
        query: &AdcQuery,
        directory: &str,
    ) -> Receiver<DirectSearchResult>;
}

/// How much of a remote directory the local share already has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirShareState {
    None,
    /// A directory with that name is shared but the sizes differ.
    Partial,
    Full,
}

/// Duplicate classification for remote listing entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DupeState {
    #[default]
    None,
    Share,
    PartialShare,
    Queue,
    PartialQueue,
    ShareQueue,
}

impl DupeState {
    pub fn is_share(self) -> bool {
        matches!(self, DupeState::Share | DupeState::PartialShare)
    }

    pub fn is_queue(self) -> bool {
        matches!(self, DupeState::Queue | DupeState::PartialQueue)
    }
}

/// The share index as the listing side sees it.
pub trait ShareLookup: Send + Sync {
    /// Shared content with a matching file name?
    fn is_file_shared(&self, tth: &Tth, name: &str) -> bool;

    /// Match a remote directory name (NMDC-style path) against shared
    /// directory names.
    fn dir_share_state(&self, path: &str, size: i64) -> DirShareState;
}
