//! # skiff-types
//!
//! Shared primitives for the skiff sharing core.
//!
//! This crate is the single source of truth for the types both halves
//! of the core exchange: content/user identifiers, protocol file
//! types, search queries, the seams to external subsystems (hash
//! manager, download queue, peer connections) and the single-worker
//! task plumbing.

pub mod bridge;
pub mod filetype;
pub mod search;
pub mod tth;
pub mod worker;

pub use bridge::{
    BundleId, BundleSpec, DirShareState, DirectSearchResult, DupeState, HashProvider, MatchResult,
    PeerSearch, Priority, QueueBridge, QueueError, RemoteUser, ShareLookup,
};
pub use filetype::FileType;
pub use search::{wildcard_to_regex, AdcQuery, NmdcQuery, SizeMode, StringSearch};
pub use tth::{Cid, IdParseError, Tth, TTH_BASE32_LEN, TTH_BYTES};
pub use worker::{TaskQueue, WorkerGate};
