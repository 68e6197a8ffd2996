//! Share profiles and profile directories.
//!
//! A share profile is a named view of the catalog; each root maps to
//! one or more profiles under a per-profile virtual name, and
//! directories can be excluded per profile. Ids below 10 are
//! reserved; user profiles start above.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Profile token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProfileId(pub u32);

/// The profile every hub sees unless configured otherwise.
pub const PROFILE_DEFAULT: ProfileId = ProfileId(0);
/// The empty-share profile.
pub const PROFILE_HIDDEN: ProfileId = ProfileId(1);

/// First id available to user-defined profiles.
pub const FIRST_USER_PROFILE: u32 = 11;

/// Lazily regenerated catalog state for one profile.
#[derive(Debug, Clone, Default)]
pub struct FileListState {
    pub dirty: bool,
    pub force_dirty: bool,
    /// Bumped on every regeneration; part of the on-disk name so an
    /// open upload of the previous list stays valid.
    pub generation: u32,
    /// Last written catalog, if any.
    pub path: Option<PathBuf>,
}

impl FileListState {
    pub fn needs_regen(&self, forced: bool) -> bool {
        forced || self.dirty || self.force_dirty || self.path.is_none()
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
        self.force_dirty = false;
    }
}

/// A named view of the share.
#[derive(Debug, Clone)]
pub struct ShareProfile {
    pub id: ProfileId,
    pub name: String,
    pub list: FileListState,
}

impl ShareProfile {
    pub fn new(id: ProfileId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            list: FileListState::default(),
        }
    }
}

/// Root or exclusion marker attached to a tree node.
#[derive(Debug, Clone, Default)]
pub struct ProfileDir {
    /// Real path, trailing separator included.
    pub path: String,
    /// Profile to virtual name, for roots.
    pub profiles: BTreeMap<ProfileId, String>,
    /// Profiles this subtree is hidden from.
    pub excluded: BTreeSet<ProfileId>,
    pub flags: u32,
}

impl ProfileDir {
    pub const ROOT: u32 = 1 << 0;
    pub const INCOMING: u32 = 1 << 1;
    pub const EXCLUDE_PROFILE: u32 = 1 << 2;
    /// Excluded from every profile it could be reached through;
    /// recomputed by the exclusion fold.
    pub const EXCLUDE_TOTAL: u32 = 1 << 3;

    pub fn new_root(path: &str, virtual_name: &str, profile: ProfileId) -> Self {
        let mut pd = Self {
            path: path.to_string(),
            ..Self::default()
        };
        pd.add_root_profile(virtual_name, profile);
        pd
    }

    pub fn new_exclude(path: &str, profile: ProfileId) -> Self {
        let mut pd = Self {
            path: path.to_string(),
            ..Self::default()
        };
        pd.add_exclude(profile);
        pd
    }

    pub fn add_root_profile(&mut self, virtual_name: &str, profile: ProfileId) {
        self.profiles.insert(profile, virtual_name.to_string());
        self.flags |= Self::ROOT;
    }

    /// Remove a profile mapping; true when no roots remain.
    pub fn remove_root_profile(&mut self, profile: ProfileId) -> bool {
        self.profiles.remove(&profile);
        self.profiles.is_empty()
    }

    pub fn add_exclude(&mut self, profile: ProfileId) {
        self.excluded.insert(profile);
        self.flags |= Self::EXCLUDE_PROFILE;
    }

    pub fn has_roots(&self) -> bool {
        self.flags & Self::ROOT != 0 && !self.profiles.is_empty()
    }

    pub fn has_profile(&self, profile: ProfileId) -> bool {
        self.profiles.contains_key(&profile)
    }

    pub fn has_any_profile(&self, profiles: &BTreeSet<ProfileId>) -> bool {
        profiles.iter().any(|p| self.has_profile(*p))
    }

    pub fn is_excluded(&self, profile: ProfileId) -> bool {
        !self.excluded.is_empty() && self.excluded.contains(&profile)
    }

    pub fn name_for(&self, profile: ProfileId) -> Option<&str> {
        self.profiles.get(&profile).map(String::as_str)
    }

    pub fn is_set(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }

    pub fn unset_flag(&mut self, flag: u32) {
        self.flags &= !flag;
    }

    pub fn has_excludes(&self) -> bool {
        !self.excluded.is_empty()
    }
}

/// Virtual names may not contain path separators.
pub fn validate_virtual(name: &str) -> String {
    name.replace(['/', '\\'], "_")
}
