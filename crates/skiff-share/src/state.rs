//! Published share state.
//!
//! Everything a query can touch lives in `ShareState` behind the
//! structural reader/writer lock: the root trees, the profile
//! registry, the content-hash index and the bloom filter. The name
//! index and the bundle-directory list sit in `NameIndex` behind
//! their own lock and are only held briefly.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use skiff_types::Tth;

use crate::bloom::Bloom;
use crate::profiles::{ProfileDir, ProfileId, ShareProfile};
use crate::tree::{DirId, DirNode, DirRef, FileNode, FileRef, RootId, RootTree};
use crate::ShareError;

/// Append a trailing separator when missing.
pub fn normalize_dir_path(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

/// Case-insensitive: is `sub` equal to or below `parent`? Both paths
/// carry trailing separators.
pub fn is_parent_or_exact(parent: &str, sub: &str) -> bool {
    sub.len() >= parent.len() && sub[..parent.len()].eq_ignore_ascii_case(parent)
}

/// Case-insensitive: is `sub` strictly below `parent`?
pub fn is_strict_sub(parent: &str, sub: &str) -> bool {
    sub.len() > parent.len() && sub[..parent.len()].eq_ignore_ascii_case(parent)
}

/// Leaf directory name of a path with trailing separator.
pub fn last_dir(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(i) => &trimmed[i + 1..],
        None => trimmed,
    }
}

/// The name index and bundle-directory list, behind their own lock.
#[derive(Default)]
pub struct NameIndex {
    /// Lowercased leaf directory name to nodes.
    pub dirs: HashMap<String, Vec<DirRef>>,
    /// Sorted, lowercased targets of active bundles; never scanned.
    pub bundle_dirs: Vec<String>,
}

impl NameIndex {
    pub fn insert(&mut self, lower_name: String, dref: DirRef) {
        self.dirs.entry(lower_name).or_default().push(dref);
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = (String, DirRef)>) {
        for (name, dref) in entries {
            self.insert(name, dref);
        }
    }

    /// Drop every entry pointing into the given tree.
    pub fn remove_root(&mut self, root: RootId) {
        self.dirs.retain(|_, refs| {
            refs.retain(|r| r.root != root);
            !refs.is_empty()
        });
    }

    /// Drop entries for specific nodes of one tree.
    pub fn remove_nodes(&mut self, root: RootId, nodes: &HashSet<DirId>) {
        self.dirs.retain(|_, refs| {
            refs.retain(|r| r.root != root || !nodes.contains(&r.dir));
            !refs.is_empty()
        });
    }

    pub fn clear_dirs(&mut self) {
        self.dirs.clear();
    }

    pub fn add_bundle_dir(&mut self, target_lower: String) {
        let pos = self
            .bundle_dirs
            .binary_search(&target_lower)
            .unwrap_or_else(|p| p);
        self.bundle_dirs.insert(pos, target_lower);
    }

    pub fn set_bundle_dirs(&mut self, mut targets: Vec<String>) {
        targets.sort();
        self.bundle_dirs = targets;
    }

    pub fn is_forbidden(&self, path_lower: &str) -> bool {
        self.bundle_dirs.binary_search_by(|b| b.as_str().cmp(path_lower)).is_ok()
    }
}

/// Everything under the structural lock.
#[derive(Default)]
pub struct ShareState {
    /// One arena per top-level share root.
    pub trees: HashMap<RootId, RootTree>,
    /// Every share-root real path (trailing separator) to its node.
    /// Top-level roots map to node 0 of their own tree; nested roots
    /// map into their parent's tree.
    pub roots: BTreeMap<String, DirRef>,
    /// Root and exclusion markers by real path.
    pub profile_dirs: BTreeMap<String, ProfileDir>,
    pub profiles: Vec<ShareProfile>,
    /// Content hash to every file carrying it.
    pub tth_index: HashMap<Tth, Vec<FileRef>>,
    pub bloom: Bloom,
    /// Sum of all shared file sizes.
    pub total_size: i64,
    next_root: u32,
}

impl ShareState {
    pub fn alloc_root_id(&mut self) -> RootId {
        let id = RootId(self.next_root);
        self.next_root += 1;
        id
    }

    pub fn tree(&self, root: RootId) -> &RootTree {
        &self.trees[&root]
    }

    pub fn dir(&self, dref: DirRef) -> &DirNode {
        self.tree(dref.root).dir(dref.dir)
    }

    pub fn file(&self, fref: FileRef) -> &FileNode {
        self.tree(fref.root).file(fref.dir, fref.file)
    }

    pub fn profile(&self, id: ProfileId) -> Option<&ShareProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    pub fn profile_mut(&mut self, id: ProfileId) -> Option<&mut ShareProfile> {
        self.profiles.iter_mut().find(|p| p.id == id)
    }

    /// Flag every profile catalog stale; `force` also bypasses the
    /// regeneration backoff.
    pub fn set_dirty(&mut self, force: bool) {
        for profile in &mut self.profiles {
            profile.list.dirty = true;
            if force {
                profile.list.force_dirty = true;
            }
        }
    }

    /// Top-level roots: entries not nested under another root.
    pub fn parents(&self) -> Vec<(String, DirRef)> {
        self.roots
            .iter()
            .filter(|(path, _)| {
                !self
                    .roots
                    .keys()
                    .any(|other| other.as_str() != path.as_str() && is_strict_sub(other, path))
            })
            .map(|(path, dref)| (path.clone(), *dref))
            .collect()
    }

    // ------------------------------------------------------------------
    // Names and paths
    // ------------------------------------------------------------------

    /// Display name for a profile: the virtual name at a root, the
    /// real name elsewhere.
    pub fn virtual_name(&self, dref: DirRef, profile: ProfileId) -> String {
        let node = self.dir(dref);
        if let Some(pd) = node.profile_key.as_ref().and_then(|k| self.profile_dirs.get(k)) {
            if let Some(name) = pd.name_for(profile) {
                return name.to_string();
            }
        }
        node.real_name.clone()
    }

    /// Catalog-space path: `/<virtualRoot>/<segment>/.../`.
    pub fn adc_path(&self, dref: DirRef, profile: ProfileId) -> String {
        let tree = self.tree(dref.root);
        let mut segments = Vec::new();
        let mut cur = dref.dir;
        loop {
            let node = tree.dir(cur);
            let root_name = node
                .profile_key
                .as_ref()
                .and_then(|k| self.profile_dirs.get(k))
                .and_then(|pd| pd.name_for(profile));
            if let Some(name) = root_name {
                segments.push(name.to_string());
                break;
            }
            segments.push(node.real_name.clone());
            match node.parent {
                Some(p) => cur = p,
                None => break,
            }
        }

        let mut out = String::from("/");
        for seg in segments.iter().rev() {
            out.push_str(seg);
            out.push('/');
        }
        out
    }

    /// NMDC-style display path, `\`-separated with a trailing slash.
    pub fn full_name(&self, dref: DirRef, profile: ProfileId) -> String {
        let adc = self.adc_path(dref, profile);
        adc.trim_start_matches('/').replace('/', "\\")
    }

    /// Host-filesystem path of a directory, trailing separator
    /// included. `None` when the node's root registration is gone.
    pub fn real_path_of_dir(&self, dref: DirRef) -> Option<String> {
        let tree = self.trees.get(&dref.root)?;
        let mut segments = Vec::new();
        let mut cur = dref.dir;
        loop {
            let node = tree.dir(cur);
            match node.parent {
                Some(p) => {
                    segments.push(node.real_name.as_str());
                    cur = p;
                }
                None => {
                    let pd = self.profile_dirs.get(node.profile_key.as_ref()?)?;
                    let mut out = pd.path.clone();
                    for seg in segments.iter().rev() {
                        out.push_str(seg);
                        out.push('/');
                    }
                    return Some(out);
                }
            }
        }
    }

    pub fn real_path_of_file(&self, fref: FileRef) -> Option<String> {
        let dir = self.real_path_of_dir(fref.dir_ref())?;
        Some(format!("{dir}{}", self.file(fref).name))
    }

    // ------------------------------------------------------------------
    // Profile visibility
    // ------------------------------------------------------------------

    /// Does this node's own exclusion marker hide it from `profile`?
    pub fn is_level_excluded(&self, dref: DirRef, profile: ProfileId) -> bool {
        self.dir(dref)
            .profile_key
            .as_ref()
            .and_then(|k| self.profile_dirs.get(k))
            .is_some_and(|pd| pd.is_excluded(profile))
    }

    /// A node is visible for `profile` when some ancestor (or itself)
    /// is a root for it and no marker on the way excludes it.
    pub fn is_visible(&self, dref: DirRef, profile: ProfileId) -> bool {
        let tree = self.tree(dref.root);
        let mut cur = Some(dref.dir);
        while let Some(id) = cur {
            let node = tree.dir(id);
            if let Some(pd) = node.profile_key.as_ref().and_then(|k| self.profile_dirs.get(k)) {
                if pd.is_excluded(profile) {
                    return false;
                }
                if pd.has_profile(profile) {
                    return true;
                }
            }
            cur = node.parent;
        }
        false
    }

    /// Visibility against a profile set; used for upload requests
    /// that may arrive under several profiles.
    pub fn is_visible_any(&self, dref: DirRef, profiles: &BTreeSet<ProfileId>) -> bool {
        let tree = self.tree(dref.root);
        let mut cur = Some(dref.dir);
        while let Some(id) = cur {
            let node = tree.dir(id);
            if let Some(pd) = node.profile_key.as_ref().and_then(|k| self.profile_dirs.get(k)) {
                if pd.has_any_profile(profiles) {
                    return true;
                }
            }
            cur = node.parent;
        }
        false
    }

    /// Recursive size as seen by one profile.
    pub fn profile_size(&self, dref: DirRef, profile: ProfileId) -> i64 {
        let tree = self.tree(dref.root);
        let node = tree.dir(dref.dir);
        let mut total = node.size;
        for child in node.children.values() {
            let cref = DirRef {
                root: dref.root,
                dir: *child,
            };
            if self.is_level_excluded(cref, profile) {
                continue;
            }
            total += self.profile_size(cref, profile);
        }
        total
    }

    /// Size and file count for one profile.
    pub fn profile_info(&self, dref: DirRef, profile: ProfileId, size: &mut i64, files: &mut usize) {
        let node = self.dir(dref);
        *size += node.size;
        *files += node.files.len();
        for child in node.children.values() {
            let cref = DirRef {
                root: dref.root,
                dir: *child,
            };
            if self.is_level_excluded(cref, profile) {
                continue;
            }
            self.profile_info(cref, profile, size, files);
        }
    }

    // ------------------------------------------------------------------
    // Virtual path resolution
    // ------------------------------------------------------------------

    /// Roots registered under `virtual_name` for the profile. Several
    /// real roots may share one name.
    pub fn by_virtual(&self, virtual_name: &str, profile: ProfileId) -> Vec<DirRef> {
        self.roots
            .iter()
            .filter(|(path, _)| {
                self.profile_dirs
                    .get(path.as_str())
                    .and_then(|pd| pd.name_for(profile))
                    .is_some_and(|name| name.eq_ignore_ascii_case(virtual_name))
            })
            .map(|(_, dref)| *dref)
            .collect()
    }

    /// Resolve a virtual path to every matching directory. Segments
    /// are walked case-insensitively; candidates hitting an exclusion
    /// marker for the profile are dropped. The final segment is only
    /// walked when the path carries a trailing separator; a bare
    /// tail names a file inside the result.
    pub fn find_virtuals(
        &self,
        virtual_path: &str,
        profile: ProfileId,
    ) -> Result<Vec<DirRef>, ShareError> {
        if !virtual_path.starts_with('/') {
            return Err(ShareError::FileNotAvailable);
        }
        let rest = &virtual_path[1..];
        let slash = rest.find('/').ok_or(ShareError::FileNotAvailable)?;
        if slash == 0 {
            return Err(ShareError::FileNotAvailable);
        }

        let candidates = self.by_virtual(&rest[..slash], profile);
        if candidates.is_empty() {
            return Err(ShareError::FileNotAvailable);
        }

        let mut segments: Vec<&str> = rest[slash + 1..]
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        if !virtual_path.ends_with('/') {
            segments.pop();
        }

        let mut out = Vec::new();
        'candidates: for candidate in candidates {
            let tree = self.tree(candidate.root);
            let mut cur = candidate;
            for segment in &segments {
                match tree.find_child(cur.dir, segment) {
                    Some(child) => {
                        let cref = DirRef {
                            root: cur.root,
                            dir: child,
                        };
                        if self.is_level_excluded(cref, profile) {
                            continue 'candidates;
                        }
                        cur = cref;
                    }
                    None => continue 'candidates,
                }
            }
            out.push(cur);
        }

        if out.is_empty() {
            return Err(ShareError::FileNotAvailable);
        }
        Ok(out)
    }

    /// Locate a directory by real path, optionally creating missing
    /// intermediate nodes. `create` supplies the directory validator
    /// and the timestamp for new nodes; created nodes are returned so
    /// the caller can extend the name index.
    pub fn find_directory(
        &mut self,
        real_path: &str,
        create: Option<(&dyn Fn(&str) -> bool, u32)>,
        created: &mut Vec<(String, DirRef)>,
    ) -> Option<DirRef> {
        let path = normalize_dir_path(real_path);
        let (root_path, start) = self
            .roots
            .iter()
            .filter(|(rp, _)| is_parent_or_exact(rp, &path))
            .max_by_key(|(rp, _)| rp.len())
            .map(|(rp, dref)| (rp.clone(), *dref))?;

        let mut cur = start;
        let mut full = root_path;
        for segment in path[full.len()..].split('/').filter(|s| !s.is_empty()) {
            full.push_str(segment);
            full.push('/');

            if let Some(child) = self.tree(cur.root).find_child(cur.dir, segment) {
                cur = DirRef {
                    root: cur.root,
                    dir: child,
                };
                continue;
            }

            let (validate, now) = create?;
            if !validate(&full) {
                return None;
            }
            if self
                .profile_dirs
                .get(&full)
                .is_some_and(|pd| pd.is_set(ProfileDir::EXCLUDE_TOTAL))
            {
                return None;
            }

            let tree = self.trees.get_mut(&cur.root)?;
            let node = DirNode::new(segment.to_string(), None, now);
            let child = tree.add_dir(cur.dir, node);
            cur = DirRef {
                root: cur.root,
                dir: child,
            };
            created.push((segment.to_lowercase(), cur));
        }
        Some(cur)
    }

    // ------------------------------------------------------------------
    // Index maintenance
    // ------------------------------------------------------------------

    /// Collect a subtree's node ids.
    pub fn subtree_dirs(&self, dref: DirRef) -> HashSet<DirId> {
        let mut out = HashSet::new();
        self.tree(dref.root).walk(dref.dir, &mut |id, _| {
            out.insert(id);
        });
        out
    }

    /// Remove a subtree's contribution to the hash index and totals,
    /// then empty its nodes. The bloom filter keeps its bits until
    /// the next full rebuild.
    pub fn clean_indices(&mut self, dref: DirRef, names: &mut NameIndex) {
        let dirs = self.subtree_dirs(dref);

        let Some(tree) = self.trees.get_mut(&dref.root) else {
            return;
        };
        let mut removed = Vec::new();
        let mut freed: i64 = 0;
        for id in &dirs {
            let node = tree.dir_mut(*id);
            for file in node.files.drain(..) {
                freed += file.size;
                removed.push(file.tth);
            }
            node.children.clear();
            node.size = 0;
        }

        for tth in removed {
            if let Some(refs) = self.tth_index.get_mut(&tth) {
                refs.retain(|r| r.root != dref.root || !dirs.contains(&r.dir));
                if refs.is_empty() {
                    self.tth_index.remove(&tth);
                }
            }
        }
        self.total_size -= freed;

        let mut below = dirs;
        below.remove(&dref.dir);
        names.remove_nodes(dref.root, &below);
    }

    /// Add a rebuilt subtree's files to the hash index, totals and
    /// bloom.
    pub fn update_indices_subtree(&mut self, dref: DirRef) {
        let mut added: Vec<(Tth, FileRef)> = Vec::new();
        let mut size: i64 = 0;
        {
            let tree = self.tree(dref.root);
            tree.walk(dref.dir, &mut |id, node| {
                for (fi, file) in node.files.iter().enumerate() {
                    size += file.size;
                    added.push((
                        file.tth,
                        FileRef {
                            root: dref.root,
                            dir: id,
                            file: fi as u32,
                        },
                    ));
                }
            });
        }

        for (tth, fref) in &added {
            let name_lower = self.file(*fref).name.to_lowercase();
            self.bloom.add(&name_lower);
            self.tth_index.entry(*tth).or_default().push(*fref);
        }
        self.total_size += size;
    }

    /// Clear and re-derive the hash index, bloom, per-directory sizes
    /// and the share total from the trees.
    pub fn rebuild_indices(&mut self) {
        self.bloom.clear();
        self.tth_index.clear();
        self.total_size = 0;

        let ShareState {
            trees,
            profile_dirs,
            bloom,
            tth_index,
            total_size,
            ..
        } = self;

        for (root_id, tree) in trees.iter_mut() {
            for i in 0..tree.len() {
                let id = DirId(i as u32);
                let node = tree.dir_mut(id);
                node.size = node.files.iter().map(|f| f.size).sum();
                *total_size += node.size;

                let roots = node
                    .profile_key
                    .as_ref()
                    .and_then(|k| profile_dirs.get(k))
                    .filter(|pd| pd.has_roots());
                match roots {
                    Some(pd) => {
                        for name in pd.profiles.values() {
                            bloom.add(&name.to_lowercase());
                        }
                    }
                    None => bloom.add(&node.real_name.to_lowercase()),
                }

                for (fi, file) in node.files.iter().enumerate() {
                    bloom.add(&file.name.to_lowercase());
                    tth_index.entry(file.tth).or_default().push(FileRef {
                        root: *root_id,
                        dir: id,
                        file: fi as u32,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::PROFILE_DEFAULT;

    fn seed_state() -> ShareState {
        let mut state = ShareState::default();
        let id = state.alloc_root_id();

        let mut root = DirNode::new("music".into(), None, 10);
        root.profile_key = Some("/mnt/music/".to_string());
        let mut tree = RootTree::new(root);
        let albums = tree.add_dir(DirId::ROOT, DirNode::new("Albums".into(), None, 20));
        tree.add_file(
            albums,
            FileNode {
                name: "song.mp3".into(),
                size: 100,
                tth: Tth([1; 24]),
                last_write: 0,
            },
        );

        state.trees.insert(id, tree);
        state.roots.insert(
            "/mnt/music/".into(),
            DirRef {
                root: id,
                dir: DirId::ROOT,
            },
        );
        state.profile_dirs.insert(
            "/mnt/music/".into(),
            ProfileDir::new_root("/mnt/music/", "Music", PROFILE_DEFAULT),
        );
        state.rebuild_indices();
        state
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(normalize_dir_path("/a/b"), "/a/b/");
        assert_eq!(normalize_dir_path("/a/b/"), "/a/b/");
        assert!(is_parent_or_exact("/a/", "/A/b/"));
        assert!(is_strict_sub("/a/", "/a/b/"));
        assert!(!is_strict_sub("/a/", "/a/"));
        assert_eq!(last_dir("/mnt/music/"), "music");
    }

    #[test]
    fn test_adc_and_full_paths() {
        let state = seed_state();
        let albums = state.find_virtuals("/Music/Albums/", PROFILE_DEFAULT).unwrap()[0];
        assert_eq!(state.adc_path(albums, PROFILE_DEFAULT), "/Music/Albums/");
        assert_eq!(state.full_name(albums, PROFILE_DEFAULT), "Music\\Albums\\");
        assert_eq!(
            state.real_path_of_dir(albums).unwrap(),
            "/mnt/music/Albums/"
        );
    }

    #[test]
    fn test_find_virtuals_file_tail_is_ignored() {
        let state = seed_state();
        let hit = state
            .find_virtuals("/Music/Albums/song.mp3", PROFILE_DEFAULT)
            .unwrap();
        assert_eq!(state.adc_path(hit[0], PROFILE_DEFAULT), "/Music/Albums/");
    }

    #[test]
    fn test_find_virtuals_unknown_root() {
        let state = seed_state();
        assert!(matches!(
            state.find_virtuals("/Video/x/", PROFILE_DEFAULT),
            Err(ShareError::FileNotAvailable)
        ));
        assert!(state.find_virtuals("bad", PROFILE_DEFAULT).is_err());
    }

    #[test]
    fn test_visibility_requires_a_root() {
        let state = seed_state();
        let root = state.roots["/mnt/music/"];
        assert!(state.is_visible(root, PROFILE_DEFAULT));
        assert!(!state.is_visible(root, ProfileId(11)));
    }

    #[test]
    fn test_tth_index_after_rebuild() {
        let state = seed_state();
        let refs = &state.tth_index[&Tth([1; 24])];
        assert_eq!(refs.len(), 1);
        assert_eq!(state.file(refs[0]).name, "song.mp3");
        assert_eq!(state.total_size, 100);
        assert!(state.bloom.contains("song"));
    }

    #[test]
    fn test_clean_indices_removes_contribution() {
        let mut state = seed_state();
        let mut names = NameIndex::default();
        let root = state.roots["/mnt/music/"];
        state.clean_indices(root, &mut names);
        assert!(state.tth_index.is_empty());
        assert_eq!(state.total_size, 0);
    }

    #[test]
    fn test_bundle_dir_lookup() {
        let mut names = NameIndex::default();
        names.set_bundle_dirs(vec!["/dl/b/".into(), "/dl/a/".into()]);
        assert!(names.is_forbidden("/dl/a/"));
        assert!(!names.is_forbidden("/dl/c/"));
        names.add_bundle_dir("/dl/c/".into());
        assert!(names.is_forbidden("/dl/c/"));
    }
}
