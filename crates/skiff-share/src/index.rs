//! The share index facade.
//!
//! One `ShareIndex` owns the published state, the name index, the
//! temp-share table and the refresh worker. Queries run on caller
//! threads under the reader locks; the scanner is the only writer.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

use skiff_config::Settings;
use skiff_types::{Cid, DirShareState, HashProvider, QueueBridge, ShareLookup, TaskQueue, Tth, WorkerGate};

use crate::bloom::rebuild_bloom;
use crate::profiles::{
    validate_virtual, ProfileDir, ProfileId, ShareProfile, PROFILE_DEFAULT, PROFILE_HIDDEN,
};
use crate::scanner::{DirectoryLister, FsLister, RefreshKind, RefreshResult, RefreshTask, SkipList};
use crate::state::{
    is_parent_or_exact, last_dir, normalize_dir_path, NameIndex, ShareState,
};
use crate::tree::{DirRef, FileNode, FileRef};
use crate::{Result, ShareError};

// CD1 / Sample / Proof / Covers / Subs style nested release folders:
// matching by the leaf name alone is ambiguous, so lookups walk up.
static SUB_DIR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^((DVD|CD|DIS[KC]).?[0-9][0-9]?|Sample|Proof|Cover(s)?|.{0,5}Sub(s|pack)?)$")
        .expect("static sub-dir pattern")
});

/// Is this a stacked sub-directory name (CD1, Sample, ...)?
pub fn is_sub_dir_name(name: &str) -> bool {
    SUB_DIR.is_match(name)
}

/// A root registration request.
#[derive(Debug, Clone)]
pub struct ShareDirSpec {
    pub path: String,
    pub virtual_name: String,
    pub profile: ProfileId,
    pub incoming: bool,
}

/// The local share service.
pub struct ShareIndex {
    pub(crate) state: RwLock<ShareState>,
    pub(crate) names: RwLock<NameIndex>,
    pub(crate) temp: Mutex<crate::temp::TempShares>,

    pub(crate) tasks: TaskQueue<RefreshTask>,
    pub(crate) refresh_gate: WorkerGate,
    pub(crate) refresh_running: AtomicBool,
    pub(crate) shutdown: AtomicBool,

    pub(crate) searches: AtomicU64,
    pub(crate) stopped_searches: AtomicU64,

    pub(crate) settings: Settings,
    pub(crate) skiplist: RwLock<SkipList>,
    pub(crate) cid: Cid,

    pub(crate) hasher: Arc<dyn HashProvider>,
    pub(crate) queue: Arc<dyn QueueBridge>,
    pub(crate) lister: Arc<dyn DirectoryLister>,
}

impl ShareIndex {
    pub fn new(
        settings: Settings,
        cid: Cid,
        hasher: Arc<dyn HashProvider>,
        queue: Arc<dyn QueueBridge>,
    ) -> Arc<Self> {
        Self::with_lister(settings, cid, hasher, queue, Arc::new(FsLister))
    }

    pub fn with_lister(
        settings: Settings,
        cid: Cid,
        hasher: Arc<dyn HashProvider>,
        queue: Arc<dyn QueueBridge>,
        lister: Arc<dyn DirectoryLister>,
    ) -> Arc<Self> {
        let skiplist = SkipList::compile(&settings.skiplist, settings.skiplist_regex);
        Arc::new(Self {
            state: RwLock::new(ShareState::default()),
            names: RwLock::new(NameIndex::default()),
            temp: Mutex::new(crate::temp::TempShares::default()),
            tasks: TaskQueue::new(),
            refresh_gate: WorkerGate::new(),
            refresh_running: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            searches: AtomicU64::new(0),
            stopped_searches: AtomicU64::new(0),
            settings,
            skiplist: RwLock::new(skiplist),
            cid,
            hasher,
            queue,
            lister,
        })
    }

    /// Seed the built-in profiles and bring the share up: from the
    /// cache when possible, otherwise with a blocking full scan.
    pub fn startup(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.write().unwrap();
            if state.profile(PROFILE_DEFAULT).is_none() {
                state
                    .profiles
                    .push(ShareProfile::new(PROFILE_DEFAULT, "Default"));
            }
            if state.profile(PROFILE_HIDDEN).is_none() {
                state
                    .profiles
                    .push(ShareProfile::new(PROFILE_HIDDEN, "Hidden"));
            }
        }

        let loaded = match self.load_cache() {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(error = %e, "Share cache unusable, falling back to a scan");
                false
            }
        };
        if !loaded {
            self.refresh_startup();
        }

        self.rebuild_total_excludes();
        Ok(())
    }

    /// Cooperative shutdown: abort any running scan and persist the
    /// cache.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.save_cache() {
            warn!(error = %e, "Failed to save the share cache");
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.refresh_gate.is_running()
    }

    /// Replace the share skip-list.
    pub fn set_skip_list(&self, pattern: &str, regex_mode: bool) {
        *self.skiplist.write().unwrap() = SkipList::compile(pattern, regex_mode);
    }

    // ------------------------------------------------------------------
    // Hash queries
    // ------------------------------------------------------------------

    pub fn is_tth_shared(&self, tth: &Tth) -> bool {
        self.state.read().unwrap().tth_index.contains_key(tth)
    }

    /// Host path of some file with this hash, if still present on
    /// disk.
    pub fn real_path_by_tth(&self, tth: &Tth) -> Option<String> {
        let state = self.state.read().unwrap();
        let refs = state.tth_index.get(tth)?;
        refs.iter()
            .find_map(|fref| self.checked_real_path(&state, *fref))
    }

    /// Catalog path of some file with this hash.
    pub fn to_virtual(&self, tth: &Tth, profile: ProfileId) -> Result<String> {
        let state = self.state.read().unwrap();
        let fref = state
            .tth_index
            .get(tth)
            .and_then(|refs| refs.first())
            .ok_or(ShareError::FileNotAvailable)?;
        let file = state.file(*fref);
        Ok(format!(
            "{}{}",
            state.adc_path(fref.dir_ref(), profile),
            file.name
        ))
    }

    /// Resolve an upload request. Reserved names map to the catalog
    /// itself; `TTH/<base32>` addresses content, consulting the
    /// temp-share table after the tree.
    pub fn to_real_with_size(
        &self,
        virtual_file: &str,
        profiles: &BTreeSet<ProfileId>,
        user: Option<&Cid>,
    ) -> Result<(String, i64)> {
        match virtual_file {
            "MyList.DcLst" => return Err(ShareError::LegacyList),
            "files.xml.bz2" | "files.xml" => {
                let profile = profiles
                    .iter()
                    .next()
                    .copied()
                    .ok_or(ShareError::FileNotAvailable)?;
                let path = if virtual_file.ends_with(".bz2") {
                    self.generate_file_list(profile, false)?
                } else {
                    let xml = self.build_full_list(profile)?;
                    let path = self.settings.config_dir.join("files.xml");
                    std::fs::write(&path, &xml)?;
                    path
                };
                let size = std::fs::metadata(&path).map(|m| m.len() as i64).unwrap_or(0);
                return Ok((path.display().to_string(), size));
            }
            _ => {}
        }

        let encoded = virtual_file
            .strip_prefix("TTH/")
            .ok_or(ShareError::FileNotAvailable)?;
        let tth = Tth::from_base32(encoded).map_err(|_| ShareError::FileNotAvailable)?;

        // Temp files alone serve a hidden share.
        if profiles.iter().any(|p| *p != PROFILE_HIDDEN) {
            let state = self.state.read().unwrap();
            if let Some(refs) = state.tth_index.get(&tth) {
                for fref in refs {
                    if state.is_visible_any(fref.dir_ref(), profiles) {
                        if let Some(path) = self.checked_real_path(&state, *fref) {
                            return Ok((path, state.file(*fref).size));
                        }
                    }
                }
            }
        }

        let temp = self.temp.lock().unwrap();
        if let Some(entry) = temp.find(&tth, user) {
            return Ok((entry.path.clone(), entry.size));
        }
        Err(ShareError::FileNotAvailable)
    }

    /// Upload negotiation info: catalog path, size and hash.
    pub fn file_info(&self, virtual_file: &str, profile: ProfileId) -> Result<(String, i64, Tth)> {
        let encoded = virtual_file
            .strip_prefix("TTH/")
            .ok_or(ShareError::FileNotAvailable)?;
        let tth = Tth::from_base32(encoded).map_err(|_| ShareError::FileNotAvailable)?;

        let state = self.state.read().unwrap();
        let fref = state
            .tth_index
            .get(&tth)
            .and_then(|refs| refs.first())
            .ok_or(ShareError::FileNotAvailable)?;
        let file = state.file(*fref);
        Ok((
            format!("{}{}", state.adc_path(fref.dir_ref(), profile), file.name),
            file.size,
            file.tth,
        ))
    }

    /// Merkle leaf data for a served file or an addressed hash.
    pub fn tree_leaves(&self, virtual_file: &str) -> Result<Vec<u8>> {
        let encoded = virtual_file
            .strip_prefix("TTH/")
            .ok_or(ShareError::FileNotAvailable)?;
        let tth = Tth::from_base32(encoded).map_err(|_| ShareError::FileNotAvailable)?;
        self.hasher
            .leaves(&tth)
            .ok_or(ShareError::FileNotAvailable)
    }

    /// A file's real path, with the stale-root fallback: when the
    /// recorded path is gone, sibling roots sharing a virtual name
    /// are probed.
    pub(crate) fn checked_real_path(&self, state: &ShareState, fref: FileRef) -> Option<String> {
        let path = state.real_path_of_file(fref)?;
        if self.lister.exists(&path) {
            return Some(path);
        }

        // Root this file was published under.
        let tree = state.trees.get(&fref.root)?;
        let mut cur = fref.dir;
        let root_key = loop {
            let node = tree.dir(cur);
            if let Some(key) = &node.profile_key {
                if state.profile_dirs.get(key).is_some_and(|pd| pd.has_roots()) {
                    break key.clone();
                }
            }
            cur = node.parent?;
        };
        let own = state.profile_dirs.get(&root_key)?;
        let rel = path.strip_prefix(own.path.as_str())?.to_string();

        for (other_path, other) in &state.profile_dirs {
            if *other_path == root_key || !other.has_roots() {
                continue;
            }
            let shared_name = own.profiles.values().any(|mine| {
                other
                    .profiles
                    .values()
                    .any(|theirs| theirs.eq_ignore_ascii_case(mine))
            });
            if !shared_name {
                continue;
            }
            let candidate = format!("{other_path}{rel}");
            if self.lister.exists(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Virtual path queries
    // ------------------------------------------------------------------

    /// Host paths behind a virtual path. A trailing separator names a
    /// directory, otherwise the last segment is a file.
    pub fn real_paths(&self, virtual_path: &str, profile: ProfileId) -> Result<Vec<String>> {
        if virtual_path.is_empty() {
            return Err(ShareError::Forbidden("empty virtual path".into()));
        }

        let state = self.state.read().unwrap();
        let dirs = state.find_virtuals(virtual_path, profile)?;

        if virtual_path.ends_with('/') {
            let mut out = Vec::new();
            for dref in dirs {
                if let Some(path) = state.real_path_of_dir(dref) {
                    out.push(path);
                }
            }
            return Ok(out);
        }

        let file_name = virtual_path.rsplit('/').next().unwrap_or("");
        for dref in dirs {
            if let Some(fi) = state.tree(dref.root).find_file(dref.dir, file_name) {
                let fref = FileRef {
                    root: dref.root,
                    dir: dref.dir,
                    file: fi,
                };
                if let Some(path) = self.checked_real_path(&state, fref) {
                    return Ok(vec![path]);
                }
            }
        }
        Ok(Vec::new())
    }

    pub fn total_share_size(&self, profile: ProfileId) -> i64 {
        let state = self.state.read().unwrap();
        crate::search::descent_roots(&state, profile)
            .into_iter()
            .map(|dref| state.profile_size(dref, profile))
            .sum()
    }

    /// Size and file count for a profile.
    pub fn profile_share_info(&self, profile: ProfileId) -> (i64, usize) {
        let state = self.state.read().unwrap();
        let mut size = 0;
        let mut files = 0;
        for dref in crate::search::descent_roots(&state, profile) {
            state.profile_info(dref, profile, &mut size, &mut files);
        }
        (size, files)
    }

    /// Virtual name to its real paths, over every profile.
    pub fn grouped_directories(&self) -> Vec<(String, Vec<String>)> {
        let state = self.state.read().unwrap();
        let mut groups: std::collections::BTreeMap<String, Vec<String>> = Default::default();
        for path in state.roots.keys() {
            let Some(pd) = state.profile_dirs.get(path) else {
                continue;
            };
            for vname in pd.profiles.values() {
                let entry = groups.entry(vname.clone()).or_default();
                if !entry.contains(path) {
                    entry.push(path.clone());
                }
            }
        }
        groups
            .into_iter()
            .map(|(name, mut paths)| {
                paths.sort();
                (name, paths)
            })
            .collect()
    }

    /// Export the content-hash bloom for the ADC `SBIG` handshake.
    pub fn get_bloom(&self, k: usize, m: u64, h: usize) -> Vec<u8> {
        let state = self.state.read().unwrap();
        rebuild_bloom(state.tth_index.keys(), k, m, h)
    }

    // ------------------------------------------------------------------
    // Directory-name lookup
    // ------------------------------------------------------------------

    /// Find a shared directory resembling a remote path. The leaf
    /// name is bucketed in the name index; when it is a stacked
    /// sub-directory (CD1, Sample, ...), the candidate's ancestry is
    /// walked in lock-step with the query path.
    pub fn dir_by_name(&self, dir: &str) -> Option<DirRef> {
        if dir.len() < 3 {
            return None;
        }
        let trimmed = dir.trim_end_matches(['\\', '/']);
        let segments: Vec<&str> = trimmed.split(['\\', '/']).filter(|s| !s.is_empty()).collect();
        let last = *segments.last()?;

        // Lock order: structural before name index, as the writers do.
        let state = self.state.read().unwrap();
        let names = self.names.read().unwrap();
        let candidates = names.dirs.get(&last.to_lowercase())?;

        if !is_sub_dir_name(last) || segments.len() < 2 {
            return candidates.first().copied();
        }

        'candidates: for candidate in candidates {
            let mut cur = state.dir(*candidate).parent.map(|p| DirRef {
                root: candidate.root,
                dir: p,
            });
            // Match upward from the segment above the leaf.
            for segment in segments[..segments.len() - 1].iter().rev() {
                let Some(cref) = cur else {
                    continue 'candidates;
                };
                if !state.dir(cref).real_name.eq_ignore_ascii_case(segment) {
                    continue 'candidates;
                }
                if !is_sub_dir_name(segment) {
                    return Some(*candidate);
                }
                cur = state.dir(cref).parent.map(|p| DirRef {
                    root: cref.root,
                    dir: p,
                });
            }
        }
        None
    }

    pub fn is_dir_shared(&self, dir: &str) -> bool {
        self.dir_by_name(dir).is_some()
    }

    /// Real path of a shared directory matched by name.
    pub fn dir_real_path(&self, dir: &str) -> Option<String> {
        let dref = self.dir_by_name(dir)?;
        let state = self.state.read().unwrap();
        state.real_path_of_dir(dref)
    }

    // ------------------------------------------------------------------
    // Temp shares
    // ------------------------------------------------------------------

    /// Share a single file ad hoc, keyed to a user unless the hub is
    /// public. Content already in the share is served from there.
    pub fn add_temp_share(
        &self,
        key: &str,
        tth: Tth,
        path: &str,
        size: i64,
        adc_hub: bool,
    ) -> bool {
        let name = path.rsplit(['/', '\\']).next().unwrap_or("");
        if self.is_file_shared(&tth, name) {
            return true;
        }
        self.temp.lock().unwrap().add(key, tth, path, size, adc_hub)
    }

    pub fn remove_temp_share(&self, key: &str, tth: &Tth) {
        self.temp.lock().unwrap().remove(key, tth);
    }

    pub fn find_temp_share(&self, key: &Cid, virtual_file: &str) -> Result<(String, i64)> {
        let encoded = virtual_file
            .strip_prefix("TTH/")
            .ok_or(ShareError::FileNotAvailable)?;
        let tth = Tth::from_base32(encoded).map_err(|_| ShareError::FileNotAvailable)?;
        let temp = self.temp.lock().unwrap();
        temp.find(&tth, Some(key))
            .map(|e| (e.path.clone(), e.size))
            .ok_or(ShareError::FileNotAvailable)
    }

    // ------------------------------------------------------------------
    // Profiles and roots
    // ------------------------------------------------------------------

    /// Reject reserved paths before they can be configured as roots.
    pub fn validate_new_root(&self, real_path: &str, virtual_name: &str) -> Result<()> {
        if real_path.is_empty() || virtual_name.is_empty() {
            return Err(ShareError::Forbidden("no directory specified".into()));
        }
        if !self.check_root_visible(&normalize_dir_path(real_path)) {
            return Err(ShareError::Forbidden("directory is hidden".into()));
        }
        let temp = self.settings.temp_download_dir.to_string_lossy();
        if !temp.is_empty()
            && normalize_dir_path(&temp).eq_ignore_ascii_case(&normalize_dir_path(real_path))
        {
            return Err(ShareError::Forbidden(
                "the unfinished-downloads directory cannot be shared".into(),
            ));
        }
        Ok(())
    }

    pub fn add_profile(&self, id: ProfileId, name: &str) {
        let mut state = self.state.write().unwrap();
        if state.profile(id).is_none() {
            state.profiles.push(ShareProfile::new(id, name));
        }
    }

    pub fn remove_profile(&self, id: ProfileId) {
        let mut state = self.state.write().unwrap();
        state.profiles.retain(|p| p.id != id);
        for pd in state.profile_dirs.values_mut() {
            pd.remove_root_profile(id);
            pd.excluded.remove(&id);
        }
    }

    pub fn profiles(&self) -> Vec<(ProfileId, String)> {
        let state = self.state.read().unwrap();
        state
            .profiles
            .iter()
            .map(|p| (p.id, p.name.clone()))
            .collect()
    }

    /// Register new roots. Existing roots and subdirectories of
    /// shared trees are wired up in place; genuinely new parents are
    /// queued for a scan.
    pub fn add_directories(self: &Arc<Self>, specs: &[ShareDirSpec]) -> Result<RefreshResult> {
        let mut to_scan = Vec::new();
        {
            let mut state = self.state.write().unwrap();
            let mut names = self.names.write().unwrap();

            for spec in specs {
                self.validate_new_root(&spec.path, &spec.virtual_name)?;
                let path = normalize_dir_path(&spec.path);
                let vname = validate_virtual(&spec.virtual_name);

                if state.roots.contains_key(&path) {
                    // Another profile joins an existing root.
                    let pd = state
                        .profile_dirs
                        .entry(path.clone())
                        .or_insert_with(|| ProfileDir {
                            path: path.clone(),
                            ..ProfileDir::default()
                        });
                    pd.add_root_profile(&vname, spec.profile);
                    if spec.incoming {
                        pd.set_flag(ProfileDir::INCOMING);
                    }
                    continue;
                }

                let inside_share = state
                    .roots
                    .keys()
                    .any(|root| is_parent_or_exact(root, &path));
                if inside_share {
                    let now = self
                        .lister
                        .dir_info(&path)
                        .map(|i| i.last_write)
                        .unwrap_or(0);
                    let validator =
                        |p: &str| self.check_shared_dir(p, last_dir(p), false);
                    let mut created = Vec::new();
                    if let Some(dref) =
                        state.find_directory(&path, Some((&validator, now)), &mut created)
                    {
                        names.extend(created);
                        if let Some(tree) = state.trees.get_mut(&dref.root) {
                            tree.dir_mut(dref.dir).profile_key = Some(path.clone());
                        }
                        let pd = state
                            .profile_dirs
                            .entry(path.clone())
                            .or_insert_with(|| ProfileDir {
                                path: path.clone(),
                                ..ProfileDir::default()
                            });
                        pd.add_root_profile(&vname, spec.profile);
                        if spec.incoming {
                            pd.set_flag(ProfileDir::INCOMING);
                        }
                        state.roots.insert(path.clone(), dref);
                    }
                    continue;
                }

                // A new parent root: placeholder until scanned.
                let mut pd = ProfileDir::new_root(&path, &vname, spec.profile);
                if spec.incoming {
                    pd.set_flag(ProfileDir::INCOMING);
                }
                state.profile_dirs.insert(path.clone(), pd);

                let mut node =
                    crate::tree::DirNode::new(last_dir(&path).to_string(), None, 0);
                node.profile_key = Some(path.clone());
                let root_id = state.alloc_root_id();
                state
                    .trees
                    .insert(root_id, crate::tree::RootTree::new(node));
                state.roots.insert(
                    path.clone(),
                    DirRef {
                        root: root_id,
                        dir: crate::tree::DirId::ROOT,
                    },
                );
                to_scan.push(path);
            }

            state.set_dirty(false);
        }

        if to_scan.is_empty() {
            return Ok(RefreshResult::Started);
        }
        Ok(self.queue_refresh_task(RefreshKind::AddDir, to_scan, false))
    }

    /// Unregister roots from profiles; a root with no profiles left
    /// is dropped from the tree.
    pub fn remove_directories(&self, removals: &[(String, ProfileId)]) {
        let mut state = self.state.write().unwrap();
        let mut names = self.names.write().unwrap();

        for (path, profile) in removals {
            let path = normalize_dir_path(path);
            let Some(dref) = state.roots.get(&path).copied() else {
                continue;
            };
            let Some(pd) = state.profile_dirs.get_mut(&path) else {
                continue;
            };
            if !pd.remove_root_profile(*profile) {
                continue; // other profiles still use it
            }

            let keep_marker = pd.has_excludes();
            if !keep_marker {
                state.profile_dirs.remove(&path);
            }

            if dref.dir == crate::tree::DirId::ROOT {
                // Top-level: drop the whole tree.
                state.trees.remove(&dref.root);
                names.remove_root(dref.root);
                state.roots.retain(|p, r| {
                    r.root != dref.root && !is_parent_or_exact(&path, p)
                });
            } else {
                // Nested root: the subtree stays a plain directory of
                // its parent.
                state.roots.remove(&path);
                if !keep_marker {
                    if let Some(tree) = state.trees.get_mut(&dref.root) {
                        tree.dir_mut(dref.dir).profile_key = None;
                    }
                }
            }
        }

        state.rebuild_indices();
        state.set_dirty(true);
    }

    /// Rename a root's virtual name or toggle its incoming flag.
    pub fn change_directories(&self, changes: &[ShareDirSpec]) {
        let mut state = self.state.write().unwrap();
        for spec in changes {
            let path = normalize_dir_path(&spec.path);
            let vname = validate_virtual(&spec.virtual_name);
            if let Some(pd) = state.profile_dirs.get_mut(&path) {
                pd.add_root_profile(&vname, spec.profile);
                if spec.incoming {
                    pd.set_flag(ProfileDir::INCOMING);
                } else {
                    pd.unset_flag(ProfileDir::INCOMING);
                }
            }
        }
        state.set_dirty(false);
    }

    /// Paths excluded for a profile.
    pub fn excludes(&self, profile: ProfileId) -> Vec<String> {
        let state = self.state.read().unwrap();
        state
            .profile_dirs
            .iter()
            .filter(|(_, pd)| pd.is_excluded(profile))
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Apply exclusion changes, then refold total excludes.
    pub fn change_excluded_dirs(&self, add: &[(ProfileId, String)], remove: &[String]) {
        {
            let mut state = self.state.write().unwrap();

            for (profile, path) in add {
                let path = normalize_dir_path(path);
                let mut created = Vec::new();
                let dref = state.find_directory(&path, None, &mut created);
                let pd = state
                    .profile_dirs
                    .entry(path.clone())
                    .or_insert_with(|| ProfileDir {
                        path: path.clone(),
                        ..ProfileDir::default()
                    });
                pd.add_exclude(*profile);
                if let Some(dref) = dref {
                    if let Some(tree) = state.trees.get_mut(&dref.root) {
                        tree.dir_mut(dref.dir).profile_key = Some(path.clone());
                    }
                }
            }

            for path in remove {
                let path = normalize_dir_path(path);
                let drop_marker = state
                    .profile_dirs
                    .get_mut(&path)
                    .map(|pd| {
                        pd.excluded.clear();
                        pd.unset_flag(ProfileDir::EXCLUDE_PROFILE);
                        pd.unset_flag(ProfileDir::EXCLUDE_TOTAL);
                        !pd.has_roots()
                    })
                    .unwrap_or(false);
                if drop_marker {
                    state.profile_dirs.remove(&path);
                    let mut created = Vec::new();
                    if let Some(dref) = state.find_directory(&path, None, &mut created) {
                        if let Some(tree) = state.trees.get_mut(&dref.root) {
                            let node = tree.dir_mut(dref.dir);
                            if node.profile_key.as_deref() == Some(path.as_str()) {
                                node.profile_key = None;
                            }
                        }
                    }
                }
            }

            state.set_dirty(false);
        }
        self.rebuild_total_excludes();
    }

    /// Fold exclusion markers: a marker excluded from every profile
    /// that could reach it is a total exclude, and its subtree is
    /// skipped by the scanner outright.
    pub fn rebuild_total_excludes(&self) {
        let mut state = self.state.write().unwrap();

        let markers: Vec<String> = state
            .profile_dirs
            .iter()
            .filter(|(_, pd)| pd.is_set(ProfileDir::EXCLUDE_PROFILE))
            .map(|(path, _)| path.clone())
            .collect();

        for marker in markers {
            // Profiles that reach this path through an ancestor root.
            let mut reachable: BTreeSet<ProfileId> = BTreeSet::new();
            for (root_path, pd) in &state.profile_dirs {
                if pd.has_roots() && is_parent_or_exact(root_path, &marker) {
                    reachable.extend(pd.profiles.keys().copied());
                }
            }

            // Minus profiles excluded at or above the marker.
            for (path, pd) in &state.profile_dirs {
                if pd.is_set(ProfileDir::EXCLUDE_PROFILE) && is_parent_or_exact(path, &marker) {
                    for excluded in &pd.excluded {
                        reachable.remove(excluded);
                    }
                }
            }

            if let Some(pd) = state.profile_dirs.get_mut(&marker) {
                if reachable.is_empty() {
                    pd.set_flag(ProfileDir::EXCLUDE_TOTAL);
                } else {
                    pd.unset_flag(ProfileDir::EXCLUDE_TOTAL);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Queue and hash callbacks
    // ------------------------------------------------------------------

    /// May a finished bundle at `path` enter the share?
    pub fn allow_add_dir(&self, path: &str) -> bool {
        let state = self.state.read().unwrap();
        let path = normalize_dir_path(path);
        let Some(root) = state
            .roots
            .keys()
            .find(|root| is_parent_or_exact(root, &path))
        else {
            return false;
        };

        let mut full = root.clone();
        for segment in path[root.len()..].split('/').filter(|s| !s.is_empty()) {
            full.push_str(segment);
            full.push('/');
            if !self.check_shared_dir(&full, segment, true) {
                return false;
            }
            if state
                .profile_dirs
                .get(&full)
                .is_some_and(|pd| pd.is_set(ProfileDir::EXCLUDE_TOTAL))
            {
                return false;
            }
        }
        true
    }

    /// A bundle began downloading; its target must not be scanned.
    pub fn on_bundle_added(&self, target: &str) {
        self.names
            .write()
            .unwrap()
            .add_bundle_dir(normalize_dir_path(target).to_lowercase());
    }

    /// A bundle finished hashing: re-scan its directory into the
    /// share and refresh the indices incrementally.
    pub fn on_bundle_hashed(&self, path: &str) {
        let path = normalize_dir_path(path);
        let mut state = self.state.write().unwrap();
        let mut names = self.names.write().unwrap();

        let now = self
            .lister
            .dir_info(&path)
            .map(|i| i.last_write)
            .unwrap_or(0);
        let validator = |p: &str| self.check_shared_dir(p, last_dir(p), true);
        let mut created = Vec::new();
        let Some(dref) = state.find_directory(&path, Some((&validator, now)), &mut created)
        else {
            warn!(path = %path, "Finished bundle is outside the share");
            return;
        };
        names.extend(created);

        state.clean_indices(dref, &mut names);

        let sub_roots: std::collections::BTreeMap<String, ProfileDir> = state
            .profile_dirs
            .iter()
            .filter(|(p, _)| crate::state::is_strict_sub(&path, p))
            .map(|(p, pd)| (p.clone(), pd.clone()))
            .collect();

        let mut new_names = Vec::new();
        let mut nested = Vec::new();
        {
            let Some(tree) = state.trees.get_mut(&dref.root) else {
                return;
            };
            if self
                .scan_into(&path, tree, dref.dir, &sub_roots, &[], &mut new_names, &mut nested)
                .is_err()
            {
                return;
            }
        }

        for (nested_path, dir) in nested {
            state.roots.insert(
                nested_path,
                DirRef {
                    root: dref.root,
                    dir,
                },
            );
        }
        names.extend(
            new_names
                .into_iter()
                .map(|(name, dir)| (name, DirRef { root: dref.root, dir })),
        );

        state.update_indices_subtree(dref);
        state.set_dirty(true);
        info!(path = %path, "Finished bundle shared");
    }

    /// A file finished hashing: update it in place, or add it when
    /// the scanner skipped it for a missing hash.
    pub fn on_file_hashed(&self, path: &str, tth: Tth) {
        let (parent_path, file_name) = match path.rfind('/') {
            Some(pos) => (&path[..pos + 1], &path[pos + 1..]),
            None => return,
        };

        let mut state = self.state.write().unwrap();
        let mut names = self.names.write().unwrap();

        let validator = |p: &str| self.check_shared_dir(p, last_dir(p), false);
        let mut created = Vec::new();
        let Some(dref) = state.find_directory(parent_path, Some((&validator, 0)), &mut created)
        else {
            return;
        };
        names.extend(created);

        if let Some(fi) = state.tree(dref.root).find_file(dref.dir, file_name) {
            let fref = FileRef {
                root: dref.root,
                dir: dref.dir,
                file: fi,
            };
            let old = state.file(fref).tth;
            if let Some(refs) = state.tth_index.get_mut(&old) {
                refs.retain(|r| *r != fref);
                if refs.is_empty() {
                    state.tth_index.remove(&old);
                }
            }
            if let Some(tree) = state.trees.get_mut(&dref.root) {
                tree.dir_mut(dref.dir).files[fi as usize].tth = tth;
            }
            state.tth_index.entry(tth).or_default().push(fref);
        } else {
            let Ok(meta) = std::fs::metadata(path) else {
                return;
            };
            let size = meta.len() as i64;
            if !self.check_shared_file(path, file_name, size, false) {
                return;
            }

            let Some(tree) = state.trees.get_mut(&dref.root) else {
                return;
            };
            let pos = tree.add_file(
                dref.dir,
                FileNode {
                    name: file_name.to_string(),
                    size,
                    tth,
                    last_write: 0,
                },
            );

            // The sorted insert shifted every following file; keep
            // the hash index handles valid.
            for refs in state.tth_index.values_mut() {
                for r in refs.iter_mut() {
                    if r.root == dref.root && r.dir == dref.dir && r.file >= pos {
                        r.file += 1;
                    }
                }
            }

            let fref = FileRef {
                root: dref.root,
                dir: dref.dir,
                file: pos,
            };
            state.tth_index.entry(tth).or_default().push(fref);
            state.bloom.add(&file_name.to_lowercase());
            state.total_size += size;
        }

        state.set_dirty(false);
    }
}

impl ShareLookup for ShareIndex {
    fn is_file_shared(&self, tth: &Tth, name: &str) -> bool {
        let state = self.state.read().unwrap();
        state
            .tth_index
            .get(tth)
            .is_some_and(|refs| {
                refs.iter()
                    .any(|r| state.file(*r).name.eq_ignore_ascii_case(name))
            })
    }

    fn dir_share_state(&self, path: &str, size: i64) -> DirShareState {
        let Some(dref) = self.dir_by_name(path) else {
            return DirShareState::None;
        };
        let state = self.state.read().unwrap();
        if state.tree(dref.root).total_size_all(dref.dir) == size {
            DirShareState::Full
        } else {
            DirShareState::Partial
        }
    }
}
