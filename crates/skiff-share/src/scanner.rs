//! Directory scanning and the refresh worker.
//!
//! Refreshes are queued as tasks and drained by a single worker
//! thread; a test-and-set gate serializes concurrent callers. Each
//! targeted root is rebuilt off the structural lock and published
//! with a map-entry swap, after which the hash index and bloom are
//! re-derived.

use std::io;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::index::ShareIndex;
use crate::profiles::ProfileDir;
use crate::state::{is_parent_or_exact, is_strict_sub, last_dir, normalize_dir_path};
use crate::tree::{DirId, DirNode, DirRef, FileNode, RootId, RootTree};

/// One entry as the on-disk iterator reports it.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: String,
    pub is_dir: bool,
    pub hidden: bool,
    pub size: i64,
    /// Seconds since the epoch.
    pub last_write: u32,
}

/// The on-disk directory iterator. A trait so tests can scan
/// synthetic trees without touching the filesystem.
pub trait DirectoryLister: Send + Sync {
    fn list(&self, path: &str) -> io::Result<Vec<DirEntryInfo>>;

    /// Info about the directory itself (hidden flag, last write).
    fn dir_info(&self, path: &str) -> Option<DirEntryInfo>;

    fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }
}

/// Real-filesystem lister.
pub struct FsLister;

fn mtime_secs(meta: &std::fs::Metadata) -> u32 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

impl DirectoryLister for FsLister {
    fn list(&self, path: &str) -> io::Result<Vec<DirEntryInfo>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.is_empty() || name == "." || name == ".." {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            out.push(DirEntryInfo {
                hidden: name.starts_with('.'),
                is_dir: meta.is_dir(),
                size: if meta.is_dir() { 0 } else { meta.len() as i64 },
                last_write: mtime_secs(&meta),
                name,
            });
        }
        Ok(out)
    }

    fn dir_info(&self, path: &str) -> Option<DirEntryInfo> {
        let trimmed = path.trim_end_matches('/');
        let meta = std::fs::metadata(trimmed).ok()?;
        let name = last_dir(path).to_string();
        Some(DirEntryInfo {
            hidden: name.starts_with('.'),
            is_dir: meta.is_dir(),
            size: 0,
            last_write: mtime_secs(&meta),
            name,
        })
    }
}

/// The share skip-list: `;`-separated wildcards, or one regex.
pub struct SkipList {
    patterns: Vec<Regex>,
}

impl SkipList {
    pub fn compile(pattern: &str, regex_mode: bool) -> SkipList {
        let mut patterns = Vec::new();
        if regex_mode {
            match Regex::new(&format!("(?i)^(?:{pattern})$")) {
                Ok(re) if !pattern.is_empty() => patterns.push(re),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Invalid skip-list regex"),
            }
        } else {
            for part in pattern.split(';').filter(|p| !p.is_empty()) {
                let translated = skiff_types::wildcard_to_regex(part);
                match Regex::new(&translated) {
                    Ok(re) => patterns.push(re),
                    Err(e) => warn!(pattern = part, error = %e, "Invalid skip-list wildcard"),
                }
            }
        }
        SkipList { patterns }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(name))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// What a refresh task targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshKind {
    All,
    Incoming,
    Dirs,
    AddDir,
    Startup,
}

/// Outcome of a refresh request, stable protocol integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RefreshResult {
    Started = 0,
    PathNotFound = 1,
    InProgress = 2,
}

#[derive(Debug, Clone)]
pub(crate) struct RefreshTask {
    pub kind: RefreshKind,
    pub paths: Vec<String>,
}

/// Cooperative-abort marker for the disk walk.
pub(crate) struct Aborted;

/// A subtree built off the lock, ready to publish.
struct BuiltRoot {
    path: String,
    tree: RootTree,
    /// Lowercased leaf names for the name index.
    names: Vec<(String, DirId)>,
    /// Nested share roots discovered inside this subtree.
    nested: Vec<(String, DirId)>,
}

// Always-rejected file names and extensions, plus the extended set
// applied under the remove-forbidden setting.
const FORBIDDEN_NAMES: [&str; 2] = ["dcplusplus.xml", "favorites.xml"];
const FORBIDDEN_EXTS: [&str; 2] = [".dctmp", ".antifrag"];
const REMOVE_FORBIDDEN_EXTS: [&str; 11] = [
    ".tdc", ".getright", ".temp", ".tmp", ".jc!", ".dmf", ".!ut", ".bc!", ".missing", ".bak",
    ".bad",
];
const REMOVE_FORBIDDEN_PREFIXES: [&str; 2] = ["__padding_", "__incomplete__"];

fn file_ext(name_lower: &str) -> &str {
    match name_lower.rfind('.') {
        Some(pos) => &name_lower[pos..],
        None => "",
    }
}

impl ShareIndex {
    /// Refresh every share root.
    pub fn refresh_all(self: &Arc<Self>) -> RefreshResult {
        self.refresh_roots(RefreshKind::All, false)
    }

    /// Refresh roots flagged as incoming.
    pub fn refresh_incoming(self: &Arc<Self>) -> RefreshResult {
        self.refresh_roots(RefreshKind::Incoming, false)
    }

    /// Full refresh that blocks the caller; used on startup when the
    /// cache is missing.
    pub fn refresh_startup(self: &Arc<Self>) -> RefreshResult {
        self.refresh_roots(RefreshKind::Startup, true)
    }

    fn refresh_roots(self: &Arc<Self>, kind: RefreshKind, blocking: bool) -> RefreshResult {
        let dirs: Vec<String> = {
            let state = self.state.read().unwrap();
            state
                .parents()
                .into_iter()
                .filter(|(path, _)| {
                    kind != RefreshKind::Incoming
                        || state
                            .profile_dirs
                            .get(path)
                            .is_some_and(|pd| pd.is_set(ProfileDir::INCOMING))
                })
                .map(|(path, _)| path)
                .collect()
        };

        if dirs.is_empty() {
            return RefreshResult::PathNotFound;
        }
        self.queue_refresh_task(kind, dirs, blocking)
    }

    /// Refresh explicitly selected share roots by real path.
    pub fn refresh_paths(self: &Arc<Self>, targets: &[String]) -> RefreshResult {
        let mut paths = Vec::new();
        {
            let state = self.state.read().unwrap();
            let parents = state.parents();
            for target in targets {
                let normalized = normalize_dir_path(target);
                let Some(root) = state
                    .roots
                    .keys()
                    .find(|root| root.eq_ignore_ascii_case(&normalized))
                else {
                    continue;
                };
                // A nested root rebuilds its enclosing parent.
                match parents.iter().find(|(parent, _)| is_strict_sub(parent, root)) {
                    Some((parent, _)) => paths.push(parent.clone()),
                    None => paths.push(root.clone()),
                }
            }
        }
        paths.sort();
        paths.dedup();

        if paths.is_empty() {
            return RefreshResult::PathNotFound;
        }
        self.queue_refresh_task(RefreshKind::Dirs, paths, false)
    }

    /// Refresh one target: a share root's real path, or a virtual
    /// name matched against every profile registration.
    pub fn refresh(self: &Arc<Self>, target: &str) -> RefreshResult {
        let path = normalize_dir_path(target);
        let mut paths = Vec::new();
        {
            let state = self.state.read().unwrap();
            let known = state
                .roots
                .keys()
                .find(|root| root.eq_ignore_ascii_case(&path));
            match known {
                Some(root) => paths.push(root.clone()),
                None => {
                    for (root, pd) in &state.profile_dirs {
                        if pd.profiles.values().any(|v| v.eq_ignore_ascii_case(target)) {
                            paths.push(root.clone());
                        }
                    }
                }
            }

            // A nested root rebuilds its enclosing parent so the
            // parent's subtree can never go stale.
            let parents = state.parents();
            for path in &mut paths {
                if let Some((parent, _)) = parents
                    .iter()
                    .find(|(parent, _)| is_strict_sub(parent, path))
                {
                    *path = parent.clone();
                }
            }
        }
        paths.sort();
        paths.dedup();

        if paths.is_empty() {
            return RefreshResult::PathNotFound;
        }
        self.queue_refresh_task(RefreshKind::Dirs, paths, false)
    }

    pub(crate) fn queue_refresh_task(
        self: &Arc<Self>,
        kind: RefreshKind,
        paths: Vec<String>,
        blocking: bool,
    ) -> RefreshResult {
        self.tasks.push_or_merge(
            RefreshTask { kind, paths },
            |pending| pending.kind == kind,
            |pending, new| {
                pending.paths.extend(new.paths);
                pending.paths.sort();
                pending.paths.dedup();
            },
        );

        if !self.refresh_gate.try_acquire() {
            info!("File list refresh in progress, queued for the running worker");
            return RefreshResult::InProgress;
        }

        if blocking {
            self.run_scanner();
        } else {
            let this = Arc::clone(self);
            std::thread::spawn(move || this.run_scanner());
        }
        RefreshResult::Started
    }

    /// Worker body: drain the FIFO, then release the gate.
    pub(crate) fn run_scanner(self: &Arc<Self>) {
        while let Some(task) = self.tasks.pop() {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            self.refresh_running.store(true, Ordering::Release);
            self.execute_refresh(&task);
            self.refresh_running.store(false, Ordering::Release);
        }

        self.names.write().unwrap().bundle_dirs.clear();
        self.refresh_gate.release();
    }

    fn report_task_status(&self, task: &RefreshTask, finished: bool) {
        let what = match task.kind {
            RefreshKind::All | RefreshKind::Startup => "full refresh",
            RefreshKind::Incoming => "incoming refresh",
            RefreshKind::Dirs => "directory refresh",
            RefreshKind::AddDir => "shared directory add",
        };
        if finished {
            skiff_config::log_scan_info!("Refresh finished", task = what, directories = task.paths.len());
        } else {
            skiff_config::log_scan_info!("Refresh starting", task = what, directories = task.paths.len());
        }
    }

    fn execute_refresh(self: &Arc<Self>, task: &RefreshTask) {
        self.report_task_status(task, false);

        // Active downloads must not be scanned into the share.
        let mut forbidden: Vec<String> = self
            .queue
            .forbidden_paths(&task.paths)
            .into_iter()
            .map(|p| p.to_lowercase())
            .collect();
        forbidden.sort();
        self.names
            .write()
            .unwrap()
            .set_bundle_dirs(forbidden.clone());

        let mut built = Vec::new();
        for path in &task.paths {
            if self.shutdown.load(Ordering::Acquire) {
                return; // abort commits nothing
            }

            if !self.check_root_visible(path) {
                continue;
            }

            let (own, sub_roots) = {
                let state = self.state.read().unwrap();
                let own = state.profile_dirs.get(path).cloned();
                let subs: std::collections::BTreeMap<String, ProfileDir> = state
                    .profile_dirs
                    .iter()
                    .filter(|(p, _)| is_strict_sub(path, p))
                    .map(|(p, pd)| (p.clone(), pd.clone()))
                    .collect();
                (own, subs)
            };
            if own.is_none() {
                debug!(path = %path, "Refresh target is no longer a share root");
                continue;
            }

            let last_write = self
                .lister
                .dir_info(path)
                .map(|info| info.last_write)
                .unwrap_or(0);
            let mut root = DirNode::new(last_dir(path).to_string(), None, last_write);
            root.profile_key = Some(path.clone());

            let mut tree = RootTree::new(root);
            let mut names = Vec::new();
            let mut nested = Vec::new();
            if self
                .scan_into(
                    path,
                    &mut tree,
                    DirId::ROOT,
                    &sub_roots,
                    &forbidden,
                    &mut names,
                    &mut nested,
                )
                .is_err()
            {
                debug!("Refresh aborted");
                return;
            }
            built.push(BuiltRoot {
                path: path.clone(),
                tree,
                names,
                nested,
            });
        }

        if built.is_empty() {
            self.report_task_status(task, true);
            return;
        }

        // Publish: swap the affected root entries, then re-derive the
        // indices. Readers see either the old or the new subtree.
        {
            let mut state = self.state.write().unwrap();
            let mut names = self.names.write().unwrap();

            if matches!(task.kind, RefreshKind::All | RefreshKind::Startup) {
                state.trees.clear();
                state.roots.clear();
                names.clear_dirs();
            }

            for build in built {
                // Drop everything this subtree replaces: the path's
                // own tree and any top-level tree nested below it.
                let doomed: Vec<RootId> = state
                    .roots
                    .iter()
                    .filter(|(p, d)| {
                        d.dir == DirId::ROOT && is_parent_or_exact(&build.path, p)
                    })
                    .map(|(_, d)| d.root)
                    .collect();
                for id in &doomed {
                    state.trees.remove(id);
                    names.remove_root(*id);
                }
                let path = build.path.clone();
                state
                    .roots
                    .retain(|root, dref| !doomed.contains(&dref.root) && !is_parent_or_exact(&path, root));

                let id = state.alloc_root_id();
                state.trees.insert(id, build.tree);
                state.roots.insert(
                    build.path.clone(),
                    DirRef {
                        root: id,
                        dir: DirId::ROOT,
                    },
                );
                for (nested_path, dir) in build.nested {
                    state.roots.insert(nested_path, DirRef { root: id, dir });
                }
                names.extend(
                    build
                        .names
                        .into_iter()
                        .map(|(name, dir)| (name, DirRef { root: id, dir })),
                );
            }

            state.rebuild_indices();
            state.set_dirty(true);
        }

        self.report_task_status(task, true);
    }

    /// Walk one real directory into the subtree under construction.
    /// Also used to re-scan a finished bundle's directory in place.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn scan_into(
        &self,
        path: &str,
        tree: &mut RootTree,
        parent: DirId,
        sub_roots: &std::collections::BTreeMap<String, ProfileDir>,
        forbidden: &[String],
        names: &mut Vec<(String, DirId)>,
        nested: &mut Vec<(String, DirId)>,
    ) -> Result<(), Aborted> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Aborted);
        }

        let entries = match self.lister.list(path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to read directory");
                return Ok(());
            }
        };

        for entry in entries {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(Aborted);
            }
            if entry.hidden && !self.settings.share_hidden {
                continue;
            }

            if entry.is_dir {
                let cur_path = format!("{path}{}/", entry.name);

                if !self.check_shared_dir(&cur_path, &entry.name, true) {
                    continue;
                }
                if forbidden
                    .binary_search_by(|f| f.as_str().cmp(&cur_path.to_lowercase()))
                    .is_ok()
                {
                    continue;
                }

                let mut profile_key = None;
                if let Some(pd) = sub_roots.get(&cur_path) {
                    if pd.is_set(ProfileDir::EXCLUDE_TOTAL) {
                        continue;
                    }
                    if pd.is_set(ProfileDir::ROOT) || pd.is_set(ProfileDir::EXCLUDE_PROFILE) {
                        profile_key = Some(cur_path.clone());
                    }
                }

                let mut node = DirNode::new(entry.name.clone(), None, entry.last_write);
                node.profile_key = profile_key.clone();
                let is_root = profile_key.is_some()
                    && sub_roots
                        .get(&cur_path)
                        .is_some_and(|pd| pd.is_set(ProfileDir::ROOT));

                let id = tree.add_dir(parent, node);
                names.push((entry.name.to_lowercase(), id));
                if is_root {
                    nested.push((cur_path.clone(), id));
                }

                self.scan_into(&cur_path, tree, id, sub_roots, forbidden, names, nested)?;
            } else {
                let full = format!("{path}{}", entry.name);
                if !self.check_shared_file(&full, &entry.name, entry.size, true) {
                    continue;
                }

                // Only files with a known hash enter the tree; the
                // hash manager schedules the rest.
                match self
                    .hasher
                    .tth(Path::new(&full), entry.size, entry.last_write)
                {
                    Some(tth) => {
                        tree.add_file(
                            parent,
                            FileNode {
                                name: entry.name,
                                size: entry.size,
                                tth,
                                last_write: entry.last_write,
                            },
                        );
                    }
                    None => {
                        debug!(path = %full, "No hash yet, skipping");
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn check_root_visible(&self, path: &str) -> bool {
        match self.lister.dir_info(path) {
            Some(info) => self.settings.share_hidden || !info.hidden,
            None => true,
        }
    }

    /// Directory-level skip rules.
    pub(crate) fn check_shared_dir(&self, path: &str, name: &str, report: bool) -> bool {
        if self.skiplist.read().unwrap().matches(name) {
            if report && self.settings.report_skiplist {
                info!(path = %path, "Share skip-list blocked directory");
            }
            return false;
        }

        let temp = self.settings.temp_download_dir.to_string_lossy();
        if !temp.is_empty() && normalize_dir_path(&temp).eq_ignore_ascii_case(path) {
            return false;
        }
        true
    }

    /// File-level skip rules: reserved names, forbidden extensions,
    /// the zero-byte and max-size policies.
    pub(crate) fn check_shared_file(&self, path: &str, name: &str, size: i64, report: bool) -> bool {
        if self.skiplist.read().unwrap().matches(name) {
            if report && self.settings.report_skiplist {
                info!(path = %path, "Share skip-list blocked file");
            }
            return false;
        }

        let lower = name.to_lowercase();
        let ext = file_ext(&lower);

        if FORBIDDEN_NAMES.contains(&lower.as_str()) || FORBIDDEN_EXTS.contains(&ext) {
            return false;
        }

        if self.settings.remove_forbidden {
            let forbidden = REMOVE_FORBIDDEN_EXTS.contains(&ext)
                || REMOVE_FORBIDDEN_PREFIXES.iter().any(|p| lower.starts_with(p))
                || (lower.len() > 9 && lower.ends_with("part.met"));
            if forbidden {
                if report {
                    info!(path = %path, "Forbidden file will not be shared");
                }
                return false;
            }
        }

        if let Some(key) = &self.settings.private_key_file {
            if key.to_string_lossy().eq_ignore_ascii_case(path) {
                return false;
            }
        }

        if self.settings.no_zero_byte && size <= 0 {
            return false;
        }

        let max = self.settings.max_file_size_mb;
        if max != 0 && size > max * 1024 * 1024 {
            if report {
                info!(path = %path, size, "File too big to share");
            }
            return false;
        }
        true
    }
}
