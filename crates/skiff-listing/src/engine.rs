//! The listing service.
//!
//! One `DirectoryListing` owns a remote tree and a FIFO of tagged
//! tasks drained by a single worker; a test-and-set gate keeps one
//! worker alive per listing. Every task reports back on the listener
//! channel, and no failure escapes the task loop.

use std::collections::HashMap;
use std::io::Read;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender};
use tracing::{debug, error};

use skiff_config::ListingSettings;
use skiff_share::{ProfileId, ShareIndex};
use skiff_types::{
    AdcQuery, Cid, DirectSearchResult, FileType, PeerSearch, QueueBridge, Priority, RemoteUser,
    ShareLookup, SizeMode, TaskQueue, Tth, WorkerGate,
};

use crate::adl::{AdlMatcher, AdlRule};
use crate::download::download_directory;
use crate::parser::{DupeCheck, ListLoader};
use crate::tree::{to_adc, to_nmdc, ListingTree, NodeId, ROOT};
use crate::{ListingError, Result};

/// How long a peer-dispatched direct search may run.
const DIRECT_SEARCH_TIMEOUT: Duration = Duration::from_secs(5);

/// One queued unit of work.
#[derive(Debug, Clone)]
pub enum ListingTask {
    /// Subtract a second list loaded from disk.
    ListDiff(String),
    MatchAdl,
    /// Load the full list; the payload is the directory to show
    /// afterwards.
    LoadFile(String),
    /// Merge one partial-list chunk: the XML for a remote user, the
    /// requested directory for an own-share view.
    RefreshDir(String),
    MatchQueue,
    Search(SearchSpec),
    Close,
}

/// A search request routed by listing state.
#[derive(Debug, Clone)]
pub struct SearchSpec {
    pub query: String,
    pub size: i64,
    pub size_mode: SizeMode,
    pub file_type: FileType,
    pub extensions: Vec<String>,
    /// NMDC-style directory to restrict to; empty searches all.
    pub directory: String,
}

/// Listener-bus events.
#[derive(Debug, Clone)]
pub enum ListingEvent {
    LoadingStarted,
    LoadingFinished {
        elapsed_ms: u128,
        base: String,
        was_partial: bool,
    },
    LoadingFailed {
        message: String,
    },
    UpdateStatus {
        message: String,
    },
    QueueMatched {
        message: String,
    },
    SearchStarted,
    SearchFailed {
        timed_out: bool,
    },
    ChangeDirectory {
        path: String,
    },
    Closed,
}

/// Construction parameters.
#[derive(Clone)]
pub struct ListingParams {
    pub user: RemoteUser,
    /// On-disk list file for a remote user; ignored for own lists.
    pub file_name: String,
    pub partial: bool,
    /// Browsing another user (enables dupe annotation).
    pub is_client_view: bool,
    /// `Some` makes this a view of the local share for that profile.
    pub own_profile: Option<ProfileId>,
    pub settings: ListingSettings,
    pub adl_rules: Vec<AdlRule>,
}

/// Mutable listing state under one lock.
pub struct ListingInner {
    pub tree: ListingTree,
    pub visited: HashMap<String, NodeId>,
    pub partial_list: bool,
}

struct SearchState {
    query: Option<AdcQuery>,
    results: Vec<DirectSearchResult>,
    cur: usize,
}

/// A remote user's directory listing.
pub struct DirectoryListing {
    params: ListingParams,
    inner: Mutex<ListingInner>,
    search: Mutex<SearchState>,

    tasks: TaskQueue<ListingTask>,
    gate: WorkerGate,
    abort: AtomicBool,
    match_adl: bool,

    share: Option<Arc<ShareIndex>>,
    queue: Arc<dyn QueueBridge>,
    peer: Option<Arc<dyn PeerSearch>>,
    events: Sender<ListingEvent>,
}

/// Parse the owning user out of a list file name
/// (`[nick].[CID].xml(.bz2)`).
pub fn user_from_filename(file_name: &str) -> Option<Cid> {
    let name = file_name.rsplit(['/', '\\']).next()?;
    let name = name.strip_suffix(".bz2").unwrap_or(name);
    let name = name.strip_suffix(".xml").unwrap_or(name);

    let cid_part = name.rsplit('.').next()?;
    if cid_part.len() != 39 {
        return None;
    }
    Cid::from_base32(cid_part).ok().filter(|c| !c.is_zero())
}

/// Read a list file, transparently unpacking `.bz2`.
fn load_list_file(path: &str) -> Result<String> {
    let raw = std::fs::read(path)?;
    let bytes = if path.ends_with(".bz2") {
        let mut out = Vec::new();
        bzip2::read::BzDecoder::new(raw.as_slice()).read_to_end(&mut out)?;
        out
    } else {
        raw
    };
    String::from_utf8(bytes).map_err(|e| ListingError::Parse(e.to_string()))
}

impl DirectoryListing {
    pub fn new(
        params: ListingParams,
        share: Option<Arc<ShareIndex>>,
        queue: Arc<dyn QueueBridge>,
        peer: Option<Arc<dyn PeerSearch>>,
        events: Sender<ListingEvent>,
    ) -> Arc<Self> {
        let match_adl = params.settings.use_adls && !params.partial;
        let partial = params.partial;
        Arc::new(Self {
            params,
            inner: Mutex::new(ListingInner {
                tree: ListingTree::new(),
                visited: HashMap::new(),
                partial_list: partial,
            }),
            search: Mutex::new(SearchState {
                query: None,
                results: Vec::new(),
                cur: 0,
            }),
            tasks: TaskQueue::new(),
            gate: WorkerGate::new(),
            abort: AtomicBool::new(false),
            match_adl,
            share,
            queue,
            peer,
            events,
        })
    }

    pub fn user(&self) -> &RemoteUser {
        &self.params.user
    }

    pub fn is_own_list(&self) -> bool {
        self.params.own_profile.is_some()
    }

    pub fn inner(&self) -> &Mutex<ListingInner> {
        &self.inner
    }

    /// Cancel whatever the worker is doing; the parse raises an abort
    /// caught at the task boundary.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Task submission
    // ------------------------------------------------------------------

    pub fn add_list_diff_task(self: &Arc<Self>, file: String) {
        self.tasks.push(ListingTask::ListDiff(file));
        self.run_tasks();
    }

    pub fn add_match_adl_task(self: &Arc<Self>) {
        self.tasks.push(ListingTask::MatchAdl);
        self.run_tasks();
    }

    pub fn add_full_list_task(self: &Arc<Self>, dir: String) {
        self.tasks.push(ListingTask::LoadFile(dir));
        self.run_tasks();
    }

    pub fn add_partial_list_task(self: &Arc<Self>, xml_or_dir: String) {
        self.tasks.push(ListingTask::RefreshDir(xml_or_dir));
        self.run_tasks();
    }

    pub fn add_queue_match_task(self: &Arc<Self>) {
        self.tasks.push(ListingTask::MatchQueue);
        self.run_tasks();
    }

    pub fn add_search_task(self: &Arc<Self>, spec: SearchSpec) {
        self.tasks.push(ListingTask::Search(spec));
        self.run_tasks();
    }

    pub fn close(self: &Arc<Self>) {
        self.tasks.push(ListingTask::Close);
        self.run_tasks();
    }

    fn run_tasks(self: &Arc<Self>) {
        if !self.gate.try_acquire() {
            return;
        }
        let this = Arc::clone(self);
        std::thread::spawn(move || this.worker_loop());
    }

    fn worker_loop(self: Arc<Self>) {
        while let Some(task) = self.tasks.pop() {
            let start = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| self.handle_task(&task, start)));
            match outcome {
                Ok(Ok(true)) => continue,
                Ok(Ok(false)) => break,
                Ok(Err(ListingError::Aborted)) => {
                    // Commits nothing further; empty text by design.
                    let _ = self.events.send(ListingEvent::LoadingFailed {
                        message: String::new(),
                    });
                    break;
                }
                Ok(Err(e)) => {
                    skiff_config::log_list_info!(
                        "Listing task failed",
                        user = self.params.user.nick.as_str(),
                        error = e.to_string().as_str(),
                    );
                    let _ = self.events.send(ListingEvent::LoadingFailed {
                        message: e.to_string(),
                    });
                }
                Err(_) => {
                    error!("Listing task panicked; continuing with the next task");
                }
            }
        }
        self.gate.release();
    }

    // ------------------------------------------------------------------
    // Task bodies
    // ------------------------------------------------------------------

    fn dupe_check(&self) -> DupeCheck<'_> {
        let enabled = self.params.is_client_view
            && !self.is_own_list()
            && self.params.settings.dupes_in_filelist;
        if !enabled {
            return DupeCheck::default();
        }
        DupeCheck {
            share: self
                .share
                .as_ref()
                .map(|s| &**s as &dyn ShareLookup),
            queue: Some(&*self.queue),
        }
    }

    /// Parse a catalog document into the tree.
    fn load_xml(&self, inner: &mut ListingInner, xml: &str, updating: bool) -> Result<String> {
        let check_dupe = self.dupe_check();
        let enabled = check_dupe.share.is_some() || check_dupe.queue.is_some();
        let loader = ListLoader::new(
            &mut inner.tree,
            &mut inner.visited,
            updating,
            inner.partial_list,
            enabled,
            check_dupe,
            &self.abort,
        );
        loader.parse(xml)
    }

    /// Aggregate per-file dupe states up the tree; the root is never
    /// shown as a dupe.
    pub fn check_dupes(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.tree.check_share_dupes(ROOT);
        inner.tree.node_mut(ROOT).dupe = skiff_types::DupeState::None;
    }

    fn handle_task(&self, task: &ListingTask, start: Instant) -> Result<bool> {
        match task {
            ListingTask::ListDiff(file) => {
                let text = load_list_file(file)?;
                let mut other = ListingTree::new();
                let mut visited = HashMap::new();
                ListLoader::new(
                    &mut other,
                    &mut visited,
                    false,
                    false,
                    false,
                    DupeCheck::default(),
                    &self.abort,
                )
                .parse(&text)?;

                let mut hashes = std::collections::HashSet::new();
                other.hash_set(ROOT, &mut hashes);

                let mut inner = self.inner.lock().unwrap();
                let skip = self.params.settings.skip_subtract_kb;
                inner.tree.filter_list(ROOT, &hashes, skip);

                let _ = self.events.send(ListingEvent::LoadingFinished {
                    elapsed_ms: start.elapsed().as_millis(),
                    base: String::new(),
                    was_partial: false,
                });
                Ok(true)
            }

            ListingTask::MatchAdl => {
                let matcher = AdlMatcher::new(&self.params.adl_rules);
                let mut inner = self.inner.lock().unwrap();
                inner.tree.clear_adls();
                matcher.match_listing(&mut inner.tree);
                drop(inner);

                let _ = self.events.send(ListingEvent::LoadingFinished {
                    elapsed_ms: start.elapsed().as_millis(),
                    base: String::new(),
                    was_partial: false,
                });
                Ok(true)
            }

            ListingTask::LoadFile(dir) => {
                let _ = self.events.send(ListingEvent::LoadingStarted);
                let mut inner = self.inner.lock().unwrap();
                let was_partial = inner.partial_list;
                if was_partial {
                    // Cheaper to drop the few browsed subtrees than to
                    // merge every entry by name.
                    inner.tree.clear_root_dirs();
                    inner.visited.clear();
                }

                match (&self.share, self.params.own_profile) {
                    (Some(share), Some(profile)) => {
                        let xml = share.generate_partial_list("/", true, profile)?;
                        self.load_xml(&mut inner, &xml, true)?;
                    }
                    _ => {
                        let xml = load_list_file(&self.params.file_name)?;
                        self.load_xml(&mut inner, &xml, false)?;
                    }
                }

                inner.partial_list = false;
                drop(inner);

                self.check_dupes();

                if self.match_adl {
                    let _ = self.events.send(ListingEvent::UpdateStatus {
                        message: "Matching auto-download rules".to_string(),
                    });
                    let matcher = AdlMatcher::new(&self.params.adl_rules);
                    let mut inner = self.inner.lock().unwrap();
                    inner.tree.clear_adls();
                    matcher.match_listing(&mut inner.tree);
                }

                let _ = self.events.send(ListingEvent::LoadingFinished {
                    elapsed_ms: start.elapsed().as_millis(),
                    base: dir.clone(),
                    was_partial,
                });
                Ok(true)
            }

            ListingTask::RefreshDir(payload) => {
                let mut inner = self.inner.lock().unwrap();
                if !inner.partial_list {
                    return Ok(true);
                }

                let base = match (&self.share, self.params.own_profile) {
                    (Some(share), Some(profile)) => {
                        let xml =
                            share.generate_partial_list(&to_adc(payload), false, profile)?;
                        self.load_xml(&mut inner, &xml, true)?
                    }
                    _ => self.load_xml(&mut inner, payload, true)?,
                };
                drop(inner);

                let _ = self.events.send(ListingEvent::LoadingFinished {
                    elapsed_ms: start.elapsed().as_millis(),
                    base: to_nmdc(&base),
                    was_partial: false,
                });
                Ok(true)
            }

            ListingTask::MatchQueue => {
                let files = self.flatten_files();
                let result = self.queue.match_listing(&self.params.user, &files);
                let _ = self.events.send(ListingEvent::QueueMatched {
                    message: format!(
                        "{} file(s) matched, {} new, {} bundle(s)",
                        result.matched_files, result.new_files, result.bundles
                    ),
                });
                Ok(true)
            }

            ListingTask::Search(spec) => {
                self.run_search(spec);
                Ok(true)
            }

            ListingTask::Close => {
                let _ = self.events.send(ListingEvent::Closed);
                Ok(false)
            }
        }
    }

    fn flatten_files(&self) -> Vec<(String, i64, Tth)> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        fn walk(
            tree: &ListingTree,
            id: NodeId,
            out: &mut Vec<(String, i64, Tth)>,
        ) {
            let node = tree.node(id);
            let path = tree.path(id);
            for file in &node.files {
                out.push((format!("{path}{}", file.name), file.size, file.tth));
            }
            for child in &node.children {
                walk(tree, *child, out);
            }
        }
        walk(&inner.tree, ROOT, &mut out);
        out
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    fn build_query(spec: &SearchSpec) -> AdcQuery {
        if spec.file_type == FileType::Tth {
            if let Ok(tth) = Tth::from_base32(spec.query.trim()) {
                return AdcQuery::with_root(tth);
            }
        }
        let mut query = AdcQuery::parse(&spec.query, &spec.extensions);
        match spec.size_mode {
            SizeMode::AtLeast => query.gt = spec.size,
            SizeMode::AtMost => query.lt = spec.size,
            SizeMode::Any => {}
        }
        query.is_directory = spec.file_type == FileType::Directory;
        query
    }

    fn run_search(&self, spec: &SearchSpec) {
        let _ = self.events.send(ListingEvent::SearchStarted);

        let query = Self::build_query(spec);
        {
            let mut search = self.search.lock().unwrap();
            search.results.clear();
            search.cur = 0;
            search.query = Some(query.clone());
        }

        let partial = self.inner.lock().unwrap().partial_list;

        if partial {
            if let (Some(share), Some(profile)) = (&self.share, self.params.own_profile) {
                // Browsing our own share: answer locally.
                let results = share
                    .direct_search(&query, profile, 50, &to_adc(&spec.directory))
                    .unwrap_or_default();
                self.search.lock().unwrap().results = results;
                self.end_search(false);
                return;
            }

            // A partial view of a remote share: ask the peer and wait
            // bounded wall-clock for results.
            let Some(peer) = &self.peer else {
                self.end_search(false);
                return;
            };
            let rx = peer.direct_search(&self.params.user, &query, &to_adc(&spec.directory));
            let deadline = Instant::now() + DIRECT_SEARCH_TIMEOUT;
            let mut timed_out = false;
            loop {
                match rx.recv_deadline(deadline) {
                    Ok(result) => self.search.lock().unwrap().results.push(result),
                    Err(RecvTimeoutError::Timeout) => {
                        timed_out = true;
                        break;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            self.end_search(timed_out);
            return;
        }

        // A fully loaded tree: search in place.
        let mut results = Vec::new();
        {
            let inner = self.inner.lock().unwrap();
            let from = if spec.directory.is_empty() {
                Some(ROOT)
            } else {
                inner.tree.find_directory(&spec.directory, ROOT)
            };
            if from.is_some() {
                inner.tree.direct_search(ROOT, &query, 100, &mut results);
            }
        }
        self.search.lock().unwrap().results = results;
        self.end_search(false);
    }

    fn end_search(&self, timed_out: bool) {
        let empty = self.search.lock().unwrap().results.is_empty();
        if empty {
            self.search.lock().unwrap().query = None;
            let _ = self.events.send(ListingEvent::SearchFailed { timed_out });
        } else {
            self.change_dir();
        }
    }

    /// Navigate to the current search result, fetching the directory
    /// when a partial listing does not hold it yet.
    fn change_dir(&self) {
        let path = {
            let search = self.search.lock().unwrap();
            match search.results.get(search.cur) {
                Some(result) => to_nmdc(&result.path),
                None => return,
            }
        };

        let inner = self.inner.lock().unwrap();
        if !inner.partial_list {
            drop(inner);
            let _ = self.events.send(ListingEvent::ChangeDirectory { path });
            return;
        }

        let loaded = inner
            .tree
            .find_directory(&path, ROOT)
            .is_some_and(|id| inner.tree.node(id).complete);
        drop(inner);

        if loaded {
            let _ = self.events.send(ListingEvent::ChangeDirectory { path });
        } else if self.is_own_list() {
            let mut inner = self.inner.lock().unwrap();
            match (&self.share, self.params.own_profile) {
                (Some(share), Some(profile)) => {
                    match share.generate_partial_list(&to_adc(&path), false, profile) {
                        Ok(xml) => {
                            if self.load_xml(&mut inner, &xml, true).is_ok() {
                                drop(inner);
                                let _ = self.events.send(ListingEvent::LoadingFinished {
                                    elapsed_ms: 0,
                                    base: path,
                                    was_partial: false,
                                });
                            }
                        }
                        Err(_) => {
                            // The share may have been refreshed away.
                            drop(inner);
                            let _ = self.events.send(ListingEvent::LoadingFailed {
                                message: "File not available".to_string(),
                            });
                        }
                    }
                }
                _ => {}
            }
        } else {
            self.queue.request_partial_list(&self.params.user, &path);
        }
    }

    /// Step to the next search result; false at the end.
    pub fn next_result(&self) -> bool {
        {
            let mut search = self.search.lock().unwrap();
            if search.cur + 1 >= search.results.len() {
                return false;
            }
            search.cur += 1;
        }
        self.change_dir();
        true
    }

    pub fn is_current_search_path(&self, path: &str) -> bool {
        let search = self.search.lock().unwrap();
        search
            .results
            .get(search.cur)
            .is_some_and(|r| r.path == to_adc(path))
    }

    // ------------------------------------------------------------------
    // Downloads
    // ------------------------------------------------------------------

    /// Queue a remote directory for download.
    pub fn download_dir(
        &self,
        path: &str,
        target: &str,
        priority: Priority,
        recursive_list: bool,
    ) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let dir = inner
            .tree
            .find_directory(path, ROOT)
            .ok_or(ListingError::NotFound)?;
        download_directory(
            &inner.tree,
            dir,
            inner.partial_list,
            &self.params.user,
            &*self.queue,
            target,
            priority,
            recursive_list,
            &self.params.settings,
        )
    }

    /// Queue the first .nfo of a directory for viewing.
    pub fn find_nfo(&self, path: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        let Some(dir) = inner.tree.find_directory(path, ROOT) else {
            return false;
        };
        for file in &inner.tree.node(dir).files {
            if file.name.to_lowercase().ends_with(".nfo") {
                let bundle = self.queue.create_bundle(skiff_types::BundleSpec {
                    target: format!("view/{}", file.name),
                    priority: Priority::Highest,
                    date: 0,
                });
                let _ = self.queue.add_file(
                    bundle,
                    &format!("view/{}", file.name),
                    file.size,
                    &file.tth,
                    &self.params.user,
                );
                self.queue.submit_bundle(bundle);
                return true;
            }
        }
        debug!(path = %path, "No nfo found");
        false
    }
}
