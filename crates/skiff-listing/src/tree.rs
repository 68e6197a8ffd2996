//! The remote listing tree.
//!
//! An arena of directory nodes owned by the listing; children and
//! files are plain vectors, parents are indices. Partial listings
//! grow in place as the user browses; converting a partial to a full
//! listing rebuilds the tree instead of mutating it.

use std::collections::HashSet;

use skiff_types::{AdcQuery, DirectSearchResult, DupeState, Tth};

/// Index of a directory node; the root is node 0.
pub type NodeId = u32;

pub const ROOT: NodeId = 0;

/// Convert an NMDC-style path (`a\b\`) to catalog space (`/a/b/`).
pub fn to_adc(path: &str) -> String {
    format!("/{}", path.replace('\\', "/"))
}

/// Convert a catalog path back to NMDC style.
pub fn to_nmdc(path: &str) -> String {
    path.trim_start_matches('/').replace('/', "\\")
}

/// A file of the remote tree.
#[derive(Debug, Clone)]
pub struct ListingFile {
    pub name: String,
    pub size: i64,
    pub tth: Tth,
    /// Cloned into a rule-match subtree.
    pub adls: bool,
    pub dupe: DupeState,
}

/// A directory of the remote tree.
#[derive(Debug, Clone)]
pub struct ListingDir {
    pub name: String,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub files: Vec<ListingFile>,
    /// The subtree has been delivered; incomplete directories carry
    /// only the advertised size.
    pub complete: bool,
    pub partial_size: i64,
    /// Remote date, seconds since the epoch.
    pub date: u32,
    pub adls: bool,
    pub dupe: DupeState,
}

impl ListingDir {
    pub fn new(name: &str, complete: bool) -> Self {
        Self {
            name: name.to_string(),
            parent: None,
            children: Vec::new(),
            files: Vec::new(),
            complete,
            partial_size: 0,
            date: 0,
            adls: false,
            dupe: DupeState::None,
        }
    }
}

/// The listing arena.
#[derive(Debug)]
pub struct ListingTree {
    nodes: Vec<ListingDir>,
}

impl Default for ListingTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ListingTree {
    pub fn new() -> Self {
        Self {
            nodes: vec![ListingDir::new("", false)],
        }
    }

    pub fn node(&self, id: NodeId) -> &ListingDir {
        &self.nodes[id as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut ListingDir {
        &mut self.nodes[id as usize]
    }

    pub fn add_dir(&mut self, parent: NodeId, mut node: ListingDir) -> NodeId {
        node.parent = Some(parent);
        let id = self.nodes.len() as NodeId;
        self.nodes.push(node);
        self.node_mut(parent).children.push(id);
        id
    }

    pub fn find_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.node(parent)
            .children
            .iter()
            .copied()
            .find(|c| self.node(*c).name == name)
    }

    /// Drop the root's subdirectories; used when a partial listing is
    /// reloaded as a full one.
    pub fn clear_root_dirs(&mut self) {
        self.node_mut(ROOT).children.clear();
    }

    /// NMDC display path of a node, trailing separator included; the
    /// root is the empty string.
    pub fn path(&self, id: NodeId) -> String {
        if id == ROOT {
            return String::new();
        }
        let mut segments = Vec::new();
        let mut cur = Some(id);
        while let Some(node_id) = cur {
            if node_id == ROOT {
                break;
            }
            let node = self.node(node_id);
            segments.push(node.name.as_str());
            cur = node.parent;
        }
        let mut out = String::new();
        for seg in segments.iter().rev() {
            out.push_str(seg);
            out.push('\\');
        }
        out
    }

    pub fn adc_path(&self, id: NodeId) -> String {
        to_adc(&self.path(id))
    }

    /// Walk an NMDC path (`a\b\`) from a starting node.
    pub fn find_directory(&self, path: &str, from: NodeId) -> Option<NodeId> {
        let mut cur = from;
        for segment in path.split('\\').filter(|s| !s.is_empty()) {
            cur = self.find_child(cur, segment)?;
        }
        Some(cur)
    }

    /// Recursive check for incomplete directories.
    pub fn find_incomplete(&self, id: NodeId) -> bool {
        let node = self.node(id);
        if !node.complete {
            return true;
        }
        node.children.iter().any(|c| self.find_incomplete(*c))
    }

    pub fn files_size(&self, id: NodeId) -> i64 {
        self.node(id).files.iter().map(|f| f.size).sum()
    }

    /// Recursive size. An incomplete directory reports its advertised
    /// size; `skip_adls` leaves rule-match clones out.
    pub fn total_size(&self, id: NodeId, skip_adls: bool) -> i64 {
        let node = self.node(id);
        if !node.complete {
            return node.partial_size;
        }
        let mut total = self.files_size(id);
        for child in &node.children {
            if skip_adls && self.node(*child).adls {
                continue;
            }
            total += self.total_size(*child, skip_adls);
        }
        total
    }

    pub fn total_file_count(&self, id: NodeId, skip_adls: bool) -> usize {
        let node = self.node(id);
        let mut total = node.files.len();
        for child in &node.children {
            if skip_adls && self.node(*child).adls {
                continue;
            }
            total += self.total_file_count(*child, skip_adls);
        }
        total
    }

    /// Collect every hash in a subtree.
    pub fn hash_set(&self, id: NodeId, out: &mut HashSet<Tth>) {
        let node = self.node(id);
        for child in &node.children {
            self.hash_set(*child, out);
        }
        for file in &node.files {
            out.insert(file.tth);
        }
    }

    /// Subtract files whose hash is in `other`, drop directories left
    /// empty, and apply the skip-subtract heuristic: a directory left
    /// with fewer than two files also sheds files smaller than
    /// `skip_subtract_kb` KiB.
    pub fn filter_list(&mut self, id: NodeId, other: &HashSet<Tth>, skip_subtract_kb: i64) {
        let children = self.node(id).children.clone();
        for child in children {
            self.filter_list(child, other, skip_subtract_kb);
        }

        let empties: Vec<NodeId> = self
            .node(id)
            .children
            .iter()
            .copied()
            .filter(|c| {
                let node = self.node(*c);
                node.files.is_empty() && node.children.is_empty()
            })
            .collect();
        self.node_mut(id)
            .children
            .retain(|c| !empties.contains(c));

        let node = self.node_mut(id);
        node.files.retain(|f| !other.contains(&f.tth));
        if skip_subtract_kb > 0 && node.files.len() < 2 {
            node.files.retain(|f| f.size >= skip_subtract_kb * 1024);
        }
    }

    /// Remove rule-match clones from under the root.
    pub fn clear_adls(&mut self) {
        let adls: Vec<NodeId> = self
            .node(ROOT)
            .children
            .iter()
            .copied()
            .filter(|c| self.node(*c).adls)
            .collect();
        self.node_mut(ROOT).children.retain(|c| !adls.contains(c));
    }

    /// Deep-copy a subtree under a new parent, marking every clone as
    /// a rule match.
    pub fn clone_subtree(&mut self, src: NodeId, dest_parent: NodeId) -> NodeId {
        let mut node = self.node(src).clone();
        node.children = Vec::new();
        node.adls = true;
        for file in &mut node.files {
            file.adls = true;
        }
        let copy = self.add_dir(dest_parent, node);
        let children = self.node(src).children.clone();
        for child in children {
            self.clone_subtree(child, copy);
        }
        copy
    }

    /// In-tree direct search: emits directory paths.
    pub fn direct_search(
        &self,
        id: NodeId,
        query: &AdcQuery,
        max_results: usize,
        results: &mut Vec<DirectSearchResult>,
    ) {
        let node = self.node(id);
        if let Some(root) = &query.root {
            if node.files.iter().any(|f| f.tth == *root) {
                results.push(DirectSearchResult {
                    path: self.adc_path(id),
                });
            }
        } else {
            if query.matches_direct_directory_name(&node.name) {
                let parent_path = match node.parent {
                    Some(parent) => self.adc_path(parent),
                    None => "/".to_string(),
                };
                if !results.iter().any(|r| r.path == parent_path)
                    && query.matches_size(self.total_size(id, false))
                {
                    results.push(DirectSearchResult { path: parent_path });
                }
            }

            if !query.is_directory {
                for file in &node.files {
                    if query.matches_direct_file(&file.name, file.size) {
                        results.push(DirectSearchResult {
                            path: self.adc_path(id),
                        });
                        break;
                    }
                }
            }
        }

        for child in &node.children {
            if results.len() >= max_results {
                break;
            }
            self.direct_search(*child, query, max_results, results);
        }
    }

    /// Fold child dupe states upward. Any non-matching sibling turns
    /// a full match partial; mixing share and queue dupes turns the
    /// directory into a mixed dupe. Zero-byte files are ignored.
    pub fn check_share_dupes(&mut self, id: NodeId) -> DupeState {
        use DupeState::*;

        let children = self.node(id).children.clone();
        let mut first = true;
        for child in children {
            let result = self.check_share_dupes(child);
            let dupe = self.node(id).dupe;

            let next = if dupe == None && first {
                result
            } else if (result == Share || result == PartialShare) && dupe == None && !first {
                PartialShare
            } else if (result == Queue || result == PartialQueue) && dupe == None && !first {
                PartialQueue
            } else if (dupe == Share || dupe == PartialShare)
                && (result == Queue || result == PartialQueue)
            {
                ShareQueue
            } else if (dupe == Queue || dupe == PartialQueue)
                && (result == Share || result == PartialShare)
            {
                ShareQueue
            } else if result == ShareQueue {
                ShareQueue
            } else {
                dupe
            };
            self.node_mut(id).dupe = next;
            first = false;
        }

        let mut first = true;
        let dirs_empty = self.node(id).children.is_empty();
        for fi in 0..self.node(id).files.len() {
            let file = &self.node(id).files[fi];
            // Zero-byte files would make everything a partial dupe.
            if file.size <= 0 {
                continue;
            }
            let f_share = file.dupe == Share;
            let f_queued = file.dupe == Queue;
            let dupe = self.node(id).dupe;

            let next = if dupe == None && f_share && dirs_empty && first {
                Share
            } else if dupe == None && f_queued && dirs_empty && first {
                Queue
            } else if dupe == None && f_share && !dirs_empty && first {
                PartialShare
            } else if dupe == None && f_queued && !dirs_empty && first {
                PartialQueue
            } else if dupe == None && f_share && !first {
                PartialShare
            } else if dupe == None && f_queued && !first {
                PartialQueue
            } else if dupe == Share && !f_share {
                PartialShare
            } else if dupe == Queue && !f_queued {
                PartialQueue
            } else if (dupe == Share || dupe == PartialShare) && f_queued {
                ShareQueue
            } else if (dupe == Queue || dupe == PartialQueue) && f_share {
                ShareQueue
            } else {
                dupe
            };
            self.node_mut(id).dupe = next;
            first = false;
        }

        self.node(id).dupe
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, size: i64, tth_byte: u8, dupe: DupeState) -> ListingFile {
        ListingFile {
            name: name.to_string(),
            size,
            tth: Tth([tth_byte; 24]),
            adls: false,
            dupe,
        }
    }

    fn tree_with(paths: &[&str]) -> ListingTree {
        let mut tree = ListingTree::new();
        for path in paths {
            let mut cur = ROOT;
            for seg in path.split('/') {
                cur = tree
                    .find_child(cur, seg)
                    .unwrap_or_else(|| tree.add_dir(cur, ListingDir::new(seg, true)));
            }
        }
        tree
    }

    #[test]
    fn test_paths() {
        let tree = tree_with(&["music/rock/queen"]);
        let queen = tree.find_directory("music\\rock\\queen\\", ROOT).unwrap();
        assert_eq!(tree.path(queen), "music\\rock\\queen\\");
        assert_eq!(tree.adc_path(queen), "/music/rock/queen/");
        assert_eq!(to_nmdc("/music/rock/"), "music\\rock\\");
    }

    #[test]
    fn test_total_size_uses_partial_for_incomplete() {
        let mut tree = ListingTree::new();
        let dir = tree.add_dir(ROOT, ListingDir::new("a", false));
        tree.node_mut(dir).partial_size = 500;
        tree.node_mut(ROOT).complete = true;
        assert_eq!(tree.total_size(dir, false), 500);

        tree.node_mut(dir).complete = true;
        tree.node_mut(dir).files.push(file("x", 123, 1, DupeState::None));
        assert_eq!(tree.total_size(dir, false), 123);
    }

    #[test]
    fn test_filter_list_subtracts_and_prunes() {
        let mut tree = ListingTree::new();
        let a = tree.add_dir(ROOT, ListingDir::new("a", true));
        tree.node_mut(a).files.push(file("x", 10, 1, DupeState::None));
        tree.node_mut(a).files.push(file("y", 20, 2, DupeState::None));
        let b = tree.add_dir(ROOT, ListingDir::new("b", true));
        tree.node_mut(b).files.push(file("z", 30, 3, DupeState::None));

        let mut other = HashSet::new();
        other.insert(Tth([3; 24]));
        tree.filter_list(ROOT, &other, 0);

        // b lost its only file and was pruned.
        assert!(tree.find_child(ROOT, "b").is_none());
        assert_eq!(tree.node(a).files.len(), 2);
    }

    #[test]
    fn test_skip_subtract_advances_over_kept_files() {
        let mut tree = ListingTree::new();
        let a = tree.add_dir(ROOT, ListingDir::new("a", true));
        tree.node_mut(a).files.push(file("small", 100, 1, DupeState::None));

        // 1 file left, threshold 1 KiB: the small file goes too.
        tree.filter_list(ROOT, &HashSet::new(), 1);
        assert!(tree.find_child(ROOT, "a").is_none() || tree.node(a).files.is_empty());
    }

    #[test]
    fn test_dupe_all_shared_files() {
        let mut tree = ListingTree::new();
        let a = tree.add_dir(ROOT, ListingDir::new("a", true));
        tree.node_mut(a).files.push(file("x", 1, 1, DupeState::Share));
        tree.node_mut(a).files.push(file("y", 1, 2, DupeState::Share));

        tree.check_share_dupes(a);
        assert_eq!(tree.node(a).dupe, DupeState::Share);
    }

    #[test]
    fn test_dupe_mixed_becomes_partial() {
        let mut tree = ListingTree::new();
        let a = tree.add_dir(ROOT, ListingDir::new("a", true));
        tree.node_mut(a).files.push(file("x", 1, 1, DupeState::Share));
        tree.node_mut(a).files.push(file("y", 1, 2, DupeState::None));

        tree.check_share_dupes(a);
        assert_eq!(tree.node(a).dupe, DupeState::PartialShare);
    }

    #[test]
    fn test_dupe_share_and_queue_mix() {
        let mut tree = ListingTree::new();
        let a = tree.add_dir(ROOT, ListingDir::new("a", true));
        tree.node_mut(a).files.push(file("x", 1, 1, DupeState::Share));
        tree.node_mut(a).files.push(file("y", 1, 2, DupeState::Queue));

        tree.check_share_dupes(a);
        assert_eq!(tree.node(a).dupe, DupeState::ShareQueue);
    }

    #[test]
    fn test_dupe_is_order_independent() {
        for order in [[DupeState::Share, DupeState::None], [DupeState::None, DupeState::Share]] {
            let mut tree = ListingTree::new();
            let a = tree.add_dir(ROOT, ListingDir::new("a", true));
            for (i, dupe) in order.iter().enumerate() {
                tree.node_mut(a)
                    .files
                    .push(file(&format!("f{i}"), 1, i as u8 + 1, *dupe));
            }
            tree.check_share_dupes(a);
            assert_eq!(tree.node(a).dupe, DupeState::PartialShare);
        }
    }

    #[test]
    fn test_dupe_ignores_zero_byte_files() {
        let mut tree = ListingTree::new();
        let a = tree.add_dir(ROOT, ListingDir::new("a", true));
        tree.node_mut(a).files.push(file("x", 1, 1, DupeState::Share));
        tree.node_mut(a).files.push(file("pad", 0, 2, DupeState::None));

        tree.check_share_dupes(a);
        assert_eq!(tree.node(a).dupe, DupeState::Share);
    }

    #[test]
    fn test_dupe_directory_inherits_from_children() {
        let mut tree = ListingTree::new();
        let a = tree.add_dir(ROOT, ListingDir::new("a", true));
        let b = tree.add_dir(a, ListingDir::new("b", true));
        tree.node_mut(b).files.push(file("x", 1, 1, DupeState::Share));

        tree.check_share_dupes(a);
        assert_eq!(tree.node(a).dupe, DupeState::Share);
    }

    #[test]
    fn test_clear_adls() {
        let mut tree = ListingTree::new();
        let real = tree.add_dir(ROOT, ListingDir::new("real", true));
        let mut synth = ListingDir::new("ADLSearch", true);
        synth.adls = true;
        tree.add_dir(ROOT, synth);

        tree.clear_adls();
        assert_eq!(tree.node(ROOT).children, vec![real]);
    }

    #[test]
    fn test_clone_subtree_marks_adls() {
        let mut tree = tree_with(&["show/season.1"]);
        let src = tree.find_directory("show\\", ROOT).unwrap();
        let dest = tree.add_dir(ROOT, ListingDir::new("matches", true));

        let copy = tree.clone_subtree(src, dest);
        assert!(tree.node(copy).adls);
        let season = tree.find_child(copy, "season.1").unwrap();
        assert!(tree.node(season).adls);
        // Source untouched.
        assert!(!tree.node(src).adls);
    }

    #[test]
    fn test_direct_search_emits_parent_path() {
        let mut tree = tree_with(&["music/my.album/cd1"]);
        tree.node_mut(ROOT).complete = true;

        let query = AdcQuery::parse("my.album", &[]);
        let mut results = Vec::new();
        tree.direct_search(ROOT, &query, 50, &mut results);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, "/music/");
    }
}
