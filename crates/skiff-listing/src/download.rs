//! Download planning.
//!
//! Turns a remote subtree into bundle submissions. A directory that
//! only groups release directories is split into one bundle per
//! release; otherwise the subtree becomes a single bundle, walked in
//! name order, with per-file failures swallowed so partial bundles
//! still go through.

use chrono::{Datelike, Local, TimeZone, Timelike};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use skiff_config::ListingSettings;
use skiff_types::{BundleSpec, Priority, QueueBridge, RemoteUser};

use crate::tree::{ListingTree, NodeId, ROOT};
use crate::Result;

// Scene-style release names: a dotted/dashed title followed by a
// year, resolution, source or codec tag.
static RELEASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^[\w.\-&!'()\[\] ]+[.\-_]((19|20)\d{2}|(480|720|1080|2160)[ip]|dvdrip|bdrip|webrip|web[.\-_]?dl|bluray|hdtv|x26[45]|h26[45]|xvid|divx|flac|mp3|proper|repack|limited|internal)([.\-_][\w.\-&!'()\[\]]+)*$",
    )
    .expect("static release pattern")
});

/// Does this directory name look like a scene release?
pub fn is_release_name(name: &str) -> bool {
    name.chars().any(|c| c.is_alphabetic()) && RELEASE.is_match(name)
}

/// Substitute `%Y %m %d %H %M %S` in a target template from a Unix
/// timestamp.
pub fn format_time(template: &str, timestamp: i64) -> String {
    let time = match Local.timestamp_opt(timestamp, 0) {
        chrono::LocalResult::Single(t) | chrono::LocalResult::Ambiguous(t, _) => t,
        chrono::LocalResult::None => return template.to_string(),
    };
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('Y') => out.push_str(&format!("{:04}", time.year())),
            Some('m') => out.push_str(&format!("{:02}", time.month())),
            Some('d') => out.push_str(&format!("{:02}", time.day())),
            Some('H') => out.push_str(&format!("{:02}", time.hour())),
            Some('M') => out.push_str(&format!("{:02}", time.minute())),
            Some('S') => out.push_str(&format!("{:02}", time.second())),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

// Characters the local filesystem will not accept in a target.
fn validate_target(target: &str) -> String {
    target.replace(['<', '>', ':', '"', '|', '?', '*'], "_")
}

/// Plan downloads for a remote subtree.
#[allow(clippy::too_many_arguments)]
pub fn download_directory(
    tree: &ListingTree,
    dir: NodeId,
    listing_partial: bool,
    user: &RemoteUser,
    queue: &dyn QueueBridge,
    target: &str,
    priority: Priority,
    recursive_list: bool,
    settings: &ListingSettings,
) -> Result<()> {
    // A partial listing with holes below: hand the path to the
    // directory-download manager, which will ask the user and fetch
    // the rest. A recursive partial should not have holes, so the
    // peer likely ignored the recursion flag; retry without it.
    if listing_partial && tree.find_incomplete(dir) {
        queue.add_directory_download(
            &tree.adc_path(dir),
            user,
            target,
            priority,
            recursive_list,
        );
        return Ok(());
    }

    let node = tree.node(dir);
    let date = node.date;
    let with_name = if dir == ROOT {
        target.to_string()
    } else {
        format!("{}{}/", target, node.name)
    };
    let timestamp = if settings.format_dir_remote_time && date > 0 {
        date as i64
    } else {
        Local::now().timestamp()
    };
    let effective = validate_target(&format_time(&with_name, timestamp));

    // A release parent groups per-release directories; each becomes
    // its own bundle.
    let children = &node.children;
    let is_release_parent = !is_release_name(&node.name)
        && node.files.is_empty()
        && !children.is_empty()
        && children
            .iter()
            .all(|c| is_release_name(&tree.node(*c).name));
    if is_release_parent {
        for child in sorted_children(tree, dir) {
            let child_target = format!("{}{}/", effective, tree.node(child).name);
            let bundle = queue.create_bundle(BundleSpec {
                target: child_target.clone(),
                priority,
                date: tree.node(child).date,
            });
            add_subtree(tree, child, &child_target, bundle, user, queue);
            queue.submit_bundle(bundle);
        }
        return Ok(());
    }

    let bundle = queue.create_bundle(BundleSpec {
        target: effective.clone(),
        priority,
        date,
    });
    add_subtree(tree, dir, &effective, bundle, user, queue);
    queue.submit_bundle(bundle);
    Ok(())
}

fn sorted_children(tree: &ListingTree, dir: NodeId) -> Vec<NodeId> {
    let mut children = tree.node(dir).children.clone();
    children.sort_by(|a, b| tree.node(*a).name.cmp(&tree.node(*b).name));
    children
}

/// Walk one bundle's subtree: directories first in name order, then
/// files in name order. Individual failures are logged and skipped.
fn add_subtree(
    tree: &ListingTree,
    dir: NodeId,
    target: &str,
    bundle: skiff_types::BundleId,
    user: &RemoteUser,
    queue: &dyn QueueBridge,
) {
    for child in sorted_children(tree, dir) {
        let child_target = format!("{}{}/", target, tree.node(child).name);
        add_subtree(tree, child, &child_target, bundle, user, queue);
    }

    let mut files: Vec<&crate::tree::ListingFile> = tree.node(dir).files.iter().collect();
    files.sort_by(|a, b| a.name.cmp(&b.name));
    for file in files {
        let file_target = format!("{}{}", target, file.name);
        if let Err(e) = queue.add_file(bundle, &file_target, file.size, &file.tth, user) {
            // Let the rest of the bundle proceed.
            debug!(file = %file_target, error = %e, "Queue rejected file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{ListingDir, ListingFile};
    use skiff_types::{BundleId, DupeState, MatchResult, QueueError, Tth};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingQueue {
        bundles: Mutex<Vec<BundleSpec>>,
        files: Mutex<Vec<(u64, String)>>,
        submitted: Mutex<Vec<u64>>,
        dir_downloads: Mutex<Vec<(String, bool)>>,
        fail_targets: Vec<String>,
    }

    impl QueueBridge for RecordingQueue {
        fn forbidden_paths(&self, _roots: &[String]) -> Vec<String> {
            Vec::new()
        }

        fn is_queued(&self, _tth: &Tth) -> bool {
            false
        }

        fn create_bundle(&self, spec: BundleSpec) -> BundleId {
            let mut bundles = self.bundles.lock().unwrap();
            bundles.push(spec);
            BundleId(bundles.len() as u64 - 1)
        }

        fn add_file(
            &self,
            bundle: BundleId,
            target: &str,
            _size: i64,
            _tth: &Tth,
            _user: &RemoteUser,
        ) -> std::result::Result<(), QueueError> {
            if self.fail_targets.iter().any(|f| target.ends_with(f)) {
                return Err(QueueError::Rejected(target.to_string()));
            }
            self.files.lock().unwrap().push((bundle.0, target.to_string()));
            Ok(())
        }

        fn submit_bundle(&self, bundle: BundleId) {
            self.submitted.lock().unwrap().push(bundle.0);
        }

        fn add_directory_download(
            &self,
            dir: &str,
            _user: &RemoteUser,
            _target: &str,
            _priority: Priority,
            retry_without_recursion: bool,
        ) {
            self.dir_downloads
                .lock()
                .unwrap()
                .push((dir.to_string(), retry_without_recursion));
        }

        fn request_partial_list(&self, _user: &RemoteUser, _dir: &str) {}

        fn match_listing(
            &self,
            _user: &RemoteUser,
            _files: &[(String, i64, Tth)],
        ) -> MatchResult {
            MatchResult::default()
        }
    }

    fn user() -> RemoteUser {
        RemoteUser {
            cid: skiff_types::Cid([5; 24]),
            nick: "peer".to_string(),
            hub_hint: String::new(),
        }
    }

    fn file(name: &str, size: i64) -> ListingFile {
        ListingFile {
            name: name.to_string(),
            size,
            tth: Tth([2; 24]),
            adls: false,
            dupe: DupeState::None,
        }
    }

    #[test]
    fn test_release_name_detection() {
        assert!(is_release_name("alpha.release.1080p"));
        assert!(is_release_name("beta.release.720p"));
        assert!(is_release_name("Some.Show.2019.WEB-DL"));
        assert!(!is_release_name("downloads"));
        assert!(!is_release_name("my.album.cd1"));
        assert!(!is_release_name("1234.5678")); // no letters
    }

    #[test]
    fn test_format_time() {
        // 2020-06-15 in every timezone east of -10h; only check the
        // stable parts.
        let out = format_time("/dl/%Y/x%q", 1592222400);
        assert!(out.starts_with("/dl/2020/"));
        assert!(out.ends_with("x%q")); // unknown specifiers pass through
    }

    #[test]
    fn test_release_parent_splits_bundles() {
        let mut tree = ListingTree::new();
        tree.node_mut(crate::tree::ROOT).complete = true;
        let parent = tree.add_dir(crate::tree::ROOT, ListingDir::new("stuff", true));
        let a = tree.add_dir(parent, ListingDir::new("alpha.release.1080p", true));
        tree.node_mut(a).files.push(file("a.mkv", 100));
        let b = tree.add_dir(parent, ListingDir::new("beta.release.720p", true));
        tree.node_mut(b).files.push(file("b.mkv", 100));

        let queue = RecordingQueue::default();
        download_directory(
            &tree,
            parent,
            false,
            &user(),
            &queue,
            "/dl/",
            Priority::Default,
            false,
            &ListingSettings::default(),
        )
        .unwrap();

        let bundles = queue.bundles.lock().unwrap();
        assert_eq!(bundles.len(), 2);
        assert!(bundles[0].target.contains("alpha.release.1080p"));
        assert!(bundles[1].target.contains("beta.release.720p"));
        assert_eq!(queue.submitted.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_single_bundle_walks_in_name_order() {
        let mut tree = ListingTree::new();
        tree.node_mut(crate::tree::ROOT).complete = true;
        let dir = tree.add_dir(crate::tree::ROOT, ListingDir::new("album", true));
        tree.node_mut(dir).files.push(file("02-second.mp3", 1));
        tree.node_mut(dir).files.push(file("01-first.mp3", 1));

        let queue = RecordingQueue::default();
        download_directory(
            &tree,
            dir,
            false,
            &user(),
            &queue,
            "/dl/",
            Priority::High,
            false,
            &ListingSettings::default(),
        )
        .unwrap();

        assert_eq!(queue.bundles.lock().unwrap().len(), 1);
        let files = queue.files.lock().unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].1.ends_with("01-first.mp3"));
        assert!(files[1].1.ends_with("02-second.mp3"));
        assert_eq!(queue.submitted.lock().unwrap().as_slice(), &[0]);
    }

    #[test]
    fn test_file_failures_are_swallowed() {
        let mut tree = ListingTree::new();
        tree.node_mut(crate::tree::ROOT).complete = true;
        let dir = tree.add_dir(crate::tree::ROOT, ListingDir::new("album", true));
        tree.node_mut(dir).files.push(file("bad.mp3", 1));
        tree.node_mut(dir).files.push(file("good.mp3", 1));

        let queue = RecordingQueue {
            fail_targets: vec!["bad.mp3".to_string()],
            ..RecordingQueue::default()
        };
        download_directory(
            &tree,
            dir,
            false,
            &user(),
            &queue,
            "/dl/",
            Priority::Default,
            false,
            &ListingSettings::default(),
        )
        .unwrap();

        let files = queue.files.lock().unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].1.ends_with("good.mp3"));
        assert_eq!(queue.submitted.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_incomplete_partial_delegates() {
        let mut tree = ListingTree::new();
        tree.node_mut(crate::tree::ROOT).complete = true;
        let dir = tree.add_dir(crate::tree::ROOT, ListingDir::new("browse", false));

        let queue = RecordingQueue::default();
        download_directory(
            &tree,
            dir,
            true,
            &user(),
            &queue,
            "/dl/",
            Priority::Default,
            true,
            &ListingSettings::default(),
        )
        .unwrap();

        assert!(queue.bundles.lock().unwrap().is_empty());
        let delegated = queue.dir_downloads.lock().unwrap();
        assert_eq!(delegated.len(), 1);
        assert_eq!(delegated[0], ("/browse/".to_string(), true));
    }
}
