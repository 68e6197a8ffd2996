//! Auto-download rules.
//!
//! Rules are pattern-matched against a loaded listing; every match is
//! cloned into a synthetic subtree under the listing root so the user
//! can review and queue them in one place. The synthetic entries are
//! flagged and skipped by the non-adl size aggregates.

use regex::Regex;
use tracing::warn;

use skiff_types::wildcard_to_regex;

use crate::tree::{ListingDir, ListingTree, NodeId, ROOT};

/// What a rule's pattern is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdlSourceKind {
    #[default]
    Filename,
    Directory,
    FullPath,
}

/// One auto-download rule.
#[derive(Debug, Clone)]
pub struct AdlRule {
    pub pattern: String,
    pub is_regex: bool,
    pub source: AdlSourceKind,
    /// Bounds in bytes; negative means unbounded.
    pub min_size: i64,
    pub max_size: i64,
    /// Name of the synthetic directory collecting the matches.
    pub dest_dir: String,
    pub is_active: bool,
}

impl Default for AdlRule {
    fn default() -> Self {
        Self {
            pattern: String::new(),
            is_regex: false,
            source: AdlSourceKind::Filename,
            min_size: -1,
            max_size: -1,
            dest_dir: "ADLSearch".to_string(),
            is_active: true,
        }
    }
}

struct CompiledRule {
    regex: Regex,
    source: AdlSourceKind,
    min_size: i64,
    max_size: i64,
    dest_dir: String,
}

impl CompiledRule {
    fn size_ok(&self, size: i64) -> bool {
        (self.min_size < 0 || size >= self.min_size)
            && (self.max_size < 0 || size <= self.max_size)
    }
}

/// The rule set, compiled once per listing scan.
pub struct AdlMatcher {
    rules: Vec<CompiledRule>,
}

impl AdlMatcher {
    /// Compile active rules; broken patterns are dropped with a
    /// warning.
    pub fn new(rules: &[AdlRule]) -> Self {
        let mut compiled = Vec::new();
        for rule in rules.iter().filter(|r| r.is_active && !r.pattern.is_empty()) {
            let source = if rule.is_regex {
                format!("(?i){}", rule.pattern)
            } else {
                wildcard_to_regex(&rule.pattern)
            };
            match Regex::new(&source) {
                Ok(regex) => compiled.push(CompiledRule {
                    regex,
                    source: rule.source,
                    min_size: rule.min_size,
                    max_size: rule.max_size,
                    dest_dir: rule.dest_dir.clone(),
                }),
                Err(e) => warn!(pattern = %rule.pattern, error = %e, "Invalid ADL pattern"),
            }
        }
        Self { rules: compiled }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Scan the listing and clone every match under its rule's
    /// destination directory on the root.
    pub fn match_listing(&self, tree: &mut ListingTree) {
        if self.rules.is_empty() {
            return;
        }

        // One synthetic destination per rule, created on demand.
        let mut dests: Vec<Option<NodeId>> = vec![None; self.rules.len()];
        let children = tree.node(ROOT).children.clone();
        for child in children {
            if tree.node(child).adls {
                continue;
            }
            self.scan_dir(tree, child, &mut dests);
        }
    }

    fn dest_for(
        &self,
        tree: &mut ListingTree,
        dests: &mut [Option<NodeId>],
        rule: usize,
    ) -> NodeId {
        if let Some(id) = dests[rule] {
            return id;
        }
        let mut node = ListingDir::new(&self.rules[rule].dest_dir, true);
        node.adls = true;
        let id = tree.add_dir(ROOT, node);
        dests[rule] = Some(id);
        id
    }

    fn scan_dir(&self, tree: &mut ListingTree, id: NodeId, dests: &mut [Option<NodeId>]) {
        let dir_path = tree.path(id);
        let dir_name = tree.node(id).name.clone();

        for (ri, rule) in self.rules.iter().enumerate() {
            if rule.source == AdlSourceKind::Directory && rule.regex.is_match(&dir_name) {
                let dest = self.dest_for(tree, dests, ri);
                tree.clone_subtree(id, dest);
            }
        }

        for fi in 0..tree.node(id).files.len() {
            let (name, size) = {
                let file = &tree.node(id).files[fi];
                (file.name.clone(), file.size)
            };
            for (ri, rule) in self.rules.iter().enumerate() {
                let matched = match rule.source {
                    AdlSourceKind::Filename => rule.regex.is_match(&name),
                    AdlSourceKind::FullPath => {
                        rule.regex.is_match(&format!("{dir_path}{name}"))
                    }
                    AdlSourceKind::Directory => false,
                };
                if matched && rule.size_ok(size) {
                    let dest = self.dest_for(tree, dests, ri);
                    let mut copy = tree.node(id).files[fi].clone();
                    copy.adls = true;
                    tree.node_mut(dest).files.push(copy);
                    break;
                }
            }
        }

        let children = tree.node(id).children.clone();
        for child in children {
            self.scan_dir(tree, child, dests);
        }
    }
}
