//! Streaming catalog reader.
//!
//! Consumes a `FileListing` document event by event and builds or
//! merges the listing tree. In update mode the `Base` path is walked
//! (and created) from the root; a visited cache makes repeated
//! partial deliveries O(1), and merging into an already-populated
//! subtree falls back to linear child scans so nothing is duplicated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use skiff_types::{DirShareState, DupeState, QueueBridge, ShareLookup, Tth};

use crate::tree::{ListingDir, ListingFile, ListingTree, NodeId, ROOT};
use crate::{ListingError, Result};

/// Duplicate annotators; either may be absent.
#[derive(Clone, Copy, Default)]
pub struct DupeCheck<'a> {
    pub share: Option<&'a dyn ShareLookup>,
    pub queue: Option<&'a dyn QueueBridge>,
}

impl DupeCheck<'_> {
    fn file_dupe(&self, tth: &Tth, name: &str) -> DupeState {
        if let Some(share) = self.share {
            if share.is_file_shared(tth, name) {
                return DupeState::Share;
            }
        }
        if let Some(queue) = self.queue {
            if queue.is_queued(tth) {
                return DupeState::Queue;
            }
        }
        DupeState::None
    }

    fn dir_dupe(&self, path: &str, size: i64) -> DupeState {
        match self.share.map(|s| s.dir_share_state(path, size)) {
            Some(DirShareState::Full) => DupeState::Share,
            Some(DirShareState::Partial) => DupeState::PartialShare,
            _ => DupeState::None,
        }
    }
}

/// One parse run over a catalog document.
pub struct ListLoader<'a> {
    tree: &'a mut ListingTree,
    /// Directories created by base walks this session.
    visited: &'a mut HashMap<String, NodeId>,
    updating: bool,
    partial_list: bool,
    check_dupe: bool,
    dupes: DupeCheck<'a>,
    abort: &'a AtomicBool,

    cur: NodeId,
    base: String,
    in_listing: bool,
    use_cache: bool,
}

impl<'a> ListLoader<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tree: &'a mut ListingTree,
        visited: &'a mut HashMap<String, NodeId>,
        updating: bool,
        partial_list: bool,
        check_dupe: bool,
        dupes: DupeCheck<'a>,
        abort: &'a AtomicBool,
    ) -> Self {
        Self {
            tree,
            visited,
            updating,
            partial_list,
            check_dupe,
            dupes,
            abort,
            cur: ROOT,
            base: "/".to_string(),
            in_listing: false,
            use_cache: true,
        }
    }

    /// Run the parse; returns the document's base path. A parse error
    /// leaves everything built so far in the tree.
    pub fn parse(mut self, xml: &str) -> Result<String> {
        let mut reader = Reader::from_str(xml.trim_start_matches('\u{feff}'));
        loop {
            let event = reader
                .read_event()
                .map_err(|e| ListingError::Parse(e.to_string()))?;
            match event {
                Event::Start(el) => {
                    self.start_tag(&el, false)?;
                }
                Event::Empty(el) => {
                    self.start_tag(&el, true)?;
                }
                Event::End(el) => self.end_tag(el.name().as_ref()),
                Event::Eof => break,
                _ => {}
            }
        }
        Ok(self.base)
    }

    fn attr(el: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>> {
        for attr in el.attributes().flatten() {
            if attr.key.as_ref() == name {
                let value = attr
                    .unescape_value()
                    .map_err(|e| ListingError::Parse(e.to_string()))?;
                return Ok(Some(value.into_owned()));
            }
        }
        Ok(None)
    }

    fn start_tag(&mut self, el: &BytesStart<'_>, self_closing: bool) -> Result<()> {
        if self.abort.load(Ordering::Acquire) {
            return Err(ListingError::Aborted);
        }

        if self.in_listing {
            match el.name().as_ref() {
                b"File" => self.file_tag(el)?,
                b"Directory" => {
                    self.directory_tag(el)?;
                    if self_closing {
                        self.end_tag(b"Directory");
                    }
                }
                _ => {}
            }
        } else if el.name().as_ref() == b"FileListing" {
            self.listing_tag(el)?;
            if self_closing {
                self.end_tag(b"FileListing");
            }
        }
        Ok(())
    }

    fn end_tag(&mut self, name: &[u8]) {
        if !self.in_listing {
            return;
        }
        match name {
            b"Directory" => {
                if let Some(parent) = self.tree.node(self.cur).parent {
                    self.cur = parent;
                }
            }
            b"FileListing" => {
                self.in_listing = false;
            }
            _ => {}
        }
    }

    fn listing_tag(&mut self, el: &BytesStart<'_>) -> Result<()> {
        if self.updating {
            if let Some(base) = Self::attr(el, b"Base")? {
                if base.starts_with('/') && base.ends_with('/') {
                    self.base = base;
                }
            }
            let date = Self::attr(el, b"BaseDate")?
                .and_then(|d| d.parse().ok())
                .unwrap_or(0);

            // Walk (and create) the base path from the root.
            let base = self.base.clone();
            for segment in base.split('/').filter(|s| !s.is_empty()) {
                match self.tree.find_child(self.cur, segment) {
                    Some(child) => self.cur = child,
                    None => {
                        let node = ListingDir::new(segment, false);
                        let id = self.tree.add_dir(self.cur, node);
                        self.visited.insert(segment.to_string(), id);
                        self.cur = id;
                    }
                }
            }

            // Merging into a subtree that already has entries: cached
            // ids cannot be trusted, fall back to child scans.
            let node = self.tree.node(self.cur);
            if !node.children.is_empty() || !node.files.is_empty() {
                self.use_cache = false;
            }

            self.tree.node_mut(self.cur).date = date;
        }

        self.tree.node_mut(self.cur).complete = true;
        self.in_listing = true;
        Ok(())
    }

    fn directory_tag(&mut self, el: &BytesStart<'_>) -> Result<()> {
        let name = Self::attr(el, b"Name")?
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ListingError::Parse("Directory missing name attribute".into()))?;
        let incomplete = Self::attr(el, b"Incomplete")?.as_deref() == Some("1");
        let size: i64 = Self::attr(el, b"Size")?
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let date: u32 = Self::attr(el, b"Date")?
            .and_then(|d| d.parse().ok())
            .unwrap_or(0);

        let mut found = None;
        if self.updating {
            found = if self.use_cache {
                self.visited.get(&name).copied()
            } else {
                // Slow, but only needed when re-merging.
                self.tree.find_child(self.cur, &name)
            };
        }

        match found {
            Some(id) => {
                let node = self.tree.node_mut(id);
                if !node.complete {
                    node.complete = !incomplete;
                }
                node.date = date;
                self.cur = id;
            }
            None => {
                let mut node = ListingDir::new(&name, !incomplete);
                node.partial_size = size;
                node.date = date;
                let id = self.tree.add_dir(self.cur, node);
                if self.partial_list && self.check_dupe {
                    let path = self.tree.path(id);
                    self.tree.node_mut(id).dupe = self.dupes.dir_dupe(&path, size);
                }
                self.cur = id;
            }
        }
        Ok(())
    }

    fn file_tag(&mut self, el: &BytesStart<'_>) -> Result<()> {
        let Some(name) = Self::attr(el, b"Name")?.filter(|n| !n.is_empty()) else {
            return Ok(());
        };
        let Some(size) = Self::attr(el, b"Size")?.and_then(|s| s.parse::<i64>().ok()) else {
            return Ok(());
        };
        let Some(tth) = Self::attr(el, b"TTH")?.and_then(|h| Tth::from_base32(&h).ok()) else {
            return Ok(());
        };

        if self.updating && !self.use_cache {
            // Update the current file in place when it is already
            // there.
            let node = self.tree.node_mut(self.cur);
            if let Some(file) = node
                .files
                .iter_mut()
                .find(|f| f.tth == tth || f.name == name)
            {
                file.name = name;
                file.size = size;
                file.tth = tth;
                return Ok(());
            }
        }

        let dupe = if self.check_dupe && size > 0 {
            self.dupes.file_dupe(&tth, &name)
        } else {
            DupeState::None
        };
        self.tree.node_mut(self.cur).files.push(ListingFile {
            name,
            size,
            tth,
            adls: false,
            dupe,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tth_text(byte: u8) -> String {
        Tth([byte; 24]).to_base32()
    }

    fn parse_into(
        tree: &mut ListingTree,
        visited: &mut HashMap<String, NodeId>,
        updating: bool,
        xml: &str,
    ) -> Result<String> {
        let abort = AtomicBool::new(false);
        ListLoader::new(
            tree,
            visited,
            updating,
            true,
            false,
            DupeCheck::default(),
            &abort,
        )
        .parse(xml)
    }

    #[test]
    fn test_full_listing_parse() {
        let xml = format!(
            r#"<?xml version="1.0" encoding="utf-8" standalone="yes"?>
<FileListing Version="1" CID="{cid}" Base="/" Generator="test">
    <Directory Name="music" Date="100">
        <File Name="song.mp3" Size="10" TTH="{t1}"/>
    </Directory>
</FileListing>"#,
            cid = tth_text(9),
            t1 = tth_text(1),
        );

        let mut tree = ListingTree::new();
        let mut visited = HashMap::new();
        let base = parse_into(&mut tree, &mut visited, false, &xml).unwrap();
        assert_eq!(base, "/");

        let music = tree.find_child(ROOT, "music").unwrap();
        assert!(tree.node(ROOT).complete);
        assert_eq!(tree.node(music).files.len(), 1);
        assert_eq!(tree.node(music).files[0].size, 10);
    }

    #[test]
    fn test_partial_merge_completes_directory() {
        // First delivery announces an incomplete subdirectory.
        let first = format!(
            r#"<FileListing Version="1" CID="{cid}" Base="/music/rock/" Generator="t">
    <Directory Name="queen" Incomplete="1" Size="500"/>
</FileListing>"#,
            cid = tth_text(9),
        );
        // Second delivery fills it in.
        let second = format!(
            r#"<FileListing Version="1" CID="{cid}" Base="/music/rock/queen/" Generator="t">
    <File Name="one.mp3" Size="300" TTH="{t1}"/>
    <File Name="two.mp3" Size="200" TTH="{t2}"/>
</FileListing>"#,
            cid = tth_text(9),
            t1 = tth_text(1),
            t2 = tth_text(2),
        );

        let mut tree = ListingTree::new();
        let mut visited = HashMap::new();
        let base = parse_into(&mut tree, &mut visited, true, &first).unwrap();
        assert_eq!(base, "/music/rock/");

        let queen = tree.find_directory("music\\rock\\queen\\", ROOT).unwrap();
        assert!(!tree.node(queen).complete);
        assert_eq!(tree.node(queen).partial_size, 500);

        let base = parse_into(&mut tree, &mut visited, true, &second).unwrap();
        assert_eq!(base, "/music/rock/queen/");
        assert!(tree.node(queen).complete);
        assert_eq!(tree.node(queen).files.len(), 2);
        assert_eq!(tree.total_size(queen, false), 500);
    }

    #[test]
    fn test_remerge_updates_in_place() {
        let chunk = format!(
            r#"<FileListing Version="1" CID="{cid}" Base="/a/" Generator="t">
    <File Name="x.bin" Size="10" TTH="{t1}"/>
</FileListing>"#,
            cid = tth_text(9),
            t1 = tth_text(1),
        );
        let again = format!(
            r#"<FileListing Version="1" CID="{cid}" Base="/a/" Generator="t">
    <File Name="x.bin" Size="25" TTH="{t1}"/>
</FileListing>"#,
            cid = tth_text(9),
            t1 = tth_text(1),
        );

        let mut tree = ListingTree::new();
        let mut visited = HashMap::new();
        parse_into(&mut tree, &mut visited, true, &chunk).unwrap();
        parse_into(&mut tree, &mut visited, true, &again).unwrap();

        let a = tree.find_child(ROOT, "a").unwrap();
        assert_eq!(tree.node(a).files.len(), 1);
        assert_eq!(tree.node(a).files[0].size, 25);
    }

    #[test]
    fn test_abort_is_raised() {
        let xml = r#"<FileListing Version="1" Base="/" Generator="t"><Directory Name="x"/></FileListing>"#;
        let mut tree = ListingTree::new();
        let mut visited = HashMap::new();
        let abort = AtomicBool::new(true);
        let result = ListLoader::new(
            &mut tree,
            &mut visited,
            false,
            false,
            false,
            DupeCheck::default(),
            &abort,
        )
        .parse(xml);
        assert!(matches!(result, Err(ListingError::Aborted)));
    }

    #[test]
    fn test_parse_error_keeps_partial_tree() {
        let xml = format!(
            r#"<FileListing Version="1" Base="/" Generator="t">
    <Directory Name="kept">
        <File Name="a" Size="1" TTH="{t1}"/>
    </Directory>
    <Directory></FileListing"#,
            t1 = tth_text(1),
        );
        let mut tree = ListingTree::new();
        let mut visited = HashMap::new();
        let result = parse_into(&mut tree, &mut visited, false, &xml);
        assert!(result.is_err());
        // What arrived before the error is still there.
        assert!(tree.find_child(ROOT, "kept").is_some());
    }

    #[test]
    fn test_missing_directory_name_is_an_error() {
        let xml = r#"<FileListing Version="1" Base="/" Generator="t"><Directory Incomplete="1"/></FileListing>"#;
        let mut tree = ListingTree::new();
        let mut visited = HashMap::new();
        assert!(matches!(
            parse_into(&mut tree, &mut visited, false, xml),
            Err(ListingError::Parse(_))
        ));
    }
}
