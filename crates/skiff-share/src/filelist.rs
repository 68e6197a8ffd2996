//! Catalog documents.
//!
//! Full and partial file lists (bzip2-compressed XML served to
//! peers), TTH lists for partial-list diffing, the on-disk share
//! cache, and the profile descriptor. Generation snapshots the tree
//! under the reader lock and does compression and disk I/O off the
//! lock.

use std::io::Write as _;
use std::path::PathBuf;

use bzip2::write::BzEncoder;
use bzip2::Compression;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use tracing::warn;

use crate::index::ShareIndex;
use crate::profiles::{
    validate_virtual, ProfileDir, ProfileId, ShareProfile, PROFILE_DEFAULT, PROFILE_HIDDEN,
};
use crate::state::{last_dir, normalize_dir_path, ShareState};
use crate::tree::{DirId, DirNode, DirRef, FileNode, RootTree};
use crate::{Result, ShareError};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

type XmlWriter<'a> = Writer<&'a mut Vec<u8>>;

fn start_doc(buf: &mut Vec<u8>) -> Result<XmlWriter<'_>> {
    buf.extend_from_slice(UTF8_BOM);
    let mut writer = Writer::new_with_indent(buf, b'\t', 1);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), Some("yes"))))?;
    Ok(writer)
}

fn emit_files(writer: &mut XmlWriter<'_>, state: &ShareState, dref: DirRef) -> Result<()> {
    for file in &state.dir(dref).files {
        let mut el = BytesStart::new("File");
        el.push_attribute(("Name", file.name.as_str()));
        el.push_attribute(("Size", file.size.to_string().as_str()));
        el.push_attribute(("TTH", file.tth.to_base32().as_str()));
        writer.write_event(Event::Empty(el))?;
    }
    Ok(())
}

/// Children and files of `dref`, without an element of its own. Used
/// when several real roots merge under one virtual directory.
fn emit_dir_contents(
    writer: &mut XmlWriter<'_>,
    state: &ShareState,
    dref: DirRef,
    profile: ProfileId,
) -> Result<()> {
    let node = state.dir(dref);
    for child in node.children.values() {
        let cref = DirRef {
            root: dref.root,
            dir: *child,
        };
        if state.is_level_excluded(cref, profile) {
            continue;
        }
        emit_dir_tree(writer, state, cref, profile)?;
    }
    emit_files(writer, state, dref)
}

/// A full `<Directory>` subtree.
fn emit_dir_tree(
    writer: &mut XmlWriter<'_>,
    state: &ShareState,
    dref: DirRef,
    profile: ProfileId,
) -> Result<()> {
    let node = state.dir(dref);
    let mut el = BytesStart::new("Directory");
    el.push_attribute(("Name", state.virtual_name(dref, profile).as_str()));
    el.push_attribute(("Date", node.last_write.to_string().as_str()));
    writer.write_event(Event::Start(el))?;
    emit_dir_contents(writer, state, dref, profile)?;
    writer.write_event(Event::End(BytesEnd::new("Directory")))?;
    Ok(())
}

/// Roots visible to `profile`, grouped by virtual name, ancestors
/// deduplicated so nothing is emitted twice.
fn virtual_groups(
    state: &ShareState,
    profile: ProfileId,
) -> Vec<(String, u32, Vec<DirRef>)> {
    use std::collections::BTreeMap;

    let mut groups: BTreeMap<String, (String, Vec<DirRef>)> = BTreeMap::new();
    for (path, dref) in &state.roots {
        let Some(pd) = state.profile_dirs.get(path) else {
            continue;
        };
        let Some(vname) = pd.name_for(profile) else {
            continue;
        };
        let covered = state.roots.keys().any(|other| {
            crate::state::is_strict_sub(other, path)
                && state
                    .profile_dirs
                    .get(other)
                    .is_some_and(|pd| pd.has_profile(profile))
        });
        if covered {
            continue;
        }
        groups
            .entry(vname.to_lowercase())
            .or_insert_with(|| (vname.to_string(), Vec::new()))
            .1
            .push(*dref);
    }

    groups
        .into_values()
        .map(|(name, refs)| {
            let date = refs.iter().map(|r| state.dir(*r).last_write).max().unwrap_or(0);
            (name, date, refs)
        })
        .collect()
}

/// Immediate children of a result set, merged by name across the
/// candidate roots.
fn emit_partial_children(
    writer: &mut XmlWriter<'_>,
    state: &ShareState,
    refs: &[DirRef],
    profile: ProfileId,
    recurse: bool,
) -> Result<()> {
    use std::collections::BTreeMap;

    let mut groups: BTreeMap<String, (String, Vec<DirRef>)> = BTreeMap::new();
    for dref in refs {
        for child in state.dir(*dref).children.values() {
            let cref = DirRef {
                root: dref.root,
                dir: *child,
            };
            if state.is_level_excluded(cref, profile) {
                continue;
            }
            let name = state.virtual_name(cref, profile);
            groups
                .entry(name.to_lowercase())
                .or_insert_with(|| (name.clone(), Vec::new()))
                .1
                .push(cref);
        }
    }

    for (display, members) in groups.into_values() {
        let date = members
            .iter()
            .map(|m| state.dir(*m).last_write)
            .max()
            .unwrap_or(0);
        let mut el = BytesStart::new("Directory");
        el.push_attribute(("Name", display.as_str()));
        el.push_attribute(("Date", date.to_string().as_str()));

        if recurse {
            writer.write_event(Event::Start(el))?;
            for member in &members {
                emit_dir_contents(writer, state, *member, profile)?;
            }
            writer.write_event(Event::End(BytesEnd::new("Directory")))?;
        } else {
            let has_content = members.iter().any(|m| {
                let node = state.dir(*m);
                !node.children.is_empty() || !node.files.is_empty()
            });
            if has_content {
                let size: i64 = members.iter().map(|m| state.profile_size(*m, profile)).sum();
                el.push_attribute(("Incomplete", "1"));
                el.push_attribute(("Size", size.to_string().as_str()));
            }
            writer.write_event(Event::Empty(el))?;
        }
    }
    Ok(())
}

impl ShareIndex {
    fn listing_root(&self, base: &str, base_date: Option<u32>) -> BytesStart<'static> {
        let mut el = BytesStart::new("FileListing");
        el.push_attribute(("Version", "1"));
        el.push_attribute(("CID", self.cid.to_base32().as_str()));
        el.push_attribute(("Base", base));
        el.push_attribute(("Generator", self.settings.generator.as_str()));
        if let Some(date) = base_date {
            el.push_attribute(("BaseDate", date.to_string().as_str()));
        }
        el.to_owned()
    }

    /// Build the uncompressed full catalog for a profile.
    pub(crate) fn build_full_list(&self, profile: ProfileId) -> Result<Vec<u8>> {
        let state = self.state.read().unwrap();
        if state.profile(profile).is_none() {
            return Err(ShareError::FileNotAvailable);
        }

        let mut buf = Vec::new();
        {
            let mut writer = start_doc(&mut buf)?;
            writer.write_event(Event::Start(self.listing_root("/", None)))?;

            for (name, date, refs) in virtual_groups(&state, profile) {
                let mut el = BytesStart::new("Directory");
                el.push_attribute(("Name", name.as_str()));
                el.push_attribute(("Date", date.to_string().as_str()));
                writer.write_event(Event::Start(el))?;
                for dref in &refs {
                    emit_dir_contents(&mut writer, &state, *dref, profile)?;
                }
                writer.write_event(Event::End(BytesEnd::new("Directory")))?;
            }

            writer.write_event(Event::End(BytesEnd::new("FileListing")))?;
        }
        Ok(buf)
    }

    /// The catalog for one requested virtual directory: immediate
    /// children only unless `recurse`, sizes carried on incomplete
    /// entries so browsers can sort without fetching.
    pub fn generate_partial_list(
        &self,
        dir: &str,
        recurse: bool,
        profile: ProfileId,
    ) -> Result<String> {
        if !dir.starts_with('/') || !dir.ends_with('/') {
            return Err(ShareError::FileNotAvailable);
        }

        let state = self.state.read().unwrap();
        if state.profile(profile).is_none() {
            return Err(ShareError::FileNotAvailable);
        }

        let mut buf = Vec::new();
        {
            if dir == "/" {
                let mut writer = start_doc(&mut buf)?;
                writer.write_event(Event::Start(self.listing_root("/", None)))?;
                for (name, date, refs) in virtual_groups(&state, profile) {
                    let mut el = BytesStart::new("Directory");
                    el.push_attribute(("Name", name.as_str()));
                    el.push_attribute(("Date", date.to_string().as_str()));
                    if recurse {
                        writer.write_event(Event::Start(el))?;
                        for dref in &refs {
                            emit_dir_contents(&mut writer, &state, *dref, profile)?;
                        }
                        writer.write_event(Event::End(BytesEnd::new("Directory")))?;
                    } else {
                        let has_content = refs.iter().any(|r| {
                            let node = state.dir(*r);
                            !node.children.is_empty() || !node.files.is_empty()
                        });
                        if has_content {
                            let size: i64 =
                                refs.iter().map(|r| state.profile_size(*r, profile)).sum();
                            el.push_attribute(("Incomplete", "1"));
                            el.push_attribute(("Size", size.to_string().as_str()));
                        }
                        writer.write_event(Event::Empty(el))?;
                    }
                }
                writer.write_event(Event::End(BytesEnd::new("FileListing")))?;
            } else {
                let refs = state.find_virtuals(dir, profile)?;
                let base_date = refs.iter().map(|r| state.dir(*r).last_write).max();

                let mut writer = start_doc(&mut buf)?;
                writer.write_event(Event::Start(self.listing_root(dir, base_date)))?;
                emit_partial_children(&mut writer, &state, &refs, profile, recurse)?;
                for dref in &refs {
                    emit_files(&mut writer, &state, *dref)?;
                }
                writer.write_event(Event::End(BytesEnd::new("FileListing")))?;
            }
        }

        String::from_utf8(buf).map_err(|e| ShareError::CacheParse(e.to_string()))
    }

    /// Space-separated base32 hashes of a subtree, for list diffing.
    pub fn generate_tth_list(&self, dir: &str, recurse: bool, profile: ProfileId) -> Result<String> {
        if profile == PROFILE_HIDDEN {
            return Err(ShareError::FileNotAvailable);
        }

        let state = self.state.read().unwrap();
        let refs = state.find_virtuals(dir, profile)?;

        let mut out = String::new();
        fn collect(state: &ShareState, dref: DirRef, recurse: bool, out: &mut String) {
            let node = state.dir(dref);
            if recurse {
                for child in node.children.values() {
                    collect(
                        state,
                        DirRef {
                            root: dref.root,
                            dir: *child,
                        },
                        recurse,
                        out,
                    );
                }
            }
            for file in &node.files {
                out.push_str(&file.tth.to_base32());
                out.push(' ');
            }
        }
        for dref in refs {
            collect(&state, dref, recurse, &mut out);
        }

        if out.is_empty() {
            return Err(ShareError::FileNotAvailable);
        }
        Ok(out)
    }

    /// Regenerate (when stale) and return the on-disk bzip2 catalog
    /// for a profile. The generation number is part of the name so an
    /// upload of the previous list stays valid.
    pub fn generate_file_list(&self, profile: ProfileId, forced: bool) -> Result<PathBuf> {
        let generation = {
            let mut state = self.state.write().unwrap();
            let list = &mut state
                .profile_mut(profile)
                .ok_or(ShareError::FileNotAvailable)?
                .list;
            if !list.needs_regen(forced) {
                if let Some(path) = &list.path {
                    return Ok(path.clone());
                }
            }
            list.generation += 1;
            list.generation
        };

        let xml = self.build_full_list(profile)?;

        let suffix = if profile == PROFILE_DEFAULT {
            String::new()
        } else {
            format!("_{}", profile.0)
        };
        let name = format!("files{suffix}{generation}.xml.bz2");
        let path = self.settings.config_dir.join(name);
        let tmp = path.with_extension("tmp");

        {
            let file = std::fs::File::create(&tmp)?;
            let mut encoder = BzEncoder::new(file, Compression::best());
            encoder.write_all(&xml)?;
            encoder.finish()?;
        }
        std::fs::rename(&tmp, &path)?;

        {
            let mut state = self.state.write().unwrap();
            if let Some(sp) = state.profile_mut(profile) {
                // The previous generation is superseded.
                if let Some(old) = sp.list.path.replace(path.clone()) {
                    if old != path {
                        let _ = std::fs::remove_file(old);
                    }
                }
                sp.list.mark_clean();
            }
        }

        skiff_config::log_share_info!("Generated file list", profile = profile.0, generation = generation);
        Ok(path)
    }

    /// Regenerate and return the caller's own list, always fresh.
    pub fn generate_own_list(&self, profile: ProfileId) -> Result<PathBuf> {
        self.generate_file_list(profile, true)
    }

    // ------------------------------------------------------------------
    // Share cache (Shares.xml)
    // ------------------------------------------------------------------

    fn cache_path(&self) -> PathBuf {
        self.settings.config_dir.join("Shares.xml")
    }

    /// Persist the tree so startup can skip hashing and walking.
    pub fn save_cache(&self) -> Result<()> {
        let state = self.state.read().unwrap();

        let mut buf = Vec::new();
        {
            let mut writer = start_doc(&mut buf)?;
            let mut root = BytesStart::new("Share");
            root.push_attribute(("Version", "1"));
            writer.write_event(Event::Start(root))?;

            fn emit(
                writer: &mut XmlWriter<'_>,
                state: &ShareState,
                dref: DirRef,
                path: &str,
            ) -> Result<()> {
                let node = state.dir(dref);
                let mut el = BytesStart::new("Directory");
                el.push_attribute(("Name", node.real_name.as_str()));
                el.push_attribute(("Path", path));
                el.push_attribute(("Date", node.last_write.to_string().as_str()));
                writer.write_event(Event::Start(el))?;

                for child in node.children.values() {
                    let cref = DirRef {
                        root: dref.root,
                        dir: *child,
                    };
                    let child_path =
                        format!("{path}{}/", state.dir(cref).real_name);
                    emit(writer, state, cref, &child_path)?;
                }

                for file in &node.files {
                    let mut el = BytesStart::new("File");
                    el.push_attribute(("Name", file.name.as_str()));
                    el.push_attribute(("Size", file.size.to_string().as_str()));
                    writer.write_event(Event::Empty(el))?;
                }

                writer.write_event(Event::End(BytesEnd::new("Directory")))?;
                Ok(())
            }

            for (path, dref) in state.parents() {
                emit(&mut writer, &state, dref, &path)?;
            }
            writer.write_event(Event::End(BytesEnd::new("Share")))?;
        }

        let path = self.cache_path();
        let tmp = path.with_extension("xml.tmp");
        std::fs::write(&tmp, &buf)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Rebuild the tree from the cache, consulting the hash manager
    /// for every file by `(path, size)`. Returns false when no cache
    /// exists or it holds no roots; a parse error is surfaced so the
    /// caller can fall back to a full refresh.
    pub fn load_cache(&self) -> Result<bool> {
        let path = self.cache_path();
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        struct Loading {
            tree: RootTree,
            path: String,
            names: Vec<(String, DirId)>,
            nested: Vec<(String, DirId)>,
        }

        let mut done: Vec<Loading> = Vec::new();
        let mut cur: Option<Loading> = None;
        // Open directories: node id plus its real path.
        let mut stack: Vec<(DirId, String)> = Vec::new();

        let profile_dirs = {
            let state = self.state.read().unwrap();
            state.profile_dirs.clone()
        };

        let parse_err = |e: quick_xml::Error| ShareError::CacheParse(e.to_string());

        let mut reader = Reader::from_str(text.trim_start_matches('\u{feff}'));
        loop {
            let event = reader.read_event().map_err(parse_err)?;
            let (el, self_closing) = match &event {
                Event::Start(el) => (el, false),
                Event::Empty(el) => (el, true),
                Event::End(el) => {
                    if el.name().as_ref() == b"Directory" {
                        stack.pop();
                        if stack.is_empty() {
                            if let Some(loading) = cur.take() {
                                done.push(loading);
                            }
                        }
                    }
                    continue;
                }
                Event::Eof => break,
                _ => continue,
            };

            match el.name().as_ref() {
                b"Directory" => {
                    let mut name = String::new();
                    let mut dir_path = String::new();
                    let mut date = 0u32;
                    for attr in el.attributes().flatten() {
                        let value = attr.unescape_value().map_err(parse_err)?.into_owned();
                        match attr.key.as_ref() {
                            b"Name" => name = value,
                            b"Path" => dir_path = value,
                            b"Date" => date = value.parse().unwrap_or(0),
                            _ => {}
                        }
                    }
                    if name.is_empty() || dir_path.is_empty() {
                        return Err(ShareError::CacheParse(
                            "Directory element without Name or Path".into(),
                        ));
                    }
                    let dir_path = normalize_dir_path(&dir_path);

                    match (&mut cur, stack.last().cloned()) {
                        (Some(loading), Some((parent, _))) => {
                            let pd = profile_dirs.get(&dir_path);
                            let mut node = DirNode::new(name.clone(), None, date);
                            if pd.is_some() {
                                node.profile_key = Some(dir_path.clone());
                            }
                            let id = loading.tree.add_dir(parent, node);
                            loading.names.push((name.to_lowercase(), id));
                            if pd.is_some_and(|p| p.has_roots()) {
                                loading.nested.push((dir_path.clone(), id));
                            }
                            if !self_closing {
                                stack.push((id, dir_path));
                            }
                        }
                        _ => {
                            if !profile_dirs.contains_key(&dir_path) {
                                warn!(path = %dir_path, "Cached root is not configured, skipping");
                                if !self_closing {
                                    let end = el.to_end().into_owned();
                                    reader.read_to_end(end.name()).map_err(parse_err)?;
                                }
                                continue;
                            }
                            let mut node = DirNode::new(name.clone(), None, date);
                            node.profile_key = Some(dir_path.clone());
                            let loading = Loading {
                                tree: RootTree::new(node),
                                path: dir_path.clone(),
                                names: Vec::new(),
                                nested: Vec::new(),
                            };
                            if self_closing {
                                done.push(loading);
                            } else {
                                cur = Some(loading);
                                stack.push((DirId::ROOT, dir_path));
                            }
                        }
                    }
                }
                b"File" => {
                    let Some(loading) = cur.as_mut() else { continue };
                    let Some((parent, dir_path)) = stack.last().cloned() else {
                        continue;
                    };

                    let mut name = String::new();
                    let mut size = 0i64;
                    for attr in el.attributes().flatten() {
                        let value = attr.unescape_value().map_err(parse_err)?.into_owned();
                        match attr.key.as_ref() {
                            b"Name" => name = value,
                            b"Size" => size = value.parse().unwrap_or(0),
                            _ => {}
                        }
                    }
                    if name.is_empty() {
                        continue;
                    }

                    // No hashes in the cache; stay in sync with the
                    // hash store by looking files up on load.
                    let full = format!("{dir_path}{name}");
                    match self.hasher.tth_for_cached(std::path::Path::new(&full), size) {
                        Some(tth) => {
                            loading.tree.add_file(
                                parent,
                                FileNode {
                                    name,
                                    size,
                                    tth,
                                    last_write: 0,
                                },
                            );
                        }
                        None => {
                            warn!(path = %full, "Cached file has no hash, skipping");
                        }
                    }
                }
                _ => {}
            }
        }

        if done.is_empty() {
            return Ok(false);
        }

        {
            let mut state = self.state.write().unwrap();
            let mut names = self.names.write().unwrap();
            for loading in done {
                let id = state.alloc_root_id();
                state.trees.insert(id, loading.tree);
                state.roots.insert(
                    loading.path.clone(),
                    DirRef {
                        root: id,
                        dir: DirId::ROOT,
                    },
                );
                for (nested_path, dir) in loading.nested {
                    state.roots.insert(nested_path, DirRef { root: id, dir });
                }
                names.extend(
                    loading
                        .names
                        .into_iter()
                        .map(|(name, dir)| (name, DirRef { root: id, dir })),
                );
            }
            state.rebuild_indices();
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Profile descriptor
    // ------------------------------------------------------------------

    /// Serialize profiles, roots and excludes: one `Share` element for
    /// the default profile, `ShareProfile` for the rest.
    pub fn save_profiles(&self) -> Result<String> {
        let state = self.state.read().unwrap();

        let mut buf = Vec::new();
        {
            let mut writer = start_doc(&mut buf)?;
            writer.write_event(Event::Start(BytesStart::new("Shares")))?;

            for profile in &state.profiles {
                if profile.id == PROFILE_HIDDEN {
                    continue;
                }
                let tag = if profile.id == PROFILE_DEFAULT {
                    "Share"
                } else {
                    "ShareProfile"
                };
                let mut el = BytesStart::new(tag);
                el.push_attribute(("Token", profile.id.0.to_string().as_str()));
                el.push_attribute(("Name", profile.name.as_str()));
                writer.write_event(Event::Start(el))?;

                for path in state.roots.keys() {
                    let Some(pd) = state.profile_dirs.get(path) else {
                        continue;
                    };
                    let Some(vname) = pd.name_for(profile.id) else {
                        continue;
                    };
                    let mut el = BytesStart::new("Directory");
                    el.push_attribute(("Virtual", vname));
                    if pd.is_set(ProfileDir::INCOMING) {
                        el.push_attribute(("Incoming", "1"));
                    }
                    writer.write_event(Event::Start(el))?;
                    writer.write_event(Event::Text(BytesText::new(path)))?;
                    writer.write_event(Event::End(BytesEnd::new("Directory")))?;
                }

                writer.write_event(Event::Start(BytesStart::new("NoShare")))?;
                for (path, pd) in &state.profile_dirs {
                    if pd.is_excluded(profile.id) {
                        writer.write_event(Event::Start(BytesStart::new("Directory")))?;
                        writer.write_event(Event::Text(BytesText::new(path)))?;
                        writer.write_event(Event::End(BytesEnd::new("Directory")))?;
                    }
                }
                writer.write_event(Event::End(BytesEnd::new("NoShare")))?;

                writer.write_event(Event::End(BytesEnd::new(tag)))?;
            }

            writer.write_event(Event::End(BytesEnd::new("Shares")))?;
        }
        String::from_utf8(buf).map_err(|e| ShareError::CacheParse(e.to_string()))
    }

    /// Load the profile descriptor. Roots get placeholder trees so
    /// refresh targeting works before the first scan. User profile
    /// tokens must be above the reserved range.
    pub fn load_profiles(&self, xml: &str) -> Result<()> {
        let parse_err = |e: quick_xml::Error| ShareError::CacheParse(e.to_string());

        let mut state = self.state.write().unwrap();

        let mut reader = Reader::from_str(xml.trim_start_matches('\u{feff}'));
        let mut profile: Option<ProfileId> = None;
        let mut in_no_share = false;
        let mut dir_virtual: Option<String> = None;
        let mut dir_incoming = false;
        let mut text = String::new();

        loop {
            let event = reader.read_event().map_err(parse_err)?;
            let el = match &event {
                Event::Start(el) | Event::Empty(el)
                    if matches!(el.name().as_ref(), b"Share" | b"ShareProfile") =>
                {
                    Some(el)
                }
                _ => None,
            };
            if let Some(el) = el {
                let mut token = 0u32;
                let mut name = String::new();
                for attr in el.attributes().flatten() {
                    let value = attr.unescape_value().map_err(parse_err)?.into_owned();
                    match attr.key.as_ref() {
                        b"Token" => token = value.parse().unwrap_or(0),
                        b"Name" => name = value,
                        _ => {}
                    }
                }
                let id = if el.name().as_ref() == b"Share" {
                    PROFILE_DEFAULT
                } else {
                    // A few numbers are reserved for built-ins.
                    if token <= 10 || name.is_empty() {
                        profile = None;
                        continue;
                    }
                    ProfileId(token)
                };
                if state.profile(id).is_none() {
                    let display = if name.is_empty() { "Default" } else { &name };
                    state.profiles.push(ShareProfile::new(id, display));
                }
                profile = Some(id);
                in_no_share = false;
                continue;
            }

            match event {
                Event::Start(el) => match el.name().as_ref() {
                    b"NoShare" => in_no_share = true,
                    b"Directory" => {
                        dir_virtual = None;
                        dir_incoming = false;
                        for attr in el.attributes().flatten() {
                            let value = attr.unescape_value().map_err(parse_err)?.into_owned();
                            match attr.key.as_ref() {
                                b"Virtual" => dir_virtual = Some(value),
                                b"Incoming" => dir_incoming = value == "1",
                                _ => {}
                            }
                        }
                        text.clear();
                    }
                    _ => {}
                },
                Event::Text(t) => {
                    text.push_str(&t.unescape().map_err(parse_err)?);
                }
                Event::End(el) => match el.name().as_ref() {
                    b"NoShare" => in_no_share = false,
                    b"Directory" => {
                        let Some(id) = profile else { continue };
                        let real_path = text.trim().to_string();
                        text.clear();
                        if real_path.is_empty() {
                            continue;
                        }
                        let real_path = normalize_dir_path(&real_path);

                        if in_no_share {
                            state
                                .profile_dirs
                                .entry(real_path.clone())
                                .or_insert_with(|| ProfileDir {
                                    path: real_path.clone(),
                                    ..ProfileDir::default()
                                })
                                .add_exclude(id);
                            continue;
                        }

                        let vname = validate_virtual(
                            dir_virtual
                                .take()
                                .filter(|v| !v.is_empty())
                                .unwrap_or_else(|| last_dir(&real_path).to_string())
                                .as_str(),
                        );
                        let pd = state
                            .profile_dirs
                            .entry(real_path.clone())
                            .or_insert_with(|| ProfileDir {
                                path: real_path.clone(),
                                ..ProfileDir::default()
                            });
                        pd.add_root_profile(&vname, id);
                        if dir_incoming {
                            pd.set_flag(ProfileDir::INCOMING);
                        }

                        if !state.roots.contains_key(&real_path) {
                            let mut node =
                                DirNode::new(last_dir(&real_path).to_string(), None, 0);
                            node.profile_key = Some(real_path.clone());
                            let root_id = state.alloc_root_id();
                            state.trees.insert(root_id, RootTree::new(node));
                            state.roots.insert(
                                real_path,
                                DirRef {
                                    root: root_id,
                                    dir: DirId::ROOT,
                                },
                            );
                        }
                    }
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }

        drop(state);
        self.rebuild_total_excludes();
        Ok(())
    }
}
