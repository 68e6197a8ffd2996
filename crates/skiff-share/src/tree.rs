//! The share tree.
//!
//! Each top-level share root owns an arena of directory nodes; child
//! links and the hash/name indices hold indices into it instead of
//! pointers, so published subtrees can be swapped wholesale and node
//! moves can never leave a dangling reference behind.

use std::collections::BTreeMap;

use skiff_types::filetype::{file_type_of, FileType};
use skiff_types::Tth;

/// Identifies a published root tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RootId(pub u32);

/// Index of a directory node within its root tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirId(pub u32);

impl DirId {
    pub const ROOT: DirId = DirId(0);
}

/// Handle to a directory, stable for the lifetime of its published
/// tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirRef {
    pub root: RootId,
    pub dir: DirId,
}

/// Handle to a file within a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileRef {
    pub root: RootId,
    pub dir: DirId,
    pub file: u32,
}

impl FileRef {
    pub fn dir_ref(&self) -> DirRef {
        DirRef {
            root: self.root,
            dir: self.dir,
        }
    }
}

/// A shared file. Immutable after insertion except for the hash,
/// which is replaced when the file is re-hashed.
#[derive(Debug, Clone)]
pub struct FileNode {
    pub name: String,
    pub size: i64,
    pub tth: Tth,
    pub last_write: u32,
}

/// A shared directory.
#[derive(Debug, Clone)]
pub struct DirNode {
    pub real_name: String,
    pub parent: Option<DirId>,
    /// Lowercased child name to node index.
    pub children: BTreeMap<String, DirId>,
    /// Ordered by lowercased name.
    pub files: Vec<FileNode>,
    /// Sum of direct file sizes.
    pub size: i64,
    /// Mask of `FileType` bits present anywhere below.
    pub file_types: u32,
    pub last_write: u32,
    /// Real path key into the profile-directory registry when this
    /// node is a share root or an exclusion marker.
    pub profile_key: Option<String>,
}

impl DirNode {
    pub fn new(real_name: String, parent: Option<DirId>, last_write: u32) -> Self {
        Self {
            real_name,
            parent,
            children: BTreeMap::new(),
            files: Vec::new(),
            size: 0,
            file_types: FileType::Directory.mask_bit(),
            last_write,
            profile_key: None,
        }
    }

    pub fn has_type(&self, ty: FileType) -> bool {
        ty == FileType::Any || self.file_types & ty.mask_bit() != 0
    }
}

/// Arena of directory nodes; node 0 is the tree root.
#[derive(Debug, Default)]
pub struct RootTree {
    nodes: Vec<DirNode>,
}

impl RootTree {
    pub fn new(root: DirNode) -> Self {
        Self { nodes: vec![root] }
    }

    pub fn dir(&self, id: DirId) -> &DirNode {
        &self.nodes[id.0 as usize]
    }

    pub fn dir_mut(&mut self, id: DirId) -> &mut DirNode {
        &mut self.nodes[id.0 as usize]
    }

    pub fn file(&self, dir: DirId, index: u32) -> &FileNode {
        &self.dir(dir).files[index as usize]
    }

    pub fn add_dir(&mut self, parent: DirId, mut node: DirNode) -> DirId {
        node.parent = Some(parent);
        let id = DirId(self.nodes.len() as u32);
        let key = node.real_name.to_lowercase();
        self.nodes.push(node);
        self.dir_mut(parent).children.insert(key, id);
        id
    }

    /// Insert a file in name order, keep the direct-size sum current
    /// and fold the file's type bit into every ancestor.
    pub fn add_file(&mut self, dir: DirId, file: FileNode) -> u32 {
        let ty = file_type_of(&file.name);
        let size = file.size;

        let node = self.dir_mut(dir);
        let key = file.name.to_lowercase();
        let pos = node
            .files
            .binary_search_by(|f| f.name.to_lowercase().cmp(&key))
            .unwrap_or_else(|p| p);
        node.files.insert(pos, file);
        node.size += size;

        self.add_type(dir, ty);
        pos as u32
    }

    fn add_type(&mut self, dir: DirId, ty: FileType) {
        let bit = ty.mask_bit();
        let mut cur = Some(dir);
        while let Some(id) = cur {
            let node = self.dir_mut(id);
            if node.file_types & bit != 0 {
                break;
            }
            node.file_types |= bit;
            cur = node.parent;
        }
    }

    pub fn find_child(&self, dir: DirId, name: &str) -> Option<DirId> {
        self.dir(dir).children.get(&name.to_lowercase()).copied()
    }

    /// Index of a file by case-insensitive name.
    pub fn find_file(&self, dir: DirId, name: &str) -> Option<u32> {
        let key = name.to_lowercase();
        self.dir(dir)
            .files
            .iter()
            .position(|f| f.name.to_lowercase() == key)
            .map(|i| i as u32)
    }

    /// Recursive size, ignoring profile exclusions.
    pub fn total_size_all(&self, dir: DirId) -> i64 {
        let node = self.dir(dir);
        let mut total = node.size;
        for child in node.children.values() {
            total += self.total_size_all(*child);
        }
        total
    }

    /// Walk the subtree depth-first, directories before their
    /// contents.
    pub fn walk(&self, from: DirId, visit: &mut impl FnMut(DirId, &DirNode)) {
        let node = self.dir(from);
        visit(from, node);
        for child in node.children.values() {
            self.walk(*child, visit);
        }
    }

    /// Number of nodes in the arena (including any detached by a
    /// subtree rebuild).
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
