#![forbid(unsafe_code)]
//! Namespace tree.
//!
//! Path parsing and validation, lookup, creation, listing and subtree
//! removal over an arena of nodes keyed by [`NodeId`]. Directory children
//! live in a `BTreeMap`, so names are unique and iteration is lexicographic.
//!
//! The tree only records which extent a file owns; moving bytes is the
//! allocator's job.

use pfs_error::{PfsError, Result};
use pfs_types::{Extent, MAX_NAME_LEN, NodeId, NodeKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Paths ───────────────────────────────────────────────────────────────────

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PfsError::InvalidPath("empty path component".to_owned()));
    }
    if name == "." || name == ".." {
        return Err(PfsError::InvalidPath(format!(
            "relative component {name:?} is not supported"
        )));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(PfsError::NameTooLong(format!(
            "{}... ({} bytes, limit {MAX_NAME_LEN})",
            name.chars().take(16).collect::<String>(),
            name.len()
        )));
    }
    Ok(())
}

/// Split a `/`-delimited path into validated components.
///
/// Empty segments are skipped, so `""`, `"/"` and `"//"` all name the root
/// and `/a//b/` is `/a/b`. `.` and `..` are `InvalidPath`.
pub fn split_path(path: &str) -> Result<Vec<&str>> {
    let components: Vec<&str> = path.split('/').filter(|name| !name.is_empty()).collect();
    for name in &components {
        validate_name(name).map_err(|err| match err {
            PfsError::InvalidPath(_) => PfsError::InvalidPath(path.to_owned()),
            other => other,
        })?;
    }
    Ok(components)
}

/// Render components back into an absolute path.
#[must_use]
pub fn join_path(components: &[&str]) -> String {
    if components.is_empty() {
        return "/".to_owned();
    }
    components.iter().fold(String::new(), |mut out, name| {
        out.push('/');
        out.push_str(name);
        out
    })
}

// ── Nodes ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directory {
    children: BTreeMap<String, NodeId>,
}

impl Directory {
    pub fn children(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.children.iter().map(|(name, id)| (name.as_str(), *id))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileNode {
    /// `None` until the file first receives non-empty content.
    pub extent: Option<Extent>,
}

impl FileNode {
    #[must_use]
    pub fn size(&self) -> u64 {
        self.extent.map_or(0, Extent::len)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Directory(Directory),
    File(FileNode),
}

impl Node {
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Directory(_) => NodeKind::Directory,
            Self::File(_) => NodeKind::File,
        }
    }

    /// Content size for files; `None` for directories.
    #[must_use]
    pub fn size(&self) -> Option<u64> {
        match self {
            Self::Directory(_) => None,
            Self::File(file) => Some(file.size()),
        }
    }
}

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
    /// Content size for files (0 when unallocated), `None` for directories.
    pub size: Option<u64>,
}

// ── Tree ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceTree {
    nodes: BTreeMap<NodeId, Node>,
    next_id: u64,
}

impl Default for NamespaceTree {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceTree {
    /// A tree holding only the root directory.
    #[must_use]
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(NodeId::ROOT, Node::Directory(Directory::default()));
        Self {
            nodes,
            next_id: NodeId::ROOT.0 + 1,
        }
    }

    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(&id)
            .ok_or_else(|| PfsError::Corruption(format!("dangling node reference {id}")))
    }

    fn dir(&self, id: NodeId) -> Result<&Directory> {
        match self.node(id)? {
            Node::Directory(dir) => Ok(dir),
            Node::File(_) => Err(PfsError::Corruption(format!("{id} is not a directory"))),
        }
    }

    fn dir_mut(&mut self, id: NodeId) -> Result<&mut Directory> {
        match self.nodes.get_mut(&id) {
            Some(Node::Directory(dir)) => Ok(dir),
            Some(Node::File(_)) => Err(PfsError::Corruption(format!("{id} is not a directory"))),
            None => Err(PfsError::Corruption(format!("dangling node reference {id}"))),
        }
    }

    /// Walk `components` from the root.
    fn walk(&self, path: &str, components: &[&str]) -> Result<NodeId> {
        let mut current = NodeId::ROOT;
        for (depth, name) in components.iter().enumerate() {
            let dir = match self.node(current)? {
                Node::Directory(dir) => dir,
                Node::File(_) => {
                    return Err(PfsError::NotDirectory(join_path(&components[..depth])));
                }
            };
            current = *dir
                .children
                .get(*name)
                .ok_or_else(|| PfsError::NotFound(path.to_owned()))?;
        }
        Ok(current)
    }

    /// Resolve `path` to a node.
    pub fn resolve(&self, path: &str) -> Result<NodeId> {
        let components = split_path(path)?;
        self.walk(path, &components)
    }

    /// Resolve `path`, requiring a file.
    pub fn resolve_file(&self, path: &str) -> Result<NodeId> {
        let id = self.resolve(path)?;
        match self.node(id)? {
            Node::File(_) => Ok(id),
            Node::Directory(_) => Err(PfsError::IsDirectory(path.to_owned())),
        }
    }

    /// Resolve `path`, requiring a directory.
    pub fn resolve_dir(&self, path: &str) -> Result<NodeId> {
        let id = self.resolve(path)?;
        match self.node(id)? {
            Node::Directory(_) => Ok(id),
            Node::File(_) => Err(PfsError::NotDirectory(path.to_owned())),
        }
    }

    /// Insert an empty file or directory at `path`.
    pub fn create(&mut self, path: &str, kind: NodeKind) -> Result<NodeId> {
        let components = split_path(path)?;
        let Some((name, parents)) = components.split_last() else {
            return Err(PfsError::Exists("/".to_owned()));
        };
        let parent = self.walk(path, parents)?;
        if matches!(self.node(parent)?, Node::File(_)) {
            return Err(PfsError::NotDirectory(join_path(parents)));
        }
        if self.dir(parent)?.children.contains_key(*name) {
            return Err(PfsError::Exists(path.to_owned()));
        }

        let id = NodeId(self.next_id);
        self.next_id += 1;
        let node = match kind {
            NodeKind::File => Node::File(FileNode::default()),
            NodeKind::Directory => Node::Directory(Directory::default()),
        };
        self.nodes.insert(id, node);
        self.dir_mut(parent)?.children.insert((*name).to_owned(), id);
        Ok(id)
    }

    /// Direct children of the directory at `path`, by name.
    pub fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        let id = self.resolve_dir(path)?;
        self.dir(id)?
            .children()
            .map(|(name, child)| {
                let node = self.node(child)?;
                Ok(DirEntry {
                    name: name.to_owned(),
                    kind: node.kind(),
                    size: node.size(),
                })
            })
            .collect()
    }

    /// The extent recorded for file `id`.
    pub fn file_extent(&self, id: NodeId) -> Result<Option<Extent>> {
        match self.node(id)? {
            Node::File(file) => Ok(file.extent),
            Node::Directory(_) => Err(PfsError::Corruption(format!("{id} is not a file"))),
        }
    }

    /// Record a new extent for file `id`.
    pub fn set_extent(&mut self, id: NodeId, extent: Option<Extent>) -> Result<()> {
        match self.nodes.get_mut(&id) {
            Some(Node::File(file)) => {
                file.extent = extent;
                Ok(())
            }
            Some(Node::Directory(_)) => {
                Err(PfsError::Corruption(format!("{id} is not a file")))
            }
            None => Err(PfsError::Corruption(format!("dangling node reference {id}"))),
        }
    }

    /// Every file at or below `id`, in pre-order (a directory's children are
    /// visited by name, each subtree fully before the next sibling).
    pub fn files_preorder(&self, id: NodeId) -> Result<Vec<(NodeId, Option<Extent>)>> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            match self.node(current)? {
                Node::File(file) => out.push((current, file.extent)),
                Node::Directory(dir) => {
                    stack.extend(dir.children.values().rev().copied());
                }
            }
        }
        Ok(out)
    }

    /// Detach the node at `path` from its parent and drop its subtree.
    ///
    /// Returns the number of nodes dropped. The caller frees any extents
    /// first.
    pub fn remove(&mut self, path: &str) -> Result<usize> {
        let components = split_path(path)?;
        let Some((name, parents)) = components.split_last() else {
            return Err(PfsError::InvalidPath("cannot remove the root directory".to_owned()));
        };
        let parent = self.walk(path, parents)?;
        let id = self
            .dir_mut(parent)?
            .children
            .remove(*name)
            .ok_or_else(|| PfsError::NotFound(path.to_owned()))?;

        let mut dropped = 0;
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(Node::Directory(dir)) = self.nodes.remove(&current) {
                stack.extend(dir.children.into_values());
            }
            dropped += 1;
        }
        Ok(dropped)
    }

    /// Every file that owns an extent.
    #[must_use]
    pub fn allocations(&self) -> Vec<(NodeId, Extent)> {
        self.nodes
            .iter()
            .filter_map(|(id, node)| match node {
                Node::File(FileNode {
                    extent: Some(extent),
                }) => Some((*id, *extent)),
                _ => None,
            })
            .collect()
    }

    /// `(files, directories)`, root included among directories.
    #[must_use]
    pub fn counts(&self) -> (usize, usize) {
        self.nodes
            .values()
            .fold((0, 0), |(files, dirs), node| match node {
                Node::File(_) => (files + 1, dirs),
                Node::Directory(_) => (files, dirs + 1),
            })
    }

    /// Verify that every node is reachable from the root exactly once and
    /// every child reference resolves.
    pub fn check(&self) -> Result<()> {
        if !matches!(self.nodes.get(&NodeId::ROOT), Some(Node::Directory(_))) {
            return Err(PfsError::Corruption("root is not a directory".to_owned()));
        }
        let mut seen = 0_usize;
        let mut visited = std::collections::BTreeSet::new();
        let mut stack = vec![NodeId::ROOT];
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                return Err(PfsError::Corruption(format!(
                    "{current} is linked more than once"
                )));
            }
            seen += 1;
            if let Node::Directory(dir) = self.node(current)? {
                for (name, child) in dir.children() {
                    validate_name(name).map_err(|err| {
                        PfsError::Corruption(format!("bad entry in {current}: {err}"))
                    })?;
                    stack.push(child);
                }
            }
        }
        if seen != self.nodes.len() {
            return Err(PfsError::Corruption(format!(
                "{} nodes unreachable from the root",
                self.nodes.len() - seen
            )));
        }
        Ok(())
    }

    // ── Snapshot form ───────────────────────────────────────────────────────

    /// Nested, serializable copy of the tree.
    pub fn to_meta(&self) -> Result<MetaNode> {
        self.meta_of(NodeId::ROOT)
    }

    fn meta_of(&self, id: NodeId) -> Result<MetaNode> {
        Ok(match self.node(id)? {
            Node::File(file) => MetaNode::File {
                extent: file.extent,
            },
            Node::Directory(dir) => MetaNode::Directory {
                contents: dir
                    .children()
                    .map(|(name, child)| Ok((name.to_owned(), self.meta_of(child)?)))
                    .collect::<Result<_>>()?,
            },
        })
    }

    /// Rebuild a tree from its nested form. Node ids are reassigned in
    /// pre-order starting after the root.
    pub fn from_meta(root: &MetaNode) -> Result<Self> {
        let MetaNode::Directory { contents } = root else {
            return Err(PfsError::Corruption("root entry is not a directory".to_owned()));
        };
        let mut tree = Self::new();
        tree.graft(NodeId::ROOT, contents)?;
        Ok(tree)
    }

    fn graft(&mut self, parent: NodeId, contents: &BTreeMap<String, MetaNode>) -> Result<()> {
        for (name, meta) in contents {
            validate_name(name)
                .map_err(|err| PfsError::Corruption(format!("bad entry name: {err}")))?;
            let id = NodeId(self.next_id);
            self.next_id += 1;
            let node = match meta {
                MetaNode::File { extent } => Node::File(FileNode { extent: *extent }),
                MetaNode::Directory { .. } => Node::Directory(Directory::default()),
            };
            self.nodes.insert(id, node);
            self.dir_mut(parent)?.children.insert(name.clone(), id);
            if let MetaNode::Directory { contents } = meta {
                self.graft(id, contents)?;
            }
        }
        Ok(())
    }
}

/// Persisted form of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetaNode {
    Directory {
        #[serde(default)]
        contents: BTreeMap<String, MetaNode>,
    },
    File {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extent: Option<Extent>,
    },
}
