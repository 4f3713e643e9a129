//! Vertices and edges of the dependency graph, and a tree view over it

use crate::graph::AssemblyGraph;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::SystemTime;

/// Index of a node in its AssemblyGraph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodeId(pub(crate) usize);

/// Index of a link in its AssemblyGraph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct LinkId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl LinkId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TargetProcessor {
    AnyCpu,
    X86,
    X64,
}

/// One physical or virtual binary
#[derive(Debug, Clone, Serialize)]
pub struct AssemblyNode {
    /// Short name, without version or culture
    pub name: String,
    /// Fully qualified identity; the short name if nothing better is known
    pub full_identity: String,
    /// Version actually found
    pub loaded_version: Option<String>,
    /// Location of the file, if one was found
    pub file_path: Option<PathBuf>,
    pub is_native: bool,
    /// Found under the scanned directory tree
    pub is_local: bool,
    /// Located and readable
    pub is_resolved: bool,
    pub is_il_only: bool,
    pub is_debug: Option<bool>,
    pub target_framework: Option<String>,
    pub has_entry_point: bool,
    pub target_processor: Option<TargetProcessor>,
    pub creator: Option<String>,
    pub creation_date: Option<SystemTime>,
    /// Outgoing edges, in discovery order
    pub links: Vec<LinkId>,
    /// Identities of the nodes declaring a dependency on this one
    pub referenced_by: BTreeSet<String>,
}

impl AssemblyNode {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            full_identity: name.to_owned(),
            loaded_version: None,
            file_path: None,
            is_native: false,
            is_local: false,
            is_resolved: false,
            is_il_only: false,
            is_debug: None,
            target_framework: None,
            has_entry_point: false,
            target_processor: None,
            creator: None,
            creation_date: None,
            links: Vec::new(),
            referenced_by: BTreeSet::new(),
        }
    }

    pub fn native(file_name: &str, file_path: Option<PathBuf>, is_local: bool) -> Self {
        Self {
            is_native: true,
            is_local,
            file_path,
            ..Self::new(file_name)
        }
    }

    /// Located in a system/global location rather than under the scanned tree
    pub fn is_system(&self) -> bool {
        self.is_resolved && !self.is_local
    }
}

impl PartialEq for AssemblyNode {
    fn eq(&self, other: &Self) -> bool {
        self.full_identity == other.full_identity
            && self.is_debug == other.is_debug
            && self.target_framework == other.target_framework
            && self.target_processor == other.target_processor
    }
}

impl Eq for AssemblyNode {}

/// One reference site
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssemblyLink {
    pub target: NodeId,
    /// Version declared where the reference was made
    pub requested_version: Option<String>,
    /// Identity as written where the reference was made
    pub requested_identity: String,
}

impl AssemblyLink {
    /// Requested version differs from what was actually loaded
    pub fn is_version_mismatch(&self, graph: &AssemblyGraph) -> bool {
        match (&self.requested_version, &graph.node(self.target).loaded_version) {
            (Some(requested), Some(loaded)) => requested != loaded,
            _ => false,
        }
    }
}

// tree view of the graph, with one entry per path from the root
// a node with several parents appears once under each of them

pub struct AssemblyTreeNode {
    pub node: NodeId,
    /// Edge this entry was reached through; None for the root
    pub link: Option<LinkId>,
    pub parent: Option<usize>,
    pub depth: usize,
    pub children: Vec<usize>,
}

// ordered depth-first: root is first node
pub struct AssemblyTreeView {
    pub arena: Vec<AssemblyTreeNode>,
}

impl AssemblyTreeView {
    pub fn new(graph: &AssemblyGraph, root: NodeId, max_depth: Option<usize>) -> Self {
        let mut ret = Self { arena: Vec::new() };
        let mut path = vec![root];
        ret.add_to_arena(graph, root, None, None, 0, max_depth, &mut path);
        ret
    }

    #[allow(clippy::too_many_arguments)]
    fn add_to_arena(
        &mut self,
        graph: &AssemblyGraph,
        node: NodeId,
        link: Option<LinkId>,
        parent: Option<usize>,
        depth: usize,
        max_depth: Option<usize>,
        path: &mut Vec<NodeId>,
    ) -> usize {
        let this_index = self.arena.len();
        self.arena.push(AssemblyTreeNode {
            node,
            link,
            parent,
            depth,
            children: Vec::new(), // will fill this after visiting the links
        });

        if max_depth.map(|d| depth >= d).unwrap_or(false) {
            return this_index;
        }

        let mut children = Vec::new();
        for &l in &graph.node(node).links {
            let target = graph.link(l).target;
            // a back-reference to an ancestor would never terminate
            if path.contains(&target) {
                continue;
            }
            path.push(target);
            children.push(self.add_to_arena(
                graph,
                target,
                Some(l),
                Some(this_index),
                depth + 1,
                max_depth,
                path,
            ));
            path.pop();
        }

        self.arena[this_index].children = children;
        this_index
    }

    pub fn visit_depth_first(&self, mut f: impl FnMut(&AssemblyTreeNode)) {
        // the arena currently holds a depth-first linearization of the tree
        for n in &self.arena {
            f(n)
        }
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}
