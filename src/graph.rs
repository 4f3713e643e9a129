//! Arena holding every node and link discovered during one scan

use crate::models::{AssemblyLink, AssemblyNode, LinkId, NodeId};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::collections::{HashMap, HashSet};

/// Node cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeKey {
    /// Short assembly name, case-sensitive
    Managed(String),
    /// File name after redirection, case-folded
    Native(String),
}

impl NodeKey {
    pub fn managed(name: &str) -> Self {
        Self::Managed(name.to_owned())
    }

    pub fn native(file_name: &str) -> Self {
        Self::Native(file_name.to_lowercase())
    }
}

/// Link cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LinkKey {
    /// Identity as requested by the referrer, case-sensitive
    Managed(String),
    /// Full identity of the target, case-folded
    Native(String),
}

impl LinkKey {
    pub fn managed(requested_identity: &str) -> Self {
        Self::Managed(requested_identity.to_owned())
    }

    pub fn native(target_identity: &str) -> Self {
        Self::Native(target_identity.to_lowercase())
    }
}

/// Nodes and links of a scan, addressed by NodeId/LinkId
///
/// Both caches live here, so the graph outlives the engine that filled it
#[derive(Debug, Default, Clone)]
pub struct AssemblyGraph {
    nodes: Vec<AssemblyNode>,
    links: Vec<AssemblyLink>,
    node_index: HashMap<NodeKey, NodeId>,
    link_index: HashMap<LinkKey, LinkId>,
}

impl AssemblyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: NodeId) -> &AssemblyNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut AssemblyNode {
        &mut self.nodes[id.0]
    }

    pub fn link(&self, id: LinkId) -> &AssemblyLink {
        &self.links[id.0]
    }

    pub fn find_node(&self, key: &NodeKey) -> Option<NodeId> {
        self.node_index.get(key).copied()
    }

    pub fn find_link(&self, key: &LinkKey) -> Option<LinkId> {
        self.link_index.get(key).copied()
    }

    /// Add a node under the given key; an existing node with the same key is returned instead
    pub fn insert_node(&mut self, key: NodeKey, node: AssemblyNode) -> NodeId {
        if let Some(id) = self.find_node(&key) {
            return id;
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        self.node_index.insert(key, id);
        id
    }

    /// Add a link under the given key; an existing link with the same key is returned instead
    pub fn insert_link(&mut self, key: LinkKey, link: AssemblyLink) -> LinkId {
        if let Some(id) = self.find_link(&key) {
            return id;
        }
        let id = LinkId(self.links.len());
        self.links.push(link);
        self.link_index.insert(key, id);
        id
    }

    /// Append a link to a node, unless the node already has it
    pub fn attach(&mut self, from: NodeId, link: LinkId) -> bool {
        let links = &mut self.nodes[from.0].links;
        if links.contains(&link) {
            false
        } else {
            links.push(link);
            true
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &AssemblyNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Break every cycle reachable from the root
    ///
    /// Walks depth-first carrying the ancestor path and drops each link pointing back into it.
    /// Nodes are shared, so a link dropped on one path is gone from every path through that node.
    pub fn remove_cycles(&mut self, root: NodeId) -> NodeId {
        let mut path = vec![root];
        self.remove_cycles_below(root, &mut path);
        root
    }

    fn remove_cycles_below(&mut self, node: NodeId, path: &mut Vec<NodeId>) {
        // the node is on the path while its links are out, so the walk below never reads them
        let links = std::mem::take(&mut self.nodes[node.0].links);
        let mut kept = Vec::with_capacity(links.len());
        for l in links {
            let target = self.links[l.0].target;
            if path.contains(&target) {
                tracing::debug!(
                    "dropping back-reference {} -> {}",
                    self.nodes[node.0].name,
                    self.nodes[target.0].name
                );
                continue;
            }
            kept.push(l);
            path.push(target);
            self.remove_cycles_below(target, path);
            path.pop();
        }
        self.nodes[node.0].links = kept;
    }

    /// Every link reachable from the root, depth-first, each listed once per path
    ///
    /// Links leading back into the current path are not followed.
    pub fn all_links(&self, root: NodeId) -> Vec<LinkId> {
        let mut ret = Vec::new();
        let mut path = vec![root];
        self.collect_links(root, &mut path, &mut ret);
        ret
    }

    fn collect_links(&self, node: NodeId, path: &mut Vec<NodeId>, acc: &mut Vec<LinkId>) {
        for &l in &self.nodes[node.0].links {
            acc.push(l);
            let target = self.links[l.0].target;
            if path.contains(&target) {
                continue;
            }
            path.push(target);
            self.collect_links(target, path, acc);
            path.pop();
        }
    }

    /// Nodes reachable from the root, each listed once, in order of first appearance
    pub fn reachable(&self, root: NodeId) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut ret = Vec::new();
        let mut stack = vec![root];
        while let Some(n) = stack.pop() {
            if !seen.insert(n) {
                continue;
            }
            ret.push(n);
            for &l in self.nodes[n.0].links.iter().rev() {
                stack.push(self.links[l.0].target);
            }
        }
        ret
    }

    /// Nodes declaring a dependency on the given one
    pub fn referrers(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes[id.0]
            .referenced_by
            .iter()
            .filter_map(|identity| {
                self.nodes
                    .iter()
                    .position(|n| &n.full_identity == identity)
                    .map(NodeId)
            })
            .collect()
    }
}

/// Outcome of a scan: the root node and the graph holding everything found from it
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub root: NodeId,
    pub graph: AssemblyGraph,
}

impl ScanResult {
    pub fn root_node(&self) -> &AssemblyNode {
        self.graph.node(self.root)
    }

    /// Drop every link closing a cycle below the root
    pub fn normalize(&mut self) {
        self.graph.remove_cycles(self.root);
    }
}

impl Serialize for AssemblyGraph {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("AssemblyGraph", 2)?;
        s.serialize_field("nodes", &self.nodes)?;
        s.serialize_field("links", &self.links)?;
        s.end()
    }
}

impl Serialize for ScanResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("ScanResult", 3)?;
        s.serialize_field("root", &self.root)?;
        s.serialize_field("nodes", &self.graph.nodes)?;
        s.serialize_field("links", &self.graph.links)?;
        s.end()
    }
}
