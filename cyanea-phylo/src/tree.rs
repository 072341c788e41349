//! Versioned time trees.
//!
//! Uses arena-style storage: nodes live in a flat `Vec<Node>` and are
//! referenced by `NodeId` (a `usize` index). Leaves occupy ids
//! `0..leaf_count` and keep them for the lifetime of the tree; internal
//! nodes follow and may be rewired freely by topology proposals.
//!
//! The whole tree is a single [`Versioned`] value. The first mutation after
//! a commit copies the arena into a reusable back buffer; rollback swaps the
//! buffers back, so restored topology and heights are bit-exact.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use cyanea_core::{CyaneaError, Result, Summarizable, Versioned};

/// Index into the tree's node arena.
pub type NodeId = usize;

/// A single node in a time tree.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Node {
    /// Index of this node in the arena.
    pub id: NodeId,
    /// Parent node (None for root).
    pub parent: Option<NodeId>,
    /// Child nodes.
    pub children: Vec<NodeId>,
    /// Time before present.
    pub height: f64,
    /// Taxon or clade label.
    pub name: Option<String>,
}

impl Node {
    /// True if this node has no children.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// True if this node has no parent.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// How much of a node changed during the in-flight proposal.
///
/// `Dirty` means the branch above the node changed length; `Filthy` means
/// the node's parent or children changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Dirt {
    Clean,
    Dirty,
    Filthy,
}

/// Plain-data copy of a tree, used for checkpoints.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TreeSnapshot {
    pub id: String,
    pub nodes: Vec<Node>,
    pub root: NodeId,
    pub leaf_count: usize,
}

/// A rooted, ultrametric-capable tree with versioned snapshots.
#[derive(Debug, Clone)]
pub struct TimeTree {
    id: String,
    nodes: Vec<Node>,
    root: NodeId,
    leaf_count: usize,
    stored_nodes: Vec<Node>,
    stored_root: NodeId,
    touched: bool,
    dirt: Vec<Dirt>,
}

impl TimeTree {
    /// Build a tree from pre-linked nodes.
    ///
    /// Node `i` must carry `id == i`, leaves must be exactly the ids below
    /// `leaf_count`, links must agree in both directions, every node must be
    /// reachable from `root`, and no child may be older than its parent.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` describing the first violated condition.
    pub fn from_parts(
        id: impl Into<String>,
        nodes: Vec<Node>,
        root: NodeId,
        leaf_count: usize,
    ) -> Result<Self> {
        let id = id.into();
        if nodes.is_empty() {
            return Err(CyaneaError::InvalidInput(format!("tree '{}': empty node list", id)));
        }
        if root >= nodes.len() {
            return Err(CyaneaError::InvalidInput(format!(
                "tree '{}': root index {} out of range ({})",
                id,
                root,
                nodes.len()
            )));
        }
        if nodes[root].parent.is_some() {
            return Err(CyaneaError::InvalidInput(format!(
                "tree '{}': root {} has a parent",
                id, root
            )));
        }
        for (i, node) in nodes.iter().enumerate() {
            if node.id != i {
                return Err(CyaneaError::InvalidInput(format!(
                    "tree '{}': node at index {} carries id {}",
                    id, i, node.id
                )));
            }
            if !node.height.is_finite() || node.height < 0.0 {
                return Err(CyaneaError::InvalidInput(format!(
                    "tree '{}': node {} has invalid height {}",
                    id, i, node.height
                )));
            }
            if (i < leaf_count) != node.is_leaf() {
                return Err(CyaneaError::InvalidInput(format!(
                    "tree '{}': leaves must occupy ids 0..{}, node {} disagrees",
                    id, leaf_count, i
                )));
            }
            if i != root && node.parent.is_none() {
                return Err(CyaneaError::InvalidInput(format!(
                    "tree '{}': node {} has no parent",
                    id, i
                )));
            }
            if let Some(p) = node.parent {
                let linked = nodes.get(p).map_or(false, |pn| pn.children.contains(&i));
                if !linked {
                    return Err(CyaneaError::InvalidInput(format!(
                        "tree '{}': node {} is not listed as a child of its parent {}",
                        id, i, p
                    )));
                }
            }
            for &c in &node.children {
                if nodes.get(c).and_then(|cn| cn.parent) != Some(i) {
                    return Err(CyaneaError::InvalidInput(format!(
                        "tree '{}': child {} of node {} does not point back",
                        id, c, i
                    )));
                }
                if nodes[c].height > node.height {
                    return Err(CyaneaError::InvalidInput(format!(
                        "tree '{}': child {} is older than its parent {}",
                        id, c, i
                    )));
                }
            }
        }
        let n = nodes.len();
        let tree = Self {
            id,
            stored_nodes: Vec::with_capacity(n),
            stored_root: root,
            nodes,
            root,
            leaf_count,
            touched: false,
            dirt: vec![Dirt::Clean; n],
        };
        if tree.iter_preorder().count() != n {
            return Err(CyaneaError::InvalidInput(format!(
                "tree '{}': not every node is reachable from the root",
                tree.id
            )));
        }
        Ok(tree)
    }

    /// Rebuild a tree from a checkpoint snapshot.
    pub fn from_snapshot(snapshot: TreeSnapshot) -> Result<Self> {
        Self::from_parts(snapshot.id, snapshot.nodes, snapshot.root, snapshot.leaf_count)
    }

    /// Copy of the current topology and heights.
    pub fn snapshot(&self) -> TreeSnapshot {
        TreeSnapshot {
            id: self.id.clone(),
            nodes: self.nodes.clone(),
            root: self.root,
            leaf_count: self.leaf_count,
        }
    }

    /// Identifier used in logs and checkpoints.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Access a node by id.
    pub fn get_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// All nodes, indexed by id.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// The root node id.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Total number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of leaf nodes.
    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Number of non-leaf nodes, root included.
    pub fn internal_count(&self) -> usize {
        self.nodes.len() - self.leaf_count
    }

    pub fn is_leaf(&self, id: NodeId) -> bool {
        id < self.leaf_count
    }

    pub fn is_root(&self, id: NodeId) -> bool {
        id == self.root
    }

    /// Parent of `id`. Panics if `id` is out of range.
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    /// Children of `id`. Panics if `id` is out of range.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    /// Height of `id`. Panics if `id` is out of range.
    pub fn height(&self, id: NodeId) -> f64 {
        self.nodes[id].height
    }

    /// Length of the branch above `id` in time units; zero for the root.
    pub fn branch_length(&self, id: NodeId) -> f64 {
        match self.nodes[id].parent {
            Some(p) => self.nodes[p].height - self.nodes[id].height,
            None => 0.0,
        }
    }

    /// The other child of `parent`, for bifurcating nodes.
    pub fn sibling(&self, id: NodeId) -> Option<NodeId> {
        let p = self.nodes[id].parent?;
        let children = &self.nodes[p].children;
        if children.len() != 2 {
            return None;
        }
        children.iter().copied().find(|&c| c != id)
    }

    /// Leaf ids in taxon order.
    pub fn leaves(&self) -> Vec<NodeId> {
        (0..self.leaf_count).collect()
    }

    /// All non-leaf ids, root included.
    pub fn internal_nodes(&self) -> Vec<NodeId> {
        (self.leaf_count..self.nodes.len()).collect()
    }

    /// Id of the leaf with the given taxon name.
    pub fn leaf_index(&self, name: &str) -> Option<NodeId> {
        self.nodes[..self.leaf_count]
            .iter()
            .find(|n| n.name.as_deref() == Some(name))
            .map(|n| n.id)
    }

    /// Leaf names in taxon (id) order; unnamed leaves are skipped.
    pub fn leaf_names(&self) -> Vec<String> {
        self.nodes[..self.leaf_count]
            .iter()
            .filter_map(|n| n.name.clone())
            .collect()
    }

    /// Pre-order (parent before children) traversal yielding node ids.
    pub fn iter_preorder(&self) -> PreorderIter<'_> {
        PreorderIter {
            tree: self,
            stack: vec![self.root],
        }
    }

    /// Post-order (children before parent) traversal yielding node ids.
    pub fn iter_postorder(&self) -> PostorderIter {
        // Reverse of a preorder that pushes children left to right.
        let mut result = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            result.push(id);
            for &child in &self.nodes[id].children {
                stack.push(child);
            }
        }
        result.reverse();
        PostorderIter {
            sequence: result,
            pos: 0,
        }
    }

    /// True if `ancestor` lies on the path from `node` to the root
    /// (a node is its own ancestor).
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cur = Some(node);
        while let Some(id) = cur {
            if id == ancestor {
                return true;
            }
            cur = self.nodes[id].parent;
        }
        false
    }

    /// Most recent common ancestor of two nodes.
    pub fn mrca(&self, a: NodeId, b: NodeId) -> Result<NodeId> {
        if a >= self.nodes.len() || b >= self.nodes.len() {
            return Err(CyaneaError::InvalidInput("node id out of range".into()));
        }
        let mut cur = Some(b);
        while let Some(id) = cur {
            if self.is_ancestor(id, a) {
                return Ok(id);
            }
            cur = self.nodes[id].parent;
        }
        Ok(self.root)
    }

    /// Oldest child height of `id` (zero for leaves).
    pub fn max_child_height(&self, id: NodeId) -> f64 {
        self.nodes[id]
            .children
            .iter()
            .map(|&c| self.nodes[c].height)
            .fold(0.0, f64::max)
    }

    /// True if every child is no older than its parent and all heights are
    /// non-negative.
    pub fn heights_valid(&self) -> bool {
        self.nodes.iter().all(|n| {
            n.height >= 0.0
                && n.height.is_finite()
                && n.parent.map_or(true, |p| self.nodes[p].height >= n.height)
        })
    }

    /// Change the state of a node after a proposal.
    pub fn dirt(&self, id: NodeId) -> Dirt {
        self.dirt[id]
    }

    /// True if any node changed since the last commit or rollback.
    pub fn something_is_dirty(&self) -> bool {
        self.dirt.iter().any(|&d| d != Dirt::Clean)
    }

    // ------------------------------------------------------------------
    // Mutation. Every method below touches the tree first.
    // ------------------------------------------------------------------

    /// Set the height of `id`. The branch above `id` and the branches to its
    /// children change length, so all of them are marked dirty.
    ///
    /// Ordering against neighbours is not checked here; proposals either
    /// draw heights inside the admissible interval or test
    /// [`TimeTree::heights_valid`] afterwards.
    pub fn set_height(&mut self, id: NodeId, height: f64) -> Result<()> {
        self.check_id(id)?;
        if !height.is_finite() {
            return Err(CyaneaError::InvalidInput(format!(
                "tree '{}': non-finite height {} for node {}",
                self.id, height, id
            )));
        }
        self.touch();
        self.nodes[id].height = height;
        self.mark(id, Dirt::Dirty);
        for i in 0..self.nodes[id].children.len() {
            let c = self.nodes[id].children[i];
            self.mark(c, Dirt::Dirty);
        }
        Ok(())
    }

    /// Multiply every internal node height by `factor`. Leaf heights (tip
    /// dates) are left alone. Returns the number of nodes scaled; the
    /// caller checks [`TimeTree::heights_valid`] afterwards.
    pub fn scale_internal_heights(&mut self, factor: f64) -> Result<usize> {
        if !(factor.is_finite() && factor > 0.0) {
            return Err(CyaneaError::InvalidInput(format!(
                "tree '{}': scale factor must be positive, got {}",
                self.id, factor
            )));
        }
        self.touch();
        for id in self.leaf_count..self.nodes.len() {
            self.nodes[id].height *= factor;
        }
        for d in self.dirt.iter_mut() {
            *d = (*d).max(Dirt::Dirty);
        }
        Ok(self.internal_count())
    }

    /// Replace `old` by `new` in the child list of `parent` and point
    /// `new` at `parent`. The old child's parent field is left for the
    /// caller to rewire.
    pub fn replace_child(&mut self, parent: NodeId, old: NodeId, new: NodeId) -> Result<()> {
        self.check_id(parent)?;
        self.check_id(new)?;
        let pos = self.nodes[parent]
            .children
            .iter()
            .position(|&c| c == old)
            .ok_or_else(|| {
                CyaneaError::InvalidInput(format!(
                    "tree '{}': node {} is not a child of {}",
                    self.id, old, parent
                ))
            })?;
        self.touch();
        self.nodes[parent].children[pos] = new;
        self.nodes[new].parent = Some(parent);
        self.mark(parent, Dirt::Filthy);
        self.mark(new, Dirt::Filthy);
        Ok(())
    }

    /// Make `id` the root.
    pub fn set_root(&mut self, id: NodeId) -> Result<()> {
        self.check_id(id)?;
        self.touch();
        self.nodes[id].parent = None;
        self.root = id;
        self.mark(id, Dirt::Filthy);
        Ok(())
    }

    /// Swap the positions of two nodes with distinct parents: `a` moves
    /// under `b`'s parent and vice versa.
    pub fn exchange(&mut self, a: NodeId, b: NodeId) -> Result<()> {
        let pa = self.parent_of(a)?;
        let pb = self.parent_of(b)?;
        if pa == pb {
            return Err(CyaneaError::InvalidInput(format!(
                "tree '{}': cannot exchange siblings {} and {}",
                self.id, a, b
            )));
        }
        self.replace_child(pa, a, b)?;
        self.replace_child(pb, b, a)?;
        Ok(())
    }

    fn parent_of(&self, id: NodeId) -> Result<NodeId> {
        self.check_id(id)?;
        self.nodes[id].parent.ok_or_else(|| {
            CyaneaError::InvalidInput(format!("tree '{}': node {} is the root", self.id, id))
        })
    }

    fn check_id(&self, id: NodeId) -> Result<()> {
        if id >= self.nodes.len() {
            return Err(CyaneaError::InvalidInput(format!(
                "tree '{}': node id {} out of range ({})",
                self.id,
                id,
                self.nodes.len()
            )));
        }
        Ok(())
    }

    fn mark(&mut self, id: NodeId, dirt: Dirt) {
        if self.dirt[id] < dirt {
            self.dirt[id] = dirt;
        }
    }

    /// Mark every node filthy, forcing consumers to recompute from scratch.
    pub fn mark_all_filthy(&mut self) {
        for d in self.dirt.iter_mut() {
            *d = Dirt::Filthy;
        }
    }

    fn clear_dirt(&mut self) {
        for d in self.dirt.iter_mut() {
            *d = Dirt::Clean;
        }
    }

    /// Integrity checksum over topology and height bits.
    pub fn checksum(&self) -> u64 {
        let mut h = DefaultHasher::new();
        self.root.hash(&mut h);
        for n in &self.nodes {
            n.parent.hash(&mut h);
            n.children.hash(&mut h);
            n.height.to_bits().hash(&mut h);
        }
        h.finish()
    }

    /// Parse a Newick string with branch lengths into a time tree.
    pub fn from_newick(id: impl Into<String>, input: &str) -> Result<Self> {
        crate::newick::parse(id, input)
    }

    /// Serialize the tree to a Newick string with branch lengths.
    pub fn to_newick(&self) -> String {
        crate::newick::write(self)
    }
}

impl Versioned for TimeTree {
    fn touch(&mut self) {
        if !self.touched {
            self.stored_nodes.clone_from(&self.nodes);
            self.stored_root = self.root;
            self.touched = true;
        }
    }

    fn commit(&mut self) {
        self.touched = false;
        self.clear_dirt();
    }

    fn rollback(&mut self) {
        if self.touched {
            std::mem::swap(&mut self.nodes, &mut self.stored_nodes);
            self.root = self.stored_root;
            self.touched = false;
        }
        self.clear_dirt();
    }

    fn is_touched(&self) -> bool {
        self.touched
    }
}

impl Summarizable for TimeTree {
    fn summary(&self) -> String {
        format!(
            "TimeTree '{}': {} nodes ({} leaves, {} internal), root height {:.6}",
            self.id,
            self.node_count(),
            self.leaf_count,
            self.internal_count(),
            self.nodes[self.root].height
        )
    }
}

/// Pre-order iterator over node ids.
pub struct PreorderIter<'a> {
    tree: &'a TimeTree,
    stack: Vec<NodeId>,
}

impl<'a> Iterator for PreorderIter<'a> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        // Push children in reverse order so leftmost is visited first.
        for &child in self.tree.nodes[id].children.iter().rev() {
            self.stack.push(child);
        }
        Some(id)
    }
}

/// Post-order iterator over node ids.
pub struct PostorderIter {
    sequence: Vec<NodeId>,
    pos: usize,
}

impl Iterator for PostorderIter {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let id = *self.sequence.get(self.pos)?;
        self.pos += 1;
        Some(id)
    }
}
