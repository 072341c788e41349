//! Operators on tree heights and topology.
//!
//! All of these assume a bifurcating tree; proposals that land on a
//! polytomy are rejected with −∞ rather than attempted.

use cyanea_core::{CyaneaError, Result};
use cyanea_phylo::{NodeId, TimeTree};

use super::{log_step, with_tuning};
use crate::operator::{Operator, OperatorKind, OperatorSpec};
use crate::rng::ChainRng;
use crate::state::{Handle, State};

const REJECT: f64 = f64::NEG_INFINITY;

fn tree_input(spec: &OperatorSpec, state: &State) -> Result<Handle<TimeTree>> {
    state.lookup::<TimeTree>(spec.single("tree")?)
}

fn parent_of(tree: &TimeTree, id: NodeId) -> Result<NodeId> {
    tree.parent(id).ok_or_else(|| {
        CyaneaError::invariant(
            "TreeOperator",
            format!("node {} of tree '{}' has no parent", id, tree.id()),
        )
    })
}

fn binary_children(tree: &TimeTree, id: NodeId) -> Option<(NodeId, NodeId)> {
    match tree.children(id) {
        [a, b] => Some((*a, *b)),
        _ => None,
    }
}

/// Uniformly chosen non-root node. The tree must have at least two nodes.
fn random_non_root(tree: &TimeTree, rng: &mut ChainRng) -> NodeId {
    loop {
        let id = rng.index(tree.node_count());
        if !tree.is_root(id) {
            return id;
        }
    }
}

/// Edges below `node` (inclusive of the edge above it) that span
/// `height`. Edges whose upper end lies below `height` are not followed.
fn intersecting_edges(
    tree: &TimeTree,
    node: NodeId,
    height: f64,
    mut found: Option<&mut Vec<NodeId>>,
) -> usize {
    let mut count = 0;
    let mut stack = vec![node];
    while let Some(n) = stack.pop() {
        let Some(parent) = tree.parent(n) else {
            continue;
        };
        if tree.height(parent) < height {
            continue;
        }
        if tree.height(n) < height {
            count += 1;
            if let Some(out) = found.as_deref_mut() {
                out.push(n);
            }
            continue;
        }
        stack.extend_from_slice(tree.children(n));
    }
    count
}

// ---------------------------------------------------------------------------
// Node height
// ---------------------------------------------------------------------------

/// Redraws one non-root internal height uniformly between its oldest child
/// and its parent. The Hastings ratio is zero.
#[derive(Debug)]
pub struct NodeHeight {
    spec: OperatorSpec,
    tree: Handle<TimeTree>,
}

impl NodeHeight {
    pub fn from_spec(spec: &OperatorSpec, state: &State) -> Result<Self> {
        Ok(Self {
            tree: tree_input(spec, state)?,
            spec: spec.clone(),
        })
    }
}

impl Operator for NodeHeight {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::NodeHeight
    }

    fn propose(&mut self, state: &mut State, rng: &mut ChainRng) -> Result<f64> {
        let tree = state.get_mut(self.tree)?;
        let candidates: Vec<NodeId> = tree
            .internal_nodes()
            .into_iter()
            .filter(|&n| !tree.is_root(n))
            .collect();
        if candidates.is_empty() {
            return Ok(REJECT);
        }
        let node = candidates[rng.index(candidates.len())];
        let upper = tree.height(parent_of(tree, node)?);
        let lower = tree.max_child_height(node);
        if !(upper > lower) {
            return Ok(REJECT);
        }
        tree.set_height(node, rng.uniform_in(lower, upper))?;
        Ok(0.0)
    }

    fn spec(&self) -> OperatorSpec {
        self.spec.clone()
    }
}

// ---------------------------------------------------------------------------
// Subtree slide
// ---------------------------------------------------------------------------

/// Slides the parent of a random node up or down by a random amount,
/// regrafting the subtree onto whichever edge spans the new height.
#[derive(Debug)]
pub struct SubtreeSlide {
    spec: OperatorSpec,
    tree: Handle<TimeTree>,
    size: f64,
    gaussian: bool,
}

impl SubtreeSlide {
    pub fn from_spec(spec: &OperatorSpec, state: &State) -> Result<Self> {
        Ok(Self {
            tree: tree_input(spec, state)?,
            size: spec.tuning.unwrap_or(1.0),
            gaussian: spec.options.gaussian,
            spec: spec.clone(),
        })
    }

    fn shift(&self, rng: &mut ChainRng) -> f64 {
        if self.gaussian {
            rng.normal() * self.size
        } else {
            rng.uniform() * self.size - self.size / 2.0
        }
    }
}

impl Operator for SubtreeSlide {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::SubtreeSlide
    }

    fn propose(&mut self, state: &mut State, rng: &mut ChainRng) -> Result<f64> {
        let shift = self.shift(rng);
        let tree = state.get_mut(self.tree)?;
        if tree.node_count() < 3 {
            return Ok(REJECT);
        }
        let i = random_non_root(tree, rng);
        let p = parent_of(tree, i)?;
        let Some(cip) = tree.sibling(i) else {
            return Ok(REJECT);
        };
        let pip = tree.parent(p);
        let old_height = tree.height(p);
        let new_height = old_height + shift;

        if shift > 0.0 {
            match pip {
                Some(pip) if tree.height(pip) < new_height => {
                    // Climb to the first ancestor older than the new height.
                    let mut new_parent = Some(pip);
                    let mut new_child = p;
                    while let Some(np) = new_parent {
                        if tree.height(np) >= new_height {
                            break;
                        }
                        new_child = np;
                        new_parent = tree.parent(np);
                    }
                    tree.replace_child(p, cip, new_child)?;
                    tree.replace_child(pip, p, cip)?;
                    match new_parent {
                        Some(np) => tree.replace_child(np, new_child, p)?,
                        None => tree.set_root(p)?,
                    }
                    tree.set_height(p, new_height)?;
                    let sources = intersecting_edges(tree, new_child, old_height, None);
                    Ok(-(sources as f64).ln())
                }
                _ => {
                    tree.set_height(p, new_height)?;
                    Ok(0.0)
                }
            }
        } else {
            if tree.height(i) > new_height {
                return Ok(REJECT);
            }
            if tree.height(cip) > new_height {
                let mut targets = Vec::new();
                let destinations = intersecting_edges(tree, cip, new_height, Some(&mut targets));
                if targets.is_empty() {
                    return Ok(REJECT);
                }
                let new_child = targets[rng.index(targets.len())];
                let new_parent = parent_of(tree, new_child)?;
                match pip {
                    None => {
                        tree.replace_child(p, cip, new_child)?;
                        tree.replace_child(new_parent, new_child, p)?;
                        tree.set_root(cip)?;
                    }
                    Some(pip) => {
                        tree.replace_child(p, cip, new_child)?;
                        tree.replace_child(pip, p, cip)?;
                        tree.replace_child(new_parent, new_child, p)?;
                    }
                }
                tree.set_height(p, new_height)?;
                Ok((destinations as f64).ln())
            } else {
                tree.set_height(p, new_height)?;
                Ok(0.0)
            }
        }
    }

    fn tuning(&self) -> Option<f64> {
        Some(self.size)
    }

    fn set_tuning(&mut self, value: f64) {
        self.size = value;
    }

    fn optimize(&mut self, delta: f64) {
        self.size = log_step(self.size, delta);
    }

    fn target_acceptance(&self) -> f64 {
        self.spec.options.target_acceptance.unwrap_or(0.234)
    }

    fn spec(&self) -> OperatorSpec {
        with_tuning(&self.spec, Some(self.size))
    }
}

// ---------------------------------------------------------------------------
// Narrow exchange
// ---------------------------------------------------------------------------

/// 1 if `n` has at least one internal child.
fn has_internal_child(tree: &TimeTree, n: NodeId) -> usize {
    usize::from(tree.children(n).iter().any(|&c| !tree.is_leaf(c)))
}

/// Like [`has_internal_child`], but 0 for leaves.
fn counts_as_grandparent(tree: &TimeTree, n: NodeId) -> usize {
    if tree.is_leaf(n) {
        0
    } else {
        has_internal_child(tree, n)
    }
}

/// Swaps a node with its uncle. The Hastings ratio corrects for the change
/// in the number of nodes with a grandchild.
#[derive(Debug)]
pub struct NarrowExchange {
    spec: OperatorSpec,
    tree: Handle<TimeTree>,
}

impl NarrowExchange {
    pub fn from_spec(spec: &OperatorSpec, state: &State) -> Result<Self> {
        Ok(Self {
            tree: tree_input(spec, state)?,
            spec: spec.clone(),
        })
    }
}

impl Operator for NarrowExchange {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::NarrowExchange
    }

    fn propose(&mut self, state: &mut State, rng: &mut ChainRng) -> Result<f64> {
        let tree = state.get_mut(self.tree)?;
        if tree.internal_count() <= 1 {
            return Ok(REJECT);
        }
        let grandparents: Vec<NodeId> = tree
            .internal_nodes()
            .into_iter()
            .filter(|&n| has_internal_child(tree, n) == 1)
            .collect();
        if grandparents.is_empty() {
            return Ok(REJECT);
        }
        let valid_before = grandparents.len();
        let gp = grandparents[rng.index(valid_before)];
        let Some((mut parent, mut uncle)) = binary_children(tree, gp) else {
            return Ok(REJECT);
        };
        if tree.height(parent) < tree.height(uncle) {
            std::mem::swap(&mut parent, &mut uncle);
        }
        if tree.is_leaf(parent) {
            return Ok(REJECT);
        }
        let Some((a, b)) = binary_children(tree, parent) else {
            return Ok(REJECT);
        };
        let before_pair = counts_as_grandparent(tree, parent) + counts_as_grandparent(tree, uncle);
        let i = if rng.coin() { a } else { b };
        tree.exchange(i, uncle)?;
        let valid_after = valid_before - before_pair
            + counts_as_grandparent(tree, parent)
            + counts_as_grandparent(tree, uncle);
        Ok((valid_before as f64 / valid_after as f64).ln())
    }

    fn spec(&self) -> OperatorSpec {
        self.spec.clone()
    }
}

// ---------------------------------------------------------------------------
// Wide exchange
// ---------------------------------------------------------------------------

/// Swaps two random non-root nodes when both fit under each other's
/// parent. The Hastings ratio is zero.
#[derive(Debug)]
pub struct WideExchange {
    spec: OperatorSpec,
    tree: Handle<TimeTree>,
}

impl WideExchange {
    pub fn from_spec(spec: &OperatorSpec, state: &State) -> Result<Self> {
        Ok(Self {
            tree: tree_input(spec, state)?,
            spec: spec.clone(),
        })
    }
}

impl Operator for WideExchange {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::WideExchange
    }

    fn propose(&mut self, state: &mut State, rng: &mut ChainRng) -> Result<f64> {
        let tree = state.get_mut(self.tree)?;
        if tree.node_count() < 3 {
            return Ok(REJECT);
        }
        let i = random_non_root(tree, rng);
        let j = loop {
            let j = random_non_root(tree, rng);
            if j != i {
                break j;
            }
        };
        let p = parent_of(tree, i)?;
        let jp = parent_of(tree, j)?;
        if p != jp
            && i != jp
            && j != p
            && tree.height(j) < tree.height(p)
            && tree.height(i) < tree.height(jp)
        {
            tree.exchange(i, j)?;
            return Ok(0.0);
        }
        Ok(REJECT)
    }

    fn spec(&self) -> OperatorSpec {
        self.spec.clone()
    }
}

// ---------------------------------------------------------------------------
// Wilson-Balding
// ---------------------------------------------------------------------------

/// Prunes a subtree and regrafts it on a random edge above its own height,
/// drawing a new attachment height uniformly on that edge. Moves that would
/// change the root are rejected.
#[derive(Debug)]
pub struct WilsonBalding {
    spec: OperatorSpec,
    tree: Handle<TimeTree>,
}

impl WilsonBalding {
    pub fn from_spec(spec: &OperatorSpec, state: &State) -> Result<Self> {
        Ok(Self {
            tree: tree_input(spec, state)?,
            spec: spec.clone(),
        })
    }
}

impl Operator for WilsonBalding {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::WilsonBalding
    }

    fn propose(&mut self, state: &mut State, rng: &mut ChainRng) -> Result<f64> {
        let tree = state.get_mut(self.tree)?;
        if tree.node_count() < 3 {
            return Ok(REJECT);
        }
        let i = random_non_root(tree, rng);
        let ip = parent_of(tree, i)?;
        // The target edge must sit above the pruned subtree; the root's
        // (absent) edge always qualifies, so this terminates.
        let (j, jp) = loop {
            let j = rng.index(tree.node_count());
            let jp = tree.parent(j);
            let above = jp.map_or(true, |jp| tree.height(jp) > tree.height(i));
            if j != i && above {
                break (j, jp);
            }
        };
        let Some(jp) = jp else {
            return Ok(REJECT);
        };
        if tree.is_root(ip) || jp == ip || j == ip || jp == i {
            return Ok(REJECT);
        }
        let Some(cip) = tree.sibling(i) else {
            return Ok(REJECT);
        };
        let pip = parent_of(tree, ip)?;

        let (old_range, new_range) = attachment_ranges(tree, i, cip, pip, j, jp);
        // Zero-length edges leave no room to attach, in either direction.
        if old_range <= 0.0 || new_range <= 0.0 {
            return Ok(REJECT);
        }
        let new_age = tree.height(i).max(tree.height(j)) + rng.uniform() * new_range;

        tree.replace_child(pip, ip, cip)?;
        tree.replace_child(ip, cip, j)?;
        tree.replace_child(jp, j, ip)?;
        tree.set_height(ip, new_age)?;
        Ok(new_range.ln() - old_range.ln())
    }

    fn spec(&self) -> OperatorSpec {
        self.spec.clone()
    }
}

/// Room for `i`'s parent on its current edge (between sibling `cip` and
/// grandparent `pip`) and on the target edge from `j` up to `jp`.
fn attachment_ranges(
    tree: &TimeTree,
    i: NodeId,
    cip: NodeId,
    pip: NodeId,
    j: NodeId,
    jp: NodeId,
) -> (f64, f64) {
    let old_range = tree.height(pip) - tree.height(i).max(tree.height(cip));
    let new_range = tree.height(jp) - tree.height(i).max(tree.height(j));
    (old_range, new_range)
}
