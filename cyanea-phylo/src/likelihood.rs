//! Felsenstein pruning kernel with double-buffered caches.
//!
//! Every node owns two partial-likelihood buffers, two transition-matrix
//! buffers and two scale-factor buffers. `current` and `stored` index arrays
//! select which copy is live. Recomputing a node flips its index and writes
//! into the spare copy, so `store` and `restore` only copy or swap the small
//! index arrays and never move partials.
//!
//! Partials are laid out pattern-major: entry `(p, c, s)` lives at
//! `(p * n_categories + c) * n_states + s`, so one pattern's block is
//! contiguous and can be processed (and rescaled) independently.

use cyanea_core::{CyaneaError, Result};

use crate::tree::NodeId;

/// When to rescale partial likelihoods to avoid underflow.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Scaling {
    /// Never rescale.
    Never,
    /// Rescale every internal node.
    Always,
    /// Rescale a pattern at a node when its largest entry falls below the
    /// threshold.
    Threshold(f64),
}

impl Default for Scaling {
    fn default() -> Self {
        Scaling::Threshold(1e-100)
    }
}

/// Leaf observations as stored in the kernel.
#[derive(Debug, Clone)]
enum Tip {
    /// Internal node, or a leaf that has not been set yet.
    None,
    /// Fully resolved states, one per pattern; `n_states` means unknown.
    States(Vec<usize>),
}

/// What a child contributes to its parent's partials.
#[derive(Clone, Copy)]
enum ChildView<'a> {
    States { states: &'a [usize], matrices: &'a [f64] },
    Partials { partials: &'a [f64], matrices: &'a [f64] },
}

/// Double-buffered storage and arithmetic of the pruning algorithm.
#[derive(Debug, Clone)]
pub struct LikelihoodCore {
    n_nodes: usize,
    n_patterns: usize,
    n_states: usize,
    n_categories: usize,
    partial_size: usize,
    matrix_size: usize,
    tips: Vec<Tip>,
    partials: Vec<[Vec<f64>; 2]>,
    matrices: Vec<[Vec<f64>; 2]>,
    scale_factors: Vec<[Vec<f64>; 2]>,
    current_partials: Vec<usize>,
    stored_partials: Vec<usize>,
    current_matrices: Vec<usize>,
    stored_matrices: Vec<usize>,
    scaling: Scaling,
}

impl LikelihoodCore {
    /// Allocate buffers for a tree with `n_nodes` nodes.
    pub fn new(n_nodes: usize, n_patterns: usize, n_states: usize, n_categories: usize) -> Self {
        let partial_size = n_patterns * n_categories * n_states;
        let matrix_size = n_categories * n_states * n_states;
        Self {
            n_nodes,
            n_patterns,
            n_states,
            n_categories,
            partial_size,
            matrix_size,
            tips: vec![Tip::None; n_nodes],
            partials: vec![[Vec::new(), Vec::new()]; n_nodes],
            matrices: vec![[vec![0.0; matrix_size], vec![0.0; matrix_size]]; n_nodes],
            scale_factors: vec![[vec![0.0; n_patterns], vec![0.0; n_patterns]]; n_nodes],
            current_partials: vec![0; n_nodes],
            stored_partials: vec![0; n_nodes],
            current_matrices: vec![0; n_nodes],
            stored_matrices: vec![0; n_nodes],
            scaling: Scaling::default(),
        }
    }

    pub fn n_patterns(&self) -> usize {
        self.n_patterns
    }

    pub fn n_states(&self) -> usize {
        self.n_states
    }

    pub fn n_categories(&self) -> usize {
        self.n_categories
    }

    pub fn scaling(&self) -> Scaling {
        self.scaling
    }

    /// Change the rescaling policy. Cached partials computed under the old
    /// policy stay valid; callers usually force a full recomputation.
    pub fn set_scaling(&mut self, scaling: Scaling) {
        self.scaling = scaling;
    }

    fn check_node(&self, node: NodeId) -> Result<()> {
        if node >= self.n_nodes {
            return Err(CyaneaError::InvalidInput(format!(
                "node {} out of range ({})",
                node, self.n_nodes
            )));
        }
        Ok(())
    }

    /// Attach fully resolved observations to a leaf.
    pub fn set_leaf_states(&mut self, node: NodeId, states: &[usize]) -> Result<()> {
        self.check_node(node)?;
        if states.len() != self.n_patterns || states.iter().any(|&s| s > self.n_states) {
            return Err(CyaneaError::InvalidInput(format!(
                "leaf {}: expected {} states below {}",
                node, self.n_patterns, self.n_states
            )));
        }
        self.tips[node] = Tip::States(states.to_vec());
        self.partials[node] = [Vec::new(), Vec::new()];
        Ok(())
    }

    /// Attach per-pattern partials (`pattern * n_states + state`) to a leaf.
    /// They are replicated across rate categories.
    pub fn set_leaf_partials(&mut self, node: NodeId, values: &[f64]) -> Result<()> {
        self.check_node(node)?;
        if values.len() != self.n_patterns * self.n_states {
            return Err(CyaneaError::InvalidInput(format!(
                "leaf {}: expected {} partial entries, got {}",
                node,
                self.n_patterns * self.n_states,
                values.len()
            )));
        }
        let mut buf = Vec::with_capacity(self.partial_size);
        for p in 0..self.n_patterns {
            let row = &values[p * self.n_states..(p + 1) * self.n_states];
            for _ in 0..self.n_categories {
                buf.extend_from_slice(row);
            }
        }
        self.tips[node] = Tip::None;
        self.partials[node] = [buf.clone(), buf];
        Ok(())
    }

    /// Flip the matrix buffer of `node` so the next writes do not clobber
    /// the stored copy.
    pub fn flip_matrices(&mut self, node: NodeId) {
        self.current_matrices[node] = 1 - self.current_matrices[node];
    }

    /// Live transition matrix of `node` for `category`, row-major.
    pub fn matrix_mut(&mut self, node: NodeId, category: usize) -> &mut [f64] {
        let n2 = self.n_states * self.n_states;
        let buf = &mut self.matrices[node][self.current_matrices[node]];
        &mut buf[category * n2..(category + 1) * n2]
    }

    /// Live transition matrix of `node` for `category`, row-major.
    pub fn matrix(&self, node: NodeId, category: usize) -> &[f64] {
        let n2 = self.n_states * self.n_states;
        let buf = &self.matrices[node][self.current_matrices[node]];
        &buf[category * n2..(category + 1) * n2]
    }

    /// Live partials of `node`, empty for state-coded leaves.
    pub fn partials(&self, node: NodeId) -> &[f64] {
        &self.partials[node][self.current_partials[node]]
    }

    /// Live per-pattern log scale factors of `node`.
    pub fn scale_factors(&self, node: NodeId) -> &[f64] {
        &self.scale_factors[node][self.current_partials[node]]
    }

    /// Recompute the partials of `node` from its children.
    ///
    /// Handles any number of children: each contributes one factor, using
    /// the state variant for resolved leaves (no inner sum) and the partial
    /// variant otherwise.
    pub fn update_partials(&mut self, node: NodeId, children: &[NodeId]) -> Result<()> {
        self.check_node(node)?;
        if children.is_empty() {
            return Err(CyaneaError::InvalidInput(format!(
                "node {} has no children to prune from",
                node
            )));
        }
        for &c in children {
            self.check_node(c)?;
            if c == node {
                return Err(CyaneaError::InvalidInput(format!("node {} lists itself as a child", node)));
            }
        }

        self.current_partials[node] = 1 - self.current_partials[node];
        let idx = self.current_partials[node];
        let mut out = std::mem::take(&mut self.partials[node][idx]);
        let mut scale = std::mem::take(&mut self.scale_factors[node][idx]);
        out.resize(self.partial_size, 0.0);
        scale.resize(self.n_patterns, 0.0);

        let views: Vec<ChildView<'_>> = children
            .iter()
            .map(|&c| {
                let matrices = &self.matrices[c][self.current_matrices[c]][..self.matrix_size];
                match &self.tips[c] {
                    Tip::States(states) => ChildView::States { states, matrices },
                    Tip::None => ChildView::Partials {
                        partials: &self.partials[c][self.current_partials[c]],
                        matrices,
                    },
                }
            })
            .collect();

        let missing = views.iter().zip(children).find(|(v, _)| match v {
            ChildView::Partials { partials, .. } => partials.len() != self.partial_size,
            ChildView::States { .. } => false,
        });
        if let Some((_, &c)) = missing {
            // Put the buffers back before bailing out.
            self.partials[node][idx] = out;
            self.scale_factors[node][idx] = scale;
            self.current_partials[node] = 1 - idx;
            return Err(CyaneaError::invariant(
                "LikelihoodCore",
                format!("child {} of node {} has no partials", c, node),
            ));
        }

        let block = self.n_categories * self.n_states;
        let (n_states, n_categories, scaling) = (self.n_states, self.n_categories, self.scaling);

        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            out.par_chunks_mut(block)
                .zip(scale.par_iter_mut())
                .enumerate()
                .for_each(|(p, (chunk, sf))| {
                    prune_pattern(chunk, p, &views, n_states, n_categories);
                    *sf = rescale(chunk, scaling);
                });
        }
        #[cfg(not(feature = "parallel"))]
        {
            for (p, (chunk, sf)) in out.chunks_mut(block).zip(scale.iter_mut()).enumerate() {
                prune_pattern(chunk, p, &views, n_states, n_categories);
                *sf = rescale(chunk, scaling);
            }
        }

        drop(views);
        self.partials[node][idx] = out;
        self.scale_factors[node][idx] = scale;
        Ok(())
    }

    /// Per-pattern log-likelihoods at `root`, including the scale factors
    /// accumulated at every node listed in `internal`.
    pub fn pattern_log_likelihoods(
        &self,
        root: NodeId,
        internal: &[NodeId],
        proportions: &[f64],
        frequencies: &[f64],
        out: &mut [f64],
    ) {
        let root_partials = self.partials(root);
        let n = self.n_states;
        for (p, lnl) in out.iter_mut().enumerate().take(self.n_patterns) {
            let mut sum = 0.0;
            for (c, &w) in proportions.iter().enumerate() {
                let base = (p * self.n_categories + c) * n;
                let mut site = 0.0;
                for s in 0..n {
                    site += frequencies[s] * root_partials[base + s];
                }
                sum += w * site;
            }
            let log_scale: f64 = internal.iter().map(|&i| self.scale_factors(i)[p]).sum();
            *lnl = sum.ln() + log_scale;
        }
    }

    /// Remember the live buffers before a proposal.
    pub fn store(&mut self) {
        self.stored_partials.copy_from_slice(&self.current_partials);
        self.stored_matrices.copy_from_slice(&self.current_matrices);
    }

    /// Return to the buffers remembered by the last [`LikelihoodCore::store`].
    pub fn restore(&mut self) {
        std::mem::swap(&mut self.current_partials, &mut self.stored_partials);
        std::mem::swap(&mut self.current_matrices, &mut self.stored_matrices);
    }

    /// Discard flips made since the last store without giving up the stored
    /// copy. Used before recomputing twice within one proposal.
    pub fn unstore(&mut self) {
        self.current_partials.copy_from_slice(&self.stored_partials);
        self.current_matrices.copy_from_slice(&self.stored_matrices);
    }
}

/// Fill one pattern's `(category, state)` block as the product of every
/// child's contribution.
fn prune_pattern(
    out: &mut [f64],
    pattern: usize,
    children: &[ChildView<'_>],
    n_states: usize,
    n_categories: usize,
) {
    let n2 = n_states * n_states;
    out.fill(1.0);
    for child in children {
        for c in 0..n_categories {
            let dst = &mut out[c * n_states..(c + 1) * n_states];
            match *child {
                ChildView::States { states, matrices } => {
                    let obs = states[pattern];
                    if obs < n_states {
                        let m = &matrices[c * n2..(c + 1) * n2];
                        for (s, v) in dst.iter_mut().enumerate() {
                            *v *= m[s * n_states + obs];
                        }
                    }
                }
                ChildView::Partials { partials, matrices } => {
                    let m = &matrices[c * n2..(c + 1) * n2];
                    let base = (pattern * n_categories + c) * n_states;
                    let below = &partials[base..base + n_states];
                    for (s, v) in dst.iter_mut().enumerate() {
                        let row = &m[s * n_states..(s + 1) * n_states];
                        let sum: f64 = row.iter().zip(below).map(|(a, b)| a * b).sum();
                        *v *= sum;
                    }
                }
            }
        }
    }
}

/// Rescale one pattern block by its largest entry if the policy asks for
/// it, returning the log of the factor removed.
fn rescale(block: &mut [f64], scaling: Scaling) -> f64 {
    let max = block.iter().copied().fold(0.0, f64::max);
    let scale = match scaling {
        Scaling::Never => false,
        Scaling::Always => true,
        Scaling::Threshold(t) => max < t,
    };
    if scale && max > 0.0 {
        for v in block.iter_mut() {
            *v /= max;
        }
        max.ln()
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Cherry: leaves 0, 1 under root 2, two states, one category.
    fn cherry(t: f64) -> LikelihoodCore {
        let mut core = LikelihoodCore::new(3, 2, 2, 1);
        core.set_leaf_states(0, &[0, 0]).unwrap();
        core.set_leaf_states(1, &[0, 1]).unwrap();
        let e = (-2.0 * t).exp();
        for leaf in [0, 1] {
            core.matrix_mut(leaf, 0)
                .copy_from_slice(&[0.5 + 0.5 * e, 0.5 - 0.5 * e, 0.5 - 0.5 * e, 0.5 + 0.5 * e]);
        }
        core
    }

    #[test]
    fn cherry_partials() {
        let mut core = cherry(1.0);
        core.update_partials(2, &[0, 1]).unwrap();
        let e = (-2.0f64).exp();
        let same = 0.5 + 0.5 * e;
        let diff = 0.5 - 0.5 * e;
        let p = core.partials(2);
        assert!((p[0] - same * same).abs() < 1e-15);
        assert!((p[1] - diff * diff).abs() < 1e-15);
        assert!((p[2] - same * diff).abs() < 1e-15);
        assert!((p[3] - diff * same).abs() < 1e-15);
    }

    #[test]
    fn unknown_state_contributes_one() {
        let mut core = LikelihoodCore::new(3, 1, 2, 1);
        core.set_leaf_states(0, &[2]).unwrap();
        core.set_leaf_partials(1, &[1.0, 1.0]).unwrap();
        core.matrix_mut(0, 0).copy_from_slice(&[0.9, 0.1, 0.1, 0.9]);
        core.matrix_mut(1, 0).copy_from_slice(&[0.9, 0.1, 0.1, 0.9]);
        core.update_partials(2, &[0, 1]).unwrap();
        let mut out = [0.0];
        core.pattern_log_likelihoods(2, &[2], &[1.0], &[0.5, 0.5], &mut out);
        assert!(out[0].abs() < 1e-15);
    }

    #[test]
    fn restore_returns_previous_partials() {
        let mut core = cherry(1.0);
        core.update_partials(2, &[0, 1]).unwrap();
        let before = core.partials(2).to_vec();
        core.store();
        core.flip_matrices(0);
        core.matrix_mut(0, 0).copy_from_slice(&[1.0, 0.0, 0.0, 1.0]);
        core.update_partials(2, &[0, 1]).unwrap();
        assert_ne!(core.partials(2), before.as_slice());
        core.restore();
        assert_eq!(core.partials(2), before.as_slice());
        assert!((core.matrix(0, 0)[0] - (0.5 + 0.5 * (-2.0f64).exp())).abs() < 1e-15);
    }

    #[test]
    fn unstore_discards_flips() {
        let mut core = cherry(0.5);
        core.update_partials(2, &[0, 1]).unwrap();
        core.store();
        let live = core.partials(2).to_vec();
        core.update_partials(2, &[0, 1]).unwrap();
        core.unstore();
        assert_eq!(core.partials(2), live.as_slice());
    }

    #[test]
    fn scaling_is_recorded_in_log_space() {
        let mut core = cherry(1.0);
        core.set_scaling(Scaling::Always);
        core.update_partials(2, &[0, 1]).unwrap();
        let max = core.partials(2)[..2].iter().copied().fold(0.0, f64::max);
        assert!((max - 1.0).abs() < 1e-15);
        let mut scaled = [0.0; 2];
        core.pattern_log_likelihoods(2, &[2], &[1.0], &[0.5, 0.5], &mut scaled);

        let mut plain_core = cherry(1.0);
        plain_core.set_scaling(Scaling::Never);
        plain_core.update_partials(2, &[0, 1]).unwrap();
        let mut plain = [0.0; 2];
        plain_core.pattern_log_likelihoods(2, &[2], &[1.0], &[0.5, 0.5], &mut plain);
        for p in 0..2 {
            assert!((scaled[p] - plain[p]).abs() < 1e-12);
        }
    }

    #[test]
    fn missing_child_partials_is_an_invariant_error() {
        let mut core = LikelihoodCore::new(3, 1, 2, 1);
        core.set_leaf_states(0, &[0]).unwrap();
        let err = core.update_partials(2, &[0, 1]).unwrap_err();
        assert!(err.is_invariant());
    }

    #[test]
    fn bad_leaf_data_rejected() {
        let mut core = LikelihoodCore::new(3, 2, 2, 1);
        assert!(core.set_leaf_states(0, &[0]).is_err());
        assert!(core.set_leaf_states(0, &[0, 3]).is_err());
        assert!(core.set_leaf_partials(0, &[1.0]).is_err());
        assert!(core.set_leaf_states(7, &[0, 0]).is_err());
    }
}
