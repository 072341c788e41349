//! Incremental tree likelihood.
//!
//! [`TreeLikelihood`] walks a [`TimeTree`] in postorder and asks the
//! [`LikelihoodCore`] to recompute only what a proposal invalidated: a
//! branch's matrices when its length (time x clock rate) or the model
//! changed, and a node's partials when one of its children was updated or
//! its own topology changed.

use cyanea_core::{CyaneaError, Result};
use tracing::warn;

use crate::likelihood::{LikelihoodCore, Scaling};
use crate::patterns::{LeafData, PatternSet};
use crate::site_model::SiteModel;
use crate::subst_model::{validate_matrix, SubstitutionModel};
use crate::tree::{Dirt, NodeId, TimeTree};

/// Cached Felsenstein likelihood of a pattern set on a mutable tree.
pub struct TreeLikelihood {
    core: LikelihoodCore,
    model: Box<dyn SubstitutionModel>,
    site_model: SiteModel,
    weights: Vec<f64>,
    branch_lengths: Vec<f64>,
    stored_branch_lengths: Vec<f64>,
    pattern_log_likelihoods: Vec<f64>,
    internal: Vec<NodeId>,
    update_all: bool,
    dynamic_scaling: bool,
    log_likelihood: f64,
    stored_log_likelihood: f64,
}

impl TreeLikelihood {
    /// Wire observations to the leaves of `tree` by taxon name (or by leaf
    /// order when the tree's leaves are unnamed).
    ///
    /// # Errors
    ///
    /// `Config` if state counts disagree, a taxon is missing from the tree,
    /// or the tree has fewer than two leaves.
    pub fn new(
        tree: &TimeTree,
        patterns: &PatternSet,
        model: Box<dyn SubstitutionModel>,
        site_model: SiteModel,
    ) -> Result<Self> {
        let n_states = patterns.n_states();
        if model.n_states() != n_states {
            return Err(CyaneaError::config(
                "TreeLikelihood",
                format!(
                    "model {} has {} states but data has {}",
                    model.name(),
                    model.n_states(),
                    n_states
                ),
            ));
        }
        if tree.leaf_count() < 2 {
            return Err(CyaneaError::config("TreeLikelihood", "need at least two taxa"));
        }
        if patterns.taxon_count() != tree.leaf_count() {
            return Err(CyaneaError::config(
                "TreeLikelihood",
                format!(
                    "{} taxa in data but {} leaves in tree '{}'",
                    patterns.taxon_count(),
                    tree.leaf_count(),
                    tree.id()
                ),
            ));
        }

        let mut core = LikelihoodCore::new(
            tree.node_count(),
            patterns.pattern_count(),
            n_states,
            site_model.category_count(),
        );
        let named = tree.leaf_names().len() == tree.leaf_count();
        for leaf in tree.leaves() {
            let row = if named {
                let name = tree.get_node(leaf).and_then(|n| n.name.as_deref()).unwrap_or("");
                patterns.taxon_index(name).ok_or_else(|| {
                    CyaneaError::config(
                        "TreeLikelihood",
                        format!("taxon '{}' has no observations", name),
                    )
                })?
            } else {
                leaf
            };
            match patterns.leaf(row) {
                LeafData::States(states) => core.set_leaf_states(leaf, states)?,
                LeafData::Partials(values) => core.set_leaf_partials(leaf, values)?,
            }
        }

        let n_nodes = tree.node_count();
        Ok(Self {
            core,
            model,
            site_model,
            weights: patterns.weights().to_vec(),
            branch_lengths: vec![f64::NAN; n_nodes],
            stored_branch_lengths: vec![f64::NAN; n_nodes],
            pattern_log_likelihoods: vec![0.0; patterns.pattern_count()],
            internal: tree.internal_nodes(),
            update_all: true,
            dynamic_scaling: true,
            log_likelihood: f64::NAN,
            stored_log_likelihood: f64::NAN,
        })
    }

    /// Use a fixed rescaling policy.
    pub fn with_scaling(mut self, scaling: Scaling) -> Self {
        self.core.set_scaling(scaling);
        self.update_all = true;
        self
    }

    /// Switch scaling on automatically when the likelihood underflows to
    /// −∞ without it. On by default.
    pub fn with_dynamic_scaling(mut self, enabled: bool) -> Self {
        self.dynamic_scaling = enabled;
        self
    }

    pub fn scaling(&self) -> Scaling {
        self.core.scaling()
    }

    pub fn model(&self) -> &dyn SubstitutionModel {
        self.model.as_ref()
    }

    /// Forward new free parameters to the substitution model; every
    /// branch's matrices are recomputed on the next call.
    pub fn set_model_parameters(&mut self, values: &[f64]) -> Result<()> {
        self.model.set_parameters(values)?;
        self.update_all = true;
        Ok(())
    }

    /// Recompute everything on the next call.
    pub fn force_full_update(&mut self) {
        self.update_all = true;
    }

    /// Last computed total log-likelihood.
    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    /// Last computed per-pattern log-likelihoods (unweighted).
    pub fn pattern_log_likelihoods(&self) -> &[f64] {
        &self.pattern_log_likelihoods
    }

    /// Compute the log-likelihood of `tree` with branch times multiplied by
    /// `clock_rate`, reusing every cache the tree's dirt flags allow.
    ///
    /// # Errors
    ///
    /// `Config` if the model produces an invalid transition matrix.
    pub fn calculate(&mut self, tree: &TimeTree, clock_rate: f64) -> Result<f64> {
        if tree.node_count() != self.branch_lengths.len() {
            return Err(CyaneaError::invariant(
                "TreeLikelihood",
                format!(
                    "tree '{}' has {} nodes, buffers hold {}",
                    tree.id(),
                    tree.node_count(),
                    self.branch_lengths.len()
                ),
            ));
        }
        self.traverse(tree, clock_rate)?;
        let mut lnl = self.integrate(tree);

        if lnl == f64::NEG_INFINITY && self.dynamic_scaling && self.core.scaling() == Scaling::Never {
            warn!(tree = tree.id(), "likelihood underflow, switching rescaling on");
            self.core.set_scaling(Scaling::Always);
            self.core.unstore();
            self.update_all = true;
            self.traverse(tree, clock_rate)?;
            lnl = self.integrate(tree);
        }
        self.log_likelihood = lnl;
        Ok(lnl)
    }

    fn traverse(&mut self, tree: &TimeTree, clock_rate: f64) -> Result<()> {
        let n_cat = self.site_model.category_count();
        let mut updated = vec![false; tree.node_count()];
        for node in tree.iter_postorder() {
            let mut update = self.update_all || tree.dirt(node) != Dirt::Clean;

            if !tree.is_root(node) {
                let length = tree.branch_length(node) * clock_rate;
                if update || length != self.branch_lengths[node] {
                    self.branch_lengths[node] = length;
                    self.core.flip_matrices(node);
                    for c in 0..n_cat {
                        let rate = self.site_model.rates()[c];
                        let m = self.core.matrix_mut(node, c);
                        self.model.transition_probabilities(length, rate, m);
                        validate_matrix(self.model.name(), m)?;
                    }
                    update = true;
                }
            }

            if !tree.is_leaf(node) {
                let children = tree.children(node);
                if update || children.iter().any(|&c| updated[c]) {
                    self.core.update_partials(node, children)?;
                    update = true;
                }
            }
            updated[node] = update;
        }
        self.update_all = false;
        Ok(())
    }

    fn integrate(&mut self, tree: &TimeTree) -> f64 {
        self.core.pattern_log_likelihoods(
            tree.root(),
            &self.internal,
            self.site_model.proportions(),
            self.model.frequencies(),
            &mut self.pattern_log_likelihoods,
        );
        let mut total = 0.0;
        for (&w, &l) in self.weights.iter().zip(&self.pattern_log_likelihoods) {
            if w > 0.0 {
                total += w * l;
            }
        }
        total
    }

    /// Remember the caches before a proposal is evaluated.
    pub fn store(&mut self) {
        self.core.store();
        self.stored_branch_lengths.copy_from_slice(&self.branch_lengths);
        self.stored_log_likelihood = self.log_likelihood;
    }

    /// Return to the caches remembered by the last store.
    pub fn restore(&mut self) {
        self.core.restore();
        std::mem::swap(&mut self.branch_lengths, &mut self.stored_branch_lengths);
        self.log_likelihood = self.stored_log_likelihood;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::nucleotide_state;
    use crate::subst_model::{Hky, JukesCantor};
    use cyanea_core::Versioned;

    fn binary_patterns(rows: &[(&str, Vec<usize>)], weights: Vec<f64>) -> PatternSet {
        PatternSet::new(
            2,
            rows.iter().map(|(n, _)| n.to_string()).collect(),
            rows.iter().map(|(_, s)| LeafData::States(s.clone())).collect(),
            weights,
        )
        .unwrap()
    }

    #[test]
    fn two_leaf_closed_form() {
        let tree = TimeTree::from_newick("t", "(A:1.0,B:1.0);").unwrap();
        let data = binary_patterns(&[("A", vec![0]), ("B", vec![0])], vec![1.0]);
        let mut lik = TreeLikelihood::new(
            &tree,
            &data,
            Box::new(JukesCantor::new(2).unwrap()),
            SiteModel::single(),
        )
        .unwrap();
        let lnl = lik.calculate(&tree, 1.0).unwrap();

        let e = (-2.0f64).exp();
        let same = 0.5 + 0.5 * e;
        let diff = 0.5 - 0.5 * e;
        let expected = (0.5 * same * same + 0.5 * diff * diff).ln();
        assert!((lnl - expected).abs() < 1e-10, "{} vs {}", lnl, expected);
    }

    fn p_matrix(model: &dyn SubstitutionModel, t: f64) -> Vec<f64> {
        let mut m = vec![0.0; 16];
        model.transition_probabilities(t, 1.0, &mut m);
        m
    }

    #[test]
    fn three_leaf_matches_brute_force() {
        // Heights: AB at 0.3 (A tip 0.1 above present), root at 0.7.
        let tree = TimeTree::from_newick("t", "((A:0.2,B:0.3):0.4,C:0.7);").unwrap();
        let freqs = [0.1, 0.2, 0.3, 0.4];
        let hky = Hky::new(3.0, freqs).unwrap();
        let seqs: [&[u8]; 3] = [b"ACGTAAGT", b"ACGAACTT", b"TCGTCAGG"];
        let data = PatternSet::from_sequences(4, &["A", "B", "C"], &seqs, nucleotide_state).unwrap();
        let mut lik = TreeLikelihood::new(
            &tree,
            &data,
            Box::new(hky.clone()),
            SiteModel::single(),
        )
        .unwrap();
        lik.calculate(&tree, 1.0).unwrap();

        let a = tree.leaf_index("A").unwrap();
        let b = tree.leaf_index("B").unwrap();
        let c = tree.leaf_index("C").unwrap();
        let ab = tree.parent(a).unwrap();
        let pa = p_matrix(&hky, tree.branch_length(a));
        let pb = p_matrix(&hky, tree.branch_length(b));
        let pc = p_matrix(&hky, tree.branch_length(c));
        let pab = p_matrix(&hky, tree.branch_length(ab));

        for p in 0..data.pattern_count() {
            let obs = |taxon: usize| match data.leaf(taxon) {
                LeafData::States(s) => s[p],
                LeafData::Partials(_) => unreachable!(),
            };
            let (xa, xb, xc) = (obs(0), obs(1), obs(2));
            let mut site = 0.0;
            for r in 0..4 {
                for x in 0..4 {
                    site += freqs[r]
                        * pab[r * 4 + x]
                        * pa[x * 4 + xa]
                        * pb[x * 4 + xb]
                        * pc[r * 4 + xc];
                }
            }
            let got = lik.pattern_log_likelihoods()[p];
            assert!(
                (got - site.ln()).abs() < 1e-10,
                "pattern {}: {} vs {}",
                p,
                got,
                site.ln()
            );
        }
    }

    fn caterpillar(depth: usize) -> String {
        // Branch lengths cycle through [1e-4, 1.0].
        let lengths = [1e-4, 0.37, 1.0, 0.05, 0.8, 0.002];
        let mut s = format!("(t0:{},t1:{})", lengths[0], lengths[1]);
        for i in 2..=depth {
            s = format!(
                "({}:{},t{}:{})",
                s,
                lengths[i % lengths.len()],
                i,
                lengths[(i + 3) % lengths.len()]
            );
        }
        s.push(';');
        s
    }

    #[test]
    fn scaling_does_not_change_result() {
        let newick = caterpillar(20);
        let tree = TimeTree::from_newick("t", &newick).unwrap();
        let n = tree.leaf_count();
        let names: Vec<String> = (0..n).map(|i| format!("t{}", i)).collect();
        let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let rows: Vec<Vec<u8>> = (0..n)
            .map(|i| (0..40).map(|s| b"ACGT"[(i * 7 + s * 3 + i * s) % 4]).collect())
            .collect();
        let row_refs: Vec<&[u8]> = rows.iter().map(|r| r.as_slice()).collect();
        let data = PatternSet::from_sequences(4, &name_refs, &row_refs, nucleotide_state).unwrap();

        let mut results = Vec::new();
        for scaling in [Scaling::Never, Scaling::Always, Scaling::Threshold(1e-3)] {
            let mut lik = TreeLikelihood::new(
                &tree,
                &data,
                Box::new(JukesCantor::nucleotide()),
                SiteModel::gamma(0.5, 4).unwrap(),
            )
            .unwrap()
            .with_scaling(scaling)
            .with_dynamic_scaling(false);
            results.push(lik.calculate(&tree, 1.0).unwrap());
        }
        assert!(results[0].is_finite());
        assert!((results[0] - results[1]).abs() < 1e-6, "{:?}", results);
        assert!((results[0] - results[2]).abs() < 1e-6, "{:?}", results);
    }

    #[test]
    fn incremental_matches_full_recompute() {
        let mut tree =
            TimeTree::from_newick("t", "(((A:0.1,B:0.1):0.2,C:0.3):0.2,(D:0.25,E:0.25):0.25);").unwrap();
        let seqs: [&[u8]; 5] = [b"ACGTTA", b"ACGTTG", b"ACCTTA", b"GCCATA", b"GCCAAA"];
        let data =
            PatternSet::from_sequences(4, &["A", "B", "C", "D", "E"], &seqs, nucleotide_state).unwrap();
        let mut lik = TreeLikelihood::new(
            &tree,
            &data,
            Box::new(JukesCantor::nucleotide()),
            SiteModel::single(),
        )
        .unwrap();
        lik.calculate(&tree, 1.0).unwrap();
        tree.commit();

        lik.store();
        let ab = tree.parent(0).unwrap();
        tree.set_height(ab, 0.15).unwrap();
        let incremental = lik.calculate(&tree, 1.0).unwrap();

        let mut fresh = TreeLikelihood::new(
            &tree,
            &data,
            Box::new(JukesCantor::nucleotide()),
            SiteModel::single(),
        )
        .unwrap();
        let full = fresh.calculate(&tree, 1.0).unwrap();
        assert!((incremental - full).abs() < 1e-12);
    }

    #[test]
    fn restore_after_rejected_topology_change() {
        let mut tree =
            TimeTree::from_newick("t", "((A:0.1,B:0.1):0.2,(C:0.2,D:0.2):0.1);").unwrap();
        let seqs: [&[u8]; 4] = [b"AACCG", b"AACCT", b"GGTTA", b"GGTCA"];
        let data = PatternSet::from_sequences(4, &["A", "B", "C", "D"], &seqs, nucleotide_state).unwrap();
        let mut lik = TreeLikelihood::new(
            &tree,
            &data,
            Box::new(JukesCantor::nucleotide()),
            SiteModel::single(),
        )
        .unwrap();
        let original = lik.calculate(&tree, 1.0).unwrap();
        tree.commit();

        lik.store();
        tree.exchange(0, 2).unwrap();
        let proposed = lik.calculate(&tree, 1.0).unwrap();
        assert!(proposed < original);

        tree.rollback();
        lik.restore();
        assert_eq!(lik.log_likelihood(), original);
        // Clean tree, nothing to recompute: the restored caches are reused.
        let again = lik.calculate(&tree, 1.0).unwrap();
        assert!((again - original).abs() < 1e-12);
    }

    #[test]
    fn clock_rate_change_updates_matrices() {
        let tree = TimeTree::from_newick("t", "(A:1.0,B:1.0);").unwrap();
        let data = binary_patterns(&[("A", vec![0, 0]), ("B", vec![0, 1])], vec![3.0, 1.0]);
        let mut lik = TreeLikelihood::new(
            &tree,
            &data,
            Box::new(JukesCantor::new(2).unwrap()),
            SiteModel::single(),
        )
        .unwrap();
        let slow = lik.calculate(&tree, 0.5).unwrap();
        let mut fresh = TreeLikelihood::new(
            &tree,
            &data,
            Box::new(JukesCantor::new(2).unwrap()),
            SiteModel::single(),
        )
        .unwrap();
        let expected = fresh.calculate(&tree, 0.5).unwrap();
        let fast = lik.calculate(&tree, 2.0).unwrap();
        assert!((slow - expected).abs() < 1e-12);
        assert!((fast - slow).abs() > 1e-6);
    }

    #[test]
    fn dynamic_scaling_rescues_underflow() {
        // 600 leaves on long branches: the root partials fall below the
        // smallest subnormal without rescaling.
        let mut s = String::from("(t0:20,t1:20)");
        for i in 2..600 {
            s = format!("({}:20,t{}:20)", s, i);
        }
        s.push(';');
        let tree = TimeTree::from_newick("t", &s).unwrap();
        let n = tree.leaf_count();
        let names: Vec<String> = (0..n).map(|i| format!("t{}", i)).collect();
        let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let rows: Vec<Vec<u8>> = (0..n).map(|i| vec![b"ACGT"[i % 4]]).collect();
        let row_refs: Vec<&[u8]> = rows.iter().map(|r| r.as_slice()).collect();
        let data = PatternSet::from_sequences(4, &name_refs, &row_refs, nucleotide_state).unwrap();
        let mut lik = TreeLikelihood::new(
            &tree,
            &data,
            Box::new(JukesCantor::nucleotide()),
            SiteModel::single(),
        )
        .unwrap()
        .with_scaling(Scaling::Never);
        let lnl = lik.calculate(&tree, 1.0).unwrap();
        assert!(lnl.is_finite());
        assert_eq!(lik.scaling(), Scaling::Always);
        // Saturated branches: every tip is an independent draw from 1/4.
        assert!((lnl - n as f64 * 0.25f64.ln()).abs() < 1e-3);
    }

    #[test]
    fn mismatched_model_is_config_error() {
        let tree = TimeTree::from_newick("t", "(A:1.0,B:1.0);").unwrap();
        let data = binary_patterns(&[("A", vec![0]), ("B", vec![0])], vec![1.0]);
        let err = TreeLikelihood::new(
            &tree,
            &data,
            Box::new(JukesCantor::nucleotide()),
            SiteModel::single(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, CyaneaError::Config { .. }));
    }
}
